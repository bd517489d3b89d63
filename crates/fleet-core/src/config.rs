use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LOG_FILTER: &str = "fleet=info";
pub const DEFAULT_CONNECTION_TTL_SECS: u64 = 300;
pub const DEFAULT_SNAPSHOT_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

/// Top-level config (fleet.toml + FLEET_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub script: ScriptConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Register the built-in `test` executor at startup.
    #[serde(default = "bool_true")]
    pub register_test_executors: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            register_test_executors: true,
        }
    }
}

/// Remote script execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    /// Idle lifetime of a cached remote connection. Every reuse restarts it.
    #[serde(default = "default_connection_ttl_secs")]
    pub connection_ttl_secs: u64,
    /// How often in-flight output is copied into the execution record.
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Directory holding OpenSSH control sockets.
    #[serde(default = "default_control_dir")]
    pub control_dir: String,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            connection_ttl_secs: DEFAULT_CONNECTION_TTL_SECS,
            snapshot_interval_ms: DEFAULT_SNAPSHOT_INTERVAL_MS,
            ssh_binary: default_ssh_binary(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            control_dir: default_control_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}
fn default_connection_ttl_secs() -> u64 {
    DEFAULT_CONNECTION_TTL_SECS
}
fn default_snapshot_interval_ms() -> u64 {
    DEFAULT_SNAPSHOT_INTERVAL_MS
}
fn default_ssh_binary() -> String {
    "ssh".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}
fn default_probe_timeout_secs() -> u64 {
    DEFAULT_PROBE_TIMEOUT_SECS
}
fn default_db_path() -> String {
    format!("{}/fleet.db", fleet_home())
}
fn default_control_dir() -> String {
    format!("{}/ssh", fleet_home())
}

fn fleet_home() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.fleet", home)
}

impl FleetConfig {
    /// Load config from a TOML file with FLEET_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. `FLEET_CONFIG`
    ///   3. ~/.fleet/fleet.toml
    ///
    /// A missing file is not an error; every field has a default. Nested keys
    /// in the environment use a double underscore:
    /// `FLEET_SCRIPT__CONNECTION_TTL_SECS=60`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("FLEET_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::FleetError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("FLEET_").ignore(&["CONFIG"]).split("__"))
    }
}

fn default_config_path() -> String {
    format!("{}/fleet.toml", fleet_home())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = FleetConfig::load(Some("/nonexistent/fleet-test.toml")).unwrap();
        assert!(cfg.scheduler.register_test_executors);
        assert_eq!(cfg.script.connection_ttl_secs, DEFAULT_CONNECTION_TTL_SECS);
        assert_eq!(cfg.health.timeout_secs, DEFAULT_PROBE_TIMEOUT_SECS);
        assert!(cfg.database.path.ends_with("fleet.db"));
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("fleet-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "[database]\npath = \"/tmp/x.db\"\n\n[script]\nsnapshot_interval_ms = 250\n",
        )
        .unwrap();

        let cfg = FleetConfig::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(cfg.database.path, "/tmp/x.db");
        assert_eq!(cfg.script.snapshot_interval_ms, 250);
        assert_eq!(cfg.script.ssh_binary, "ssh");
        assert_eq!(cfg.log.filter, DEFAULT_LOG_FILTER);
    }
}
