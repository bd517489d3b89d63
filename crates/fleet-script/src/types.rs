//! Shared data types for fleet-script.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Captured output, keyed by host target (`user@address:port`).
pub type HostLog = BTreeMap<String, Vec<String>>;

/// Per-host failure text, keyed like [`HostLog`].
pub type HostErrors = BTreeMap<String, String>;

/// Interpreter a script body is fed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptKind {
    #[default]
    Shell,
    Python,
}

impl ScriptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptKind::Shell => "shell",
            ScriptKind::Python => "python",
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScriptKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "shell" => Ok(ScriptKind::Shell),
            "python" => Ok(ScriptKind::Python),
            other => Err(format!("unknown script kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub content: String,
    pub kind: ScriptKind,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewScript {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub content: String,
    #[serde(default)]
    pub kind: ScriptKind,
}

/// A machine reachable over SSH.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: Uuid,
    pub title: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    /// Never serialized back out.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    pub identity_file: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Host {
    /// Identity of the remote endpoint, used as the connection cache key.
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.username, self.address, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewHost {
    pub title: String,
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub identity_file: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

/// Parameters of a script run, also the `script` executor's schedule params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunScriptParams {
    pub script_id: Uuid,
    pub host_ids: Vec<Uuid>,
    /// Free-form arguments handed to the script.
    #[serde(default)]
    pub params: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptRunStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ScriptRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptRunStatus::Running => "running",
            ScriptRunStatus::Success => "success",
            ScriptRunStatus::Failed => "failed",
            ScriptRunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScriptRunStatus::Running)
    }
}

impl fmt::Display for ScriptRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScriptRunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(ScriptRunStatus::Running),
            "success" => Ok(ScriptRunStatus::Success),
            "failed" => Ok(ScriptRunStatus::Failed),
            "cancelled" => Ok(ScriptRunStatus::Cancelled),
            other => Err(format!("unknown script run status: {other}")),
        }
    }
}

/// Host fields copied into a run record. Credentials are left out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub id: Uuid,
    pub title: String,
    pub target: String,
}

impl From<&Host> for HostSnapshot {
    fn from(h: &Host) -> Self {
        Self {
            id: h.id,
            title: h.title.clone(),
            target: h.target(),
        }
    }
}

/// One script run across a set of hosts.
///
/// Always persisted as a whole row; see `ScriptRecordStore::save`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptRecord {
    pub id: Uuid,
    pub script_title: String,
    /// Script body as it was when the run started.
    pub script: String,
    /// JSON array of [`HostSnapshot`]. Blank in paged listings.
    pub hosts: String,
    pub params: String,
    /// JSON [`HostLog`].
    pub result: String,
    pub status: ScriptRunStatus,
    pub message: String,
    /// JSON [`HostErrors`], or a plain message when the run never started.
    pub error: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptRecordFilter {
    pub status: Option<ScriptRunStatus>,
    pub script_title: Option<String>,
}
