use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::config::HealthConfig;
use fleet_scheduler::{ExecutorDescriptor, ExecutorRegistry, Task, TaskError, TaskParams};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{HealthError, Result};

pub const HEALTH_EXECUTOR: &str = "health";

const USER_AGENT: &str = concat!("fleet-health/", env!("CARGO_PKG_VERSION"));

/// What to check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Probe {
    /// GET `url`. Healthy on `expect_status`, or any 2xx when unset.
    Http {
        url: String,
        #[serde(default)]
        expect_status: Option<u16>,
    },
    /// Healthy if a TCP connection can be opened.
    Tcp { host: String, port: u16 },
}

impl Probe {
    pub fn target(&self) -> String {
        match self {
            Probe::Http { url, .. } => url.clone(),
            Probe::Tcp { host, port } => format!("{host}:{port}"),
        }
    }
}

/// Runs probes with a shared HTTP client and one timeout for everything.
pub struct HealthProber {
    client: reqwest::Client,
    timeout: Duration,
}

impl HealthProber {
    pub fn new(config: &HealthConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { client, timeout })
    }

    pub async fn check(&self, probe: &Probe) -> Result<()> {
        let target = probe.target();
        match tokio::time::timeout(self.timeout, self.check_inner(probe)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(HealthError::Timeout {
                target,
                secs: self.timeout.as_secs(),
            }),
        }
    }

    async fn check_inner(&self, probe: &Probe) -> Result<()> {
        match probe {
            Probe::Http { url, expect_status } => {
                let status = self.client.get(url).send().await?.status();
                let healthy = match expect_status {
                    Some(code) => status.as_u16() == *code,
                    None => status.is_success(),
                };
                if !healthy {
                    return Err(HealthError::Unhealthy {
                        target: url.clone(),
                        reason: format!("unexpected status {status}"),
                    });
                }
                debug!(%url, %status, "http probe ok");
            }
            Probe::Tcp { host, port } => {
                TcpStream::connect((host.as_str(), *port)).await?;
                debug!(%host, port, "tcp probe ok");
            }
        }
        Ok(())
    }
}

/// Scheduler task wrapping one [`Probe`].
pub struct HealthTask {
    prober: Arc<HealthProber>,
    probe: Option<Probe>,
}

impl HealthTask {
    pub fn new(prober: Arc<HealthProber>) -> Self {
        Self {
            prober,
            probe: None,
        }
    }
}

#[async_trait]
impl Task for HealthTask {
    fn set_params(&mut self, params: &TaskParams) -> std::result::Result<(), TaskError> {
        self.probe = Some(params.decode()?);
        Ok(())
    }

    async fn run(&mut self) -> std::result::Result<(), TaskError> {
        let probe = self
            .probe
            .as_ref()
            .ok_or_else(|| TaskError::InvalidParams("parameters were not set".to_string()))?;
        self.prober
            .check(probe)
            .await
            .map_err(|e| TaskError::Failed(e.to_string()))?;
        info!(target = %probe.target(), "health probe passed");
        Ok(())
    }
}

/// Register the `health` executor.
pub fn register(registry: &ExecutorRegistry, config: &HealthConfig) -> Result<()> {
    let prober = Arc::new(HealthProber::new(config)?);
    registry.register(ExecutorDescriptor::new(HEALTH_EXECUTOR, "Health probe"), move || {
        Box::new(HealthTask::new(Arc::clone(&prober))) as Box<dyn Task>
    })?;
    Ok(())
}
