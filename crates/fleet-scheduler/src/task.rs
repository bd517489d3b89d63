use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::error::Result;
use crate::registry::ExecutorRegistry;
use crate::types::ExecutorDescriptor;

/// One unit of work. A fresh instance is built for every run, configured once
/// with [`Task::set_params`] and then driven with [`Task::run`].
#[async_trait]
pub trait Task: Send {
    fn set_params(&mut self, params: &TaskParams) -> std::result::Result<(), TaskError>;

    async fn run(&mut self) -> std::result::Result<(), TaskError>;
}

/// Builds a new, unconfigured task.
pub type TaskFactory = Arc<dyn Fn() -> Box<dyn Task> + Send + Sync>;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Failed(String),

    #[error("cancelled")]
    Cancelled,
}

/// Serialized task parameters, exactly as stored on the schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskParams(String);

impl TaskParams {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Decode the parameters as JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<T, TaskError> {
        if self.is_empty() {
            return Err(TaskError::InvalidParams("parameters are empty".to_string()));
        }
        serde_json::from_str(&self.0).map_err(|e| TaskError::InvalidParams(e.to_string()))
    }
}

impl From<&str> for TaskParams {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

pub const TEST_EXECUTOR: &str = "test";

#[derive(Debug, Clone, Default, Deserialize)]
struct TestParams {
    #[serde(default)]
    message: String,
    #[serde(default)]
    sleep_ms: u64,
    #[serde(default)]
    fail: bool,
}

/// Diagnostic task for exercising the scheduler end to end.
///
/// Params: `{"message": "...", "sleep_ms": 0, "fail": false}`. Empty params are
/// accepted at configuration time and make `run` panic, which is how fault
/// recovery in the job wrapper gets exercised.
#[derive(Debug, Default)]
pub struct TestTask {
    params: Option<TestParams>,
}

#[async_trait]
impl Task for TestTask {
    fn set_params(&mut self, params: &TaskParams) -> std::result::Result<(), TaskError> {
        self.params = if params.is_empty() {
            None
        } else {
            Some(params.decode()?)
        };
        Ok(())
    }

    async fn run(&mut self) -> std::result::Result<(), TaskError> {
        let Some(params) = &self.params else {
            panic!("test task started without parameters");
        };
        if params.sleep_ms > 0 {
            tokio::time::sleep(Duration::from_millis(params.sleep_ms)).await;
        }
        if params.fail {
            return Err(TaskError::Failed(params.message.clone()));
        }
        info!(message = %params.message, "test task ran");
        Ok(())
    }
}

pub fn register_test_executors(registry: &ExecutorRegistry) -> Result<()> {
    registry.register(ExecutorDescriptor::new(TEST_EXECUTOR, "Test"), || {
        Box::new(TestTask::default()) as Box<dyn Task>
    })
}
