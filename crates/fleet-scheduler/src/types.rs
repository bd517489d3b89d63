use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A persisted recurring trigger bound to an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    /// Seconds-first cron expression, as entered.
    pub cron_expr: String,
    /// Name of the executor in the registry.
    pub executor: String,
    /// Opaque to the scheduler; decoded by the executor's task.
    pub params: String,
    pub enabled: bool,
    /// Outcome of the most recent run, `None` until the first one finishes.
    pub status: Option<RecordStatus>,
    /// Computed on read, never stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Caller-supplied fields for creating or replacing a schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSchedule {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub cron_expr: String,
    pub executor: String,
    #[serde(default)]
    pub params: String,
    #[serde(default)]
    pub enabled: bool,
}

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Running,
    Success,
    Error,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Running => "running",
            RecordStatus::Success => "success",
            RecordStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(RecordStatus::Running),
            "success" => Ok(RecordStatus::Success),
            "error" => Ok(RecordStatus::Error),
            other => Err(format!("unknown record status: {other}")),
        }
    }
}

/// Audit row for one execution of a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub title: String,
    pub executor: String,
    /// Parameters as they were when the run started.
    pub params: String,
    pub status: RecordStatus,
    /// Diagnostic text of a failed or panicked run.
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Public face of a registered executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorDescriptor {
    pub name: String,
    pub display_name: String,
}

impl ExecutorDescriptor {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleFilter {
    pub enabled: Option<bool>,
    pub executor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    pub schedule_id: Option<Uuid>,
    pub status: Option<RecordStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_status_round_trips_through_text() {
        for status in [RecordStatus::Running, RecordStatus::Success, RecordStatus::Error] {
            assert_eq!(status.as_str().parse::<RecordStatus>().unwrap(), status);
        }
        assert!("finished".parse::<RecordStatus>().is_err());
    }

    #[test]
    fn new_schedule_defaults_to_disabled() {
        let input: NewSchedule = serde_json::from_str(
            r#"{"title":"t","cron_expr":"* * * * * *","executor":"test"}"#,
        )
        .unwrap();
        assert!(!input.enabled);
        assert!(input.params.is_empty());
    }
}
