use std::sync::Arc;

use fleet_bus::bus::panic_message;
use fleet_bus::NamedLocks;
use futures_util::FutureExt;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::engine::TriggerFn;
use crate::store::{RecordStore, ScheduleStore};
use crate::task::{TaskFactory, TaskParams};
use crate::types::{RecordStatus, Schedule};

/// What happened to one trigger of a [`JobWrapper`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// The previous run still holds the lock; nothing was recorded.
    Dropped,
    /// The running record could not be written, so the task never started.
    Aborted { reason: String },
    /// The task ran and its record was finalized.
    Completed { record_id: Uuid, status: RecordStatus },
}

/// Runs one schedule's task under its named lock, with an audit record and
/// panic recovery around it.
///
/// Overlapping triggers for the same schedule are dropped, not queued.
pub struct JobWrapper {
    schedule: Schedule,
    params: TaskParams,
    factory: TaskFactory,
    locks: Arc<NamedLocks>,
    schedules: ScheduleStore,
    records: RecordStore,
}

impl JobWrapper {
    pub fn new(
        schedule: Schedule,
        factory: TaskFactory,
        locks: Arc<NamedLocks>,
        schedules: ScheduleStore,
        records: RecordStore,
    ) -> Self {
        let params = TaskParams::new(schedule.params.clone());
        Self {
            schedule,
            params,
            factory,
            locks,
            schedules,
            records,
        }
    }

    /// Lock key shared by every wrapper built for `schedule_id`.
    pub fn lock_key(schedule_id: Uuid) -> String {
        format!("schedule:{schedule_id}")
    }

    #[instrument(skip(self), fields(schedule_id = %self.schedule.id, executor = %self.schedule.executor))]
    pub async fn invoke(&self) -> Invocation {
        let key = Self::lock_key(self.schedule.id);
        let _guard = match self.locks.try_guard(&key) {
            Ok(guard) => guard,
            Err(_) => {
                let held_ms = self
                    .locks
                    .held_for(&key)
                    .map_or(0, |d| d.as_millis() as u64);
                debug!(held_ms, "previous run still active, trigger dropped");
                return Invocation::Dropped;
            }
        };

        let record = match self.records.insert_running(&self.schedule) {
            Ok(r) => r,
            Err(e) => {
                error!("failed to write running record: {e}");
                return Invocation::Aborted {
                    reason: e.to_string(),
                };
            }
        };

        // Fresh task per run, on its own Tokio task; a panic comes back as a JoinError.
        let factory = Arc::clone(&self.factory);
        let params = self.params.clone();
        let outcome = tokio::spawn(async move {
            let mut task = factory();
            task.set_params(&params)?;
            task.run().await
        })
        .await;

        let (status, reason) = match outcome {
            Ok(Ok(())) => (RecordStatus::Success, None),
            Ok(Err(e)) => (RecordStatus::Error, Some(e.to_string())),
            Err(e) if e.is_panic() => {
                let reason = format!("task panicked: {}", panic_message(e.into_panic().as_ref()));
                (RecordStatus::Error, Some(reason))
            }
            Err(e) => (RecordStatus::Error, Some(format!("task aborted: {e}"))),
        };

        match &reason {
            None => info!(record_id = %record.id, "run succeeded"),
            Some(reason) => warn!(record_id = %record.id, %reason, "run failed"),
        }

        if let Err(e) = self.records.finish(record.id, status, reason.as_deref()) {
            error!(record_id = %record.id, "failed to finalize record: {e}");
        }
        if let Err(e) = self.schedules.set_status(self.schedule.id, status) {
            error!("failed to write last-run status: {e}");
        }

        Invocation::Completed {
            record_id: record.id,
            status,
        }
    }

    /// Adapt the wrapper to the trigger engine's job signature.
    pub fn into_trigger(self: Arc<Self>) -> TriggerFn {
        Arc::new(move || {
            let wrapper = Arc::clone(&self);
            async move {
                wrapper.invoke().await;
            }
            .boxed()
        })
    }
}
