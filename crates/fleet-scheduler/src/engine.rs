use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::schedule::CronExpr;

/// A fire that wakes up later than this after its scheduled time is skipped.
pub const MAX_FIRE_DELAY: Duration = Duration::from_secs(1);

/// Opaque id of one registration in a [`TriggerEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriggerHandle(Uuid);

impl TriggerHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TriggerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The job a trigger runs on every fire.
pub type TriggerFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Timer backend the scheduler service registers live triggers with.
pub trait TriggerEngine: Send + Sync {
    fn register(&self, cron: CronExpr, job: TriggerFn) -> TriggerHandle;

    /// Stop a registration. Returns `false` if the handle is unknown.
    fn remove(&self, handle: TriggerHandle) -> bool;

    /// Number of live registrations.
    fn active(&self) -> usize;
}

/// Tokio-backed [`TriggerEngine`].
///
/// Each registration gets its own task that sleeps until the next fire time
/// and spawns the job, so distinct schedules run in parallel and a slow run
/// never delays the next fire.
pub struct CronEngine {
    runtime: Handle,
    entries: Arc<DashMap<TriggerHandle, CancellationToken>>,
    shutdown: CancellationToken,
}

impl CronEngine {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            entries: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Engine bound to the runtime the caller is running on.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| SchedulerError::Internal(format!("no Tokio runtime: {e}")))
    }

    /// Cancel every registration.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.entries.clear();
        info!("cron engine stopped");
    }
}

impl TriggerEngine for CronEngine {
    fn register(&self, cron: CronExpr, job: TriggerFn) -> TriggerHandle {
        let handle = TriggerHandle::new();
        let token = self.shutdown.child_token();
        self.entries.insert(handle, token.clone());

        let entries = Arc::clone(&self.entries);
        self.runtime.spawn(async move {
            run_trigger(handle, cron, job, token).await;
            entries.remove(&handle);
        });
        handle
    }

    fn remove(&self, handle: TriggerHandle) -> bool {
        match self.entries.remove(&handle) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn active(&self) -> usize {
        self.entries.len()
    }
}

impl Drop for CronEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn is_late(scheduled: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    (now - scheduled)
        .to_std()
        .map(|behind| behind > MAX_FIRE_DELAY)
        .unwrap_or(false)
}

async fn run_trigger(handle: TriggerHandle, cron: CronExpr, job: TriggerFn, token: CancellationToken) {
    debug!(%handle, %cron, "trigger started");
    let mut cursor = Utc::now();
    loop {
        let Some(next) = cron.next_after(cursor) else {
            info!(%handle, %cron, "no future fire time, trigger finished");
            return;
        };
        let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = token.cancelled() => {
                debug!(%handle, "trigger cancelled");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let now = Utc::now();
        if is_late(next, now) {
            // Host suspend or a clock jump; missed fires are never replayed.
            warn!(%handle, %cron, scheduled = %next.to_rfc3339(), "fire missed, skipping");
            cursor = now;
            continue;
        }
        cursor = next;
        tokio::spawn(job());
    }
}
