//! Fan-out of one script to many hosts.
//!
//! A run goes through two phases. [`ScriptRuntime::prepare`] resolves the
//! script and hosts and writes the first version of the record, synchronously,
//! so the caller can hand out the record id right away. [`ScriptRuntime::execute`]
//! then connects to every host in parallel, streams output into an
//! [`OutputLog`], and periodically copies that log into the record until the
//! run finishes.
//!
//! The record is owned by the run behind one mutex and is always saved as a
//! whole row, so the snapshot loop and the final write never interleave.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use fleet_cache::CountdownCache;
use fleet_core::types::now_rfc3339;
use fleet_scheduler::{Task, TaskError, TaskParams};
use futures_util::future::join_all;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, ScriptError};
use crate::remote::{ExecRequest, OutputLog, RemoteExecutor, RemoteSession};
use crate::store::{HostStore, ScriptRecordStore, ScriptStore};
use crate::types::{
    Host, HostErrors, HostSnapshot, RunScriptParams, Script, ScriptRecord, ScriptRunStatus,
};

/// Name of the scheduler executor backed by [`ScriptTask`].
pub const SCRIPT_EXECUTOR: &str = "script";

/// Cancellation tokens of in-flight runs, keyed by record id.
pub(crate) type Jobs = Arc<DashMap<Uuid, CancellationToken>>;

/// Reject parameters that can never produce a run.
pub(crate) fn validate_run_params(params: &RunScriptParams) -> Result<()> {
    if params.script_id.is_nil() {
        return Err(ScriptError::Validation("script_id is required".to_string()));
    }
    if params.host_ids.is_empty() {
        return Err(ScriptError::Validation(
            "at least one host is required".to_string(),
        ));
    }
    if params.host_ids.iter().any(Uuid::is_nil) {
        return Err(ScriptError::Validation("host ids must not be nil".to_string()));
    }
    Ok(())
}

fn lock(record: &Mutex<ScriptRecord>) -> std::sync::MutexGuard<'_, ScriptRecord> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the run's token from the job map when dropped.
pub(crate) struct JobGuard {
    jobs: Jobs,
    id: Uuid,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.jobs.remove(&self.id);
    }
}

/// A run whose record is persisted as `running`, ready to execute.
pub(crate) struct PreparedRun {
    record: Arc<Mutex<ScriptRecord>>,
    script: Script,
    hosts: Vec<Host>,
    params: String,
    cancel: CancellationToken,
    job: JobGuard,
}

pub(crate) enum Start {
    Ready(PreparedRun),
    /// The script or a host could not be resolved. The record is already
    /// saved as `failed`.
    Aborted(ScriptRecord),
}

pub(crate) struct ScriptRuntime {
    pub(crate) scripts: ScriptStore,
    pub(crate) hosts: HostStore,
    pub(crate) records: ScriptRecordStore,
    executor: Arc<dyn RemoteExecutor>,
    connections: CountdownCache<Arc<dyn RemoteSession>>,
    pub(crate) jobs: Jobs,
    snapshot_interval: Duration,
}

impl ScriptRuntime {
    pub(crate) fn new(
        scripts: ScriptStore,
        hosts: HostStore,
        records: ScriptRecordStore,
        executor: Arc<dyn RemoteExecutor>,
        connection_ttl: Duration,
        snapshot_interval: Duration,
    ) -> Self {
        Self {
            scripts,
            hosts,
            records,
            executor,
            connections: CountdownCache::new(connection_ttl),
            jobs: Arc::new(DashMap::new()),
            snapshot_interval,
        }
    }

    /// Number of cached connections.
    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Resolve inputs, register the cancellation token and save the first
    /// version of record `record_id`.
    #[instrument(skip(self, params), fields(script = %params.script_id, hosts = params.host_ids.len()))]
    pub(crate) fn prepare(&self, record_id: Uuid, params: &RunScriptParams) -> Result<Start> {
        let now = now_rfc3339();
        let mut record = ScriptRecord {
            id: record_id,
            script_title: String::new(),
            script: String::new(),
            hosts: "[]".to_string(),
            params: params.params.clone(),
            result: "{}".to_string(),
            status: ScriptRunStatus::Running,
            message: String::new(),
            error: String::new(),
            created_at: now.clone(),
            updated_at: now,
        };

        let (script, hosts) = match self.resolve(params) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(record = %record_id, "script run aborted: {e}");
                record.status = ScriptRunStatus::Failed;
                record.message = "run aborted before start".to_string();
                record.error = e.to_string();
                self.records.save(&record)?;
                return Ok(Start::Aborted(record));
            }
        };

        let snapshots: Vec<HostSnapshot> = hosts.iter().map(HostSnapshot::from).collect();
        record.script_title = script.title.clone();
        record.script = script.content.clone();
        record.hosts = serde_json::to_string(&snapshots)?;
        self.records.save(&record)?;

        let cancel = CancellationToken::new();
        self.jobs.insert(record_id, cancel.clone());
        info!(record = %record_id, "script run started");

        Ok(Start::Ready(PreparedRun {
            record: Arc::new(Mutex::new(record)),
            script,
            hosts,
            params: params.params.clone(),
            cancel,
            job: JobGuard {
                jobs: Arc::clone(&self.jobs),
                id: record_id,
            },
        }))
    }

    fn resolve(&self, params: &RunScriptParams) -> Result<(Script, Vec<Host>)> {
        let script = self.scripts.detail(params.script_id)?;
        let hosts = params
            .host_ids
            .iter()
            .map(|id| self.hosts.detail(*id))
            .collect::<Result<Vec<_>>>()?;
        Ok((script, hosts))
    }

    /// Run a prepared script on every host and return the final record.
    pub(crate) async fn execute(&self, run: PreparedRun) -> Result<ScriptRecord> {
        let PreparedRun {
            record,
            script,
            hosts,
            params,
            cancel,
            job,
        } = run;
        let record_id = job.id;

        let log = OutputLog::new();
        let done = CancellationToken::new();
        let snapshots = tokio::spawn(snapshot_loop(
            self.records.clone(),
            Arc::clone(&record),
            log.clone(),
            self.snapshot_interval,
            done.clone(),
        ));

        let request = ExecRequest {
            content: script.content,
            kind: script.kind,
            params,
        };
        let outcomes = join_all(
            hosts
                .iter()
                .map(|host| self.run_on_host(host, &request, &log, &cancel)),
        )
        .await;

        done.cancel();
        if let Err(e) = snapshots.await {
            warn!(record = %record_id, "snapshot loop ended abnormally: {e}");
        }

        let mut errors = HostErrors::new();
        for (host, outcome) in hosts.iter().zip(outcomes) {
            match outcome {
                Ok(()) | Err(ScriptError::Cancelled) => {}
                Err(e) => {
                    errors.insert(host.target(), e.to_string());
                }
            }
        }

        let (status, message) = if cancel.is_cancelled() {
            (ScriptRunStatus::Cancelled, "stopped".to_string())
        } else if !errors.is_empty() {
            (
                ScriptRunStatus::Failed,
                format!("{} of {} host(s) failed", errors.len(), hosts.len()),
            )
        } else {
            (
                ScriptRunStatus::Success,
                format!("completed on {} host(s)", hosts.len()),
            )
        };

        // Stop is refused from here on; the record is about to be final.
        drop(job);

        let result = serde_json::to_string(&log.snapshot())?;
        let error = if errors.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&errors)?
        };
        let mut rec = lock(&record);
        rec.result = result;
        rec.status = status;
        rec.message = message;
        rec.error = error;
        rec.updated_at = now_rfc3339();
        self.records.save(&rec)?;

        info!(record = %record_id, status = %status, "script run finished");
        Ok(rec.clone())
    }

    async fn run_on_host(
        &self,
        host: &Host,
        request: &ExecRequest,
        log: &OutputLog,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let target = host.target();
        log.touch(&target);

        let connect = self
            .connections
            .get_or_try_insert_with(&target, || self.executor.connect(host));
        let session = tokio::select! {
            session = connect => session?,
            _ = cancel.cancelled() => return Err(ScriptError::Cancelled),
        };

        match session.execute(request, log, cancel).await {
            Err(ScriptError::Io(e)) => {
                // The transport itself broke; reconnect next time.
                debug!(%target, "dropping cached connection");
                self.connections.delete(&target);
                Err(ScriptError::Io(e))
            }
            other => other,
        }
    }
}

async fn snapshot_loop(
    records: ScriptRecordStore,
    record: Arc<Mutex<ScriptRecord>>,
    log: OutputLog,
    interval: Duration,
    done: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let result = match serde_json::to_string(&log.snapshot()) {
            Ok(result) => result,
            Err(e) => {
                warn!("failed to encode output snapshot: {e}");
                continue;
            }
        };
        let mut rec = lock(&record);
        rec.result = result;
        rec.updated_at = now_rfc3339();
        if let Err(e) = records.save(&rec) {
            warn!(record = %rec.id, "failed to save output snapshot: {e}");
        }
    }
}

/// Scheduler-facing wrapper: params are a JSON [`RunScriptParams`].
pub struct ScriptTask {
    runtime: Arc<ScriptRuntime>,
    params: Option<RunScriptParams>,
}

impl ScriptTask {
    pub(crate) fn new(runtime: Arc<ScriptRuntime>) -> Self {
        Self {
            runtime,
            params: None,
        }
    }
}

#[async_trait]
impl Task for ScriptTask {
    fn set_params(&mut self, params: &TaskParams) -> std::result::Result<(), TaskError> {
        let decoded: RunScriptParams = params.decode()?;
        validate_run_params(&decoded).map_err(|e| TaskError::InvalidParams(e.to_string()))?;
        self.params = Some(decoded);
        Ok(())
    }

    async fn run(&mut self) -> std::result::Result<(), TaskError> {
        let params = self
            .params
            .take()
            .ok_or_else(|| TaskError::InvalidParams("parameters were not set".to_string()))?;

        let failed = |e: ScriptError| TaskError::Failed(e.to_string());
        let run = match self.runtime.prepare(Uuid::new_v4(), &params).map_err(failed)? {
            Start::Ready(run) => run,
            Start::Aborted(record) => return Err(TaskError::Failed(record.error)),
        };
        let record = self.runtime.execute(run).await.map_err(failed)?;

        match record.status {
            ScriptRunStatus::Success | ScriptRunStatus::Running => Ok(()),
            ScriptRunStatus::Cancelled => Err(TaskError::Cancelled),
            ScriptRunStatus::Failed => Err(TaskError::Failed(format!(
                "{}: {}",
                record.message, record.error
            ))),
        }
    }
}
