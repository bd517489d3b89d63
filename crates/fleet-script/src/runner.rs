use std::sync::Arc;
use std::time::Duration;

use fleet_core::config::ScriptConfig;
use fleet_core::db::{self, SharedConnection};
use fleet_core::{PageRequest, Pager};
use fleet_scheduler::{ExecutorDescriptor, ExecutorRegistry, Task};
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{Result, ScriptError};
use crate::remote::RemoteExecutor;
use crate::store::{HostStore, ScriptRecordStore, ScriptStore};
use crate::task::{validate_run_params, ScriptRuntime, ScriptTask, Start, SCRIPT_EXECUTOR};
use crate::types::{
    Host, HostLog, NewHost, NewScript, RunScriptParams, Script, ScriptRecord, ScriptRecordFilter,
};

/// Script and host management plus ad-hoc script runs.
pub struct ScriptRunner {
    runtime: Arc<ScriptRuntime>,
}

impl ScriptRunner {
    /// Creates the script tables on `conn` if needed.
    pub fn new(
        conn: SharedConnection,
        executor: Arc<dyn RemoteExecutor>,
        config: &ScriptConfig,
    ) -> Result<Self> {
        init_db(&db::lock(&conn))?;
        let runtime = ScriptRuntime::new(
            ScriptStore::new(conn.clone()),
            HostStore::new(conn.clone()),
            ScriptRecordStore::new(conn),
            executor,
            Duration::from_secs(config.connection_ttl_secs),
            Duration::from_millis(config.snapshot_interval_ms.max(1)),
        );
        Ok(Self {
            runtime: Arc::new(runtime),
        })
    }

    /// Expose script runs to the scheduler as the `script` executor.
    pub fn register(&self, registry: &ExecutorRegistry) -> Result<()> {
        let runtime = Arc::clone(&self.runtime);
        registry.register(ExecutorDescriptor::new(SCRIPT_EXECUTOR, "Script"), move || {
            Box::new(ScriptTask::new(Arc::clone(&runtime))) as Box<dyn Task>
        })?;
        Ok(())
    }

    pub fn add_script(&self, input: NewScript) -> Result<Script> {
        validate_script(&input)?;
        self.runtime.scripts.insert(input)
    }

    pub fn update_script(&self, id: Uuid, input: NewScript) -> Result<Script> {
        validate_script(&input)?;
        self.runtime.scripts.update(id, input)
    }

    pub fn detail_script(&self, id: Uuid) -> Result<Script> {
        self.runtime.scripts.detail(id)
    }

    pub fn page_scripts(&self, keyword: Option<&str>, req: PageRequest) -> Result<Pager<Script>> {
        self.runtime.scripts.page(keyword, req)
    }

    pub fn delete_scripts(&self, ids: &[Uuid]) -> Result<usize> {
        check_ids(ids)?;
        self.runtime.scripts.delete_many(ids)
    }

    pub fn add_host(&self, input: NewHost) -> Result<Host> {
        validate_host(&input)?;
        self.runtime.hosts.insert(input)
    }

    pub fn update_host(&self, id: Uuid, input: NewHost) -> Result<Host> {
        validate_host(&input)?;
        self.runtime.hosts.update(id, input)
    }

    pub fn detail_host(&self, id: Uuid) -> Result<Host> {
        self.runtime.hosts.detail(id)
    }

    pub fn page_hosts(&self, keyword: Option<&str>, req: PageRequest) -> Result<Pager<Host>> {
        self.runtime.hosts.page(keyword, req)
    }

    pub fn delete_hosts(&self, ids: &[Uuid]) -> Result<usize> {
        check_ids(ids)?;
        self.runtime.hosts.delete_many(ids)
    }

    /// Start a run and return its record id without waiting for it.
    ///
    /// The record exists by the time this returns: `running`, or `failed` if
    /// the script or a host could not be resolved.
    #[instrument(skip(self, params), fields(script = %params.script_id))]
    pub fn run_on_hosts(&self, params: RunScriptParams) -> Result<Uuid> {
        validate_run_params(&params)?;
        let record_id = Uuid::new_v4();
        let run = match self.runtime.prepare(record_id, &params)? {
            Start::Ready(run) => run,
            Start::Aborted(_) => return Ok(record_id),
        };

        let runtime = Arc::clone(&self.runtime);
        tokio::spawn(async move {
            if let Err(e) = runtime.execute(run).await {
                error!(record = %record_id, "script run could not be finalized: {e}");
            }
        });
        Ok(record_id)
    }

    /// Latest persisted per-host output of a run.
    pub fn get_log(&self, record_id: Uuid) -> Result<HostLog> {
        let record = self.runtime.records.detail(record_id)?;
        if record.result.trim().is_empty() {
            return Ok(HostLog::new());
        }
        Ok(serde_json::from_str(&record.result)?)
    }

    /// Cancel an in-flight run.
    pub fn stop(&self, record_id: Uuid) -> Result<()> {
        let token = self
            .runtime
            .jobs
            .get(&record_id)
            .map(|entry| entry.value().clone())
            .ok_or(ScriptError::RunNotFound { id: record_id })?;
        token.cancel();
        info!(record = %record_id, "script run stop requested");
        Ok(())
    }

    pub fn is_running(&self, record_id: Uuid) -> bool {
        self.runtime.jobs.contains_key(&record_id)
    }

    pub fn running_count(&self) -> usize {
        self.runtime.jobs.len()
    }

    /// Open connections currently held in the idle cache.
    pub fn cached_connections(&self) -> usize {
        self.runtime.connection_count()
    }

    pub fn detail_record(&self, record_id: Uuid) -> Result<ScriptRecord> {
        self.runtime.records.detail(record_id)
    }

    pub fn page_records(
        &self,
        filter: &ScriptRecordFilter,
        req: PageRequest,
    ) -> Result<Pager<ScriptRecord>> {
        self.runtime.records.page(filter, req)
    }

    /// Cancel every in-flight run.
    pub fn shutdown(&self) {
        let mut n = 0;
        for entry in self.runtime.jobs.iter() {
            entry.value().cancel();
            n += 1;
        }
        if n > 0 {
            info!(runs = n, "cancelled in-flight script runs");
        }
    }
}

fn validate_script(input: &NewScript) -> Result<()> {
    if input.title.trim().is_empty() {
        return Err(ScriptError::Validation("title is required".to_string()));
    }
    if input.content.trim().is_empty() {
        return Err(ScriptError::Validation("content is required".to_string()));
    }
    Ok(())
}

fn validate_host(input: &NewHost) -> Result<()> {
    if input.title.trim().is_empty() {
        return Err(ScriptError::Validation("title is required".to_string()));
    }
    if input.address.trim().is_empty() {
        return Err(ScriptError::Validation("address is required".to_string()));
    }
    if input.username.trim().is_empty() {
        return Err(ScriptError::Validation("username is required".to_string()));
    }
    if input.port == 0 {
        return Err(ScriptError::Validation("port must be non-zero".to_string()));
    }
    Ok(())
}

fn check_ids(ids: &[Uuid]) -> Result<()> {
    if ids.is_empty() {
        return Err(ScriptError::Validation("no ids given".to_string()));
    }
    if ids.iter().any(Uuid::is_nil) {
        return Err(ScriptError::Validation("ids must not be nil".to_string()));
    }
    Ok(())
}
