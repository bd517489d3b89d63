//! `fleet-script`: run scripts on remote hosts.
//!
//! Scripts and hosts live in SQLite next to the scheduler tables. A run fans
//! one script out to many hosts in parallel, reusing idle connections from a
//! [`fleet_cache::CountdownCache`], and records per-host output in a
//! `script_records` row that is refreshed while the run is in flight.
//!
//! Runs are started ad hoc through [`ScriptRunner::run_on_hosts`] or by the
//! scheduler through the `script` executor ([`ScriptRunner::register`]).
//! The transport is pluggable through [`RemoteExecutor`]; [`SshExecutor`]
//! drives the system OpenSSH client.

pub mod db;
pub mod error;
pub mod remote;
pub mod runner;
pub mod ssh;
pub mod store;
pub mod task;
pub mod types;

pub use error::{Result, ScriptError};
pub use remote::{ExecRequest, OutputLog, RemoteExecutor, RemoteSession};
pub use runner::ScriptRunner;
pub use ssh::SshExecutor;
pub use task::{ScriptTask, SCRIPT_EXECUTOR};
pub use types::{
    Host, HostErrors, HostLog, HostSnapshot, NewHost, NewScript, RunScriptParams, Script,
    ScriptKind, ScriptRecord, ScriptRecordFilter, ScriptRunStatus,
};
