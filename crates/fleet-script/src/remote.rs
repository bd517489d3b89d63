//! Transport seam between script runs and whatever actually reaches a host.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{Host, HostLog, ScriptKind};

/// What to run on a host.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub content: String,
    pub kind: ScriptKind,
    /// Free-form arguments, split on whitespace into positional args.
    pub params: String,
}

/// Opens connections to hosts.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn connect(&self, host: &Host) -> Result<Arc<dyn RemoteSession>>;
}

/// An open connection that can run scripts, possibly many times.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// `user@address:port` of the peer.
    fn target(&self) -> &str;

    /// Run `request`, appending output lines to `log` as they arrive.
    ///
    /// Must return `ScriptError::Cancelled` promptly once `cancel` fires.
    async fn execute(
        &self,
        request: &ExecRequest,
        log: &OutputLog,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Incrementally captured per-host output, shared between the executing
/// sessions and the snapshot loop.
#[derive(Debug, Clone, Default)]
pub struct OutputLog {
    lines: Arc<Mutex<HostLog>>,
}

impl OutputLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, target: &str, line: impl Into<String>) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.entry(target.to_string()).or_default().push(line.into());
    }

    /// Make sure `target` shows up in the log even if it never prints.
    pub fn touch(&self, target: &str) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.entry(target.to_string()).or_default();
    }

    pub fn snapshot(&self) -> HostLog {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_a_copy() {
        let log = OutputLog::new();
        log.touch("b@h:22");
        log.push("a@h:22", "one");
        let snap = log.snapshot();
        log.push("a@h:22", "two");

        assert_eq!(snap["a@h:22"], vec!["one"]);
        assert!(snap["b@h:22"].is_empty());
        assert_eq!(log.snapshot()["a@h:22"].len(), 2);
    }
}
