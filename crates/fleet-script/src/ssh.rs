//! OpenSSH-backed [`RemoteExecutor`].
//!
//! Each host gets a control master (`ControlMaster=auto`) whose socket lives
//! as long as the connection cache keeps the session. Scripts are streamed
//! over stdin to `bash -s` or `python3 -`, so nothing is written to the remote
//! disk.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::config::ScriptConfig;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::error::{Result, ScriptError};
use crate::remote::{ExecRequest, OutputLog, RemoteExecutor, RemoteSession};
use crate::types::{Host, ScriptKind};

/// Prefix for stderr lines in the captured log.
const STDERR_PREFIX: &str = "[stderr] ";

#[derive(Debug, Clone)]
pub struct SshExecutor {
    ssh_binary: String,
    control_dir: PathBuf,
    connect_timeout: Duration,
    /// Matches the connection cache TTL so the master outlives its cache entry.
    control_persist: Duration,
}

impl SshExecutor {
    pub fn new(config: &ScriptConfig) -> Self {
        Self {
            ssh_binary: config.ssh_binary.clone(),
            control_dir: PathBuf::from(&config.control_dir),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            control_persist: Duration::from_secs(config.connection_ttl_secs),
        }
    }

    /// Socket path for `target`. Hashed because sockets have a short path limit.
    fn control_path(&self, target: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(target.as_bytes()));
        self.control_dir.join(format!("{}.sock", &digest[..32]))
    }

    fn ssh_args(&self, host: &Host) -> Vec<String> {
        let target = host.target();
        let mut args = vec![
            "-T".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path(&target).display()),
            "-o".to_string(),
            format!("ControlPersist={}s", self.control_persist.as_secs()),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];
        if host.password.is_none() {
            // Never fall back to an interactive prompt.
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
        if let Some(identity) = &host.identity_file {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        args.push("-p".to_string());
        args.push(host.port.to_string());
        args.push(format!("{}@{}", host.username, host.address));
        args
    }

    /// `ssh ... <remote>`, wrapped in `sshpass -e` for password hosts.
    fn command(&self, host: &Host, remote: &str) -> Command {
        let mut cmd = match &host.password {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg(&self.ssh_binary).env("SSHPASS", password);
                cmd
            }
            None => Command::new(&self.ssh_binary),
        };
        cmd.args(self.ssh_args(host)).arg(remote).kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    #[instrument(skip(self, host), fields(target = %host.target()))]
    async fn connect(&self, host: &Host) -> Result<Arc<dyn RemoteSession>> {
        let target = host.target();
        tokio::fs::create_dir_all(&self.control_dir).await?;

        let mut cmd = self.command(host, "true");
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::piped());

        // ssh enforces ConnectTimeout itself; the extra margin covers sshpass.
        let deadline = self.connect_timeout + Duration::from_secs(5);
        let output = match tokio::time::timeout(deadline, cmd.output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(ScriptError::Connect {
                    target,
                    reason: format!("timed out after {}s", deadline.as_secs()),
                })
            }
        };
        if !output.status.success() {
            return Err(ScriptError::Connect {
                target,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!("ssh control master ready");
        Ok(Arc::new(SshSession {
            executor: self.clone(),
            host: host.clone(),
            target,
        }))
    }
}

pub struct SshSession {
    executor: SshExecutor,
    host: Host,
    target: String,
}

#[async_trait]
impl RemoteSession for SshSession {
    fn target(&self) -> &str {
        &self.target
    }

    async fn execute(
        &self,
        request: &ExecRequest,
        log: &OutputLog,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let remote = remote_command(request.kind, &request.params);
        debug!(target = %self.target, %remote, "running script");

        let mut child = self
            .executor
            .command(&self.host, &remote)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let broken = |what: &str| ScriptError::Execution {
            target: self.target.clone(),
            reason: format!("{what} pipe unavailable"),
        };
        let mut stdin = child.stdin.take().ok_or_else(|| broken("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| broken("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| broken("stderr"))?;

        let content = request.content.clone();
        let feed = async move {
            // The remote side may exit before reading everything; that is
            // reported through the exit status, not here.
            if let Err(e) = stdin.write_all(content.as_bytes()).await {
                debug!("script stdin closed early: {e}");
            }
            let _ = stdin.shutdown().await;
            Ok::<_, std::io::Error>(())
        };
        let pumps = async {
            tokio::try_join!(
                feed,
                pump(stdout, log, &self.target, ""),
                pump(stderr, log, &self.target, STDERR_PREFIX),
            )
        };

        let drained = tokio::select! {
            r = pumps => Some(r),
            _ = cancel.cancelled() => None,
        };
        let status = match drained {
            Some(Ok(_)) => tokio::select! {
                s = child.wait() => Some(s),
                _ = cancel.cancelled() => None,
            },
            Some(Err(e)) => Some(Err(e)),
            None => None,
        };
        let Some(status) = status else {
            let _ = child.kill().await;
            info!(target = %self.target, "script cancelled, ssh client killed");
            return Err(ScriptError::Cancelled);
        };

        let status = status?;
        if status.success() {
            Ok(())
        } else {
            Err(ScriptError::Execution {
                target: self.target.clone(),
                reason: match status.code() {
                    Some(code) => format!("exit status {code}"),
                    None => "terminated by signal".to_string(),
                },
            })
        }
    }
}

async fn pump<R>(reader: R, log: &OutputLog, target: &str, prefix: &str) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    // Output is not guaranteed to be UTF-8; undecodable bytes are replaced.
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let line = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        log.push(target, format!("{prefix}{}", String::from_utf8_lossy(line)));
    }
}

/// Remote command line that reads the script body from stdin.
pub fn remote_command(kind: ScriptKind, params: &str) -> String {
    let mut cmd = match kind {
        ScriptKind::Shell => "bash -s --".to_string(),
        ScriptKind::Python => "python3 -".to_string(),
    };
    for arg in params.split_whitespace() {
        cmd.push(' ');
        cmd.push_str(&shell_quote(arg));
    }
    cmd
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> SshExecutor {
        SshExecutor::new(&ScriptConfig {
            control_dir: "/tmp/fleet-ssh".to_string(),
            ..ScriptConfig::default()
        })
    }

    fn host(password: Option<&str>, identity: Option<&str>) -> Host {
        Host {
            id: uuid::Uuid::new_v4(),
            title: "web-1".to_string(),
            address: "10.0.0.5".to_string(),
            port: 2222,
            username: "ops".to_string(),
            password: password.map(String::from),
            identity_file: identity.map(String::from),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn key_auth_uses_control_master_and_batch_mode() {
        let exec = executor();
        let h = host(None, Some("/keys/ops"));
        let cmd = exec.command(&h, "true");
        let args = args_of(&cmd);

        assert_eq!(cmd.as_std().get_program(), "ssh");
        assert!(args.contains(&"ControlMaster=auto".to_string()));
        assert!(args.contains(&"ControlPersist=300s".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.windows(2).any(|w| w == ["-i", "/keys/ops"]));
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        assert_eq!(args[args.len() - 2], "ops@10.0.0.5");
        assert_eq!(args[args.len() - 1], "true");
    }

    #[test]
    fn password_auth_goes_through_sshpass_env() {
        let exec = executor();
        let cmd = exec.command(&host(Some("hunter2"), None), "true");
        let args = args_of(&cmd);

        assert_eq!(cmd.as_std().get_program(), "sshpass");
        assert_eq!(&args[..2], ["-e", "ssh"]);
        assert!(!args.contains(&"BatchMode=yes".to_string()));
        // The password never appears on the command line.
        assert!(!args.iter().any(|a| a.contains("hunter2")));
        assert!(cmd
            .as_std()
            .get_envs()
            .any(|(k, v)| k == "SSHPASS" && v.is_some_and(|v| v == "hunter2")));
    }

    #[test]
    fn control_path_is_stable_and_short() {
        let exec = executor();
        let a = exec.control_path("ops@10.0.0.5:2222");
        assert_eq!(a, exec.control_path("ops@10.0.0.5:2222"));
        assert_ne!(a, exec.control_path("ops@10.0.0.6:2222"));
        assert!(a.starts_with("/tmp/fleet-ssh"));
        assert!(a.as_os_str().len() < 100);
    }

    #[tokio::test]
    async fn pump_keeps_lines_after_invalid_utf8() {
        let log = OutputLog::new();
        let output: &[u8] = b"before\n\xff\xfe caf\xe9\nafter\r\nno newline";
        pump(output, &log, "t", "[stderr] ").await.unwrap();

        let lines = &log.snapshot()["t"];
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "[stderr] before");
        assert!(lines[1].starts_with("[stderr] \u{fffd}"));
        assert!(lines[1].ends_with("caf\u{fffd}"));
        assert_eq!(lines[2], "[stderr] after");
        assert_eq!(lines[3], "[stderr] no newline");
    }

    #[test]
    fn remote_command_quotes_params() {
        assert_eq!(remote_command(ScriptKind::Shell, ""), "bash -s --");
        assert_eq!(
            remote_command(ScriptKind::Shell, "--dry-run it's"),
            r"bash -s -- '--dry-run' 'it'\''s'"
        );
        assert_eq!(remote_command(ScriptKind::Python, "x"), "python3 - 'x'");
    }
}
