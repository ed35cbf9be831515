//! SSH connections behind a trait, with an OpenSSH-backed implementation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::{AicliError, Result};
use crate::util::process::{isolate, DropSignal, ProcessGroup};

use super::{AuthMethod, TunnelSpec};

const READY_POLL: Duration = Duration::from_millis(100);
const HEALTH_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Establishes a local port forward for a [`TunnelSpec`].
#[async_trait]
pub trait SshConnector: Send + Sync {
    /// Connect and forward `local_port` to the tunnel's remote endpoint.
    ///
    /// Must return only once the forward accepts connections, or fail within
    /// `timeout`. Rejected credentials are [`AicliError::Authentication`].
    async fn connect(
        &self,
        spec: &TunnelSpec,
        local_port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn SshSession>>;
}

/// One established forward.
#[async_trait]
pub trait SshSession: Send {
    /// `Ok` while the session is alive and the local end is connectable.
    async fn check(&mut self) -> Result<()>;

    /// Tear the session down. Called at most once.
    async fn shutdown(&mut self);
}

/// Runs the system `ssh` client (and `sshpass` for password auth).
#[derive(Debug, Clone)]
pub struct OpenSshConnector {
    ssh_program: PathBuf,
    sshpass_program: PathBuf,
}

impl Default for OpenSshConnector {
    fn default() -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            sshpass_program: PathBuf::from("sshpass"),
        }
    }
}

impl OpenSshConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use specific `ssh` and `sshpass` binaries instead of the ones on `PATH`.
    pub fn with_programs(ssh: impl Into<PathBuf>, sshpass: impl Into<PathBuf>) -> Self {
        Self {
            ssh_program: ssh.into(),
            sshpass_program: sshpass.into(),
        }
    }

    pub(crate) fn command(&self, spec: &TunnelSpec, local_port: u16) -> Command {
        let mut cmd = match &spec.auth {
            AuthMethod::Password { password } => {
                let mut cmd = Command::new(&self.sshpass_program);
                cmd.arg("-e").arg(&self.ssh_program).env("SSHPASS", password);
                cmd
            }
            _ => Command::new(&self.ssh_program),
        };

        cmd.arg("-N")
            .arg("-L")
            .arg(format!(
                "127.0.0.1:{local_port}:{}:{}",
                spec.remote_host, spec.remote_port
            ))
            .arg("-p")
            .arg(spec.ssh_port.to_string());
        for option in [
            "ExitOnForwardFailure=yes",
            "StrictHostKeyChecking=no",
            "UserKnownHostsFile=/dev/null",
            "LogLevel=ERROR",
        ] {
            cmd.arg("-o").arg(option);
        }
        match &spec.auth {
            AuthMethod::Password { .. } => {}
            AuthMethod::KeyFile { path } => {
                cmd.arg("-o")
                    .arg("BatchMode=yes")
                    .arg("-i")
                    .arg(expand_home(path));
            }
            AuthMethod::SshDefaults => {
                cmd.arg("-o").arg("BatchMode=yes");
            }
        }
        cmd.arg(spec.destination());

        // The session owns teardown through its process group. `sshpass`
        // puts ssh in a session of its own, so only a forwarded SIGTERM
        // reaches it; a SIGKILL on drop would orphan the forward.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        isolate(&mut cmd);
        cmd
    }
}

fn drop_signal(auth: &AuthMethod) -> DropSignal {
    match auth {
        AuthMethod::Password { .. } => DropSignal::Terminate,
        _ => DropSignal::Kill,
    }
}

#[async_trait]
impl SshConnector for OpenSshConnector {
    async fn connect(
        &self,
        spec: &TunnelSpec,
        local_port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn SshSession>> {
        let mut cmd = self.command(spec, local_port);
        let mut child = cmd.spawn().map_err(|e| {
            AicliError::tunnel_connect(format!("failed to start ssh for {spec}: {e}"))
        })?;
        let mut group = ProcessGroup::of(&child).on_drop(drop_signal(&spec.auth));
        debug!(tunnel = %spec, local_port, pid = ?child.id(), "ssh spawned");

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                let stderr = read_stderr(&mut child).await;
                group.kill();
                return Err(classify_exit(spec, &status.to_string(), &stderr));
            }
            if local_port_accepts(local_port).await {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                stop(&mut child, &mut group).await;
                return Err(AicliError::tunnel_connect(format!(
                    "forward to {spec} not ready after {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(READY_POLL).await;
        }

        if let Some(stderr) = child.stderr.take() {
            let tunnel = spec.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(tunnel = %tunnel, "ssh: {line}");
                }
            });
        }

        Ok(Box::new(OpenSshSession {
            child,
            group,
            local_port,
        }))
    }
}

struct OpenSshSession {
    child: Child,
    group: ProcessGroup,
    local_port: u16,
}

#[async_trait]
impl SshSession for OpenSshSession {
    async fn check(&mut self) -> Result<()> {
        if let Some(status) = self.child.try_wait()? {
            return Err(AicliError::tunnel_session(format!("ssh exited ({status})")));
        }
        if !local_port_accepts(self.local_port).await {
            return Err(AicliError::tunnel_session(format!(
                "local port {} stopped accepting connections",
                self.local_port
            )));
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        stop(&mut self.child, &mut self.group).await;
    }
}

/// SIGTERM the group, give it [`SHUTDOWN_GRACE`] to exit, then SIGKILL
/// whatever is left.
async fn stop(child: &mut Child, group: &mut ProcessGroup) {
    group.terminate();
    if tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await.is_err() {
        debug!(pid = ?child.id(), "ssh ignored SIGTERM, killing");
    }
    group.kill();
    if let Ok(None) = child.try_wait() {
        if let Err(e) = child.kill().await {
            debug!(error = %e, "ssh already gone");
        }
    }
}

async fn local_port_accepts(port: u16) -> bool {
    matches!(
        tokio::time::timeout(HEALTH_CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

async fn read_stderr(child: &mut Child) -> String {
    let mut out = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut out).await;
    }
    out.trim().to_string()
}

/// Turn an early ssh exit into an error, singling out rejected credentials.
pub(crate) fn classify_exit(spec: &TunnelSpec, status: &str, stderr: &str) -> AicliError {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("permission denied")
        || lowered.contains("authentication failed")
        || lowered.contains("too many authentication failures")
    {
        return AicliError::Authentication(format!(
            "SSH authentication to {} failed: {stderr}",
            spec.destination()
        ));
    }
    let detail = if stderr.is_empty() { "no output" } else { stderr };
    AicliError::tunnel_connect(format!("ssh to {spec} exited ({status}): {detail}"))
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => directories::UserDirs::new()
            .map(|dirs| dirs.home_dir().join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}
