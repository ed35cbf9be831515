//! SSH tunnels that expose a remote model server on a local port.
//!
//! A [`TunnelManager`] owns every tunnel. Callers get a [`TunnelHandle`] back
//! from [`TunnelManager::open`], and hand a [`TunnelEndpoint`] to the HTTP
//! transport, which resolves the local port before each request.

mod manager;
mod monitor;
pub mod port;
pub mod ssh;

pub use manager::{TunnelHandle, TunnelManager, TunnelSummary};
pub use ssh::{OpenSshConnector, SshConnector, SshSession};

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::sync::watch;

use crate::error::{AicliError, Result};

fn default_ssh_port() -> u16 {
    22
}

fn default_remote_host() -> String {
    "localhost".to_string()
}

fn default_remote_port() -> u16 {
    11434
}

/// Where to connect and what to forward.
///
/// `local_port: None` lets the OS pick a free port.
#[derive(Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
pub struct TunnelSpec {
    #[builder(into)]
    pub host: String,
    #[serde(default = "default_ssh_port")]
    #[builder(default = default_ssh_port())]
    pub ssh_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    pub user: Option<String>,
    #[serde(default)]
    #[builder(default)]
    pub auth: AuthMethod,
    #[serde(default = "default_remote_host")]
    #[builder(into, default = default_remote_host())]
    pub remote_host: String,
    #[serde(default = "default_remote_port")]
    #[builder(default = default_remote_port())]
    pub remote_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
}

impl TunnelSpec {
    /// Two specs with the same key share one live tunnel.
    pub fn key(&self) -> TunnelKey {
        TunnelKey {
            host: self.host.clone(),
            ssh_port: self.ssh_port,
            user: self.user.clone(),
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
        }
    }

    /// `user@host`, or just `host` when no user is configured.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

impl fmt::Debug for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSpec")
            .field("host", &self.host)
            .field("ssh_port", &self.ssh_port)
            .field("user", &self.user)
            .field("auth", &self.auth)
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .field("local_port", &self.local_port)
            .finish()
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.destination(),
            self.ssh_port,
            self.remote_host,
            self.remote_port
        )
    }
}

/// Identity of a tunnel: everything except auth and the local port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelKey {
    pub host: String,
    pub ssh_port: u16,
    pub user: Option<String>,
    pub remote_host: String,
    pub remote_port: u16,
}

/// How the SSH client authenticates.
///
/// In TOML: `auth = { method = "key_file", path = "~/.ssh/id_ed25519" }`.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Whatever the local ssh client would use on its own (agent, config).
    #[default]
    SshDefaults,
    KeyFile { path: PathBuf },
    Password { password: String },
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SshDefaults => f.write_str("SshDefaults"),
            Self::KeyFile { path } => f.debug_struct("KeyFile").field("path", path).finish(),
            Self::Password { .. } => f
                .debug_struct("Password")
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TunnelState {
    Closed,
    Connecting,
    Open,
    Degraded,
    Error,
}

/// Snapshot published by the tunnel owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStatus {
    pub state: TunnelState,
    pub local_port: Option<u16>,
    pub last_error: Option<String>,
}

impl TunnelStatus {
    pub(crate) fn new(state: TunnelState, local_port: Option<u16>) -> Self {
        Self {
            state,
            local_port,
            last_error: None,
        }
    }

    pub(crate) fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }
}

/// Timing knobs for connecting, health checks and reconnects.
#[derive(Debug, Clone)]
pub struct TunnelPolicy {
    pub connect_timeout: Duration,
    pub health_interval: Duration,
    /// Consecutive failed checks before a reconnect is attempted.
    pub failure_threshold: u32,
    pub max_reconnects: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// How many ports above a fixed `local_port` are tried when it is taken.
    pub port_search_span: u16,
}

impl Default for TunnelPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            health_interval: Duration::from_secs(5),
            failure_threshold: 1,
            max_reconnects: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            port_search_span: 100,
        }
    }
}

/// Read side of a tunnel's status, handed to the HTTP transport.
#[derive(Debug, Clone)]
pub struct TunnelEndpoint {
    status: watch::Receiver<TunnelStatus>,
}

impl TunnelEndpoint {
    pub(crate) fn new(status: watch::Receiver<TunnelStatus>) -> Self {
        Self { status }
    }

    pub fn status(&self) -> TunnelStatus {
        self.status.borrow().clone()
    }

    /// Resolve the local port for the next request.
    ///
    /// While the tunnel is connecting or degraded this waits up to `wait` for
    /// it to settle. Anything other than `Open` is "remote backend unreachable".
    pub async fn acquire(&self, wait: Duration) -> Result<u16> {
        let mut rx = self.status.clone();
        let settled = tokio::time::timeout(
            wait,
            rx.wait_for(|s| !matches!(s.state, TunnelState::Connecting | TunnelState::Degraded)),
        )
        .await;

        let status = match settled {
            Err(_) => {
                return Err(AicliError::remote_unreachable(format!(
                    "tunnel did not recover within {}s",
                    wait.as_secs()
                )))
            }
            Ok(Err(_)) => return Err(AicliError::remote_unreachable("tunnel closed")),
            Ok(Ok(status)) => status.clone(),
        };

        match (status.state, status.local_port) {
            (TunnelState::Open, Some(port)) => Ok(port),
            (TunnelState::Error, _) => Err(AicliError::remote_unreachable(
                status.last_error.as_deref().unwrap_or("reconnect attempts exhausted"),
            )),
            _ => Err(AicliError::remote_unreachable("tunnel closed")),
        }
    }

    /// Wait for the next status change. `None` once the tunnel is gone.
    pub async fn changed(&mut self) -> Option<TunnelStatus> {
        self.status.changed().await.ok()?;
        Some(self.status.borrow_and_update().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn builder_fills_defaults() {
        let spec = TunnelSpec::builder().host("gpu-box").user("alice").build();
        assert_eq!(spec.ssh_port, 22);
        assert_eq!(spec.remote_host, "localhost");
        assert_eq!(spec.remote_port, 11434);
        assert_eq!(spec.local_port, None);
        assert_eq!(spec.auth, AuthMethod::SshDefaults);
        assert_eq!(spec.destination(), "alice@gpu-box");
    }

    #[test]
    fn key_ignores_auth_and_local_port() {
        let a = TunnelSpec::builder().host("h").local_port(9000).build();
        let b = TunnelSpec::builder()
            .host("h")
            .auth(AuthMethod::Password {
                password: "pw".into(),
            })
            .build();
        assert_eq!(a.key(), b.key());
        let c = TunnelSpec::builder().host("h").remote_port(8080).build();
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn auth_parses_from_toml_and_hides_passwords() {
        let spec: TunnelSpec = toml::from_str(
            r#"
host = "gpu-box"
auth = { method = "password", password = "hunter2" }
"#,
        )
        .unwrap();
        assert!(matches!(spec.auth, AuthMethod::Password { .. }));
        assert!(!format!("{spec:?}").contains("hunter2"));

        let spec: TunnelSpec = toml::from_str(
            r#"
host = "gpu-box"
auth = { method = "key_file", path = "/home/alice/.ssh/id_ed25519" }
"#,
        )
        .unwrap();
        assert_eq!(
            spec.auth,
            AuthMethod::KeyFile {
                path: "/home/alice/.ssh/id_ed25519".into()
            }
        );
    }

    #[tokio::test]
    async fn acquire_returns_port_when_open() {
        let (_tx, rx) = watch::channel(TunnelStatus::new(TunnelState::Open, Some(40100)));
        let port = TunnelEndpoint::new(rx)
            .acquire(Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(port, 40100);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_recovery_from_degraded() {
        let (tx, rx) = watch::channel(TunnelStatus::new(TunnelState::Degraded, Some(40100)));
        let endpoint = TunnelEndpoint::new(rx);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            tx.send_replace(TunnelStatus::new(TunnelState::Open, Some(40101)));
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let port = endpoint.acquire(Duration::from_secs(15)).await.unwrap();
        assert_eq!(port, 40101);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_refuses_errored_or_stuck_tunnels() {
        let (_tx, rx) = watch::channel(
            TunnelStatus::new(TunnelState::Error, Some(40100)).with_error("3 reconnects failed"),
        );
        let err = TunnelEndpoint::new(rx)
            .acquire(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("remote backend unreachable"));

        let (_tx, rx) = watch::channel(TunnelStatus::new(TunnelState::Degraded, Some(40100)));
        let err = TunnelEndpoint::new(rx)
            .acquire(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not recover"));
    }
}
