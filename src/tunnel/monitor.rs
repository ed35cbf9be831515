//! Background health checks and reconnects for an open tunnel.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::util::retry::Backoff;

use super::ssh::{SshConnector, SshSession};
use super::{TunnelPolicy, TunnelSpec, TunnelState, TunnelStatus};

pub(crate) struct Monitor {
    pub spec: TunnelSpec,
    pub local_port: u16,
    pub policy: TunnelPolicy,
    pub connector: Arc<dyn SshConnector>,
    pub status: Arc<watch::Sender<TunnelStatus>>,
    pub cancel: CancellationToken,
}

impl Monitor {
    fn publish(&self, state: TunnelState, error: Option<String>) {
        let mut status = TunnelStatus::new(state, Some(self.local_port));
        status.last_error = error;
        self.status.send_replace(status);
    }

    /// Runs until cancelled or until reconnects are exhausted.
    /// The session is always shut down before returning.
    pub async fn run(self, mut session: Box<dyn SshSession>) {
        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    session.shutdown().await;
                    return;
                }
                _ = tokio::time::sleep(self.policy.health_interval) => {}
            }

            match session.check().await {
                Ok(()) => {
                    if failures > 0 {
                        info!(tunnel = %self.spec, "tunnel healthy again");
                        self.publish(TunnelState::Open, None);
                    }
                    failures = 0;
                    continue;
                }
                Err(e) => {
                    failures += 1;
                    warn!(tunnel = %self.spec, failures, error = %e, "tunnel health check failed");
                    self.publish(TunnelState::Degraded, Some(e.to_string()));
                }
            }

            if failures < self.policy.failure_threshold {
                continue;
            }

            session.shutdown().await;
            match self.reconnect().await {
                Reconnect::Recovered(fresh) => {
                    info!(tunnel = %self.spec, port = self.local_port, "tunnel reconnected");
                    session = fresh;
                    failures = 0;
                    self.publish(TunnelState::Open, None);
                }
                Reconnect::Cancelled => return,
                Reconnect::Exhausted(last_error) => {
                    warn!(tunnel = %self.spec, "tunnel reconnect attempts exhausted");
                    let message = format!(
                        "{} reconnect attempts failed: {last_error}",
                        self.policy.max_reconnects
                    );
                    self.publish(TunnelState::Error, Some(message));
                    return;
                }
            }
        }
    }

    async fn reconnect(&self) -> Reconnect {
        let mut backoff = Backoff::new(
            self.policy.initial_backoff,
            self.policy.max_backoff,
            self.policy.backoff_multiplier,
        );
        let mut last_error = String::from("no reconnect attempted");

        for attempt in 1..=self.policy.max_reconnects {
            let delay = backoff.next_delay();
            warn!(
                tunnel = %self.spec,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnecting tunnel"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Reconnect::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }

            let attempt_result = tokio::select! {
                _ = self.cancel.cancelled() => return Reconnect::Cancelled,
                r = self.connector.connect(&self.spec, self.local_port, self.policy.connect_timeout) => r,
            };
            match attempt_result {
                Ok(session) => return Reconnect::Recovered(session),
                Err(e) => {
                    warn!(tunnel = %self.spec, attempt, error = %e, "reconnect failed");
                    last_error = e.to_string();
                }
            }
        }
        Reconnect::Exhausted(last_error)
    }
}

enum Reconnect {
    Recovered(Box<dyn SshSession>),
    Cancelled,
    Exhausted(String),
}
