//! Tunnel manager lifecycle against a fake SSH connector.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use aicli::error::AicliError;
use aicli::tunnel::{AuthMethod, TunnelManager, TunnelPolicy, TunnelSpec, TunnelState};

use common::{ConnectPlan, FakeConnector};

fn spec() -> TunnelSpec {
    TunnelSpec::builder().host("gpu-box").user("alice").build()
}

fn manager(connector: Arc<FakeConnector>, policy: TunnelPolicy) -> TunnelManager {
    TunnelManager::new(connector, policy)
}

#[tokio::test(start_paused = true)]
async fn closing_twice_is_a_no_op() {
    let connector = FakeConnector::healthy();
    let tunnels = manager(connector.clone(), TunnelPolicy::default());

    let handle = tunnels.open(spec()).await.unwrap();
    assert_eq!(handle.status().state, TunnelState::Open);
    let endpoint = handle.endpoint();

    tunnels.close(&handle).await;
    tunnels.close(&handle).await;

    assert_eq!(connector.shutdowns.load(Ordering::SeqCst), 1);
    assert!(tunnels.list().await.is_empty());
    assert_eq!(endpoint.status().state, TunnelState::Closed);
    let err = endpoint.acquire(Duration::from_secs(1)).await.unwrap_err();
    assert!(err.to_string().contains("remote backend unreachable"), "got: {err}");
}

#[tokio::test(start_paused = true)]
async fn same_destination_reuses_the_live_tunnel() {
    let connector = FakeConnector::healthy();
    let tunnels = manager(connector.clone(), TunnelPolicy::default());

    let first = tunnels.open(spec()).await.unwrap();
    let mut other_auth = spec();
    other_auth.auth = AuthMethod::KeyFile {
        path: "~/.ssh/id_ed25519".into(),
    };
    let second = tunnels.open(other_auth).await.unwrap();

    assert_eq!(connector.attempt_count(), 1);
    assert_eq!(first.local_port(), second.local_port());
    assert_eq!(tunnels.list().await.len(), 1);
    assert_eq!(first.local_url(), format!("http://127.0.0.1:{}", first.local_port()));

    tunnels.close_all().await;
    assert!(tunnels.list().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn occupied_local_port_moves_to_the_next_free_one() {
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = blocker.local_addr().unwrap().port();

    let connector = FakeConnector::healthy();
    let tunnels = manager(connector.clone(), TunnelPolicy::default());
    let mut fixed = spec();
    fixed.local_port = Some(taken);

    let handle = tunnels.open(fixed).await.unwrap();
    assert!(handle.local_port() > taken);
    let attempts = connector.attempts.lock().unwrap().clone();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].1, handle.local_port());

    tunnels.close(&handle).await;
}

#[tokio::test(start_paused = true)]
async fn authentication_failure_is_not_retried() {
    let connector = FakeConnector::new(vec![ConnectPlan::AuthFailure], ConnectPlan::AuthFailure);
    let tunnels = manager(connector.clone(), TunnelPolicy::default());

    let err = tunnels.open(spec()).await.unwrap_err();
    assert!(matches!(err, AicliError::Authentication(_)), "got: {err:?}");

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.attempt_count(), 1);
    assert!(tunnels.list().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_health_checks_reconnect_with_backoff_then_give_up() {
    let connector = FakeConnector::new(vec![ConnectPlan::Healthy], ConnectPlan::Refused);
    let policy = TunnelPolicy {
        health_interval: Duration::from_secs(1),
        failure_threshold: 3,
        max_reconnects: 2,
        initial_backoff: Duration::from_secs(2),
        backoff_multiplier: 2.0,
        ..TunnelPolicy::default()
    };
    let tunnels = manager(connector.clone(), policy);

    let handle = tunnels.open(spec()).await.unwrap();
    let port = handle.local_port();
    let mut endpoint = handle.endpoint();
    connector.set_healthy(false);

    let mut seen = Vec::new();
    let final_status = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let Some(status) = endpoint.changed().await else {
                panic!("tunnel vanished before reaching error");
            };
            seen.push(status.state);
            if status.state == TunnelState::Error {
                return status;
            }
        }
    })
    .await
    .unwrap();

    assert!(seen.contains(&TunnelState::Degraded));
    let message = final_status.last_error.unwrap_or_default();
    assert!(message.contains("2 reconnect attempts failed"), "got: {message}");

    let attempts = connector.attempts.lock().unwrap().clone();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|(_, p)| *p == port));

    // Three failed checks one second apart, then a 2s backoff.
    let first_gap = attempts[1].0 - attempts[0].0;
    assert!(first_gap >= Duration::from_secs(5) && first_gap < Duration::from_millis(5100));
    let second_gap = attempts[2].0 - attempts[1].0;
    assert!(second_gap >= Duration::from_secs(4) && second_gap < Duration::from_millis(4100));

    let err = endpoint.acquire(Duration::from_secs(1)).await.unwrap_err();
    assert!(err.to_string().contains("remote backend unreachable"));

    tunnels.close(&handle).await;
}

#[tokio::test(start_paused = true)]
async fn tunnel_recovers_on_the_same_port() {
    let connector = FakeConnector::healthy();
    let policy = TunnelPolicy {
        health_interval: Duration::from_secs(1),
        initial_backoff: Duration::from_millis(500),
        ..TunnelPolicy::default()
    };
    let tunnels = manager(connector.clone(), policy);

    let handle = tunnels.open(spec()).await.unwrap();
    let mut endpoint = handle.endpoint();
    connector.set_healthy(false);

    let degraded = endpoint.changed().await.unwrap();
    assert_eq!(degraded.state, TunnelState::Degraded);
    connector.set_healthy(true);

    let recovered = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let status = endpoint.changed().await.unwrap();
            if status.state == TunnelState::Open {
                return status;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(recovered.local_port, Some(handle.local_port()));
    assert_eq!(connector.attempt_count(), 2);
    assert_eq!(
        endpoint.acquire(Duration::from_secs(1)).await.unwrap(),
        handle.local_port()
    );

    tunnels.close(&handle).await;
}
