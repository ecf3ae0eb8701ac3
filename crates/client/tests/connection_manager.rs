mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{client, client_with, settle, MockTransport, Outcome};
use notifier_client::{
    ClientCommand, ConnectionState, DisconnectReason, MarkerStore, MemoryStore, Notification,
    ServerEvent, TransportError,
};

fn server_closed(code: u16) -> DisconnectReason {
    DisconnectReason::ServerClosed {
        code: Some(code),
        reason: "going away".into(),
    }
}

fn network_error() -> Outcome {
    Outcome::Reject(TransportError::Network("connection refused".into()))
}

#[tokio::test(start_paused = true)]
async fn subscribers_share_one_connection() {
    let transport = MockTransport::new();
    let client = client(transport.clone());

    let subscriptions: Vec<_> = (0..10).map(|_| client.subscribe(|_| {})).collect();
    settle().await;

    assert_eq!(transport.connects(), 1);
    assert_eq!(transport.tokens(), vec!["secret".to_string()]);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.connection().connections_opened(), 1);
    drop(subscriptions);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_open_one_connection() {
    let transport = MockTransport::new();
    let client = Arc::new(client(transport.clone()));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let connection = client.connection().clone();
            tokio::spawn(async move { connection.get_or_create_connection("secret") })
        })
        .collect();
    for task in tasks {
        let state = task.await.unwrap();
        assert!(state.is_live());
    }

    let mut states = client.state_changes();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| s.is_connected()))
        .await
        .expect("connected in time")
        .expect("state channel open");
    assert_eq!(transport.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn empty_token_does_not_connect() {
    let transport = MockTransport::new();
    let client = client(transport.clone());

    let state = client.connection().get_or_create_connection("  ");
    settle().await;

    assert_eq!(state, ConnectionState::Disconnected);
    assert_eq!(transport.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn auth_rejection_short_circuits_until_reset() {
    let transport = MockTransport::scripted([Outcome::Reject(TransportError::Unauthorized(
        "HTTP 401".into(),
    ))]);
    let client = client(transport.clone());

    let _first = client.subscribe(|_| {});
    settle().await;
    assert_eq!(client.state(), ConnectionState::AuthFailed);
    assert_eq!(transport.connects(), 1);

    // No automatic retry, and every trigger is ignored.
    tokio::time::sleep(Duration::from_secs(60)).await;
    client.ensure_connected();
    client.on_became_active();
    let _second = client.subscribe(|_| {});
    settle().await;
    assert_eq!(transport.connects(), 1);

    // Disconnecting does not lift the failure.
    client.disconnect_all();
    client.ensure_connected();
    settle().await;
    assert_eq!(transport.connects(), 1);
    assert!(client.connection().is_auth_failed());

    client.reset_auth_failure();
    assert!(!client.connection().is_auth_failed());
    assert_eq!(client.state(), ConnectionState::Disconnected);

    client.ensure_connected();
    settle().await;
    assert_eq!(transport.connects(), 2);
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn auth_close_code_is_an_auth_failure() {
    let transport = MockTransport::new();
    let client = client(transport.clone());
    let _sub = client.subscribe(|_| {});
    settle().await;

    transport.session(0).close(server_closed(4001));
    settle().await;
    assert_eq!(client.state(), ConnectionState::AuthFailed);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_error_event_is_an_auth_failure() {
    let transport = MockTransport::new();
    let client = client(transport.clone());
    let _sub = client.subscribe(|_| {});
    settle().await;

    let session = transport.session(0);
    session.send(ServerEvent::Error {
        code: "unauthorized".into(),
        message: "token expired".into(),
        correlation_id: None,
    });
    settle().await;
    assert_eq!(client.state(), ConnectionState::AuthFailed);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn other_error_events_keep_the_connection() {
    let transport = MockTransport::new();
    let client = client(transport.clone());
    let _sub = client.subscribe(|_| {});
    settle().await;

    let session = transport.session(0);
    session.send(ServerEvent::Error {
        code: "rate_limited".into(),
        message: "slow down".into(),
        correlation_id: None,
    });
    settle().await;
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn retries_stop_after_five_attempts() {
    let transport = MockTransport::scripted((0..6).map(|_| network_error()));
    let client = client(transport.clone());
    let _sub = client.subscribe(|_| {});

    settle().await;
    assert_eq!(transport.connects(), 1);
    assert_eq!(client.state(), ConnectionState::Connecting);

    // Backoff: 1000ms, then 1500ms.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(transport.connects(), 1);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(transport.connects(), 2);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(transport.connects(), 3);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.connects(), 6);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(!client.connection().is_auth_failed());

    // An external trigger starts over.
    client.ensure_connected();
    settle().await;
    assert_eq!(transport.connects(), 7);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.connection().reconnect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_counts_as_a_failed_attempt() {
    let transport = MockTransport::scripted([Outcome::Hang]);
    let client = client(transport.clone());
    let _sub = client.subscribe(|_| {});

    tokio::time::sleep(Duration::from_secs(19)).await;
    assert_eq!(transport.connects(), 1);
    assert_eq!(client.state(), ConnectionState::Connecting);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(transport.connects(), 2);
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn server_close_reconnects_after_one_second() {
    let transport = MockTransport::new();
    let client = client(transport.clone());
    let _sub = client.subscribe(|_| {});
    settle().await;

    transport.session(0).close(server_closed(1001));
    settle().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(transport.connects(), 1);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(transport.connects(), 2);
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn external_trigger_replaces_a_pending_reconnect() {
    let transport = MockTransport::new();
    let client = client(transport.clone());
    let _sub = client.subscribe(|_| {});
    settle().await;

    transport
        .session(0)
        .close(DisconnectReason::TransportLost("reset by peer".into()));
    settle().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);

    client.on_became_active();
    settle().await;
    assert_eq!(transport.connects(), 2);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.connects(), 2);
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_reconnecting() {
    let transport = MockTransport::new();
    let client = client(transport.clone());
    let _sub = client.subscribe(|_| {});
    settle().await;
    let session = transport.session(0);

    client.disconnect_all();
    session.close(server_closed(1001));
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(transport.connects(), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn backlog_requested_once_per_connection() {
    let transport = MockTransport::new();
    let store: Arc<dyn MarkerStore> = Arc::new(MemoryStore::new());
    let client = client_with(transport.clone(), store.clone());
    let _sub = client.subscribe(|_| {});
    settle().await;

    // Nothing seen yet, so nothing to ask for.
    let mut first = transport.session(0);
    assert!(first.commands().is_empty());

    first.push(Notification::new("n9"));
    first.push(Notification::new("n10"));
    settle().await;
    assert_eq!(store.get("notifications_last_seen").as_deref(), Some("n10"));

    first.close(server_closed(1012));
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(transport.connects(), 2);

    let mut second = transport.session(1);
    assert_eq!(
        second.commands(),
        vec![ClientCommand::FetchMissedNotifications {
            last_seen_id: "n10".into()
        }]
    );

    client.ensure_connected();
    settle().await;
    assert!(second.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn persisted_marker_survives_restart() {
    let transport = MockTransport::new();
    let store: Arc<dyn MarkerStore> = Arc::new(MemoryStore::new());
    store.set("notifications_last_seen", "n41");

    let client = client_with(transport.clone(), store);
    let _sub = client.subscribe(|_| {});
    settle().await;

    let mut session = transport.session(0);
    assert_eq!(
        session.commands(),
        vec![ClientCommand::FetchMissedNotifications {
            last_seen_id: "n41".into()
        }]
    );
    assert_eq!(client.stats().await.last_seen.as_deref(), Some("n41"));
}
