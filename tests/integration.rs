//! Integration tests for end-to-end estimate collaboration.
//!
//! These tests start a real server and connect real clients, verifying the
//! full pipeline: handshake, room membership, pricing broadcast with
//! confirmation, presence, and heartbeat.

use estimate_collab::bus::{EventBus, EventFilter};
use estimate_collab::connection::{ClientConfig, ClientError, ClientEvent, ConnectionManager};
use estimate_collab::optimistic::{OptimisticCoordinator, UpdateNotice};
use estimate_collab::protocol::{
    room_for_estimate, Envelope, EventType, PricingUpdate, UserIdentity,
};
use estimate_collab::server::{CollabServer, ServerConfig};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::time::{timeout, Duration};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port.
async fn start_test_server() -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        heartbeat_interval_secs: 1,
        ..ServerConfig::default()
    };
    let server = CollabServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

fn client_config(port: u16) -> ClientConfig {
    ClientConfig {
        server_url: format!("ws://127.0.0.1:{port}"),
        handshake_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    }
}

/// Poll until `check` passes or the deadline hits.
async fn wait_for(check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(Instant::now() < deadline, "condition not met within 3s");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_handshake() {
    let port = start_test_server().await;
    let bus = Arc::new(EventBus::with_defaults());
    let manager = ConnectionManager::new(client_config(port), bus);
    let mut events = manager.take_event_rx().unwrap();

    manager
        .connect("token", UserIdentity::new("Alice", "estimator"))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(2), events.recv()).await;
    assert!(event.is_ok(), "Should receive event within timeout");
    match event.unwrap() {
        Some(ClientEvent::Connected) => {}
        other => panic!("Expected Connected event, got {other:?}"),
    }
    assert!(manager.is_connected());
    assert!(manager.connection_id().is_some());
}

#[tokio::test]
async fn test_auth_rejection_is_fatal() {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    let server = CollabServer::with_verifier(config, Arc::new(|token: &str| token == "secret"));
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let bus = Arc::new(EventBus::with_defaults());
    let manager = ConnectionManager::new(client_config(port), bus);
    let result = manager
        .connect("wrong", UserIdentity::new("Mallory", "estimator"))
        .await;

    match result {
        Err(ClientError::Authentication(_)) => {}
        other => panic!("Expected Authentication error, got {other:?}"),
    }
    assert!(!manager.is_connected());
}

#[tokio::test]
async fn test_presence_broadcast_on_join() {
    let port = start_test_server().await;
    let room = room_for_estimate("42");

    // Client 1 joins first and watches presence events for the room.
    let bus1 = Arc::new(EventBus::with_defaults());
    let seen: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus1.subscribe_filtered(
        vec![EventType::Presence],
        None,
        Some(EventFilter::room(&room)),
        Arc::new(move |e: &Envelope| sink.lock().unwrap().push(e.clone())),
    );

    let manager1 = ConnectionManager::new(client_config(port), bus1);
    let mut events1 = manager1.take_event_rx().unwrap();
    manager1
        .connect("token", UserIdentity::new("Alice", "estimator"))
        .await
        .unwrap();
    let _ = timeout(Duration::from_secs(1), events1.recv()).await; // Connected
    manager1.join_room(&room);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Client 2 joins the same room.
    let bus2 = Arc::new(EventBus::with_defaults());
    let manager2 = ConnectionManager::new(client_config(port), bus2);
    manager2
        .connect("token", UserIdentity::new("Bob", "estimator"))
        .await
        .unwrap();
    manager2.join_room(&room);

    // Client 1 should see Bob's user-joined presence event.
    let seen_check = seen.clone();
    wait_for(move || {
        seen_check
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.subtype.as_deref() == Some("user-joined"))
    })
    .await;
}

#[tokio::test]
async fn test_pricing_update_confirmed_and_broadcast() {
    let port = start_test_server().await;
    let room = room_for_estimate("contract-7");

    // Client 1: sender with an optimistic coordinator.
    let bus1 = Arc::new(EventBus::with_defaults());
    let manager1 = ConnectionManager::new(client_config(port), bus1.clone());
    let coordinator = Arc::new(OptimisticCoordinator::with_defaults(bus1.clone()));
    let mut notices = coordinator.take_notices().unwrap();
    manager1.attach_coordinator(coordinator.clone());

    let alice = UserIdentity::new("Alice", "estimator");
    let alice_id = alice.user_id;
    manager1.connect("token", alice).await.unwrap();
    manager1.join_room(&room);

    // Client 2: receiver with a pricing subscription.
    let bus2 = Arc::new(EventBus::with_defaults());
    let received: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    bus2.subscribe(
        vec![EventType::Pricing],
        Arc::new(move |e: &Envelope| sink.lock().unwrap().push(e.clone())),
    );
    let manager2 = ConnectionManager::new(client_config(port), bus2);
    manager2
        .connect("token", UserIdentity::new("Bob", "estimator"))
        .await
        .unwrap();
    manager2.join_room(&room);
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Alice edits a price optimistically.
    let update_id = coordinator
        .apply(alice_id, &room, "svc-1", "unit_price", 150.0, 120.0, Instant::now())
        .unwrap();

    // Applied notice first, then a server confirmation.
    match timeout(Duration::from_secs(2), notices.recv()).await {
        Ok(Some(UpdateNotice::Applied { update })) => {
            assert_eq!(update.update_id, update_id);
            assert_eq!(update.value, 150.0);
        }
        other => panic!("Expected Applied notice, got {other:?}"),
    }
    match timeout(Duration::from_secs(2), notices.recv()).await {
        Ok(Some(UpdateNotice::Confirmed { update_id: id, sequence })) => {
            assert_eq!(id, update_id);
            assert!(sequence >= 1);
        }
        other => panic!("Expected Confirmed notice, got {other:?}"),
    }
    assert_eq!(coordinator.pending_count(), 0);

    // Bob sees the pricing envelope with the server-stamped sender.
    let received_check = received.clone();
    wait_for(move || !received_check.lock().unwrap().is_empty()).await;
    let envelopes = received.lock().unwrap();
    let envelope = &envelopes[0];
    assert_eq!(envelope.user_id, Some(alice_id));
    assert_eq!(envelope.room_id.as_deref(), Some(room.as_str()));
    let update = PricingUpdate::decode(&envelope.payload).unwrap();
    assert_eq!(update.service_id, "svc-1");
    assert_eq!(update.value, 150.0);
}

#[tokio::test]
async fn test_sender_excluded_from_own_broadcast() {
    let port = start_test_server().await;
    let room = room_for_estimate("9");

    let bus = Arc::new(EventBus::with_defaults());
    let echoed: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
    let counter = echoed.clone();
    // Only remote dispatch hits subscriptions here because nothing else
    // emits locally on this bus.
    bus.subscribe(
        vec![EventType::Pricing],
        Arc::new(move |_e: &Envelope| *counter.lock().unwrap() += 1),
    );

    let manager = ConnectionManager::new(client_config(port), bus.clone());
    let mut events = manager.take_event_rx().unwrap();
    manager
        .connect("token", UserIdentity::new("Alice", "estimator"))
        .await
        .unwrap();
    let _ = timeout(Duration::from_secs(1), events.recv()).await; // Connected
    manager.join_room(&room);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let envelope = PricingUpdate::new(uuid::Uuid::new_v4(), "svc-2", "quantity", 3.0)
        .into_envelope(uuid::Uuid::new_v4(), &room)
        .unwrap();
    manager.send_envelope(envelope).unwrap();

    // The sender must not receive its own event back.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*echoed.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_unconfirmed_update_rolls_back() {
    // No server involved: an update that never gets confirmed must roll
    // back deterministically once its deadline passes.
    let bus = Arc::new(EventBus::with_defaults());
    let coordinator = OptimisticCoordinator::with_defaults(bus);
    let mut notices = coordinator.take_notices().unwrap();

    let base = Instant::now();
    let update_id = coordinator
        .apply(
            uuid::Uuid::new_v4(),
            "estimate_1",
            "svc-1",
            "unit_price",
            99.0,
            80.0,
            base,
        )
        .unwrap();

    let rolled = coordinator.sweep(base + Duration::from_secs(6));
    assert_eq!(rolled, vec![update_id]);

    match notices.try_recv() {
        Ok(UpdateNotice::Applied { .. }) => {}
        other => panic!("Expected Applied notice, got {other:?}"),
    }
    match notices.try_recv() {
        Ok(UpdateNotice::RolledBack { update_id: id, snapshot }) => {
            assert_eq!(id, update_id);
            assert_eq!(snapshot.value, 80.0);
        }
        other => panic!("Expected RolledBack notice, got {other:?}"),
    }
}

#[tokio::test]
async fn test_heartbeat_ping_pong() {
    // The server advertises a 1s heartbeat interval (see start_test_server),
    // so a latency sample should arrive within a few seconds.
    let port = start_test_server().await;
    let bus = Arc::new(EventBus::with_defaults());
    let manager = ConnectionManager::new(client_config(port), bus);
    let mut events = manager.take_event_rx().unwrap();
    manager
        .connect("token", UserIdentity::new("PingUser", "estimator"))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "no heartbeat within 5s");
        match timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(ClientEvent::Ping { latency })) => {
                assert!(latency < Duration::from_secs(2));
                break;
            }
            Ok(Some(_)) => continue,
            other => panic!("Event stream ended unexpectedly: {other:?}"),
        }
    }

    let health = manager.health();
    assert!(health.connected);
    assert!(health.ping.is_some());
}

#[tokio::test]
async fn test_disconnect_is_clean() {
    let port = start_test_server().await;
    let bus = Arc::new(EventBus::with_defaults());
    let manager = ConnectionManager::new(client_config(port), bus);
    let mut events = manager.take_event_rx().unwrap();
    manager
        .connect("token", UserIdentity::new("Alice", "estimator"))
        .await
        .unwrap();
    let _ = timeout(Duration::from_secs(1), events.recv()).await; // Connected

    manager.disconnect();

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        assert!(Instant::now() < deadline, "no Disconnected event within 3s");
        match timeout(Duration::from_secs(3), events.recv()).await {
            Ok(Some(ClientEvent::Disconnected { .. })) => break,
            Ok(Some(ClientEvent::Reconnecting { .. })) => {
                panic!("Intentional disconnect must not trigger reconnection")
            }
            Ok(Some(_)) => continue,
            other => panic!("Event stream ended unexpectedly: {other:?}"),
        }
    }
    assert!(!manager.is_connected());
}

#[tokio::test]
async fn test_disconnect_releases_server_connection() {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    let server = CollabServer::new(config);
    let stats = server.stats();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let bus = Arc::new(EventBus::with_defaults());
    let manager = ConnectionManager::new(client_config(port), bus);
    let mut events = manager.take_event_rx().unwrap();
    manager
        .connect("token", UserIdentity::new("Alice", "estimator"))
        .await
        .unwrap();
    let _ = timeout(Duration::from_secs(1), events.recv()).await; // Connected

    let stats_check = stats.clone();
    wait_for(move || stats_check.active_connections() == 1).await;

    manager.disconnect();

    // The server must observe the close handshake right away, not after
    // heartbeat failures accumulate.
    let stats_check = stats.clone();
    wait_for(move || stats_check.active_connections() == 0).await;
}

#[tokio::test]
async fn test_reconnects_after_server_restart_and_rejoins() {
    let port = free_port().await;
    let bind = format!("127.0.0.1:{port}");
    let room = room_for_estimate("77");

    // The first server instance runs on its own runtime so it can be torn
    // down wholesale, dropping every live connection.
    let first_rt = tokio::runtime::Runtime::new().unwrap();
    let server = CollabServer::new(ServerConfig {
        bind_addr: bind.clone(),
        ..ServerConfig::default()
    });
    first_rt.spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let bus = Arc::new(EventBus::with_defaults());
    let manager = ConnectionManager::new(
        ClientConfig {
            base_reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_millis(400),
            ..client_config(port)
        },
        bus,
    );
    let mut events = manager.take_event_rx().unwrap();
    manager
        .connect("token", UserIdentity::new("Alice", "estimator"))
        .await
        .unwrap();
    let _ = timeout(Duration::from_secs(1), events.recv()).await; // Connected
    manager.join_room(&room);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Kill the first server; every socket drops.
    first_rt.shutdown_background();

    // Client notices the drop and starts climbing the backoff ladder.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "no Reconnecting event within 5s");
        match timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(ClientEvent::Reconnecting { attempt })) => {
                assert!(attempt >= 1);
                break;
            }
            Ok(Some(_)) => continue,
            other => panic!("Event stream ended unexpectedly: {other:?}"),
        }
    }

    // Restart on the same port.
    let server = CollabServer::new(ServerConfig {
        bind_addr: bind,
        ..ServerConfig::default()
    });
    let registry = server.registry();
    tokio::spawn(async move {
        // Rebinding can transiently fail while the old listener's port clears.
        while server.run().await.is_err() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    // Reconnects and re-joins the room it was in.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        assert!(Instant::now() < deadline, "no reconnect within 10s");
        match timeout(Duration::from_secs(10), events.recv()).await {
            Ok(Some(ClientEvent::Connected)) => break,
            Ok(Some(_)) => continue,
            other => panic!("Event stream ended unexpectedly: {other:?}"),
        }
    }
    let deadline = Instant::now() + Duration::from_secs(3);
    while registry.member_count(&room).await != 1 {
        assert!(Instant::now() < deadline, "room not re-joined within 3s");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(manager.is_connected());
    assert_eq!(manager.health().reconnect_attempts, 0);
}

#[tokio::test]
async fn test_reconnect_gives_up_after_attempt_cap() {
    let port = free_port().await;
    let first_rt = tokio::runtime::Runtime::new().unwrap();
    let server = CollabServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    });
    first_rt.spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let bus = Arc::new(EventBus::with_defaults());
    let manager = ConnectionManager::new(
        ClientConfig {
            base_reconnect_delay: Duration::from_millis(50),
            max_reconnect_delay: Duration::from_millis(100),
            max_reconnect_attempts: 2,
            ..client_config(port)
        },
        bus,
    );
    let mut events = manager.take_event_rx().unwrap();
    manager
        .connect("token", UserIdentity::new("Alice", "estimator"))
        .await
        .unwrap();
    let _ = timeout(Duration::from_secs(1), events.recv()).await; // Connected

    first_rt.shutdown_background();

    // Two attempts against a dead server, then the ladder gives up.
    let mut attempts = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "ladder did not finish within 5s");
        match timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(ClientEvent::Reconnecting { attempt })) => attempts.push(attempt),
            Ok(Some(ClientEvent::MaxReconnectAttemptsReached)) => break,
            Ok(Some(_)) => continue,
            other => panic!("Event stream ended unexpectedly: {other:?}"),
        }
    }
    assert_eq!(attempts, vec![1, 2]);
    assert!(!manager.is_connected());
    assert!(!manager.health().reconnecting);
}

#[tokio::test]
async fn test_room_isolation() {
    let port = start_test_server().await;
    let room_a = room_for_estimate("a");
    let room_b = room_for_estimate("b");

    let bus1 = Arc::new(EventBus::with_defaults());
    let received: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
    let counter = received.clone();
    bus1.subscribe(
        vec![EventType::Pricing],
        Arc::new(move |_e: &Envelope| *counter.lock().unwrap() += 1),
    );
    let manager1 = ConnectionManager::new(client_config(port), bus1);
    manager1
        .connect("token", UserIdentity::new("Alice", "estimator"))
        .await
        .unwrap();
    manager1.join_room(&room_a);

    let bus2 = Arc::new(EventBus::with_defaults());
    let manager2 = ConnectionManager::new(client_config(port), bus2);
    manager2
        .connect("token", UserIdentity::new("Bob", "estimator"))
        .await
        .unwrap();
    manager2.join_room(&room_b);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Bob posts into room B; Alice (room A) must not see it.
    let envelope = PricingUpdate::new(uuid::Uuid::new_v4(), "svc-3", "unit_price", 10.0)
        .into_envelope(uuid::Uuid::new_v4(), &room_b)
        .unwrap();
    manager2.send_envelope(envelope).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*received.lock().unwrap(), 0);
}
