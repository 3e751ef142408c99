mod common;

use bytes::Bytes;
use common::*;
use std::sync::Arc;
use std::time::Duration;
use trellis_common::{Cap, DisconnectReason, Node};
use trellisd::discovery::MemoryDiscovery;
use trellisd::transport::{Frame, Transport, TransportError};
use trellisd::PeerEventKind;

#[tokio::test]
async fn self_dial_never_produces_a_peer() {
    let server = start_server(base_config(1)).await;
    let addr = server.listen_addr().unwrap();

    let self_node = Node::new(server.local_id(), addr.ip(), addr.port());
    server.add_peer(self_node).await;

    // Dial attempts run (and repeat after the cooldown); every one dies
    // at gate 1.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(server.peer_count().await, 0);

    server.stop().await;
}

#[tokio::test]
async fn peer_cap_rejects_the_third_connection() {
    let mut config = base_config(1);
    config.max_peers = 2;
    let server = start_server(config).await;
    let addr = server.listen_addr().unwrap();
    let mut events = server.subscribe_events();

    let _a = TestClient::connect(addr, key(2)).await.unwrap();
    wait_for_event(&mut events, PeerEventKind::Add, Duration::from_secs(5)).await;
    let _b = TestClient::connect(addr, key(3)).await.unwrap();
    wait_for_event(&mut events, PeerEventKind::Add, Duration::from_secs(5)).await;

    match TestClient::connect(addr, key(4)).await {
        Err(TransportError::Disconnected(DisconnectReason::TooManyPeers)) => {}
        Ok(_) => panic!("third connection should be rejected"),
        Err(other) => panic!("expected too-many-peers, got {other}"),
    }

    assert_eq!(server.peer_count().await, 2);
    server.stop().await;
}

#[tokio::test]
async fn trusted_nodes_bypass_the_cap() {
    let trusted_key = key(4);
    let mut config = base_config(1);
    config.max_peers = 2;
    config.trusted_nodes = vec![Node::new(
        trusted_key.node_id(),
        "127.0.0.1".parse().unwrap(),
        0,
    )];
    let server = start_server(config).await;
    let addr = server.listen_addr().unwrap();
    let mut events = server.subscribe_events();

    let _a = TestClient::connect(addr, key(2)).await.unwrap();
    wait_for_event(&mut events, PeerEventKind::Add, Duration::from_secs(5)).await;
    let _b = TestClient::connect(addr, key(3)).await.unwrap();
    wait_for_event(&mut events, PeerEventKind::Add, Duration::from_secs(5)).await;

    let _c = TestClient::connect(addr, trusted_key).await.unwrap();
    wait_for_event(&mut events, PeerEventKind::Add, Duration::from_secs(5)).await;

    assert_eq!(server.peer_count().await, 3);
    server.stop().await;
}

#[tokio::test]
async fn duplicate_identifiers_collapse_to_one_peer() {
    let server = start_server(base_config(1)).await;
    let addr = server.listen_addr().unwrap();
    let mut events = server.subscribe_events();

    let dup = key(7);
    let (first, second) = tokio::join!(
        TestClient::connect(addr, dup.clone()),
        TestClient::connect(addr, dup.clone()),
    );

    // The loser is turned away with "already connected" — at gate 1
    // (connect fails) or at gate 2 (connect succeeds, disconnect frame
    // follows).
    let mut winners = Vec::new();
    let mut rejected = 0;
    for result in [first, second] {
        match result {
            Ok(client) => winners.push(client),
            Err(TransportError::Disconnected(DisconnectReason::AlreadyConnected)) => rejected += 1,
            Err(other) => panic!("unexpected connect error: {other}"),
        }
    }
    if winners.len() == 2 {
        let mut late_rejects = 0;
        for client in &mut winners {
            if client.try_recv_disconnect(Duration::from_secs(1)).await
                == Some(DisconnectReason::AlreadyConnected)
            {
                late_rejects += 1;
            }
        }
        assert_eq!(late_rejects, 1, "exactly one side must lose the race");
    } else {
        assert_eq!(rejected, 1);
    }

    wait_for_event(&mut events, PeerEventKind::Add, Duration::from_secs(5)).await;
    wait_peer_count(&server, 1, Duration::from_secs(5)).await;

    // No second add and no drops after the dust settles.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut extra_adds = 0;
    let mut drops = 0;
    while let Ok(event) = events.try_recv() {
        match event.kind {
            PeerEventKind::Add => extra_adds += 1,
            PeerEventKind::Drop => drops += 1,
            _ => {}
        }
    }
    assert_eq!(extra_adds, 0);
    assert_eq!(drops, 0);

    server.stop().await;
}

#[tokio::test]
async fn static_nodes_reconnect_after_the_remote_dies() {
    let server_b = start_server(base_config(9)).await;
    let addr_b = server_b.listen_addr().unwrap();
    let node_b = Node::new(server_b.local_id(), addr_b.ip(), addr_b.port());

    let mut config_a = base_config(1);
    config_a.static_nodes = vec![node_b];
    let server_a = start_server(config_a).await;
    let mut events = server_a.subscribe_events();

    wait_for_event(&mut events, PeerEventKind::Add, Duration::from_secs(5)).await;

    // Kill the remote; the static peer drops.
    server_b.stop().await;
    wait_for_event(&mut events, PeerEventKind::Drop, Duration::from_secs(10)).await;

    // Bring it back on the same endpoint with the same identity; the
    // scheduler redials once the failure cooldown elapses.
    let mut config_b2 = base_config(9);
    config_b2.listen_addr = Some(addr_b);
    let server_b2 = start_server(config_b2).await;

    wait_for_event(&mut events, PeerEventKind::Add, Duration::from_secs(10)).await;
    assert_eq!(server_a.peer_count().await, 1);

    server_a.stop().await;
    server_b2.stop().await;
}

#[tokio::test]
async fn discovery_candidates_are_dialed_dynamically() {
    let server_b = start_server(base_config(9)).await;
    let addr_b = server_b.listen_addr().unwrap();
    let node_b = Node::new(server_b.local_id(), addr_b.ip(), addr_b.port());

    let mut config_a = base_config(1);
    config_a.no_discovery = false;
    config_a.max_dial = 4;
    config_a.discovery = Some(Arc::new(MemoryDiscovery::new(
        Node::new(key(1).node_id(), "127.0.0.1".parse().unwrap(), 0),
        vec![node_b],
    )));
    let server_a = start_server(config_a).await;
    let mut events = server_a.subscribe_events();

    // A lookup task refills the candidate pool, then a dynamic dial
    // lands on B.
    let added = wait_for_event(&mut events, PeerEventKind::Add, Duration::from_secs(5)).await;
    assert_eq!(added.peer, server_b.local_id());
    assert_eq!(server_a.peer_count().await, 1);

    server_a.stop().await;
    server_b.stop().await;
}

#[tokio::test]
async fn remove_peer_disconnects_and_stops_redialing() {
    let server_b = start_server(base_config(9)).await;
    let addr_b = server_b.listen_addr().unwrap();
    let node_b = Node::new(server_b.local_id(), addr_b.ip(), addr_b.port());

    let mut config_a = base_config(1);
    config_a.static_nodes = vec![node_b];
    let server_a = start_server(config_a).await;
    let mut events = server_a.subscribe_events();
    wait_for_event(&mut events, PeerEventKind::Add, Duration::from_secs(5)).await;

    server_a.remove_peer(node_b).await;
    let drop = wait_for_event(&mut events, PeerEventKind::Drop, Duration::from_secs(5)).await;
    assert_eq!(drop.error.as_deref(), Some("disconnect requested"));

    // Well past several cooldown rounds, still no reconnect.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(server_a.peer_count().await, 0);

    server_a.stop().await;
    server_b.stop().await;
}

#[tokio::test]
async fn peers_without_a_shared_protocol_are_useless() {
    let server = start_server(base_config(1)).await;
    let addr = server.listen_addr().unwrap();

    let mut client =
        TestClient::connect_with_caps(addr, key(2), vec![Cap::new("other", 9)])
            .await
            .unwrap();
    assert_eq!(
        client.try_recv_disconnect(Duration::from_secs(5)).await,
        Some(DisconnectReason::UselessPeer)
    );
    assert_eq!(server.peer_count().await, 0);

    server.stop().await;
}

#[tokio::test]
async fn add_event_precedes_snapshot_presence_and_drop_absence() {
    let server = start_server(base_config(1)).await;
    let addr = server.listen_addr().unwrap();
    let mut events = server.subscribe_events();

    let client = TestClient::connect(addr, key(2)).await.unwrap();
    assert_eq!(client.server_id, server.local_id());
    let added = wait_for_event(&mut events, PeerEventKind::Add, Duration::from_secs(5)).await;
    assert_eq!(added.peer, client.id);
    assert_eq!(added.num_peers, Some(1));
    let snapshot = server.peers().await;
    assert!(snapshot.iter().any(|p| p.id == client.id.to_string()));

    client.close(DisconnectReason::Requested).await;
    let dropped = wait_for_event(&mut events, PeerEventKind::Drop, Duration::from_secs(5)).await;
    assert_eq!(dropped.peer, added.peer);
    assert_eq!(dropped.num_peers, Some(0));
    wait_peer_count(&server, 0, Duration::from_secs(5)).await;
    assert!(server.peers().await.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn graceful_shutdown_under_load() {
    let mut config = base_config(1);
    config.max_peers = 60;
    let server = start_server(config).await;
    let addr = server.listen_addr().unwrap();

    let mut clients = Vec::new();
    for i in 0..10u8 {
        clients.push(TestClient::connect(addr, key(100 + i)).await.unwrap());
    }
    wait_peer_count(&server, 10, Duration::from_secs(5)).await;

    tokio::time::timeout(Duration::from_secs(10), server.stop())
        .await
        .expect("stop must return in bounded time");

    assert_eq!(server.peer_count().await, 0);
    for mut client in clients {
        assert_eq!(
            client.try_recv_disconnect(Duration::from_secs(2)).await,
            Some(DisconnectReason::QuittingServer)
        );
    }
}

#[tokio::test]
async fn handshakes_in_flight_during_stop_fail_cleanly() {
    let server = start_server(base_config(1)).await;
    let addr = server.listen_addr().unwrap();

    // Open raw sockets that never speak; their handshake runners are
    // parked reading the identity frame when stop arrives.
    let mut idle = Vec::new();
    for _ in 0..5 {
        idle.push(tokio::net::TcpStream::connect(addr).await.unwrap());
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(10), server.stop())
        .await
        .expect("stop must not wait for parked handshakes");
    assert_eq!(server.peer_count().await, 0);
}

#[tokio::test]
async fn sub_protocol_messages_route_and_echo() {
    let mut config = base_config(1);
    config.enable_msg_events = true;
    let server = start_server(config).await;
    let addr = server.listen_addr().unwrap();
    let mut events = server.subscribe_events();

    let mut client = TestClient::connect(addr, key(2)).await.unwrap();
    wait_for_event(&mut events, PeerEventKind::Add, Duration::from_secs(5)).await;

    // First sub-protocol code sits right above the base range.
    client
        .transport
        .write_frame(Frame::new(16, Bytes::from_static(b"over the wire")))
        .await
        .unwrap();
    let echoed = client.recv_msg(Duration::from_secs(5)).await;
    assert_eq!(echoed.code, 16);
    assert_eq!(&echoed.data[..], b"over the wire");

    wait_for_event(&mut events, PeerEventKind::MsgRecv, Duration::from_secs(5)).await;
    wait_for_event(&mut events, PeerEventKind::MsgSend, Duration::from_secs(5)).await;

    server.stop().await;
}

#[tokio::test]
async fn peers_info_is_sorted_and_known_nodes_remember_hellos() {
    let mut config = base_config(1);
    config.max_peers = 10;
    let server = start_server(config).await;
    let addr = server.listen_addr().unwrap();

    let _a = TestClient::connect(addr, key(2)).await.unwrap();
    let _b = TestClient::connect(addr, key(3)).await.unwrap();
    let _c = TestClient::connect(addr, key(4)).await.unwrap();
    wait_peer_count(&server, 3, Duration::from_secs(5)).await;

    let infos = server.peers_info().await;
    assert_eq!(infos.len(), 3);
    let ids: Vec<&String> = infos.iter().map(|p| &p.id).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
    assert!(infos.iter().all(|p| p.network.inbound));

    let known = server.known_nodes();
    assert_eq!(known.len(), 3);
    assert!(known.windows(2).all(|w| w[0].node_id <= w[1].node_id));
    assert!(known
        .iter()
        .all(|e| e.info.observation.client_name == "test-client"));

    server.stop().await;
}

#[tokio::test]
async fn second_start_fails_and_api_is_safe_after_stop() {
    let server = start_server(base_config(1)).await;
    assert!(matches!(
        server.start().await,
        Err(trellisd::ServerError::AlreadyRunning)
    ));

    server.stop().await;
    assert_eq!(server.peer_count().await, 0);
    assert!(server.peers().await.is_empty());
    assert!(server.self_node().id.is_zero());
}
