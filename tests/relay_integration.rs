//! End-to-end allocation behavior over native UDP and the virtual network

mod common;

use common::{create_server_conn, create_test_socket, recv_within, udp_tuple, TestNet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use turn_relay::allocation::{AllocationManager, FiveTuple, ManagerConfig};
use turn_relay::net::{NativeNet, PacketConn};
use turn_relay::AllocationError;

fn native_manager() -> AllocationManager {
    AllocationManager::new(ManagerConfig {
        net: Some(Arc::new(NativeNet::default())),
        relay_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        encapsulator: None,
    })
}

fn test_manager(net: &Arc<TestNet>) -> AllocationManager {
    AllocationManager::new(ManagerConfig {
        net: Some(net.clone()),
        ..Default::default()
    })
}

async fn test_server_conn(net: &TestNet) -> Arc<dyn PacketConn> {
    Arc::new(
        net.virtual_net()
            .bind("0.0.0.0:3478".parse().unwrap())
            .await
            .unwrap(),
    )
}

fn virtual_tuple(net: &TestNet, client_port: u16) -> FiveTuple {
    let ip = net.virtual_net().ip();
    udp_tuple(SocketAddr::new(ip, client_port), SocketAddr::new(ip, 3478))
}

#[tokio::test]
async fn test_relays_peer_datagrams_to_client() {
    let manager = native_manager();
    let (server_conn, server_addr) = create_server_conn().await;
    let (client, client_addr) = create_test_socket().await;
    let tuple = udp_tuple(client_addr, server_addr);

    let allocation = assert_ok!(
        manager
            .create_allocation(Some(tuple), Some(server_conn), 0, Duration::from_secs(30))
            .await
    );

    let (peer, _) = create_test_socket().await;
    peer.send_to(b"hello client", allocation.relay_addr())
        .await
        .unwrap();

    let (data, from) = recv_within(&client, Duration::from_secs(1)).await.unwrap();
    assert_eq!(data, b"hello client");
    assert_eq!(from, server_addr);

    // And the other direction, through the relay conn
    let peer_addr = peer.local_addr().unwrap();
    assert_ok!(allocation.send_to_peer(b"hello peer", peer_addr).await);
    let (data, from) = recv_within(&peer, Duration::from_secs(1)).await.unwrap();
    assert_eq!(data, b"hello peer");
    assert_eq!(from, allocation.relay_addr());

    assert_ok!(manager.close().await);
}

#[tokio::test]
async fn test_lifetime_expiry_scenario() {
    let manager = native_manager();
    let (server_conn, server_addr) = create_server_conn().await;
    let (client, client_addr) = create_test_socket().await;
    let tuple = udp_tuple(client_addr, server_addr);

    let allocation = assert_ok!(
        manager
            .create_allocation(Some(tuple), Some(server_conn), 0, Duration::from_millis(50))
            .await
    );
    assert_ne!(allocation.relay_addr().port(), 0);

    let found = manager.get_allocation(&tuple).await.unwrap();
    assert!(Arc::ptr_eq(&found, &allocation));

    tokio::time::sleep(Duration::from_millis(60)).await;
    tokio::time::timeout(Duration::from_secs(1), allocation.closed())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), allocation.forwarder_stopped())
        .await
        .unwrap();

    // Datagrams to the expired relay address no longer reach the client
    let (peer, _) = create_test_socket().await;
    peer.send_to(b"too late", allocation.relay_addr())
        .await
        .unwrap();
    assert!(recv_within(&client, Duration::from_millis(100)).await.is_none());
    assert_eq!(allocation.stats().packets_to_client, 0);

    // The expired allocation is still registered until deleted
    assert!(manager.delete_allocation(&tuple).await);
    assert!(manager.get_allocation(&tuple).await.is_none());
}

#[tokio::test]
async fn test_delete_stops_relaying() {
    let manager = native_manager();
    let (server_conn, server_addr) = create_server_conn().await;
    let (client, client_addr) = create_test_socket().await;
    let tuple = udp_tuple(client_addr, server_addr);

    let allocation = assert_ok!(
        manager
            .create_allocation(Some(tuple), Some(server_conn), 0, Duration::from_secs(30))
            .await
    );

    assert!(manager.delete_allocation(&tuple).await);
    assert!(allocation.is_closed());
    tokio::time::timeout(Duration::from_secs(1), allocation.forwarder_stopped())
        .await
        .unwrap();

    let (peer, _) = create_test_socket().await;
    peer.send_to(b"nobody home", allocation.relay_addr())
        .await
        .unwrap();
    assert!(recv_within(&client, Duration::from_millis(100)).await.is_none());

    assert!(manager.get_allocation(&tuple).await.is_none());
    assert!(!manager.delete_allocation(&tuple).await);
}

#[tokio::test]
async fn test_expiry_releases_relay_port() {
    let manager = native_manager();
    let (server_conn, server_addr) = create_server_conn().await;
    let (_client, client_addr) = create_test_socket().await;
    let tuple = udp_tuple(client_addr, server_addr);

    let allocation = assert_ok!(
        manager
            .create_allocation(
                Some(tuple),
                Some(server_conn.clone()),
                0,
                Duration::from_millis(20),
            )
            .await
    );
    let relay_addr = allocation.relay_addr();
    assert!(std::net::UdpSocket::bind(relay_addr).is_err());

    tokio::time::timeout(Duration::from_secs(1), allocation.forwarder_stopped())
        .await
        .unwrap();
    assert!(allocation.is_closed());

    // Still registered and still referenced here, but the port is free
    assert!(manager.get_allocation(&tuple).await.is_some());
    let rebound = std::net::UdpSocket::bind(relay_addr);
    assert!(rebound.is_ok());
    drop(rebound);

    let (_other, other_addr) = create_test_socket().await;
    let reused = assert_ok!(
        manager
            .create_allocation(
                Some(udp_tuple(other_addr, server_addr)),
                Some(server_conn),
                relay_addr.port(),
                Duration::from_secs(30),
            )
            .await
    );
    assert_eq!(reused.relay_addr(), relay_addr);

    assert_ok!(manager.close().await);
}

#[tokio::test]
async fn test_delete_releases_relay_port() {
    let manager = native_manager();
    let (server_conn, server_addr) = create_server_conn().await;
    let (_client, client_addr) = create_test_socket().await;
    let tuple = udp_tuple(client_addr, server_addr);

    let allocation = assert_ok!(
        manager
            .create_allocation(Some(tuple), Some(server_conn), 0, Duration::from_secs(30))
            .await
    );
    let relay_addr = allocation.relay_addr();

    assert!(manager.delete_allocation(&tuple).await);
    tokio::time::timeout(Duration::from_secs(1), allocation.forwarder_stopped())
        .await
        .unwrap();

    assert!(std::net::UdpSocket::bind(relay_addr).is_ok());
}

#[tokio::test]
async fn test_expiry_with_failing_close_still_closes() {
    let net = Arc::new(TestNet::new());
    let manager = test_manager(&net);
    let server_conn = test_server_conn(&net).await;
    let tuple = virtual_tuple(&net, 5000);

    net.fail_close_of_next_conn();
    let allocation = assert_ok!(
        manager
            .create_allocation(Some(tuple), Some(server_conn), 0, Duration::from_millis(30))
            .await
    );

    tokio::time::timeout(Duration::from_secs(1), allocation.closed())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), allocation.forwarder_stopped())
        .await
        .unwrap();
    assert!(allocation.is_closed());
    assert_eq!(net.close_calls(), 1);

    // The failure is not retried on delete
    assert!(manager.delete_allocation(&tuple).await);
    assert_eq!(net.close_calls(), 1);
}

#[tokio::test]
async fn test_uniqueness_across_distinct_clients() {
    let manager = native_manager();
    let (server_conn, server_addr) = create_server_conn().await;
    let (_a, a_addr) = create_test_socket().await;
    let (_b, b_addr) = create_test_socket().await;

    let a = assert_ok!(
        manager
            .create_allocation(
                Some(udp_tuple(a_addr, server_addr)),
                Some(server_conn.clone()),
                0,
                Duration::from_secs(30),
            )
            .await
    );
    let b = assert_ok!(
        manager
            .create_allocation(
                Some(udp_tuple(b_addr, server_addr)),
                Some(server_conn.clone()),
                0,
                Duration::from_secs(30),
            )
            .await
    );
    assert_ne!(a.relay_addr(), b.relay_addr());

    let err = assert_err!(
        manager
            .create_allocation(
                Some(udp_tuple(a_addr, server_addr)),
                Some(server_conn),
                0,
                Duration::from_secs(30),
            )
            .await
    );
    assert!(matches!(err, AllocationError::DuplicateFiveTuple(_)));
    assert!(!a.is_closed());
    assert_eq!(manager.len().await, 2);

    assert_ok!(manager.close().await);
}

#[tokio::test]
async fn test_delete_and_expiry_race_releases_once() {
    let net = Arc::new(TestNet::new());
    let manager = test_manager(&net);
    let server_conn = test_server_conn(&net).await;

    for port in 5000..5020 {
        let tuple = virtual_tuple(&net, port);
        let allocation = assert_ok!(
            manager
                .create_allocation(
                    Some(tuple),
                    Some(server_conn.clone()),
                    0,
                    Duration::from_millis(5),
                )
                .await
        );

        // Land the delete as close to the expiry as possible
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(manager.delete_allocation(&tuple).await);
        assert!(allocation.is_closed());
        tokio::time::timeout(Duration::from_secs(1), allocation.forwarder_stopped())
            .await
            .unwrap();
    }

    // One relay conn close per allocation, whichever side won
    assert_eq!(net.close_calls(), 20);
}

#[tokio::test]
async fn test_close_attempts_every_allocation() {
    let net = Arc::new(TestNet::new());
    let manager = test_manager(&net);
    let server_conn = test_server_conn(&net).await;

    net.fail_close_of_next_conn();
    let failing = assert_ok!(
        manager
            .create_allocation(
                Some(virtual_tuple(&net, 5000)),
                Some(server_conn.clone()),
                0,
                Duration::from_secs(30),
            )
            .await
    );
    let healthy = assert_ok!(
        manager
            .create_allocation(
                Some(virtual_tuple(&net, 5001)),
                Some(server_conn),
                0,
                Duration::from_secs(30),
            )
            .await
    );

    let err = assert_err!(manager.close().await);
    match err {
        AllocationError::Shutdown { failures } => {
            assert_eq!(failures.len(), 1);
            assert!(matches!(
                &failures[0],
                AllocationError::Close { five_tuple, .. } if *five_tuple == virtual_tuple(&net, 5000)
            ));
        }
        other => panic!("unexpected error: {}", other),
    }

    // The failure does not leave the other allocation open
    assert!(failing.is_closed());
    assert!(healthy.is_closed());
    assert!(manager.is_empty().await);
    assert_eq!(net.close_calls(), 2);
}

#[tokio::test]
async fn test_delete_logs_close_failure_and_still_removes() {
    let net = Arc::new(TestNet::new());
    let manager = test_manager(&net);
    let server_conn = test_server_conn(&net).await;
    let tuple = virtual_tuple(&net, 5000);

    net.fail_close_of_next_conn();
    assert_ok!(
        manager
            .create_allocation(Some(tuple), Some(server_conn), 0, Duration::from_secs(30))
            .await
    );

    assert!(manager.delete_allocation(&tuple).await);
    assert!(manager.get_allocation(&tuple).await.is_none());
}

#[tokio::test]
async fn test_rejected_create_leaves_state_unchanged() {
    let net = Arc::new(TestNet::new());
    let manager = test_manager(&net);
    let server_conn = test_server_conn(&net).await;
    let tuple = virtual_tuple(&net, 5000);

    let err = assert_err!(
        manager
            .create_allocation(Some(tuple), Some(server_conn.clone()), 0, Duration::ZERO)
            .await
    );
    assert!(err.is_validation());
    assert!(manager.is_empty().await);

    // Retrying with corrected input succeeds
    assert_ok!(
        manager
            .create_allocation(Some(tuple), Some(server_conn), 0, Duration::from_secs(30))
            .await
    );
    assert_eq!(manager.len().await, 1);
}

#[tokio::test]
async fn test_refresh_keeps_allocation_alive() {
    let net = Arc::new(TestNet::new());
    let manager = test_manager(&net);
    let server_conn = test_server_conn(&net).await;
    let tuple = virtual_tuple(&net, 5000);

    let allocation = assert_ok!(
        manager
            .create_allocation(Some(tuple), Some(server_conn), 0, Duration::from_millis(100))
            .await
    );

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_ok!(allocation.refresh(Duration::from_millis(100)));
    }
    assert!(!allocation.is_closed());

    tokio::time::timeout(Duration::from_secs(1), allocation.closed())
        .await
        .unwrap();
    assert!(matches!(
        allocation.refresh(Duration::from_secs(1)),
        Err(AllocationError::AllocationClosed(_))
    ));
}
