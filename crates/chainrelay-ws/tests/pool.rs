//! Failover pool behaviour against a scripted transport.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use chainrelay_core::{HealthStatus, TransportError};
use chainrelay_ws::{
    ConnectionHandle, ConnectionPool, ConnectionState, Endpoint, Frame, PoolConfig, Topic,
};
use common::{fast_config, forwarding_listener, keep_alive, Dial, MockConnector};

const A: &str = "ws://node-a";
const B: &str = "ws://node-b";
const C: &str = "ws://node-c";

fn config(max_reconnect_attempts: u32) -> PoolConfig {
    PoolConfig {
        connection: fast_config(max_reconnect_attempts),
        ..PoolConfig::default()
    }
}

fn endpoints(urls: &[&str]) -> Vec<Endpoint> {
    urls.iter().copied().map(Endpoint::new).collect()
}

/// Swap callback that forwards the new handle to a channel.
fn forward(tx: &mpsc::UnboundedSender<ConnectionHandle>) -> impl Fn(ConnectionHandle) + Send + Sync + 'static {
    let tx = tx.clone();
    move |handle| {
        let _ = tx.send(handle);
    }
}

#[tokio::test(start_paused = true)]
async fn first_connection_to_open_is_active() {
    let connector = MockConnector::new();
    connector.otherwise(A, Dial::Stall);
    connector.otherwise(B, Dial::Accept);
    keep_alive(connector.accepted(B));

    let pool = ConnectionPool::connect(endpoints(&[A, B]), config(3), connector.clone())
        .await
        .unwrap();
    let current = pool.current(|_| {}).await.unwrap();
    assert_eq!(current.endpoint().url, B);
    assert_eq!(pool.active_index(), 1);
    assert_eq!(pool.health(), HealthStatus::Degraded);
}

/// A spends its whole budget before B manages to open. The active
/// connection must still be B.
#[tokio::test(start_paused = true)]
async fn termination_before_first_open_does_not_shift_selection() {
    let connector = MockConnector::new();
    connector.otherwise(A, Dial::Refuse);
    connector.script(B, [Dial::Stall]);
    connector.otherwise(B, Dial::Accept);
    keep_alive(connector.accepted(B));

    let pool = ConnectionPool::connect(endpoints(&[A, B]), config(3), connector.clone())
        .await
        .unwrap();
    assert_eq!(
        pool.states(),
        vec![ConnectionState::Terminated, ConnectionState::Open]
    );

    let current = pool.current(|_| {}).await.unwrap();
    assert_eq!(current.endpoint().url, B);
    assert!(current.is_open());
    assert_eq!(pool.active_index(), 1);
    assert!(!pool.is_exhausted());
}

#[tokio::test(start_paused = true)]
async fn swap_notifies_every_callback_in_order_with_same_handle() {
    let connector = MockConnector::new();
    connector.script(A, [Dial::Accept]);
    connector.otherwise(B, Dial::Accept);
    let mut a_servers = connector.accepted(A);
    keep_alive(connector.accepted(B));

    let pool = ConnectionPool::connect(endpoints(&[A, B]), config(2), connector.clone())
        .await
        .unwrap();
    let a_server = a_servers.recv().await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    for i in 0..3 {
        let order = Arc::clone(&order);
        let tx = tx.clone();
        pool.current(move |handle| {
            order.lock().unwrap().push(i);
            let _ = tx.send(handle);
        })
        .await
        .unwrap();
    }

    drop(a_server);
    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(rx.recv().await.unwrap());
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    assert!(received.iter().all(|h| h.ptr_eq(&received[0])));
    assert_eq!(received[0].endpoint().url, B);
    assert_eq!(pool.active_index(), 1);

    // exactly once
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(order.lock().unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn one_survivor_after_all_others_terminate() {
    let connector = MockConnector::new();
    connector.script(A, [Dial::Accept]);
    connector.script(B, [Dial::Accept]);
    connector.otherwise(C, Dial::Accept);
    let mut a_servers = connector.accepted(A);
    let mut b_servers = connector.accepted(B);
    keep_alive(connector.accepted(C));

    let pool = ConnectionPool::connect(endpoints(&[A, B, C]), config(2), connector.clone())
        .await
        .unwrap();
    for handle in pool.handles() {
        handle.wait_open().await.unwrap();
    }
    let (tx, mut swaps) = mpsc::unbounded_channel();
    pool.current(forward(&tx)).await.unwrap();

    // both drop at once
    drop(a_servers.recv().await.unwrap());
    drop(b_servers.recv().await.unwrap());
    swaps.recv().await.unwrap();
    swaps.recv().await.unwrap();

    assert_eq!(
        pool.states(),
        vec![
            ConnectionState::Terminated,
            ConnectionState::Terminated,
            ConnectionState::Open
        ]
    );
    assert!(!pool.is_exhausted());
    let current = pool.current(|_| {}).await.unwrap();
    assert_eq!(current.endpoint().url, C);
    assert!(current.is_open());
}

#[tokio::test(start_paused = true)]
async fn total_exhaustion_degrades_pool() {
    let connector = MockConnector::new();
    connector.script(A, [Dial::Accept]);
    let mut servers = connector.accepted(A);

    let pool = ConnectionPool::connect(endpoints(&[A]), config(2), connector.clone())
        .await
        .unwrap();
    let (tx, mut swaps) = mpsc::unbounded_channel();
    let handle = pool.current(forward(&tx)).await.unwrap();

    drop(servers.recv().await.unwrap());
    assert!(matches!(
        handle.wait_open().await,
        Err(TransportError::Terminated { .. })
    ));

    assert!(pool.is_exhausted());
    assert_eq!(pool.health(), HealthStatus::Unhealthy);
    assert!(swaps.try_recv().is_err());
    assert!(matches!(
        pool.current(|_| {}).await,
        Err(TransportError::AllEndpointsTerminated)
    ));
}

/// A opens, B never has; A's budget runs out and the swap hands consumers B
/// while B is still connecting. Subscribing fails until B opens, then B's
/// replay issues the subscription.
#[tokio::test(start_paused = true)]
async fn failover_to_endpoint_that_never_opened() {
    let connector = MockConnector::new();
    connector.script(A, [Dial::Accept]);
    connector.script(B, [Dial::Stall, Dial::Stall, Dial::Accept]);
    let mut a_servers = connector.accepted(A);
    let mut b_servers = connector.accepted(B);

    let pool = ConnectionPool::connect(endpoints(&[A, B]), config(3), connector.clone())
        .await
        .unwrap();

    let (results_tx, mut results) = mpsc::unbounded_channel();
    let (listener, mut pushes) = forwarding_listener();
    let topic = Topic::logs(json!({ "address": "0xc0ffee" }));
    let current = {
        let topic = topic.clone();
        let listener = listener.clone();
        pool.current(move |next: ConnectionHandle| {
            let topic = topic.clone();
            let listener = listener.clone();
            let results_tx = results_tx.clone();
            tokio::spawn(async move {
                let state = next.state();
                let _ = results_tx.send((state, next.subscribe(topic, listener).await));
            });
        })
        .await
        .unwrap()
    };
    assert_eq!(current.endpoint().url, A);

    drop(a_servers.recv().await.unwrap());

    let (state, outcome) = results.recv().await.unwrap();
    assert_ne!(state, ConnectionState::Open);
    assert!(matches!(outcome, Err(TransportError::NotConnected { .. })));
    assert_eq!(pool.active_index(), 1);

    let mut b = b_servers.recv().await.unwrap();
    assert_eq!(
        b.accept_subscribe("0xb1").await,
        json!(["logs", { "address": "0xc0ffee" }])
    );
    b.notify("0xb1", json!({ "logIndex": "0x0" }));
    assert_eq!(pushes.recv().await, Some(json!({ "logIndex": "0x0" })));
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_open_connections() {
    let connector = MockConnector::new();
    connector.script(A, [Dial::Accept]);
    connector.otherwise(B, Dial::Stall);
    let mut servers = connector.accepted(A);

    let pool = ConnectionPool::connect(endpoints(&[A, B]), config(10), connector.clone())
        .await
        .unwrap();
    let a = pool.handles()[0].clone();
    let mut server = servers.recv().await.unwrap();

    let started = tokio::time::Instant::now();
    pool.shutdown().await;
    assert!(started.elapsed() <= Duration::from_secs(5));

    assert_eq!(server.next_frame().await, Some(Frame::Close));
    assert_eq!(a.state(), ConnectionState::Terminated);
    assert_eq!(connector.dials(A), 1);
}
