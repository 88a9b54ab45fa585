//! Failure injection tests: dead servers, rejected handshakes, saturation.

use std::time::Duration;

use cluster_client::health::HealthState;
use cluster_client::{Client, ClientError, ErrorKind, LoadBalanceStrategy};

mod common;
use common::{dead_address, eventually, test_config, text, Behavior, MockServer};

#[tokio::test]
async fn test_failover_to_second_server() {
    let dead = dead_address().await;
    let live = MockServer::start(Behavior::Echo).await;
    let mut config = test_config(&[dead.clone(), live.addr.clone()]);
    // Round robin starts at the first server, so the dead one is tried first.
    config.load_balance_strategy = LoadBalanceStrategy::RoundRobin;
    let client = Client::new(config).unwrap();

    assert_eq!(client.send(b"hello", text).await.unwrap(), "hello");
    assert_eq!(live.requests(), 1);

    let health = client.server_health();
    let dead_health = health.iter().find(|h| h.address == dead).unwrap();
    assert_eq!(dead_health.consecutive_failures, 1);
}

#[tokio::test]
async fn test_no_failover_when_disabled() {
    let dead = dead_address().await;
    let live = MockServer::start(Behavior::Echo).await;
    let mut config = test_config(&[dead, live.addr.clone()]);
    config.load_balance_strategy = LoadBalanceStrategy::RoundRobin;
    config.failover = false;
    let client = Client::new(config).unwrap();

    let err = client.send(b"hello", text).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(live.requests(), 0);
}

#[tokio::test]
async fn test_all_servers_down() {
    let client = Client::new(test_config(&[dead_address().await, dead_address().await])).unwrap();
    let err = client.send(b"hello", text).await.unwrap_err();
    assert!(matches!(err, ClientError::Transport { .. }), "{err}");
    assert_eq!(client.total_connection_count(), 0);
}

#[tokio::test]
async fn test_passive_failures_mark_server_unhealthy() {
    let dead = dead_address().await;
    let mut config = test_config(&[dead]);
    config.health.unhealthy_failure_threshold = 3;
    let client = Client::new(config).unwrap();

    for _ in 0..2 {
        client.send(b"x", text).await.unwrap_err();
    }
    assert_ne!(client.server_health()[0].state, HealthState::Unhealthy);

    client.send(b"x", text).await.unwrap_err();
    assert_eq!(client.server_health()[0].state, HealthState::Unhealthy);
}

#[tokio::test]
async fn test_unhealthy_server_is_avoided() {
    let dead = dead_address().await;
    let live = MockServer::start(Behavior::Echo).await;
    let mut config = test_config(&[dead, live.addr.clone()]);
    config.load_balance_strategy = LoadBalanceStrategy::RoundRobin;
    config.failover = false;
    config.health.unhealthy_failure_threshold = 1;
    let client = Client::new(config).unwrap();

    // First pick is the dead server; one failure makes it unhealthy.
    client.send(b"x", text).await.unwrap_err();
    for _ in 0..5 {
        assert_eq!(client.send(b"y", text).await.unwrap(), "y");
    }
    assert_eq!(live.requests(), 5);
}

#[tokio::test]
async fn test_oversized_request_does_not_mark_server_unhealthy() {
    let server = MockServer::start(Behavior::Echo).await;
    let mut config = test_config(&[server.addr.clone()]);
    config.connection.max_frame_length = 64;
    config.health.unhealthy_failure_threshold = 3;
    let client = Client::new(config).unwrap();

    assert_eq!(client.send(b"small", text).await.unwrap(), "small");
    for _ in 0..3 {
        let err = client.send(&[b'a'; 200], text).await.unwrap_err();
        assert!(matches!(err, ClientError::RequestTooLarge { max: 64, .. }), "{err}");
        assert_eq!(err.kind(), ErrorKind::Request);
    }

    let health = &client.server_health()[0];
    assert_eq!(health.state, HealthState::Healthy);
    assert_eq!(health.consecutive_failures, 0);
    assert_eq!(server.requests(), 1);
    assert_eq!(client.send(b"still fine", text).await.unwrap(), "still fine");
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn test_authentication_success() {
    let server = MockServer::start(Behavior::Echo).await;
    let mut config = test_config(&[server.addr.clone()]);
    config.username = Some("app".into());
    config.password = Some("secret".into());
    let client = Client::new(config).unwrap();

    assert_eq!(client.send(b"after auth", text).await.unwrap(), "after auth");
    let creds = server.last_credentials().unwrap();
    assert_eq!(creds.username, "app");
    assert_eq!(creds.password, "secret");
}

#[tokio::test]
async fn test_authentication_rejected() {
    let server = MockServer::start(Behavior::RejectAuth).await;
    let mut config = test_config(&[server.addr.clone()]);
    config.username = Some("app".into());
    config.password = Some("wrong".into());
    let client = Client::new(config).unwrap();

    let err = client.send(b"hello", text).await.unwrap_err();
    match &err {
        ClientError::AuthenticationRejected { reason, .. } => {
            assert_eq!(reason, "invalid credentials")
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(client.total_connection_count(), 0);
    assert_eq!(server.requests(), 0);
}

#[tokio::test]
async fn test_pool_exhausted_and_acquire_timeout() {
    let server = MockServer::start(Behavior::Silent).await;
    let mut config = test_config(&[server.addr.clone()]);
    config.connection.max_pool_size = 1;
    config.connection.max_pending_acquires = 1;
    config.connection.acquire_timeout_millis = 300;
    let client = Client::new(config).unwrap();

    // Holds the only connection.
    let holder = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .send_request(b"hold", text, Duration::from_secs(5))
                .await
        })
    };
    assert!(eventually(Duration::from_secs(1), || server.requests() == 1).await);

    // Queues behind it.
    let queued = {
        let client = client.clone();
        tokio::spawn(async move { client.send(b"queued", text).await })
    };
    assert!(eventually(Duration::from_secs(1), || client.pool_stats().waiting == 1).await);

    // Queue is full.
    let err = client.send(b"overflow", text).await.unwrap_err();
    assert!(matches!(err, ClientError::PoolExhausted { .. }), "{err}");
    assert_eq!(err.kind(), ErrorKind::Capacity);

    let err = queued.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::AcquireTimeout { .. }), "{err}");

    // Capacity errors never count against the server.
    assert_eq!(client.server_health()[0].consecutive_failures, 0);

    client.close();
    assert!(holder.await.unwrap().is_err());
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let mut config = test_config(&[]);
    config.connection.max_pool_size = 0;
    match Client::new(config) {
        Err(ClientError::InvalidConfig(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("unexpected: {:?}", other.map(|_| ())),
    }
}
