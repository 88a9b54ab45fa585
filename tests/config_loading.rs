//! Loading a config file and building a client from it.

use std::io::Write;

use cluster_client::config::{load_config, ConfigError, ValidationError};
use cluster_client::{Client, LoadBalanceStrategy};

mod common;
use common::{text, Behavior, MockServer};

#[tokio::test]
async fn test_client_from_config_file() {
    let server = MockServer::start(Behavior::Echo).await;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
server_addresses = ["{}"]
load_balance_strategy = "round_robin"
handle_timeout_millis = 2000
failover = false

[connection]
max_pool_size = 2
acquire_timeout_millis = 1000

[health]
enabled = false
"#,
        server.addr
    )
    .unwrap();

    let config = load_config(file.path()).unwrap();
    assert_eq!(config.load_balance_strategy, LoadBalanceStrategy::RoundRobin);
    assert_eq!(config.connection.max_pool_size, 2);
    assert_eq!(config.health.probe_interval_millis, 10_000);

    let client = Client::new(config).unwrap();
    assert_eq!(client.send(b"from file", text).await.unwrap(), "from file");
    assert_eq!(client.config().server_addresses, vec![server.addr.clone()]);
}

#[test]
fn test_validation_errors_are_collected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
server_addresses = ["127.0.0.1:7400", "127.0.0.1:7400"]
password = "orphan"

[health]
probe_interval_millis = 0
"#
    )
    .unwrap();

    match load_config(file.path()) {
        Err(ConfigError::Validation(errors)) => {
            assert!(errors.contains(&ValidationError::PasswordWithoutUsername));
            assert!(errors.contains(&ValidationError::Zero("health.probe_interval_millis")));
            assert!(errors
                .iter()
                .any(|e| matches!(e, ValidationError::DuplicateServer(_))));
        }
        other => panic!("unexpected: {:?}", other.map(|_| ())),
    }
}
