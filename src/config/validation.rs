//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, pool size > 0)
//! - Detect duplicate servers and half-configured credentials
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ClientConfig → Result<(), Vec<ValidationError>>
//! - Runs before a client is constructed

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::ClientConfig;
use crate::net::address::ServerAddress;
use crate::net::handshake::MAX_CREDENTIAL_LEN;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("server_addresses must not be empty")]
    NoServers,

    #[error("server {0} is listed more than once")]
    DuplicateServer(ServerAddress),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("password is set but username is not")]
    PasswordWithoutUsername,

    #[error("{field} is {len} bytes, longer than {max}")]
    CredentialTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("health.max_probe_interval_millis ({max}) is below health.probe_interval_millis ({base})")]
    ProbeCapBelowBase { base: u64, max: u64 },
}

/// Check a configuration, collecting every problem.
pub fn validate_config(config: &ClientConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server_addresses.is_empty() {
        errors.push(ValidationError::NoServers);
    }
    let mut seen = HashSet::new();
    for addr in &config.server_addresses {
        if !seen.insert(addr) {
            errors.push(ValidationError::DuplicateServer(addr.clone()));
        }
    }

    let positive: [(&'static str, u64); 9] = [
        ("handle_timeout_millis", config.handle_timeout_millis),
        ("connection.max_pool_size", config.connection.max_pool_size as u64),
        ("connection.acquire_timeout_millis", config.connection.acquire_timeout_millis),
        ("connection.connect_timeout_millis", config.connection.connect_timeout_millis),
        ("connection.max_frame_length", config.connection.max_frame_length as u64),
        ("health.sweep_interval_millis", config.health.sweep_interval_millis),
        ("health.probe_interval_millis", config.health.probe_interval_millis),
        ("health.probe_timeout_millis", config.health.probe_timeout_millis),
        (
            "health.unhealthy_failure_threshold",
            config.health.unhealthy_failure_threshold as u64,
        ),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::Zero(field));
        }
    }

    if config.password.is_some() && config.username.is_none() {
        errors.push(ValidationError::PasswordWithoutUsername);
    }

    for (field, value) in [("username", &config.username), ("password", &config.password)] {
        if let Some(value) = value {
            if value.len() > MAX_CREDENTIAL_LEN {
                errors.push(ValidationError::CredentialTooLong {
                    field,
                    len: value.len(),
                    max: MAX_CREDENTIAL_LEN,
                });
            }
        }
    }

    if config.health.max_probe_interval_millis < config.health.probe_interval_millis {
        errors.push(ValidationError::ProbeCapBelowBase {
            base: config.health.probe_interval_millis,
            max: config.health.max_probe_interval_millis,
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
