//! Error types shared by every layer of the client.
//!
//! # Taxonomy
//! ```text
//! capacity        PoolExhausted, AcquireTimeout        surfaced, never retried
//! protocol        Protocol(ProtocolError)             closes the connection
//! timeout         RequestTimeout                      connection preserved
//! transport       Transport, ConnectionClosed         closes the connection
//! authentication  AuthenticationRejected              never reaches Ready
//! request         RequestTooLarge                     refused locally, nothing sent
//! ```
//!
//! `ClientError` is `Clone` so a single connection failure can fail every
//! request that was pending on that connection.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::loader::ConfigError;
use crate::config::validation::ValidationError;
use crate::net::address::ServerAddress;
use crate::net::message::RequestId;

/// Result alias used throughout the crate.
pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Wire-level violations detected while framing or correlating.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Declared frame length was negative.
    #[error("frame length {0} is negative")]
    NegativeFrameLength(i32),

    /// Declared (or outgoing) frame length exceeds the configured maximum.
    #[error("frame of length {length} exceeds maximum of {max}")]
    FrameTooLarge { length: usize, max: usize },

    /// Payload too short to carry a correlation id.
    #[error("payload of {0} bytes is too short to carry a request id")]
    MalformedEnvelope(usize),

    /// A response arrived whose request id has no pending request.
    #[error("response for unknown request {0}")]
    CorrelationMismatch(RequestId),

    /// A request id was registered twice on the same connection.
    #[error("request {0} is already pending")]
    DuplicateRequestId(RequestId),

    /// The handshake reply could not be parsed.
    #[error("malformed handshake reply: {0}")]
    MalformedHandshake(String),
}

/// Why a connection was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the pool or the client on request.
    Explicit,
    /// Reclaimed by the health monitor after sitting idle.
    Idle,
    /// The peer closed the socket.
    PeerClosed,
    /// Read or write failed.
    Io(String),
    /// The peer violated the wire protocol.
    Protocol(ProtocolError),
    /// The owning pool or client shut down.
    Shutdown,
}

impl CloseReason {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            CloseReason::Explicit => "explicit",
            CloseReason::Idle => "idle",
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::Io(_) => "io",
            CloseReason::Protocol(_) => "protocol",
            CloseReason::Shutdown => "shutdown",
        }
    }

    /// Whether the close was caused by the peer or the wire, not by us.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CloseReason::PeerClosed | CloseReason::Io(_) | CloseReason::Protocol(_)
        )
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Io(e) => write!(f, "io error: {}", e),
            CloseReason::Protocol(e) => write!(f, "protocol error: {}", e),
            other => f.write_str(other.label()),
        }
    }
}

/// Coarse classification used for retry and health decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Capacity,
    Protocol,
    Timeout,
    Transport,
    Authentication,
    /// The caller's request was refused before anything was written.
    Request,
    Closed,
    Decode,
    Config,
}

/// Errors surfaced by the client.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Too many callers already queued for a connection.
    #[error("connection pool for {server} exhausted ({waiting} acquirers already queued)")]
    PoolExhausted { server: ServerAddress, waiting: usize },

    /// No connection became available before the acquire deadline.
    #[error("timed out after {waited:?} waiting for a connection to {server}")]
    AcquireTimeout { server: ServerAddress, waited: Duration },

    /// The response did not arrive before the request deadline.
    #[error("request {id} to {server} timed out after {after:?}")]
    RequestTimeout {
        server: ServerAddress,
        id: RequestId,
        after: Duration,
    },

    /// The encoded request would exceed the maximum frame length.
    #[error("request of {length} bytes to {server} exceeds maximum frame length of {max}")]
    RequestTooLarge {
        server: ServerAddress,
        length: usize,
        max: usize,
    },

    /// Wire protocol violation.
    #[error("protocol error from {server}: {source}")]
    Protocol {
        server: ServerAddress,
        #[source]
        source: ProtocolError,
    },

    /// Connect, read or write failed.
    #[error("transport error talking to {server}: {source}")]
    Transport {
        server: ServerAddress,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The server refused the session handshake.
    #[error("authentication rejected by {server}: {reason}")]
    AuthenticationRejected { server: ServerAddress, reason: String },

    /// The connection closed while the request was outstanding.
    #[error("connection to {server} closed: {reason}")]
    ConnectionClosed {
        server: ServerAddress,
        reason: CloseReason,
    },

    /// The pool was closed while waiting or before acquiring.
    #[error("connection pool for {0} is closed")]
    PoolClosed(ServerAddress),

    /// The client has been closed.
    #[error("client is closed")]
    ClientClosed,

    /// No server left to try.
    #[error("no server available")]
    NoServerAvailable,

    /// The caller-supplied decoder rejected the response body.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(Arc<ConfigError>),

    /// Configuration failed validation.
    #[error("invalid configuration: {}", format_validation(.0))]
    InvalidConfig(Vec<ValidationError>),
}

fn format_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ClientError {
    pub(crate) fn transport(server: &ServerAddress, err: std::io::Error) -> Self {
        ClientError::Transport {
            server: server.clone(),
            source: Arc::new(err),
        }
    }

    pub(crate) fn protocol(server: &ServerAddress, err: ProtocolError) -> Self {
        ClientError::Protocol {
            server: server.clone(),
            source: err,
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::PoolExhausted { .. } | ClientError::AcquireTimeout { .. } => {
                ErrorKind::Capacity
            }
            ClientError::RequestTimeout { .. } => ErrorKind::Timeout,
            ClientError::Protocol { .. } => ErrorKind::Protocol,
            ClientError::Transport { .. } | ClientError::ConnectionClosed { .. } => {
                ErrorKind::Transport
            }
            ClientError::AuthenticationRejected { .. } => ErrorKind::Authentication,
            ClientError::RequestTooLarge { .. } => ErrorKind::Request,
            ClientError::PoolClosed(_) | ClientError::ClientClosed | ClientError::NoServerAvailable => {
                ErrorKind::Closed
            }
            ClientError::Decode(_) => ErrorKind::Decode,
            ClientError::Config(_) | ClientError::InvalidConfig(_) => ErrorKind::Config,
        }
    }

    /// True when the failure says something about the server's reachability.
    pub fn counts_against_server(&self) -> bool {
        match self {
            ClientError::ConnectionClosed { reason, .. } => reason.is_failure(),
            other => matches!(
                other.kind(),
                ErrorKind::Transport | ErrorKind::Protocol | ErrorKind::Authentication
            ),
        }
    }

    /// Connection-level failure eligible for one-shot failover to another server.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            ClientError::Transport { .. } | ClientError::AuthenticationRejected { .. } => true,
            ClientError::ConnectionClosed { reason, .. } => reason.is_failure(),
            _ => false,
        }
    }
}

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        ClientError::Config(Arc::new(err))
    }
}
