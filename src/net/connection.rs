//! Connection state machine and I/O task.
//!
//! # Responsibilities
//! - Own one socket through a dedicated Tokio task
//! - Track connection state (Connecting → Ready ⇄ Busy → Closed)
//! - Record last activity for idle reclamation
//! - Route inbound frames to the correlator
//! - Tell the owning pool when the connection closes
//!
//! # State Transitions
//! ```text
//! Connecting → Ready     handshake succeeded
//! Ready → Busy           request dispatched
//! Busy → Ready           response delivered or request timed out
//! Ready → Unhealthy      idle beyond the unhealthy threshold
//! any → Closed           I/O error, protocol error, eviction, idle close
//! ```

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, CloseReason, ProtocolError};
use crate::net::address::ServerAddress;
use crate::net::correlator::Correlator;
use crate::net::frame::{FrameCodec, FrameError, DEFAULT_MAX_FRAME_LENGTH};
use crate::net::handshake::{self, Credentials};
use crate::net::message::{self, RequestId, REQUEST_ID_LEN};
use crate::observability::metrics;

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection lifecycle state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP connect / handshake in progress.
    Connecting = 0,
    /// Idle and eligible to be handed out (or reclaimed).
    Ready = 1,
    /// Has a request in flight; never reclaimed by the health monitor.
    Busy = 2,
    /// Sat idle past the unhealthy threshold; will not be handed out.
    Unhealthy = 3,
    /// Terminal.
    Closed = 4,
}

impl From<u8> for ConnectionState {
    fn from(val: u8) -> Self {
        match val {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Ready,
            2 => ConnectionState::Busy,
            3 => ConnectionState::Unhealthy,
            _ => ConnectionState::Closed,
        }
    }
}

/// Receives close notifications for the connections it owns.
pub trait ConnectionOwner: Send + Sync {
    fn on_connection_closed(&self, id: ConnectionId, reason: &CloseReason);
}

/// Parameters for opening a connection.
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub connect_timeout: Duration,
    pub max_frame_length: usize,
    pub credentials: Option<Credentials>,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            credentials: None,
        }
    }
}

/// One session with a server.
pub struct Connection {
    id: ConnectionId,
    server: ServerAddress,
    state: AtomicU8,
    last_active: Mutex<Instant>,
    correlator: Correlator,
    outbound: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
    owner: Option<Weak<dyn ConnectionOwner>>,
    max_frame_length: usize,
}

impl Connection {
    /// Connect over TCP, run the handshake and start the I/O task.
    pub async fn open(
        server: &ServerAddress,
        settings: &ConnectSettings,
        owner: Option<Weak<dyn ConnectionOwner>>,
    ) -> Result<Arc<Self>, ClientError> {
        let connect = TcpStream::connect((server.host(), server.port()));
        let stream = match tokio::time::timeout(settings.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ClientError::transport(server, e)),
            Err(_) => {
                return Err(ClientError::transport(
                    server,
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
                ))
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(server = %server, error = %e, "Failed to set TCP_NODELAY");
        }
        Self::from_stream(server, stream, settings, owner).await
    }

    /// Run the handshake on an already-connected stream and start the I/O task.
    pub async fn from_stream<S>(
        server: &ServerAddress,
        stream: S,
        settings: &ConnectSettings,
        owner: Option<Weak<dyn ConnectionOwner>>,
    ) -> Result<Arc<Self>, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            server: server.clone(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            last_active: Mutex::new(Instant::now()),
            correlator: Correlator::new(server.clone()),
            outbound: outbound_tx,
            cancel: CancellationToken::new(),
            owner,
            max_frame_length: settings.max_frame_length,
        });

        let mut framed = Framed::new(stream, FrameCodec::new(settings.max_frame_length));
        if let Some(credentials) = &settings.credentials {
            if let Err(e) =
                handshake::perform(&mut framed, credentials, server, settings.connect_timeout).await
            {
                tracing::warn!(server = %server, connection_id = %conn.id, error = %e, "Handshake failed");
                conn.state.store(ConnectionState::Closed as u8, Ordering::SeqCst);
                return Err(e);
            }
        }

        conn.state.store(ConnectionState::Ready as u8, Ordering::SeqCst);
        conn.touch();
        tracing::debug!(server = %server, connection_id = %conn.id, "Connection ready");

        tokio::spawn(run_io(conn.clone(), framed, outbound_rx));
        Ok(conn)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn server(&self) -> &ServerAddress {
        &self.server
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    /// How long the connection has been inactive as of `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active())
    }

    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub(crate) fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Atomically move from `from` to `to`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Ready → Busy.
    pub fn mark_busy(&self) -> bool {
        self.transition(ConnectionState::Ready, ConnectionState::Busy)
    }

    /// Busy → Ready, refreshing the activity timestamp.
    pub fn mark_ready(&self) -> bool {
        let moved = self.transition(ConnectionState::Busy, ConnectionState::Ready);
        if moved {
            self.touch();
        }
        moved
    }

    /// Ready → Unhealthy.
    pub fn mark_unhealthy(&self) -> bool {
        self.transition(ConnectionState::Ready, ConnectionState::Unhealthy)
    }

    /// Register a request and write its frame.
    ///
    /// Requests on one connection are written in the order `dispatch` is called.
    pub fn dispatch<T, E, D>(
        &self,
        id: RequestId,
        body: &[u8],
        decoder: D,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<Result<T, ClientError>>, ClientError>
    where
        T: Send + 'static,
        E: std::fmt::Display + 'static,
        D: FnOnce(Bytes) -> Result<T, E> + Send + 'static,
    {
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed {
                server: self.server.clone(),
                reason: CloseReason::Explicit,
            });
        }
        let length = REQUEST_ID_LEN + body.len();
        if length > self.max_frame_length {
            // Oversized request is the caller's problem; the connection stays usable.
            return Err(ClientError::RequestTooLarge {
                server: self.server.clone(),
                length,
                max: self.max_frame_length,
            });
        }

        let rx = self.correlator.register(id, decoder, deadline)?;
        self.touch();
        if self.outbound.send(message::encode(id, body)).is_err() {
            self.correlator.abandon(id);
            return Err(ClientError::ConnectionClosed {
                server: self.server.clone(),
                reason: CloseReason::Shutdown,
            });
        }
        Ok(rx)
    }

    /// Close the connection. Returns false if it was already closed.
    ///
    /// Fails every pending request and notifies the owning pool.
    pub fn close(&self, reason: CloseReason) -> bool {
        let previous = self.state.swap(ConnectionState::Closed as u8, Ordering::SeqCst);
        if previous == ConnectionState::Closed as u8 {
            return false;
        }
        self.cancel.cancel();
        let failed = self.correlator.on_connection_closed(reason.clone());

        if reason.is_failure() {
            tracing::warn!(server = %self.server, connection_id = %self.id, reason = %reason, failed_requests = failed, "Connection closed");
        } else {
            tracing::debug!(server = %self.server, connection_id = %self.id, reason = %reason, failed_requests = failed, "Connection closed");
        }
        metrics::record_connection_closed(&self.server, reason.label());

        if let Some(owner) = self.owner.as_ref().and_then(Weak::upgrade) {
            owner.on_connection_closed(self.id, &reason);
        }
        true
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("state", &self.state())
            .finish()
    }
}

fn close_reason(err: FrameError) -> CloseReason {
    match err {
        FrameError::Io(e) => CloseReason::Io(e.to_string()),
        FrameError::Protocol(e) => CloseReason::Protocol(e),
    }
}

/// Drives one socket until it fails or the connection is closed.
async fn run_io<S>(
    conn: Arc<Connection>,
    framed: Framed<S, FrameCodec>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cancel = conn.cancel.clone();
    let (mut sink, mut stream) = framed.split();
    let failure = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,
            next = outbound.recv() => {
                let Some(payload) = next else { break None };
                if let Err(e) = sink.send(payload).await {
                    break Some(close_reason(e));
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(payload)) => {
                    conn.touch();
                    if let Err(e) = conn.correlator.on_frame(payload) {
                        if matches!(e, ProtocolError::CorrelationMismatch(_)) {
                            metrics::record_mismatch(&conn.server);
                        }
                        tracing::warn!(server = %conn.server, connection_id = %conn.id, error = %e, "Unexpected frame");
                        break Some(CloseReason::Protocol(e));
                    }
                }
                Some(Err(e)) => break Some(close_reason(e)),
                None => break Some(CloseReason::PeerClosed),
            }
        }
    };

    if let Some(reason) = failure {
        conn.close(reason);
    }
    tracing::trace!(connection_id = %conn.id, "I/O task finished");
}
