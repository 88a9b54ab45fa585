//! Request/response correlation for one connection.
//!
//! # Data Flow
//! ```text
//! send_request
//!     → register(id, decoder, deadline)  → oneshot receiver to the caller
//! I/O task reads a frame
//!     → on_frame(payload)
//!         pending id      → decoder runs, future completes (Delivered)
//!         retired id      → Duplicate / Late (rejected, connection kept)
//!         never-seen id   → Err(CorrelationMismatch)
//! deadline passes         → on_timeout(id)          fails that request only
//! connection closes       → on_connection_closed()  fails everything pending
//! ```
//!
//! Completions run outside the table lock.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{ClientError, CloseReason, ProtocolError};
use crate::net::address::ServerAddress;
use crate::net::message::{self, RequestId};

/// How many retired ids are remembered to classify late and duplicate frames.
const RETIRED_CAPACITY: usize = 64;

type Completion = Box<dyn FnOnce(Result<Bytes, ClientError>) + Send>;

struct PendingRequest {
    complete: Completion,
    deadline: Instant,
    registered_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retired {
    Completed,
    Expired,
}

/// What `on_frame` did with an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Matched a pending request and completed it.
    Delivered(RequestId),
    /// Second response for a request that already completed.
    Duplicate(RequestId),
    /// Response for a request that timed out or was abandoned.
    Late(RequestId),
}

#[derive(Default)]
struct CorrelatorState {
    pending: HashMap<RequestId, PendingRequest>,
    retired: VecDeque<(RequestId, Retired)>,
    closed: Option<CloseReason>,
}

impl CorrelatorState {
    fn retire(&mut self, id: RequestId, how: Retired) {
        if self.retired.len() == RETIRED_CAPACITY {
            self.retired.pop_front();
        }
        self.retired.push_back((id, how));
    }

    fn retired(&self, id: RequestId) -> Option<Retired> {
        self.retired
            .iter()
            .rev()
            .find(|(retired, _)| *retired == id)
            .map(|(_, how)| *how)
    }
}

/// Pending-request table for one connection.
pub struct Correlator {
    server: ServerAddress,
    state: Mutex<CorrelatorState>,
}

impl Correlator {
    pub fn new(server: ServerAddress) -> Self {
        Self {
            server,
            state: Mutex::new(CorrelatorState::default()),
        }
    }

    /// Register a request and get the receiver its response will arrive on.
    ///
    /// `decoder` runs exactly once, on the I/O task, when the matching
    /// response arrives.
    pub fn register<T, E, D>(
        &self,
        id: RequestId,
        decoder: D,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<Result<T, ClientError>>, ClientError>
    where
        T: Send + 'static,
        E: std::fmt::Display + 'static,
        D: FnOnce(Bytes) -> Result<T, E> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let complete: Completion = Box::new(move |result| {
            let decoded =
                result.and_then(|body| decoder(body).map_err(|e| ClientError::Decode(e.to_string())));
            // Receiver gone means the caller stopped waiting.
            let _ = tx.send(decoded);
        });

        let mut state = self.state.lock();
        if let Some(reason) = &state.closed {
            return Err(ClientError::ConnectionClosed {
                server: self.server.clone(),
                reason: reason.clone(),
            });
        }
        if state.pending.contains_key(&id) {
            return Err(ClientError::protocol(
                &self.server,
                ProtocolError::DuplicateRequestId(id),
            ));
        }
        state.pending.insert(
            id,
            PendingRequest {
                complete,
                deadline,
                registered_at: Instant::now(),
            },
        );
        Ok(rx)
    }

    /// Route an inbound payload to the request it answers.
    pub fn on_frame(&self, payload: Bytes) -> Result<FrameOutcome, ProtocolError> {
        let (id, body) = message::decode(payload)?;

        let pending = {
            let mut state = self.state.lock();
            match state.pending.remove(&id) {
                Some(pending) => {
                    state.retire(id, Retired::Completed);
                    pending
                }
                None => {
                    return match state.retired(id) {
                        Some(Retired::Completed) => {
                            tracing::warn!(server = %self.server, request_id = %id, "Rejected duplicate response");
                            Ok(FrameOutcome::Duplicate(id))
                        }
                        Some(Retired::Expired) => {
                            tracing::debug!(server = %self.server, request_id = %id, "Discarded late response");
                            Ok(FrameOutcome::Late(id))
                        }
                        None => Err(ProtocolError::CorrelationMismatch(id)),
                    };
                }
            }
        };

        (pending.complete)(Ok(body));
        Ok(FrameOutcome::Delivered(id))
    }

    /// Fail one request whose deadline has passed. Returns false if it was no
    /// longer pending.
    pub fn on_timeout(&self, id: RequestId) -> bool {
        let pending = {
            let mut state = self.state.lock();
            let Some(pending) = state.pending.remove(&id) else {
                return false;
            };
            state.retire(id, Retired::Expired);
            pending
        };

        let after = pending.registered_at.elapsed();
        tracing::debug!(server = %self.server, request_id = %id, ?after, "Request timed out");
        (pending.complete)(Err(ClientError::RequestTimeout {
            server: self.server.clone(),
            id,
            after,
        }));
        true
    }

    /// Time out every request whose deadline is at or before `now`.
    pub fn expire_overdue(&self, now: Instant) -> Vec<RequestId> {
        let overdue: Vec<RequestId> = {
            let state = self.state.lock();
            state
                .pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| *id)
                .collect()
        };
        overdue.into_iter().filter(|id| self.on_timeout(*id)).collect()
    }

    /// Drop a request whose caller went away without completing it.
    pub fn abandon(&self, id: RequestId) -> bool {
        let mut state = self.state.lock();
        if state.pending.remove(&id).is_some() {
            state.retire(id, Retired::Expired);
            true
        } else {
            false
        }
    }

    /// Fail every pending request; later registrations are refused.
    pub fn on_connection_closed(&self, reason: CloseReason) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut state = self.state.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.clone());
            }
            state.pending.drain().map(|(_, p)| p).collect()
        };

        let count = drained.len();
        for pending in drained {
            (pending.complete)(Err(ClientError::ConnectionClosed {
                server: self.server.clone(),
                reason: reason.clone(),
            }));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.state.lock().pending.contains_key(&id)
    }

    /// Time until the earliest pending deadline, if any.
    pub fn next_deadline_in(&self, now: Instant) -> Option<Duration> {
        self.state
            .lock()
            .pending
            .values()
            .map(|p| p.deadline.saturating_duration_since(now))
            .min()
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("server", &self.server)
            .field("pending", &self.pending_count())
            .finish()
    }
}
