//! Message envelope carried inside each frame.
//!
//! ```text
//! [8-byte big-endian request id][body]
//! ```
//!
//! The body is opaque to this crate. Request id 0 is reserved for the session
//! handshake.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Size of the request id header.
pub const REQUEST_ID_LEN: usize = 8;

/// Correlation token shared by a request and its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    /// Reserved for the authentication exchange.
    pub const HANDSHAKE: RequestId = RequestId(0);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Prefix `body` with its request id.
pub fn encode(id: RequestId, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(REQUEST_ID_LEN + body.len());
    buf.put_u64(id.0);
    buf.extend_from_slice(body);
    buf.freeze()
}

/// Split a payload into its request id and body.
pub fn decode(mut payload: Bytes) -> Result<(RequestId, Bytes), ProtocolError> {
    if payload.len() < REQUEST_ID_LEN {
        return Err(ProtocolError::MalformedEnvelope(payload.len()));
    }
    let id = RequestId(payload.get_u64());
    Ok((id, payload))
}
