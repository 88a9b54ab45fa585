//! Session handshake.
//!
//! When credentials are configured, the first message on a new connection is
//! an authentication request sent with the reserved request id 0:
//!
//! ```text
//! request body: [0x01][u16 user len][user][u16 pass len][pass]
//! reply body:   [status u8][reason (UTF-8, optional)]     status 0 = accepted
//! ```

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::error::{ClientError, ProtocolError};
use crate::net::address::ServerAddress;
use crate::net::frame::{FrameCodec, FrameError};
use crate::net::message::{self, RequestId};

/// Sub-message tag for the authentication request.
pub const AUTH_REQUEST_TAG: u8 = 0x01;

/// Reply status meaning the session is accepted.
pub const AUTH_ACCEPTED: u8 = 0;

/// Username and password presented during the handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Longest username or password the u16 length prefix can carry.
pub const MAX_CREDENTIAL_LEN: usize = u16::MAX as usize;

/// Encode the authentication request body.
///
/// Fails if either field is longer than [`MAX_CREDENTIAL_LEN`] bytes.
pub fn encode_auth_request(credentials: &Credentials) -> Result<Bytes, ProtocolError> {
    let user = credentials.username.as_bytes();
    let pass = credentials.password.as_bytes();
    let mut buf = BytesMut::with_capacity(5 + user.len() + pass.len());
    buf.put_u8(AUTH_REQUEST_TAG);
    for (name, field) in [("username", user), ("password", pass)] {
        let len = u16::try_from(field.len()).map_err(|_| {
            ProtocolError::MalformedHandshake(format!(
                "{} is {} bytes, limit is {}",
                name,
                field.len(),
                MAX_CREDENTIAL_LEN
            ))
        })?;
        buf.put_u16(len);
        buf.extend_from_slice(field);
    }
    Ok(buf.freeze())
}

/// Decode an authentication request body. Used by servers and test doubles.
pub fn decode_auth_request(mut body: Bytes) -> Result<Credentials, ProtocolError> {
    let malformed = |what: &str| ProtocolError::MalformedHandshake(what.to_string());

    if body.remaining() < 1 || body.get_u8() != AUTH_REQUEST_TAG {
        return Err(malformed("missing auth tag"));
    }
    let mut field = |name: &str| -> Result<String, ProtocolError> {
        if body.remaining() < 2 {
            return Err(malformed(name));
        }
        let len = body.get_u16() as usize;
        if body.remaining() < len {
            return Err(malformed(name));
        }
        String::from_utf8(body.split_to(len).to_vec()).map_err(|_| malformed(name))
    };
    let username = field("username")?;
    let password = field("password")?;
    Ok(Credentials { username, password })
}

/// Encode a handshake reply body.
pub fn encode_auth_reply(status: u8, reason: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + reason.len());
    buf.put_u8(status);
    buf.extend_from_slice(reason.as_bytes());
    buf.freeze()
}

/// Outcome carried by a handshake reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthReply {
    Accepted,
    Rejected(String),
}

/// Decode a handshake reply body.
pub fn decode_auth_reply(mut body: Bytes) -> Result<AuthReply, ProtocolError> {
    if body.is_empty() {
        return Err(ProtocolError::MalformedHandshake("empty reply".into()));
    }
    match body.get_u8() {
        AUTH_ACCEPTED => Ok(AuthReply::Accepted),
        status => {
            let reason = String::from_utf8_lossy(&body).into_owned();
            let reason = if reason.is_empty() {
                format!("status {}", status)
            } else {
                reason
            };
            Ok(AuthReply::Rejected(reason))
        }
    }
}

/// Run the handshake on a freshly connected stream.
///
/// Must be the first exchange on the stream; nothing else may be in flight.
pub async fn perform<S>(
    framed: &mut Framed<S, FrameCodec>,
    credentials: &Credentials,
    server: &ServerAddress,
    timeout: Duration,
) -> Result<(), ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        let body = encode_auth_request(credentials).map_err(|e| ClientError::protocol(server, e))?;
        let request = message::encode(RequestId::HANDSHAKE, &body);
        framed.send(request).await.map_err(|e| frame_error(server, e))?;

        let payload = match framed.next().await {
            Some(Ok(payload)) => payload,
            Some(Err(e)) => return Err(frame_error(server, e)),
            None => {
                return Err(ClientError::transport(
                    server,
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed during handshake",
                    ),
                ))
            }
        };

        let (id, body) = message::decode(payload).map_err(|e| ClientError::protocol(server, e))?;
        if id != RequestId::HANDSHAKE {
            return Err(ClientError::protocol(
                server,
                ProtocolError::MalformedHandshake(format!("reply carried {}", id)),
            ));
        }
        match decode_auth_reply(body).map_err(|e| ClientError::protocol(server, e))? {
            AuthReply::Accepted => Ok(()),
            AuthReply::Rejected(reason) => Err(ClientError::AuthenticationRejected {
                server: server.clone(),
                reason,
            }),
        }
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::transport(
            server,
            std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out"),
        )),
    }
}

pub(crate) fn frame_error(server: &ServerAddress, err: FrameError) -> ClientError {
    match err {
        FrameError::Io(e) => ClientError::transport(server, e),
        FrameError::Protocol(e) => ClientError::protocol(server, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            username: "app".into(),
            password: "s3cret".into(),
        }
    }

    #[test]
    fn auth_request_layout() {
        let body = encode_auth_request(&creds()).unwrap();
        assert_eq!(body[0], AUTH_REQUEST_TAG);
        assert_eq!(&body[1..3], &[0, 3]);
        assert_eq!(&body[3..6], b"app");
        assert_eq!(decode_auth_request(body).unwrap(), creds());
    }

    #[test]
    fn oversized_credential_is_refused() {
        let creds = Credentials {
            username: "u".repeat(MAX_CREDENTIAL_LEN + 1),
            password: "pw".into(),
        };
        match encode_auth_request(&creds) {
            Err(ProtocolError::MalformedHandshake(msg)) => assert!(msg.starts_with("username")),
            other => panic!("unexpected: {:?}", other),
        }

        let creds = Credentials {
            username: "u".repeat(MAX_CREDENTIAL_LEN),
            password: "pw".into(),
        };
        let body = encode_auth_request(&creds).unwrap();
        assert_eq!(decode_auth_request(body).unwrap(), creds);
    }

    #[test]
    fn truncated_auth_request_is_malformed() {
        let body = encode_auth_request(&creds()).unwrap();
        assert!(decode_auth_request(body.slice(..5)).is_err());
    }

    #[test]
    fn reply_status() {
        assert_eq!(
            decode_auth_reply(encode_auth_reply(AUTH_ACCEPTED, "")).unwrap(),
            AuthReply::Accepted
        );
        assert_eq!(
            decode_auth_reply(encode_auth_reply(3, "bad password")).unwrap(),
            AuthReply::Rejected("bad password".into())
        );
        assert_eq!(
            decode_auth_reply(encode_auth_reply(9, "")).unwrap(),
            AuthReply::Rejected("status 9".into())
        );
        assert!(decode_auth_reply(Bytes::new()).is_err());
    }

    #[test]
    fn debug_redacts_password() {
        let rendered = format!("{:?}", creds());
        assert!(!rendered.contains("s3cret"));
    }

    #[tokio::test]
    async fn handshake_over_duplex() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let server = tokio::spawn(async move {
            let mut framed = Framed::new(server_io, FrameCodec::default());
            let payload = framed.next().await.unwrap().unwrap();
            let (id, body) = message::decode(payload).unwrap();
            let presented = decode_auth_request(body).unwrap();
            let reply = if presented.password == "s3cret" {
                encode_auth_reply(AUTH_ACCEPTED, "")
            } else {
                encode_auth_reply(1, "denied")
            };
            framed.send(message::encode(id, &reply)).await.unwrap();
        });

        let addr: ServerAddress = "127.0.0.1:7400".parse().unwrap();
        let mut framed = Framed::new(client_io, FrameCodec::default());
        perform(&mut framed, &creds(), &addr, Duration::from_secs(1))
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_times_out_on_silent_server() {
        let (client_io, _server_io) = tokio::io::duplex(1024);
        let addr: ServerAddress = "127.0.0.1:7400".parse().unwrap();
        let mut framed = Framed::new(client_io, FrameCodec::default());
        let err = perform(&mut framed, &creds(), &addr, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);
    }
}
