//! Shared utilities for integration testing: an in-process server speaking
//! the client's wire protocol.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cluster_client::net::frame::FrameCodec;
use cluster_client::net::handshake::{self, Credentials, AUTH_ACCEPTED};
use cluster_client::net::message;
use cluster_client::{ClientConfig, RequestId, ServerAddress};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

/// How the mock server answers requests.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Echo the body back under the same request id.
    Echo,
    /// Echo after sleeping.
    Delay(Duration),
    /// Answer with a request id that was never sent.
    WrongId,
    /// Read requests, never answer.
    Silent,
    /// Refuse every handshake.
    RejectAuth,
}

/// A running mock server.
pub struct MockServer {
    pub addr: ServerAddress,
    accepted: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
    credentials: Arc<Mutex<Option<Credentials>>>,
}

impl MockServer {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: ServerAddress = listener.local_addr().unwrap().into();
        let accepted = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(AtomicUsize::new(0));
        let credentials = Arc::new(Mutex::new(None));

        let state = (accepted.clone(), requests.clone(), credentials.clone());
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                state.0.fetch_add(1, Ordering::SeqCst);
                let requests = state.1.clone();
                let credentials = state.2.clone();
                tokio::spawn(serve(socket, behavior, requests, credentials));
            }
        });

        Self {
            addr,
            accepted,
            requests,
            credentials,
        }
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Non-handshake requests received so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Credentials from the most recent handshake.
    pub fn last_credentials(&self) -> Option<Credentials> {
        self.credentials.lock().clone()
    }
}

async fn serve(
    socket: TcpStream,
    behavior: Behavior,
    requests: Arc<AtomicUsize>,
    credentials: Arc<Mutex<Option<Credentials>>>,
) {
    let mut framed = Framed::new(socket, FrameCodec::default());
    while let Some(Ok(frame)) = framed.next().await {
        let Ok((id, body)) = message::decode(frame) else {
            return;
        };

        if id == RequestId::HANDSHAKE {
            let Ok(creds) = handshake::decode_auth_request(body) else {
                return;
            };
            *credentials.lock() = Some(creds);
            if matches!(behavior, Behavior::RejectAuth) {
                let reply = handshake::encode_auth_reply(1, "invalid credentials");
                let _ = framed.send(message::encode(id, &reply)).await;
                return;
            }
            let reply = handshake::encode_auth_reply(AUTH_ACCEPTED, "");
            if framed.send(message::encode(id, &reply)).await.is_err() {
                return;
            }
            continue;
        }

        requests.fetch_add(1, Ordering::SeqCst);
        let reply = match behavior {
            Behavior::Echo | Behavior::RejectAuth => message::encode(id, &body),
            Behavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                message::encode(id, &body)
            }
            Behavior::WrongId => message::encode(RequestId::new(id.as_u64() + 1_000_000), &body),
            Behavior::Silent => continue,
        };
        if framed.send(reply).await.is_err() {
            return;
        }
    }
}

/// An address nothing listens on.
pub async fn dead_address() -> ServerAddress {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.into()
}

/// Config with fast timeouts and the health monitor off.
pub fn test_config(servers: &[ServerAddress]) -> ClientConfig {
    let mut config = ClientConfig::with_servers(servers.iter().cloned());
    config.handle_timeout_millis = 2_000;
    config.connection.acquire_timeout_millis = 2_000;
    config.connection.connect_timeout_millis = 500;
    config.health.enabled = false;
    config
}

/// Decoder that returns the raw body as a string.
pub fn text(body: bytes::Bytes) -> Result<String, std::string::FromUtf8Error> {
    String::from_utf8(body.to_vec())
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
