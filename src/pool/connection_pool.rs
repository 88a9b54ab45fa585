//! Bounded per-server connection pool.
//!
//! # Responsibilities
//! - Hand out Ready connections, FIFO by idle time
//! - Create connections up to `max_pool_size`
//! - Queue acquirers (bounded) and serve them in arrival order
//! - Forget connections that close, replacing them for queued acquirers
//!
//! # Locking
//! All bookkeeping lives behind one `parking_lot::Mutex`. Nothing awaits
//! while holding it, and `Connection::close` is never called under it
//! (closing re-enters the pool through `ConnectionOwner`).

use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::config::ClientConfig;
use crate::error::{ClientError, CloseReason};
use crate::net::address::ServerAddress;
use crate::net::connection::{
    ConnectSettings, Connection, ConnectionId, ConnectionOwner, ConnectionState,
};

/// Pool sizing and timing.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub max_pending_acquires: usize,
    pub connect: ConnectSettings,
}

impl PoolSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_size: config.connection.max_pool_size,
            acquire_timeout: config.connection.acquire_timeout(),
            max_pending_acquires: config.connection.max_pending_acquires,
            connect: config.connect_settings(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

/// Connection counts, taken under a single lock.
///
/// `total == active + idle` always holds; `active` includes connections that
/// are busy or marked unhealthy and awaiting reclamation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub total: usize,
    pub waiting: usize,
}

impl std::ops::Add for PoolStats {
    type Output = PoolStats;

    fn add(self, rhs: PoolStats) -> PoolStats {
        PoolStats {
            active: self.active + rhs.active,
            idle: self.idle + rhs.idle,
            total: self.total + rhs.total,
            waiting: self.waiting + rhs.waiting,
        }
    }
}

/// What one health sweep did to a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub closed_idle: usize,
    pub marked_unhealthy: usize,
    pub expired_requests: usize,
}

type Delivery = Result<Arc<Connection>, ClientError>;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Delivery>,
}

#[derive(Default)]
struct PoolState {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    idle: VecDeque<ConnectionId>,
    creating: usize,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
    closed: bool,
}

impl PoolState {
    /// Oldest idle connection that can still be moved to Busy.
    fn pop_idle(&mut self) -> Option<Arc<Connection>> {
        while let Some(id) = self.idle.pop_front() {
            let Some(conn) = self.connections.get(&id) else {
                continue;
            };
            if conn.mark_busy() {
                return Some(conn.clone());
            }
            if conn.is_closed() {
                self.connections.remove(&id);
            }
        }
        None
    }

    /// Give a Busy connection to the longest waiter, or park it as idle.
    fn hand_off(&mut self, mut conn: Arc<Connection>) {
        while let Some(waiter) = self.waiters.pop_front() {
            conn.touch();
            match waiter.tx.send(Ok(conn)) {
                Ok(()) => return,
                // Acquirer went away; try the next one.
                Err(Ok(returned)) => conn = returned,
                Err(Err(_)) => return,
            }
        }
        if conn.mark_ready() {
            self.idle.push_back(conn.id());
        }
    }

    /// Fail the longest live waiter with `err`.
    fn fail_waiter(&mut self, err: ClientError) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.tx.send(Err(err.clone())).is_ok() {
                return;
            }
        }
    }

    fn forget(&mut self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(&id);
        if removed.is_some() {
            self.idle.retain(|idle| *idle != id);
        }
        removed
    }

    fn stats(&self) -> PoolStats {
        let total = self.connections.len();
        let idle = self.idle.len();
        PoolStats {
            active: total - idle,
            idle,
            total,
            waiting: self.waiters.len(),
        }
    }
}

/// Connection pool for one server address.
pub struct ConnectionPool {
    server: ServerAddress,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    self_ref: Weak<ConnectionPool>,
}

impl ConnectionPool {
    pub fn new(server: ServerAddress, settings: PoolSettings) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            server,
            settings,
            state: Mutex::new(PoolState::default()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn server(&self) -> &ServerAddress {
        &self.server
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats()
    }

    /// Every connection currently tracked, in no particular order.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.state.lock().connections.values().cloned().collect()
    }

    /// Acquire a connection using the configured acquire timeout.
    pub async fn get(self: &Arc<Self>) -> Result<PooledConnection, ClientError> {
        self.acquire(self.settings.acquire_timeout).await
    }

    /// Acquire a Busy connection, waiting at most `timeout` for one.
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<PooledConnection, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;

        let (waiter_id, rx) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ClientError::PoolClosed(self.server.clone()));
            }
            if let Some(conn) = state.pop_idle() {
                return Ok(self.wrap(conn));
            }

            let can_create = state.connections.len() + state.creating < self.settings.max_size;
            let queued = state.waiters.len().saturating_sub(state.creating);
            if !can_create && queued >= self.settings.max_pending_acquires {
                tracing::debug!(server = %self.server, waiting = state.waiters.len(), "Pool exhausted");
                return Err(ClientError::PoolExhausted {
                    server: self.server.clone(),
                    waiting: state.waiters.len(),
                });
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter;
            state.next_waiter += 1;
            state.waiters.push_back(Waiter { id, tx });
            self.replenish(&mut state);
            (id, rx)
        };

        let mut waiting = Waiting {
            pool: self,
            id: waiter_id,
            rx: Some(rx),
        };
        let waited = match waiting.rx.as_mut() {
            Some(rx) => tokio::time::timeout_at(deadline, rx).await,
            None => return Err(ClientError::PoolClosed(self.server.clone())),
        };

        match waited {
            Ok(delivery) => {
                waiting.rx = None;
                match delivery {
                    Ok(Ok(conn)) => Ok(self.wrap(conn)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(ClientError::PoolClosed(self.server.clone())),
                }
            }
            Err(_) => {
                let rx = waiting.rx.take();
                if let Some(conn) = rx.and_then(|rx| self.cancel_wait(waiter_id, rx)) {
                    // Served just as the deadline passed.
                    return Ok(self.wrap(conn));
                }
                Err(ClientError::AcquireTimeout {
                    server: self.server.clone(),
                    waited: timeout,
                })
            }
        }
    }

    fn wrap(self: &Arc<Self>, conn: Arc<Connection>) -> PooledConnection {
        PooledConnection {
            conn,
            pool: self.clone(),
        }
    }

    /// Withdraw a waiter. Returns the connection if it was served meanwhile.
    fn cancel_wait(&self, id: u64, mut rx: oneshot::Receiver<Delivery>) -> Option<Arc<Connection>> {
        {
            let mut state = self.state.lock();
            if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
                state.waiters.remove(pos);
                return None;
            }
        }
        // Waiters are served under the lock, so any delivery is already here.
        match rx.try_recv() {
            Ok(Ok(conn)) => Some(conn),
            _ => None,
        }
    }

    /// Return a Busy connection to the pool.
    pub fn release(&self, conn: Arc<Connection>) {
        let mut state = self.state.lock();
        if conn.is_closed() || !state.connections.contains_key(&conn.id()) {
            return;
        }
        state.hand_off(conn);
    }

    /// Remove a connection from the pool and close it.
    pub fn evict(&self, conn: &Connection, reason: CloseReason) {
        {
            let mut state = self.state.lock();
            state.forget(conn.id());
            self.replenish(&mut state);
        }
        conn.close(reason);
    }

    /// Close every connection and fail every waiter. Idempotent.
    pub fn close(&self) {
        let (connections, waiters) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.idle.clear();
            let connections: Vec<_> = state.connections.drain().map(|(_, c)| c).collect();
            let waiters: Vec<_> = state.waiters.drain(..).collect();
            (connections, waiters)
        };

        for waiter in waiters {
            let _ = waiter.tx.send(Err(ClientError::PoolClosed(self.server.clone())));
        }
        let count = connections.len();
        for conn in connections {
            conn.close(CloseReason::Shutdown);
        }
        tracing::debug!(server = %self.server, connections = count, "Pool closed");
    }

    /// Apply the idle rules to every connection.
    ///
    /// Ready connections idle past `idle_close` are closed; otherwise those
    /// idle past `unhealthy_after` are marked Unhealthy and withdrawn. An
    /// Unhealthy connection left by an earlier sweep is closed. Busy
    /// connections are never reclaimed, but their overdue requests expire.
    pub fn sweep(&self, now: Instant, idle_close: Duration, unhealthy_after: Duration) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let mut to_close = Vec::new();
        let mut busy = Vec::new();
        {
            let mut state = self.state.lock();
            let ids: Vec<ConnectionId> = state.connections.keys().copied().collect();
            for id in ids {
                let Some(conn) = state.connections.get(&id).cloned() else {
                    continue;
                };
                match conn.state() {
                    ConnectionState::Ready if conn.idle_for(now) > idle_close => {
                        state.forget(id);
                        to_close.push(conn);
                    }
                    ConnectionState::Ready if conn.idle_for(now) > unhealthy_after => {
                        if conn.mark_unhealthy() {
                            state.idle.retain(|idle| *idle != id);
                            outcome.marked_unhealthy += 1;
                        }
                    }
                    ConnectionState::Unhealthy => {
                        state.forget(id);
                        to_close.push(conn);
                    }
                    ConnectionState::Busy => busy.push(conn),
                    _ => {}
                }
            }
            if !to_close.is_empty() {
                self.replenish(&mut state);
            }
        }

        for conn in to_close {
            if conn.close(CloseReason::Idle) {
                outcome.closed_idle += 1;
            }
        }
        for conn in busy {
            outcome.expired_requests += conn.correlator().expire_overdue(now).len();
        }
        outcome
    }

    /// Start creating connections while queued acquirers outnumber creations
    /// in flight and capacity allows.
    fn replenish(&self, state: &mut PoolState) {
        while !state.closed
            && state.waiters.len() > state.creating
            && state.connections.len() + state.creating < self.settings.max_size
        {
            let Ok(handle) = Handle::try_current() else {
                return;
            };
            let Some(pool) = self.self_ref.upgrade() else {
                return;
            };
            state.creating += 1;
            handle.spawn(async move { pool.create_connection().await });
        }
    }

    async fn create_connection(self: Arc<Self>) {
        let owner: Weak<dyn ConnectionOwner> = self.self_ref.clone();
        let result = Connection::open(&self.server, &self.settings.connect, Some(owner)).await;

        let mut state = self.state.lock();
        state.creating = state.creating.saturating_sub(1);
        match result {
            Ok(conn) => {
                if state.closed {
                    drop(state);
                    conn.close(CloseReason::Shutdown);
                    return;
                }
                if !conn.mark_busy() {
                    // Closed before it could be used.
                    self.replenish(&mut state);
                    return;
                }
                tracing::debug!(server = %self.server, connection_id = %conn.id(), "Connection created");
                state.connections.insert(conn.id(), conn.clone());
                state.hand_off(conn);
            }
            Err(e) => {
                tracing::warn!(server = %self.server, error = %e, "Failed to create connection");
                state.fail_waiter(e);
                self.replenish(&mut state);
            }
        }
    }
}

impl ConnectionOwner for ConnectionPool {
    fn on_connection_closed(&self, id: ConnectionId, reason: &CloseReason) {
        let mut state = self.state.lock();
        if state.forget(id).is_some() {
            tracing::trace!(server = %self.server, connection_id = %id, reason = %reason, "Pool forgot connection");
            self.replenish(&mut state);
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("server", &self.server)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Withdraws the waiter if the acquiring future is dropped mid-wait.
struct Waiting<'a> {
    pool: &'a ConnectionPool,
    id: u64,
    rx: Option<oneshot::Receiver<Delivery>>,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            if let Some(conn) = self.pool.cancel_wait(self.id, rx) {
                self.pool.release(conn);
            }
        }
    }
}

/// A connection checked out of a pool. Returns to the pool on drop.
pub struct PooledConnection {
    conn: Arc<Connection>,
    pool: Arc<ConnectionPool>,
}

impl PooledConnection {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Evict instead of returning to the pool.
    pub fn discard(self, reason: CloseReason) {
        // Drop then sees a closed connection and does nothing.
        self.pool.evict(&self.conn, reason);
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.release(self.conn.clone());
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.conn)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::frame::FrameCodec;
    use crate::net::message;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    /// Echo server that accepts any number of connections.
    async fn echo_server() -> ServerAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, FrameCodec::default());
                    while let Some(Ok(frame)) = framed.next().await {
                        let (id, body) = message::decode(frame).unwrap();
                        if framed.send(message::encode(id, &body)).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr.into()
    }

    fn settings(max_size: usize, max_pending: usize) -> PoolSettings {
        PoolSettings {
            max_size,
            acquire_timeout: Duration::from_secs(2),
            max_pending_acquires: max_pending,
            connect: ConnectSettings::default(),
        }
    }

    #[tokio::test]
    async fn reuses_released_connection() {
        let pool = ConnectionPool::new(echo_server().await, settings(2, 8));

        let first = pool.get().await.unwrap();
        let id = first.id();
        assert_eq!(first.state(), ConnectionState::Busy);
        drop(first);

        let stats = pool.stats();
        assert_eq!((stats.total, stats.idle, stats.active), (1, 1, 0));

        let second = pool.get().await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(pool.stats().total, 1);
    }

    #[tokio::test]
    async fn waiters_are_served_in_order() {
        let pool = ConnectionPool::new(echo_server().await, settings(1, 8));
        let held = pool.get().await.unwrap();

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut tasks = Vec::new();
        for i in 0..3 {
            let pool = pool.clone();
            let order_tx = order_tx.clone();
            tasks.push(tokio::spawn(async move {
                let conn = pool.get().await.unwrap();
                order_tx.send(i).unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(conn);
            }));
            // Let each task enqueue before the next.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(pool.stats().waiting, 3);
        drop(held);

        for task in tasks {
            task.await.unwrap();
        }
        let order: Vec<i32> = std::iter::from_fn(|| order_rx.try_recv().ok()).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(pool.stats().total, 1);
    }

    #[tokio::test]
    async fn fails_fast_past_pending_limit() {
        let pool = ConnectionPool::new(echo_server().await, settings(1, 1));
        let _held = pool.get().await.unwrap();

        let queued = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_millis(300)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = pool.acquire(Duration::from_millis(300)).await.unwrap_err();
        assert!(matches!(err, ClientError::PoolExhausted { waiting: 1, .. }));

        let err = queued.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::AcquireTimeout { .. }));
        assert_eq!(pool.stats().waiting, 0);
    }

    #[tokio::test]
    async fn close_fails_waiters_and_is_idempotent() {
        let pool = ConnectionPool::new(echo_server().await, settings(1, 8));
        let held = pool.get().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.close();
        pool.close();
        assert!(matches!(waiter.await.unwrap(), Err(ClientError::PoolClosed(_))));
        assert!(held.is_closed());
        drop(held);
        assert_eq!(pool.stats(), PoolStats::default());
        assert!(matches!(pool.get().await, Err(ClientError::PoolClosed(_))));
    }

    #[tokio::test]
    async fn closed_connection_is_forgotten() {
        let pool = ConnectionPool::new(echo_server().await, settings(2, 8));
        let conn = pool.get().await.unwrap();
        conn.close(CloseReason::Explicit);
        assert_eq!(pool.stats().total, 0);
        drop(conn);
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn sweep_closes_idle_connections_only() {
        let pool = ConnectionPool::new(echo_server().await, settings(2, 8));
        let busy = pool.get().await.unwrap();
        let idle = pool.get().await.unwrap();
        drop(idle);
        assert_eq!(pool.stats().total, 2);

        let later = Instant::now() + Duration::from_secs(120);
        let outcome = pool.sweep(later, Duration::from_secs(30), Duration::from_secs(60));
        assert_eq!(outcome.closed_idle, 1);
        assert_eq!(pool.stats().total, 1);
        assert!(!busy.is_closed());
    }

    #[tokio::test]
    async fn sweep_marks_then_closes_unhealthy() {
        let pool = ConnectionPool::new(echo_server().await, settings(1, 8));
        drop(pool.get().await.unwrap());

        let later = Instant::now() + Duration::from_secs(10);
        let outcome = pool.sweep(later, Duration::from_secs(60), Duration::from_secs(5));
        assert_eq!(outcome.marked_unhealthy, 1);
        let stats = pool.stats();
        assert_eq!((stats.total, stats.idle), (1, 0));

        let outcome = pool.sweep(later, Duration::from_secs(60), Duration::from_secs(5));
        assert_eq!(outcome.closed_idle, 1);
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn connect_failure_reaches_acquirer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: ServerAddress = listener.local_addr().unwrap().into();
        drop(listener);

        let pool = ConnectionPool::new(addr, settings(1, 8));
        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, ClientError::Transport { .. }), "{err}");
        assert_eq!(pool.stats(), PoolStats::default());
    }
}
