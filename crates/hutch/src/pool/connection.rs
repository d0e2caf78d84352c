//! The connection pool: bounded, lazily opened, self-healing.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use ahash::AHashMap;
use lapin::protocol::constants::REPLY_SUCCESS;
use lapin::ConnectionProperties;

use super::inner::{deadline_as_timeout, Acquired, SlotGuard, SlotPool};
use super::CloseEvent;
use crate::backoff::Backoff;
use crate::config::{PoolConfig, Seasoning};
use crate::{Error, Result};

const EXPECT_MSG: &str = "BUG: pooled connection already taken!";

/// A long-lived AMQP connection with its pool-local identity and health
/// flag.
#[derive(Debug)]
pub struct PooledConnection {
    id: u64,
    conn: lapin::Connection,
    flagged: Arc<AtomicBool>,
}

impl PooledConnection {
    /// Pool-local, monotonically assigned identity. Channels remember the id
    /// of the connection they were built on.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Mark for teardown-and-rebuild instead of reuse.
    pub fn flag(&self) {
        self.flagged.store(true, Ordering::Release);
    }

    pub fn is_flagged(&self) -> bool {
        self.flagged.load(Ordering::Acquire)
    }

    pub(crate) fn is_healthy(&self) -> bool {
        !self.is_flagged() && self.conn.status().connected()
    }
}

impl Deref for PooledConnection {
    type Target = lapin::Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

struct PoolState {
    slots: Arc<SlotPool<PooledConnection>>,
    config: PoolConfig,
    next_id: AtomicU64,
    /// Health flags by connection id, shared with the pooled connections
    /// themselves, so a connection sitting in the idle queue can still be
    /// flagged by id.
    flags: Mutex<AHashMap<u64, Arc<AtomicBool>>>,
}

/// A bounded pool of long-lived AMQP connections.
///
/// Connections are opened on demand up to the configured maximum, lent out
/// through RAII [`ConnectionLease`]s, and kept until they die or are
/// flagged. A dead or flagged connection popped from the idle queue is
/// closed and reopened in place, with exponential backoff, within the
/// caller's acquire budget.
///
/// Cloning the pool is cheap; all clones share one state.
#[derive(Clone)]
pub struct ConnectionPool(Arc<PoolState>);

impl ConnectionPool {
    /// A lazy pool: no connection is opened until the first [`get`].
    ///
    /// [`get`]: ConnectionPool::get
    pub fn new(seasoning: &Seasoning) -> Self {
        let config = seasoning.pool.clone();
        Self(Arc::new(PoolState {
            slots: SlotPool::new_arc(config.max_connections),
            config,
            next_id: AtomicU64::new(1),
            flags: Mutex::new(AHashMap::new()),
        }))
    }

    /// Eagerly open every connection slot. Fails with
    /// `ConnectionOpenFailed` on the first open the broker refuses.
    pub async fn warm_up(&self) -> Result<()> {
        let mut leases = Vec::with_capacity(self.0.config.max_connections as usize);
        for _ in 0..self.0.config.max_connections {
            leases.push(self.acquire(true).await?);
        }
        tracing::info!(connections = leases.len(), "connection pool warmed up");
        Ok(())
    }

    /// Lease a healthy connection, rebuilding a dead slot if that is what
    /// the queue hands us. Bounded by the configured acquire timeout:
    /// expiry maps to `PoolExhausted`, shutdown to `PoolShutdown`.
    pub async fn get(&self) -> Result<ConnectionLease> {
        self.acquire(false).await
    }

    async fn acquire(&self, fail_fast: bool) -> Result<ConnectionLease> {
        let budget = self.0.config.acquire_timeout();
        let deadline = Instant::now() + budget;

        tokio::time::timeout(budget, self.acquire_inner(deadline, fail_fast))
            .await
            .map_err(|_| Error::PoolExhausted)?
    }

    async fn acquire_inner(&self, deadline: Instant, fail_fast: bool) -> Result<ConnectionLease> {
        let timeout = deadline_as_timeout(deadline)?;
        let mut backoff = Backoff::new(&self.0.config.reconnect);

        match self.0.slots.acquire(timeout).await? {
            Acquired::Idle(conn, guard) => {
                if conn.is_healthy() {
                    return Ok(self.lease(conn, guard));
                }
                tracing::debug!(connection_id = conn.id(), "discarding unhealthy connection");
                self.discard(conn);
                self.open_into_slot(deadline, &mut backoff, fail_fast, guard)
                    .await
            }
            Acquired::Vacant(guard) => {
                self.open_into_slot(deadline, &mut backoff, fail_fast, guard)
                    .await
            }
        }
    }

    /// Open a fresh connection into an already-claimed slot, backing off
    /// between attempts until the deadline or the attempt budget runs out.
    async fn open_into_slot(
        &self,
        deadline: Instant,
        backoff: &mut Backoff,
        fail_fast: bool,
        guard: SlotGuard<PooledConnection>,
    ) -> Result<ConnectionLease> {
        let mut guard = Some(guard);
        let mut attempts = 0u32;
        loop {
            if self.0.slots.is_closed() {
                return Err(Error::PoolShutdown);
            }

            match self.open_connection().await {
                Ok(conn) => {
                    tracing::debug!(connection_id = conn.id(), "opened connection");
                    return Ok(self.lease(conn, guard.take().expect(EXPECT_MSG)));
                }
                Err(error @ Error::ConnectionOpenFailed(_)) if !fail_fast => {
                    attempts += 1;
                    let delay = backoff.next_delay();
                    if attempts >= self.0.config.reconnect.max_attempts
                        || Instant::now() + delay >= deadline
                    {
                        tracing::warn!(error = %error, attempts, "connection open retries exhausted");
                        return Err(Error::PoolExhausted);
                    }
                    tracing::warn!(error = %error, ?delay, "failed to open connection; backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn open_connection(&self) -> Result<PooledConnection> {
        let config = &self.0.config;
        let options = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        let uri = config.amqp_uri();

        let connected = match &config.tls.ca_cert_path {
            Some(path) => {
                let cert_chain = tokio::fs::read_to_string(path).await.map_err(|e| {
                    Error::Configuration(format!(
                        "failed to read CA certificate {}: {e}",
                        path.display()
                    ))
                })?;
                lapin::Connection::connect_with_config(
                    &uri,
                    options,
                    lapin::tcp::OwnedTLSConfig {
                        identity: None,
                        cert_chain: Some(cert_chain),
                    },
                )
                .await
            }
            None => lapin::Connection::connect(&uri, options).await,
        };

        let conn = connected.map_err(Error::ConnectionOpenFailed)?;
        let id = self.0.next_id.fetch_add(1, Ordering::AcqRel);
        let flagged = Arc::new(AtomicBool::new(false));
        self.flags().insert(id, Arc::clone(&flagged));

        Ok(PooledConnection { id, conn, flagged })
    }

    fn lease(&self, conn: PooledConnection, guard: SlotGuard<PooledConnection>) -> ConnectionLease {
        // The lease takes over the slot's accounting until it is returned.
        guard.cancel();
        ConnectionLease {
            conn: Some(conn),
            pool: self.clone(),
        }
    }

    /// Flag a connection by id for teardown-and-rebuild before its next
    /// lease. Ids of connections already torn down are ignored.
    pub fn flag_connection(&self, connection_id: u64) {
        if let Some(flag) = self.flags().get(&connection_id) {
            tracing::warn!(connection_id, "connection flagged for reconnect");
            flag.store(true, Ordering::Release);
        }
    }

    /// Close a dead connection in the background; its slot stays claimed by
    /// the caller.
    fn discard(&self, conn: PooledConnection) {
        self.flags().remove(&conn.id());
        tokio::spawn(close_quietly(conn));
    }

    pub(crate) async fn return_lease(&self, conn: PooledConnection) {
        let guard = SlotGuard::reclaim(Arc::clone(&self.0.slots));
        if self.0.slots.is_closed() || !conn.is_healthy() {
            self.flags().remove(&conn.id());
            close_quietly(conn).await;
            drop(guard);
        } else {
            self.0.slots.release(conn, guard);
        }
    }

    /// Shut the pool down: reject new gets (including current waiters),
    /// close idle connections, and wait for outstanding leases to return.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if !self.0.slots.is_closed() {
            tracing::info!("shutting down connection pool");
        }
        self.0.slots.close(|conn| self.destroy(conn)).await;
    }

    async fn destroy(&self, conn: PooledConnection) {
        self.flags().remove(&conn.id());
        close_quietly(conn).await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.0.slots.is_closed()
    }

    /// A future that resolves when [`shutdown`](ConnectionPool::shutdown)
    /// begins.
    pub fn close_event(&self) -> CloseEvent {
        self.0.slots.close_event()
    }

    /// Live connections, leased and idle together.
    pub fn size(&self) -> u32 {
        self.0.slots.size()
    }

    pub fn num_idle(&self) -> usize {
        self.0.slots.num_idle()
    }

    fn flags(&self) -> std::sync::MutexGuard<'_, AHashMap<u64, Arc<AtomicBool>>> {
        self.0.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.size())
            .field("num_idle", &self.num_idle())
            .field("is_shut_down", &self.is_shut_down())
            .finish()
    }
}

/// An RAII lease on a pooled connection. Returned to the pool on drop; a
/// flagged connection is closed and its slot rebuilt instead.
#[derive(Debug)]
pub struct ConnectionLease {
    conn: Option<PooledConnection>,
    pool: ConnectionPool,
}

impl Deref for ConnectionLease {
    type Target = PooledConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect(EXPECT_MSG)
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move { pool.return_lease(conn).await });
        }
    }
}

async fn close_quietly(conn: PooledConnection) {
    match conn.close(REPLY_SUCCESS, "discarded").await {
        Ok(()) => tracing::debug!(connection_id = conn.id(), "closed connection"),
        Err(lapin::Error::InvalidConnectionState(_)) => {
            tracing::debug!(connection_id = conn.id(), "discarded already-lost connection");
        }
        Err(error) => tracing::warn!(
            connection_id = conn.id(),
            error = %error,
            "failed to close connection cleanly"
        ),
    }
}
