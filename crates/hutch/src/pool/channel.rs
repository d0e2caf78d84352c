//! The channel pool: plain and confirmation-mode AMQP channels multiplexed
//! over the connection pool.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use ahash::AHashMap;
use lapin::options::ConfirmSelectOptions;
use lapin::protocol::constants::REPLY_SUCCESS;

use super::inner::{deadline_as_timeout, Acquired, SlotGuard, SlotPool};
use super::{CloseEvent, ConnectionPool};
use crate::backoff::Backoff;
use crate::config::{PoolConfig, Seasoning};
use crate::letter::LetterId;
use crate::{Error, Result};

const EXPECT_MSG: &str = "BUG: pooled channel already taken!";

/// A pooled AMQP channel: the channel itself, the connection it rides on,
/// and, for confirmation-mode channels, the delivery-tag state used to
/// correlate broker confirms with letters.
pub struct PooledChannel {
    id: u64,
    connection_id: u64,
    channel: lapin::Channel,
    confirm_mode: bool,
    flagged: AtomicBool,
    /// Mirror of the broker's per-channel delivery-tag counter. Publishes on
    /// a channel are serialized by the lease, so this cannot drift while the
    /// channel lives; it starts over when the channel is rebuilt.
    next_tag: AtomicU64,
    /// Outstanding confirms: delivery tag → the letter that produced it.
    inflight: Mutex<AHashMap<u64, LetterId>>,
}

impl PooledChannel {
    fn new(id: u64, connection_id: u64, channel: lapin::Channel, confirm_mode: bool) -> Self {
        Self {
            id,
            connection_id,
            channel,
            confirm_mode,
            flagged: AtomicBool::new(false),
            next_tag: AtomicU64::new(1),
            inflight: Mutex::new(AHashMap::new()),
        }
    }

    /// Pool-local channel identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the pooled connection this channel was created on.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn is_confirm(&self) -> bool {
        self.confirm_mode
    }

    /// Mark for teardown-and-rebuild instead of reuse.
    pub fn flag(&self) {
        self.flagged.store(true, Ordering::Release);
    }

    pub fn is_flagged(&self) -> bool {
        self.flagged.load(Ordering::Acquire)
    }

    pub(crate) fn is_healthy(&self) -> bool {
        !self.is_flagged() && self.channel.status().connected()
    }

    /// Reserve the delivery tag the broker will assign to the next publish
    /// and record which letter it belongs to. Must be called before the
    /// frame is written.
    pub(crate) fn begin_publish(&self, letter_id: LetterId) -> u64 {
        let tag = self.next_tag.fetch_add(1, Ordering::AcqRel);
        self.inflight().insert(tag, letter_id);
        tag
    }

    /// Drop the tag mapping once the publish has a terminal disposition.
    pub(crate) fn end_publish(&self, tag: u64) {
        self.inflight().remove(&tag);
    }

    /// Number of publishes still waiting for a confirm on this channel.
    pub fn inflight_len(&self) -> usize {
        self.inflight().len()
    }

    fn drain_inflight(&self) -> Vec<(u64, LetterId)> {
        self.inflight().drain().collect()
    }

    fn inflight(&self) -> std::sync::MutexGuard<'_, AHashMap<u64, LetterId>> {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Deref for PooledChannel {
    type Target = lapin::Channel;

    fn deref(&self) -> &Self::Target {
        &self.channel
    }
}

struct ChannelPoolState {
    plain: Arc<SlotPool<PooledChannel>>,
    confirm: Arc<SlotPool<PooledChannel>>,
    connections: ConnectionPool,
    owns_connections: bool,
    config: PoolConfig,
    next_id: AtomicU64,
}

/// A bounded pool of AMQP channels in two groups (plain and
/// confirmation-mode) built over a [`ConnectionPool`].
///
/// Channels are created on demand, distributed over the pooled connections
/// as those rotate through their own idle queue, and rebuilt (possibly on a
/// different connection) when they die or come back flagged. A channel
/// creation failure that takes its connection down flags the connection too.
///
/// Cloning the pool is cheap; all clones share one state.
#[derive(Clone)]
pub struct ChannelPool(Arc<ChannelPoolState>);

impl ChannelPool {
    /// A pool that builds and owns its own connection pool; shutting this
    /// pool down cascades to the connections.
    pub fn new(seasoning: &Seasoning) -> Self {
        Self::build(seasoning, ConnectionPool::new(seasoning), true)
    }

    /// A pool over an externally owned connection pool; shutdown does not
    /// cascade.
    pub fn with_connection_pool(seasoning: &Seasoning, connections: ConnectionPool) -> Self {
        Self::build(seasoning, connections, false)
    }

    fn build(seasoning: &Seasoning, connections: ConnectionPool, owns_connections: bool) -> Self {
        let config = seasoning.pool.clone();
        Self(Arc::new(ChannelPoolState {
            plain: SlotPool::new_arc(config.max_channels),
            confirm: SlotPool::new_arc(config.max_confirm_channels),
            connections,
            owns_connections,
            config,
            next_id: AtomicU64::new(1),
        }))
    }

    /// The backing connection pool.
    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.0.connections
    }

    /// Lease a plain (fire-and-forget) channel.
    pub async fn get_channel(&self) -> Result<ChannelLease> {
        self.acquire(false).await
    }

    /// Lease a confirmation-mode channel.
    pub async fn get_confirm_channel(&self) -> Result<ChannelLease> {
        self.acquire(true).await
    }

    async fn acquire(&self, confirm: bool) -> Result<ChannelLease> {
        let budget = self.0.config.acquire_timeout();
        let deadline = Instant::now() + budget;

        tokio::time::timeout(budget, self.acquire_inner(deadline, confirm))
            .await
            .map_err(|_| Error::PoolExhausted)?
    }

    async fn acquire_inner(&self, deadline: Instant, confirm: bool) -> Result<ChannelLease> {
        let slots = self.slots(confirm);
        let timeout = deadline_as_timeout(deadline)?;

        match slots.acquire(timeout).await? {
            Acquired::Idle(channel, guard) => {
                if channel.is_healthy() {
                    return Ok(self.lease(channel, guard));
                }
                tracing::debug!(
                    channel_id = channel.id(),
                    connection_id = channel.connection_id(),
                    "discarding dead channel"
                );
                discard(channel);
                self.build_into_slot(deadline, confirm, guard).await
            }
            Acquired::Vacant(guard) => self.build_into_slot(deadline, confirm, guard).await,
        }
    }

    /// Open a fresh channel into an already-claimed slot, borrowing a
    /// connection per attempt so that rebuilds spread across the connection
    /// pool.
    async fn build_into_slot(
        &self,
        deadline: Instant,
        confirm: bool,
        guard: SlotGuard<PooledChannel>,
    ) -> Result<ChannelLease> {
        let mut guard = Some(guard);
        let mut backoff = Backoff::new(&self.0.config.reconnect);
        let mut attempts = 0u32;

        loop {
            if self.slots(confirm).is_closed() {
                return Err(Error::PoolShutdown);
            }

            let conn = self.0.connections.get().await?;
            match self.open_channel(&conn, confirm).await {
                Ok(channel) => {
                    tracing::debug!(
                        channel_id = channel.id(),
                        connection_id = channel.connection_id(),
                        confirm,
                        "opened channel"
                    );
                    return Ok(self.lease(channel, guard.take().expect(EXPECT_MSG)));
                }
                Err(error) => {
                    // A connection that died under us gets flagged so its
                    // slot is rebuilt too; a refusal on a live connection is
                    // retried on whichever connection rotates up next.
                    if !conn.status().connected() {
                        tracing::warn!(
                            connection_id = conn.id(),
                            error = %error,
                            "connection lost while opening channel"
                        );
                        conn.flag();
                    } else {
                        tracing::warn!(
                            connection_id = conn.id(),
                            error = %error,
                            "broker refused channel"
                        );
                    }
                    drop(conn);

                    attempts += 1;
                    let delay = backoff.next_delay();
                    if attempts >= self.0.config.reconnect.max_attempts
                        || Instant::now() + delay >= deadline
                    {
                        return Err(error);
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn open_channel(&self, conn: &super::ConnectionLease, confirm: bool) -> Result<PooledChannel> {
        let channel = conn
            .create_channel()
            .await
            .map_err(Error::ChannelOpenFailed)?;

        if confirm {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(Error::ChannelOpenFailed)?;
        }

        let id = self.0.next_id.fetch_add(1, Ordering::AcqRel);
        Ok(PooledChannel::new(id, conn.id(), channel, confirm))
    }

    fn lease(&self, channel: PooledChannel, guard: SlotGuard<PooledChannel>) -> ChannelLease {
        // The lease takes over the slot's accounting until it is returned.
        guard.cancel();
        ChannelLease {
            channel: Some(channel),
            pool: self.clone(),
        }
    }

    /// Flag a connection on the backing pool; used when a publish failure
    /// indicates the transport underneath the channel is gone.
    pub fn flag_connection(&self, connection_id: u64) {
        self.0.connections.flag_connection(connection_id);
    }

    pub(crate) async fn return_lease(&self, channel: PooledChannel) {
        let slots = self.slots(channel.is_confirm());
        let guard = SlotGuard::reclaim(Arc::clone(slots));
        if slots.is_closed() || !channel.is_healthy() {
            close_channel(channel).await;
            drop(guard);
        } else {
            slots.release(channel, guard);
        }
    }

    /// Shut the pool down: reject new gets, close idle channels, wait for
    /// leases to return, and cascade to the connection pool when this pool
    /// owns it. Idempotent.
    pub async fn shutdown(&self) {
        if !self.0.plain.is_closed() {
            tracing::info!("shutting down channel pool");
        }

        // Mark both groups first so gets and confirm waits abort before we
        // start waiting on leases.
        self.0.plain.mark_closed();
        self.0.confirm.mark_closed();

        self.0.plain.close(close_channel).await;
        self.0.confirm.close(close_channel).await;

        if self.0.owns_connections {
            self.0.connections.shutdown().await;
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.0.plain.is_closed()
    }

    /// A future that resolves when [`shutdown`](ChannelPool::shutdown)
    /// begins; confirm waits race against it.
    pub fn close_event(&self) -> CloseEvent {
        self.0.confirm.close_event()
    }

    /// Live plain channels, leased and idle together.
    pub fn plain_size(&self) -> u32 {
        self.0.plain.size()
    }

    /// Live confirmation-mode channels, leased and idle together.
    pub fn confirm_size(&self) -> u32 {
        self.0.confirm.size()
    }

    fn slots(&self, confirm: bool) -> &Arc<SlotPool<PooledChannel>> {
        if confirm {
            &self.0.confirm
        } else {
            &self.0.plain
        }
    }
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("plain_size", &self.plain_size())
            .field("confirm_size", &self.confirm_size())
            .field("is_shut_down", &self.is_shut_down())
            .finish()
    }
}

/// An RAII lease on a pooled channel. Returned to its group on drop; a
/// flagged or dead channel is closed and its slot rebuilt instead.
pub struct ChannelLease {
    channel: Option<PooledChannel>,
    pool: ChannelPool,
}

impl Deref for ChannelLease {
    type Target = PooledChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref().expect(EXPECT_MSG)
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move { pool.return_lease(channel).await });
        }
    }
}

/// Close a dead channel in the background; its slot is already claimed by
/// the caller.
fn discard(channel: PooledChannel) {
    tokio::spawn(close_channel(channel));
}

async fn close_channel(channel: PooledChannel) {
    let outstanding = channel.drain_inflight();
    if !outstanding.is_empty() {
        // The tasks awaiting these confirms observe the channel's death
        // through their confirm futures and emit the failure notifications.
        tracing::warn!(
            channel_id = channel.id(),
            outstanding = outstanding.len(),
            "closing channel with unconfirmed publishes"
        );
    }

    match channel.close(REPLY_SUCCESS, "discarded").await {
        Ok(()) => tracing::debug!(channel_id = channel.id(), "closed channel"),
        Err(lapin::Error::InvalidChannelState(_)) | Err(lapin::Error::InvalidConnectionState(_)) => {
            tracing::debug!(channel_id = channel.id(), "discarded already-dead channel");
        }
        Err(error) => tracing::warn!(
            channel_id = channel.id(),
            error = %error,
            "failed to close channel cleanly"
        ),
    }
}
