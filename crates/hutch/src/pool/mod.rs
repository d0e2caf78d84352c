//! Bounded, self-healing pools for AMQP connections and channels.
//!
//! Opening a broker connection per publish would dominate the cost of the
//! publish itself, and AMQP channels are cheap but stateful. The pools here
//! keep both warm: up to a fixed number of long-lived connections, and two
//! groups of channels (plain and confirmation-mode) multiplexed over them.
//!
//! Both pools share a recovery discipline: a resource that fails, or is
//! flagged by its user, is closed and rebuilt before it is lent again, with
//! exponential backoff between rebuild attempts. Acquire calls are bounded
//! by the configured wait budget and honor shutdown immediately.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use event_listener::EventListener;
use futures_core::future::FusedFuture;
use futures_util::FutureExt;

use crate::{Error, Result};

mod channel;
mod connection;
mod inner;

pub use channel::{ChannelLease, ChannelPool, PooledChannel};
pub use connection::{ConnectionLease, ConnectionPool, PooledConnection};

/// A future that resolves when a pool begins shutting down.
///
/// Obtained from [`ConnectionPool::close_event`] or
/// [`ChannelPool::close_event`]; used to cancel long waits (a confirm that
/// will never arrive, an acquire that can never be served) the moment
/// shutdown starts.
pub struct CloseEvent {
    pub(crate) listener: Option<EventListener>,
}

impl CloseEvent {
    /// Execute the given future until it returns or the pool is closed.
    ///
    /// Cancels the future and returns `Err(PoolShutdown)` if/when the pool
    /// closes. If the pool was already closed, the future is never run.
    pub async fn do_until<Fut: Future>(&mut self, fut: Fut) -> Result<Fut::Output> {
        // Check that the pool wasn't closed already.
        //
        // `poll_immediate()` uses the real waker instead of a no-op one like
        // `.now_or_never()` would, but doesn't suspend execution here.
        futures_util::future::poll_immediate(&mut *self)
            .await
            .map_or(Ok(()), |_| Err(Error::PoolShutdown))?;

        futures_util::pin_mut!(fut);

        futures_util::future::poll_fn(|cx| {
            // Poll `fut` first as the wakeup event is more likely for it than
            // for `self`.
            if let Poll::Ready(ret) = fut.as_mut().poll(cx) {
                return Poll::Ready(Ok(ret));
            }

            self.poll_unpin(cx).map(|_| Err(Error::PoolShutdown))
        })
        .await
    }
}

impl Future for CloseEvent {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(listener) = &mut self.listener {
            futures_core::ready!(listener.poll_unpin(cx));
        }

        // `EventListener` doesn't like being polled after it yields, and even
        // if it did it would just wait for the next event. Fuse so that once
        // the close fires we keep returning ready.
        self.listener = None;

        Poll::Ready(())
    }
}

impl FusedFuture for CloseEvent {
    fn is_terminated(&self) -> bool {
        self.listener.is_none()
    }
}

#[test]
#[allow(dead_code)]
fn assert_pool_traits() {
    fn assert_send_sync<T: Send + Sync>() {}
    fn assert_clone<T: Clone>() {}

    fn assert_pools() {
        assert_send_sync::<ConnectionPool>();
        assert_clone::<ConnectionPool>();
        assert_send_sync::<ChannelPool>();
        assert_clone::<ChannelPool>();
        assert_send_sync::<ChannelLease>();
    }
}
