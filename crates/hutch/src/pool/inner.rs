//! Slot bookkeeping shared by the connection and channel pools: a bounded
//! permit set, an idle queue, and shutdown signaling.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use futures_util::FutureExt;

use super::CloseEvent;
use crate::{Error, Result};

/// get the time between the deadline and now and use that as our timeout
///
/// returns `Error::PoolExhausted` if the deadline is in the past
pub(crate) fn deadline_as_timeout(deadline: Instant) -> Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .ok_or(Error::PoolExhausted)
}

/// A bounded pool of slots, each either idle (holding a resource), lent out,
/// or vacant. The caller layers resource construction and health checks on
/// top; this type only guarantees the capacity bound and shutdown ordering.
pub(crate) struct SlotPool<T> {
    idle: ArrayQueue<T>,
    semaphore: tokio::sync::Semaphore,
    size: AtomicU32,
    num_idle: AtomicUsize,
    is_closed: AtomicBool,
    on_closed: event_listener::Event,
    capacity: u32,
}

/// Outcome of claiming a slot.
pub(crate) enum Acquired<T> {
    /// An idle resource, ready for a health check.
    Idle(T, SlotGuard<T>),
    /// The pool was under capacity; the caller may build a new resource into
    /// this slot.
    Vacant(SlotGuard<T>),
}

impl<T> SlotPool<T> {
    pub(crate) fn new_arc(capacity: u32) -> Arc<Self> {
        Arc::new(Self {
            idle: ArrayQueue::new(capacity.max(1) as usize),
            semaphore: tokio::sync::Semaphore::new(capacity.max(1) as usize),
            size: AtomicU32::new(0),
            num_idle: AtomicUsize::new(0),
            is_closed: AtomicBool::new(false),
            on_closed: event_listener::Event::new(),
            capacity: capacity.max(1),
        })
    }

    pub(crate) fn size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    pub(crate) fn num_idle(&self) -> usize {
        // We keep our own count instead of asking the queue: `ArrayQueue::len`
        // waits for the head and tail pointers to settle, which can take a
        // while at high churn.
        self.num_idle.load(Ordering::Acquire)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.is_closed.store(true, Ordering::Release);
        self.on_closed.notify(usize::MAX);
    }

    pub(crate) fn close_event(&self) -> CloseEvent {
        CloseEvent {
            listener: (!self.is_closed()).then(|| self.on_closed.listen()),
        }
    }

    /// Wait for a permit, aborting with `PoolShutdown` if the pool closes
    /// first.
    async fn acquire_permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        let acquire = self.semaphore.acquire_many(1).fuse();
        let mut close_event = self.close_event();
        close_event
            .do_until(acquire)
            .await
            .map(|permit| permit.expect("slot pool semaphore closed"))
    }

    /// Claim a slot: pop an idle resource or, when under capacity, the right
    /// to build a new one. Bounded by `timeout`, mapping expiry to
    /// `PoolExhausted`.
    pub(crate) async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<Acquired<T>> {
        if self.is_closed() {
            return Err(Error::PoolShutdown);
        }

        tokio::time::timeout(timeout, async {
            loop {
                let permit = self.acquire_permit().await?;

                match self.pop_idle(permit) {
                    Ok(acquired) => return Ok(acquired),
                    Err(permit) => {
                        if let Ok(guard) = self.try_increment_size(permit) {
                            return Ok(Acquired::Vacant(guard));
                        }
                        // Lost the race against a concurrent return; yield so
                        // the release task can run, then go again.
                        tokio::task::yield_now().await;
                    }
                }
            }
        })
        .await
        .map_err(|_| Error::PoolExhausted)?
    }

    fn pop_idle<'a>(
        self: &'a Arc<Self>,
        permit: tokio::sync::SemaphorePermit<'a>,
    ) -> std::result::Result<Acquired<T>, tokio::sync::SemaphorePermit<'a>> {
        if let Some(resource) = self.idle.pop() {
            self.num_idle.fetch_sub(1, Ordering::AcqRel);
            Ok(Acquired::Idle(
                resource,
                SlotGuard::from_permit(Arc::clone(self), permit),
            ))
        } else {
            Err(permit)
        }
    }

    /// Try to atomically increment the pool size for a new resource.
    ///
    /// Returns `Err` if the pool is at capacity or closed.
    fn try_increment_size<'a>(
        self: &'a Arc<Self>,
        permit: tokio::sync::SemaphorePermit<'a>,
    ) -> std::result::Result<SlotGuard<T>, tokio::sync::SemaphorePermit<'a>> {
        match self
            .size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
                if self.is_closed() {
                    return None;
                }
                size.checked_add(1).filter(|size| size <= &self.capacity)
            }) {
            Ok(_) => Ok(SlotGuard::from_permit(Arc::clone(self), permit)),
            Err(_) => Err(permit),
        }
    }

    /// Return a resource to the idle queue and give its permit back.
    pub(crate) fn release(&self, resource: T, guard: SlotGuard<T>) {
        if self.idle.push(resource).is_err() {
            panic!("BUG: idle queue overflow in release()");
        }

        // The permit goes back only after the push, so a woken waiter always
        // finds the resource.
        guard.release_permit();

        self.num_idle.fetch_add(1, Ordering::AcqRel);
    }

    /// Mark the pool closed, destroy every idle resource, and wait for lent
    /// resources to come back. Idempotent; concurrent callers all wait.
    pub(crate) async fn close<F, Fut>(self: &Arc<Self>, destroy: F)
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = ()>,
    {
        self.mark_closed();

        for permits in 1..=self.capacity {
            while let Some(resource) = self.idle.pop() {
                self.num_idle.fetch_sub(1, Ordering::AcqRel);
                destroy(resource).await;
                self.size.fetch_sub(1, Ordering::AcqRel);
                self.semaphore.add_permits(1);
            }

            if self.size() == 0 {
                break;
            }

            // Wait for outstanding leases to drain back.
            let _permits = self.semaphore.acquire_many(permits).await.unwrap();
        }
    }
}

/// RAII guard for one claimed slot.
///
/// Dropping the guard decrements the pool size and releases its permit, so a
/// failed build or teardown can never leak a slot.
pub(crate) struct SlotGuard<T> {
    pool: Arc<SlotPool<T>>,
    cancelled: bool,
}

impl<T> SlotGuard<T> {
    /// A guard over a slot whose permit was previously handed off to a lease.
    pub(crate) fn reclaim(pool: Arc<SlotPool<T>>) -> Self {
        Self {
            pool,
            cancelled: false,
        }
    }

    fn from_permit(pool: Arc<SlotPool<T>>, permit: tokio::sync::SemaphorePermit<'_>) -> Self {
        // The guard takes over the permit's accounting.
        permit.forget();
        Self {
            pool,
            cancelled: false,
        }
    }

    /// Give the permit back without decrementing the pool size (the resource
    /// stayed alive and went back to the idle queue).
    fn release_permit(self) {
        self.pool.semaphore.add_permits(1);
        self.cancel();
    }

    /// Detach without touching the accounting: the slot's permit and size
    /// count now belong to a lease.
    pub(crate) fn cancel(mut self) {
        self.cancelled = true;
    }
}

impl<T> Drop for SlotGuard<T> {
    fn drop(&mut self) {
        if !self.cancelled {
            self.pool.size.fetch_sub(1, Ordering::AcqRel);
            self.pool.semaphore.add_permits(1);
        }
    }
}
