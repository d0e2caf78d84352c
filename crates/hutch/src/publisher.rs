//! The publishing engine: letters in, notifications out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use lapin::publisher_confirm::Confirmation;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backoff::Backoff;
use crate::config::{BackoffConfig, PublisherConfig, Seasoning};
use crate::letter::{Letter, Notification};
use crate::metrics::{NoopMetrics, PublisherMetrics};
use crate::pool::{ChannelLease, ChannelPool};
use crate::{Error, Result};

/// Publishes letters over a [`ChannelPool`] and reports the fate of every
/// accepted letter, exactly once, on the notification stream.
///
/// Three ways in:
///
/// - [`publish`](Publisher::publish): fire-and-forget on a plain channel.
/// - [`publish_with_confirmation`](Publisher::publish_with_confirmation):
///   waits for the broker's ack or nack on a confirmation-mode channel.
/// - [`queue_letter`](Publisher::queue_letter): hands the letter to the
///   auto-publish workers started with
///   [`start_auto_publish`](Publisher::start_auto_publish).
///
/// Publish outcomes never surface as errors from these calls; they arrive as
/// [`Notification`]s. The only error a submission can return is
/// [`Error::PublisherStopped`].
///
/// Cloning the publisher is cheap; all clones share one state, one queue,
/// and one notification stream.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherState>,
}

struct PublisherState {
    channels: ChannelPool,
    config: PublisherConfig,
    retry_backoff: BackoffConfig,
    metrics: Arc<dyn PublisherMetrics>,
    notify_tx: flume::Sender<Notification>,
    notify_rx: flume::Receiver<Notification>,
    queue_tx: flume::Sender<Letter>,
    queue_rx: flume::Receiver<Letter>,
    lifecycle: Mutex<Lifecycle>,
    /// Fast-path mirror of `Lifecycle::Stopped` for submission checks.
    stopped: AtomicBool,
}

enum Lifecycle {
    Created,
    Running {
        workers: Vec<JoinHandle<()>>,
        stop_tx: watch::Sender<bool>,
    },
    Stopping,
    Stopped,
}

impl Publisher {
    pub fn new(seasoning: &Seasoning, channels: ChannelPool) -> Self {
        Self::with_metrics(seasoning, channels, NoopMetrics)
    }

    /// As [`new`](Publisher::new), with a metrics hook on the publish path.
    pub fn with_metrics(
        seasoning: &Seasoning,
        channels: ChannelPool,
        metrics: impl PublisherMetrics,
    ) -> Self {
        let (queue_tx, queue_rx) = flume::bounded(seasoning.publisher.queue_capacity);
        // Sized so that emission never blocks while a reader keeps up at
        // all: the whole queue plus every possible in-flight publish.
        let (notify_tx, notify_rx) = flume::bounded(seasoning.notification_capacity());

        Self {
            inner: Arc::new(PublisherState {
                channels,
                config: seasoning.publisher.clone(),
                retry_backoff: seasoning.pool.reconnect.clone(),
                metrics: Arc::new(metrics),
                notify_tx,
                notify_rx,
                queue_tx,
                queue_rx,
                lifecycle: Mutex::new(Lifecycle::Created),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// The notification stream. Bounded; many writers, one reader by
    /// convention. Every accepted letter produces exactly one notification
    /// here, in no particular order.
    pub fn notifications(&self) -> flume::Receiver<Notification> {
        self.inner.notify_rx.clone()
    }

    /// The channel pool this publisher publishes over.
    pub fn channel_pool(&self) -> &ChannelPool {
        &self.inner.channels
    }

    /// Fire-and-forget publish on a plain channel. Emits exactly one
    /// notification; transient failures are retried on fresh channels while
    /// the letter's retry budget lasts.
    pub async fn publish(&self, letter: Letter) -> Result<()> {
        self.ensure_accepting()?;
        self.settle(letter, false).await
    }

    /// Publish on a confirmation-mode channel and wait for the broker's
    /// verdict, bounded by the configured confirm timeout. Emits exactly one
    /// notification carrying the final disposition.
    pub async fn publish_with_confirmation(&self, letter: Letter) -> Result<()> {
        self.ensure_accepting()?;
        self.settle(letter, true).await
    }

    /// Enqueue a letter for the auto-publish workers. Blocks while the
    /// queue is full; fails only when the publisher is stopped.
    pub async fn queue_letter(&self, letter: Letter) -> Result<()> {
        self.ensure_accepting()?;
        self.inner
            .queue_tx
            .send_async(letter)
            .await
            .map_err(|_| Error::PublisherStopped)
    }

    /// Spawn the auto-publish workers if they are not already running.
    /// Idempotent; moves Created/Stopped → Running.
    pub fn start_auto_publish(&self) {
        let mut lifecycle = self.lifecycle();
        if matches!(*lifecycle, Lifecycle::Running { .. } | Lifecycle::Stopping) {
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let workers = (0..self.inner.config.workers.max(1))
            .map(|worker| {
                let publisher = self.clone();
                let stop_rx = stop_rx.clone();
                tokio::spawn(auto_publish_worker(publisher, stop_rx, worker))
            })
            .collect::<Vec<_>>();

        tracing::info!(workers = workers.len(), "auto-publish started");
        self.inner.stopped.store(false, Ordering::Release);
        *lifecycle = Lifecycle::Running { workers, stop_tx };
    }

    /// Signal the auto-publish workers to drain and exit, and wait for them.
    /// Moves Running → Stopping → Stopped; once Stopped, submissions are
    /// refused until [`start_auto_publish`](Publisher::start_auto_publish)
    /// runs again. Notifications already in flight are still delivered.
    pub async fn stop_auto_publish(&self) {
        let (workers, stop_tx) = {
            let mut lifecycle = self.lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
                Lifecycle::Running { workers, stop_tx } => (workers, stop_tx),
                Lifecycle::Stopping => {
                    // Another caller is already draining; leave its marker in
                    // place and let it finish.
                    return;
                }
                Lifecycle::Created | Lifecycle::Stopped => {
                    *lifecycle = Lifecycle::Stopped;
                    self.inner.stopped.store(true, Ordering::Release);
                    return;
                }
            }
        };

        let _ = stop_tx.send(true);
        for worker in workers {
            let _ = worker.await;
        }

        *self.lifecycle() = Lifecycle::Stopped;
        self.inner.stopped.store(true, Ordering::Release);
        tracing::info!("auto-publish stopped");
    }

    /// Stop the auto-publish loop (with drain) and refuse further
    /// submissions. The channel pool is left running; pools are routinely
    /// shared between publishers and are shut down by their owner.
    pub async fn shutdown(&self) {
        self.stop_auto_publish().await;
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.inner.stopped.load(Ordering::Acquire) {
            Err(Error::PublisherStopped)
        } else {
            Ok(())
        }
    }

    /// Drive one letter to its terminal outcome and emit the notification.
    async fn settle(&self, letter: Letter, confirm: bool) -> Result<()> {
        let started = Instant::now();
        let outcome = self.deliver(&letter, confirm).await;
        self.inner.metrics.publish_latency(started.elapsed());

        let notification = match outcome {
            Ok(()) => Notification::delivered(letter.id),
            Err(error) => {
                tracing::warn!(letter_id = letter.id, error = %error, "publish failed");
                self.inner.metrics.failed(&error);
                Notification::failed(letter, error)
            }
        };

        self.inner
            .notify_tx
            .send_async(notification)
            .await
            .map_err(|_| Error::PublisherStopped)
    }

    /// Publish with retries: transient failures are retried on fresh
    /// channels, with backoff, while the letter's budget lasts.
    async fn deliver(&self, letter: &Letter, confirm: bool) -> Result<()> {
        let mut backoff = Backoff::new(&self.inner.retry_backoff);
        let mut attempts_left = letter.retry_count;

        loop {
            match self.attempt(letter, confirm).await {
                Ok(()) => return Ok(()),
                Err(error) if error.is_retryable() && attempts_left > 0 => {
                    attempts_left -= 1;
                    self.inner.metrics.retried();
                    tracing::warn!(
                        letter_id = letter.id,
                        error = %error,
                        attempts_left,
                        "publish attempt failed; retrying on a fresh channel"
                    );
                    backoff.sleep().await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn attempt(&self, letter: &Letter, confirm: bool) -> Result<()> {
        if confirm {
            self.attempt_confirmed(letter).await
        } else {
            self.attempt_plain(letter).await
        }
    }

    async fn attempt_plain(&self, letter: &Letter) -> Result<()> {
        let channel = self.inner.channels.get_channel().await?;

        match channel
            .basic_publish(
                &letter.envelope.exchange,
                &letter.envelope.routing_key,
                letter.envelope.publish_options(),
                &letter.body,
                letter.envelope.properties(),
            )
            .await
        {
            Ok(_not_requested) => {
                self.inner.metrics.published();
                Ok(())
            }
            Err(error) => {
                self.fail_channel(&channel, &error);
                Err(Error::PublishWriteFailed(error))
            }
        }
    }

    async fn attempt_confirmed(&self, letter: &Letter) -> Result<()> {
        let channel = self.inner.channels.get_confirm_channel().await?;
        let tag = channel.begin_publish(letter.id);
        tracing::trace!(
            letter_id = letter.id,
            channel_id = channel.id(),
            delivery_tag = tag,
            "publishing with confirmation"
        );

        let confirm = match channel
            .basic_publish(
                &letter.envelope.exchange,
                &letter.envelope.routing_key,
                letter.envelope.publish_options(),
                &letter.body,
                letter.envelope.properties(),
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(error) => {
                channel.end_publish(tag);
                self.fail_channel(&channel, &error);
                return Err(Error::PublishWriteFailed(error));
            }
        };
        self.inner.metrics.published();

        // Wait for the broker's verdict, racing the confirm timeout and the
        // pool's shutdown.
        let timeout = self.inner.config.confirm_timeout();
        let mut close_event = self.inner.channels.close_event();
        let verdict = close_event
            .do_until(tokio::time::timeout(timeout, confirm))
            .await;
        channel.end_publish(tag);

        match verdict {
            // Pool shut down mid-wait.
            Err(_) => Err(Error::Cancelled),
            // Confirm window expired; the channel's tag sequence is now
            // ambiguous, so it gets rebuilt.
            Ok(Err(_elapsed)) => {
                channel.flag();
                Err(Error::ConfirmTimeout(timeout))
            }
            // The channel died while we waited.
            Ok(Ok(Err(error))) => {
                self.fail_channel(&channel, &error);
                Err(Error::PublishWriteFailed(error))
            }
            Ok(Ok(Ok(confirmation))) => {
                let settled = settle_confirmation(confirmation);
                if settled.is_ok() {
                    self.inner.metrics.confirmed();
                }
                settled
            }
        }
    }

    /// Flag a channel out of the pool and, when the failure shows the
    /// transport underneath it is gone, its connection too.
    fn fail_channel(&self, channel: &ChannelLease, error: &lapin::Error) {
        channel.flag();
        if is_connection_error(error) {
            self.inner.channels.flag_connection(channel.connection_id());
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("queued", &self.inner.queue_rx.len())
            .field("pending_notifications", &self.inner.notify_rx.len())
            .field("stopped", &self.inner.stopped.load(Ordering::Acquire))
            .finish()
    }
}

fn settle_confirmation(confirmation: Confirmation) -> Result<()> {
    match confirmation {
        // A mandatory publish that no queue could take comes back attached
        // to the ack.
        Confirmation::Ack(Some(returned)) => Err(Error::Unroutable {
            reply_code: returned.reply_code,
            reply_text: returned.reply_text.as_str().to_owned(),
        }),
        Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
        Confirmation::Nack(_) => Err(Error::NackedByBroker),
    }
}

fn is_connection_error(error: &lapin::Error) -> bool {
    matches!(
        error,
        lapin::Error::InvalidConnectionState(_) | lapin::Error::IOError(_)
    )
}

/// One auto-publish worker: blocks on the queue until the stop signal, then
/// drains what is already queued, bounded by the drain deadline.
async fn auto_publish_worker(
    publisher: Publisher,
    mut stop_rx: watch::Receiver<bool>,
    worker: usize,
) {
    tracing::debug!(worker, "auto-publish worker started");
    let state = &publisher.inner;
    let confirm = state.config.confirm_publishes;

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            received = state.queue_rx.recv_async() => match received {
                Ok(letter) => {
                    let _ = publisher.settle(letter, confirm).await;
                }
                Err(_) => break,
            },
        }
    }

    let deadline = Instant::now() + state.config.drain_timeout();
    while Instant::now() < deadline {
        match state.queue_rx.try_recv() {
            Ok(letter) => {
                let _ = publisher.settle(letter, confirm).await;
            }
            Err(_) => break,
        }
    }

    tracing::debug!(worker, "auto-publish worker stopped");
}
