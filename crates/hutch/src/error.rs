//! Types for working with errors produced by hutch.

use std::time::Duration;

/// A specialized `Result` type for hutch.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all the ways an operation can fail within hutch.
///
/// Pool-layer failures are recovered internally and only surface once the
/// acquire budget is spent or the pool is shut down. Publish-layer failures
/// never escape `publish*` calls as errors; they arrive as failure
/// [`Notification`](crate::Notification)s instead.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Error reading or parsing the configuration.
    #[error("error with configuration: {0}")]
    Configuration(String),

    /// A connection to the broker could not be opened.
    #[error("failed to open a connection to the broker: {0}")]
    ConnectionOpenFailed(#[source] lapin::Error),

    /// A channel could not be opened on any available connection.
    #[error("failed to open a channel: {0}")]
    ChannelOpenFailed(#[source] lapin::Error),

    /// The acquire wait budget expired before a healthy resource was produced.
    #[error("pool timed out while waiting for a healthy resource")]
    PoolExhausted,

    /// The pool was shut down while acquiring or waiting.
    #[error("attempted to acquire from a pool that has been shut down")]
    PoolShutdown,

    /// The publish frame could not be written. The channel it was written on
    /// has been flagged for rebuild.
    #[error("failed to write publish frame: {0}")]
    PublishWriteFailed(#[source] lapin::Error),

    /// The broker nacked the publish. Not retried: the broker has seen the
    /// message and rejected it.
    #[error("publish was nacked by the broker")]
    NackedByBroker,

    /// A mandatory publish could not be routed to any queue.
    #[error("publish was returned unroutable (reply code {reply_code}): {reply_text}")]
    Unroutable { reply_code: u16, reply_text: String },

    /// No ack or nack arrived within the configured confirm window. The
    /// channel has been flagged for rebuild.
    #[error("no publisher confirm arrived within {0:?}")]
    ConfirmTimeout(Duration),

    /// The operation was abandoned because a shutdown began mid-flight.
    #[error("operation was cancelled by shutdown")]
    Cancelled,

    /// The publisher has been stopped and accepts no further letters.
    #[error("publisher has been stopped")]
    PublisherStopped,

    /// A topology operation (declare/bind/purge/delete) was refused.
    #[error("topology operation failed: {0}")]
    Topology(#[source] lapin::Error),
}

impl Error {
    /// Whether the publisher should spend one of a letter's retries on this
    /// failure. Frame-write failures and confirm timeouts are worth a fresh
    /// channel; broker verdicts and terminal states are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PublishWriteFailed(_) | Error::ConfirmTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_verdicts_are_not_retryable() {
        assert!(!Error::NackedByBroker.is_retryable());
        assert!(!Error::Unroutable {
            reply_code: 312,
            reply_text: "NO_ROUTE".into(),
        }
        .is_retryable());
        assert!(!Error::PoolShutdown.is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::PublisherStopped.is_retryable());
    }

    #[test]
    fn transport_failures_are_retryable() {
        assert!(Error::ConfirmTimeout(Duration::from_secs(1)).is_retryable());
    }
}
