//! Letters, their routing envelopes, and the notifications that report their
//! fate.

use bytes::Bytes;
use lapin::options::BasicPublishOptions;
use lapin::BasicProperties;

use crate::Error;

/// Caller-assigned identity of a letter, echoed back on its notification.
/// Opaque to the broker.
pub type LetterId = u64;

/// AMQP delivery mode carried in the message properties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Mode 1: the broker may keep the message in memory only.
    #[default]
    Transient,
    /// Mode 2: the broker persists the message to disk on durable queues.
    Persistent,
}

impl DeliveryMode {
    pub(crate) fn as_amqp(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// Routing metadata attached to a [`Letter`]: where it goes and how the
/// broker should treat it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub delivery_mode: DeliveryMode,
}

impl Envelope {
    /// An envelope addressed to `exchange` with the given routing key.
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            content_type: "application/octet-stream".into(),
            mandatory: false,
            immediate: false,
            delivery_mode: DeliveryMode::default(),
        }
    }

    /// An envelope routed through the default exchange straight to `queue`.
    pub fn direct(queue: impl Into<String>) -> Self {
        Self::new("", queue)
    }

    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    #[must_use]
    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    #[must_use]
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    #[must_use]
    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Shorthand for `delivery_mode(DeliveryMode::Persistent)`.
    #[must_use]
    pub fn persistent(self) -> Self {
        self.delivery_mode(DeliveryMode::Persistent)
    }

    pub(crate) fn publish_options(&self) -> BasicPublishOptions {
        BasicPublishOptions {
            mandatory: self.mandatory,
            immediate: self.immediate,
        }
    }

    pub(crate) fn properties(&self) -> BasicProperties {
        BasicProperties::default()
            .with_content_type(self.content_type.clone().into())
            .with_delivery_mode(self.delivery_mode.as_amqp())
    }
}

/// The unit of work handed to the publisher: a body, where to send it, and
/// how many in-publisher retries it is worth.
///
/// Letters are immutable once submitted; the publisher clones what it needs
/// and never mutates the caller's value.
#[derive(Debug, Clone)]
pub struct Letter {
    pub id: LetterId,
    pub retry_count: u32,
    pub body: Bytes,
    pub envelope: Envelope,
}

impl Letter {
    pub fn new(id: LetterId, body: impl Into<Bytes>, envelope: Envelope) -> Self {
        Self {
            id,
            retry_count: 0,
            body: body.into(),
            envelope,
        }
    }

    /// Allow up to `retries` additional publish attempts on transient
    /// failures before the letter is reported as failed.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }
}

/// The asynchronous result record emitted for every accepted letter.
///
/// Failures carry the original letter back so the caller can resubmit it
/// without keeping their own copy.
#[derive(Debug)]
pub struct Notification {
    pub letter_id: LetterId,
    pub success: bool,
    pub error: Option<Error>,
    pub failed_letter: Option<Letter>,
}

impl Notification {
    pub(crate) fn delivered(letter_id: LetterId) -> Self {
        Self {
            letter_id,
            success: true,
            error: None,
            failed_letter: None,
        }
    }

    pub(crate) fn failed(letter: Letter, error: Error) -> Self {
        Self {
            letter_id: letter.id,
            success: false,
            error: Some(error),
            failed_letter: Some(letter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_maps_to_amqp_properties() {
        let envelope = Envelope::direct("orders")
            .content_type("application/json")
            .mandatory(true)
            .persistent();

        assert_eq!(envelope.exchange, "");
        assert_eq!(envelope.routing_key, "orders");
        assert_eq!(envelope.delivery_mode.as_amqp(), 2);

        let options = envelope.publish_options();
        assert!(options.mandatory);
        assert!(!options.immediate);

        let properties = envelope.properties();
        assert_eq!(
            properties.content_type().as_ref().map(|c| c.as_str()),
            Some("application/json")
        );
        assert_eq!(properties.delivery_mode(), &Some(2));
    }

    #[test]
    fn failure_notification_carries_the_letter_back() {
        let letter = Letter::new(42, &b"payload"[..], Envelope::direct("q")).with_retries(3);
        let notification = Notification::failed(letter.clone(), Error::NackedByBroker);

        assert_eq!(notification.letter_id, 42);
        assert!(!notification.success);
        let returned = notification.failed_letter.expect("letter handed back");
        assert_eq!(returned.id, letter.id);
        assert_eq!(returned.body, letter.body);
        assert_eq!(returned.retry_count, 3);
    }

    #[test]
    fn success_notification_is_lean() {
        let notification = Notification::delivered(7);
        assert!(notification.success);
        assert!(notification.error.is_none());
        assert!(notification.failed_letter.is_none());
    }
}
