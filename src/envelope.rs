//! Received messages and the attributes used to publish them.

use std::collections::BTreeMap;

use serde_json::Value;

/// Header table carried by a message.
pub type Headers = BTreeMap<String, Value>;

/// Delivery mode marking a message as persistent.
pub const PERSISTENT: u8 = 2;

/// A message received from a queue together with its broker metadata.
///
/// The envelope is created by the broker adapter on delivery and handed to handlers by
/// reference; nothing downstream of the adapter mutates it. The delivery tag is the handle
/// the consumer uses to acknowledge or reject the message on its channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    body: Vec<u8>,
    delivery_tag: u64,
    redelivered: bool,
    exchange_name: String,
    routing_key: String,
    attributes: MessageAttributes,
}

impl Envelope {
    /// Create an envelope for a delivery. Adapters fill in the rest with the `with_*` methods.
    pub fn new(body: impl Into<Vec<u8>>, delivery_tag: u64) -> Self {
        Self {
            body: body.into(),
            delivery_tag,
            ..Default::default()
        }
    }

    /// Set the redelivery flag
    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Set the exchange the message was published to
    pub fn with_exchange_name(mut self, exchange_name: impl Into<String>) -> Self {
        self.exchange_name = exchange_name.into();
        self
    }

    /// Set the routing key the message was published with
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Set the message properties
    pub fn with_attributes(mut self, attributes: MessageAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body decoded as UTF-8, replacing invalid sequences. Used for logging.
    pub fn body_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the broker delivered this message before (after a requeue or a lost consumer)
    pub fn is_redelivery(&self) -> bool {
        self.redelivered
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn attributes(&self) -> &MessageAttributes {
        &self.attributes
    }

    pub fn content_type(&self) -> Option<&str> {
        self.attributes.content_type.as_deref()
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.attributes.content_encoding.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.attributes.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.attributes.reply_to.as_deref()
    }

    pub fn expiration(&self) -> Option<&str> {
        self.attributes.expiration.as_deref()
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.attributes.timestamp
    }

    pub fn app_id(&self) -> Option<&str> {
        self.attributes.app_id.as_deref()
    }

    /// The `type` property
    pub fn message_type(&self) -> Option<&str> {
        self.attributes.message_type.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.attributes.message_id.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.attributes.user_id.as_deref()
    }

    pub fn delivery_mode(&self) -> Option<u8> {
        self.attributes.delivery_mode
    }

    pub fn priority(&self) -> Option<u8> {
        self.attributes.priority
    }

    pub fn headers(&self) -> &Headers {
        &self.attributes.headers
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.attributes.headers.get(name)
    }
}

/// Message properties, used both when publishing and on received envelopes.
///
/// # Examples
///
/// ```rust
/// use ackloop::MessageAttributes;
///
/// let attributes = MessageAttributes::default()
///     .with_content_type("application/json")
///     .with_correlation_id("42")
///     .with_header("jsonrpc", "2.0");
///
/// assert_eq!(attributes.correlation_id.as_deref(), Some("42"));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageAttributes {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// 1 for transient, 2 ([`PERSISTENT`]) for persistent
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    /// Seconds since the unix epoch
    pub timestamp: Option<u64>,
    /// The `type` property
    pub message_type: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub headers: Headers,
}

impl MessageAttributes {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_encoding(mut self, content_encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(content_encoding.into());
        self
    }

    pub fn with_delivery_mode(mut self, delivery_mode: u8) -> Self {
        self.delivery_mode = Some(delivery_mode);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_expiration(mut self, expiration: impl Into<String>) -> Self {
        self.expiration = Some(expiration.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_expose_attributes() {
        let envelope = Envelope::new("hello", 7)
            .with_redelivered(true)
            .with_exchange_name("events")
            .with_routing_key("user.created")
            .with_attributes(
                MessageAttributes::default()
                    .with_app_id("billing")
                    .with_message_type("invoice")
                    .with_reply_to("replies")
                    .with_header("attempt", 3),
            );

        assert_eq!(envelope.body(), b"hello");
        assert_eq!(envelope.delivery_tag(), 7);
        assert!(envelope.is_redelivery());
        assert_eq!(envelope.exchange_name(), "events");
        assert_eq!(envelope.routing_key(), "user.created");
        assert_eq!(envelope.app_id(), Some("billing"));
        assert_eq!(envelope.message_type(), Some("invoice"));
        assert_eq!(envelope.reply_to(), Some("replies"));
        assert_eq!(envelope.header("attempt"), Some(&Value::from(3)));
        assert_eq!(envelope.correlation_id(), None);
    }

    #[test]
    fn body_lossy_replaces_invalid_utf8() {
        let envelope = Envelope::new(vec![0x66, 0xff, 0x6f], 1);
        assert_eq!(envelope.body_lossy(), "f\u{fffd}o");
    }
}
