//! Capability traits a broker adapter provides to the consumer loop.
//!
//! The consumer only talks to these traits. One implementation is swapped in per deployment:
//! [`memory`](crate::memory) for tests and embedding, and the `lapin` adapter for RabbitMQ
//! (behind the `lapin` feature).

use std::future::Future;

use futures::stream::BoxStream;

use crate::{BrokerError, Envelope, MessageAttributes};

/// Stream of deliveries returned by [`Queue::consume`].
///
/// The stream ends when the broker no longer has a consumer registered for it (cancelled,
/// queue deleted, channel closed). Items are yielded strictly in delivery order.
pub type Deliveries = BoxStream<'static, Result<Envelope, BrokerError>>;

/// Exchange routing types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExchangeKind {
    /// Route on exact routing key match
    #[default]
    Direct,
    /// Route to every bound queue
    Fanout,
    /// Route on dotted pattern match (`*` one word, `#` zero or more words)
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        }
    }
}

/// Publish flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishFlags {
    /// Return the message if it cannot be routed to any queue
    pub mandatory: bool,
    /// Return the message if it cannot be delivered to a consumer immediately
    pub immediate: bool,
}

/// An open connection to a broker.
pub trait Connection: Send + Sync {
    /// The channel type opened on this connection
    type Channel: Channel;

    /// Open a new channel
    fn new_channel(&self) -> impl Future<Output = Result<Self::Channel, BrokerError>> + Send;

    /// Whether the connection is still usable
    fn is_connected(&self) -> bool;
}

/// A channel multiplexed over a [`Connection`].
///
/// A channel is owned by a single consumer loop at a time; delivery tags are scoped to it.
pub trait Channel: Send + Sync {
    /// Connection type this channel belongs to
    type Connection: Connection;
    /// Exchange handle type
    type Exchange: Exchange;
    /// Queue handle type
    type Queue: Queue;

    /// The connection the channel was opened on
    fn connection(&self) -> &Self::Connection;

    /// Create an exchange handle. Nothing is sent to the broker until [`Exchange::declare`].
    fn new_exchange(&self, name: &str, kind: ExchangeKind) -> Self::Exchange;

    /// Create a queue handle. Nothing is sent to the broker until [`Queue::declare`].
    fn new_queue(&self, name: &str) -> Self::Queue;

    /// Set the prefetch window of the channel
    fn qos(
        &self,
        prefetch_size: u32,
        prefetch_count: u16,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Whether the channel is still open
    fn is_open(&self) -> bool;
}

/// An exchange messages are published to.
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ExchangeKind;

    /// Declare the exchange on the broker (idempotent)
    fn declare(&self) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Publish a message
    ///
    /// # Parameters
    ///
    /// * `body` - Raw message body
    /// * `routing_key` - Key the exchange routes on
    /// * `flags` - Mandatory / immediate flags
    /// * `attributes` - Message properties and headers
    fn publish(
        &self,
        body: &[u8],
        routing_key: &str,
        flags: PublishFlags,
        attributes: &MessageAttributes,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

/// A queue the consumer loop reads from and settles deliveries on.
pub trait Queue: Send + Sync {
    /// Channel type the queue was created on
    type Channel: Channel;

    fn name(&self) -> &str;

    /// The channel the queue handle belongs to
    fn channel(&self) -> &Self::Channel;

    /// Declare the queue on the broker (idempotent), returning the number of ready messages
    fn declare(&self) -> impl Future<Output = Result<u32, BrokerError>> + Send;

    /// Bind the queue to an exchange
    fn bind(
        &self,
        exchange_name: &str,
        routing_key: &str,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Fetch a single message without registering a consumer
    fn get(&self) -> impl Future<Output = Result<Option<Envelope>, BrokerError>> + Send;

    /// Register a consumer and return its delivery stream
    fn consume(
        &self,
        consumer_tag: &str,
    ) -> impl Future<Output = Result<Deliveries, BrokerError>> + Send;

    /// Acknowledge `delivery_tag`, or every unsettled tag up to and including it when `multiple`
    fn ack(
        &self,
        delivery_tag: u64,
        multiple: bool,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Reject a single delivery
    fn reject(
        &self,
        delivery_tag: u64,
        requeue: bool,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Negatively acknowledge `delivery_tag`, or every unsettled tag up to and including it
    /// when `multiple`
    fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Cancel the consumer registered under `consumer_tag`
    fn cancel(&self, consumer_tag: &str) -> impl Future<Output = Result<(), BrokerError>> + Send;
}
