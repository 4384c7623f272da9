//! A process-local broker implementing every capability trait.
//!
//! The memory broker is the reference behaviour the consumer loop is tested against. It
//! supports direct, fanout and topic exchanges, the default exchange (`""` routes to the queue
//! named by the routing key), per-channel delivery tags, requeueing with the redelivery flag
//! set and multiple ack/nack. Every settlement is recorded on the channel so tests can assert
//! exactly what was committed.
//!
//! Delivery streams end when the consumer is cancelled, or once a queue closed with
//! [`MemoryBroker::close_queue`] has been drained.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    BrokerError, Envelope, MessageAttributes,
    broker::{Channel, Connection, Deliveries, Exchange, ExchangeKind, PublishFlags, Queue},
};

/// Name of the default exchange
pub const DEFAULT_EXCHANGE: &str = "";

/// What a settlement did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementAction {
    Ack,
    Reject,
    Nack,
}

/// One ack, reject or nack received by a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub action: SettlementAction,
    pub delivery_tag: u64,
    pub multiple: bool,
    pub requeue: bool,
    /// Every delivery tag this settlement covered, ascending
    pub settled: Vec<u64>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    exchange: String,
    routing_key: String,
    attributes: MessageAttributes,
    redelivered: bool,
}

impl StoredMessage {
    fn into_envelope(self, delivery_tag: u64) -> Envelope {
        Envelope::new(self.body, delivery_tag)
            .with_redelivered(self.redelivered)
            .with_exchange_name(self.exchange)
            .with_routing_key(self.routing_key)
            .with_attributes(self.attributes)
    }
}

struct Binding {
    queue: String,
    routing_key: String,
}

struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

struct QueueState {
    ready: VecDeque<StoredMessage>,
    closed: bool,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            closed: false,
            notify: Arc::new(Notify::new()),
        }
    }
}

#[derive(Default)]
struct ChannelState {
    open: bool,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
    consumers: HashMap<String, String>,
    settlements: Vec<Settlement>,
    prefetch: (u32, u16),
}

#[derive(Default)]
struct BrokerState {
    connected: bool,
    next_channel_id: u64,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    channels: HashMap<u64, ChannelState>,
}

impl BrokerState {
    fn channel(&self, id: u64) -> Result<&ChannelState, BrokerError> {
        if !self.connected {
            return Err(BrokerError::ConnectionClosed);
        }
        self.channels
            .get(&id)
            .filter(|channel| channel.open)
            .ok_or(BrokerError::ChannelClosed)
    }

    fn channel_mut(&mut self, id: u64) -> Result<&mut ChannelState, BrokerError> {
        if !self.connected {
            return Err(BrokerError::ConnectionClosed);
        }
        self.channels
            .get_mut(&id)
            .filter(|channel| channel.open)
            .ok_or(BrokerError::ChannelClosed)
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_owned())
                .into_iter()
                .collect());
        }

        let state = self.exchanges.get(exchange).ok_or_else(|| BrokerError::NotFound {
            kind: "exchange",
            name: exchange.to_owned(),
        })?;

        let mut targets: Vec<String> = Vec::new();
        for binding in &state.bindings {
            let matched = match state.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        if let Some(state) = self.queues.get_mut(queue) {
            state.ready.push_back(message);
            state.notify.notify_waiters();
        }
    }

    /// Put settled-with-requeue messages back at the head of their queues, in tag order
    fn requeue(&mut self, messages: Vec<(String, StoredMessage)>) {
        for (queue, mut message) in messages.into_iter().rev() {
            if let Some(state) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                state.ready.push_front(message);
                state.notify.notify_waiters();
            }
        }
    }

    /// Pop the next message of `queue` and register it as unacked on `channel_id`
    fn deliver(&mut self, channel_id: u64, queue: &str) -> Result<Option<Envelope>, BrokerError> {
        self.channel(channel_id)?;
        let Some(message) = self.queues.get_mut(queue).and_then(|q| q.ready.pop_front()) else {
            return Ok(None);
        };
        let channel = self.channel_mut(channel_id)?;
        channel.next_tag += 1;
        let delivery_tag = channel.next_tag;
        channel
            .unacked
            .insert(delivery_tag, (queue.to_owned(), message.clone()));
        Ok(Some(message.into_envelope(delivery_tag)))
    }

    fn settle(
        &mut self,
        channel_id: u64,
        action: SettlementAction,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        let channel = self.channel_mut(channel_id)?;
        let tags: Vec<u64> = if multiple {
            channel.unacked.range(..=delivery_tag).map(|(tag, _)| *tag).collect()
        } else if channel.unacked.contains_key(&delivery_tag) {
            vec![delivery_tag]
        } else {
            Vec::new()
        };
        if tags.is_empty() {
            return Err(BrokerError::UnknownDeliveryTag(delivery_tag));
        }

        let messages: Vec<(String, StoredMessage)> = tags
            .iter()
            .filter_map(|tag| channel.unacked.remove(tag))
            .collect();
        channel.settlements.push(Settlement {
            action,
            delivery_tag,
            multiple,
            requeue,
            settled: tags,
        });

        if requeue {
            self.requeue(messages);
        }
        Ok(())
    }

    fn close_channel(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        channel.open = false;
        channel.consumers.clear();
        let unsettled: Vec<(String, StoredMessage)> =
            std::mem::take(&mut channel.unacked).into_values().collect();
        self.requeue(unsettled);
        for queue in self.queues.values() {
            queue.notify.notify_waiters();
        }
    }
}

/// Match a topic binding pattern against a routing key
///
/// `*` matches exactly one dot separated word, `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// Handle to an in-memory broker. Clones share the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                connected: true,
                ..Default::default()
            })),
        }
    }

    /// Open a connection to this broker
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            broker: self.clone(),
        }
    }

    /// Drop every connection: channels close and their unacked messages are requeued
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.close_channel(id);
        }
        state.connected = false;
    }

    /// Publish `body` straight to `queue` through the default exchange
    pub fn publish_to_queue(&self, queue: &str, body: impl Into<Vec<u8>>) {
        self.publish_to_queue_with(queue, body, MessageAttributes::default());
    }

    /// Publish `body` with `attributes` straight to `queue` through the default exchange
    pub fn publish_to_queue_with(
        &self,
        queue: &str,
        body: impl Into<Vec<u8>>,
        attributes: MessageAttributes,
    ) {
        let message = StoredMessage {
            body: body.into(),
            exchange: DEFAULT_EXCHANGE.to_owned(),
            routing_key: queue.to_owned(),
            attributes,
            redelivered: false,
        };
        self.state.lock().enqueue(queue, message);
    }

    /// Mark `queue` closed: delivery streams end once it is drained
    pub fn close_queue(&self, queue: &str) {
        let mut state = self.state.lock();
        if let Some(queue) = state.queues.get_mut(queue) {
            queue.closed = true;
            queue.notify.notify_waiters();
        }
    }

    /// Delete `exchange` together with its bindings
    pub fn delete_exchange(&self, exchange: &str) {
        self.state.lock().exchanges.remove(exchange);
    }

    /// Number of messages ready for delivery on `queue`
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.ready.len())
    }

    /// Bodies of the messages ready on `queue`, in delivery order
    pub fn ready_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|queue| queue.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of active consumers on `queue` across every open channel
    pub fn consumer_count(&self, queue: &str) -> usize {
        let state = self.state.lock();
        state
            .channels
            .values()
            .filter(|channel| channel.open)
            .flat_map(|channel| channel.consumers.values())
            .filter(|name| name.as_str() == queue)
            .count()
    }
}

/// Connection to a [`MemoryBroker`]
#[derive(Clone)]
pub struct MemoryConnection {
    broker: MemoryBroker,
}

impl MemoryConnection {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

impl Connection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn new_channel(&self) -> Result<MemoryChannel, BrokerError> {
        let mut state = self.broker.state.lock();
        if !state.connected {
            return Err(BrokerError::ConnectionClosed);
        }
        state.next_channel_id += 1;
        let id = state.next_channel_id;
        state.channels.insert(
            id,
            ChannelState {
                open: true,
                ..Default::default()
            },
        );
        drop(state);

        Ok(MemoryChannel {
            id,
            connection: self.clone(),
        })
    }

    fn is_connected(&self) -> bool {
        self.broker.state.lock().connected
    }
}

/// Channel on a [`MemoryConnection`]
#[derive(Clone)]
pub struct MemoryChannel {
    id: u64,
    connection: MemoryConnection,
}

impl MemoryChannel {
    fn state(&self) -> &Mutex<BrokerState> {
        &self.connection.broker.state
    }

    /// Every settlement received so far, in order
    pub fn settlements(&self) -> Vec<Settlement> {
        self.state()
            .lock()
            .channels
            .get(&self.id)
            .map(|channel| channel.settlements.clone())
            .unwrap_or_default()
    }

    /// Delivery tags handed out and not settled yet
    pub fn unacked_tags(&self) -> Vec<u64> {
        self.state()
            .lock()
            .channels
            .get(&self.id)
            .map(|channel| channel.unacked.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Last `(prefetch_size, prefetch_count)` set with [`Channel::qos`]
    pub fn prefetch(&self) -> (u32, u16) {
        self.state()
            .lock()
            .channels
            .get(&self.id)
            .map_or((0, 0), |channel| channel.prefetch)
    }

    /// Close the channel; unsettled deliveries go back to their queues
    pub fn close(&self) {
        self.state().lock().close_channel(self.id);
    }
}

impl Channel for MemoryChannel {
    type Connection = MemoryConnection;
    type Exchange = MemoryExchange;
    type Queue = MemoryQueue;

    fn connection(&self) -> &MemoryConnection {
        &self.connection
    }

    fn new_exchange(&self, name: &str, kind: ExchangeKind) -> MemoryExchange {
        MemoryExchange {
            channel: self.clone(),
            name: name.to_owned(),
            kind,
        }
    }

    fn new_queue(&self, name: &str) -> MemoryQueue {
        MemoryQueue {
            channel: self.clone(),
            name: name.to_owned(),
        }
    }

    async fn qos(&self, prefetch_size: u32, prefetch_count: u16) -> Result<(), BrokerError> {
        let mut state = self.state().lock();
        state.channel_mut(self.id)?.prefetch = (prefetch_size, prefetch_count);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state().lock().channel(self.id).is_ok()
    }
}

/// Exchange handle on a [`MemoryChannel`]
pub struct MemoryExchange {
    channel: MemoryChannel,
    name: String,
    kind: ExchangeKind,
}

impl Exchange for MemoryExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ExchangeKind {
        self.kind
    }

    async fn declare(&self) -> Result<(), BrokerError> {
        let mut state = self.channel.state().lock();
        state.channel(self.channel.id)?;
        if self.name == DEFAULT_EXCHANGE {
            return Ok(());
        }
        match state.exchanges.get(&self.name) {
            Some(existing) if existing.kind != self.kind => Err(BrokerError::PreconditionFailed(
                format!(
                    "exchange {} already declared as {}",
                    self.name,
                    existing.kind.as_str()
                ),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    self.name.clone(),
                    ExchangeState {
                        kind: self.kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        body: &[u8],
        routing_key: &str,
        flags: PublishFlags,
        attributes: &MessageAttributes,
    ) -> Result<(), BrokerError> {
        let mut state = self.channel.state().lock();
        state.channel(self.channel.id)?;
        let targets = state.route(&self.name, routing_key)?;
        if targets.is_empty() && flags.mandatory {
            return Err(BrokerError::PreconditionFailed(format!(
                "message to {:?} with routing key {routing_key:?} is unroutable",
                self.name
            )));
        }
        for queue in targets {
            let message = StoredMessage {
                body: body.to_vec(),
                exchange: self.name.clone(),
                routing_key: routing_key.to_owned(),
                attributes: attributes.clone(),
                redelivered: false,
            };
            state.enqueue(&queue, message);
        }
        Ok(())
    }
}

/// Queue handle on a [`MemoryChannel`]
pub struct MemoryQueue {
    channel: MemoryChannel,
    name: String,
}

impl MemoryQueue {
    fn deliveries(&self, consumer_tag: String) -> Deliveries {
        let channel = self.channel.clone();
        let queue = self.name.clone();

        futures::stream::unfold(Some((channel, queue, consumer_tag)), |seed| async move {
            let (channel, queue, consumer_tag) = seed?;
            loop {
                let notify = {
                    let state = channel.state().lock();
                    match state.queues.get(&queue) {
                        Some(queue) => Arc::clone(&queue.notify),
                        None => return None,
                    }
                };
                let notified = notify.notified();

                {
                    let mut state = channel.state().lock();
                    let registered = state
                        .channel(channel.id)
                        .map(|ch| ch.consumers.contains_key(&consumer_tag));
                    match registered {
                        Err(e) => return Some((Err(e), None)),
                        Ok(false) => return None,
                        Ok(true) => {}
                    }
                    match state.deliver(channel.id, &queue) {
                        Ok(Some(envelope)) => {
                            return Some((Ok(envelope), Some((channel.clone(), queue, consumer_tag))));
                        }
                        Ok(None) => {
                            if state.queues.get(&queue).is_none_or(|q| q.closed) {
                                return None;
                            }
                        }
                        Err(e) => return Some((Err(e), None)),
                    }
                }

                notified.await;
            }
        })
        .boxed()
    }
}

impl Queue for MemoryQueue {
    type Channel = MemoryChannel;

    fn name(&self) -> &str {
        &self.name
    }

    fn channel(&self) -> &MemoryChannel {
        &self.channel
    }

    async fn declare(&self) -> Result<u32, BrokerError> {
        let mut state = self.channel.state().lock();
        state.channel(self.channel.id)?;
        let queue = state
            .queues
            .entry(self.name.clone())
            .or_insert_with(QueueState::new);
        Ok(u32::try_from(queue.ready.len()).unwrap_or(u32::MAX))
    }

    async fn bind(&self, exchange_name: &str, routing_key: &str) -> Result<(), BrokerError> {
        let mut state = self.channel.state().lock();
        state.channel(self.channel.id)?;
        if exchange_name == DEFAULT_EXCHANGE {
            return Err(BrokerError::PreconditionFailed(
                "the default exchange cannot be bound".to_owned(),
            ));
        }
        if !state.queues.contains_key(&self.name) {
            return Err(BrokerError::NotFound {
                kind: "queue",
                name: self.name.clone(),
            });
        }
        let exchange = state
            .exchanges
            .get_mut(exchange_name)
            .ok_or_else(|| BrokerError::NotFound {
                kind: "exchange",
                name: exchange_name.to_owned(),
            })?;
        let exists = exchange
            .bindings
            .iter()
            .any(|b| b.queue == self.name && b.routing_key == routing_key);
        if !exists {
            exchange.bindings.push(Binding {
                queue: self.name.clone(),
                routing_key: routing_key.to_owned(),
            });
        }
        Ok(())
    }

    async fn get(&self) -> Result<Option<Envelope>, BrokerError> {
        let mut state = self.channel.state().lock();
        if !state.queues.contains_key(&self.name) {
            return Err(BrokerError::NotFound {
                kind: "queue",
                name: self.name.clone(),
            });
        }
        state.deliver(self.channel.id, &self.name)
    }

    async fn consume(&self, consumer_tag: &str) -> Result<Deliveries, BrokerError> {
        {
            let mut state = self.channel.state().lock();
            if !state.queues.contains_key(&self.name) {
                return Err(BrokerError::NotFound {
                    kind: "queue",
                    name: self.name.clone(),
                });
            }
            let channel = state.channel_mut(self.channel.id)?;
            if channel.consumers.contains_key(consumer_tag) {
                return Err(BrokerError::PreconditionFailed(format!(
                    "consumer tag {consumer_tag} already in use"
                )));
            }
            channel
                .consumers
                .insert(consumer_tag.to_owned(), self.name.clone());
        }
        Ok(self.deliveries(consumer_tag.to_owned()))
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError> {
        self.channel.state().lock().settle(
            self.channel.id,
            SettlementAction::Ack,
            delivery_tag,
            multiple,
            false,
        )
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel.state().lock().settle(
            self.channel.id,
            SettlementAction::Reject,
            delivery_tag,
            false,
            requeue,
        )
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), BrokerError> {
        self.channel.state().lock().settle(
            self.channel.id,
            SettlementAction::Nack,
            delivery_tag,
            multiple,
            requeue,
        )
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = self.channel.state().lock();
        let channel = state.channel_mut(self.channel.id)?;
        channel.consumers.remove(consumer_tag);
        if let Some(queue) = state.queues.get(&self.name) {
            queue.notify.notify_waiters();
        }
        Ok(())
    }
}
