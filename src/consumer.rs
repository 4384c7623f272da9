//! This module contains the configuration and implementation of the batched-acknowledgment
//! consumer loop.

use std::{any::Any, panic::AssertUnwindSafe, str::FromStr, time::Duration};

use futures::{FutureExt, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    BoxError, BrokerError, Channel, DeliveryHandler, DeliveryResult, Envelope, Error,
    FlushDeferredResult, Queue, Result,
    broker::Deliveries,
    control::{ControlMessage, DEFAULT_CONTROL_APP_ID, Reconfigure},
    shutdown,
};

/// Configuration for a [`Consumer`]
///
/// # Examples
///
/// ```rust
/// use ackloop::ConsumerConfig;
/// use std::time::Duration;
///
/// let config = ConsumerConfig {
///     batch_size: 100,
///     idle_timeout: Some(Duration::from_secs(2)),
///     handle_signals: false,
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    /// Number of deferred deliveries committed together
    ///
    /// When the deferred buffer reaches this size it is flushed with a single batched
    /// ack (or reject).
    /// Default: 50
    pub batch_size: usize,
    /// Maximum age of a pending deferred batch
    ///
    /// The clock starts with the first deferral after a flush. It is advisory: it bounds how
    /// long acknowledgments are held back, not how long the consumer waits for a delivery.
    /// `None` disables time based flushing.
    /// Default: 5 seconds
    pub idle_timeout: Option<Duration>,
    /// Tag the broker consumer is registered under
    ///
    /// Default: `ackloop-<random uuid>`
    pub consumer_tag: String,
    /// Cancel the consumer on SIGINT, SIGTERM and SIGHUP
    ///
    /// Default: true
    pub handle_signals: bool,
    /// Reserved `app_id` identifying in-band control messages
    ///
    /// Default: `"ackloop"`
    pub control_app_id: String,
    /// Ask the broker to requeue deliveries of a rejected deferred batch
    ///
    /// Default: false
    pub requeue_rejected_batch: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            idle_timeout: Some(Duration::from_secs(5)),
            consumer_tag: generate_consumer_tag(),
            handle_signals: true,
            control_app_id: DEFAULT_CONTROL_APP_ID.to_owned(),
            requeue_rejected_batch: false,
        }
    }
}

impl ConsumerConfig {
    /// Build a configuration from `ACKLOOP_*` environment variables.
    ///
    /// Unset variables keep their default:
    ///
    /// * `ACKLOOP_BATCH_SIZE`
    /// * `ACKLOOP_IDLE_TIMEOUT_SECS` (`0` disables the idle timeout)
    /// * `ACKLOOP_CONSUMER_TAG`
    /// * `ACKLOOP_HANDLE_SIGNALS`
    /// * `ACKLOOP_CONTROL_APP_ID`
    /// * `ACKLOOP_REQUEUE_REJECTED_BATCH`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(batch_size) = env_parse::<usize>("ACKLOOP_BATCH_SIZE")? {
            if batch_size == 0 {
                return Err(Error::Config {
                    key: "ACKLOOP_BATCH_SIZE",
                    reason: "must be greater than zero".to_owned(),
                });
            }
            config.batch_size = batch_size;
        }
        if let Some(secs) = env_parse::<u64>("ACKLOOP_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Ok(tag) = std::env::var("ACKLOOP_CONSUMER_TAG") {
            config.consumer_tag = tag;
        }
        if let Some(handle_signals) = env_parse::<bool>("ACKLOOP_HANDLE_SIGNALS")? {
            config.handle_signals = handle_signals;
        }
        if let Ok(app_id) = std::env::var("ACKLOOP_CONTROL_APP_ID") {
            config.control_app_id = app_id;
        }
        if let Some(requeue) = env_parse::<bool>("ACKLOOP_REQUEUE_REJECTED_BATCH")? {
            config.requeue_rejected_batch = requeue;
        }

        Ok(config)
    }
}

fn env_parse<T>(key: &'static str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|e: T::Err| Error::Config {
            key,
            reason: e.to_string(),
        }),
        Err(_) => Ok(None),
    }
}

fn generate_consumer_tag() -> String {
    format!("ackloop-{}", uuid::Uuid::new_v4().simple())
}

/// Counters reported when [`Consumer::consume`] returns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    /// Deliveries taken off the queue, control messages included
    pub consumed: usize,
    /// Deliveries acknowledged, singly or in a batch
    pub acknowledged: usize,
    /// Deliveries rejected without requeue
    pub rejected: usize,
    /// Deliveries rejected with requeue
    pub requeued: usize,
    /// Deferred batches committed
    pub flushes: usize,
}

/// Per `consume` call state. Created fresh on every call.
struct Session {
    target: usize,
    unacked: usize,
    last_delivery_tag: Option<u64>,
    last_delivery_at: Option<Instant>,
    deferred: Vec<u64>,
    batch_started_at: Option<Instant>,
    batch_size: usize,
    idle_timeout: Option<Duration>,
    shutdown_requested: bool,
    stats: ConsumeStats,
}

impl Session {
    fn new(target: usize, config: &ConsumerConfig) -> Self {
        Self {
            target,
            unacked: 0,
            last_delivery_tag: None,
            last_delivery_at: None,
            deferred: Vec::with_capacity(config.batch_size),
            batch_started_at: None,
            batch_size: config.batch_size.max(1),
            idle_timeout: config.idle_timeout,
            shutdown_requested: false,
            stats: ConsumeStats::default(),
        }
    }

    fn record(&mut self, envelope: &Envelope) {
        self.stats.consumed += 1;
        self.unacked += 1;
        self.last_delivery_tag = Some(envelope.delivery_tag());
        self.last_delivery_at = Some(Instant::now());
    }

    fn settle(&mut self, count: usize) {
        self.unacked = self.unacked.saturating_sub(count);
    }

    fn defer(&mut self, delivery_tag: u64) {
        if self.deferred.is_empty() {
            self.batch_started_at = Some(Instant::now());
        }
        self.deferred.push(delivery_tag);
    }

    fn is_stopping(&self) -> bool {
        self.shutdown_requested || (self.target > 0 && self.stats.consumed >= self.target)
    }

    fn batch_full(&self) -> bool {
        self.deferred.len() >= self.batch_size
    }

    fn idle_flush_due(&self) -> bool {
        match (self.idle_timeout, self.batch_started_at) {
            (Some(timeout), Some(started)) => !self.deferred.is_empty() && started.elapsed() >= timeout,
            _ => false,
        }
    }

    /// How long to wait for the next delivery before re-checking the idle flush
    fn wait_interval(&self) -> Option<Duration> {
        let timeout = self.idle_timeout?;
        match self.batch_started_at {
            Some(started) if !self.deferred.is_empty() => {
                Some(timeout.saturating_sub(started.elapsed()))
            }
            _ => Some(timeout),
        }
    }
}

enum Next {
    Delivery(Envelope),
    Idle,
    Closed,
    Cancelled,
}

async fn next_delivery(
    deliveries: &mut Deliveries,
    wait: Option<Duration>,
    shutdown: &CancellationToken,
) -> Result<Next, BrokerError> {
    let next = async {
        match wait {
            Some(wait) => tokio::time::timeout(wait, deliveries.next()).await.ok(),
            None => Some(deliveries.next().await),
        }
    };

    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Ok(Next::Cancelled),
        next = next => match next {
            None => Ok(Next::Idle),
            Some(None) => Ok(Next::Closed),
            Some(Some(Ok(envelope))) => Ok(Next::Delivery(envelope)),
            Some(Some(Err(e))) => Err(e),
        },
    }
}

pub(crate) fn panic_error(payload: Box<dyn Any + Send>) -> BoxError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_owned());
    format!("handler panicked: {message}").into()
}

/// A batched-acknowledgment consumer loop
///
/// The `Consumer` pulls deliveries from a [`Queue`] one at a time, hands each to a
/// [`DeliveryHandler`] and commits the verdict back to the broker:
///
/// - [`DeliveryResult::Ack`], [`DeliveryResult::Reject`] and [`DeliveryResult::RejectRequeue`]
///   settle the single delivery immediately
/// - [`DeliveryResult::Defer`] buffers the delivery tag; the buffer is committed with one
///   batched ack or reject when it reaches `batch_size`, when the batch is older than
///   `idle_timeout`, and when the loop stops
///
/// Control messages (see [`control`](crate::control)) are recognised and handled by the loop
/// itself. Handler errors and panics never stop the loop; only broker failures are returned.
///
/// # Type Parameters
///
/// * `Q` - The queue type that implements [`Queue`]
/// * `H` - The handler type that implements [`DeliveryHandler`]
///
/// # Examples
///
/// ```rust
/// use ackloop::{BoxError, Consumer, DeliveryHandler, DeliveryResult, Envelope};
/// use ackloop::memory::MemoryBroker;
/// use ackloop::{Channel, Connection, Queue};
///
/// struct Printer;
///
/// impl DeliveryHandler for Printer {
///     async fn handle_delivery(&mut self, envelope: &Envelope) -> Result<DeliveryResult, BoxError> {
///         println!("{}", envelope.body_lossy());
///         Ok(DeliveryResult::Defer)
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = MemoryBroker::new();
/// let channel = broker.connect().new_channel().await?;
/// let queue = channel.new_queue("jobs");
/// queue.declare().await?;
/// broker.publish_to_queue("jobs", "hello");
///
/// let mut consumer = Consumer::with_defaults(queue, Printer)
///     .with_batch_size(10)
///     .with_signal_handling(false);
/// let stats = consumer.consume(1).await?;
/// assert_eq!(stats.acknowledged, 1);
/// # Ok(())
/// # }
/// ```
pub struct Consumer<Q, H> {
    queue: Q,
    handler: H,
    config: ConsumerConfig,
    shutdown: CancellationToken,
    signals_registered: bool,
}

impl<Q, H> Consumer<Q, H> {
    /// Create a new consumer with the given queue, handler and configuration
    pub fn new(queue: Q, handler: H, config: ConsumerConfig) -> Self {
        Self {
            queue,
            handler,
            config,
            shutdown: CancellationToken::new(),
            signals_registered: false,
        }
    }

    /// Create a new consumer with default configuration
    pub fn with_defaults(queue: Q, handler: H) -> Self {
        Self::new(queue, handler, ConsumerConfig::default())
    }

    /// Set the deferred batch size (builder pattern)
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size.max(1);
        self
    }

    /// Set the idle timeout; `None` disables time based flushing (builder pattern)
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = idle_timeout;
        self
    }

    /// Set the broker consumer tag (builder pattern)
    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.config.consumer_tag = consumer_tag.into();
        self
    }

    /// Choose whether OS signals stop the consumer (builder pattern)
    pub fn with_signal_handling(mut self, handle_signals: bool) -> Self {
        self.config.handle_signals = handle_signals;
        self
    }

    /// Set the reserved app id of control messages (builder pattern)
    pub fn with_control_app_id(mut self, control_app_id: impl Into<String>) -> Self {
        self.config.control_app_id = control_app_id.into();
        self
    }

    /// Requeue the deliveries of rejected deferred batches (builder pattern)
    pub fn with_requeue_rejected_batch(mut self, requeue: bool) -> Self {
        self.config.requeue_rejected_batch = requeue;
        self
    }

    /// Use an external cancellation token, e.g. one shared by several consumers (builder pattern)
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Token that stops the consumer when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Tear the consumer apart, returning the queue and the handler
    pub fn into_parts(self) -> (Q, H) {
        (self.queue, self.handler)
    }
}

impl<Q, H> Consumer<Q, H>
where
    Q: Queue,
    H: DeliveryHandler,
{
    /// Consume deliveries until `max_messages` have been handled
    ///
    /// A `max_messages` of `0` runs until the consumer is stopped: by a `shutdown` control
    /// message, by cancelling the [`shutdown_token`](Self::shutdown_token) (which OS signals
    /// do when signal handling is on), or by the broker ending the delivery stream. In every
    /// case the current delivery is finished and pending deferred deliveries are flushed
    /// before this returns.
    ///
    /// # Errors
    ///
    /// Only broker failures are returned. Handler errors are settled and logged.
    #[tracing::instrument(skip(self), fields(consumer_tag = %self.config.consumer_tag, queue = self.queue.name()))]
    pub async fn consume(&mut self, max_messages: usize) -> Result<ConsumeStats> {
        if self.config.handle_signals && !self.signals_registered {
            shutdown::listen_for_signals(self.shutdown.clone())?;
            self.signals_registered = true;
        }

        let mut session = Session::new(max_messages, &self.config);
        let mut deliveries = self.queue.consume(&self.config.consumer_tag).await?;

        tracing::info!(
            max_messages,
            batch_size = session.batch_size,
            idle_timeout_secs = session.idle_timeout.map(|t| t.as_secs_f64()),
            "consumer started"
        );

        while !session.is_stopping() {
            let next = next_delivery(&mut deliveries, session.wait_interval(), &self.shutdown)
                .await
                .inspect_err(|e| tracing::error!(error = ?e, "delivery stream failed"))?;

            if session.idle_flush_due() {
                self.flush_deferred(&mut session).await?;
            }

            match next {
                Next::Delivery(envelope) => {
                    self.handle_delivery(&mut session, &envelope).await?;
                    if session.batch_full() || session.idle_flush_due() {
                        self.flush_deferred(&mut session).await?;
                    }
                }
                Next::Idle => {
                    tracing::trace!(
                        idle_for = ?session.last_delivery_at.map(|at| at.elapsed()),
                        pending = session.deferred.len(),
                        "no delivery within idle timeout"
                    );
                }
                Next::Closed => {
                    tracing::info!("delivery stream closed");
                    break;
                }
                Next::Cancelled => {
                    tracing::info!("shutdown requested");
                    session.shutdown_requested = true;
                }
            }
        }

        self.flush_deferred(&mut session).await?;

        if let Err(e) = self.queue.cancel(&self.config.consumer_tag).await {
            tracing::warn!(error = ?e, "unable to cancel broker consumer");
        }

        tracing::info!(
            consumed = session.stats.consumed,
            acknowledged = session.stats.acknowledged,
            rejected = session.stats.rejected,
            requeued = session.stats.requeued,
            unacked = session.unacked,
            last_delivery_tag = session.last_delivery_tag,
            "consumer stopped"
        );

        Ok(session.stats)
    }

    async fn handle_delivery(&mut self, session: &mut Session, envelope: &Envelope) -> Result<()> {
        session.record(envelope);
        let delivery_tag = envelope.delivery_tag();

        tracing::debug!(
            delivery_tag,
            routing_key = envelope.routing_key(),
            message_type = envelope.message_type(),
            redelivered = envelope.is_redelivery(),
            body = %envelope.body_lossy(),
            "handling delivery of message"
        );

        if let Some(control) = ControlMessage::from_envelope(envelope, &self.config.control_app_id)
        {
            return self.handle_control(session, control, envelope).await;
        }

        // The call happens inside the guarded future, so handlers that do their work
        // before returning a future are covered too
        let outcome = AssertUnwindSafe(async { self.handler.handle_delivery(envelope).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panic_error(payload)));

        let verdict = match outcome {
            Ok(verdict) => verdict,
            Err(error) => {
                tracing::error!(delivery_tag, error = %error, "error during delivery handling");
                self.queue.reject(delivery_tag, true).await?;
                session.settle(1);
                session.stats.requeued += 1;
                tracing::debug!(delivery_tag, body = %envelope.body_lossy(), "rejected and requeued message");
                self.handler.handle_error(&error);
                return Ok(());
            }
        };

        match verdict {
            DeliveryResult::Ack => {
                self.queue.ack(delivery_tag, false).await?;
                session.settle(1);
                session.stats.acknowledged += 1;
                tracing::info!(count = 1, delivery_tag, "acknowledged 1 messages");
            }
            DeliveryResult::Reject => {
                self.queue.reject(delivery_tag, false).await?;
                session.settle(1);
                session.stats.rejected += 1;
                tracing::debug!(delivery_tag, "rejected message");
            }
            DeliveryResult::RejectRequeue => {
                self.queue.reject(delivery_tag, true).await?;
                session.settle(1);
                session.stats.requeued += 1;
                tracing::debug!(delivery_tag, "rejected and requeued message");
            }
            DeliveryResult::Defer => session.defer(delivery_tag),
        }

        Ok(())
    }

    async fn handle_control(
        &mut self,
        session: &mut Session,
        control: ControlMessage,
        envelope: &Envelope,
    ) -> Result<()> {
        match control {
            ControlMessage::Shutdown => {
                tracing::info!("shutdown message received");
                session.shutdown_requested = true;
            }
            ControlMessage::Reconfigure => {
                tracing::info!("reconfigure message received");
                match Reconfigure::parse(envelope.body()) {
                    Ok(reconfigure) => self.reconfigure(session, reconfigure).await,
                    Err(e) => tracing::warn!(error = %e, "ignoring malformed reconfigure message"),
                }
            }
            ControlMessage::Unknown(message_type) => {
                tracing::warn!(message_type = %message_type, "ignoring unknown control message");
            }
        }

        let delivery_tag = envelope.delivery_tag();
        self.queue.ack(delivery_tag, false).await?;
        session.settle(1);
        session.stats.acknowledged += 1;
        tracing::info!(count = 1, delivery_tag, "acknowledged 1 messages");

        Ok(())
    }

    async fn reconfigure(&mut self, session: &mut Session, reconfigure: Reconfigure) {
        if let Err(e) = self
            .queue
            .channel()
            .qos(reconfigure.prefetch_size, reconfigure.prefetch_count)
            .await
        {
            tracing::warn!(error = ?e, "unable to apply prefetch settings");
        }

        session.batch_size = reconfigure.batch_size;
        session.idle_timeout = reconfigure.idle_timeout;

        tracing::debug!(
            prefetch_count = reconfigure.prefetch_count,
            prefetch_size = reconfigure.prefetch_size,
            batch_size = reconfigure.batch_size,
            idle_timeout_secs = reconfigure.idle_timeout.map(|t| t.as_secs()),
            "consumer reconfigured"
        );
    }

    async fn flush_deferred(&mut self, session: &mut Session) -> Result<()> {
        let Some(last_tag) = session.deferred.iter().copied().max() else {
            return Ok(());
        };
        let count = session.deferred.len();

        let outcome = AssertUnwindSafe(async { self.handler.flush_deferred().await })
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panic_error(payload)));

        let verdict = match outcome {
            Ok(verdict) => verdict,
            Err(error) => {
                tracing::error!(count, error = %error, "error during deferred flush");
                self.handler.handle_error(&error);
                FlushDeferredResult::Reject
            }
        };

        match verdict {
            FlushDeferredResult::Ack => {
                self.queue.ack(last_tag, true).await?;
                session.stats.acknowledged += count;
                tracing::info!(count, delivery_tag = last_tag, "acknowledged {count} messages");
            }
            FlushDeferredResult::Reject => {
                let requeue = self.config.requeue_rejected_batch;
                self.queue.nack(last_tag, true, requeue).await?;
                if requeue {
                    session.stats.requeued += count;
                } else {
                    session.stats.rejected += count;
                }
                tracing::info!(count, delivery_tag = last_tag, requeue, "not acknowledged {count} messages");
            }
        }

        session.stats.flushes += 1;
        session.settle(count);
        session.deferred.clear();
        session.batch_started_at = None;

        Ok(())
    }
}
