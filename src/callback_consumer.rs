//! A [`Consumer`] configured with plain closures.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{
    BoxError, ConsumeStats, Consumer, ConsumerConfig, DeliveryHandler, DeliveryResult, Envelope,
    FlushDeferredResult, Queue, Result,
};

type DeliveryCallback = Box<dyn FnMut(&Envelope) -> Result<DeliveryResult, BoxError> + Send>;
type FlushCallback = Box<dyn FnMut() -> Result<FlushDeferredResult, BoxError> + Send>;
type ErrorCallback = Box<dyn FnMut(&BoxError) + Send>;

/// Handler built from the callbacks of a [`CallbackConsumer`]
pub struct Callbacks {
    delivery: DeliveryCallback,
    flush: Option<FlushCallback>,
    error: Option<ErrorCallback>,
}

impl DeliveryHandler for Callbacks {
    async fn handle_delivery(&mut self, envelope: &Envelope) -> Result<DeliveryResult, BoxError> {
        (self.delivery)(envelope)
    }

    async fn flush_deferred(&mut self) -> Result<FlushDeferredResult, BoxError> {
        match self.flush.as_mut() {
            Some(flush) => flush(),
            None => Ok(FlushDeferredResult::Ack),
        }
    }

    fn handle_error(&mut self, error: &BoxError) {
        if let Some(callback) = self.error.as_mut() {
            callback(error);
        }
    }
}

/// The usual way to run the consumer loop: a queue, a batch size and a delivery callback.
///
/// The callbacks run synchronously on the consuming task. Implement
/// [`DeliveryHandler`] directly when the handling itself needs to await.
///
/// # Examples
///
/// ```rust
/// use ackloop::{CallbackConsumer, DeliveryResult};
/// use ackloop::memory::MemoryBroker;
/// use ackloop::{Channel, Connection, Queue};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = MemoryBroker::new();
/// let channel = broker.connect().new_channel().await?;
/// let queue = channel.new_queue("emails");
/// queue.declare().await?;
/// broker.publish_to_queue("emails", "welcome");
///
/// let mut consumer = CallbackConsumer::new(queue, 10, |envelope| {
///     println!("sending {}", envelope.body_lossy());
///     Ok(DeliveryResult::Ack)
/// })
/// .with_signal_handling(false);
///
/// consumer.consume(1).await?;
/// # Ok(())
/// # }
/// ```
pub struct CallbackConsumer<Q> {
    inner: Consumer<Q, Callbacks>,
}

impl<Q> CallbackConsumer<Q> {
    /// Create a consumer committing deferred deliveries in batches of `batch_size`
    pub fn new<F>(queue: Q, batch_size: usize, delivery: F) -> Self
    where
        F: FnMut(&Envelope) -> Result<DeliveryResult, BoxError> + Send + 'static,
    {
        let callbacks = Callbacks {
            delivery: Box::new(delivery),
            flush: None,
            error: None,
        };
        let config = ConsumerConfig {
            batch_size: batch_size.max(1),
            ..Default::default()
        };

        Self {
            inner: Consumer::new(queue, callbacks, config),
        }
    }

    /// Decide how deferred batches are committed; without it they are acknowledged
    pub fn with_flush_callback<F>(mut self, flush: F) -> Self
    where
        F: FnMut() -> Result<FlushDeferredResult, BoxError> + Send + 'static,
    {
        self.inner.handler_mut().flush = Some(Box::new(flush));
        self
    }

    /// Observe delivery and flush errors after they have been settled
    pub fn with_error_callback<F>(mut self, error: F) -> Self
    where
        F: FnMut(&BoxError) + Send + 'static,
    {
        self.inner.handler_mut().error = Some(Box::new(error));
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.inner = self.inner.with_idle_timeout(idle_timeout);
        self
    }

    pub fn with_signal_handling(mut self, handle_signals: bool) -> Self {
        self.inner = self.inner.with_signal_handling(handle_signals);
        self
    }

    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.inner = self.inner.with_consumer_tag(consumer_tag);
        self
    }

    pub fn with_control_app_id(mut self, control_app_id: impl Into<String>) -> Self {
        self.inner = self.inner.with_control_app_id(control_app_id);
        self
    }

    pub fn with_requeue_rejected_batch(mut self, requeue: bool) -> Self {
        self.inner = self.inner.with_requeue_rejected_batch(requeue);
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.inner = self.inner.with_shutdown(shutdown);
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown_token()
    }

    pub fn config(&self) -> &ConsumerConfig {
        self.inner.config()
    }

    pub fn queue(&self) -> &Q {
        self.inner.queue()
    }
}

impl<Q: Queue> CallbackConsumer<Q> {
    /// See [`Consumer::consume`]
    pub async fn consume(&mut self, max_messages: usize) -> Result<ConsumeStats> {
        self.inner.consume(max_messages).await
    }
}
