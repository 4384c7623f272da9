//! The handler seam of the consumer loop: verdict types and the [`DeliveryHandler`] trait.

use std::future::Future;

use crate::{BoxError, Envelope};

/// What the consumer should do with a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryResult {
    /// Acknowledge the message right away
    Ack,
    /// Reject the message without requeueing it
    Reject,
    /// Reject the message and ask the broker to requeue it
    RejectRequeue,
    /// Hold the delivery tag until the next deferred flush
    Defer,
}

/// How a batch of deferred deliveries is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FlushDeferredResult {
    /// Acknowledge every buffered delivery
    #[default]
    Ack,
    /// Reject every buffered delivery
    Reject,
}

/// A trait for handlers driven by the [`Consumer`](crate::Consumer) loop.
///
/// Implement this trait to define your business logic for incoming messages. Deliveries are
/// handed over one at a time in arrival order, so the handler can keep state across calls
/// through `&mut self`.
///
/// # Error Handling
///
/// Errors (and panics) from [`handle_delivery`](Self::handle_delivery) never stop the loop: the
/// message is rejected with requeue, the error is logged and passed to
/// [`handle_error`](Self::handle_error). The broker decides how often a message is redelivered;
/// the loop keeps no retry count, so a message that always fails loops until the broker's
/// delivery limit (or a dead letter policy) stops it.
///
/// An error from [`flush_deferred`](Self::flush_deferred) rejects the whole pending batch.
///
/// # Examples
///
/// ```rust
/// use ackloop::{BoxError, DeliveryHandler, DeliveryResult, Envelope};
///
/// struct Counter {
///     seen: usize,
/// }
///
/// impl DeliveryHandler for Counter {
///     async fn handle_delivery(&mut self, envelope: &Envelope) -> Result<DeliveryResult, BoxError> {
///         self.seen += 1;
///         if envelope.body().is_empty() {
///             return Ok(DeliveryResult::Reject);
///         }
///         Ok(DeliveryResult::Defer)
///     }
/// }
/// ```
pub trait DeliveryHandler: Send {
    /// Decide what to do with one delivery
    fn handle_delivery(
        &mut self,
        envelope: &Envelope,
    ) -> impl Future<Output = Result<DeliveryResult, BoxError>> + Send;

    /// Decide how the buffered deferred deliveries are committed. Acknowledges by default.
    fn flush_deferred(
        &mut self,
    ) -> impl Future<Output = Result<FlushDeferredResult, BoxError>> + Send {
        async { Ok(FlushDeferredResult::Ack) }
    }

    /// Called after a delivery or flush error has been logged and settled
    fn handle_error(&mut self, _error: &BoxError) {}
}
