//! # Ackloop
//!
//! An asynchronous message queue consumer for Rust that drives your handler one delivery at a
//! time and commits the outcome back to the broker, batching acknowledgments to save round
//! trips. On top of it sits a JSON-RPC server that turns a queue into an RPC transport.
//!
//! ## Features
//!
//! - **Four Verdicts**: Handlers acknowledge, reject, reject-and-requeue or defer each delivery
//! - **Batched Acknowledgment**: Deferred deliveries are committed with a single multiple ack
//!   (or nack) once the batch is full or the queue goes quiet
//! - **Fault Isolation**: A failing or panicking handler requeues its own message and the loop
//!   carries on; only broker failures end `consume`
//! - **Control Messages**: `shutdown` and `reconfigure` travel on the data queue itself
//! - **Graceful Shutdown**: SIGINT, SIGTERM and SIGHUP (or any [`CancellationToken`]) stop the
//!   loop between deliveries after a final flush
//! - **JSON-RPC**: Requests, notifications, coded errors and correlated replies in
//!   [`json_rpc`]
//! - **Pluggable Brokers**: Everything runs against the [`Connection`], [`Channel`],
//!   [`Exchange`] and [`Queue`] traits; an in-memory broker ships in [`memory`] and a RabbitMQ
//!   adapter behind the `lapin` feature
//! - **Structured Logging**: Every commit and failure is reported through `tracing`
//!
//! ## Quick Start
//!
//! ```rust
//! use ackloop::memory::MemoryBroker;
//! use ackloop::{BoxError, Channel, Connection, Consumer, ConsumerConfig, DeliveryHandler};
//! use ackloop::{DeliveryResult, Envelope, Queue};
//!
//! // 1. Implement DeliveryHandler for your business logic
//! struct Indexer {
//!     pending: Vec<String>,
//! }
//!
//! impl DeliveryHandler for Indexer {
//!     async fn handle_delivery(&mut self, envelope: &Envelope) -> Result<DeliveryResult, BoxError> {
//!         self.pending.push(envelope.body_lossy().into_owned());
//!         // Commit together with the rest of the batch
//!         Ok(DeliveryResult::Defer)
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // 2. Open a queue on a broker
//! let broker = MemoryBroker::new();
//! let channel = broker.connect().new_channel().await?;
//! let queue = channel.new_queue("documents");
//! queue.declare().await?;
//! for doc in ["a", "b", "c"] {
//!     broker.publish_to_queue("documents", doc);
//! }
//!
//! // 3. Configure and run the consumer
//! let config = ConsumerConfig {
//!     batch_size: 2,
//!     handle_signals: false,
//!     ..Default::default()
//! };
//! let mut consumer = Consumer::new(queue, Indexer { pending: Vec::new() }, config);
//!
//! let stats = consumer.consume(3).await?;
//! assert_eq!(stats.acknowledged, 3);
//! assert_eq!(stats.flushes, 2);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **[`Consumer`]**: The loop. Owns the session state (counters, deferred tags, batch clock)
//!   for the duration of one `consume` call
//! - **[`DeliveryHandler`]**: Your verdicts, plus the optional batch flush and error hooks
//! - **[`CallbackConsumer`]**: The same loop configured with plain closures
//! - **[`json_rpc::RpcServer`]**: A consumer whose handler answers JSON-RPC requests
//!
//! ### How it Works
//!
//! For each delivery the consumer:
//! 1. Waits for the next envelope, the shutdown token or the idle deadline, whichever comes first
//! 2. Handles control messages itself and acknowledges them
//! 3. Otherwise calls the handler and applies its verdict; `Defer` buffers the delivery tag
//! 4. Flushes the buffer when it reaches the batch size or has waited for the idle timeout
//! 5. Stops after the target count, a shutdown or the end of the delivery stream, flushing
//!    whatever is still buffered
//!
//! ## Examples
//!
//! See the `demos/` directory for RabbitMQ consumers (`--features lapin`).

pub mod broker;
pub mod callback_consumer;
pub mod consumer;
pub mod control;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod json_rpc;
#[cfg(feature = "lapin")]
pub mod lapin_adapter;
pub mod memory;
pub mod shutdown;

pub use broker::{Channel, Connection, Deliveries, Exchange, ExchangeKind, PublishFlags, Queue};
pub use callback_consumer::CallbackConsumer;
pub use consumer::{ConsumeStats, Consumer, ConsumerConfig};
pub use envelope::{Envelope, Headers, MessageAttributes};
pub use error::{BoxError, BrokerError, Error, Result};
pub use handler::{DeliveryHandler, DeliveryResult, FlushDeferredResult};
pub use tokio_util::sync::CancellationToken;
