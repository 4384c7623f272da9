use std::time::Duration;

use ackloop::lapin_adapter::LapinConnection;
use ackloop::{
    BoxError, Channel, Connection, Consumer, ConsumerConfig, DeliveryHandler, DeliveryResult,
    Envelope, FlushDeferredResult, Queue,
};
use anyhow::Context;
use tracing_subscriber::EnvFilter;

/// Collects messages and writes them out once per batch
pub struct BatchWriter {
    pending: Vec<String>,
}

impl DeliveryHandler for BatchWriter {
    async fn handle_delivery(&mut self, envelope: &Envelope) -> Result<DeliveryResult, BoxError> {
        let body = envelope.body_lossy().into_owned();

        match body.as_str() {
            "" => Ok(DeliveryResult::Reject),
            "fail" => Err("refusing to handle this message".into()),
            _ => {
                self.pending.push(body);
                Ok(DeliveryResult::Defer)
            }
        }
    }

    async fn flush_deferred(&mut self) -> Result<FlushDeferredResult, BoxError> {
        println!("Writing batch of {} messages: {:?}", self.pending.len(), self.pending);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.pending.clear();

        Ok(FlushDeferredResult::Ack)
    }

    fn handle_error(&mut self, error: &BoxError) {
        println!("Handler error: {error}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_line_number(true)
        .init();

    let rabbitmq_url = std::env::var("RABBITMQ_URL").context("RABBITMQ_URL is not set")?;

    let queue_name = std::env::var("RABBITMQ_QUEUE_NAME")
        .unwrap_or_else(|_| "ackloop-consumer-queue".to_string());

    let connection = LapinConnection::connect(&rabbitmq_url).await?;
    let channel = connection.new_channel().await?;
    channel.qos(0, 100).await?;

    let queue = channel.new_queue(&queue_name);
    queue.declare().await?;

    tracing::info!(queue = %queue_name, "initialized rabbitmq consumer");

    // ACKLOOP_BATCH_SIZE, ACKLOOP_IDLE_TIMEOUT_SECS, ...
    let config = ConsumerConfig::from_env()?;

    let handler = BatchWriter {
        pending: Vec::new(),
    };

    let mut consumer = Consumer::new(queue, handler, config);

    // Runs until SIGINT/SIGTERM/SIGHUP or a shutdown control message
    let stats = consumer.consume(0).await?;

    println!("done: {stats:?}");

    Ok(())
}
