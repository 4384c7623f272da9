use ackloop::json_rpc::{Reply, Request, RpcDelegate, RpcError, RpcServer, RpcServerConfig};
use ackloop::lapin_adapter::LapinConnection;
use ackloop::{BoxError, Channel, Connection, Queue};
use anyhow::Context;
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Answers `add` and `multiply` over a list of integers
pub struct Calculator {
    calls: u64,
}

impl RpcDelegate for Calculator {
    async fn call(&mut self, request: &Request) -> Result<Reply, BoxError> {
        self.calls += 1;

        let values: Vec<i64> =
            serde_json::from_value(request.params().clone()).map_err(|_| RpcError::invalid_params())?;

        let result = match request.method() {
            Some("add") => values.iter().sum::<i64>(),
            Some("multiply") => values.iter().product::<i64>(),
            _ => return Err(RpcError::method_not_found().into()),
        };

        println!("call #{}: {:?} {:?} = {}", self.calls, request.method(), values, result);

        Ok(json!(result).into())
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

    let queue_name =
        std::env::var("RABBITMQ_QUEUE_NAME").unwrap_or_else(|_| "ackloop-rpc-queue".to_string());

    let connection = LapinConnection::connect(&rabbitmq_url).await?;
    let channel = connection.new_channel().await?;
    channel.qos(0, 1).await?;

    let queue = channel.new_queue(&queue_name);
    queue.declare().await?;

    tracing::info!(queue = %queue_name, "initialized rpc server");

    let config = RpcServerConfig {
        app_id: Some("calculator".to_string()),
        ..RpcServerConfig::from_env()?
    };

    let mut server = RpcServer::new(queue, Calculator { calls: 0 }, config);

    let stats = server.consume(0).await?;

    println!("done: {stats:?}");

    Ok(())
}
