use std::{future::Future, panic::AssertUnwindSafe};

use futures::FutureExt;

use serde_json::Value;

use super::{
    CONTENT_ENCODING, CONTENT_TYPE, JSONRPC_HEADER, JSONRPC_VERSION, Request, Response, RpcError,
};
use crate::{
    BoxError, BrokerError, Channel, ConsumeStats, Consumer, ConsumerConfig, DeliveryHandler,
    DeliveryResult, Envelope, Exchange, ExchangeKind, MessageAttributes, PublishFlags, Queue,
    Result, consumer::panic_error, envelope::PERSISTENT,
};

/// What a delegate answers: a plain result value or a complete [`Response`]
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Value(Value),
    Response(Response),
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Value(value)
    }
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Reply::Response(response)
    }
}

/// The application side of an [`RpcServer`].
///
/// Returning an [`RpcError`] (boxed) sends that error to the caller unchanged. Any other error,
/// or a panic, is logged and answered with `-32603 Internal error`.
///
/// # Examples
///
/// ```rust
/// use ackloop::BoxError;
/// use ackloop::json_rpc::{Reply, Request, RpcDelegate, RpcError};
/// use serde_json::json;
///
/// struct Calculator;
///
/// impl RpcDelegate for Calculator {
///     async fn call(&mut self, request: &Request) -> Result<Reply, BoxError> {
///         match request.method() {
///             Some("add") => {
///                 let values: Vec<i64> = serde_json::from_value(request.params().clone())
///                     .map_err(|_| RpcError::invalid_params())?;
///                 Ok(json!(values.iter().sum::<i64>()).into())
///             }
///             _ => Err(RpcError::method_not_found().into()),
///         }
///     }
/// }
/// ```
pub trait RpcDelegate: Send {
    fn call(&mut self, request: &Request) -> impl Future<Output = Result<Reply, BoxError>> + Send;
}

/// Delegate built from an async closure, see [`delegate_fn`]
pub struct FnDelegate<F>(F);

/// Wrap an async closure taking the request by value as an [`RpcDelegate`]
pub fn delegate_fn<F, Fut>(f: F) -> FnDelegate<F>
where
    F: FnMut(Request) -> Fut + Send,
    Fut: Future<Output = Result<Reply, BoxError>> + Send,
{
    FnDelegate(f)
}

impl<F, Fut> RpcDelegate for FnDelegate<F>
where
    F: FnMut(Request) -> Fut + Send,
    Fut: Future<Output = Result<Reply, BoxError>> + Send,
{
    fn call(&mut self, request: &Request) -> impl Future<Output = Result<Reply, BoxError>> + Send {
        (self.0)(request.clone())
    }
}

/// Configuration of an [`RpcServer`]
#[derive(Debug, Clone, Default)]
pub struct RpcServerConfig {
    /// Settings of the underlying consumer loop
    pub consumer: ConsumerConfig,

    /// Direct exchange replies are published to
    ///
    /// Default: `""` (the broker's default exchange, routing by queue name)
    pub reply_exchange: String,

    /// App id stamped on replies
    ///
    /// Default: `None`
    pub app_id: Option<String>,
}

impl RpcServerConfig {
    /// [`ConsumerConfig::from_env`] plus `ACKLOOP_RPC_REPLY_EXCHANGE` and `ACKLOOP_RPC_APP_ID`
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            consumer: ConsumerConfig::from_env()?,
            reply_exchange: std::env::var("ACKLOOP_RPC_REPLY_EXCHANGE").unwrap_or_default(),
            app_id: std::env::var("ACKLOOP_RPC_APP_ID").ok(),
        })
    }
}

/// Delivery handler answering JSON-RPC requests.
///
/// Every request is acknowledged once its reply, if any, has been published. A failed
/// publish is returned as a handler error, so the request is requeued instead.
pub struct RpcHandler<E, D> {
    exchange: E,
    delegate: D,
    app_id: Option<String>,
}

impl<E, D> RpcHandler<E, D>
where
    E: Exchange,
    D: RpcDelegate,
{
    pub fn new(exchange: E, delegate: D, app_id: Option<String>) -> Self {
        Self {
            exchange,
            delegate,
            app_id,
        }
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    pub fn delegate_mut(&mut self) -> &mut D {
        &mut self.delegate
    }

    pub fn exchange(&self) -> &E {
        &self.exchange
    }

    /// Run the request through the delegate. `None` means nothing is to be sent back.
    async fn respond(&mut self, envelope: &Envelope) -> Option<Response> {
        let id = envelope.correlation_id().map(str::to_owned);

        let request = match Request::from_envelope(envelope) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(
                    delivery_tag = envelope.delivery_tag(),
                    correlation_id = ?id,
                    error = %e,
                    "invalid json rpc request"
                );
                return Some(Response::with_error(e.to_rpc_error(), id));
            }
        };

        let outcome = AssertUnwindSafe(async { self.delegate.call(&request).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panic_error(payload)));

        match outcome {
            Ok(_) if request.is_notification() => None,
            Ok(Reply::Value(result)) => Some(Response::with_result(result, id)),
            Ok(Reply::Response(response)) => Some(response.with_id(id)),
            Err(e) => {
                let error = match e.downcast::<RpcError>() {
                    Ok(rpc_error) => *rpc_error,
                    Err(e) => {
                        tracing::error!(
                            delivery_tag = envelope.delivery_tag(),
                            method = ?request.method(),
                            correlation_id = ?id,
                            error = %e,
                            detail = ?e,
                            "exception occurred in rpc delegate"
                        );
                        RpcError::internal_error()
                    }
                };
                Some(Response::with_error(error, id))
            }
        }
    }

    async fn send_reply(
        exchange: &E,
        app_id: Option<&str>,
        response: &Response,
        envelope: &Envelope,
    ) -> Result<(), BrokerError> {
        let Some(reply_to) = envelope.reply_to() else {
            tracing::warn!(
                delivery_tag = envelope.delivery_tag(),
                correlation_id = ?response.id(),
                "request has no reply-to, dropping reply"
            );
            return Ok(());
        };

        let mut attributes = MessageAttributes::default()
            .with_content_type(CONTENT_TYPE)
            .with_content_encoding(CONTENT_ENCODING)
            .with_delivery_mode(PERSISTENT)
            .with_header(JSONRPC_HEADER, JSONRPC_VERSION);
        if let Some(id) = response.id() {
            attributes = attributes.with_correlation_id(id);
        }
        if let Some(app_id) = app_id {
            attributes = attributes.with_app_id(app_id);
        }

        exchange
            .publish(&response.to_vec(), reply_to, PublishFlags::default(), &attributes)
            .await?;

        tracing::debug!(
            reply_to,
            correlation_id = ?response.id(),
            error = response.is_error(),
            "sent rpc reply"
        );
        Ok(())
    }
}

impl<E, D> DeliveryHandler for RpcHandler<E, D>
where
    E: Exchange,
    D: RpcDelegate,
{
    async fn handle_delivery(&mut self, envelope: &Envelope) -> Result<DeliveryResult, BoxError> {
        if let Some(response) = self.respond(envelope).await {
            Self::send_reply(&self.exchange, self.app_id.as_deref(), &response, envelope).await?;
        }
        Ok(DeliveryResult::Ack)
    }
}

type ReplyExchange<Q> = <<Q as Queue>::Channel as Channel>::Exchange;

/// A consumer loop serving JSON-RPC requests from a queue.
///
/// Control messages are handled by the loop as for any [`Consumer`]; they never reach the
/// delegate.
///
/// # Examples
///
/// ```rust
/// use ackloop::json_rpc::{Reply, RpcServer, RpcServerConfig, delegate_fn};
/// use ackloop::memory::MemoryBroker;
/// use ackloop::{Channel, Connection, Queue};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = MemoryBroker::new();
/// let channel = broker.connect().new_channel().await?;
/// let queue = channel.new_queue("rpc");
/// queue.declare().await?;
///
/// let delegate = delegate_fn(|request| async move {
///     Ok::<Reply, ackloop::BoxError>(json!({ "echo": request.params() }).into())
/// });
/// let mut config = RpcServerConfig::default();
/// config.consumer.handle_signals = false;
///
/// let mut server = RpcServer::new(queue, delegate, config);
/// # broker.publish_to_queue("rpc", "{}");
/// server.consume(1).await?;
/// # Ok(())
/// # }
/// ```
pub struct RpcServer<Q: Queue, D> {
    inner: Consumer<Q, RpcHandler<ReplyExchange<Q>, D>>,
    reply_exchange_declared: bool,
}

impl<Q, D> RpcServer<Q, D>
where
    Q: Queue,
    D: RpcDelegate,
{
    pub fn new(queue: Q, delegate: D, config: RpcServerConfig) -> Self {
        let exchange = queue
            .channel()
            .new_exchange(&config.reply_exchange, ExchangeKind::Direct);
        let handler = RpcHandler::new(exchange, delegate, config.app_id);

        Self {
            // The default exchange exists on every broker and cannot be declared
            reply_exchange_declared: config.reply_exchange.is_empty(),
            inner: Consumer::new(queue, handler, config.consumer),
        }
    }

    pub fn with_defaults(queue: Q, delegate: D) -> Self {
        Self::new(queue, delegate, RpcServerConfig::default())
    }

    pub fn shutdown_token(&self) -> tokio_util::sync::CancellationToken {
        self.inner.shutdown_token()
    }

    pub fn with_shutdown(mut self, shutdown: tokio_util::sync::CancellationToken) -> Self {
        self.inner = self.inner.with_shutdown(shutdown);
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        self.inner.config()
    }

    pub fn queue(&self) -> &Q {
        self.inner.queue()
    }

    pub fn delegate(&self) -> &D {
        self.inner.handler().delegate()
    }

    pub fn delegate_mut(&mut self) -> &mut D {
        self.inner.handler_mut().delegate_mut()
    }

    /// Serve requests, see [`Consumer::consume`]
    pub async fn consume(&mut self, max_messages: usize) -> Result<ConsumeStats> {
        if !self.reply_exchange_declared {
            let exchange = self.inner.handler().exchange();
            exchange.declare().await?;
            self.reply_exchange_declared = true;
        }
        self.inner.consume(max_messages).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        Connection,
        memory::{MemoryBroker, MemoryQueue},
    };

    async fn server_queue(broker: &MemoryBroker) -> MemoryQueue {
        let channel = broker.connect().new_channel().await.unwrap();
        for name in ["rpc", "replies"] {
            channel.new_queue(name).declare().await.unwrap();
        }
        channel.new_queue("rpc")
    }

    fn request(id: &str) -> MessageAttributes {
        MessageAttributes::default()
            .with_content_type(CONTENT_TYPE)
            .with_content_encoding(CONTENT_ENCODING)
            .with_header(JSONRPC_HEADER, JSONRPC_VERSION)
            .with_correlation_id(id)
            .with_reply_to("replies")
    }

    fn config() -> RpcServerConfig {
        let mut config = RpcServerConfig {
            app_id: Some("calc".to_owned()),
            ..Default::default()
        };
        config.consumer.handle_signals = false;
        config
    }

    #[tokio::test]
    #[traced_test]
    async fn internal_errors_are_logged_and_answered_with_internal_error() {
        let broker = MemoryBroker::new();
        let queue = server_queue(&broker).await;
        broker.publish_to_queue_with("rpc", "[]", request("c-1"));

        let delegate = delegate_fn(|_request| async { Err::<Reply, BoxError>("database is down".into()) });
        let mut server = RpcServer::new(queue, delegate, config());
        server.consume(1).await.unwrap();

        let body = broker.ready_bodies("replies").remove(0);
        let response = Response::from_json(&body, None).unwrap();
        assert_eq!(response.error().map(RpcError::code), Some(RpcError::INTERNAL_ERROR));
        assert!(logs_contain("exception occurred in rpc delegate"));
        assert!(logs_contain("database is down"));
    }

    #[tokio::test]
    async fn application_errors_pass_through() {
        let broker = MemoryBroker::new();
        let queue = server_queue(&broker).await;
        broker.publish_to_queue_with("rpc", "{}", request("c-2"));

        let delegate = delegate_fn(|_request| async {
            Err::<Reply, BoxError>(RpcError::new(4001, "insufficient funds").with_data(json!(12)).into())
        });
        let mut server = RpcServer::new(queue, delegate, config());
        server.consume(1).await.unwrap();

        let body = broker.ready_bodies("replies").remove(0);
        assert_eq!(
            serde_json::from_slice::<Value>(&body).unwrap(),
            json!({"error": {"code": 4001, "message": "insufficient funds"}, "data": 12})
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn request_without_reply_to_is_acknowledged_without_reply() {
        let broker = MemoryBroker::new();
        let queue = server_queue(&broker).await;
        let attributes = MessageAttributes::default()
            .with_content_type(CONTENT_TYPE)
            .with_content_encoding(CONTENT_ENCODING)
            .with_header(JSONRPC_HEADER, JSONRPC_VERSION)
            .with_correlation_id("c-3");
        broker.publish_to_queue_with("rpc", "1", attributes);

        let delegate = delegate_fn(|_request| async { Ok::<Reply, BoxError>(json!(true).into()) });
        let mut server = RpcServer::new(queue, delegate, config());
        let stats = server.consume(1).await.unwrap();

        assert_eq!(stats.acknowledged, 1);
        assert_eq!(broker.ready_count("replies"), 0);
        assert!(logs_contain("request has no reply-to"));
    }

    #[tokio::test]
    async fn a_named_reply_exchange_is_declared_before_serving() {
        let broker = MemoryBroker::new();
        let queue = server_queue(&broker).await;
        let channel = queue.channel().clone();
        broker.publish_to_queue_with("rpc", "{}", request("c-4"));

        let mut config = config();
        config.reply_exchange = "rpc.replies".to_owned();
        let delegate = delegate_fn(|_request| async { Ok::<Reply, BoxError>(json!("ok").into()) });
        let mut server = RpcServer::new(queue, delegate, config);

        channel.new_queue("replies").bind("rpc.replies", "replies").await.unwrap_err();
        server.consume(1).await.unwrap();
        channel.new_queue("replies").bind("rpc.replies", "replies").await.unwrap();
    }

    /// Send but not Sync, like most delegates holding a client or a cache
    struct Counter {
        calls: std::cell::Cell<u32>,
    }

    impl RpcDelegate for Counter {
        async fn call(&mut self, _request: &Request) -> Result<Reply, BoxError> {
            self.calls.set(self.calls.get() + 1);
            Ok(json!(self.calls.get()).into())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn servers_with_send_only_delegates_run_on_spawned_tasks() {
        let broker = MemoryBroker::new();
        let queue = server_queue(&broker).await;
        broker.publish_to_queue_with("rpc", "[]", request("c-5"));

        let delegate = Counter {
            calls: std::cell::Cell::new(0),
        };
        let mut server = RpcServer::new(queue, delegate, config());
        let (server, stats) = tokio::spawn(async move {
            let stats = server.consume(1).await;
            (server, stats)
        })
        .await
        .unwrap();

        assert_eq!(stats.unwrap().acknowledged, 1);
        assert_eq!(server.delegate().calls.get(), 1);
        let body = broker.ready_bodies("replies").remove(0);
        assert_eq!(Response::from_json(&body, None).unwrap().result(), Some(&json!(1)));
    }
}
