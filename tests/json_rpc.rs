use ackloop::json_rpc::{
    JSONRPC_VERSION, Reply, Request, Response, RpcDelegate, RpcError, RpcServer, RpcServerConfig,
    delegate_fn,
};
use ackloop::memory::{MemoryBroker, MemoryQueue, SettlementAction};
use ackloop::{BoxError, Channel, Connection, Envelope, MessageAttributes, Queue};
use serde_json::{Value, json};

#[derive(Default)]
struct Calculator {
    calls: Vec<Option<String>>,
}

impl RpcDelegate for Calculator {
    async fn call(&mut self, request: &Request) -> Result<Reply, BoxError> {
        self.calls.push(request.method().map(str::to_owned));

        match request.method() {
            Some("add") => {
                let values: Vec<i64> = serde_json::from_value(request.params().clone())
                    .map_err(|_| RpcError::invalid_params())?;
                Ok(json!(values.iter().sum::<i64>()).into())
            }
            Some("status") => Ok(Response::with_result(json!({"healthy": true}), None).into()),
            Some("crash") => Err(std::io::Error::other("connection reset").into()),
            Some("explode") => panic!("calculator exploded"),
            _ => Err(RpcError::method_not_found().into()),
        }
    }
}

struct Harness {
    broker: MemoryBroker,
    requests: MemoryQueue,
    replies: MemoryQueue,
}

async fn harness() -> Harness {
    let broker = MemoryBroker::new();
    let channel = broker.connect().new_channel().await.unwrap();
    let requests = channel.new_queue("calculator");
    requests.declare().await.unwrap();
    let replies = channel.new_queue("client-replies");
    replies.declare().await.unwrap();

    Harness {
        broker,
        requests,
        replies,
    }
}

fn call(method: &str, id: Option<&str>) -> MessageAttributes {
    let attributes = MessageAttributes::default()
        .with_content_type("application/json")
        .with_content_encoding("UTF-8")
        .with_header("jsonrpc", JSONRPC_VERSION)
        .with_message_type(method)
        .with_reply_to("client-replies");
    match id {
        Some(id) => attributes.with_correlation_id(id),
        None => attributes,
    }
}

fn server(requests: MemoryQueue) -> RpcServer<MemoryQueue, Calculator> {
    let mut config = RpcServerConfig {
        app_id: Some("calculator".to_owned()),
        ..Default::default()
    };
    config.consumer.handle_signals = false;
    config.consumer.idle_timeout = None;
    RpcServer::new(requests, Calculator::default(), config)
}

async fn next_reply(replies: &MemoryQueue) -> Envelope {
    replies.get().await.unwrap().expect("a reply was published")
}

fn body(envelope: &Envelope) -> Value {
    serde_json::from_slice(envelope.body()).unwrap()
}

#[tokio::test]
async fn request_is_answered_with_a_correlated_result() {
    let Harness {
        broker,
        requests,
        replies,
    } = harness().await;
    broker.publish_to_queue_with("calculator", "[1, 2, 3]", call("add", Some("call-1")));
    let channel = requests.channel().clone();
    let mut server = server(requests);

    let stats = server.consume(1).await.unwrap();

    let reply = next_reply(&replies).await;
    assert_eq!(body(&reply), json!({"result": 6}));
    assert_eq!(reply.correlation_id(), Some("call-1"));
    assert_eq!(reply.content_type(), Some("application/json"));
    assert_eq!(reply.content_encoding(), Some("UTF-8"));
    assert_eq!(reply.delivery_mode(), Some(2));
    assert_eq!(reply.app_id(), Some("calculator"));
    assert_eq!(reply.header("jsonrpc"), Some(&json!("2.0")));
    assert_eq!(reply.routing_key(), "client-replies");

    let response = Response::from_json(reply.body(), reply.correlation_id().map(str::to_owned)).unwrap();
    assert_eq!(response.into_result(), Ok(json!(6)));

    // Immediate single ack of the request
    assert_eq!(stats.acknowledged, 1);
    let settlements = channel.settlements();
    assert_eq!(settlements[0].action, SettlementAction::Ack);
    assert!(!settlements[0].multiple);
}

#[tokio::test]
async fn notification_runs_the_delegate_without_replying() {
    let Harness {
        broker,
        requests,
        replies,
    } = harness().await;
    broker.publish_to_queue_with("calculator", "[1, 1]", call("add", None));
    let mut server = server(requests);

    let stats = server.consume(1).await.unwrap();

    assert_eq!(server.delegate().calls, vec![Some("add".to_owned())]);
    assert_eq!(stats.acknowledged, 1);
    assert!(replies.get().await.unwrap().is_none());
}

#[tokio::test]
async fn version_mismatch_is_an_invalid_request() {
    let Harness {
        broker,
        requests,
        replies,
    } = harness().await;
    let attributes = call("add", Some("call-2")).with_header("jsonrpc", "1.0");
    broker.publish_to_queue_with("calculator", "[1]", attributes);
    let mut server = server(requests);

    server.consume(1).await.unwrap();

    let reply = next_reply(&replies).await;
    assert_eq!(body(&reply)["error"]["code"], json!(-32600));
    assert_eq!(reply.correlation_id(), Some("call-2"));
    assert!(server.delegate().calls.is_empty());
}

#[tokio::test]
async fn wrong_content_type_is_an_invalid_request() {
    let Harness {
        broker,
        requests,
        replies,
    } = harness().await;
    let attributes = call("add", Some("call-3")).with_content_type("text/plain");
    broker.publish_to_queue_with("calculator", "[1]", attributes);
    let mut server = server(requests);

    server.consume(1).await.unwrap();

    assert_eq!(body(&next_reply(&replies).await)["error"]["code"], json!(-32600));
}

#[tokio::test]
async fn unparsable_body_is_a_parse_error() {
    let Harness {
        broker,
        requests,
        replies,
    } = harness().await;
    broker.publish_to_queue_with("calculator", "[1, 2", call("add", Some("call-4")));
    let mut server = server(requests);

    server.consume(1).await.unwrap();

    let reply = next_reply(&replies).await;
    assert_eq!(
        body(&reply),
        json!({"error": {"code": -32700, "message": "Parse error"}, "data": null})
    );
    assert_eq!(reply.correlation_id(), Some("call-4"));
}

#[tokio::test]
async fn delegate_failure_is_an_internal_error_with_the_correlation_id() {
    let Harness {
        broker,
        requests,
        replies,
    } = harness().await;
    broker.publish_to_queue_with("calculator", "{}", call("crash", Some("call-5")));
    let mut server = server(requests);

    let stats = server.consume(1).await.unwrap();

    let reply = next_reply(&replies).await;
    assert_eq!(body(&reply)["error"]["code"], json!(-32603));
    assert_eq!(reply.correlation_id(), Some("call-5"));
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(stats.requeued, 0);
}

#[tokio::test]
async fn delegate_rpc_errors_keep_their_code() {
    let Harness {
        broker,
        requests,
        replies,
    } = harness().await;
    broker.publish_to_queue_with("calculator", "{}", call("divide", Some("call-6")));
    broker.publish_to_queue_with("calculator", r#"{"a": 1}"#, call("add", Some("call-7")));
    let mut server = server(requests);

    server.consume(2).await.unwrap();

    let unknown = Response::from_json(next_reply(&replies).await.body(), None).unwrap();
    assert_eq!(unknown.error().map(RpcError::code), Some(RpcError::METHOD_NOT_FOUND));
    let bad_params = Response::from_json(next_reply(&replies).await.body(), None).unwrap();
    assert_eq!(bad_params.error().map(RpcError::code), Some(RpcError::INVALID_PARAMS));
}

#[tokio::test]
async fn delegate_response_is_stamped_with_the_request_id() {
    let Harness {
        broker,
        requests,
        replies,
    } = harness().await;
    broker.publish_to_queue_with("calculator", "null", call("status", Some("call-8")));
    let mut server = server(requests);

    server.consume(1).await.unwrap();

    let reply = next_reply(&replies).await;
    assert_eq!(reply.correlation_id(), Some("call-8"));
    assert_eq!(body(&reply), json!({"result": {"healthy": true}}));
}

#[tokio::test]
async fn shutdown_control_message_stops_the_server_without_a_reply() {
    let Harness {
        broker,
        requests,
        replies,
    } = harness().await;
    broker.publish_to_queue_with(
        "calculator",
        "",
        MessageAttributes::default()
            .with_app_id("ackloop")
            .with_message_type("shutdown")
            .with_reply_to("client-replies"),
    );
    broker.publish_to_queue_with("calculator", "[1]", call("add", Some("late")));
    let mut server = server(requests);

    let stats = server.consume(0).await.unwrap();

    assert_eq!(stats.consumed, 1);
    assert!(server.delegate().calls.is_empty());
    assert!(replies.get().await.unwrap().is_none());
    assert_eq!(broker.ready_count("calculator"), 1);
}

#[tokio::test]
async fn delegate_panic_is_answered_with_internal_error() {
    let Harness {
        broker,
        requests,
        replies,
    } = harness().await;
    broker.publish_to_queue_with("calculator", "[]", call("explode", Some("call-9")));
    let mut server = server(requests);

    let stats = server.consume(1).await.unwrap();

    let reply = next_reply(&replies).await;
    assert_eq!(body(&reply)["error"]["code"], json!(-32603));
    assert_eq!(reply.correlation_id(), Some("call-9"));
    assert_eq!((stats.acknowledged, stats.requeued), (1, 0));
}

#[tokio::test]
async fn failed_reply_publish_requeues_the_request_without_acking_it() {
    let Harness {
        broker,
        requests,
        replies,
    } = harness().await;
    broker.publish_to_queue_with("calculator", "[1]", call("add", Some("call-10")));
    let channel = requests.channel().clone();

    // The reply exchange disappears while the request is being handled
    let admin = broker.clone();
    let delegate = delegate_fn(move |_request| {
        admin.delete_exchange("rpc.replies");
        async { Ok::<Reply, BoxError>(json!(1).into()) }
    });
    let mut config = RpcServerConfig {
        reply_exchange: "rpc.replies".to_owned(),
        ..Default::default()
    };
    config.consumer.handle_signals = false;
    config.consumer.idle_timeout = None;
    let mut server = RpcServer::new(requests, delegate, config);

    let stats = server.consume(1).await.unwrap();

    assert_eq!((stats.acknowledged, stats.requeued), (0, 1));
    let settlements = channel.settlements();
    assert_eq!(settlements.len(), 1);
    assert_eq!(settlements[0].action, SettlementAction::Reject);
    assert!(settlements[0].requeue);
    assert!(settlements.iter().all(|s| s.action != SettlementAction::Ack));
    assert_eq!(broker.ready_count("calculator"), 1);
    assert!(replies.get().await.unwrap().is_none());
}
