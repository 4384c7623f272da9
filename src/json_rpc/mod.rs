//! JSON-RPC over the queue.
//!
//! A request is a regular message carrying the `jsonrpc` header, the JSON params as body, the
//! method as message `type` and the call id as correlation id. Requests without a correlation
//! id are notifications: the delegate runs but nothing is sent back. Replies are published to
//! the caller's `reply_to` with the same correlation id.
//!
//! [`RpcServer`] runs a [`Consumer`](crate::Consumer) whose handler parses requests, calls an
//! [`RpcDelegate`] and publishes the reply before acknowledging the request.

mod error;
mod request;
mod response;
mod server;

pub use error::{RequestError, RpcError};
pub use request::Request;
pub use response::{Response, ResponseParseError};
pub use server::{FnDelegate, Reply, RpcDelegate, RpcHandler, RpcServer, RpcServerConfig, delegate_fn};

/// Protocol version carried in the `jsonrpc` header of requests and replies
pub const JSONRPC_VERSION: &str = "2.0";

/// Name of the header carrying the protocol version
pub const JSONRPC_HEADER: &str = "jsonrpc";

/// Content type of requests and replies
pub const CONTENT_TYPE: &str = "application/json";

/// Content encoding of requests and replies
pub const CONTENT_ENCODING: &str = "UTF-8";
