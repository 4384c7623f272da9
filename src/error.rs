//! Error types shared by the consumer loop and the broker adapters.

use thiserror::Error;

/// Error type returned by user supplied handlers and RPC delegates.
///
/// Any error implementing the standard `Error` trait converts into it with `?` or `.into()`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by a broker adapter.
///
/// These are the only failures allowed to escape [`Consumer::consume`](crate::Consumer::consume):
/// recovering from them (reconnect or abort) is left to the caller.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The channel was closed, by the broker or by the client
    #[error("channel is closed")]
    ChannelClosed,

    /// The underlying connection is gone
    #[error("connection is closed")]
    ConnectionClosed,

    /// An exchange or queue does not exist
    #[error("{kind} not found: {name}")]
    NotFound {
        /// `"exchange"` or `"queue"`
        kind: &'static str,
        /// Name that failed to resolve
        name: String,
    },

    /// Ack/reject referenced a tag the channel does not hold
    #[error("unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),

    /// The broker refused a declaration or operation
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Adapter specific failure
    #[error("broker backend error: {0}")]
    Backend(#[source] BoxError),
}

#[cfg(feature = "lapin")]
impl From<lapin::Error> for BrokerError {
    fn from(error: lapin::Error) -> Self {
        match error {
            lapin::Error::InvalidChannelState(_) => BrokerError::ChannelClosed,
            lapin::Error::InvalidConnectionState(_) => BrokerError::ConnectionClosed,
            other => BrokerError::Backend(Box::new(other)),
        }
    }
}

/// Crate level error.
#[derive(Debug, Error)]
pub enum Error {
    /// A broker operation failed underneath the consumer
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Registering the OS signal listeners failed
    #[error("unable to register signal handler: {0}")]
    Signal(#[source] std::io::Error),

    /// An environment variable held an unusable value
    #[error("invalid configuration for {key}: {reason}")]
    Config {
        /// Environment variable name
        key: &'static str,
        /// What was wrong with it
        reason: String,
    },
}

/// Crate level result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
