use serde_json::Value;

use super::{CONTENT_ENCODING, CONTENT_TYPE, JSONRPC_HEADER, JSONRPC_VERSION, RequestError};
use crate::Envelope;

/// A JSON-RPC call read from an inbound envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    exchange: String,
    method: Option<String>,
    params: Value,
    id: Option<String>,
    routing_key: String,
    expiration: Option<String>,
    timestamp: Option<u64>,
}

impl Request {
    /// Validate and decode `envelope`.
    ///
    /// Checks run in order: the `jsonrpc` header must carry the protocol version, the content
    /// must be `application/json` in `UTF-8`, and the body must be JSON.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, RequestError> {
        let version = envelope.header(JSONRPC_HEADER);
        if version.and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(RequestError::InvalidVersion {
                found: version.map(|value| match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                }),
            });
        }

        if envelope.content_type() != Some(CONTENT_TYPE)
            || envelope.content_encoding() != Some(CONTENT_ENCODING)
        {
            return Err(RequestError::InvalidRequest {
                content_type: envelope.content_type().map(str::to_owned),
                content_encoding: envelope.content_encoding().map(str::to_owned),
            });
        }

        let params = serde_json::from_slice(envelope.body())?;

        Ok(Self {
            exchange: envelope.exchange_name().to_owned(),
            method: envelope.message_type().map(str::to_owned),
            params,
            id: envelope.correlation_id().map(str::to_owned),
            routing_key: envelope.routing_key().to_owned(),
            expiration: envelope.expiration().map(str::to_owned),
            timestamp: envelope.timestamp(),
        })
    }

    /// Exchange the request was published to
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Method name, carried as the message type
    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Call id, carried as the correlation id
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn expiration(&self) -> Option<&str> {
        self.expiration.as_deref()
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    /// A request without an id expects no reply
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}
