use serde_json::Value;
use thiserror::Error;

use super::JSONRPC_VERSION;

/// A coded JSON-RPC error carried by a [`Response`](super::Response).
///
/// The standard codes have constructors. Application errors use [`RpcError::new`] with a code
/// of their own; a delegate returning one gets it passed to the caller unchanged.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} ({code})")]
pub struct RpcError {
    code: i32,
    message: String,
    data: Option<Value>,
}

impl RpcError {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data, serialized next to the error in the reply
    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn parse_error() -> Self {
        Self::new(Self::PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request() -> Self {
        Self::new(Self::INVALID_REQUEST, "Invalid Request")
    }

    pub fn method_not_found() -> Self {
        Self::new(Self::METHOD_NOT_FOUND, "Method not found")
    }

    pub fn invalid_params() -> Self {
        Self::new(Self::INVALID_PARAMS, "Invalid params")
    }

    pub fn internal_error() -> Self {
        Self::new(Self::INTERNAL_ERROR, "Internal error")
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }
}

/// Why an envelope could not be read as a request
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("jsonrpc header is {found:?}, expected {expected:?}", expected = JSONRPC_VERSION)]
    InvalidVersion { found: Option<String> },

    #[error(
        "request must be application/json in UTF-8, got content type {content_type:?} and encoding {content_encoding:?}"
    )]
    InvalidRequest {
        content_type: Option<String>,
        content_encoding: Option<String>,
    },

    #[error("request body is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

impl RequestError {
    /// The coded error replied to the caller
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            RequestError::InvalidVersion { .. } | RequestError::InvalidRequest { .. } => {
                RpcError::invalid_request()
            }
            RequestError::Parse(_) => RpcError::parse_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_errors_map_to_fixed_codes() {
        let version = RequestError::InvalidVersion {
            found: Some("1.0".to_owned()),
        };
        assert_eq!(version.to_rpc_error().code(), -32600);

        let request = RequestError::InvalidRequest {
            content_type: Some("text/plain".to_owned()),
            content_encoding: None,
        };
        assert_eq!(request.to_rpc_error().code(), -32600);

        let parse = RequestError::from(serde_json::from_str::<Value>("{").unwrap_err());
        assert_eq!(parse.to_rpc_error().code(), -32700);
    }

    #[test]
    fn application_errors_keep_code_message_and_data() {
        let error = RpcError::new(42, "out of stock").with_data(serde_json::json!({"sku": "A1"}));
        assert_eq!(error.code(), 42);
        assert_eq!(error.message(), "out of stock");
        assert_eq!(error.data(), Some(&serde_json::json!({"sku": "A1"})));
        assert_eq!(error.to_string(), "out of stock (42)");
    }
}
