use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::RpcError;

/// Reply to a [`Request`](super::Request): a result or an error, plus the call id.
///
/// On the wire a success is `{"result": ...}` and a failure is
/// `{"error": {"code": ..., "message": ...}, "data": ...}`. The id travels as the
/// correlation id of the reply, not in the body.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    outcome: Result<Value, RpcError>,
    id: Option<String>,
}

/// A reply body that is neither a result nor an error
#[derive(Debug, Error)]
#[error("invalid JSON-RPC response body: {0}")]
pub struct ResponseParseError(#[from] serde_json::Error);

#[derive(Serialize, Deserialize)]
struct WireError {
    code: i32,
    message: String,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Wire {
    Error {
        error: WireError,
        #[serde(default)]
        data: Option<Value>,
    },
    Result {
        result: Value,
    },
}

impl Response {
    pub fn with_result(result: impl Into<Value>, id: Option<String>) -> Self {
        Self {
            outcome: Ok(result.into()),
            id,
        }
    }

    pub fn with_error(error: RpcError, id: Option<String>) -> Self {
        Self {
            outcome: Err(error),
            id,
        }
    }

    /// Replace the id; the server stamps replies with the request's correlation id
    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    pub fn result(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&RpcError> {
        self.outcome.as_ref().err()
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Serialize the reply body
    pub fn to_json(&self) -> Value {
        let wire = match &self.outcome {
            Ok(result) => Wire::Result {
                result: result.clone(),
            },
            Err(error) => Wire::Error {
                error: WireError {
                    code: error.code(),
                    message: error.message().to_owned(),
                },
                data: error.data().cloned(),
            },
        };
        // Wire only holds JSON values and plain fields
        serde_json::to_value(wire).unwrap_or(Value::Null)
    }

    /// Serialize the reply body to bytes
    pub fn to_vec(&self) -> Vec<u8> {
        self.to_json().to_string().into_bytes()
    }

    /// Read a reply body, tagging it with the correlation id it arrived with
    pub fn from_json(body: &[u8], id: Option<String>) -> Result<Self, ResponseParseError> {
        let outcome = match serde_json::from_slice(body)? {
            Wire::Result { result } => Ok(result),
            Wire::Error { error, data } => {
                let mut rpc_error = RpcError::new(error.code, error.message);
                if let Some(data) = data {
                    rpc_error = rpc_error.with_data(data);
                }
                Err(rpc_error)
            }
        };
        Ok(Self { outcome, id })
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        self.outcome
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn success_serializes_as_result_only() {
        let response = Response::with_result(json!([1, 2]), Some("id-1".to_owned()));
        assert_eq!(response.to_json(), json!({"result": [1, 2]}));
        assert_eq!(response.id(), Some("id-1"));
    }

    #[test]
    fn error_serializes_code_message_and_data() {
        let response = Response::with_error(RpcError::internal_error(), None);
        assert_eq!(
            response.to_json(),
            json!({"error": {"code": -32603, "message": "Internal error"}, "data": null})
        );

        let with_data = Response::with_error(RpcError::new(7, "nope").with_data("why"), None);
        assert_eq!(
            with_data.to_json(),
            json!({"error": {"code": 7, "message": "nope"}, "data": "why"})
        );
    }

    #[test]
    fn serialized_replies_read_back_unchanged() {
        let results = [
            json!("text with \"quotes\" and unicode \u{e9}"),
            json!(42),
            json!(-3.5),
            json!(true),
            json!(null),
            json!([1, "two", [3.0, false]]),
            json!({"user": {"id": 7, "tags": ["a", "b"], "manager": null}}),
        ];
        for result in results {
            let response = Response::with_result(result, Some("rt".to_owned()));
            let parsed = Response::from_json(&response.to_vec(), Some("rt".to_owned())).unwrap();
            assert_eq!(parsed, response);
        }

        let errors = [
            RpcError::method_not_found(),
            RpcError::new(4001, "insufficient funds").with_data(json!({"balance": 12.5})),
            RpcError::invalid_params().with_data("expected an array"),
        ];
        for error in errors {
            let response = Response::with_error(error, None);
            let parsed = Response::from_json(&response.to_vec(), None).unwrap();
            assert_eq!(parsed, response);
        }
    }

    #[test]
    fn parses_reply_bodies() {
        let ok = Response::from_json(br#"{"result": {"sum": 3}}"#, Some("x".to_owned())).unwrap();
        assert_eq!(ok.result(), Some(&json!({"sum": 3})));
        assert_eq!(ok.id(), Some("x"));

        let null_result = Response::from_json(br#"{"result": null}"#, None).unwrap();
        assert_eq!(null_result.result(), Some(&Value::Null));

        let err = Response::from_json(
            br#"{"error": {"code": -32700, "message": "Parse error"}, "data": null}"#,
            None,
        )
        .unwrap();
        assert_eq!(err.error().map(RpcError::code), Some(-32700));
        assert_eq!(err.error().and_then(RpcError::data), None);

        assert!(Response::from_json(br#"{"something": "else"}"#, None).is_err());
    }
}
