//! JSON-RPC 2.0 framing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version string carried in every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32_700;
/// The JSON is not a valid message.
pub const INVALID_REQUEST: i64 = -32_600;
/// The method does not exist.
pub const METHOD_NOT_FOUND: i64 = -32_601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32_602;
/// Handler failure.
pub const INTERNAL_ERROR: i64 = -32_603;
/// A method other than `initialize` arrived before the handshake.
pub const NOT_INITIALIZED: i64 = -32_002;

/// Error object of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i64,
    /// Short description.
    pub message: String,
    /// Optional payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Creates an error without data.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// `-32700`.
    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::new(PARSE_ERROR, format!("parse error: {detail}"))
    }

    /// `-32600`.
    pub fn invalid_request(detail: impl std::fmt::Display) -> Self {
        Self::new(INVALID_REQUEST, format!("invalid request: {detail}"))
    }

    /// `-32601`.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    /// `-32602`.
    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("invalid params: {detail}"))
    }

    /// `-32603` carrying the handler's message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    /// `-32002`.
    #[must_use]
    pub fn not_initialized() -> Self {
        Self::new(NOT_INITIALIZED, "not initialized")
    }
}

/// A call expecting a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Correlation id.
    pub id: Value,
    /// Method name.
    pub method: String,
    /// Parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Creates a request.
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A one-way message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Creates a notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params,
        }
    }
}

/// Reply to a request. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Id of the request answered; `null` when it could not be read.
    pub id: Value,
    /// Success payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Successful response.
    #[must_use]
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response.
    #[must_use]
    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Splits into the payload or the error.
    ///
    /// # Errors
    ///
    /// Returns the carried [`JsonRpcError`].
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Any inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    /// Has `method` and `id`.
    Request(JsonRpcRequest),
    /// Has `method` and no `id`.
    Notification(JsonRpcNotification),
    /// Has `result` or `error`.
    Response(JsonRpcResponse),
}

/// Why a frame could not be read.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameError {
    /// Not JSON at all.
    Parse(String),
    /// JSON, but not a JSON-RPC 2.0 message. Carries the id when one was
    /// readable.
    Invalid {
        /// Request id, or `null`.
        id: Value,
        /// What was wrong.
        reason: String,
    },
}

impl FrameError {
    /// Error object a server answers with.
    #[must_use]
    pub fn to_error(&self) -> JsonRpcError {
        match self {
            Self::Parse(detail) => JsonRpcError::parse_error(detail),
            Self::Invalid { reason, .. } => JsonRpcError::invalid_request(reason),
        }
    }

    /// Id a server answers with.
    #[must_use]
    pub fn id(&self) -> Value {
        match self {
            Self::Parse(_) => Value::Null,
            Self::Invalid { id, .. } => id.clone(),
        }
    }
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(detail) => write!(f, "parse error: {detail}"),
            Self::Invalid { reason, .. } => write!(f, "invalid message: {reason}"),
        }
    }
}

impl JsonRpcMessage {
    /// Classifies one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Parse`] for invalid JSON and
    /// [`FrameError::Invalid`] for JSON that is not a 2.0 message.
    pub fn parse(frame: &str) -> Result<Self, FrameError> {
        let value: Value =
            serde_json::from_str(frame).map_err(|err| FrameError::Parse(err.to_string()))?;
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        let invalid = |reason: String| FrameError::Invalid {
            id: id.clone(),
            reason,
        };

        let Some(object) = value.as_object() else {
            return Err(invalid("expected an object".into()));
        };
        if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(invalid("jsonrpc must be \"2.0\"".into()));
        }

        let has_id = object.get("id").is_some_and(|id| !id.is_null());
        let message = if object.contains_key("method") {
            if has_id {
                serde_json::from_value(value.clone()).map(Self::Request)
            } else {
                serde_json::from_value(value.clone()).map(Self::Notification)
            }
        } else if object.contains_key("result") || object.contains_key("error") {
            serde_json::from_value(value.clone()).map(Self::Response)
        } else {
            return Err(invalid("neither a call nor a response".into()));
        };
        message.map_err(|err| invalid(err.to_string()))
    }

    /// Serialises the message to a text frame.
    ///
    /// # Errors
    ///
    /// Propagates encoding failures.
    pub fn to_frame(&self) -> serde_json::Result<String> {
        match self {
            Self::Request(request) => serde_json::to_string(request),
            Self::Notification(notification) => serde_json::to_string(notification),
            Self::Response(response) => serde_json::to_string(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_frames() {
        let request = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        assert!(matches!(request, JsonRpcMessage::Request(ref r) if r.id == json!(1)));

        let notification =
            JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .unwrap();
        assert!(matches!(notification, JsonRpcMessage::Notification(_)));

        let response =
            JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","id":7,"error":{"code":-32601,"message":"x"}}"#)
                .unwrap();
        let JsonRpcMessage::Response(response) = response else {
            panic!("expected response");
        };
        assert_eq!(response.into_result().unwrap_err().code, METHOD_NOT_FOUND);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            JsonRpcMessage::parse("{not json"),
            Err(FrameError::Parse(_))
        ));
        let err = JsonRpcMessage::parse(r#"{"jsonrpc":"1.0","id":3,"method":"ping"}"#).unwrap_err();
        assert_eq!(err.id(), json!(3));
        assert_eq!(err.to_error().code, INVALID_REQUEST);
    }

    #[test]
    fn response_omits_absent_fields() {
        let frame = serde_json::to_value(JsonRpcResponse::success(json!(1), json!({}))).unwrap();
        assert!(frame.get("error").is_none());
        let frame = serde_json::to_value(JsonRpcResponse::failure(
            Value::Null,
            JsonRpcError::parse_error("eof"),
        ))
        .unwrap();
        assert_eq!(frame["id"], Value::Null);
        assert_eq!(frame["error"]["code"], json!(PARSE_ERROR));
    }
}
