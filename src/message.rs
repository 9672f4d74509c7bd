//! JSON-RPC 2.0 message types and the classifier that produces them.
//!
//! # Protocol
//!
//! | shape                          | variant                      |
//! |--------------------------------|------------------------------|
//! | `id` + `error`                 | [`Message::ErrorResponse`]   |
//! | `id` + `method`                | [`Message::Request`]         |
//! | `id` only                      | [`Message::Response`]        |
//! | `method`, no `id`              | [`Message::Notification`]    |
//! | no `jsonrpc` key               | [`Incoming::Passthrough`]    |
//! | `jsonrpc` other than `"2.0"`   | [`Incoming::Unsupported`]    |

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::RpcError;
use crate::registry::{HandlerRegistry, PayloadSchema};

/// The only protocol version this crate speaks.
pub const JSONRPC_VERSION: &str = "2.0";

/// Notification asking the receiver to abandon an in-flight request.
pub const CANCEL_REQUEST: &str = "$/cancelRequest";
/// Request that puts the receiver into shutdown mode.
pub const SHUTDOWN: &str = "shutdown";
/// Notification that closes the connection.
pub const EXIT: &str = "exit";
/// Request routed through the registry's command table.
pub const EXECUTE_COMMAND: &str = "workspace/executeCommand";

// =============================================================================
// Message Id
// =============================================================================

/// A request id: integer or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    /// Integer id, as most clients send
    Number(i64),
    /// String id; our own requests use UUIDs
    String(String),
}

impl MessageId {
    /// Random UUID v4 id, used when the caller does not pick one.
    pub fn random() -> Self {
        MessageId::String(uuid::Uuid::new_v4().to_string())
    }

    /// Read an id from JSON; `None` for null, floats, and any other type.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(MessageId::Number),
            Value::String(s) => Some(MessageId::String(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Number(n) => write!(f, "{}", n),
            MessageId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for MessageId {
    fn from(id: i64) -> Self {
        MessageId::Number(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        MessageId::String(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        MessageId::String(id)
    }
}

// =============================================================================
// Envelopes
// =============================================================================

/// A call that expects exactly one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Always `"2.0"`
    pub jsonrpc: String,
    /// Correlates the response
    pub id: MessageId,
    /// Method name
    pub method: String,
    /// Parameters, `null` when absent
    #[serde(default)]
    pub params: Value,
}

impl RequestMessage {
    pub fn new(id: MessageId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A one-way message; never answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    /// Always `"2.0"`
    pub jsonrpc: String,
    /// Method name
    pub method: String,
    /// Parameters, `null` when absent
    #[serde(default)]
    pub params: Value,
}

impl NotificationMessage {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Successful answer to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// Always `"2.0"`
    pub jsonrpc: String,
    /// Id of the request being answered
    pub id: MessageId,
    /// Handler result; `null` is a valid result
    #[serde(default)]
    pub result: Value,
}

impl ResponseMessage {
    pub fn new(id: MessageId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        }
    }
}

/// Error response. A `None` id goes out as `"id": null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponseMessage {
    /// Always `"2.0"`
    pub jsonrpc: String,
    /// Id of the failed request, if it could be read
    pub id: Option<MessageId>,
    /// Error object
    pub error: RpcError,
}

impl ErrorResponseMessage {
    pub fn new(id: Option<MessageId>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error,
        }
    }
}

/// Any JSON-RPC message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(RequestMessage),
    Notification(NotificationMessage),
    Response(ResponseMessage),
    ErrorResponse(ErrorResponseMessage),
}

impl Message {
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(m) => Some(&m.method),
            Message::Notification(m) => Some(&m.method),
            Message::Response(_) | Message::ErrorResponse(_) => None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request(_) => MessageKind::Request,
            Message::Notification(_) => MessageKind::Notification,
            Message::Response(_) => MessageKind::Response,
            Message::ErrorResponse(_) => MessageKind::ErrorResponse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
    ErrorResponse,
}

/// Result of classifying a decoded JSON value.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Message(Message),
    /// Not a JSON-RPC object; handed back untouched.
    Passthrough(Value),
    /// A JSON-RPC object for another protocol version. Never validated.
    Unsupported(Value),
}

// =============================================================================
// Classifier
// =============================================================================

/// Source of the result schema expected for an outbound request.
///
/// Each schema is handed out at most once.
pub trait ResultSchemas {
    fn take_result_schema(&mut self, id: &MessageId) -> Option<PayloadSchema>;
}

/// Nothing is pending; every result stays raw JSON.
impl ResultSchemas for () {
    fn take_result_schema(&mut self, _id: &MessageId) -> Option<PayloadSchema> {
        None
    }
}

/// A value that looked like JSON-RPC but could not be turned into a [`Message`].
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Failed to classify {kind:?} (id: {id:?}, method: {method:?}): {error}")]
pub struct ClassifyError {
    /// Id, when one could be read
    pub id: Option<MessageId>,
    /// Method, when one could be read
    pub method: Option<String>,
    /// What the value was being classified as
    pub kind: MessageKind,
    /// Error to report or send back
    pub error: RpcError,
}

/// Classify a decoded JSON value.
///
/// Request and notification params are normalized through the method's
/// declared params schema, response results through the schema recorded for
/// that id when the request was sent.
///
/// # Errors
///
/// Returns a [`ClassifyError`] when the value carries a `jsonrpc` key but is not
/// a well-formed message, or when a payload does not match its schema.
pub fn classify(
    value: Value,
    registry: &HandlerRegistry,
    schemas: &mut impl ResultSchemas,
) -> Result<Incoming, ClassifyError> {
    let mut obj = match value {
        Value::Object(obj) if obj.contains_key("jsonrpc") => obj,
        other => return Ok(Incoming::Passthrough(other)),
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Ok(Incoming::Unsupported(Value::Object(obj)));
    }
    obj.remove("jsonrpc");
    let jsonrpc = JSONRPC_VERSION.to_string();

    let has_id = obj.contains_key("id");
    let id = obj.get("id").and_then(MessageId::from_value);
    let method = obj.get("method").and_then(Value::as_str).map(str::to_string);

    let kind = if has_id {
        if obj.contains_key("error") {
            MessageKind::ErrorResponse
        } else if obj.contains_key("method") {
            MessageKind::Request
        } else {
            MessageKind::Response
        }
    } else {
        MessageKind::Notification
    };

    let fail = |error: RpcError| ClassifyError {
        id: id.clone(),
        method: method.clone(),
        kind,
        error,
    };

    match kind {
        MessageKind::ErrorResponse => {
            let error = RpcError::from_response_error(&take_payload(&mut obj, "error"));
            Ok(Incoming::Message(Message::ErrorResponse(
                ErrorResponseMessage { jsonrpc, id, error },
            )))
        }
        MessageKind::Request => {
            let Some(request_id) = id.clone() else {
                return Err(fail(RpcError::invalid_request(
                    "Request id must be a number or a string",
                )));
            };
            let Some(method_name) = method.clone() else {
                return Err(fail(RpcError::invalid_request("\"method\" must be a string")));
            };
            let params = take_payload(&mut obj, "params");
            let params = normalize(registry.params_schema(&method_name), params).map_err(fail)?;
            Ok(Incoming::Message(Message::Request(RequestMessage {
                jsonrpc,
                id: request_id,
                method: method_name,
                params,
            })))
        }
        MessageKind::Response => {
            let Some(response_id) = id.clone() else {
                return Err(fail(RpcError::invalid_request(
                    "Response id must be a number or a string",
                )));
            };
            let result = take_payload(&mut obj, "result");
            let schema = schemas.take_result_schema(&response_id);
            let result = normalize(schema.as_ref(), result).map_err(fail)?;
            Ok(Incoming::Message(Message::Response(ResponseMessage {
                jsonrpc,
                id: response_id,
                result,
            })))
        }
        MessageKind::Notification => {
            let Some(method_name) = method.clone() else {
                return Err(fail(RpcError::invalid_request(
                    "Notification must carry a string \"method\"",
                )));
            };
            let params = take_payload(&mut obj, "params");
            let params = normalize(registry.params_schema(&method_name), params).map_err(fail)?;
            Ok(Incoming::Message(Message::Notification(
                NotificationMessage {
                    jsonrpc,
                    method: method_name,
                    params,
                },
            )))
        }
    }
}

fn take_payload(obj: &mut Map<String, Value>, key: &str) -> Value {
    obj.remove(key).unwrap_or(Value::Null)
}

fn normalize(schema: Option<&PayloadSchema>, payload: Value) -> Result<Value, RpcError> {
    let Some(schema) = schema else {
        return Ok(payload);
    };

    schema.normalize(payload).map_err(|err| match err.classify() {
        serde_json::error::Category::Data => RpcError::invalid_params(format!(
            "Invalid {}: {}",
            schema.name(),
            err
        )),
        _ => RpcError::internal(format!("Failed to convert {}: {}", schema.name(), err)),
    })
}
