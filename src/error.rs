//! JSON-RPC error taxonomy and fatal connection errors.
//!
//! [`RpcError`] doubles as the wire representation of an error object
//! (`{"code", "message", "data"?}`) and as the error type handed to callers
//! awaiting an outbound request.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;

use crate::message::MessageId;
use crate::wire::FrameError;

// =============================================================================
// Error Codes
// =============================================================================

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const SERVER_NOT_INITIALIZED: i64 = -32002;
pub const UNKNOWN_ERROR_CODE: i64 = -32001;
pub const SERVER_ERROR_START: i64 = -32099;
pub const SERVER_ERROR_END: i64 = -32000;
pub const REQUEST_CANCELLED: i64 = -32800;
pub const CONTENT_MODIFIED: i64 = -32801;

/// Classification of an [`RpcError`] derived from its code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ServerNotInitialized,
    UnknownErrorCode,
    /// Implementation-defined server error in `-32099..=-32000`.
    ServerError,
    RequestCancelled,
    ContentModified,
    /// A code outside every reserved range.
    Other,
}

impl ErrorKind {
    pub fn from_code(code: i64) -> Self {
        match code {
            PARSE_ERROR => ErrorKind::ParseError,
            INVALID_REQUEST => ErrorKind::InvalidRequest,
            METHOD_NOT_FOUND => ErrorKind::MethodNotFound,
            INVALID_PARAMS => ErrorKind::InvalidParams,
            INTERNAL_ERROR => ErrorKind::InternalError,
            SERVER_NOT_INITIALIZED => ErrorKind::ServerNotInitialized,
            UNKNOWN_ERROR_CODE => ErrorKind::UnknownErrorCode,
            REQUEST_CANCELLED => ErrorKind::RequestCancelled,
            CONTENT_MODIFIED => ErrorKind::ContentModified,
            SERVER_ERROR_START..=SERVER_ERROR_END => ErrorKind::ServerError,
            _ => ErrorKind::Other,
        }
    }
}

// =============================================================================
// RpcError
// =============================================================================

/// A JSON-RPC error object.
///
/// # Example
///
/// ```ignore
/// // Inside a handler: keep the code on the wire
/// return Err(RpcError::invalid_params("uri is required").into());
/// ```
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message} (code {code})")]
pub struct RpcError {
    /// JSON-RPC error code
    pub code: i64,
    /// Human-readable message
    pub message: String,
    /// Optional additional data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method Not Found: {}", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    pub fn request_cancelled(id: &MessageId) -> Self {
        Self::new(
            REQUEST_CANCELLED,
            format!("Request with id \"{}\" is canceled", id),
        )
    }

    /// Kind derived from the code.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_code(self.code)
    }

    /// Rebuild an error from a peer's error object.
    ///
    /// Objects lacking an integer `code` or a string `message` are reported as
    /// [`ErrorKind::InternalError`] carrying the raw object as `data`.
    pub fn from_response_error(error: &Value) -> Self {
        serde_json::from_value::<RpcError>(error.clone()).unwrap_or_else(|err| {
            RpcError::internal(format!("Malformed error object: {}", err))
                .with_data(error.clone())
        })
    }

    /// Convert a handler failure into the error sent to the peer.
    ///
    /// An `anyhow::Error` wrapping an [`RpcError`] keeps its code; anything else
    /// becomes an internal error with the error chain under `data.traceback`.
    pub fn from_handler_error(err: &anyhow::Error) -> Self {
        if let Some(rpc) = err.downcast_ref::<RpcError>() {
            return rpc.clone();
        }

        let traceback: Vec<String> = err.chain().map(|cause| cause.to_string()).collect();
        RpcError::internal(err.to_string()).with_data(json!({ "traceback": traceback }))
    }

    /// Convert a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        };
        RpcError::internal(format!("Handler panicked: {}", message))
    }
}

// =============================================================================
// Reporting
// =============================================================================

/// Where an error surfaced, for [`ErrorReporter`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Handling an inbound request failed; the peer got an error response.
    Request,
    /// Handling an inbound notification failed; nothing was sent.
    Notification,
    /// Protocol machinery failed (bad JSON, write failures).
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Request => "request",
            ErrorCategory::Notification => "notification",
            ErrorCategory::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Observability hook for protocol errors. Reporting never changes protocol behaviour.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &RpcError, category: ErrorCategory);
}

/// Default reporter: one `tracing` error event per report.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, err: &RpcError, category: ErrorCategory) {
        error!(%category, code = err.code, "{}", err.message);
    }
}

// =============================================================================
// Fatal errors
// =============================================================================

/// Failures that end a connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The incoming byte stream cannot be framed.
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    /// The transport reported an error.
    #[error("Connection lost: {0}")]
    ConnectionLost(#[source] std::io::Error),

    /// The peer closed the stream without sending `exit`.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Every handle was dropped before the connection finished.
    #[error("Protocol stopped: no handles left")]
    Stopped,

    /// I/O error outside the transport (e.g. joining the reader task).
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}
