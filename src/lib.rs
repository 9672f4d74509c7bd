//! rpcwire: JSON-RPC 2.0 framing and dispatch for language servers.
//!
//! - `wire` - Content-Length framing, transports and the stream driver
//! - `message` - message types and the classifier
//! - `registry` - method/command handlers and declared payload types
//! - `protocol` - the per-connection task: dispatch, execution, correlation
//! - `config` - per-connection settings
//! - `error` - JSON-RPC error codes and fatal connection errors
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rpcwire::{serve, Handler, HandlerRegistry, Protocol, ProtocolConfig};
//!
//! let mut registry = HandlerRegistry::new();
//! registry.feature("echo", Handler::sync(|_, params| Ok(params)))?;
//!
//! let protocol = Protocol::new(Arc::new(registry), ProtocolConfig::from_env()?);
//! let status = serve(protocol, tokio::io::stdin(), tokio::io::stdout()).await?;
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod protocol;
pub mod registry;
pub mod wire;

pub use config::{ConfigError, ProtocolConfig};
pub use error::{ErrorCategory, ErrorKind, ErrorReporter, LogReporter, ProtocolError, RpcError};
pub use message::{Message, MessageId};
pub use protocol::{ExitStatus, Protocol, ProtocolHandle, ResponseFuture, WorkerPool};
pub use registry::{Handler, HandlerRegistry, HandlerResult, PayloadSchema, RegistryError};
pub use wire::{serve, ChannelTransport, FramingMode, Transport};
