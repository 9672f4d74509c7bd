//! Method and command handlers, and the payload types declared for them.
//!
//! A [`HandlerRegistry`] is built before the connection starts and then shared
//! read-only (`Arc<HandlerRegistry>`) with the protocol task.
//!
//! # Lookup order
//!
//! 1. Builtin handlers (registered by the embedding server itself)
//! 2. User features
//!
//! Commands invoked through `workspace/executeCommand` live in a separate table.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::error::RpcError;
use crate::protocol::ProtocolHandle;

/// What every handler returns. Wrap an [`RpcError`] to pick the error code.
pub type HandlerResult = anyhow::Result<Value>;

/// Boxed future returned by async handlers.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

pub type SyncHandlerFn = Arc<dyn Fn(ProtocolHandle, Value) -> HandlerResult + Send + Sync>;
pub type AsyncHandlerFn =
    Arc<dyn Fn(ProtocolHandle, Value) -> BoxFuture<HandlerResult> + Send + Sync>;

/// A handler together with its execution strategy.
#[derive(Clone)]
pub enum Handler {
    /// Runs inline on the protocol task. Must not block.
    Sync(SyncHandlerFn),
    /// Runs on the blocking worker pool. Not cancellable.
    Blocking(SyncHandlerFn),
    /// Spawned as a tokio task. Requests can be cancelled by the peer.
    Async(AsyncHandlerFn),
}

impl Handler {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(ProtocolHandle, Value) -> HandlerResult + Send + Sync + 'static,
    {
        Handler::Sync(Arc::new(f))
    }

    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(ProtocolHandle, Value) -> HandlerResult + Send + Sync + 'static,
    {
        Handler::Blocking(Arc::new(f))
    }

    /// Wrap an async function.
    ///
    /// # Example
    ///
    /// ```ignore
    /// registry.feature("sleep", Handler::from_async(|_, params| async move {
    ///     tokio::time::sleep(Duration::from_millis(100)).await;
    ///     Ok(params)
    /// }))?;
    /// ```
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(ProtocolHandle, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Handler::Async(Arc::new(move |handle, params| Box::pin(f(handle, params))))
    }

    pub fn strategy(&self) -> &'static str {
        match self {
            Handler::Sync(_) => "sync",
            Handler::Blocking(_) => "blocking",
            Handler::Async(_) => "async",
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler::{}", self.strategy())
    }
}

// =============================================================================
// Payload schemas
// =============================================================================

type NormalizeFn = Arc<dyn Fn(Value) -> serde_json::Result<Value> + Send + Sync>;

/// A declared payload type, used to validate and normalize raw JSON.
///
/// Normalizing deserializes into the Rust type and serializes back, so unknown
/// fields are dropped and defaults filled in.
#[derive(Clone)]
pub struct PayloadSchema {
    name: &'static str,
    normalize: NormalizeFn,
}

impl PayloadSchema {
    pub fn of<T>() -> Self
    where
        T: DeserializeOwned + Serialize + 'static,
    {
        Self {
            name: std::any::type_name::<T>(),
            normalize: Arc::new(|value| serde_json::to_value(serde_json::from_value::<T>(value)?)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn normalize(&self, value: Value) -> serde_json::Result<Value> {
        (self.normalize)(value)
    }
}

impl fmt::Debug for PayloadSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PayloadSchema").field(&self.name).finish()
    }
}

/// Declared params and result types of one method.
#[derive(Debug, Clone, Default)]
pub struct MethodTypes {
    pub params: Option<PayloadSchema>,
    pub result: Option<PayloadSchema>,
}

// =============================================================================
// Registry
// =============================================================================

/// Registration failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// An empty method or command name.
    #[error("{kind} name must not be empty")]
    MissingName {
        /// "Feature", "Builtin" or "Command"
        kind: &'static str,
    },

    #[error("Feature \"{0}\" is already registered")]
    FeatureAlreadyRegistered(String),

    #[error("Command \"{0}\" is already registered")]
    CommandAlreadyRegistered(String),
}

#[derive(Debug, Default)]
pub struct HandlerRegistry {
    builtin: HashMap<String, Handler>,
    features: HashMap<String, Handler>,
    commands: HashMap<String, Handler>,
    types: HashMap<String, MethodTypes>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a builtin handler. Builtins take priority over user features.
    ///
    /// # Errors
    ///
    /// Fails on an empty name or a name already used by another builtin.
    pub fn add_builtin(
        &mut self,
        method: impl Into<String>,
        handler: Handler,
    ) -> Result<(), RegistryError> {
        let method = method.into();
        if method.is_empty() {
            return Err(RegistryError::MissingName { kind: "Builtin" });
        }
        if self.builtin.contains_key(&method) {
            return Err(RegistryError::FeatureAlreadyRegistered(method));
        }
        self.builtin.insert(method, handler);
        Ok(())
    }

    /// Register a user feature.
    ///
    /// # Errors
    ///
    /// Fails on an empty name or a name already used by a builtin or feature.
    pub fn feature(
        &mut self,
        method: impl Into<String>,
        handler: Handler,
    ) -> Result<(), RegistryError> {
        let method = method.into();
        if method.is_empty() {
            return Err(RegistryError::MissingName { kind: "Feature" });
        }
        if self.builtin.contains_key(&method) || self.features.contains_key(&method) {
            return Err(RegistryError::FeatureAlreadyRegistered(method));
        }
        self.features.insert(method, handler);
        Ok(())
    }

    /// Register a command for `workspace/executeCommand`.
    ///
    /// The handler receives the request's `arguments` value as its params.
    ///
    /// # Errors
    ///
    /// Fails on an empty name or a duplicate command.
    pub fn command(
        &mut self,
        name: impl Into<String>,
        handler: Handler,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::MissingName { kind: "Command" });
        }
        if self.commands.contains_key(&name) {
            return Err(RegistryError::CommandAlreadyRegistered(name));
        }
        self.commands.insert(name, handler);
        Ok(())
    }

    /// Declare both payload types of a method at once.
    pub fn declare_types(&mut self, method: impl Into<String>, types: MethodTypes) {
        self.types.insert(method.into(), types);
    }

    pub fn declare_params<T>(&mut self, method: impl Into<String>)
    where
        T: DeserializeOwned + Serialize + 'static,
    {
        self.types.entry(method.into()).or_default().params = Some(PayloadSchema::of::<T>());
    }

    /// Declare the result type of a method, used for inbound results we send
    /// and for responses to requests we send with that method.
    pub fn declare_result<T>(&mut self, method: impl Into<String>)
    where
        T: DeserializeOwned + Serialize + 'static,
    {
        self.types.entry(method.into()).or_default().result = Some(PayloadSchema::of::<T>());
    }

    /// Find the handler for a method, builtins first.
    ///
    /// # Errors
    ///
    /// Returns a `MethodNotFound` error when nothing is registered.
    pub fn lookup(&self, method: &str) -> Result<&Handler, RpcError> {
        self.builtin
            .get(method)
            .or_else(|| self.features.get(method))
            .ok_or_else(|| RpcError::method_not_found(method))
    }

    pub fn lookup_command(&self, name: &str) -> Option<&Handler> {
        self.commands.get(name)
    }

    pub fn params_schema(&self, method: &str) -> Option<&PayloadSchema> {
        self.types.get(method).and_then(|types| types.params.as_ref())
    }

    pub fn result_schema(&self, method: &str) -> Option<&PayloadSchema> {
        self.types.get(method).and_then(|types| types.result.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Range {
        start: u32,
        #[serde(default)]
        end: u32,
    }

    fn noop() -> Handler {
        Handler::sync(|_, _| Ok(Value::Null))
    }

    #[test]
    fn test_builtin_takes_priority() {
        let mut registry = HandlerRegistry::new();
        registry.add_builtin("initialize", Handler::blocking(|_, _| Ok(json!(1)))).unwrap();
        assert_eq!(
            registry.feature("initialize", noop()),
            Err(RegistryError::FeatureAlreadyRegistered("initialize".into()))
        );
        assert_eq!(registry.lookup("initialize").unwrap().strategy(), "blocking");
    }

    #[test]
    fn test_lookup_unknown_method() {
        let registry = HandlerRegistry::new();
        let err = registry.lookup("doesNotExist").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MethodNotFound);
        assert_eq!(err.message, "Method Not Found: doesNotExist");
    }

    #[test]
    fn test_duplicate_registrations() {
        let mut registry = HandlerRegistry::new();
        registry.feature("a", noop()).unwrap();
        assert_eq!(
            registry.feature("a", noop()),
            Err(RegistryError::FeatureAlreadyRegistered("a".into()))
        );
        registry.add_builtin("b", noop()).unwrap();
        assert!(registry.add_builtin("b", noop()).is_err());

        registry.command("run", noop()).unwrap();
        assert_eq!(
            registry.command("run", noop()),
            Err(RegistryError::CommandAlreadyRegistered("run".into()))
        );
        assert!(registry.lookup_command("run").is_some());
        assert!(registry.lookup_command("walk").is_none());
    }

    #[test]
    fn test_empty_names_rejected() {
        let mut registry = HandlerRegistry::new();
        assert_eq!(
            registry.feature("", noop()),
            Err(RegistryError::MissingName { kind: "Feature" })
        );
        assert_eq!(
            registry.command("", noop()),
            Err(RegistryError::MissingName { kind: "Command" })
        );
        assert_eq!(
            registry.add_builtin("", noop()),
            Err(RegistryError::MissingName { kind: "Builtin" })
        );
    }

    #[test]
    fn test_payload_schema_normalizes() {
        let schema = PayloadSchema::of::<Range>();
        assert_eq!(
            schema.normalize(json!({"start": 3, "ignored": true})).unwrap(),
            json!({"start": 3, "end": 0})
        );
        assert!(schema.normalize(json!({"start": "x"})).is_err());
        assert!(schema.name().ends_with("Range"));
    }

    #[test]
    fn test_declared_types() {
        let mut registry = HandlerRegistry::new();
        registry.declare_params::<Range>("m");
        assert!(registry.params_schema("m").is_some());
        assert!(registry.result_schema("m").is_none());

        registry.declare_result::<Range>("m");
        assert!(registry.params_schema("m").is_some());
        assert!(registry.result_schema("m").is_some());

        registry.declare_types("n", MethodTypes::default());
        assert!(registry.params_schema("n").is_none());
        assert!(registry.params_schema("unknown").is_none());
    }
}
