//! rpcwire - a JSON-RPC 2.0 server over stdio.
//!
//! Reads framed messages from stdin and writes responses to stdout. Logs go
//! to stderr so they never corrupt the protocol stream.
//!
//! Registered methods:
//!
//! - `echo` (inline) - returns its params
//! - `sleep` (task, cancellable) - waits `{"ms": n}` milliseconds
//! - `sum` (worker) - adds an array of integers
//! - command `echo` via `workspace/executeCommand` - returns its arguments

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rpcwire::{
    serve, Handler, HandlerRegistry, HandlerResult, Protocol, ProtocolConfig, ProtocolHandle,
    RpcError,
};

#[derive(Debug, Deserialize)]
struct SleepParams {
    ms: u64,
}

async fn sleep(_: ProtocolHandle, params: Value) -> HandlerResult {
    let params: SleepParams =
        serde_json::from_value(params).map_err(|err| RpcError::invalid_params(err.to_string()))?;
    tokio::time::sleep(Duration::from_millis(params.ms)).await;
    Ok(json!({ "slept": params.ms }))
}

fn build_registry() -> Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();

    registry.feature("echo", Handler::sync(|_, params| Ok(params)))?;

    registry.feature("sleep", Handler::from_async(sleep))?;

    registry.feature(
        "sum",
        Handler::blocking(|_, params| {
            let numbers: Vec<i64> = serde_json::from_value(params)
                .map_err(|err| RpcError::invalid_params(err.to_string()))?;
            Ok(Value::from(numbers.iter().sum::<i64>()))
        }),
    )?;

    registry.command("echo", Handler::sync(|_, arguments| Ok(arguments)))?;

    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol; logs must go to stderr
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "rpcwire=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    info!("Starting rpcwire v{}", env!("CARGO_PKG_VERSION"));

    let config = ProtocolConfig::from_env().context("Invalid rpcwire configuration")?;
    let registry = build_registry().context("Failed to register handlers")?;
    let protocol = Protocol::new(Arc::new(registry), config);

    match serve(protocol, tokio::io::stdin(), tokio::io::stdout()).await {
        Ok(status) => {
            info!("Exiting with code {}", status.code);
            std::process::exit(status.code);
        }
        Err(err) => {
            tracing::error!("{}", err);
            std::process::exit(1);
        }
    }
}
