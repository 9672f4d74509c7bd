//! Handler execution strategies and the completion path back to the protocol task.
//!
//! | strategy   | runs on                   | cancellable |
//! |------------|---------------------------|-------------|
//! | `Sync`     | the protocol task, inline | no          |
//! | `Blocking` | [`WorkerPool`]            | no          |
//! | `Async`    | its own tokio task        | yes         |
//!
//! Blocking and async handlers report back with a [`Completion`] sent through
//! the protocol's command channel, so results are always encoded on the
//! protocol task.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{debug, error};

use super::{Protocol, ProtocolHandle};
use crate::config::DEFAULT_MAX_WORKERS;
use crate::error::RpcError;
use crate::message::MessageId;
use crate::registry::{Handler, HandlerResult, SyncHandlerFn};

/// How a handler run ended.
#[derive(Debug)]
pub(super) enum Outcome {
    Finished(Value),
    Failed(RpcError),
    Cancelled,
}

impl From<Result<Value, RpcError>> for Outcome {
    fn from(result: Result<Value, RpcError>) -> Self {
        match result {
            Ok(value) => Outcome::Finished(value),
            Err(error) => Outcome::Failed(error),
        }
    }
}

impl From<Result<HandlerResult, JoinError>> for Outcome {
    fn from(joined: Result<HandlerResult, JoinError>) -> Self {
        match joined {
            Ok(Ok(value)) => Outcome::Finished(value),
            Ok(Err(err)) => Outcome::Failed(RpcError::from_handler_error(&err)),
            Err(err) if err.is_cancelled() => Outcome::Cancelled,
            Err(err) => Outcome::Failed(RpcError::from_panic(err.into_panic())),
        }
    }
}

/// Result of a blocking or async handler, delivered to the protocol task.
#[derive(Debug)]
pub(super) struct Completion {
    /// `None` for notifications
    pub(super) id: Option<MessageId>,
    pub(super) method: String,
    /// Inbound table token for cancellable requests
    pub(super) token: Option<u64>,
    pub(super) outcome: Outcome,
}

/// Run a synchronous handler, turning errors and panics into [`RpcError`]s.
fn run_inline(
    f: &SyncHandlerFn,
    handle: ProtocolHandle,
    params: Value,
) -> Result<Value, RpcError> {
    match catch_unwind(AssertUnwindSafe(|| f(handle, params))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(RpcError::from_handler_error(&err)),
        Err(panic) => Err(RpcError::from_panic(panic)),
    }
}

impl Protocol {
    pub(super) fn execute_request(
        &mut self,
        id: MessageId,
        method: String,
        handler: Handler,
        params: Value,
    ) {
        let handle = self.handle();

        match handler {
            Handler::Sync(f) => match run_inline(&f, handle, params) {
                Ok(result) => self.send_result(id, &method, result),
                Err(error) => self.fail_request(id, &method, error),
            },
            Handler::Blocking(f) => {
                let done = self.handle();
                self.workers.submit(
                    move || run_inline(&f, handle, params),
                    move |result| {
                        done.completed(Completion {
                            id: Some(id),
                            method,
                            token: None,
                            outcome: result.into(),
                        })
                    },
                );
            }
            Handler::Async(f) => {
                let task = tokio::spawn(f(handle, params));
                let token = self.inbound.register(id.clone(), task.abort_handle());
                let done = self.handle();
                tokio::spawn(async move {
                    let outcome = Outcome::from(task.await);
                    done.completed(Completion {
                        id: Some(id),
                        method,
                        token: Some(token),
                        outcome,
                    });
                });
            }
        }
    }

    pub(super) fn execute_notification(
        &mut self,
        method: String,
        handler: Handler,
        params: Value,
    ) {
        let handle = self.handle();

        match handler {
            Handler::Sync(f) => {
                if let Err(error) = run_inline(&f, handle, params) {
                    self.fail_notification(&method, error);
                }
            }
            Handler::Blocking(f) => {
                let done = self.handle();
                self.workers.submit(
                    move || run_inline(&f, handle, params),
                    move |result| {
                        if let Err(error) = result {
                            done.completed(Completion {
                                id: None,
                                method,
                                token: None,
                                outcome: Outcome::Failed(error),
                            });
                        }
                    },
                );
            }
            Handler::Async(f) => {
                let task = tokio::spawn(f(handle, params));
                let done = self.handle();
                tokio::spawn(async move {
                    let outcome = Outcome::from(task.await);
                    if !matches!(outcome, Outcome::Finished(_)) {
                        done.completed(Completion {
                            id: None,
                            method,
                            token: None,
                            outcome,
                        });
                    }
                });
            }
        }
    }

    pub(super) fn complete(&mut self, completion: Completion) {
        let Completion {
            id,
            method,
            token,
            outcome,
        } = completion;

        let Some(id) = id else {
            match outcome {
                Outcome::Failed(error) => self.fail_notification(&method, error),
                Outcome::Cancelled => debug!("Notification handler for {} was cancelled", method),
                Outcome::Finished(_) => {}
            }
            return;
        };

        if let Some(token) = token {
            self.inbound.finish(&id, token);
        }

        match outcome {
            Outcome::Finished(result) => self.send_result(id, &method, result),
            Outcome::Failed(error) => {
                error!("Exception occurred for message \"{}\": {}", id, error);
                self.send_error(Some(id), error);
            }
            Outcome::Cancelled => {
                let error = RpcError::request_cancelled(&id);
                self.send_error(Some(id), error);
            }
        }
    }
}

// =============================================================================
// Worker pool
// =============================================================================

/// Bounded pool for blocking handlers.
///
/// Jobs run on tokio's blocking threads; at most `max_workers` run at once and
/// the rest wait for a permit in submission order.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    max_workers: usize,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORKERS)
    }
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run `job` on a worker and pass its result to `on_done`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<T, J, D>(&self, job: J, on_done: D)
    where
        T: Send + 'static,
        J: FnOnce() -> T + Send + 'static,
        D: FnOnce(T) + Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            match tokio::task::spawn_blocking(job).await {
                Ok(result) => on_done(result),
                Err(err) => error!("Worker job failed: {}", err),
            }
        });
    }
}
