//! The per-connection protocol task.
//!
//! A [`Protocol`] owns everything mutable about one connection: the frame
//! buffer, both pending-request tables, the transport and the shutdown flag.
//! It runs as a single tokio task consuming one command channel. Transport
//! events, outbound sends from [`ProtocolHandle`]s and handler completions all
//! arrive through that channel, so none of the state needs a lock.
//!
//! # Example
//!
//! ```ignore
//! let protocol = Protocol::new(Arc::new(registry), ProtocolConfig::from_env()?);
//! let handle = protocol.handle();
//! let server = tokio::spawn(protocol.run());
//!
//! handle.connection_made(transport);
//! handle.data_received(bytes);
//! let status = server.await??;
//! ```

mod dispatch;
mod execution;
pub mod pending;

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::ProtocolConfig;
use crate::error::{ErrorCategory, ErrorReporter, LogReporter, ProtocolError, RpcError};
use crate::message::{
    ErrorResponseMessage, Message, MessageId, NotificationMessage, RequestMessage,
    ResponseMessage,
};
use crate::registry::HandlerRegistry;
use crate::wire::{encode_frame, FrameDecoder, Transport};

use execution::Completion;
pub use execution::WorkerPool;
use pending::{InboundRequests, OutboundRequests, Reply};

/// How a connection ended after an `exit` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// 0 when `shutdown` was received before `exit`, 1 otherwise.
    pub code: i32,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

enum Command {
    ConnectionMade(Box<dyn Transport>),
    DataReceived(Vec<u8>),
    MessageReceived(Value),
    ConnectionLost(Option<io::Error>),
    SendRequest {
        id: MessageId,
        method: String,
        params: Value,
        reply: Reply,
    },
    Notify {
        method: String,
        params: Value,
    },
    Completed(Completion),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::ConnectionMade(_) => f.write_str("ConnectionMade"),
            Command::DataReceived(data) => write!(f, "DataReceived({} bytes)", data.len()),
            Command::MessageReceived(_) => f.write_str("MessageReceived"),
            Command::ConnectionLost(err) => write!(f, "ConnectionLost({:?})", err),
            Command::SendRequest { id, method, .. } => {
                write!(f, "SendRequest({}, {})", id, method)
            }
            Command::Notify { method, .. } => write!(f, "Notify({})", method),
            Command::Completed(completion) => write!(f, "Completed({})", completion.method),
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cheap, clonable access to a running [`Protocol`].
///
/// Handlers receive one with every invocation so they can talk back to the peer.
#[derive(Debug, Clone)]
pub struct ProtocolHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ProtocolHandle {
    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            debug!("Protocol task has stopped; dropping command");
        }
    }

    /// Attach the transport used for every outgoing message.
    pub fn connection_made(&self, transport: impl Transport + 'static) {
        self.send(Command::ConnectionMade(Box::new(transport)));
    }

    /// Feed raw bytes read from the transport.
    pub fn data_received(&self, data: Vec<u8>) {
        self.send(Command::DataReceived(data));
    }

    /// Feed an already-delimited JSON message (e.g. from a websocket).
    pub fn message_received(&self, message: Value) {
        self.send(Command::MessageReceived(message));
    }

    /// Report that the transport went away. `None` means a clean end of stream.
    pub fn connection_lost(&self, error: Option<io::Error>) {
        self.send(Command::ConnectionLost(error));
    }

    /// Send a request to the peer.
    ///
    /// The id defaults to a random UUID v4 string. The returned future resolves
    /// once with the peer's result or error.
    pub fn send_request(
        &self,
        method: &str,
        params: impl Serialize,
        id: Option<MessageId>,
    ) -> ResponseFuture {
        let id = id.unwrap_or_else(MessageId::random);
        let (reply, rx) = oneshot::channel();

        match serde_json::to_value(params) {
            Ok(params) => self.send(Command::SendRequest {
                id: id.clone(),
                method: method.to_string(),
                params,
                reply,
            }),
            Err(err) => {
                let _ = reply.send(Err(RpcError::internal(format!(
                    "Failed to serialize params for {}: {}",
                    method, err
                ))));
            }
        }

        ResponseFuture { id, rx }
    }

    /// Send a request and call `callback` with the result once it arrives.
    ///
    /// Error responses are logged and the callback is not called.
    pub fn send_request_with_callback<F>(&self, method: &str, params: impl Serialize, callback: F)
    where
        F: FnOnce(Value) + Send + 'static,
    {
        let response = self.send_request(method, params, None);
        let method = method.to_string();
        tokio::spawn(async move {
            let id = response.id().clone();
            match response.await {
                Ok(result) => {
                    info!("Client response for {} received: {}", method, result);
                    callback(result);
                }
                Err(err) => warn!("Request \"{}\" ({}) failed: {}", id, method, err),
            }
        });
    }

    /// Send a request and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns the peer's error, or an internal error if the protocol stopped first.
    pub async fn send_request_async(
        &self,
        method: &str,
        params: impl Serialize,
        id: Option<MessageId>,
    ) -> Result<Value, RpcError> {
        self.send_request(method, params, id).await
    }

    /// Send a notification to the peer.
    pub fn notify(&self, method: &str, params: impl Serialize) {
        match serde_json::to_value(params) {
            Ok(params) => self.send(Command::Notify {
                method: method.to_string(),
                params,
            }),
            Err(err) => error!("Failed to serialize params for {}: {}", method, err),
        }
    }

    /// True once the protocol task has finished.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn completed(&self, completion: Completion) {
        self.send(Command::Completed(completion));
    }
}

/// Outcome of an outbound request.
///
/// Dropping the future abandons the result; the pending entry is removed when
/// the response eventually arrives.
#[derive(Debug)]
pub struct ResponseFuture {
    id: MessageId,
    rx: oneshot::Receiver<Result<Value, RpcError>>,
}

impl ResponseFuture {
    pub fn id(&self) -> &MessageId {
        &self.id
    }
}

impl Future for ResponseFuture {
    type Output = Result<Value, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(RpcError::internal(
                    "Protocol stopped before the response arrived",
                ))
            })
        })
    }
}

// =============================================================================
// Protocol
// =============================================================================

/// One connection's protocol state machine.
///
/// Build it, take [`handle`](Protocol::handle)s for the transport side, then
/// drive it with [`run`](Protocol::run).
pub struct Protocol {
    registry: Arc<HandlerRegistry>,
    config: ProtocolConfig,
    reporter: Arc<dyn ErrorReporter>,
    workers: WorkerPool,
    decoder: FrameDecoder,
    transport: Option<Box<dyn Transport>>,
    outbound: OutboundRequests,
    inbound: InboundRequests,
    shutting_down: bool,
    outcome: Option<Result<ExitStatus, ProtocolError>>,
    /// Held until `run` starts so handles can be taken up front
    tx: Option<mpsc::UnboundedSender<Command>>,
    weak_tx: mpsc::WeakUnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl Protocol {
    /// Create a protocol with the default [`LogReporter`] and a private worker pool
    /// sized by `config.max_workers`.
    pub fn new(registry: Arc<HandlerRegistry>, config: ProtocolConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            registry,
            reporter: Arc::new(LogReporter),
            workers: WorkerPool::new(config.max_workers),
            decoder: FrameDecoder::with_max_frame_size(config.max_frame_size),
            config,
            transport: None,
            outbound: OutboundRequests::new(),
            inbound: InboundRequests::new(),
            shutting_down: false,
            outcome: None,
            weak_tx: tx.downgrade(),
            tx: Some(tx),
            rx,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Use a pool shared with other connections instead of a private one.
    pub fn with_workers(mut self, workers: WorkerPool) -> Self {
        self.workers = workers;
        self
    }

    pub fn handle(&self) -> ProtocolHandle {
        let tx = match &self.tx {
            Some(tx) => tx.clone(),
            // While running, only live handles keep the channel open
            None => self
                .weak_tx
                .upgrade()
                .unwrap_or_else(|| mpsc::unbounded_channel().0),
        };
        ProtocolHandle { tx }
    }

    /// Process commands until the connection ends.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when the connection ends without `exit`.
    /// Once every [`ProtocolHandle`] is dropped and queued commands are
    /// processed, this returns [`ProtocolError::Stopped`].
    pub async fn run(mut self) -> Result<ExitStatus, ProtocolError> {
        info!("Protocol started");
        self.tx = None;

        while let Some(command) = self.rx.recv().await {
            self.handle_command(command);

            if let Some(outcome) = self.outcome.take() {
                let aborted = self.inbound.cancel_all();
                if aborted > 0 {
                    debug!("Aborted {} running handlers", aborted);
                }
                match &outcome {
                    Ok(status) => info!("Protocol finished with exit code {}", status.code),
                    Err(err) => error!("Protocol finished: {}", err),
                }
                return outcome;
            }
        }

        Err(ProtocolError::Stopped)
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ConnectionMade(transport) => {
                info!("Connection established");
                self.transport = Some(transport);
            }
            Command::DataReceived(data) => self.on_data(&data),
            Command::MessageReceived(value) => self.on_value(value),
            Command::ConnectionLost(err) => {
                error!("Connection to the client is lost! Shutting down the server.");
                self.close_transport();
                self.finish(Err(match err {
                    Some(err) => ProtocolError::ConnectionLost(err),
                    None => ProtocolError::ConnectionClosed,
                }));
            }
            Command::SendRequest {
                id,
                method,
                params,
                reply,
            } => self.send_request(id, method, params, reply),
            Command::Notify { method, params } => {
                debug!("Sending notification: '{}' {}", method, params);
                self.send_message(&Message::Notification(NotificationMessage::new(
                    method, params,
                )));
            }
            Command::Completed(completion) => self.complete(completion),
        }
    }

    fn on_data(&mut self, data: &[u8]) {
        debug!("Received {} bytes", data.len());
        self.decoder.push(data);

        while self.outcome.is_none() {
            match self.decoder.next_frame() {
                Ok(Some(body)) => self.on_body(&body),
                Ok(None) => break,
                Err(err) => {
                    error!("Unable to frame incoming data: {}", err);
                    self.close_transport();
                    self.finish(Err(err.into()));
                }
            }
        }
    }

    fn on_body(&mut self, body: &[u8]) {
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => self.on_value(value),
            Err(err) => {
                error!("Unable to deserialize message: {}", err);
                self.reporter.report(
                    &RpcError::parse_error(format!("Unable to deserialize message: {}", err)),
                    ErrorCategory::Internal,
                );
            }
        }
    }

    fn finish(&mut self, outcome: Result<ExitStatus, ProtocolError>) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
    }

    fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
    }

    // =========================================================================
    // Encoders
    // =========================================================================

    fn send_request(&mut self, id: MessageId, method: String, params: Value, reply: Reply) {
        let expected_result = self.registry.result_schema(&method).cloned();
        if let Err(reply) = self
            .outbound
            .register(id.clone(), method.as_str(), reply, expected_result)
        {
            warn!("Request id \"{}\" is already pending", id);
            let _ = reply.send(Err(RpcError::invalid_request(format!(
                "Request id \"{}\" is already pending",
                id
            ))));
            return;
        }

        debug!("Sending request with id \"{}\": {} {}", id, method, params);
        self.send_message(&Message::Request(RequestMessage::new(id, method, params)));
    }

    /// Send a success response, normalizing the result through the method's
    /// declared result type.
    fn send_result(&mut self, id: MessageId, method: &str, result: Value) {
        let result = match self.registry.result_schema(method) {
            Some(schema) => match schema.normalize(result) {
                Ok(result) => result,
                Err(err) => {
                    let error = RpcError::internal(format!(
                        "Invalid result for {}: {}",
                        method, err
                    ));
                    error!("{}", error.message);
                    self.send_error(Some(id), error);
                    return;
                }
            },
            None => result,
        };

        self.send_message(&Message::Response(ResponseMessage::new(id, result)));
    }

    fn send_error(&mut self, id: Option<MessageId>, error: RpcError) {
        self.send_message(&Message::ErrorResponse(ErrorResponseMessage::new(id, error)));
    }

    fn send_message(&mut self, message: &Message) {
        let Some(transport) = self.transport.as_mut() else {
            error!("Unable to send data, no available transport!");
            return;
        };

        let body = match serde_json::to_string(message) {
            Ok(body) => body,
            Err(err) => {
                error!("Failed to serialize message: {}", err);
                self.reporter.report(
                    &RpcError::internal(format!("Failed to serialize message: {}", err)),
                    ErrorCategory::Internal,
                );
                return;
            }
        };

        let frame = encode_frame(&body, self.config.framing);
        if frame.is_empty() {
            return;
        }

        debug!("Sending data: {}", body);
        if let Err(err) = transport.write(&frame) {
            error!("Error sending data: {}", err);
            self.reporter.report(
                &RpcError::internal(format!("Error sending data: {}", err)),
                ErrorCategory::Internal,
            );
        }
    }
}
