//! Routing of classified messages.

use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::pending::Cancellation;
use super::{ExitStatus, Protocol};
use crate::error::{ErrorCategory, RpcError};
use crate::message::{
    classify, ClassifyError, Incoming, Message, MessageId, MessageKind, CANCEL_REQUEST,
    EXECUTE_COMMAND, EXIT, SHUTDOWN,
};

impl Protocol {
    pub(super) fn on_value(&mut self, value: Value) {
        match classify(value, &self.registry, &mut self.outbound) {
            Ok(Incoming::Message(message)) => self.dispatch(message),
            Ok(Incoming::Passthrough(value)) | Ok(Incoming::Unsupported(value)) => {
                warn!("Unknown message \"{}\"", value)
            }
            Err(err) => self.on_classify_error(err),
        }
    }

    fn dispatch(&mut self, message: Message) {
        if self.shutting_down && message.method() != Some(EXIT) {
            warn!("Server shutting down. No more requests!");
            return;
        }

        match message {
            Message::Request(request) => {
                debug!("Request message received.");
                self.handle_request(request.id, request.method, request.params);
            }
            Message::Notification(notification) => {
                debug!("Notification message received.");
                self.handle_notification(notification.method, notification.params);
            }
            Message::Response(response) => {
                debug!("Response message received.");
                self.outbound.resolve_response(&response.id, response.result);
            }
            Message::ErrorResponse(response) => {
                debug!("Error message received.");
                match response.id {
                    Some(id) => {
                        self.outbound.resolve_error(&id, response.error);
                    }
                    None => warn!("Received error response without an id: {}", response.error),
                }
            }
        }
    }

    fn on_classify_error(&mut self, err: ClassifyError) {
        error!("Unable to deserialize message: {}", err);

        let exiting = err.method.as_deref() == Some(EXIT);
        if self.shutting_down && !exiting {
            warn!("Server shutting down. No more requests!");
            return;
        }

        match err.kind {
            MessageKind::Request => {
                self.send_error(err.id, err.error.clone());
                self.reporter.report(&err.error, ErrorCategory::Request);
            }
            MessageKind::Notification => {
                self.reporter.report(&err.error, ErrorCategory::Notification);
            }
            MessageKind::Response | MessageKind::ErrorResponse => {
                if let Some(id) = &err.id {
                    self.outbound.resolve_error(id, err.error.clone());
                }
                self.reporter.report(&err.error, ErrorCategory::Internal);
            }
        }
    }

    fn handle_request(&mut self, id: MessageId, method: String, params: Value) {
        match method.as_str() {
            SHUTDOWN => self.shutdown(id),
            EXECUTE_COMMAND => self.execute_command(id, params),
            _ => match self.registry.lookup(&method) {
                Ok(handler) => {
                    let handler = handler.clone();
                    self.execute_request(id, method, handler, params);
                }
                Err(error) => self.fail_request(id, &method, error),
            },
        }
    }

    fn handle_notification(&mut self, method: String, params: Value) {
        match method.as_str() {
            CANCEL_REQUEST => self.cancel_request(&params),
            EXIT => self.exit(),
            _ => match self.registry.lookup(&method) {
                Ok(handler) => {
                    let handler = handler.clone();
                    self.execute_notification(method, handler, params);
                }
                Err(_) => warn!("Ignoring notification for unknown method \"{}\"", method),
            },
        }
    }

    /// Answer a request with an error raised before or while running its handler inline.
    pub(super) fn fail_request(&mut self, id: MessageId, method: &str, error: RpcError) {
        error!("Failed to handle request {} {}: {}", id, method, error);
        self.reporter.report(&error, ErrorCategory::Request);
        self.send_error(Some(id), error);
    }

    pub(super) fn fail_notification(&mut self, method: &str, error: RpcError) {
        error!("Exception occurred in notification \"{}\": {}", method, error);
        self.reporter.report(&error, ErrorCategory::Notification);
    }

    fn cancel_request(&mut self, params: &Value) {
        let Some(id) = params.get("id").and_then(MessageId::from_value) else {
            warn!("Cancel notification without a valid id: {}", params);
            return;
        };

        match self.inbound.cancel(&id) {
            Cancellation::Aborted => info!("Cancelled request with id \"{}\"", id),
            Cancellation::AlreadyFinished => {
                debug!("Request with id \"{}\" already finished; ignoring cancel", id)
            }
            Cancellation::Unknown => {
                warn!("Cancel notification for unknown message id \"{}\"", id)
            }
        }
    }

    fn shutdown(&mut self, id: MessageId) {
        let tasks = self.inbound.cancel_all();
        let requests = self.outbound.cancel_all();
        info!(
            "Shutdown requested; cancelled {} running handlers and {} pending requests",
            tasks, requests
        );

        self.shutting_down = true;
        self.send_result(id, SHUTDOWN, Value::Null);
    }

    fn exit(&mut self) {
        let code = if self.shutting_down { 0 } else { 1 };
        info!("Exit notification received (exit code {})", code);
        self.close_transport();
        self.finish(Ok(ExitStatus { code }));
    }

    fn execute_command(&mut self, id: MessageId, params: Value) {
        let Some(name) = params.get("command").and_then(Value::as_str) else {
            self.fail_request(
                id,
                EXECUTE_COMMAND,
                RpcError::invalid_params("Missing string \"command\" in executeCommand params"),
            );
            return;
        };

        let Some(handler) = self.registry.lookup_command(name).cloned() else {
            let error = RpcError::method_not_found(name);
            self.fail_request(id, EXECUTE_COMMAND, error);
            return;
        };

        debug!("Executing command \"{}\"", name);
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        self.execute_request(id, EXECUTE_COMMAND.to_string(), handler, arguments);
    }
}
