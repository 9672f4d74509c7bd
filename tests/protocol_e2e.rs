//! End-to-end tests: two protocol instances talking to each other.
//!
//! A client and a server protocol are wired together over in-memory
//! transports. Every frame the server writes is recorded before it is handed
//! to the client, so tests can assert on exactly what went over the wire.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::time::timeout;

use rpcwire::wire::FrameDecoder;
use rpcwire::{
    ChannelTransport, ErrorCategory, ErrorKind, ErrorReporter, Handler, HandlerRegistry,
    HandlerResult, MessageId, Protocol, ProtocolConfig, ProtocolHandle, RpcError,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Helpers
// =============================================================================

#[derive(Default)]
struct RecordingReporter {
    reports: Mutex<Vec<(RpcError, ErrorCategory)>>,
}

impl RecordingReporter {
    fn reports(&self) -> Vec<(RpcError, ErrorCategory)> {
        self.reports.lock().unwrap().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, error: &RpcError, category: ErrorCategory) {
        self.reports.lock().unwrap().push((error.clone(), category));
    }
}

struct Link {
    client: ProtocolHandle,
    server: ProtocolHandle,
    server_frames: Arc<Mutex<Vec<Vec<u8>>>>,
    server_reports: Arc<RecordingReporter>,
}

impl Link {
    fn connect(server_registry: HandlerRegistry, client_registry: HandlerRegistry) -> Self {
        let server_reports = Arc::new(RecordingReporter::default());
        let server = Protocol::new(Arc::new(server_registry), ProtocolConfig::default())
            .with_reporter(server_reports.clone());
        let client = Protocol::new(Arc::new(client_registry), ProtocolConfig::default());

        let server_handle = server.handle();
        let client_handle = client.handle();

        let (server_transport, mut server_out) = ChannelTransport::new();
        let (client_transport, mut client_out) = ChannelTransport::new();
        server_handle.connection_made(server_transport);
        client_handle.connection_made(client_transport);

        tokio::spawn(server.run());
        tokio::spawn(client.run());

        let server_frames = Arc::new(Mutex::new(Vec::new()));
        let recorded = server_frames.clone();
        let to_client = client_handle.clone();
        tokio::spawn(async move {
            while let Some(frame) = server_out.recv().await {
                recorded.lock().unwrap().push(frame.clone());
                to_client.data_received(frame);
            }
        });

        let to_server = server_handle.clone();
        tokio::spawn(async move {
            while let Some(frame) = client_out.recv().await {
                to_server.data_received(frame);
            }
        });

        Self {
            client: client_handle,
            server: server_handle,
            server_frames,
            server_reports,
        }
    }

    /// Decoded bodies of every frame the server has written so far.
    fn server_messages(&self) -> Vec<Value> {
        let frames = self.server_frames.lock().unwrap();
        frames
            .iter()
            .flat_map(|frame| {
                let mut decoder = FrameDecoder::new();
                decoder.decode(frame).expect("server wrote a valid frame")
            })
            .map(|body| serde_json::from_slice(&body).expect("server wrote valid JSON"))
            .collect()
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        timeout(
            TEST_TIMEOUT,
            self.client.send_request_async(method, params, None),
        )
        .await
        .expect("Timed out waiting for a response")
    }
}

async fn who_are_you(handle: ProtocolHandle, _params: Value) -> HandlerResult {
    let name = handle.send_request_async("client/name", (), None).await?;
    Ok(json!({ "client": name }))
}

fn server_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .feature("echo", Handler::sync(|_, params| Ok(params)))
        .unwrap();
    registry
        .feature(
            "wait",
            Handler::from_async(|_, _| async {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }),
        )
        .unwrap();
    registry
        .feature("whoAreYou", Handler::from_async(who_are_you))
        .unwrap();
    registry
}

fn client_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .feature("client/name", Handler::sync(|_, _| Ok(json!("e2e-client"))))
        .unwrap();
    registry
}

#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_echo_round_trip_writes_one_response() {
    let link = Link::connect(server_registry(), client_registry());

    let result = link.request("echo", json!({"x": 1})).await;
    assert_eq!(result, Ok(json!({"x": 1})));

    let messages = link.server_messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["result"], json!({"x": 1}));
    assert!(messages[0].get("error").is_none());
}

#[tokio::test]
async fn test_unknown_method_gets_method_not_found() {
    let link = Link::connect(server_registry(), client_registry());

    let err = link.request("doesNotExist", Value::Null).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MethodNotFound);
    assert_eq!(err.message, "Method Not Found: doesNotExist");

    let messages = link.server_messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["error"]["code"], json!(-32601));
    assert!(messages[0].get("result").is_none());

    let reports = link.server_reports.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0.kind(), ErrorKind::MethodNotFound);
    assert_eq!(reports[0].1, ErrorCategory::Request);
}

#[tokio::test]
async fn test_unknown_notification_writes_nothing() {
    let logs = LogCapture::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let link = Link::connect(server_registry(), client_registry());
    link.client.notify("unknown/notification", json!({"a": 1}));

    // A request behind it proves the notification was processed
    link.request("echo", Value::Null).await.expect("echo");

    let messages = link.server_messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["result"], Value::Null);
    assert!(link.server_reports.reports().is_empty());
    assert!(logs
        .contents()
        .contains("Ignoring notification for unknown method \"unknown/notification\""));
}

#[tokio::test]
async fn test_cancelled_request_gets_request_cancelled() {
    let link = Link::connect(server_registry(), client_registry());
    let id = MessageId::from("long-running");

    let response = link.client.send_request("wait", (), Some(id.clone()));
    link.client.notify("$/cancelRequest", json!({ "id": id }));

    let err = timeout(TEST_TIMEOUT, response)
        .await
        .expect("Timed out waiting for the cancellation")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RequestCancelled);
    assert_eq!(err.message, "Request with id \"long-running\" is canceled");
}

#[tokio::test]
async fn test_cancel_after_completion_is_ignored() {
    let link = Link::connect(server_registry(), client_registry());
    let id = MessageId::from(41);

    let result = timeout(
        TEST_TIMEOUT,
        link.client.send_request("echo", "done", Some(id.clone())),
    )
    .await
    .expect("response");
    assert_eq!(result, Ok(json!("done")));

    link.client.notify("$/cancelRequest", json!({ "id": id }));
    link.request("echo", Value::Null).await.expect("echo");

    // One response per request, nothing for the late cancel
    assert_eq!(link.server_messages().len(), 2);
    assert!(link.server_reports.reports().is_empty());
}

#[tokio::test]
async fn test_cancel_before_handler_is_polled() {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let mut registry = server_registry();
    registry
        .feature(
            "mark",
            Handler::from_async(move |_, _| {
                let flag = flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
        )
        .unwrap();
    let link = Link::connect(registry, client_registry());

    // Request and cancel arrive in the same chunk
    let mut bytes = Vec::new();
    for message in [
        json!({"jsonrpc": "2.0", "id": "m", "method": "mark"}),
        json!({"jsonrpc": "2.0", "method": "$/cancelRequest", "params": {"id": "m"}}),
    ] {
        bytes.extend(rpcwire::wire::encode_frame(
            &message.to_string(),
            rpcwire::FramingMode::Headers,
        ));
    }
    link.server.data_received(bytes);

    timeout(TEST_TIMEOUT, async {
        while link.server_messages().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("cancellation response");

    let messages = link.server_messages();
    assert_eq!(messages[0]["id"], json!("m"));
    assert_eq!(messages[0]["error"]["code"], json!(-32800));
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_server_handler_calls_back_into_client() {
    let link = Link::connect(server_registry(), client_registry());

    let result = link.request("whoAreYou", Value::Null).await;
    assert_eq!(result, Ok(json!({"client": "e2e-client"})));

    // The server's request to the client, then its response
    let messages = link.server_messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["method"], json!("client/name"));
    assert_eq!(messages[1]["result"], json!({"client": "e2e-client"}));
}

#[tokio::test]
async fn test_many_requests_are_correlated() {
    let link = Link::connect(server_registry(), client_registry());

    let responses: Vec<_> = (0..20)
        .map(|i| link.client.send_request("echo", json!({ "n": i }), None))
        .collect();

    for (i, response) in responses.into_iter().enumerate() {
        let result = timeout(TEST_TIMEOUT, response).await.expect("response");
        assert_eq!(result, Ok(json!({ "n": i })));
    }
}
