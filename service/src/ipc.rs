//! Unix domain socket IPC listener.
//!
//! Listens on the socket path and dispatches JSON-RPC-lite messages to the
//! orchestrator. A connection that calls `events.subscribe` additionally
//! gets every engine event pushed as an `event` notification; responses and
//! notifications share one ordered, bounded outbound queue per connection.
//! A client that stops reading blocks its own forwarder, falls behind the
//! broadcaster and is sent `events.lagged` once it catches up.

use std::path::Path;
use std::sync::Arc;

use tapedeck_core::OrchestratorError;
use tapedeck_core::capture::CaptureError;
use tapedeck_core::events::{EventRecv, EventSubscription};
use tapedeck_core::pipeline::{PipelineJobRequest, QueueError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::PROTOCOL_VERSION;
use crate::protocol::*;
use crate::state::ServiceState;

/// Encoded messages waiting for one client's socket.
const OUTBOUND_CAPACITY: usize = 64;

/// Bind the listener, replacing a stale socket file left by a previous run.
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    // Clean up stale socket file
    if path.exists() {
        std::fs::remove_file(path)?;
    }

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)?;
    tracing::info!("tapedeck service listening on {}", path.display());
    Ok(listener)
}

/// Accept connections until `shutdown` flips to true.
pub async fn serve(
    state: Arc<ServiceState>,
    listener: UnixListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        state.inc_connections();
                        state.touch_activity().await;
                        if let Err(e) = handle_connection(&state, stream).await {
                            tracing::warn!("Connection error: {e}");
                        }
                        state.dec_connections();
                        state.touch_activity().await;
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {e}");
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("IPC listener stopping");
                    return Ok(());
                }
            }
        }
    }
}

/// Per-connection state the dispatcher may change.
struct Connection {
    outbound: mpsc::Sender<Vec<u8>>,
    forwarder: Option<JoinHandle<()>>,
}

impl Connection {
    fn new(outbound: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            outbound,
            forwarder: None,
        }
    }

    fn subscribe(&mut self, subscription: EventSubscription) {
        if self.forwarder.is_none() {
            self.forwarder = Some(tokio::spawn(forward_events(
                subscription,
                self.outbound.clone(),
            )));
        }
    }

    fn unsubscribe(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Handle a single client connection.
///
/// Reads newline-delimited JSON-RPC messages and queues responses behind
/// any notifications already waiting to be written.
async fn handle_connection(state: &ServiceState, stream: UnixStream) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_CAPACITY);

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            writer.write_all(&bytes).await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut connection = Connection::new(tx.clone());
    let mut line = String::new();
    let read_result = loop {
        line.clear();
        let n = match reader.read_line(&mut line).await {
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if n == 0 {
            break Ok(()); // EOF
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        state.touch_activity().await;
        let response = dispatch_message(state, &mut connection, trimmed).await;
        let mut response_bytes = serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
        response_bytes.push(b'\n');
        if tx.send(response_bytes).await.is_err() {
            break Ok(()); // writer gone
        }
    };

    drop(connection);
    drop(tx);
    let write_result = match writer_task.await {
        Ok(result) => result,
        Err(e) => Err(std::io::Error::other(format!("writer task failed: {e}"))),
    };
    read_result.and(write_result)
}

/// Push engine events to one subscriber until it unsubscribes or goes away.
async fn forward_events(
    mut subscription: EventSubscription,
    outbound: mpsc::Sender<Vec<u8>>,
) {
    loop {
        let bytes = match subscription.recv().await {
            EventRecv::Event(event) => match serde_json::to_value(&event) {
                Ok(params) => encode_notification(EVENT_METHOD, params),
                Err(e) => {
                    tracing::warn!("Dropping unserializable event {}: {e}", event.seq);
                    continue;
                }
            },
            EventRecv::Lagged(missed) => {
                encode_notification(EVENTS_LAGGED_METHOD, serde_json::json!({ "missed": missed }))
            }
            EventRecv::Closed => break,
        };
        if outbound.send(bytes).await.is_err() {
            break;
        }
    }
}

/// Parse and dispatch a single JSON-RPC message.
async fn dispatch_message(
    state: &ServiceState,
    connection: &mut Connection,
    raw: &str,
) -> serde_json::Value {
    let request: JsonRpcRequest = match serde_json::from_str(raw) {
        Ok(req) => req,
        Err(e) => {
            return serde_json::to_value(JsonRpcError {
                id: RequestId::Integer(0),
                error: JsonRpcErrorBody {
                    code: ERR_INVALID_REQUEST,
                    message: format!("Invalid JSON-RPC: {e}"),
                    data: None,
                },
            })
            .unwrap_or_default();
        }
    };

    let id = request.id.clone();
    let result = dispatch_method(state, connection, &request.method, request.params).await;

    match result {
        Ok(value) => {
            serde_json::to_value(JsonRpcResponse { id, result: value }).unwrap_or_default()
        }
        Err((code, message)) => {
            tracing::debug!("{} failed with {code}: {message}", request.method);
            serde_json::to_value(JsonRpcError {
                id,
                error: JsonRpcErrorBody {
                    code,
                    message,
                    data: None,
                },
            })
            .unwrap_or_default()
        }
    }
}

/// Dispatch to the appropriate handler based on method name.
async fn dispatch_method(
    state: &ServiceState,
    connection: &mut Connection,
    method: &str,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, (i64, String)> {
    match method {
        "hello" => handle_hello(params),
        "capture.start" => handle_capture_start(state, params).await,
        "capture.stop" => handle_capture_stop(state).await,
        "capture.status" => handle_capture_status(state).await,
        "device.control" => handle_device_control(state, params).await,
        "job.enqueue" => handle_job_enqueue(state, params).await,
        "job.postprocess" => handle_job_postprocess(state, params).await,
        "job.export_all" => handle_job_export_all(state, params).await,
        "job.cover" => handle_job_cover(state, params).await,
        "job.remove" => handle_job_remove(state, params),
        "queue.status" => to_result(state.orchestrator().queue_snapshot()),
        "project.list" => handle_project_list(state),
        "storage.report" => handle_storage_report(state),
        "events.subscribe" => {
            connection.subscribe(state.orchestrator().subscribe());
            to_result(SubscriptionResult { subscribed: true })
        }
        "events.unsubscribe" => {
            connection.unsubscribe();
            to_result(SubscriptionResult { subscribed: false })
        }
        "service.status" => handle_service_status(state),
        _ => Err((ERR_METHOD_NOT_FOUND, format!("Unknown method: {method}"))),
    }
}

const CAPABILITIES: &[&str] = &[
    "capture.start",
    "capture.stop",
    "capture.status",
    "device.control",
    "job.enqueue",
    "job.postprocess",
    "job.export_all",
    "job.cover",
    "job.remove",
    "queue.status",
    "project.list",
    "storage.report",
    "events.subscribe",
    "events.unsubscribe",
    "service.status",
];

fn parse_params<T: serde::de::DeserializeOwned>(
    method: &str,
    params: Option<serde_json::Value>,
) -> Result<T, (i64, String)> {
    params
        .ok_or_else(|| (ERR_INVALID_PARAMS, "Missing params".to_string()))
        .and_then(|v| {
            serde_json::from_value(v)
                .map_err(|e| (ERR_INVALID_PARAMS, format!("Invalid {method} params: {e}")))
        })
}

fn to_result<T: serde::Serialize>(value: T) -> Result<serde_json::Value, (i64, String)> {
    serde_json::to_value(value).map_err(|e| (ERR_INFRA, format!("Serialize error: {e}")))
}

/// Handle the `hello` handshake.
fn handle_hello(params: Option<serde_json::Value>) -> Result<serde_json::Value, (i64, String)> {
    let hello: HelloParams = parse_params("hello", params)?;

    if hello.protocol_version != PROTOCOL_VERSION {
        return Err((
            ERR_INVALID_PARAMS,
            format!(
                "Incompatible protocol version: client={}, service={PROTOCOL_VERSION}",
                hello.protocol_version
            ),
        ));
    }
    tracing::debug!("hello from client {}", hello.client_version);

    to_result(HelloResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        service_version: env!("CARGO_PKG_VERSION").to_string(),
        capabilities: CAPABILITIES.iter().map(ToString::to_string).collect(),
    })
}

async fn handle_capture_start(
    state: &ServiceState,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, (i64, String)> {
    let params: CaptureStartParams = parse_params("capture.start", params)?;
    let session = state
        .orchestrator()
        .start_capture(&params.title, &params.year, params.auto_rewind_play)
        .await
        .map_err(|e| orchestrator_error_to_rpc(&e))?;
    to_result(session)
}

async fn handle_capture_stop(state: &ServiceState) -> Result<serde_json::Value, (i64, String)> {
    let capture_state = state
        .orchestrator()
        .stop_capture()
        .await
        .map_err(|e| orchestrator_error_to_rpc(&e))?;
    to_result(CaptureStopResult {
        state: capture_state,
    })
}

async fn handle_capture_status(state: &ServiceState) -> Result<serde_json::Value, (i64, String)> {
    let orchestrator = state.orchestrator();
    let session = orchestrator.current_session().await;
    to_result(CaptureStatusResult {
        state: orchestrator.capture_state(),
        session,
    })
}

async fn handle_device_control(
    state: &ServiceState,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, (i64, String)> {
    let params: DeviceControlParams = parse_params("device.control", params)?;
    state
        .orchestrator()
        .control_device(params.action)
        .await
        .map_err(|e| orchestrator_error_to_rpc(&e))?;
    to_result(DeviceControlResult {
        action: params.action,
    })
}

async fn handle_job_enqueue(
    state: &ServiceState,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, (i64, String)> {
    let request: PipelineJobRequest = parse_params("job.enqueue", params)?;
    let job_id = state
        .orchestrator()
        .enqueue(request)
        .await
        .map_err(|e| orchestrator_error_to_rpc(&e))?;
    to_result(EnqueueResult { job_id })
}

async fn handle_job_postprocess(
    state: &ServiceState,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, (i64, String)> {
    let params: PostprocessParams = parse_params("job.postprocess", params)?;
    let job_id = state
        .orchestrator()
        .postprocess(&params.title, &params.year, params.profile)
        .await
        .map_err(|e| orchestrator_error_to_rpc(&e))?;
    to_result(EnqueueResult { job_id })
}

async fn handle_job_export_all(
    state: &ServiceState,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, (i64, String)> {
    // Params are optional here; a bare call means "do not confirm".
    let params: ExportAllParams = match params {
        Some(value) => parse_params("job.export_all", Some(value))?,
        None => ExportAllParams::default(),
    };
    let (job_id, storage) = state
        .orchestrator()
        .export_all(params.confirm_insufficient_space)
        .await
        .map_err(|e| orchestrator_error_to_rpc(&e))?;
    to_result(ExportAllResult { job_id, storage })
}

async fn handle_job_cover(
    state: &ServiceState,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, (i64, String)> {
    let params: CoverParams = parse_params("job.cover", params)?;
    let job_id = state
        .orchestrator()
        .generate_cover(&params.title, &params.year)
        .await
        .map_err(|e| orchestrator_error_to_rpc(&e))?;
    to_result(EnqueueResult { job_id })
}

fn handle_job_remove(
    state: &ServiceState,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, (i64, String)> {
    let params: JobRemoveParams = parse_params("job.remove", params)?;
    let removed = state
        .orchestrator()
        .remove_pending(params.job_id)
        .map_err(|e| orchestrator_error_to_rpc(&e))?;
    to_result(removed)
}

fn handle_project_list(state: &ServiceState) -> Result<serde_json::Value, (i64, String)> {
    let projects = state
        .orchestrator()
        .projects()
        .map_err(|e| orchestrator_error_to_rpc(&e))?;
    to_result(ProjectListResult { projects })
}

fn handle_storage_report(state: &ServiceState) -> Result<serde_json::Value, (i64, String)> {
    let report = state
        .orchestrator()
        .storage_report()
        .map_err(|e| orchestrator_error_to_rpc(&e))?;
    to_result(report)
}

fn handle_service_status(state: &ServiceState) -> Result<serde_json::Value, (i64, String)> {
    let orchestrator = state.orchestrator();
    to_result(ServiceStatusResult {
        uptime_s: state.uptime_s(),
        connections: state.connection_count(),
        capture_state: orchestrator.capture_state(),
        running_job: orchestrator.current_job(),
        pending_jobs: orchestrator.pending_jobs().len(),
    })
}

/// Map OrchestratorError to JSON-RPC error (code, message).
fn orchestrator_error_to_rpc(err: &OrchestratorError) -> (i64, String) {
    let code = match err {
        OrchestratorError::Capture(CaptureError::AlreadyCapturing { .. }) => ERR_ALREADY_CAPTURING,
        OrchestratorError::Capture(CaptureError::InvalidMetadata { .. }) => ERR_INVALID_PARAMS,
        OrchestratorError::Capture(CaptureError::LaunchFailed { .. }) => ERR_LAUNCH_FAILED,
        OrchestratorError::Capture(CaptureError::DeviceControl { .. }) => ERR_DEVICE_CONTROL,
        OrchestratorError::Queue(QueueError::InvalidRequest { .. }) => ERR_INVALID_PARAMS,
        OrchestratorError::Queue(QueueError::JobNotFound { .. })
        | OrchestratorError::Queue(QueueError::JobNotPending { .. }) => ERR_JOB,
        OrchestratorError::Queue(QueueError::ShuttingDown) => ERR_INFRA,
        OrchestratorError::ProjectBusy { .. } => ERR_PROJECT_BUSY,
        OrchestratorError::InsufficientSpace { .. } => ERR_INSUFFICIENT_SPACE,
        OrchestratorError::Io(_) => ERR_INFRA,
    };
    (code, err.to_string())
}

/// Encode a notification (no id, no response expected) as one wire line.
pub fn encode_notification(method: &str, params: serde_json::Value) -> Vec<u8> {
    let notif = JsonRpcNotification {
        method: method.to_string(),
        params: Some(params),
    };
    let mut bytes = serde_json::to_vec(&notif).unwrap_or_else(|_| b"{}".to_vec());
    bytes.push(b'\n');
    bytes
}
