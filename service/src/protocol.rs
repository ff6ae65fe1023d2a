//! IPC protocol types for the tapedeck observer channel.
//!
//! Newline-delimited JSON-RPC-lite: requests carry `{id, method, params?}`,
//! responses `{id, result}` or `{id, error}`, and notifications have no id.

use serde::{Deserialize, Serialize};
use tapedeck_core::capture::{CaptureState, DeviceAction, SessionSnapshot};
use tapedeck_core::pipeline::{JobId, PipelineJob};
use tapedeck_core::project::Project;
use tapedeck_core::storage::StorageReport;

// ─────────────────────────────────────────────────────────────────────────────
// Error codes (JSON-RPC error.code)
// ─────────────────────────────────────────────────────────────────────────────

/// Standard JSON-RPC errors.
pub const ERR_INVALID_REQUEST: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;

/// Engine error codes.
pub const ERR_ALREADY_CAPTURING: i64 = 100;
pub const ERR_PROJECT_BUSY: i64 = 101;
pub const ERR_JOB: i64 = 102;
pub const ERR_INSUFFICIENT_SPACE: i64 = 103;
pub const ERR_LAUNCH_FAILED: i64 = 200;
pub const ERR_DEVICE_CONTROL: i64 = 201;
pub const ERR_INFRA: i64 = 300;

/// Method name of pushed event notifications.
pub const EVENT_METHOD: &str = "event";

/// Sent instead of the dropped events when a subscriber fell behind;
/// params are `{missed}`.
pub const EVENTS_LAGGED_METHOD: &str = "events.lagged";

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: RequestId,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub id: RequestId,
    pub error: JsonRpcErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    pub protocol_version: String,
    pub client_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub protocol_version: String,
    pub service_version: String,
    pub capabilities: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// capture.*
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureStartParams {
    pub title: String,
    pub year: String,
    #[serde(default)]
    pub auto_rewind_play: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureStopResult {
    pub state: CaptureState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureStatusResult {
    pub state: CaptureState,
    pub session: Option<SessionSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceControlParams {
    pub action: DeviceAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceControlResult {
    pub action: DeviceAction,
}

// ─────────────────────────────────────────────────────────────────────────────
// job.*
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueResult {
    pub job_id: JobId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostprocessParams {
    pub title: String,
    pub year: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverParams {
    pub title: String,
    pub year: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportAllParams {
    /// Export even though the library cannot hold every pending artifact.
    #[serde(default)]
    pub confirm_insufficient_space: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportAllResult {
    pub job_id: JobId,
    pub storage: StorageReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRemoveParams {
    pub job_id: JobId,
}

// ─────────────────────────────────────────────────────────────────────────────
// project.list / events.* / service.status
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectListResult {
    pub projects: Vec<Project>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionResult {
    pub subscribed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusResult {
    pub uptime_s: u64,
    pub connections: u32,
    pub capture_state: CaptureState,
    pub running_job: Option<PipelineJob>,
    pub pending_jobs: usize,
}
