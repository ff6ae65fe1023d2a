//! Capture session manager.
//!
//! Owns the single process-wide recording session:
//!
//! ```text
//! Idle --start--> Starting --spawned--> Capturing --(stop | tool exit)--> Stopping --exit--> Idle
//! ```
//!
//! A start first reserves the session (Idle -> Starting) and only then
//! rewinds and plays the tape when asked to, so a second start arriving
//! during a long rewind is refused instead of racing it.
//!
//! A watcher task per session waits on the capture tool's exit, so a
//! device-initiated end (tape end, signal loss) takes the same
//! Stopping -> Idle path as an operator stop. The watcher is the only place
//! that publishes `capture/status=stopped`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};

use crate::config::AppConfig;
use crate::events::{EventBus, Operation};
use crate::payload;
use crate::project::{ProjectKey, ProjectStore};
use crate::tool::{ToolCommand, ToolExit, ToolHandle, ToolProcess, spawn_tool};

/// Longest stderr excerpt attached to a failed-capture event.
const ERROR_EXCERPT_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("capture already running for {title} ({year})")]
    AlreadyCapturing { title: String, year: String },

    #[error("invalid capture metadata: {reason}")]
    InvalidMetadata { reason: String },

    #[error("capture tool failed to launch: {reason}")]
    LaunchFailed { reason: String },

    #[error("device control failed: {reason}")]
    DeviceControl { reason: String },
}

/// Transport action sent to the deck's control tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAction {
    Rewind,
    Play,
    Pause,
}

impl DeviceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceAction::Rewind => "rewind",
            DeviceAction::Play => "play",
            DeviceAction::Pause => "pause",
        }
    }
}

impl std::fmt::Display for DeviceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Idle,
    Starting,
    Capturing,
    Stopping,
}

/// Why a capture period ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Operator,
    DeviceEnded,
    Failed,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Operator => "operator",
            StopReason::DeviceEnded => "device_ended",
            StopReason::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub title: String,
    pub year: String,
    pub part_index: u32,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: i64,
    pub state: CaptureState,
    pub output_path: PathBuf,
    pub auto_rewind_play: bool,
}

/// Settings the capture manager reads from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub ffmpeg_path: PathBuf,
    pub video_device: String,
    pub input_format: String,
    pub stop_grace: Duration,
    pub kill_grace: Duration,
    pub escalate_stop: bool,
    pub control_command: Option<PathBuf>,
    pub control_timeout: Duration,
}

impl CaptureSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            ffmpeg_path: config.paths.ffmpeg_path.clone(),
            video_device: config.device.video_device.clone(),
            input_format: config.device.input_format.clone(),
            stop_grace: Duration::from_secs(config.capture.stop_grace_secs),
            kill_grace: Duration::from_secs(config.capture.kill_grace_secs),
            escalate_stop: config.capture.escalate_stop,
            control_command: config.device.control_command.clone(),
            control_timeout: Duration::from_secs(config.device.control_timeout_secs),
        }
    }

    /// `ffmpeg -f <fmt> -i <input> -map 0 -c copy -avoid_negative_ts make_zero -y <out>`
    pub fn capture_command(&self, output: &Path) -> ToolCommand {
        let input = if self.input_format == "dshow" {
            format!("video={}", self.video_device)
        } else {
            self.video_device.clone()
        };
        ToolCommand::new(&self.ffmpeg_path)
            .args(["-f", self.input_format.as_str(), "-i", input.as_str()])
            .args(["-map", "0", "-c", "copy", "-avoid_negative_ts", "make_zero"])
            .arg("-y")
            .arg(output.display().to_string())
    }

    pub fn control_command(&self, action: DeviceAction) -> Option<ToolCommand> {
        self.control_command
            .as_ref()
            .map(|program| ToolCommand::new(program).arg(action.as_str()))
    }
}

struct ActiveSession {
    key: ProjectKey,
    part_index: u32,
    started_at: DateTime<Utc>,
    output_path: PathBuf,
    auto_rewind_play: bool,
    handle: ToolHandle,
    stop_requested: bool,
}

struct Inner {
    state: CaptureState,
    session: Option<ActiveSession>,
    /// Project holding the Starting state before its session exists.
    reserved: Option<ProjectKey>,
    generation: u64,
}

impl Inner {
    fn snapshot(&self) -> Option<SessionSnapshot> {
        self.session.as_ref().map(|s| SessionSnapshot {
            title: s.key.title.clone(),
            year: s.key.year.clone(),
            part_index: s.part_index,
            started_at: s.started_at,
            elapsed_secs: (Utc::now() - s.started_at).num_seconds(),
            state: self.state,
            output_path: s.output_path.clone(),
            auto_rewind_play: s.auto_rewind_play,
        })
    }
}

/// Claim on the Starting state, handed from [`CaptureManager::reserve`] to
/// [`CaptureManager::start_reserved`].
#[derive(Debug)]
#[must_use = "a reservation holds the capture slot until it is started"]
pub struct Reservation {
    key: ProjectKey,
    generation: u64,
}

impl Reservation {
    pub fn key(&self) -> &ProjectKey {
        &self.key
    }
}

#[derive(Clone)]
pub struct CaptureManager {
    settings: Arc<CaptureSettings>,
    store: ProjectStore,
    events: EventBus,
    inner: Arc<Mutex<Inner>>,
    state_tx: Arc<watch::Sender<CaptureState>>,
    /// Serializes transport actions; the deck only does one thing at a time.
    control_lock: Arc<Mutex<()>>,
}

impl CaptureManager {
    pub fn new(settings: CaptureSettings, store: ProjectStore, events: EventBus) -> Self {
        let (state_tx, _) = watch::channel(CaptureState::Idle);
        Self {
            settings: Arc::new(settings),
            store,
            events,
            inner: Arc::new(Mutex::new(Inner {
                state: CaptureState::Idle,
                session: None,
                reserved: None,
                generation: 0,
            })),
            state_tx: Arc::new(state_tx),
            control_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Current state without taking the session lock.
    pub fn state(&self) -> CaptureState {
        *self.state_tx.borrow()
    }

    pub async fn current_session(&self) -> Option<SessionSnapshot> {
        self.inner.lock().await.snapshot()
    }

    /// Project of the active or starting session, if any.
    pub async fn active_project(&self) -> Option<ProjectKey> {
        let inner = self.inner.lock().await;
        inner
            .session
            .as_ref()
            .map(|s| s.key.clone())
            .or_else(|| inner.reserved.clone())
    }

    /// Resolve the project, optionally rewind and play the tape, then launch
    /// the capture tool and start watching it.
    pub async fn start_capture(
        &self,
        title: &str,
        year: &str,
        auto_rewind_play: bool,
    ) -> Result<SessionSnapshot, CaptureError> {
        let key = ProjectKey::new(title, year).map_err(|e| CaptureError::InvalidMetadata {
            reason: e.reason,
        })?;
        let reservation = self.reserve(key).await?;
        self.start_reserved(reservation, auto_rewind_play).await
    }

    /// Move Idle -> Starting for `key`. Refused while any session is
    /// starting, running or stopping.
    pub async fn reserve(&self, key: ProjectKey) -> Result<Reservation, CaptureError> {
        let mut inner = self.inner.lock().await;
        if inner.state != CaptureState::Idle {
            let (title, year) = inner
                .session
                .as_ref()
                .map(|s| &s.key)
                .or(inner.reserved.as_ref())
                .map(|k| (k.title.clone(), k.year.clone()))
                .unwrap_or_default();
            return Err(CaptureError::AlreadyCapturing { title, year });
        }
        inner.generation += 1;
        inner.reserved = Some(key.clone());
        self.set_state(&mut inner, CaptureState::Starting);
        Ok(Reservation {
            key,
            generation: inner.generation,
        })
    }

    /// Finish a start begun by [`Self::reserve`].
    pub async fn start_reserved(
        &self,
        reservation: Reservation,
        auto_rewind_play: bool,
    ) -> Result<SessionSnapshot, CaptureError> {
        let Reservation { key, generation } = reservation;

        if auto_rewind_play {
            for action in [DeviceAction::Rewind, DeviceAction::Play] {
                self.events.status(
                    Operation::Capture,
                    "device_control",
                    payload! {
                        "title" => key.title,
                        "year" => key.year,
                        "action" => action.as_str(),
                    },
                );
                if let Err(reason) = self.run_control(action).await {
                    tracing::warn!("Device {action} failed before capturing {key}: {reason}");
                    self.release(generation).await;
                    self.events.status(
                        Operation::Capture,
                        "device_control_failed",
                        payload! {
                            "title" => key.title,
                            "year" => key.year,
                            "action" => action.as_str(),
                            "error" => reason,
                        },
                    );
                    return Err(CaptureError::DeviceControl { reason });
                }
            }
        }

        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.state != CaptureState::Starting {
            return Err(CaptureError::LaunchFailed {
                reason: "capture reservation was lost".to_string(),
            });
        }
        inner.reserved = None;

        let process = match self.launch(&key) {
            Ok(launched) => launched,
            Err(reason) => {
                self.set_state(&mut inner, CaptureState::Idle);
                tracing::warn!("Capture launch failed for {key}: {reason}");
                self.events.status(
                    Operation::Capture,
                    "launch_failed",
                    payload! { "title" => key.title, "year" => key.year, "error" => reason },
                );
                return Err(CaptureError::LaunchFailed { reason });
            }
        };
        let (part_index, output_path, process) = process;

        let started_at = Utc::now();
        inner.session = Some(ActiveSession {
            key: key.clone(),
            part_index,
            started_at,
            output_path: output_path.clone(),
            auto_rewind_play,
            handle: process.handle.clone(),
            stop_requested: false,
        });
        self.set_state(&mut inner, CaptureState::Capturing);

        tracing::info!(
            "Capture started: {key} part {part_index} -> {}",
            output_path.display()
        );
        self.events.status(
            Operation::Capture,
            "started",
            payload! {
                "title" => key.title,
                "year" => key.year,
                "started_at" => started_at.to_rfc3339(),
                "part_index" => part_index,
                "output_path" => output_path.display().to_string(),
                "auto_rewind_play" => auto_rewind_play,
            },
        );

        let snapshot = inner.snapshot();
        drop(inner);

        let manager = self.clone();
        tokio::spawn(async move {
            manager.watch_tool(generation, process).await;
        });

        snapshot.ok_or_else(|| CaptureError::LaunchFailed {
            reason: "session vanished during start".to_string(),
        })
    }

    /// Request a graceful stop. Returns the state after the request; the
    /// transition to Idle is published once the tool has exited.
    pub async fn stop_capture(&self) -> Result<CaptureState, CaptureError> {
        let mut inner = self.inner.lock().await;
        if inner.state != CaptureState::Capturing {
            return Ok(inner.state);
        }
        let Some(session) = inner.session.as_mut() else {
            return Ok(inner.state);
        };
        session.stop_requested = true;
        let handle = session.handle.clone();
        let key = session.key.clone();
        self.set_state(&mut inner, CaptureState::Stopping);
        tracing::info!("Stopping capture for {key}");
        self.events.status(
            Operation::Capture,
            "stopping",
            payload! { "title" => key.title, "year" => key.year, "reason" => "operator" },
        );
        drop(inner);

        let settings = Arc::clone(&self.settings);
        tokio::spawn(async move {
            request_tool_exit(handle, &settings).await;
        });
        Ok(CaptureState::Stopping)
    }

    /// Send one transport action to the deck. Only allowed while Idle; a
    /// start with `auto_rewind_play` drives the deck itself.
    pub async fn control_device(&self, action: DeviceAction) -> Result<(), CaptureError> {
        let state = self.state();
        if state != CaptureState::Idle {
            return Err(CaptureError::DeviceControl {
                reason: format!("capture is {}", state_name(state)),
            });
        }
        self.events.status(
            Operation::Capture,
            "device_control",
            payload! { "action" => action.as_str() },
        );
        self.run_control(action).await.map_err(|reason| {
            tracing::warn!("Device {action} failed: {reason}");
            CaptureError::DeviceControl { reason }
        })
    }

    /// Wait until the session is back to Idle, up to `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == CaptureState::Idle))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    fn launch(&self, key: &ProjectKey) -> Result<(u32, PathBuf, ToolProcess), String> {
        if self.settings.video_device.trim().is_empty() {
            return Err("no capture device configured".to_string());
        }
        let lowres = self.store.ensure_lowres_dir(key).map_err(|e| {
            format!("cannot create {}: {e}", self.store.lowres_dir(key).display())
        })?;
        let part_index = self
            .store
            .next_part_index(key)
            .map_err(|e| format!("cannot scan {}: {e}", lowres.display()))?;
        let output_path = self.store.part_path(key, part_index);
        let process = spawn_tool(&self.settings.capture_command(&output_path))
            .map_err(|e| e.to_string())?;
        Ok((part_index, output_path, process))
    }

    /// Run the control tool for `action` and wait for it, bounded by the
    /// configured timeout.
    async fn run_control(&self, action: DeviceAction) -> Result<(), String> {
        let command = self
            .settings
            .control_command(action)
            .ok_or_else(|| "no device control command configured".to_string())?;
        let _deck = self.control_lock.lock().await;
        let process = spawn_tool(&command).map_err(|e| e.to_string())?;
        let handle = process.handle.clone();
        let Ok(exit) =
            tokio::time::timeout(self.settings.control_timeout, process.follow(|_| {})).await
        else {
            handle.kill();
            return Err(format!(
                "{action} did not finish within {}s",
                self.settings.control_timeout.as_secs()
            ));
        };
        if exit.success() {
            tracing::info!("Device {action} done");
            Ok(())
        } else {
            Err(format!(
                "{action} exited with code {:?}: {}",
                exit.code,
                tail_chars(&exit.stderr_tail, ERROR_EXCERPT_CHARS)
            ))
        }
    }

    /// Drop a reservation that never reached Capturing.
    async fn release(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.generation == generation && inner.state == CaptureState::Starting {
            inner.reserved = None;
            self.set_state(&mut inner, CaptureState::Idle);
        }
    }

    fn set_state(&self, inner: &mut Inner, state: CaptureState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    async fn watch_tool(&self, generation: u64, process: ToolProcess) {
        let mut tape_end = false;
        let exit = process
            .follow(|line| {
                if line.text.contains("End of file") || line.text.contains("Interrupted") {
                    tape_end = true;
                }
            })
            .await;
        self.finish_session(generation, &exit, tape_end).await;
    }

    async fn finish_session(&self, generation: u64, exit: &ToolExit, tape_end: bool) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        let Some(session) = inner.session.take() else {
            return;
        };
        let key = session.key.clone();

        if inner.state == CaptureState::Capturing {
            self.set_state(&mut inner, CaptureState::Stopping);
            self.events.status(
                Operation::Capture,
                "stopping",
                payload! { "title" => key.title, "year" => key.year, "reason" => "tool_exited" },
            );
        }

        let reason = classify_exit(exit, session.stop_requested, tape_end);

        let duration_secs = (Utc::now() - session.started_at).num_seconds();
        let mut fields = payload! {
            "title" => key.title,
            "year" => key.year,
            "part_index" => session.part_index,
            "output_path" => session.output_path.display().to_string(),
            "reason" => reason.as_str(),
            "duration_secs" => duration_secs,
        };
        if let Some(code) = exit.code {
            fields.insert("exit_code".to_string(), code.into());
        }
        if reason == StopReason::Failed {
            let excerpt = tail_chars(&exit.stderr_tail, ERROR_EXCERPT_CHARS);
            tracing::warn!("Capture tool for {key} failed (code {:?}): {excerpt}", exit.code);
            fields.insert("error".to_string(), excerpt.into());
        } else {
            tracing::info!(
                "Capture stopped for {key} ({}): {}",
                reason.as_str(),
                session.output_path.display()
            );
        }
        // Published before Idle so a new session's events always follow it.
        self.events.status(Operation::Capture, "stopped", fields);
        self.set_state(&mut inner, CaptureState::Idle);
    }
}

/// `q` on stdin, then SIGTERM after the grace period, then SIGKILL.
async fn request_tool_exit(handle: ToolHandle, settings: &CaptureSettings) {
    if let Err(e) = handle.write_stdin(b"q").await {
        tracing::debug!("Could not send stop request to {}: {e}", handle.program());
    }
    handle.close_stdin().await;

    if !settings.escalate_stop {
        return;
    }
    if tokio::time::timeout(settings.stop_grace, handle.wait()).await.is_ok() {
        return;
    }
    tracing::warn!(
        "Capture tool ignored stop request for {:?}, sending SIGTERM",
        settings.stop_grace
    );
    handle.terminate();
    if tokio::time::timeout(settings.kill_grace, handle.wait()).await.is_ok() {
        return;
    }
    tracing::warn!("Capture tool still running, killing it");
    handle.kill();
}

fn state_name(state: CaptureState) -> &'static str {
    match state {
        CaptureState::Idle => "idle",
        CaptureState::Starting => "starting",
        CaptureState::Capturing => "capturing",
        CaptureState::Stopping => "stopping",
    }
}

/// Exit code 1 is how ffmpeg reports a `q` stop.
fn classify_exit(exit: &ToolExit, stop_requested: bool, tape_end: bool) -> StopReason {
    if stop_requested {
        return StopReason::Operator;
    }
    if matches!(exit.code, Some(0 | 1)) || tape_end {
        StopReason::DeviceEnded
    } else {
        StopReason::Failed
    }
}

fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max)).collect()
}
