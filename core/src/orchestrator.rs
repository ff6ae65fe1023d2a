//! Orchestration facade.
//!
//! Wires the capture manager, job queue, project store and event bus
//! together and enforces the one cross-component rule: a capture and a
//! pipeline job never touch the same project at the same time. Capture start
//! and enqueue are serialized by one admission lock so the busy check and
//! the state change it guards happen atomically. The rule is cooperative;
//! nothing locks the project directory on disk.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::capture::{
    CaptureError, CaptureManager, CaptureSettings, CaptureState, DeviceAction, SessionSnapshot,
};
use crate::config::AppConfig;
use crate::events::{EventBus, EventSubscription};
use crate::pipeline::{
    FfmpegStages, JobId, JobKind, JobQueue, PipelineJob, PipelineJobRequest, QueueError,
    QueueSnapshot, StageExecutor,
};
use crate::project::{Project, ProjectKey, ProjectStore};
use crate::storage::{FsSpaceProbe, SpaceProbe, StorageReport, compute_report};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("project {project} is busy: {reason}")]
    ProjectBusy { project: String, reason: String },

    #[error(
        "library has {} bytes free but {} bytes are waiting to be exported",
        report.free_bytes,
        report.required_bytes
    )]
    InsufficientSpace { report: Box<StorageReport> },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

pub struct Orchestrator {
    config: Arc<AppConfig>,
    store: ProjectStore,
    events: EventBus,
    capture: CaptureManager,
    queue: JobQueue,
    probe: Arc<dyn SpaceProbe>,
    admission: Mutex<()>,
    started_at: Instant,
}

impl Orchestrator {
    /// Production wiring: ffmpeg/Real-ESRGAN stages and real free-space queries.
    pub fn new(config: AppConfig) -> Self {
        let executor = Arc::new(FfmpegStages::from_config(&config));
        Self::with_parts(Arc::new(config), executor, Arc::new(FsSpaceProbe))
    }

    pub fn with_parts(
        config: Arc<AppConfig>,
        executor: Arc<dyn StageExecutor>,
        probe: Arc<dyn SpaceProbe>,
    ) -> Self {
        let store = ProjectStore::new(
            config.paths.import_root.clone(),
            config.paths.library_root.clone(),
        );
        let events = EventBus::new(config.events.channel_capacity);
        let capture = CaptureManager::new(
            CaptureSettings::from_config(&config),
            store.clone(),
            events.clone(),
        );
        let queue = JobQueue::new(
            Arc::clone(&config),
            store.clone(),
            events.clone(),
            executor,
        );
        Self {
            config,
            store,
            events,
            capture,
            queue,
            probe,
            admission: Mutex::new(()),
            started_at: Instant::now(),
        }
    }

    /// Start the pipeline worker.
    pub fn start(&self) {
        self.queue.start();
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &ProjectStore {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    // --- capture ---

    pub async fn start_capture(
        &self,
        title: &str,
        year: &str,
        auto_rewind_play: bool,
    ) -> Result<SessionSnapshot> {
        let key = ProjectKey::new(title, year).map_err(|e| CaptureError::InvalidMetadata {
            reason: e.reason,
        })?;
        // The rewind can take minutes; only the busy check and the
        // reservation run under the admission lock.
        let reservation = {
            let _admission = self.admission.lock().await;
            if self.queue.references_project(&key) {
                return Err(OrchestratorError::ProjectBusy {
                    project: key.to_string(),
                    reason: "a pipeline job for this project is queued or running".to_string(),
                });
            }
            self.capture.reserve(key).await?
        };
        Ok(self
            .capture
            .start_reserved(reservation, auto_rewind_play)
            .await?)
    }

    pub async fn control_device(&self, action: DeviceAction) -> Result<()> {
        Ok(self.capture.control_device(action).await?)
    }

    pub async fn stop_capture(&self) -> Result<CaptureState> {
        Ok(self.capture.stop_capture().await?)
    }

    pub async fn current_session(&self) -> Option<SessionSnapshot> {
        self.capture.current_session().await
    }

    pub fn capture_state(&self) -> CaptureState {
        self.capture.state()
    }

    pub fn capture(&self) -> &CaptureManager {
        &self.capture
    }

    // --- pipeline ---

    pub async fn enqueue(&self, request: PipelineJobRequest) -> Result<JobId> {
        let _admission = self.admission.lock().await;
        if let Some(active) = self.capture.active_project().await {
            if self.request_projects(&request).contains(&active) {
                return Err(OrchestratorError::ProjectBusy {
                    project: active.to_string(),
                    reason: "a capture for this project is in progress".to_string(),
                });
            }
        }
        Ok(self.queue.enqueue(request)?)
    }

    /// Queue an upscale of the project's merged artifact.
    pub async fn postprocess(
        &self,
        title: &str,
        year: &str,
        profile: Option<String>,
    ) -> Result<JobId> {
        let key = ProjectKey::new(title, year).map_err(|e| QueueError::InvalidRequest {
            reason: e.reason,
        })?;
        let merged = self
            .store
            .find_merged(&key)?
            .ok_or_else(|| QueueError::InvalidRequest {
                reason: format!("{key} has no merged video to process"),
            })?;
        let mut request = PipelineJobRequest::new(JobKind::Postprocess, vec![merged], title, year);
        request.profile = profile;
        self.enqueue(request).await
    }

    /// Queue cover art rendered from the project's upscaled video.
    pub async fn generate_cover(&self, title: &str, year: &str) -> Result<JobId> {
        let key = ProjectKey::new(title, year).map_err(|e| QueueError::InvalidRequest {
            reason: e.reason,
        })?;
        let upscaled = self
            .store
            .find_upscaled(&key)?
            .ok_or_else(|| QueueError::InvalidRequest {
                reason: format!("{key} has no upscaled video to take a cover from"),
            })?;
        let request = PipelineJobRequest::new(JobKind::Cover, vec![upscaled], title, year);
        self.enqueue(request).await
    }

    /// Queue an export of every upscaled, not-yet-exported artifact.
    ///
    /// Refused with [`OrchestratorError::InsufficientSpace`] when the library
    /// cannot hold all of them, unless `confirm_insufficient_space` is set.
    pub async fn export_all(
        &self,
        confirm_insufficient_space: bool,
    ) -> Result<(JobId, StorageReport)> {
        let report = self.storage_report()?;
        if report.pending.is_empty() {
            return Err(QueueError::InvalidRequest {
                reason: "nothing to export".to_string(),
            }
            .into());
        }
        if !report.fits_all && !confirm_insufficient_space {
            return Err(OrchestratorError::InsufficientSpace {
                report: Box::new(report),
            });
        }
        if !report.fits_all {
            tracing::warn!(
                "Exporting {} bytes into {} free bytes at operator's request",
                report.required_bytes,
                report.free_bytes
            );
        }
        let inputs = report.pending.iter().map(|p| p.source.clone()).collect();
        let mut request = PipelineJobRequest::new(JobKind::ExportAll, inputs, "", "");
        request.skip_existing = true;
        let id = self.enqueue(request).await?;
        Ok((id, report))
    }

    pub fn remove_pending(&self, id: JobId) -> Result<PipelineJob> {
        Ok(self.queue.remove_pending(id)?)
    }

    pub fn current_job(&self) -> Option<PipelineJob> {
        self.queue.current_job()
    }

    pub fn pending_jobs(&self) -> Vec<PipelineJob> {
        self.queue.pending_jobs()
    }

    pub fn job(&self, id: JobId) -> Option<PipelineJob> {
        self.queue.job(id)
    }

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    // --- projects and storage ---

    pub fn projects(&self) -> Result<Vec<Project>> {
        Ok(self.store.list_projects()?)
    }

    pub fn storage_report(&self) -> Result<StorageReport> {
        Ok(compute_report(
            &self.store,
            self.store.library_root(),
            self.probe.as_ref(),
        )?)
    }

    /// Nothing capturing, running or waiting.
    pub fn is_idle(&self) -> bool {
        self.capture.state() == CaptureState::Idle && self.queue.is_idle()
    }

    /// Ask the capture to stop, then stop the worker after its current job.
    pub async fn shutdown(&self, grace: Duration) {
        if let Err(e) = self.capture.stop_capture().await {
            tracing::warn!("Capture stop during shutdown failed: {e}");
        }
        if !self.capture.wait_idle(grace).await {
            tracing::warn!("Capture did not stop within {grace:?}");
        }
        self.queue.shutdown(grace).await;
    }

    /// Projects a request would write into. Invalid requests yield none and
    /// are rejected by the queue's own validation.
    fn request_projects(&self, request: &PipelineJobRequest) -> Vec<ProjectKey> {
        if request.kind.is_per_project() {
            ProjectKey::new(&request.title, &request.year)
                .into_iter()
                .collect()
        } else {
            request
                .inputs
                .iter()
                .filter_map(|input| self.store.key_for_artifact(input))
                .collect()
        }
    }
}
