//! Single-worker pipeline job queue.
//!
//! Jobs wait in FIFO order and one background worker runs them, one stage
//! chain at a time. Job state sits behind a short-lived `std::sync::Mutex` so
//! snapshot queries never wait on a running stage, and the worker can update
//! progress from inside synchronous tool-output callbacks.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::events::EventBus;
use crate::payload;
use crate::progress::map_into_range;
use crate::project::{ProjectKey, ProjectStore};

use super::job::{ExportCounts, JobId, JobKind, JobStatus, PipelineJob, PipelineJobRequest};
use super::stages::{
    ExportOptions, Stage, StageError, StageExecutor, StageProgress, copy_single_input,
    ensure_artifact,
};

const MERGE_END: u8 = 25;
const UPSCALE_END: u8 = 90;
const UPSCALED: u8 = 95;
const FRAME_EXTRACTED: u8 = 20;
const COVER_RENDERED: u8 = 90;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("job not found: {id}")]
    JobNotFound { id: String },

    #[error("job {id} is {status}, only pending jobs can be removed")]
    JobNotPending { id: String, status: JobStatus },

    #[error("queue is shutting down")]
    ShuttingDown,
}

fn invalid(reason: impl Into<String>) -> QueueError {
    QueueError::InvalidRequest {
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub current: Option<PipelineJob>,
    pub pending: Vec<PipelineJob>,
    pub history: Vec<PipelineJob>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PipelineJob>,
    current: Option<PipelineJob>,
    history: VecDeque<PipelineJob>,
    closed: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Notify,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    config: Arc<AppConfig>,
    store: ProjectStore,
    events: EventBus,
    executor: Arc<dyn StageExecutor>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct JobQueue {
    shared: Arc<Shared>,
}

impl JobQueue {
    pub fn new(
        config: Arc<AppConfig>,
        store: ProjectStore,
        events: EventBus,
        executor: Arc<dyn StageExecutor>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                wake: Notify::new(),
                cancel: CancellationToken::new(),
                worker: Mutex::new(None),
                config,
                store,
                events,
                executor,
            }),
        }
    }

    /// Spawn the worker. Calling it again is a no-op.
    pub fn start(&self) {
        let mut worker = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *worker = Some(tokio::spawn(run_worker(shared)));
    }

    /// Validate and append a job; returns without waiting for it to run.
    pub fn enqueue(&self, request: PipelineJobRequest) -> Result<JobId, QueueError> {
        let job = self.prepare(request)?;
        let id = job.id;
        {
            let mut state = self.shared.state();
            if state.closed {
                return Err(QueueError::ShuttingDown);
            }
            tracing::info!(
                "Queued {} job {id} ({} inputs, {} ahead)",
                job.kind,
                job.inputs.len(),
                state.pending.len() + usize::from(state.current.is_some())
            );
            state.pending.push_back(job);
        }
        self.shared.wake.notify_one();
        Ok(id)
    }

    pub fn current_job(&self) -> Option<PipelineJob> {
        self.shared.state().current.clone()
    }

    pub fn pending_jobs(&self) -> Vec<PipelineJob> {
        self.shared.state().pending.iter().cloned().collect()
    }

    pub fn history(&self) -> Vec<PipelineJob> {
        self.shared.state().history.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.shared.state();
        QueueSnapshot {
            current: state.current.clone(),
            pending: state.pending.iter().cloned().collect(),
            history: state.history.iter().cloned().collect(),
        }
    }

    /// Look a job up wherever it currently is.
    pub fn job(&self, id: JobId) -> Option<PipelineJob> {
        let state = self.shared.state();
        state
            .current
            .iter()
            .chain(state.pending.iter())
            .chain(state.history.iter())
            .find(|job| job.id == id)
            .cloned()
    }

    /// Drop a job that has not started yet.
    pub fn remove_pending(&self, id: JobId) -> Result<PipelineJob, QueueError> {
        let mut state = self.shared.state();
        if let Some(pos) = state.pending.iter().position(|job| job.id == id) {
            if let Some(job) = state.pending.remove(pos) {
                tracing::info!("Removed pending {} job {id}", job.kind);
                return Ok(job);
            }
        }
        let status = state
            .current
            .iter()
            .chain(state.history.iter())
            .find(|job| job.id == id)
            .map(|job| job.status);
        match status {
            Some(status) => Err(QueueError::JobNotPending {
                id: id.to_string(),
                status,
            }),
            None => Err(QueueError::JobNotFound { id: id.to_string() }),
        }
    }

    /// True when the running job or any pending job writes into `key`.
    pub fn references_project(&self, key: &ProjectKey) -> bool {
        let state = self.shared.state();
        state
            .current
            .iter()
            .chain(state.pending.iter())
            .any(|job| job.references(key))
    }

    pub fn is_idle(&self) -> bool {
        let state = self.shared.state();
        state.current.is_none() && state.pending.is_empty()
    }

    /// Stop accepting work and let the worker finish its current job,
    /// waiting at most `grace`. Pending jobs stay pending.
    pub async fn shutdown(&self, grace: Duration) {
        self.shared.state().closed = true;
        self.shared.cancel.cancel();
        let handle = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut handle) = handle else {
            return;
        };
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            tracing::warn!("Pipeline worker still busy after {grace:?}, aborting it");
            handle.abort();
        }
    }

    fn prepare(&self, request: PipelineJobRequest) -> Result<PipelineJob, QueueError> {
        if request.inputs.is_empty() {
            return Err(invalid("inputs must not be empty"));
        }

        let projects = if request.kind.is_per_project() {
            let key = ProjectKey::new(&request.title, &request.year)
                .map_err(|e| invalid(e.reason))?;
            vec![key]
        } else {
            let mut keys = Vec::new();
            for input in &request.inputs {
                let key = self.shared.store.key_for_artifact(input).ok_or_else(|| {
                    invalid(format!(
                        "{} is not inside a 'Title (Year)' project",
                        input.display()
                    ))
                })?;
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
            keys
        };

        if request.kind.takes_single_input() && request.inputs.len() != 1 {
            return Err(invalid(format!(
                "{} takes exactly one input, got {}",
                request.kind,
                request.inputs.len()
            )));
        }

        let profile = if request.kind.upscales() {
            let (name, _) = self
                .shared
                .config
                .profile(request.profile.as_deref())
                .ok_or_else(|| {
                    invalid(format!(
                        "unknown upscaling profile '{}'",
                        request.profile.as_deref().unwrap_or_default()
                    ))
                })?;
            Some(name)
        } else {
            None
        };

        Ok(PipelineJob::pending(request, projects, profile))
    }
}

async fn run_worker(shared: Arc<Shared>) {
    tracing::debug!("Pipeline worker started");
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        let next = {
            let mut state = shared.state();
            match state.pending.pop_front() {
                Some(mut job) => {
                    job.status = JobStatus::Running;
                    job.started_at = Some(Utc::now());
                    job.message = "starting".to_string();
                    state.current = Some(job.clone());
                    Some(job)
                }
                None => None,
            }
        };

        match next {
            Some(job) => run_job(&shared, job).await,
            None => {
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    _ = shared.wake.notified() => {}
                }
            }
        }
    }
    tracing::debug!("Pipeline worker stopped");
}

/// What a successful stage chain reports.
struct Outcome {
    message: String,
    counts: Option<ExportCounts>,
}

async fn run_job(shared: &Shared, job: PipelineJob) {
    let operation = job.kind.operation();
    tracing::info!("Running {} job {}", job.kind, job.id);
    shared.events.status(
        operation,
        &format!("{}_started", job.kind),
        job_fields(&job),
    );

    let reporter = Reporter { shared, id: job.id };
    let result = match job.kind {
        JobKind::MergeAndExport => merge_and_export(shared, &reporter, &job).await,
        JobKind::ExportOnly => export_only(shared, &reporter, &job).await,
        JobKind::ExportAll => export_all(shared, &reporter, &job).await,
        JobKind::Postprocess => postprocess(shared, &reporter, &job).await,
        JobKind::Cover => cover(shared, &reporter, &job).await,
    };

    let finished = {
        let mut state = shared.state();
        let Some(mut done) = state.current.take() else {
            return;
        };
        done.finished_at = Some(Utc::now());
        match result {
            Ok(outcome) => {
                let failed = outcome.counts.is_some_and(|c| c.failed > 0);
                done.counts = outcome.counts;
                if failed {
                    done.status = JobStatus::Failed;
                    done.error = Some(outcome.message.clone());
                } else {
                    done.status = JobStatus::Completed;
                    done.progress = 100;
                }
                done.message = outcome.message;
            }
            Err(e) => {
                done.status = JobStatus::Failed;
                done.error = Some(e.to_string());
                done.message = format!("failed: {e}");
            }
        }
        state.history.push_back(done.clone());
        while state.history.len() > shared.config.queue.history_limit {
            state.history.pop_front();
        }
        done
    };

    match &finished.error {
        Some(error) => tracing::warn!("{} job {} failed: {error}", finished.kind, finished.id),
        None => tracing::info!("{} job {} completed", finished.kind, finished.id),
    }

    let mut fields = job_fields(&finished);
    fields.insert("result".to_string(), finished.status.to_string().into());
    fields.insert("message".to_string(), finished.message.clone().into());
    if let Some(error) = &finished.error {
        fields.insert("error".to_string(), error.clone().into());
    }
    if let Some(counts) = finished.counts {
        fields.insert("attempted".to_string(), counts.attempted.into());
        fields.insert("skipped".to_string(), counts.skipped.into());
        fields.insert("exported".to_string(), counts.exported.into());
        fields.insert("failed".to_string(), counts.failed.into());
    }
    shared
        .events
        .status(operation, &format!("{}_finished", finished.kind), fields);
}

fn job_fields(job: &PipelineJob) -> serde_json::Map<String, serde_json::Value> {
    payload! {
        "job_id" => job.id.to_string(),
        "kind" => job.kind,
        "title" => job.title,
        "year" => job.year,
    }
}

/// Writes progress into the running job and onto the event bus.
struct Reporter<'a> {
    shared: &'a Shared,
    id: JobId,
}

impl Reporter<'_> {
    /// Record overall progress; never moves backwards.
    fn progress(&self, stage: Stage, overall: u8, message: &str) {
        let changed = {
            let mut state = self.shared.state();
            match state.current.as_mut().filter(|job| job.id == self.id) {
                Some(job) if overall > job.progress || job.message != message => {
                    let moved = overall > job.progress;
                    job.progress = job.progress.max(overall);
                    job.message = message.to_string();
                    moved.then_some(job.progress)
                }
                _ => None,
            }
        };
        if let Some(progress) = changed {
            self.shared.events.progress(
                stage.operation(),
                progress,
                payload! {
                    "job_id" => self.id.to_string(),
                    "stage" => stage,
                    "message" => message,
                },
            );
        }
    }

    fn status(&self, stage: Stage, status: &str) {
        self.shared.events.status(
            stage.operation(),
            status,
            payload! { "job_id" => self.id.to_string(), "stage" => stage },
        );
    }

    fn log(&self, stage: Stage, line: &str) {
        self.shared.events.log(
            stage.operation(),
            line,
            payload! { "job_id" => self.id.to_string(), "stage" => stage },
        );
    }

    /// Adapter for a stage running inside `start..=end` of the job.
    fn sink(&self, stage: Stage, start: u8, end: u8) -> impl Fn(StageProgress) + Send + Sync + '_ {
        move |p| match p {
            StageProgress::Percent(pct) => {
                self.progress(stage, map_into_range(pct, start, end), stage.as_str())
            }
            StageProgress::Running => self.status(stage, "running"),
            StageProgress::Log(line) => self.log(stage, &line),
        }
    }
}

fn job_key(job: &PipelineJob) -> Result<ProjectKey, StageError> {
    job.projects
        .first()
        .cloned()
        .ok_or_else(|| StageError::failed(Stage::Merge, "job has no project"))
}

fn first_input(job: &PipelineJob, stage: Stage) -> Result<&Path, StageError> {
    job.inputs
        .first()
        .map(PathBuf::as_path)
        .ok_or_else(|| StageError::failed(stage, "job has no inputs"))
}

async fn run_merge(
    shared: &Shared,
    reporter: &Reporter<'_>,
    job: &PipelineJob,
    key: &ProjectKey,
) -> Result<PathBuf, StageError> {
    let first = first_input(job, Stage::Merge)?;
    let extension = first
        .extension()
        .and_then(OsStr::to_str)
        .unwrap_or("avi")
        .to_lowercase();
    shared.store.ensure_lowres_dir(key)?;
    let merged = shared.store.merged_path(key, &extension);

    reporter.progress(Stage::Merge, 0, "merging");
    if job.inputs.len() == 1 {
        copy_single_input(first, &merged).await?;
    } else {
        let sink = reporter.sink(Stage::Merge, 0, MERGE_END);
        shared.executor.merge(&job.inputs, &merged, &sink).await?;
    }
    ensure_artifact(Stage::Merge, &merged).await?;
    reporter.progress(Stage::Merge, MERGE_END, "merged");
    Ok(merged)
}

async fn run_upscale(
    shared: &Shared,
    reporter: &Reporter<'_>,
    job: &PipelineJob,
    key: &ProjectKey,
    input: &Path,
) -> Result<PathBuf, StageError> {
    let (name, profile) = shared
        .config
        .profile(job.profile.as_deref())
        .ok_or_else(|| StageError::failed(Stage::Upscale, "upscaling profile disappeared"))?;
    tokio::fs::create_dir_all(shared.store.highres_dir(key)).await?;
    let output = shared.store.upscaled_path(key);

    tracing::info!("Upscaling {} with profile {name}", input.display());
    reporter.progress(Stage::Upscale, MERGE_END, "upscaling");
    let sink = reporter.sink(Stage::Upscale, MERGE_END, UPSCALE_END);
    shared
        .executor
        .upscale(input, &output, profile, &sink)
        .await?;
    ensure_artifact(Stage::Upscale, &output).await?;
    reporter.progress(Stage::Upscale, UPSCALED, "upscaled");
    Ok(output)
}

/// Export one artifact; `Ok(false)` means an identical copy was already there.
async fn run_export(
    shared: &Shared,
    key: &ProjectKey,
    artifact: &Path,
    options: ExportOptions,
) -> Result<bool, StageError> {
    let destination = shared.store.export_path_for(key, artifact);
    match shared
        .executor
        .export(artifact, &destination, options)
        .await
    {
        Ok(_) => Ok(true),
        Err(StageError::AlreadyExported { path }) => {
            tracing::info!("Skipping export, {} is already up to date", path.display());
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

fn export_options(job: &PipelineJob) -> ExportOptions {
    ExportOptions {
        skip_existing: job.skip_existing,
        overwrite: job.overwrite,
    }
}

async fn merge_and_export(
    shared: &Shared,
    reporter: &Reporter<'_>,
    job: &PipelineJob,
) -> Result<Outcome, StageError> {
    let key = job_key(job)?;
    let merged = run_merge(shared, reporter, job, &key).await?;
    let upscaled = run_upscale(shared, reporter, job, &key, &merged).await?;
    let exported = run_export(shared, &key, &upscaled, export_options(job)).await?;
    reporter.progress(Stage::Export, 100, "exported");
    Ok(Outcome {
        message: if exported {
            format!("{key} exported")
        } else {
            format!("{key} already exported")
        },
        counts: None,
    })
}

async fn postprocess(
    shared: &Shared,
    reporter: &Reporter<'_>,
    job: &PipelineJob,
) -> Result<Outcome, StageError> {
    let key = job_key(job)?;
    let input = first_input(job, Stage::Upscale)?;
    let upscaled = run_upscale(shared, reporter, job, &key, input).await?;
    if !shared.config.capture.auto_export {
        return Ok(Outcome {
            message: format!("{key} upscaled"),
            counts: None,
        });
    }
    let options = ExportOptions {
        skip_existing: true,
        overwrite: job.overwrite,
    };
    run_export(shared, &key, &upscaled, options).await?;
    reporter.progress(Stage::Export, 100, "exported");
    Ok(Outcome {
        message: format!("{key} upscaled and exported"),
        counts: None,
    })
}

async fn export_only(
    shared: &Shared,
    reporter: &Reporter<'_>,
    job: &PipelineJob,
) -> Result<Outcome, StageError> {
    let key = job_key(job)?;
    let artifact = first_input(job, Stage::Export)?;
    reporter.progress(Stage::Export, 0, "exporting");
    let exported = run_export(shared, &key, artifact, export_options(job)).await?;
    reporter.progress(Stage::Export, 100, "exported");
    Ok(Outcome {
        message: if exported {
            format!("{key} exported")
        } else {
            format!("{key} already exported")
        },
        counts: None,
    })
}

/// Every item is attempted; failures are counted, not fatal.
async fn export_all(
    shared: &Shared,
    reporter: &Reporter<'_>,
    job: &PipelineJob,
) -> Result<Outcome, StageError> {
    let total = job.inputs.len();
    let mut counts = ExportCounts::default();
    let options = ExportOptions {
        skip_existing: true,
        overwrite: false,
    };

    for (done, artifact) in job.inputs.iter().enumerate() {
        counts.attempted += 1;
        let result = match shared.store.key_for_artifact(artifact) {
            Some(key) => run_export(shared, &key, artifact, options).await,
            None => Err(StageError::failed(
                Stage::Export,
                format!("{} has no project", artifact.display()),
            )),
        };
        match result {
            Ok(true) => counts.exported += 1,
            Ok(false) => counts.skipped += 1,
            Err(e) => {
                counts.failed += 1;
                tracing::warn!("Export of {} failed: {e}", artifact.display());
                reporter.log(Stage::Export, &format!("{}: {e}", artifact.display()));
            }
        }
        let pct = ((done + 1) * 100 / total.max(1)) as u8;
        reporter.progress(
            Stage::Export,
            pct,
            &format!("exported {} of {total}", done + 1),
        );
    }

    let message = if counts.failed > 0 {
        format!("{} of {} exports failed", counts.failed, counts.attempted)
    } else {
        format!(
            "{} exported, {} already up to date",
            counts.exported, counts.skipped
        )
    };
    Ok(Outcome {
        message,
        counts: Some(counts),
    })
}

/// Cover art for one upscaled video, rendered in a scratch directory and
/// copied next to the library export.
async fn cover(
    shared: &Shared,
    reporter: &Reporter<'_>,
    job: &PipelineJob,
) -> Result<Outcome, StageError> {
    let key = job_key(job)?;
    let video = first_input(job, Stage::Cover)?;
    let work_dir = shared
        .store
        .highres_dir(&key)
        .join(format!(".cover-{}", Uuid::new_v4()));
    tokio::fs::create_dir_all(&work_dir).await?;

    let result = render_cover(shared, reporter, &key, video, &work_dir).await;
    if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
        tracing::debug!("Could not remove {}: {e}", work_dir.display());
    }
    let destination = result?;
    Ok(Outcome {
        message: format!("cover for {key} written to {}", destination.display()),
        counts: None,
    })
}

async fn render_cover(
    shared: &Shared,
    reporter: &Reporter<'_>,
    key: &ProjectKey,
    video: &Path,
    work_dir: &Path,
) -> Result<PathBuf, StageError> {
    let settings = &shared.config.cover;

    reporter.progress(Stage::Cover, 0, "extracting frame");
    let frame = work_dir.join("frame.jpg");
    shared
        .executor
        .extract_frame(video, settings.frame_at_secs, &frame)
        .await?;
    ensure_artifact(Stage::Cover, &frame).await?;
    reporter.progress(Stage::Cover, FRAME_EXTRACTED, "rendering cover");

    let extension = Path::new(&settings.file_name)
        .extension()
        .and_then(OsStr::to_str)
        .unwrap_or("jpg");
    let rendered = work_dir.join(format!("cover.{extension}"));
    let sink = reporter.sink(Stage::Cover, FRAME_EXTRACTED, COVER_RENDERED);
    shared
        .executor
        .generate_cover(&frame, &rendered, key, &sink)
        .await?;
    ensure_artifact(Stage::Cover, &rendered).await?;
    reporter.progress(Stage::Cover, COVER_RENDERED, "cover rendered");

    let destination = shared.store.cover_path(key, &settings.file_name);
    let options = ExportOptions {
        skip_existing: false,
        overwrite: settings.overwrite,
    };
    shared
        .executor
        .export(&rendered, &destination, options)
        .await?;
    reporter.progress(Stage::Cover, 100, "cover written");
    Ok(destination)
}
