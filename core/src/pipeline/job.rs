//! Pipeline job records.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::Operation;
use crate::project::ProjectKey;

/// Opaque job handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Merge raw parts, upscale, export.
    MergeAndExport,
    /// Export one upscaled artifact.
    ExportOnly,
    /// Export every upscaled, not-yet-exported artifact.
    ExportAll,
    /// Upscale an existing merged artifact; export only with `capture.auto_export`.
    Postprocess,
    /// Render cover art from a frame of the upscaled artifact into the library.
    Cover,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::MergeAndExport => "merge_and_export",
            JobKind::ExportOnly => "export_only",
            JobKind::ExportAll => "export_all",
            JobKind::Postprocess => "postprocess",
            JobKind::Cover => "cover",
        }
    }

    /// Operation tag for the job's started/finished events.
    pub fn operation(self) -> Operation {
        match self {
            JobKind::MergeAndExport => Operation::Merge,
            JobKind::ExportOnly | JobKind::ExportAll => Operation::Export,
            JobKind::Postprocess => Operation::Upscale,
            JobKind::Cover => Operation::Cover,
        }
    }

    /// Kinds bound to the request's own title and year.
    pub fn is_per_project(self) -> bool {
        !matches!(self, JobKind::ExportAll)
    }

    /// Kinds that operate on exactly one input artifact.
    pub fn takes_single_input(self) -> bool {
        matches!(self, JobKind::ExportOnly | JobKind::Postprocess | JobKind::Cover)
    }

    pub fn upscales(self) -> bool {
        matches!(self, JobKind::MergeAndExport | JobKind::Postprocess)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What a caller submits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineJobRequest {
    pub kind: JobKind,
    pub inputs: Vec<PathBuf>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub year: String,
    /// Upscaling profile name; the configured default when absent.
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub skip_existing: bool,
    #[serde(default)]
    pub overwrite: bool,
}

impl PipelineJobRequest {
    pub fn new(kind: JobKind, inputs: Vec<PathBuf>, title: &str, year: &str) -> Self {
        Self {
            kind,
            inputs,
            title: title.to_string(),
            year: year.to_string(),
            profile: None,
            skip_existing: false,
            overwrite: false,
        }
    }
}

/// Per-item totals of an export-all run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportCounts {
    pub attempted: usize,
    pub skipped: usize,
    pub exported: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineJob {
    pub id: JobId,
    pub kind: JobKind,
    pub inputs: Vec<PathBuf>,
    pub title: String,
    pub year: String,
    /// Every project this job writes into.
    pub projects: Vec<ProjectKey>,
    pub profile: Option<String>,
    pub skip_existing: bool,
    pub overwrite: bool,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counts: Option<ExportCounts>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineJob {
    pub(crate) fn pending(
        request: PipelineJobRequest,
        projects: Vec<ProjectKey>,
        profile: Option<String>,
    ) -> Self {
        Self {
            id: JobId::new(),
            kind: request.kind,
            inputs: request.inputs,
            title: request.title.trim().to_string(),
            year: request.year.trim().to_string(),
            projects,
            profile,
            skip_existing: request.skip_existing,
            overwrite: request.overwrite,
            status: JobStatus::Pending,
            progress: 0,
            message: "queued".to_string(),
            error: None,
            counts: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn references(&self, key: &ProjectKey) -> bool {
        self.projects.contains(key)
    }
}
