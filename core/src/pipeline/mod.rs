//! Post-capture pipeline: merge, upscale, export and cover jobs run by a
//! single background worker.

pub mod job;
pub mod queue;
pub mod stages;

pub use job::{
    ExportCounts, JobId, JobKind, JobStatus, PipelineJob, PipelineJobRequest,
};
pub use queue::{JobQueue, QueueError, QueueSnapshot};
pub use stages::{
    ExportOptions, FfmpegStages, ProgressSink, Stage, StageError, StageExecutor, StageProgress,
};
