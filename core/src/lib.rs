//! Capture and post-processing engine for tape digitization.
//!
//! A single [`capture::CaptureManager`] records raw parts from the capture
//! device, a single-worker [`pipeline::JobQueue`] merges, upscales and
//! exports them, and everything is reported through the
//! [`events::EventBus`]. [`orchestrator::Orchestrator`] is the entry point
//! that ties them together.

pub mod capture;
pub mod config;
pub mod events;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod project;
pub mod storage;
pub mod tool;

pub use orchestrator::{Orchestrator, OrchestratorError};
