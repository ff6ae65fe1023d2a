// Aggregates all former standalone integration tests as modules.
mod capture_lifecycle;
mod pipeline_queue;
mod support;
