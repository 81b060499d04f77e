//! Sync engine: pipeline, durable progress store and resource guard.

pub mod guard;
pub mod pipeline;
pub mod progress;

pub use guard::ResourceGuard;
pub use pipeline::{GroupSweepReport, PipelineOptions, RunSummary, SyncPipeline};
pub use progress::ProgressStore;
