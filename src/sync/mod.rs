//! Catalog synchronization: id list then batched records, per entity kind.

pub mod orchestrator;
pub mod pipeline;
pub mod queue;

pub use orchestrator::SyncOrchestrator;
pub use pipeline::{Catalog, PipelinePhase, SyncContext, SyncContinuation, SyncPipeline, SyncSettings};
pub use queue::{PendingIdQueue, RetryBudget};
