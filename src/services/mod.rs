//! Services layer - orchestration logic
//!
//! This module coordinates between domain logic and infrastructure.
//! Services use infrastructure adapters to perform I/O operations.

pub mod job_tracker;
pub mod orchestrator;
pub mod reconciler;
pub mod status;

// Re-export commonly used types
pub use job_tracker::JobTracker;
pub use orchestrator::Orchestrator;
pub use reconciler::Reconciler;
pub use status::StatusAggregator;
