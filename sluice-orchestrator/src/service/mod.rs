//! Service Module
//!
//! Request-level logic sitting between the API handlers and the store.
//! Services validate requests, maintain the persisted rows the
//! scheduler's controllers react to, and read logs back out of the
//! cluster.

pub mod job;
pub mod log;
pub mod pipeline;

// Re-export for convenience
pub use job as job_service;
pub use log as log_service;
pub use pipeline as pipeline_service;
