//! Sluice Orchestrator
//!
//! The pipeline scheduling engine and its HTTP API. The orchestrator
//! watches a coordination store for pipelines and jobs, dispatches each
//! to a controller based on shard ownership, resolves new input commits
//! into jobs, fans datums out to worker pools and commits merged job
//! output back to the versioned filesystem.

pub mod api;
pub mod cluster;
pub mod config;
pub mod merge;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod vfs;
pub mod worker;
