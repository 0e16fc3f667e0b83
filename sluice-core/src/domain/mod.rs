//! Core domain types
//!
//! The entities the whole system revolves around: pipelines, jobs,
//! inputs, datums, commits and log lines. The orchestrator persists and
//! schedules these; clients read and write them over the API.

pub mod commit;
pub mod datum;
pub mod input;
pub mod job;
pub mod log;
pub mod pipeline;
