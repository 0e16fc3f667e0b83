//! Data transfer objects for the orchestrator API
//!
//! Request and response payloads exchanged between the orchestrator and
//! its clients. Domain types are embedded directly where the wire shape
//! matches the persisted shape.

pub mod job;
pub mod log;
pub mod pipeline;
