//! Sluice Core
//!
//! Core types and abstractions for the Sluice pipeline system.
//!
//! This crate contains:
//! - Domain types: Core business entities (Pipeline, Job, Input, Datum, etc.)
//! - DTOs: Data transfer objects for the orchestrator API
//! - Glob: Path pattern matching used for datum enumeration

pub mod domain;
pub mod dto;
pub mod glob;
