//! Job DTOs for the orchestrator API

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::input::Input;
use crate::domain::job::JobInfo;
use crate::domain::pipeline::{Egress, ParallelismSpec, Transform};

/// Request to create a job.
///
/// Naming a pipeline creates a job under it, inheriting the pipeline's
/// transform, parallelism, output and egress; the remaining fields are
/// ignored. Orphan jobs leave `pipeline` unset and must carry their own
/// transform and output repo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    #[serde(default)]
    pub pipeline: Option<String>,
    pub input: Input,
    #[serde(default)]
    pub transform: Option<Transform>,
    #[serde(default)]
    pub parallelism: Option<ParallelismSpec>,
    #[serde(default)]
    pub output_repo: Option<String>,
    #[serde(default)]
    pub output_branch: Option<String>,
    #[serde(default)]
    pub egress: Option<Egress>,
    #[serde(default)]
    pub parent: Option<Uuid>,
}

/// Query options for job inspection
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct InspectJobQuery {
    /// Wait until the job reaches a terminal state before responding.
    #[serde(default)]
    pub block: bool,
}

/// Query options for job listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListJobQuery {
    /// Restrict to jobs created by this pipeline.
    #[serde(default)]
    pub pipeline: Option<String>,
}

/// Response to a job listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobList {
    pub jobs: Vec<JobInfo>,
}

/// Request to re-process datums of a running job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartDatumRequest {
    /// Paths that must all appear in a datum for it to be restarted.
    #[serde(default)]
    pub data_filters: Vec<String>,
}
