//! Pipeline DTOs for the orchestrator API

use serde::{Deserialize, Serialize};

use crate::domain::input::Input;
use crate::domain::pipeline::{Egress, ParallelismSpec, PipelineInfo, Transform};

/// Request to create a new pipeline, or update one with `update` set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePipelineRequest {
    pub name: String,
    pub transform: Transform,
    #[serde(default)]
    pub parallelism: Option<ParallelismSpec>,
    pub input: Input,
    #[serde(default)]
    pub output_branch: Option<String>,
    #[serde(default)]
    pub egress: Option<Egress>,
    #[serde(default)]
    pub scale_down_threshold: Option<u64>,
    /// Replace an existing pipeline's definition, bumping its version.
    #[serde(default)]
    pub update: bool,
}

/// Response to a pipeline listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineList {
    pub pipelines: Vec<PipelineInfo>,
}

/// Query options for pipeline deletion
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeletePipelineQuery {
    /// Delete the pipeline's jobs too instead of just stopping them.
    #[serde(default)]
    pub delete_jobs: bool,
}
