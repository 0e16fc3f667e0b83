//! Job domain types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::commit::Commit;
use crate::domain::input::Input;
use crate::domain::pipeline::{Egress, ParallelismSpec, Transform};

/// Job execution record
///
/// One run of a transform over a resolved input snapshot. Jobs created by
/// a pipeline controller carry a [`PipelineRef`]; orphan jobs stand alone
/// and own their output repo and worker group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: Uuid,
    #[serde(default)]
    pub pipeline: Option<PipelineRef>,
    /// Previously created job of the same pipeline; output is committed
    /// only after the parent reaches a terminal state.
    #[serde(default)]
    pub parent: Option<Uuid>,
    pub input: Input,
    pub output_repo: String,
    pub output_branch: String,
    pub transform: Transform,
    #[serde(default)]
    pub parallelism: ParallelismSpec,
    #[serde(default)]
    pub egress: Option<Egress>,
    pub state: JobState,
    pub stopped: bool,
    /// Times the whole job was re-run after an unexpected error.
    pub restart: u64,
    pub datums_processed: u64,
    pub datums_total: u64,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub output_commit: Option<Commit>,
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Created, waiting for a controller and possibly a parent job.
    Starting,
    /// Datums are being distributed to workers.
    Running,
    /// All datums processed and the output commit recorded.
    Success,
    /// A datum ran out of retries or the input was unusable.
    Failure,
    /// Stopped by a user before completion.
    Stopped,
}

impl JobState {
    /// Terminal states never transition again and are excluded from
    /// controller dispatch.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failure | JobState::Stopped
        )
    }
}

/// Reference from a job back to the pipeline that created it.
///
/// The version pins which revision of the pipeline the job's
/// transform and input snapshot were copied from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRef {
    pub id: Uuid,
    pub name: String,
    pub version: u64,
}
