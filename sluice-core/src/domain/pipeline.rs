//! Pipeline domain types

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::input::Input;
use crate::domain::job::JobState;

/// Pipeline definition and live status.
///
/// Persisted by the orchestrator; the id stays fixed for the lifetime of
/// the pipeline while `version` is bumped on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub id: Uuid,
    pub name: String,
    pub version: u64,
    pub transform: Transform,
    #[serde(default)]
    pub parallelism: ParallelismSpec,
    pub input: Input,
    pub output_branch: String,
    #[serde(default)]
    pub egress: Option<Egress>,
    /// Seconds of idleness before the pipeline's workers are scaled to
    /// zero. `None` disables scale-down.
    #[serde(default)]
    pub scale_down_threshold: Option<u64>,
    pub state: PipelineState,
    #[serde(default)]
    pub job_counts: JobCounts,
    pub stopped: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Pipeline lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    /// Created, controller has not taken over yet.
    Starting,
    /// Controller active, jobs may be scheduled.
    Running,
    /// Controller hit an error and is being re-activated.
    Restarting,
    /// Paused by a user, no new jobs.
    Stopped,
    /// Terminally broken, needs a user update to recover.
    Failure,
}

impl PipelineState {
    /// States excluded from controller dispatch.
    pub fn is_stopped(self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Failure)
    }
}

/// The command a worker runs over each datum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transform {
    pub image: String,
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// How many workers a pipeline or job wants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelismSpec {
    /// A fixed replica count. Zero means one.
    Constant(u64),
    /// A multiple of the cluster's node count, rounded up.
    Coefficient(f64),
}

impl ParallelismSpec {
    pub fn target_replicas(&self, cluster_nodes: u64) -> u64 {
        match *self {
            ParallelismSpec::Constant(0) => 1,
            ParallelismSpec::Constant(n) => n,
            ParallelismSpec::Coefficient(c) => (c * cluster_nodes as f64).ceil().max(1.0) as u64,
        }
    }
}

impl Default for ParallelismSpec {
    fn default() -> Self {
        ParallelismSpec::Constant(1)
    }
}

/// Destination the output commit is pushed to after a job succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Egress {
    pub url: String,
}

/// Per-state job tallies kept on the pipeline row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub starting: u64,
    pub running: u64,
    pub success: u64,
    pub failure: u64,
    pub stopped: u64,
}

impl JobCounts {
    pub fn increment(&mut self, state: JobState) {
        *self.slot(state) += 1;
    }

    /// Saturating so a missed increment can never underflow the tally.
    pub fn decrement(&mut self, state: JobState) {
        let slot = self.slot(state);
        *slot = slot.saturating_sub(1);
    }

    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Starting => self.starting,
            JobState::Running => self.running,
            JobState::Success => self.success,
            JobState::Failure => self.failure,
            JobState::Stopped => self.stopped,
        }
    }

    fn slot(&mut self, state: JobState) -> &mut u64 {
        match state {
            JobState::Starting => &mut self.starting,
            JobState::Running => &mut self.running,
            JobState::Success => &mut self.success,
            JobState::Failure => &mut self.failure,
            JobState::Stopped => &mut self.stopped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallelism_target_replicas() {
        assert_eq!(ParallelismSpec::Constant(0).target_replicas(4), 1);
        assert_eq!(ParallelismSpec::Constant(3).target_replicas(4), 3);
        assert_eq!(ParallelismSpec::Coefficient(0.5).target_replicas(4), 2);
        assert_eq!(ParallelismSpec::Coefficient(1.5).target_replicas(3), 5);
        assert_eq!(ParallelismSpec::Coefficient(0.1).target_replicas(1), 1);
    }

    #[test]
    fn test_job_counts_track_transitions() {
        let mut counts = JobCounts::default();
        counts.increment(JobState::Starting);
        counts.increment(JobState::Starting);
        counts.decrement(JobState::Starting);
        counts.increment(JobState::Running);
        assert_eq!(counts.get(JobState::Starting), 1);
        assert_eq!(counts.get(JobState::Running), 1);
        // decrement never wraps
        counts.decrement(JobState::Failure);
        assert_eq!(counts.get(JobState::Failure), 0);
    }

    #[test]
    fn test_stopped_states() {
        assert!(!PipelineState::Running.is_stopped());
        assert!(!PipelineState::Restarting.is_stopped());
        assert!(PipelineState::Stopped.is_stopped());
        assert!(PipelineState::Failure.is_stopped());
    }
}
