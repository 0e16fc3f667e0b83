//! Execution backend.
//!
//! Pipelines run on replica groups: named sets of identical workers
//! executing one transform. The orchestrator creates a group per
//! pipeline version (and per orphan job), scales it, and attaches to it
//! to feed datums through. The local implementation runs workers as
//! tokio tasks inside the orchestrator process.

pub mod local;

use async_trait::async_trait;
use uuid::Uuid;

use sluice_core::domain::datum::Datum;
use sluice_core::domain::pipeline::Transform;

use crate::vfs::Vfs;
use crate::worker::PoolHandle;

/// Cluster error type
#[derive(Debug, Clone)]
pub enum ClusterError {
    GroupNotFound(String),
    GroupExists(String),
    TaskNotFound(String),
}

impl ClusterError {
    pub fn is_exists(&self) -> bool {
        matches!(self, ClusterError::GroupExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ClusterError::GroupNotFound(_) | ClusterError::TaskNotFound(_)
        )
    }
}

impl std::fmt::Display for ClusterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterError::GroupNotFound(name) => write!(f, "replica group {name} not found"),
            ClusterError::GroupExists(name) => write!(f, "replica group {name} already exists"),
            ClusterError::TaskNotFound(name) => write!(f, "task {name} not found"),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Replica group name for a pipeline version.
pub fn pipeline_group(prefix: &str, name: &str, version: u64) -> String {
    format!("{prefix}-pipeline-{name}-v{version}")
}

/// Replica group name for an orphan job.
pub fn job_group(prefix: &str, id: &Uuid) -> String {
    format!("{prefix}-job-{id}")
}

/// Identity stamped onto log lines written by a group's workers.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    pub pipeline: Option<String>,
    pub job: Option<Uuid>,
}

/// Runs one transform invocation over one datum and returns the files
/// it writes. The error string is the user-visible failure message.
#[async_trait]
pub trait TransformRunner: Send + Sync {
    async fn run(
        &self,
        vfs: &dyn Vfs,
        transform: &Transform,
        datum: &Datum,
    ) -> std::result::Result<Vec<(String, Vec<u8>)>, String>;
}

#[async_trait]
pub trait Cluster: Send + Sync {
    async fn create_replica_group(
        &self,
        name: &str,
        transform: &Transform,
        replicas: u64,
    ) -> Result<()>;

    async fn delete_replica_group(&self, name: &str) -> Result<()>;

    async fn set_replicas(&self, name: &str, replicas: u64) -> Result<()>;

    async fn replicas(&self, name: &str) -> Result<u64>;

    /// Number of nodes backing the cluster, the base for coefficient
    /// parallelism.
    async fn node_count(&self) -> u64;

    /// Task names of a group, sorted. Tasks outlive their workers so
    /// logs stay readable after a job finishes.
    async fn list_tasks(&self, group: &str) -> Result<Vec<String>>;

    /// Raw log bytes of one task, newline-delimited JSON.
    async fn task_logs(&self, task: &str) -> Result<Vec<u8>>;

    /// Connects to a group for one job run, spawning its workers.
    async fn attach(&self, group: &str, ctx: TaskContext) -> Result<PoolHandle>;
}
