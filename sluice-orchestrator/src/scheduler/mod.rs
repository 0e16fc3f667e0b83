//! Controller scheduling.
//!
//! Pipelines and jobs are spread over shards by hashing their key. Each
//! shard held by this process runs two dispatch loops, one over the
//! live-pipeline watch and one over the live-job watch, keeping exactly
//! one controller task per live row. Dropping a shard cancels its
//! controllers; re-adding it replays the watch snapshot and brings them
//! back, which is also how crash recovery works.

pub mod branchset;
pub mod datum;
pub mod job;
pub mod pipeline;
pub mod retry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sluice_core::domain::pipeline::PipelineInfo;

use crate::cluster::Cluster;
use crate::config::Config;
use crate::store::{Store, StoreError, WatchEvent, INDEX_STOPPED, JOBS, PIPELINES};
use crate::vfs::Vfs;
use crate::worker::PoolControl;

use retry::{retry_forever, Backoff};

/// Shard error type
#[derive(Debug, Clone)]
pub enum ShardError {
    AlreadyHeld(u64),
    NotHeld(u64),
    OutOfRange { shard: u64, count: u64 },
}

impl std::fmt::Display for ShardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardError::AlreadyHeld(shard) => write!(f, "shard {shard} already held"),
            ShardError::NotHeld(shard) => write!(f, "shard {shard} not held"),
            ShardError::OutOfRange { shard, count } => {
                write!(f, "shard {shard} out of range for {count} shards")
            }
        }
    }
}

/// Everything that can knock a controller attempt over. Controllers
/// report these through their retry loop and start a fresh attempt.
#[derive(Debug)]
pub(crate) enum ControllerError {
    Store(StoreError),
    Vfs(crate::vfs::VfsError),
    Cluster(crate::cluster::ClusterError),
    Merge(crate::merge::MergeError),
    Internal(String),
}

impl std::fmt::Display for ControllerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerError::Store(err) => write!(f, "store: {err}"),
            ControllerError::Vfs(err) => write!(f, "filesystem: {err}"),
            ControllerError::Cluster(err) => write!(f, "cluster: {err}"),
            ControllerError::Merge(err) => write!(f, "merge: {err}"),
            ControllerError::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<StoreError> for ControllerError {
    fn from(err: StoreError) -> Self {
        ControllerError::Store(err)
    }
}

impl From<crate::vfs::VfsError> for ControllerError {
    fn from(err: crate::vfs::VfsError) -> Self {
        ControllerError::Vfs(err)
    }
}

impl From<crate::cluster::ClusterError> for ControllerError {
    fn from(err: crate::cluster::ClusterError) -> Self {
        ControllerError::Cluster(err)
    }
}

impl From<crate::merge::MergeError> for ControllerError {
    fn from(err: crate::merge::MergeError) -> Self {
        ControllerError::Merge(err)
    }
}

struct PipelineGuard {
    token: CancellationToken,
    generation: u64,
    version: u64,
}

struct JobGuard {
    token: CancellationToken,
    generation: u64,
}

struct Inner {
    store: Store,
    vfs: Arc<dyn Vfs>,
    cluster: Arc<dyn Cluster>,
    config: Config,
    shards: Mutex<HashMap<u64, CancellationToken>>,
    pipelines: Mutex<HashMap<String, PipelineGuard>>,
    jobs: Mutex<HashMap<Uuid, JobGuard>>,
    job_pools: Mutex<HashMap<Uuid, broadcast::Sender<PoolControl>>>,
    generation: AtomicU64,
}

/// Shared handle to the scheduling state. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        vfs: Arc<dyn Vfs>,
        cluster: Arc<dyn Cluster>,
        config: Config,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                vfs,
                cluster,
                config,
                shards: Mutex::new(HashMap::new()),
                pipelines: Mutex::new(HashMap::new()),
                jobs: Mutex::new(HashMap::new()),
                job_pools: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn vfs(&self) -> &Arc<dyn Vfs> {
        &self.inner.vfs
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.inner.cluster
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial: self.inner.config.retry_initial,
            max: self.inner.config.retry_max,
        }
    }

    /// Shard owning a pipeline name or job id.
    pub fn shard_of(&self, key: &str) -> u64 {
        fnv1a64(key) % self.inner.config.shard_count
    }

    /// Takes ownership of a shard and starts its dispatch loops.
    pub fn add_shard(&self, shard: u64) -> Result<(), ShardError> {
        let count = self.inner.config.shard_count;
        if shard >= count {
            return Err(ShardError::OutOfRange { shard, count });
        }
        let token = CancellationToken::new();
        {
            let mut shards = self.inner.shards.lock().unwrap();
            if shards.contains_key(&shard) {
                return Err(ShardError::AlreadyHeld(shard));
            }
            shards.insert(shard, token.clone());
        }
        tracing::info!(shard, "acquired shard");
        tokio::spawn(dispatch_pipelines(self.clone(), shard, token.clone()));
        tokio::spawn(dispatch_jobs(self.clone(), shard, token));
        Ok(())
    }

    /// Releases a shard, cancelling every controller it dispatched.
    pub fn delete_shard(&self, shard: u64) -> Result<(), ShardError> {
        let token = {
            let mut shards = self.inner.shards.lock().unwrap();
            shards.remove(&shard).ok_or(ShardError::NotHeld(shard))?
        };
        token.cancel();
        tracing::info!(shard, "released shard");
        Ok(())
    }

    pub fn held_shards(&self) -> Vec<u64> {
        let mut held: Vec<u64> = self.inner.shards.lock().unwrap().keys().copied().collect();
        held.sort_unstable();
        held
    }

    /// Control channel of a job's attached worker pool, if it is
    /// currently running on this process.
    pub fn pool_control(&self, job: &Uuid) -> Option<broadcast::Sender<PoolControl>> {
        self.inner.job_pools.lock().unwrap().get(job).cloned()
    }

    pub(crate) fn register_pool(&self, job: Uuid, control: broadcast::Sender<PoolControl>) {
        self.inner.job_pools.lock().unwrap().insert(job, control);
    }

    pub(crate) fn deregister_pool(&self, job: &Uuid) {
        self.inner.job_pools.lock().unwrap().remove(job);
    }

    fn start_pipeline_controller(
        &self,
        shard_token: &CancellationToken,
        name: String,
        info: PipelineInfo,
    ) {
        let mut pipelines = self.inner.pipelines.lock().unwrap();
        if let Some(existing) = pipelines.get(&name) {
            if !existing.token.is_cancelled() && existing.version == info.version {
                // State-only change; the controller watches its own row.
                return;
            }
            existing.token.cancel();
        }

        let token = shard_token.child_token();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        pipelines.insert(name.clone(), PipelineGuard {
            token: token.clone(),
            generation,
            version: info.version,
        });
        drop(pipelines);

        tracing::info!(pipeline = %name, version = info.version, "starting pipeline controller");
        let orch = self.clone();
        tokio::spawn(async move {
            pipeline::run(orch.clone(), name.clone(), token).await;
            let mut pipelines = orch.inner.pipelines.lock().unwrap();
            if pipelines
                .get(&name)
                .is_some_and(|guard| guard.generation == generation)
            {
                pipelines.remove(&name);
            }
        });
    }

    fn stop_pipeline_controller(&self, name: &str) {
        let guard = self.inner.pipelines.lock().unwrap().remove(name);
        if let Some(guard) = guard {
            tracing::info!(pipeline = name, "stopping pipeline controller");
            guard.token.cancel();
        }
    }

    fn start_job_controller(&self, shard_token: &CancellationToken, id: Uuid) {
        let mut jobs = self.inner.jobs.lock().unwrap();
        if let Some(existing) = jobs.get(&id) {
            if !existing.token.is_cancelled() {
                return;
            }
            existing.token.cancel();
        }

        let token = shard_token.child_token();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        jobs.insert(id, JobGuard {
            token: token.clone(),
            generation,
        });
        drop(jobs);

        tracing::info!(job = %id, "starting job controller");
        let orch = self.clone();
        tokio::spawn(async move {
            job::run(orch.clone(), id, token).await;
            let mut jobs = orch.inner.jobs.lock().unwrap();
            if jobs
                .get(&id)
                .is_some_and(|guard| guard.generation == generation)
            {
                jobs.remove(&id);
            }
        });
    }

    fn stop_job_controller(&self, id: &Uuid) {
        let guard = self.inner.jobs.lock().unwrap().remove(id);
        if let Some(guard) = guard {
            tracing::debug!(job = %id, "stopping job controller");
            guard.token.cancel();
        }
    }
}

async fn dispatch_pipelines(orch: Orchestrator, shard: u64, token: CancellationToken) {
    let backoff = orch.backoff();
    let op_orch = orch.clone();
    let op_token = token.clone();
    retry_forever(
        &token,
        backoff,
        async move || {
            let mut stream = op_orch
                .inner
                .store
                .watch(&PIPELINES, Some((INDEX_STOPPED, "false".to_string())))
                .await?;
            loop {
                let event = tokio::select! {
                    event = stream.next() => event,
                    _ = op_token.cancelled() => return Ok(()),
                };
                let Some(event) = event else {
                    return Err(StoreError::Backend("pipeline watch ended".to_string()));
                };
                match event? {
                    WatchEvent::Put { key, value } => {
                        if op_orch.shard_of(&key) == shard {
                            op_orch.start_pipeline_controller(&op_token, key, value);
                        }
                    }
                    WatchEvent::Delete { key } => {
                        if op_orch.shard_of(&key) == shard {
                            op_orch.stop_pipeline_controller(&key);
                        }
                    }
                }
            }
        },
        async move |err: &StoreError| {
            tracing::warn!(shard, error = %err, "pipeline dispatch failed, retrying");
        },
    )
    .await;
}

async fn dispatch_jobs(orch: Orchestrator, shard: u64, token: CancellationToken) {
    let backoff = orch.backoff();
    retry_forever(
        &token,
        backoff,
        async || {
            let mut stream = orch
                .inner
                .store
                .watch(&JOBS, Some((INDEX_STOPPED, "false".to_string())))
                .await?;
            loop {
                let event = tokio::select! {
                    event = stream.next() => event,
                    _ = token.cancelled() => return Ok(()),
                };
                let Some(event) = event else {
                    return Err(StoreError::Backend("job watch ended".to_string()));
                };
                let key = match event? {
                    WatchEvent::Put { key, .. } => {
                        let Ok(id) = Uuid::parse_str(&key) else {
                            tracing::warn!(key, "ignoring job row with malformed id");
                            continue;
                        };
                        if orch.shard_of(&key) == shard {
                            orch.start_job_controller(&token, id);
                        }
                        continue;
                    }
                    WatchEvent::Delete { key } => key,
                };
                if orch.shard_of(&key) == shard {
                    if let Ok(id) = Uuid::parse_str(&key) {
                        orch.stop_job_controller(&id);
                    }
                }
            }
        },
        async |err: &StoreError| {
            tracing::warn!(shard, error = %err, "job dispatch failed, retrying");
        },
    )
    .await;
}

fn fnv1a64(key: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use crate::cluster::local::{CopyRunner, LocalCluster};
    use crate::store::memory::MemoryBackend;
    use crate::vfs::memory::MemVfs;

    use super::*;

    fn orchestrator() -> Orchestrator {
        let store = Store::new(Arc::new(MemoryBackend::new()));
        let vfs = Arc::new(MemVfs::new());
        let cluster = Arc::new(LocalCluster::new(vfs.clone(), Arc::new(CopyRunner), 1, 16));
        Orchestrator::new(store, vfs, cluster, Config::default())
    }

    #[test]
    fn test_fnv1a64_known_vectors() {
        assert_eq!(fnv1a64(""), 0xcbf29ce484222325);
        assert_eq!(fnv1a64("a"), 0xaf63dc4c8601ec8c);
    }

    #[tokio::test]
    async fn test_shard_of_stays_in_range() {
        let orch = orchestrator();
        let count = orch.config().shard_count;
        for key in ["edges", "montage", "a-long-pipeline-name"] {
            assert!(orch.shard_of(key) < count);
        }
        // Same key, same shard.
        assert_eq!(orch.shard_of("edges"), orch.shard_of("edges"));
    }

    #[tokio::test]
    async fn test_shard_bookkeeping() {
        let orch = orchestrator();
        orch.add_shard(0).unwrap();
        assert!(matches!(
            orch.add_shard(0),
            Err(ShardError::AlreadyHeld(0))
        ));
        assert!(matches!(
            orch.add_shard(10_000),
            Err(ShardError::OutOfRange { .. })
        ));
        assert_eq!(orch.held_shards(), vec![0]);

        orch.delete_shard(0).unwrap();
        assert!(matches!(orch.delete_shard(0), Err(ShardError::NotHeld(0))));
        assert!(orch.held_shards().is_empty());
    }
}
