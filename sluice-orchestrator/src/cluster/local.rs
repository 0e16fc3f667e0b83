//! In-process cluster for local mode and tests.
//!
//! Replica groups are bookkeeping entries; attaching to one spawns the
//! workers as tokio tasks. Workers share the task channel, run the
//! transform through a [`TransformRunner`], and append JSON log lines
//! to per-task buffers that survive the workers themselves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};

use sluice_core::domain::datum::Datum;
use sluice_core::domain::log::LogMessage;
use sluice_core::domain::pipeline::Transform;

use crate::merge::MergeFragment;
use crate::vfs::Vfs;
use crate::worker::{DatumFailure, DatumResult, FailureKind, PoolControl, PoolHandle};

use super::{Cluster, ClusterError, Result, TaskContext, TransformRunner};

const CONTROL_BUFFER: usize = 16;

struct GroupState {
    transform: Transform,
    replicas: u64,
    logs: HashMap<String, Arc<Mutex<Vec<u8>>>>,
}

pub struct LocalCluster {
    vfs: Arc<dyn Vfs>,
    runner: Arc<dyn TransformRunner>,
    nodes: u64,
    queue: usize,
    groups: Mutex<HashMap<String, GroupState>>,
}

impl LocalCluster {
    pub fn new(
        vfs: Arc<dyn Vfs>,
        runner: Arc<dyn TransformRunner>,
        nodes: u64,
        queue: usize,
    ) -> Self {
        Self {
            vfs,
            runner,
            nodes: nodes.max(1),
            queue: queue.max(1),
            groups: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Cluster for LocalCluster {
    async fn create_replica_group(
        &self,
        name: &str,
        transform: &Transform,
        replicas: u64,
    ) -> Result<()> {
        let mut groups = self.groups.lock().unwrap();
        if groups.contains_key(name) {
            return Err(ClusterError::GroupExists(name.to_string()));
        }
        groups.insert(name.to_string(), GroupState {
            transform: transform.clone(),
            replicas,
            logs: HashMap::new(),
        });
        tracing::info!(group = name, replicas, "created replica group");
        Ok(())
    }

    async fn delete_replica_group(&self, name: &str) -> Result<()> {
        let mut groups = self.groups.lock().unwrap();
        groups
            .remove(name)
            .map(|_| tracing::info!(group = name, "deleted replica group"))
            .ok_or_else(|| ClusterError::GroupNotFound(name.to_string()))
    }

    async fn set_replicas(&self, name: &str, replicas: u64) -> Result<()> {
        let mut groups = self.groups.lock().unwrap();
        let group = groups
            .get_mut(name)
            .ok_or_else(|| ClusterError::GroupNotFound(name.to_string()))?;
        group.replicas = replicas;
        Ok(())
    }

    async fn replicas(&self, name: &str) -> Result<u64> {
        let groups = self.groups.lock().unwrap();
        groups
            .get(name)
            .map(|group| group.replicas)
            .ok_or_else(|| ClusterError::GroupNotFound(name.to_string()))
    }

    async fn node_count(&self) -> u64 {
        self.nodes
    }

    async fn list_tasks(&self, group: &str) -> Result<Vec<String>> {
        let groups = self.groups.lock().unwrap();
        let group = groups
            .get(group)
            .ok_or_else(|| ClusterError::GroupNotFound(group.to_string()))?;
        let mut tasks: Vec<String> = group.logs.keys().cloned().collect();
        tasks.sort();
        Ok(tasks)
    }

    async fn task_logs(&self, task: &str) -> Result<Vec<u8>> {
        let groups = self.groups.lock().unwrap();
        for group in groups.values() {
            if let Some(log) = group.logs.get(task) {
                return Ok(log.lock().unwrap().clone());
            }
        }
        Err(ClusterError::TaskNotFound(task.to_string()))
    }

    /// Spawns the group's current replica count as workers. With zero
    /// replicas the handle only queues; datums sit until the group is
    /// scaled up and attached again.
    async fn attach(&self, group: &str, ctx: TaskContext) -> Result<PoolHandle> {
        let (transform, workers) = {
            let mut groups = self.groups.lock().unwrap();
            let state = groups
                .get_mut(group)
                .ok_or_else(|| ClusterError::GroupNotFound(group.to_string()))?;
            let mut workers = Vec::new();
            for i in 0..state.replicas {
                let task = format!("{group}-{i}");
                let log = state
                    .logs
                    .entry(task.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
                    .clone();
                workers.push((task, log));
            }
            (state.transform.clone(), workers)
        };

        let (task_tx, task_rx) = mpsc::channel::<Datum>(self.queue);
        let (success_tx, success_rx) = mpsc::channel::<DatumResult>(self.queue);
        let (failure_tx, failure_rx) = mpsc::channel::<DatumFailure>(self.queue);
        let (control_tx, _) = broadcast::channel::<PoolControl>(CONTROL_BUFFER);

        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));
        for (task, log) in workers {
            tokio::spawn(run_worker(
                self.vfs.clone(),
                self.runner.clone(),
                transform.clone(),
                ctx.clone(),
                task,
                log,
                task_rx.clone(),
                success_tx.clone(),
                failure_tx.clone(),
                control_tx.subscribe(),
            ));
        }

        Ok(PoolHandle {
            tasks: task_tx,
            successes: success_rx,
            failures: failure_rx,
            control: control_tx,
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    vfs: Arc<dyn Vfs>,
    runner: Arc<dyn TransformRunner>,
    transform: Transform,
    ctx: TaskContext,
    task: String,
    log: Arc<Mutex<Vec<u8>>>,
    tasks: Arc<tokio::sync::Mutex<mpsc::Receiver<Datum>>>,
    successes: mpsc::Sender<DatumResult>,
    failures: mpsc::Sender<DatumFailure>,
    mut control: broadcast::Receiver<PoolControl>,
) {
    let mut control_open = true;
    loop {
        let datum = {
            let mut rx = tasks.lock().await;
            match rx.recv().await {
                Some(datum) => datum,
                None => return,
            }
        };
        // Control that predates pickup refers to queued datums, which
        // are already where a restart would put them.
        while control.try_recv().is_ok() {}

        write_log(&log, &ctx, &task, &datum, "processing datum");

        let outcome = {
            let run = runner.run(vfs.as_ref(), &transform, &datum);
            tokio::pin!(run);
            loop {
                if !control_open {
                    break Some(run.as_mut().await);
                }
                tokio::select! {
                    result = run.as_mut() => break Some(result),
                    ctl = control.recv() => match ctl {
                        Ok(PoolControl::RestartDatums { data_filters })
                            if datum.matches_filters(&data_filters) =>
                        {
                            break None;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => control_open = false,
                    },
                }
            }
        };

        match outcome {
            Some(Ok(files)) => {
                write_log(&log, &ctx, &task, &datum, "datum processed");
                let result = DatumResult {
                    datum,
                    fragment: MergeFragment { files },
                };
                if successes.send(result).await.is_err() {
                    return;
                }
            }
            Some(Err(message)) => {
                write_log(&log, &ctx, &task, &datum, &format!("datum failed: {message}"));
                let failure = DatumFailure {
                    datum,
                    error: message,
                    kind: FailureKind::Failed,
                };
                if failures.send(failure).await.is_err() {
                    return;
                }
            }
            None => {
                write_log(&log, &ctx, &task, &datum, "datum restarted");
                let failure = DatumFailure {
                    datum,
                    error: "restarted".to_string(),
                    kind: FailureKind::Restarted,
                };
                if failures.send(failure).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn write_log(
    log: &Arc<Mutex<Vec<u8>>>,
    ctx: &TaskContext,
    task: &str,
    datum: &Datum,
    message: &str,
) {
    let entry = LogMessage {
        pipeline_name: ctx.pipeline.clone(),
        job_id: ctx.job,
        data: datum.inputs.iter().map(|input| input.path.clone()).collect(),
        task: task.to_string(),
        ts: Utc::now(),
        message: message.to_string(),
    };
    if let Ok(mut line) = serde_json::to_vec(&entry) {
        line.push(b'\n');
        log.lock().unwrap().extend_from_slice(&line);
    }
}

/// Copies every input file through to the output unchanged. Default
/// runner in local mode.
pub struct CopyRunner;

#[async_trait]
impl TransformRunner for CopyRunner {
    async fn run(
        &self,
        vfs: &dyn Vfs,
        _transform: &Transform,
        datum: &Datum,
    ) -> std::result::Result<Vec<(String, Vec<u8>)>, String> {
        let mut files = Vec::new();
        for input in &datum.inputs {
            if input.path == "/" {
                // Whole-commit datum: copy every file.
                let paths = vfs
                    .glob_files(&input.commit, "/**")
                    .await
                    .map_err(|e| e.to_string())?;
                for path in paths {
                    match vfs.get_file(&input.commit, &path).await {
                        Ok(content) => files.push((path, content)),
                        Err(err) if err.is_not_found() => continue,
                        Err(err) => return Err(err.to_string()),
                    }
                }
                continue;
            }
            let content = vfs
                .get_file(&input.commit, &input.path)
                .await
                .map_err(|e| e.to_string())?;
            files.push((input.path.clone(), content));
        }
        Ok(files)
    }
}
