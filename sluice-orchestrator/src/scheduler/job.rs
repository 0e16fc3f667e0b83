//! Job controller.
//!
//! One per live job, owned by a shard. An attempt waits for the parent
//! job to settle, provisions workers, enumerates the datums of the
//! input snapshot, and pumps them through the worker pool with bounded
//! per-datum retries. When every datum lands, the merged output tree is
//! committed to the output branch; a datum out of retries drains the
//! in-flight work and fails the job. Attempt errors bump the restart
//! counter and re-run with backoff.

use std::collections::VecDeque;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sluice_core::domain::commit::Commit;
use sluice_core::domain::datum::Datum;
use sluice_core::domain::job::{JobInfo, JobState};

use crate::cluster::{job_group, pipeline_group, TaskContext};
use crate::merge::{MergeError, MergeTree};
use crate::store::{Store, StoreError, WatchEvent, JOBS, PIPELINES};
use crate::worker::FailureKind;

use super::datum;
use super::retry::retry_forever;
use super::{ControllerError, Orchestrator};

/// Attempts a datum gets before it takes the whole job down.
const MAX_DATUM_RETRIES: u64 = 3;

pub(crate) async fn run(orch: Orchestrator, id: Uuid, token: CancellationToken) {
    let backoff = orch.backoff();
    let op_orch = orch.clone();
    let op_token = token.clone();
    retry_forever(
        &token,
        backoff,
        async move || attempt(&op_orch, id, &op_token).await,
        async move |err: &ControllerError| {
            tracing::warn!(job = %id, error = %err, "job controller failed, restarting");
            record_restart(&orch, id).await;
        },
    )
    .await;
}

/// Moves a job to `new_state`, updating the owning pipeline's per-state
/// tallies in the same transaction. Terminal states are sticky: the row
/// comes back unchanged. `mutate` runs after the state change and can
/// fill in progress, timestamps, or the output commit.
pub(crate) async fn transition_job<F>(
    store: &Store,
    id: Uuid,
    new_state: JobState,
    mut mutate: F,
) -> Result<Option<JobInfo>, StoreError>
where
    F: FnMut(&mut JobInfo),
{
    let key = id.to_string();
    store
        .in_txn(async move |txn| {
            let Some(mut job) = txn.get(&JOBS, &key).await? else {
                return Ok(None);
            };
            if job.state.is_terminal() {
                return Ok(Some(job));
            }
            let prev = job.state;
            if prev != new_state {
                if let Some(ref pref) = job.pipeline {
                    if let Some(mut pipeline) = txn.get(&PIPELINES, &pref.name).await? {
                        pipeline.job_counts.decrement(prev);
                        pipeline.job_counts.increment(new_state);
                        txn.put(&PIPELINES, &pref.name, &pipeline)?;
                    }
                }
            }
            job.state = new_state;
            job.stopped = new_state.is_terminal();
            mutate(&mut job);
            txn.put(&JOBS, &key, &job)?;
            Ok(Some(job))
        })
        .await
}

/// Background writer for the throttled progress counter. Ends when the
/// sender drops; a write that lands after the job settles is ignored by
/// the terminal-state check in [`transition_job`].
fn spawn_progress_writer(store: Store, id: Uuid, mut counts: watch::Receiver<u64>) {
    tokio::spawn(async move {
        while counts.changed().await.is_ok() {
            let processed = *counts.borrow_and_update();
            let result = transition_job(&store, id, JobState::Running, move |j| {
                j.datums_processed = processed;
            })
            .await;
            if let Err(err) = result {
                tracing::debug!(job = %id, error = %err, "progress write failed");
            }
        }
    });
}

async fn record_restart(orch: &Orchestrator, id: Uuid) {
    let key = id.to_string();
    let result = orch
        .store()
        .in_txn(async move |txn| {
            let Some(mut job) = txn.get(&JOBS, &key).await? else {
                return Ok(());
            };
            if job.state.is_terminal() {
                return Ok(());
            }
            job.restart += 1;
            txn.put(&JOBS, &key, &job)?;
            Ok(())
        })
        .await;
    if let Err(err) = result {
        tracing::warn!(job = %id, error = %err, "failed to record restart");
    }
}

/// Removes the job's pool registration when the attempt ends.
struct PoolRegistration<'a> {
    orch: &'a Orchestrator,
    id: Uuid,
}

impl Drop for PoolRegistration<'_> {
    fn drop(&mut self) {
        self.orch.deregister_pool(&self.id);
    }
}

async fn attempt(
    orch: &Orchestrator,
    id: Uuid,
    token: &CancellationToken,
) -> Result<(), ControllerError> {
    let store = orch.store().clone();
    let key = id.to_string();
    let Some(job) = store.get(&JOBS, &key).await? else {
        return Ok(());
    };
    if job.state.is_terminal() {
        return Ok(());
    }

    // Outputs commit in creation order: wait for the parent first.
    if let Some(parent) = job.parent {
        if !wait_for_parent(orch, parent, token).await? {
            return Ok(());
        }
    }

    // A previous attempt may have crashed after committing its output.
    if let Some(commit) = find_committed_output(orch, &job).await? {
        tracing::info!(job = %id, commit = %commit, "output already committed, finishing");
        let total = job.datums_total;
        let finished = Utc::now();
        transition_job(&store, id, JobState::Success, move |j| {
            j.datums_processed = total;
            j.finished_at = Some(finished);
            j.output_commit = Some(commit.clone());
        })
        .await?;
        let prefix = orch.config().group_prefix.clone();
        delete_orphan_group(orch, &job, &prefix).await;
        return Ok(());
    }

    let prefix = orch.config().group_prefix.clone();
    let target = job
        .parallelism
        .target_replicas(orch.cluster().node_count().await);

    let (group, ctx) = match &job.pipeline {
        Some(pref) => {
            let group = pipeline_group(&prefix, &pref.name, pref.version);
            // The group may be scaled to zero between jobs.
            match orch.cluster().replicas(&group).await {
                Ok(current) if current < target => {
                    orch.cluster().set_replicas(&group, target).await?;
                }
                Ok(_) => {}
                Err(err) if err.is_not_found() => {
                    orch.cluster()
                        .create_replica_group(&group, &job.transform, target)
                        .await?;
                }
                Err(err) => return Err(err.into()),
            }
            let ctx = TaskContext {
                pipeline: Some(pref.name.clone()),
                job: Some(id),
            };
            (group, ctx)
        }
        None => {
            // Orphan jobs own their output repo and worker group.
            let mut provenance: Vec<String> = job
                .input
                .atoms()
                .iter()
                .map(|atom| atom.repo.clone())
                .collect();
            provenance.sort();
            provenance.dedup();
            if let Err(err) = orch.vfs().create_repo(&job.output_repo, provenance).await {
                if !err.is_exists() {
                    return Err(err.into());
                }
            }
            let group = job_group(&prefix, &id);
            if let Err(err) = orch
                .cluster()
                .create_replica_group(&group, &job.transform, target)
                .await
            {
                if !err.is_exists() {
                    return Err(err.into());
                }
            }
            let ctx = TaskContext {
                pipeline: None,
                job: Some(id),
            };
            (group, ctx)
        }
    };

    let datums = datum::enumerate(orch.vfs().as_ref(), &job.input).await?;
    let total_usize = datums.len();
    let total = total_usize as u64;

    let Some(job) = transition_job(&store, id, JobState::Running, move |j| {
        j.datums_total = total;
        j.datums_processed = 0;
    })
    .await?
    else {
        return Ok(());
    };
    if job.state.is_terminal() {
        return Ok(());
    }
    tracing::info!(job = %id, datums = total, "job running");

    let mut pool = orch.cluster().attach(&group, ctx).await?;
    orch.register_pool(id, pool.control.clone());
    let _registration = PoolRegistration { orch, id };

    let mut next: usize = 0;
    let mut retry_queue: VecDeque<Datum> = VecDeque::new();
    let mut inflight: usize = 0;
    let mut processed: u64 = 0;
    let mut last_written: u64 = 0;
    let write_every = (total / 100).max(1);
    let mut failed: Option<String> = None;
    let mut tree = MergeTree::new();

    // Progress rows are written off the loop; the channel keeps only the
    // latest count, so a slow store never backs up datum distribution.
    let (progress, progress_counts) = watch::channel(0u64);
    spawn_progress_writer(store.clone(), id, progress_counts);

    loop {
        if inflight == 0 {
            match &failed {
                Some(_) => break,
                None if next >= total_usize && retry_queue.is_empty() => break,
                None => {}
            }
        }
        let can_submit = failed.is_none() && (next < total_usize || !retry_queue.is_empty());
        tokio::select! {
            permit = pool.tasks.reserve(), if can_submit => {
                let permit = permit.map_err(|_| {
                    ControllerError::Internal("worker pool closed".to_string())
                })?;
                let datum = match retry_queue.pop_front() {
                    Some(datum) => datum,
                    None => {
                        let datum = datums.get(next).ok_or_else(|| {
                            ControllerError::Internal("datum index out of range".to_string())
                        })?;
                        next += 1;
                        datum
                    }
                };
                permit.send(datum);
                inflight += 1;
            },
            result = pool.successes.recv() => {
                let Some(result) = result else {
                    return Err(ControllerError::Internal("worker pool closed".to_string()));
                };
                inflight -= 1;
                processed += 1;
                tree.merge(result.fragment)?;
                if processed - last_written >= write_every {
                    last_written = processed;
                    let _ = progress.send(processed);
                }
            },
            failure = pool.failures.recv() => {
                let Some(mut failure) = failure else {
                    return Err(ControllerError::Internal("worker pool closed".to_string()));
                };
                inflight -= 1;
                match failure.kind {
                    FailureKind::Restarted => {
                        tracing::info!(job = %id, "datum restarted, requeueing");
                        retry_queue.push_back(failure.datum);
                    }
                    FailureKind::Failed => {
                        failure.datum.retries += 1;
                        if failure.datum.retries >= MAX_DATUM_RETRIES {
                            tracing::warn!(
                                job = %id,
                                error = %failure.error,
                                "datum out of retries"
                            );
                            if failed.is_none() {
                                failed = Some(failure.error);
                            }
                        } else {
                            retry_queue.push_back(failure.datum);
                        }
                    }
                }
            },
            _ = token.cancelled() => return Ok(()),
        }
    }
    drop(pool);

    if let Some(error) = failed {
        let finished = Utc::now();
        transition_job(&store, id, JobState::Failure, move |j| {
            j.datums_processed = processed;
            j.finished_at = Some(finished);
        })
        .await?;
        // The worker group stays for failed orphans so logs remain readable.
        tracing::warn!(job = %id, error, "job failed");
        return Ok(());
    }

    let tree_bytes = match tree.finish() {
        Ok(bytes) => bytes,
        Err(MergeError::Conflicts(paths)) => {
            let finished = Utc::now();
            transition_job(&store, id, JobState::Failure, move |j| {
                j.datums_processed = processed;
                j.finished_at = Some(finished);
            })
            .await?;
            tracing::warn!(job = %id, conflicts = ?paths, "output merge conflict");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    let tree_hash = orch.vfs().put_object(tree_bytes).await?;
    let provenance = job.input.commits();
    let commit = orch
        .vfs()
        .build_commit(&job.output_repo, &job.output_branch, provenance, &tree_hash)
        .await?;
    if let Some(ref egress) = job.egress {
        orch.vfs().push_egress(&commit, &egress.url).await?;
    }

    let finished = Utc::now();
    let output_commit = commit.clone();
    transition_job(&store, id, JobState::Success, move |j| {
        j.datums_processed = total;
        j.finished_at = Some(finished);
        j.output_commit = Some(output_commit.clone());
    })
    .await?;
    tracing::info!(job = %id, commit = %commit, "job succeeded");
    delete_orphan_group(orch, &job, &prefix).await;
    Ok(())
}

/// Waits until `parent` reaches a terminal state or disappears. Returns
/// false when cancelled first.
async fn wait_for_parent(
    orch: &Orchestrator,
    parent: Uuid,
    token: &CancellationToken,
) -> Result<bool, ControllerError> {
    let key = parent.to_string();
    // Watch first so a transition between the read and the first event
    // is not missed; the watch replays current state anyway.
    let mut stream = orch.store().watch_key(&JOBS, &key).await?;
    if orch
        .store()
        .get(&JOBS, &key)
        .await?
        .is_none_or(|job: JobInfo| job.state.is_terminal())
    {
        return Ok(true);
    }
    loop {
        let event = tokio::select! {
            event = stream.next() => event,
            _ = token.cancelled() => return Ok(false),
        };
        match event {
            Some(Ok(WatchEvent::Put { value, .. })) => {
                if value.state.is_terminal() {
                    return Ok(true);
                }
            }
            Some(Ok(WatchEvent::Delete { .. })) => return Ok(true),
            Some(Err(err)) => return Err(err.into()),
            None => {
                return Err(ControllerError::Internal("parent watch ended".to_string()));
            }
        }
    }
}

/// Checks whether the output branch head was already built from this
/// job's input commits, which happens when a previous attempt crashed
/// between committing and recording success.
async fn find_committed_output(
    orch: &Orchestrator,
    job: &JobInfo,
) -> Result<Option<Commit>, ControllerError> {
    let Some(head) = orch
        .vfs()
        .branch_head(&job.output_repo, &job.output_branch)
        .await?
    else {
        return Ok(None);
    };
    let info = orch.vfs().inspect_commit(&head).await?;
    let mut want = job.input.commits();
    want.sort();
    let mut have = info.provenance;
    have.sort();
    if !want.is_empty() && want == have {
        Ok(Some(info.commit))
    } else {
        Ok(None)
    }
}

/// Orphan jobs that ran to success no longer need their worker group.
async fn delete_orphan_group(orch: &Orchestrator, job: &JobInfo, prefix: &str) {
    if job.pipeline.is_some() {
        return;
    }
    let group = job_group(prefix, &job.id);
    if let Err(err) = orch.cluster().delete_replica_group(&group).await {
        if !err.is_not_found() {
            tracing::warn!(job = %job.id, error = %err, "failed to delete worker group");
        }
    }
}
