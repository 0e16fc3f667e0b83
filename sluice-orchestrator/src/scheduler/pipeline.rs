//! Pipeline controller.
//!
//! One per live pipeline, owned by a shard. An activation provisions
//! the output repo and worker group, marks the pipeline RUNNING, then
//! reacts to two streams: input branch heads (each complete new
//! combination becomes a job, at most one per input snapshot) and the
//! pipeline's own job rows (to know when everything is done and the
//! workers can be scaled to zero after the idle threshold). Any error
//! marks the pipeline RESTARTING and re-runs the activation with
//! backoff.

use std::collections::HashSet;
use std::pin::Pin;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sluice_core::domain::commit::Branch;
use sluice_core::domain::input::Input;
use sluice_core::domain::job::JobInfo;
use sluice_core::domain::pipeline::{PipelineInfo, PipelineState};

use crate::cluster::pipeline_group;
use crate::service::job as job_service;
use crate::store::{input_key, WatchEvent, INDEX_INPUT, INDEX_PIPELINE, JOBS, PIPELINES};

use super::branchset::{self, BranchSet};
use super::retry::retry_forever;
use super::{ControllerError, Orchestrator};

/// Parks the idle timer while it is disarmed.
const TIMER_PARK: Duration = Duration::from_secs(86_400 * 365);

pub(crate) async fn run(orch: Orchestrator, name: String, token: CancellationToken) {
    let backoff = orch.backoff();
    retry_forever(
        &token,
        backoff,
        async || activation(&orch, &name, &token).await,
        async |err: &ControllerError| {
            tracing::warn!(pipeline = %name, error = %err, "pipeline controller failed, restarting");
            mark_restarting(&orch, &name).await;
        },
    )
    .await;
}

async fn mark_restarting(orch: &Orchestrator, name: &str) {
    let result = orch
        .store()
        .in_txn(async |txn| {
            let Some(mut info) = txn.get(&PIPELINES, name).await? else {
                return Ok(());
            };
            if info.stopped || info.state.is_stopped() {
                return Ok(());
            }
            if info.state != PipelineState::Restarting {
                info.state = PipelineState::Restarting;
                txn.put(&PIPELINES, name, &info)?;
            }
            Ok(())
        })
        .await;
    if let Err(err) = result {
        tracing::warn!(pipeline = name, error = %err, "failed to record restarting state");
    }
}

async fn activation(
    orch: &Orchestrator,
    name: &str,
    token: &CancellationToken,
) -> Result<(), ControllerError> {
    let store = orch.store().clone();
    let Some(info) = store.get(&PIPELINES, name).await? else {
        tracing::debug!(pipeline = name, "pipeline row gone, controller exiting");
        return Ok(());
    };
    if info.stopped || info.state.is_stopped() {
        return Ok(());
    }
    let version = info.version;

    let prefix = orch.config().group_prefix.clone();
    let group = pipeline_group(&prefix, name, version);

    // Worker groups of earlier versions are dead weight now.
    for old in 1..version {
        let stale = pipeline_group(&prefix, name, old);
        if let Err(err) = orch.cluster().delete_replica_group(&stale).await {
            if !err.is_not_found() {
                return Err(err.into());
            }
        }
    }

    // Output repo, fed by the input repos.
    let mut provenance: Vec<String> = info
        .input
        .atoms()
        .iter()
        .map(|atom| atom.repo.clone())
        .collect();
    provenance.sort();
    provenance.dedup();
    if let Err(err) = orch.vfs().create_repo(name, provenance).await {
        if !err.is_exists() {
            return Err(err.into());
        }
    }

    let target = info
        .parallelism
        .target_replicas(orch.cluster().node_count().await);
    if let Err(err) = orch
        .cluster()
        .create_replica_group(&group, &info.transform, target)
        .await
    {
        if !err.is_exists() {
            return Err(err.into());
        }
    }
    orch.cluster().set_replicas(&group, target).await?;

    // Take over: mark RUNNING unless a newer version or a stop won.
    let proceed = store
        .in_txn(async |txn| {
            let Some(mut current) = txn.get(&PIPELINES, name).await? else {
                return Ok(false);
            };
            if current.version != version || current.stopped || current.state.is_stopped() {
                return Ok(false);
            }
            if current.state != PipelineState::Running {
                current.state = PipelineState::Running;
                txn.put(&PIPELINES, name, &current)?;
            }
            Ok(true)
        })
        .await?;
    if !proceed {
        return Ok(());
    }
    tracing::info!(pipeline = name, version, "pipeline running");

    // Helpers spawned below die with the activation.
    let scope = token.child_token();
    let _scope_guard = scope.clone().drop_guard();

    let mut sets = branchset::track(orch.vfs().clone(), &info.input, scope.clone());
    let mut jobs = store
        .watch(&JOBS, Some((INDEX_PIPELINE, name.to_string())))
        .await?;

    let mut act = Activation {
        orch,
        info: &info,
        running: HashSet::new(),
        known_inputs: HashSet::new(),
        parent: None,
        parent_started: None,
    };

    let scale_timer = tokio::time::sleep(TIMER_PARK);
    tokio::pin!(scale_timer);
    let mut timer_armed = false;
    // Nothing running yet as far as we know; the job watch snapshot
    // corrects this within a few events.
    arm_timer(
        &mut timer_armed,
        scale_timer.as_mut(),
        info.scale_down_threshold,
    );

    loop {
        tokio::select! {
            set = sets.recv() => match set {
                Some(Ok(set)) => {
                    if act.handle_branch_set(&set).await? {
                        timer_armed = false;
                    }
                }
                Some(Err(err)) => return Err(err.into()),
                None => {
                    return Err(ControllerError::Internal(
                        "branch tracker ended".to_string(),
                    ));
                }
            },
            event = jobs.next() => {
                let Some(event) = event else {
                    return Err(ControllerError::Internal("job watch ended".to_string()));
                };
                match event? {
                    WatchEvent::Put { value: job, .. } => {
                        if act.observe_job(&job) {
                            timer_armed = false;
                        } else if act.running.is_empty() {
                            arm_timer(
                                &mut timer_armed,
                                scale_timer.as_mut(),
                                info.scale_down_threshold,
                            );
                        }
                    }
                    WatchEvent::Delete { key } => {
                        if let Ok(id) = Uuid::parse_str(&key) {
                            if act.running.remove(&id) && act.running.is_empty() {
                                arm_timer(
                                    &mut timer_armed,
                                    scale_timer.as_mut(),
                                    info.scale_down_threshold,
                                );
                            }
                        }
                    }
                }
            },
            _ = scale_timer.as_mut(), if timer_armed => {
                timer_armed = false;
                if act.running.is_empty() {
                    tracing::info!(
                        pipeline = name,
                        "idle threshold passed, scaling workers to zero"
                    );
                    orch.cluster().set_replicas(&group, 0).await?;
                }
            },
            _ = token.cancelled() => return Ok(()),
        }
    }
}

fn arm_timer(armed: &mut bool, timer: Pin<&mut Sleep>, threshold: Option<u64>) {
    if let Some(secs) = threshold {
        *armed = true;
        timer.reset(Instant::now() + Duration::from_secs(secs));
    }
}

struct Activation<'a> {
    orch: &'a Orchestrator,
    info: &'a PipelineInfo,
    running: HashSet<Uuid>,
    known_inputs: HashSet<String>,
    parent: Option<Uuid>,
    parent_started: Option<chrono::DateTime<chrono::Utc>>,
}

impl Activation<'_> {
    /// Folds one job row event in. Returns true when the pipeline has
    /// running jobs afterwards.
    fn observe_job(&mut self, job: &JobInfo) -> bool {
        if let Some(ref pref) = job.pipeline {
            if pref.id == self.info.id && pref.version == self.info.version {
                self.known_inputs.insert(input_key(&job.input));
                if job.state.is_terminal() {
                    self.running.remove(&job.id);
                } else {
                    self.running.insert(job.id);
                }
                if self
                    .parent_started
                    .is_none_or(|started| job.started_at >= started)
                {
                    self.parent_started = Some(job.started_at);
                    self.parent = Some(job.id);
                }
            }
        }
        !self.running.is_empty()
    }

    /// Creates a job for a new input snapshot, unless one already
    /// covers it. Returns true when a job was created.
    async fn handle_branch_set(&mut self, set: &BranchSet) -> Result<bool, ControllerError> {
        let mut resolved = self.info.input.clone();
        resolved.visit_mut(&mut |node| {
            if let Input::Atom(atom) = node {
                let branch = Branch::new(atom.repo.clone(), atom.commit.clone());
                if let Some(head) = set.head_of(&branch) {
                    atom.commit = head.id.clone();
                    atom.from_commit = None;
                }
            }
        });

        let key = input_key(&resolved);
        if self.known_inputs.contains(&key) {
            return Ok(false);
        }
        // A job covering this snapshot may predate this controller.
        let existing = self
            .orch
            .store()
            .index_scan(&JOBS, INDEX_INPUT, &key)
            .await?;
        let covered = existing.iter().any(|(_, job)| {
            job.pipeline
                .as_ref()
                .is_some_and(|r| r.id == self.info.id && r.version == self.info.version)
        });
        if covered {
            self.known_inputs.insert(key);
            return Ok(false);
        }

        let job = match job_service::create_pipeline_job(
            self.orch,
            self.info,
            resolved,
            self.parent,
        )
        .await
        {
            Ok(job) => job,
            Err(err) if err.is_stale_pipeline() => return Ok(false),
            Err(err) => {
                return Err(ControllerError::Internal(format!("create job: {err}")));
            }
        };
        tracing::info!(
            pipeline = %self.info.name,
            job = %job.id,
            "created job for new input snapshot"
        );
        self.known_inputs.insert(key);
        self.running.insert(job.id);
        self.parent_started = Some(job.started_at);
        self.parent = Some(job.id);
        Ok(true)
    }
}
