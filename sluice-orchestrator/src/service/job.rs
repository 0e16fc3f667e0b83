//! Job Service
//!
//! Business logic for job management and lifecycle.

use std::collections::HashMap;

use chrono::Utc;
use futures::StreamExt;
use uuid::Uuid;

use sluice_core::domain::commit::{Commit, DEFAULT_BRANCH};
use sluice_core::domain::input::{Input, InputMode};
use sluice_core::domain::job::{JobInfo, JobState, PipelineRef};
use sluice_core::domain::pipeline::PipelineInfo;
use sluice_core::dto::job::{CreateJobRequest, ListJobQuery, RestartDatumRequest};

use crate::cluster::job_group;
use crate::scheduler::job::transition_job;
use crate::scheduler::Orchestrator;
use crate::store::{StoreError, WatchEvent, INDEX_PIPELINE, JOBS, PIPELINES};
use crate::vfs::VfsError;
use crate::worker::PoolControl;

/// Service error type
#[derive(Debug)]
pub enum JobError {
    NotFound(Uuid),
    PipelineNotFound(String),
    NotRunning(Uuid),
    ValidationError(String),
    /// The pipeline row changed between snapshot and job creation; the
    /// caller should drop the snapshot and pick up the new version.
    StalePipeline(String),
    StoreError(StoreError),
    VfsError(VfsError),
}

impl JobError {
    pub fn is_stale_pipeline(&self) -> bool {
        matches!(self, JobError::StalePipeline(_))
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        JobError::StoreError(err)
    }
}

impl From<VfsError> for JobError {
    fn from(err: VfsError) -> Self {
        JobError::VfsError(err)
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::NotFound(id) => write!(f, "job {id} not found"),
            JobError::PipelineNotFound(name) => write!(f, "pipeline {name} not found"),
            JobError::NotRunning(id) => write!(f, "job {id} is not running"),
            JobError::ValidationError(msg) => write!(f, "{msg}"),
            JobError::StalePipeline(name) => write!(f, "pipeline {name} changed underneath"),
            JobError::StoreError(err) => write!(f, "store error: {err}"),
            JobError::VfsError(err) => write!(f, "filesystem error: {err}"),
        }
    }
}

enum CreateOutcome {
    Created(JobInfo),
    Stale,
}

/// Create a job under a pipeline, re-checking the pipeline row in the
/// same transaction so a job can never be recorded against a version
/// that was replaced or stopped mid-flight.
pub(crate) async fn create_pipeline_job(
    orch: &Orchestrator,
    pipeline: &PipelineInfo,
    input: Input,
    parent: Option<Uuid>,
) -> Result<JobInfo, JobError> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    let outcome = orch
        .store()
        .in_txn(async |txn| {
            let Some(mut current) = txn.get(&PIPELINES, &pipeline.name).await? else {
                return Ok(CreateOutcome::Stale);
            };
            if current.id != pipeline.id
                || current.version != pipeline.version
                || current.stopped
                || current.state.is_stopped()
            {
                return Ok(CreateOutcome::Stale);
            }
            let job = JobInfo {
                id,
                pipeline: Some(PipelineRef {
                    id: current.id,
                    name: current.name.clone(),
                    version: current.version,
                }),
                parent,
                input: input.clone(),
                output_repo: current.name.clone(),
                output_branch: current.output_branch.clone(),
                transform: current.transform.clone(),
                parallelism: current.parallelism,
                egress: current.egress.clone(),
                state: JobState::Starting,
                stopped: false,
                restart: 0,
                datums_processed: 0,
                datums_total: 0,
                started_at: now,
                finished_at: None,
                output_commit: None,
            };
            current.job_counts.increment(JobState::Starting);
            txn.put(&PIPELINES, &pipeline.name, &current)?;
            txn.create(&JOBS, &id.to_string(), &job).await?;
            Ok(CreateOutcome::Created(job))
        })
        .await?;

    match outcome {
        CreateOutcome::Created(job) => Ok(job),
        CreateOutcome::Stale => Err(JobError::StalePipeline(pipeline.name.clone())),
    }
}

/// Create a job from an API request.
///
/// Naming a pipeline runs its transform over the given input snapshot;
/// otherwise the request must carry a transform and output repo of its
/// own.
pub async fn create_job(orch: &Orchestrator, req: CreateJobRequest) -> Result<JobInfo, JobError> {
    let mut input = req.input.clone();
    input.apply_defaults();
    input.sort_by_name();
    input
        .validate(InputMode::Job)
        .map_err(|err| JobError::ValidationError(err.to_string()))?;
    resolve_input_commits(orch, &mut input).await?;

    if let Some(ref pipeline_name) = req.pipeline {
        let info = orch
            .store()
            .get(&PIPELINES, pipeline_name)
            .await?
            .ok_or_else(|| JobError::PipelineNotFound(pipeline_name.clone()))?;
        let job = create_pipeline_job(orch, &info, input, req.parent).await?;
        tracing::info!("Job created: {} for pipeline: {}", job.id, info.name);
        return Ok(job);
    }

    let Some(transform) = req.transform.clone() else {
        return Err(JobError::ValidationError(
            "Jobs without a pipeline must specify a transform".to_string(),
        ));
    };
    let Some(output_repo) = req.output_repo.clone() else {
        return Err(JobError::ValidationError(
            "Jobs without a pipeline must specify an output repo".to_string(),
        ));
    };
    if transform.image.trim().is_empty() {
        return Err(JobError::ValidationError(
            "Transform image cannot be empty".to_string(),
        ));
    }

    let id = Uuid::new_v4();
    let job = JobInfo {
        id,
        pipeline: None,
        parent: req.parent,
        input,
        output_repo,
        output_branch: req
            .output_branch
            .clone()
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
        transform,
        parallelism: req.parallelism.unwrap_or_default(),
        egress: req.egress.clone(),
        state: JobState::Starting,
        stopped: false,
        restart: 0,
        datums_processed: 0,
        datums_total: 0,
        started_at: Utc::now(),
        finished_at: None,
        output_commit: None,
    };
    orch.store()
        .in_txn(async |txn| txn.create(&JOBS, &id.to_string(), &job).await)
        .await?;

    tracing::info!("Job created: {}", id);
    Ok(job)
}

/// Get a job by ID, optionally blocking until it reaches a terminal
/// state.
pub async fn inspect_job(orch: &Orchestrator, id: Uuid, block: bool) -> Result<JobInfo, JobError> {
    let key = id.to_string();
    if !block {
        return orch
            .store()
            .get(&JOBS, &key)
            .await?
            .ok_or(JobError::NotFound(id));
    }
    loop {
        // Watch before reading so the terminal transition cannot slip
        // between the two.
        let mut stream = orch.store().watch_key(&JOBS, &key).await?;
        let job = orch
            .store()
            .get(&JOBS, &key)
            .await?
            .ok_or(JobError::NotFound(id))?;
        if job.state.is_terminal() {
            return Ok(job);
        }
        loop {
            match stream.next().await {
                Some(Ok(WatchEvent::Put { value, .. })) => {
                    if value.state.is_terminal() {
                        return Ok(value);
                    }
                }
                Some(Ok(WatchEvent::Delete { .. })) => return Err(JobError::NotFound(id)),
                Some(Err(StoreError::WatchLagged)) => break,
                Some(Err(err)) => return Err(err.into()),
                None => break,
            }
        }
        // Lagged or ended, re-open the watch.
    }
}

/// List jobs, newest first, optionally restricted to one pipeline.
pub async fn list_job(orch: &Orchestrator, query: ListJobQuery) -> Result<Vec<JobInfo>, JobError> {
    let rows = match query.pipeline {
        Some(ref name) => {
            orch.store()
                .get(&PIPELINES, name)
                .await?
                .ok_or_else(|| JobError::PipelineNotFound(name.clone()))?;
            orch.store().index_scan(&JOBS, INDEX_PIPELINE, name).await?
        }
        None => orch.store().list(&JOBS).await?,
    };
    let mut jobs: Vec<JobInfo> = rows.into_iter().map(|(_, job)| job).collect();
    jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    Ok(jobs)
}

/// Stop a job. Terminal jobs are returned unchanged.
pub async fn stop_job(orch: &Orchestrator, id: Uuid) -> Result<JobInfo, JobError> {
    let finished = Utc::now();
    let job = transition_job(orch.store(), id, JobState::Stopped, |j| {
        j.finished_at = Some(finished);
    })
    .await?
    .ok_or(JobError::NotFound(id))?;
    tracing::info!("Job {} stopped", id);
    Ok(job)
}

/// Delete a job record, adjusting the owning pipeline's tallies.
pub async fn delete_job(orch: &Orchestrator, id: Uuid) -> Result<(), JobError> {
    let key = id.to_string();
    let deleted = orch
        .store()
        .in_txn(async |txn| {
            let Some(job) = txn.get(&JOBS, &key).await? else {
                return Ok(None);
            };
            if let Some(ref pref) = job.pipeline {
                if let Some(mut pipeline) = txn.get(&PIPELINES, &pref.name).await? {
                    pipeline.job_counts.decrement(job.state);
                    txn.put(&PIPELINES, &pref.name, &pipeline)?;
                }
            }
            txn.delete(&JOBS, &key);
            Ok(Some(job))
        })
        .await?
        .ok_or(JobError::NotFound(id))?;

    if deleted.pipeline.is_none() {
        let group = job_group(&orch.config().group_prefix, &id);
        if let Err(err) = orch.cluster().delete_replica_group(&group).await {
            if !err.is_not_found() {
                tracing::warn!(job = %id, error = %err, "failed to delete worker group");
            }
        }
    }

    tracing::info!("Job deleted: {}", id);
    Ok(())
}

/// Re-process datums of a running job. Datums matching every filter
/// path are interrupted and put back on the queue; with no filters all
/// in-flight datums restart.
pub async fn restart_datum(
    orch: &Orchestrator,
    id: Uuid,
    req: RestartDatumRequest,
) -> Result<(), JobError> {
    let job = orch
        .store()
        .get(&JOBS, &id.to_string())
        .await?
        .ok_or(JobError::NotFound(id))?;
    if job.state != JobState::Running {
        return Err(JobError::NotRunning(id));
    }
    let Some(control) = orch.pool_control(&id) else {
        return Err(JobError::NotRunning(id));
    };
    // No receivers means no datum is being worked on right now; queued
    // datums are already where a restart would put them.
    let _ = control.send(PoolControl::RestartDatums {
        data_filters: req.data_filters,
    });
    tracing::info!("Restarting datums for job {}", id);
    Ok(())
}

/// Rewrites branch names in atom commits to the concrete commit IDs
/// they resolve to, verifying each commit exists.
async fn resolve_input_commits(orch: &Orchestrator, input: &mut Input) -> Result<(), JobError> {
    let mut resolved: HashMap<(String, String), String> = HashMap::new();
    for atom in input.atoms() {
        let commit = Commit::new(atom.repo.clone(), atom.commit.clone());
        let info = orch.vfs().inspect_commit(&commit).await.map_err(|err| {
            if err.is_not_found() {
                JobError::ValidationError(err.to_string())
            } else {
                JobError::VfsError(err)
            }
        })?;
        resolved.insert((atom.repo.clone(), atom.commit.clone()), info.commit.id);
    }
    input.visit_mut(&mut |node| {
        if let Input::Atom(atom) = node {
            let key = (atom.repo.clone(), atom.commit.clone());
            if let Some(id) = resolved.get(&key) {
                atom.commit = id.clone();
            }
        }
    });
    Ok(())
}
