//! Pipeline Service
//!
//! Business logic for pipeline management.

use chrono::Utc;
use uuid::Uuid;

use sluice_core::domain::commit::DEFAULT_BRANCH;
use sluice_core::domain::input::InputMode;
use sluice_core::domain::job::JobState;
use sluice_core::domain::pipeline::{JobCounts, PipelineInfo, PipelineState};
use sluice_core::dto::pipeline::{CreatePipelineRequest, DeletePipelineQuery};

use crate::cluster::{job_group, pipeline_group};
use crate::scheduler::job::transition_job;
use crate::scheduler::Orchestrator;
use crate::store::{StoreError, INDEX_PIPELINE, JOBS, PIPELINES};
use crate::vfs::VfsError;

/// Service error type
#[derive(Debug)]
pub enum PipelineError {
    NotFound(String),
    AlreadyExists(String),
    ValidationError(String),
    StoreError(StoreError),
    VfsError(VfsError),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        PipelineError::StoreError(err)
    }
}

impl From<VfsError> for PipelineError {
    fn from(err: VfsError) -> Self {
        PipelineError::VfsError(err)
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::NotFound(name) => write!(f, "pipeline {name} not found"),
            PipelineError::AlreadyExists(name) => {
                write!(f, "pipeline {name} already exists, pass update to replace it")
            }
            PipelineError::ValidationError(msg) => write!(f, "{msg}"),
            PipelineError::StoreError(err) => write!(f, "store error: {err}"),
            PipelineError::VfsError(err) => write!(f, "filesystem error: {err}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

enum CreateOutcome {
    Created(PipelineInfo),
    Updated {
        info: PipelineInfo,
        old_version: u64,
        old_branch: String,
    },
    Exists,
}

/// Create a new pipeline, or replace one when `update` is set.
///
/// The pipeline's output repo shares its name; a version bump archives
/// the old output branch as `<branch>-v<version>` so the new version
/// starts a fresh lineage.
pub async fn create_pipeline(
    orch: &Orchestrator,
    mut req: CreatePipelineRequest,
) -> Result<PipelineInfo> {
    validate_pipeline_request(&req)?;

    req.input.apply_defaults();
    req.input.sort_by_name();
    req.input
        .validate(InputMode::Pipeline)
        .map_err(|err| PipelineError::ValidationError(err.to_string()))?;

    for atom in req.input.atoms() {
        if atom.repo == req.name {
            return Err(PipelineError::ValidationError(format!(
                "pipeline {} cannot read its own output repo",
                req.name
            )));
        }
        orch.vfs().inspect_repo(&atom.repo).await?;
    }

    // A fresh pipeline claims its name as an output repo, so the name
    // must not collide with an existing data repo.
    if !req.update && orch.store().get(&PIPELINES, &req.name).await?.is_none() {
        match orch.vfs().inspect_repo(&req.name).await {
            Ok(_) => {
                return Err(PipelineError::ValidationError(format!(
                    "repo {} already exists",
                    req.name
                )));
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
    }

    let name = req.name.clone();
    let outcome = orch
        .store()
        .in_txn(async |txn| {
            match txn.get(&PIPELINES, &name).await? {
                None => {
                    let info = build_info(&req, Uuid::new_v4(), 1, Utc::now());
                    txn.put(&PIPELINES, &name, &info)?;
                    Ok(CreateOutcome::Created(info))
                }
                Some(_) if !req.update => Ok(CreateOutcome::Exists),
                Some(existing) => {
                    let mut info = build_info(&req, existing.id, existing.version + 1, Utc::now());
                    info.created_at = existing.created_at;
                    txn.put(&PIPELINES, &name, &info)?;
                    Ok(CreateOutcome::Updated {
                        info,
                        old_version: existing.version,
                        old_branch: existing.output_branch,
                    })
                }
            }
        })
        .await?;

    match outcome {
        CreateOutcome::Created(info) => {
            tracing::info!("Pipeline created: {} ({})", info.name, info.id);
            Ok(info)
        }
        CreateOutcome::Updated {
            info,
            old_version,
            old_branch,
        } => {
            archive_output_branch(orch, &info.name, &old_branch, old_version).await;
            tracing::info!(
                "Pipeline updated: {} (version {} -> {})",
                info.name,
                old_version,
                info.version
            );
            Ok(info)
        }
        CreateOutcome::Exists => Err(PipelineError::AlreadyExists(name)),
    }
}

/// Get a pipeline by name
pub async fn inspect_pipeline(orch: &Orchestrator, name: &str) -> Result<PipelineInfo> {
    orch.store()
        .get(&PIPELINES, name)
        .await?
        .ok_or_else(|| PipelineError::NotFound(name.to_string()))
}

/// List all pipelines, ordered by name
pub async fn list_pipelines(orch: &Orchestrator) -> Result<Vec<PipelineInfo>> {
    let rows = orch.store().list(&PIPELINES).await?;
    Ok(rows.into_iter().map(|(_, info)| info).collect())
}

/// Resume a stopped pipeline
pub async fn start_pipeline(orch: &Orchestrator, name: &str) -> Result<PipelineInfo> {
    set_stopped(orch, name, false).await
}

/// Pause a pipeline. Its controller shuts down and no new jobs are
/// created; jobs already running continue to completion.
pub async fn stop_pipeline(orch: &Orchestrator, name: &str) -> Result<PipelineInfo> {
    set_stopped(orch, name, true).await
}

/// Delete a pipeline along with its controllers and worker groups.
///
/// Jobs are stopped by default and deleted with `delete_jobs`. The
/// output repo is left in place, the data outlives the pipeline.
pub async fn delete_pipeline(
    orch: &Orchestrator,
    name: &str,
    opts: DeletePipelineQuery,
) -> Result<()> {
    let info = inspect_pipeline(orch, name).await?;

    let jobs = orch.store().index_scan(&JOBS, INDEX_PIPELINE, name).await?;
    for (key, job) in &jobs {
        if opts.delete_jobs {
            orch.store()
                .in_txn(async |txn| {
                    txn.delete(&JOBS, key);
                    Ok(())
                })
                .await?;
        } else if !job.state.is_terminal() {
            let finished = Utc::now();
            transition_job(orch.store(), job.id, JobState::Stopped, |j| {
                j.finished_at = Some(finished);
            })
            .await?;
        }
    }

    // Deleting the row cancels the controller through dispatch, so the
    // service owns the group cleanup.
    let prefix = orch.config().group_prefix.clone();
    for version in 1..=info.version {
        let group = pipeline_group(&prefix, name, version);
        if let Err(err) = orch.cluster().delete_replica_group(&group).await {
            if !err.is_not_found() {
                tracing::warn!(pipeline = name, error = %err, "failed to delete worker group");
            }
        }
    }

    orch.store()
        .in_txn(async |txn| {
            txn.delete(&PIPELINES, name);
            Ok(())
        })
        .await?;

    tracing::info!("Pipeline deleted: {}", name);
    Ok(())
}

/// Delete every pipeline and job. Used to reset a cluster.
pub async fn delete_all(orch: &Orchestrator) -> Result<()> {
    let pipelines = list_pipelines(orch).await?;
    for info in pipelines {
        delete_pipeline(orch, &info.name, DeletePipelineQuery { delete_jobs: true }).await?;
    }
    // Orphan jobs are not reachable through any pipeline.
    let prefix = orch.config().group_prefix.clone();
    let jobs = orch.store().list(&JOBS).await?;
    for (key, job) in &jobs {
        orch.store()
            .in_txn(async |txn| {
                txn.delete(&JOBS, key);
                Ok(())
            })
            .await?;
        if job.pipeline.is_none() {
            let group = job_group(&prefix, &job.id);
            if let Err(err) = orch.cluster().delete_replica_group(&group).await {
                if !err.is_not_found() {
                    tracing::warn!(job = %job.id, error = %err, "failed to delete worker group");
                }
            }
        }
    }
    tracing::info!("All pipelines and jobs deleted");
    Ok(())
}

async fn set_stopped(orch: &Orchestrator, name: &str, stopped: bool) -> Result<PipelineInfo> {
    let updated = orch
        .store()
        .in_txn(async |txn| {
            let Some(mut info) = txn.get(&PIPELINES, name).await? else {
                return Ok(None);
            };
            if info.stopped == stopped {
                return Ok(Some(info));
            }
            info.stopped = stopped;
            info.state = if stopped {
                PipelineState::Stopped
            } else {
                PipelineState::Starting
            };
            txn.put(&PIPELINES, name, &info)?;
            Ok(Some(info))
        })
        .await?;
    updated.ok_or_else(|| PipelineError::NotFound(name.to_string()))
}

/// Keeps the replaced version's output reachable under
/// `<branch>-v<version>` and clears the live branch. Best effort, the
/// update has already been recorded.
async fn archive_output_branch(orch: &Orchestrator, repo: &str, branch: &str, version: u64) {
    let head = match orch.vfs().branch_head(repo, branch).await {
        Ok(Some(head)) => head,
        Ok(None) => return,
        Err(err) => {
            if !err.is_not_found() {
                tracing::warn!(repo, branch, error = %err, "failed to read output branch");
            }
            return;
        }
    };
    let archive = format!("{branch}-v{version}");
    if let Err(err) = orch.vfs().set_branch(repo, &archive, &head.id).await {
        tracing::warn!(repo, branch = archive, error = %err, "failed to archive output branch");
        return;
    }
    if let Err(err) = orch.vfs().delete_branch(repo, branch).await {
        if !err.is_not_found() {
            tracing::warn!(repo, branch, error = %err, "failed to clear output branch");
        }
    }
}

fn build_info(
    req: &CreatePipelineRequest,
    id: Uuid,
    version: u64,
    now: chrono::DateTime<Utc>,
) -> PipelineInfo {
    PipelineInfo {
        id,
        name: req.name.clone(),
        version,
        transform: req.transform.clone(),
        parallelism: req.parallelism.unwrap_or_default(),
        input: req.input.clone(),
        output_branch: req
            .output_branch
            .clone()
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
        egress: req.egress.clone(),
        scale_down_threshold: req.scale_down_threshold,
        state: PipelineState::Starting,
        job_counts: JobCounts::default(),
        stopped: false,
        created_at: now,
    }
}

// =============================================================================
// Validation
// =============================================================================

fn validate_pipeline_request(req: &CreatePipelineRequest) -> Result<()> {
    validate_name(&req.name)?;

    if req.transform.image.trim().is_empty() {
        return Err(PipelineError::ValidationError(
            "Transform image cannot be empty".to_string(),
        ));
    }

    if let Some(ref egress) = req.egress {
        if egress.url.trim().is_empty() {
            return Err(PipelineError::ValidationError(
                "Egress URL cannot be empty".to_string(),
            ));
        }
    }

    Ok(())
}

/// Pipeline names end up in worker group names, so the usual DNS label
/// rules apply.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PipelineError::ValidationError(
            "Pipeline name cannot be empty".to_string(),
        ));
    }
    if name.len() > 63 {
        return Err(PipelineError::ValidationError(
            "Pipeline name is too long (max 63 characters)".to_string(),
        ));
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_edges = !name.starts_with('-') && !name.ends_with('-');
    if !valid_chars || !valid_edges {
        return Err(PipelineError::ValidationError(format!(
            "Pipeline name {name} must consist of lowercase letters, digits and dashes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::domain::input::{AtomInput, Input};
    use sluice_core::domain::pipeline::Transform;

    fn request(name: &str) -> CreatePipelineRequest {
        CreatePipelineRequest {
            name: name.to_string(),
            transform: Transform {
                image: "busybox".to_string(),
                cmd: vec!["cp".to_string()],
                env: Default::default(),
            },
            parallelism: None,
            input: Input::Atom(AtomInput {
                name: "data".to_string(),
                repo: "data".to_string(),
                commit: "master".to_string(),
                glob: "/*".to_string(),
                lazy: false,
                from_commit: None,
            }),
            output_branch: None,
            egress: None,
            scale_down_threshold: None,
            update: false,
        }
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        for name in ["", "-edges", "edges-", "Edges", "has_underscore", "a b"] {
            let result = validate_pipeline_request(&request(name));
            assert!(
                matches!(result, Err(PipelineError::ValidationError(_))),
                "name {name:?} should be rejected"
            );
        }
        let long = "x".repeat(64);
        assert!(validate_pipeline_request(&request(&long)).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_image() {
        let mut req = request("edges");
        req.transform.image = "  ".to_string();
        let result = validate_pipeline_request(&req);
        assert!(matches!(result, Err(PipelineError::ValidationError(_))));
    }

    #[test]
    fn test_validate_accepts_valid_request() {
        assert!(validate_pipeline_request(&request("edges")).is_ok());
        assert!(validate_pipeline_request(&request("edges-v2")).is_ok());
    }
}
