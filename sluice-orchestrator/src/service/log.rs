//! Log Service
//!
//! Business logic for reading worker logs back out of the cluster.

use uuid::Uuid;

use sluice_core::domain::log::LogMessage;
use sluice_core::dto::log::GetLogsQuery;

use crate::cluster::{job_group, pipeline_group, ClusterError};
use crate::scheduler::Orchestrator;
use crate::store::{StoreError, JOBS, PIPELINES};

/// Service error type
#[derive(Debug)]
pub enum LogError {
    PipelineNotFound(String),
    JobNotFound(Uuid),
    ValidationError(String),
    CodecError(String),
    StoreError(StoreError),
    ClusterError(ClusterError),
}

impl From<StoreError> for LogError {
    fn from(err: StoreError) -> Self {
        LogError::StoreError(err)
    }
}

impl From<ClusterError> for LogError {
    fn from(err: ClusterError) -> Self {
        LogError::ClusterError(err)
    }
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::PipelineNotFound(name) => write!(f, "pipeline {name} not found"),
            LogError::JobNotFound(id) => write!(f, "job {id} not found"),
            LogError::ValidationError(msg) => write!(f, "{msg}"),
            LogError::CodecError(msg) => write!(f, "{msg}"),
            LogError::StoreError(err) => write!(f, "store error: {err}"),
            LogError::ClusterError(err) => write!(f, "cluster error: {err}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, LogError>;

/// Collect log lines for a pipeline or a job, in stable task order.
///
/// Pipeline queries read the current version's worker group; job
/// queries narrow the same group down to lines stamped with the job's
/// ID. A group that no longer exists yields no lines rather than an
/// error, logs simply age out with their workers.
pub async fn get_logs(orch: &Orchestrator, query: GetLogsQuery) -> Result<Vec<LogMessage>> {
    let filters = query.data_filter_list();
    let prefix = orch.config().group_prefix.clone();

    let (group, job_filter) = match (&query.pipeline, &query.job) {
        (Some(_), Some(_)) | (None, None) => {
            return Err(LogError::ValidationError(
                "Exactly one of pipeline or job must be set".to_string(),
            ));
        }
        (Some(name), None) => {
            let info = orch
                .store()
                .get(&PIPELINES, name)
                .await?
                .ok_or_else(|| LogError::PipelineNotFound(name.clone()))?;
            (pipeline_group(&prefix, name, info.version), None)
        }
        (None, Some(id)) => {
            let job = orch
                .store()
                .get(&JOBS, &id.to_string())
                .await?
                .ok_or(LogError::JobNotFound(*id))?;
            let group = match job.pipeline {
                Some(ref pref) => pipeline_group(&prefix, &pref.name, pref.version),
                None => job_group(&prefix, id),
            };
            (group, Some(*id))
        }
    };

    let tasks = match orch.cluster().list_tasks(&group).await {
        Ok(tasks) => tasks,
        Err(err) if err.is_not_found() => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut messages = Vec::new();
    for task in tasks {
        let bytes = match orch.cluster().task_logs(&task).await {
            Ok(bytes) => bytes,
            Err(err) if err.is_not_found() => continue,
            Err(err) => return Err(err.into()),
        };
        filter_lines(&bytes, &task, job_filter, &filters, &mut messages)?;
    }
    Ok(messages)
}

/// Parses one task's newline-delimited JSON log buffer, keeping lines
/// that match the job and datum filters.
fn filter_lines(
    bytes: &[u8],
    task: &str,
    job: Option<Uuid>,
    filters: &[String],
    out: &mut Vec<LogMessage>,
) -> Result<()> {
    for line in bytes.split(|b| *b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let msg: LogMessage = serde_json::from_slice(line)
            .map_err(|e| LogError::CodecError(format!("bad log line in task {task}: {e}")))?;
        if let Some(job_id) = job {
            if msg.job_id != Some(job_id) {
                continue;
            }
        }
        if !msg.matches_data_filters(filters) {
            continue;
        }
        out.push(msg);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(job: Uuid, data: &[&str], message: &str) -> String {
        let msg = LogMessage {
            pipeline_name: Some("edges".to_string()),
            job_id: Some(job),
            data: data.iter().map(|s| s.to_string()).collect(),
            task: "edges-0".to_string(),
            ts: chrono::Utc::now(),
            message: message.to_string(),
        };
        serde_json::to_string(&msg).unwrap()
    }

    #[test]
    fn test_filter_lines_by_job() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let buffer = format!(
            "{}\n{}\n",
            line(a, &["/1.png"], "first"),
            line(b, &["/2.png"], "second"),
        );

        let mut out = Vec::new();
        filter_lines(buffer.as_bytes(), "edges-0", Some(a), &[], &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message, "first");
    }

    #[test]
    fn test_filter_lines_by_data() {
        let job = Uuid::new_v4();
        let buffer = format!(
            "{}\n{}\n",
            line(job, &["/1.png", "/side.csv"], "both"),
            line(job, &["/1.png"], "one"),
        );

        let mut out = Vec::new();
        let filters = vec!["/side.csv".to_string()];
        filter_lines(buffer.as_bytes(), "edges-0", None, &filters, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message, "both");
    }

    #[test]
    fn test_filter_lines_rejects_garbage() {
        let mut out = Vec::new();
        let result = filter_lines(b"not json\n", "edges-0", None, &[], &mut out);
        assert!(matches!(result, Err(LogError::CodecError(_))));
    }
}
