//! Job management operations

use uuid::Uuid;

use sluice_core::domain::job::JobInfo;
use sluice_core::dto::job::{CreateJobRequest, JobList, RestartDatumRequest};

use crate::{OrchestratorClient, Result};

// ============================================================================
// Job Management
// ============================================================================

impl OrchestratorClient {
    /// Create a job.
    ///
    /// Naming a pipeline on the request creates the job under it; leaving
    /// the pipeline unset creates an orphan job, which must carry its own
    /// transform and output repo.
    ///
    /// # Arguments
    ///
    /// * `req` - The job definition
    ///
    /// # Returns
    ///
    /// The stored job with its assigned ID.
    pub async fn create_job(&self, req: &CreateJobRequest) -> Result<JobInfo> {
        let url = format!("{}/job/create", self.base_url);
        let response = self.client.post(&url).json(req).send().await?;
        self.handle_response(response).await
    }

    /// List jobs, newest first, optionally restricted to one pipeline
    pub async fn list_jobs(&self, pipeline: Option<&str>) -> Result<Vec<JobInfo>> {
        let url = format!("{}/job/list", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(pipeline) = pipeline {
            request = request.query(&[("pipeline", pipeline)]);
        }
        let response = request.send().await?;
        let list: JobList = self.handle_response(response).await?;
        Ok(list.jobs)
    }

    /// Get a job by ID.
    ///
    /// With `block` set the call does not return until the job reaches a
    /// terminal state.
    pub async fn inspect_job(&self, id: Uuid, block: bool) -> Result<JobInfo> {
        let url = format!("{}/job/{}", self.base_url, id);
        let response = self
            .client
            .get(&url)
            .query(&[("block", block)])
            .send()
            .await?;
        self.handle_response(response).await
    }

    /// Stop a job, marking it terminally Stopped
    pub async fn stop_job(&self, id: Uuid) -> Result<JobInfo> {
        let url = format!("{}/job/{}/stop", self.base_url, id);
        let response = self.client.post(&url).send().await?;
        self.handle_response(response).await
    }

    /// Queue matching datums of a running job for re-processing.
    ///
    /// An empty filter list restarts every datum.
    pub async fn restart_datum(&self, id: Uuid, req: &RestartDatumRequest) -> Result<()> {
        let url = format!("{}/job/{}/restart-datum", self.base_url, id);
        let response = self.client.post(&url).json(req).send().await?;
        self.handle_empty_response(response).await
    }

    /// Delete a job record
    pub async fn delete_job(&self, id: Uuid) -> Result<()> {
        let url = format!("{}/job/{}", self.base_url, id);
        let response = self.client.delete(&url).send().await?;
        self.handle_empty_response(response).await
    }
}
