//! Pipeline management operations

use sluice_core::domain::pipeline::PipelineInfo;
use sluice_core::dto::pipeline::{CreatePipelineRequest, PipelineList};

use crate::{OrchestratorClient, Result};

// ============================================================================
// Pipeline Management
// ============================================================================

impl OrchestratorClient {
    /// Create a new pipeline, or update an existing one when `update` is
    /// set on the request.
    ///
    /// # Arguments
    ///
    /// * `req` - The pipeline definition
    ///
    /// # Returns
    ///
    /// The stored pipeline, including its assigned ID and version.
    pub async fn create_pipeline(&self, req: &CreatePipelineRequest) -> Result<PipelineInfo> {
        let url = format!("{}/pipeline/create", self.base_url);
        let response = self.client.post(&url).json(req).send().await?;
        self.handle_response(response).await
    }

    /// List all pipelines
    pub async fn list_pipelines(&self) -> Result<Vec<PipelineInfo>> {
        let url = format!("{}/pipeline/list", self.base_url);
        let response = self.client.get(&url).send().await?;
        let list: PipelineList = self.handle_response(response).await?;
        Ok(list.pipelines)
    }

    /// Get a pipeline by name
    pub async fn inspect_pipeline(&self, name: &str) -> Result<PipelineInfo> {
        let url = format!("{}/pipeline/{}", self.base_url, name);
        let response = self.client.get(&url).send().await?;
        self.handle_response(response).await
    }

    /// Resume a stopped pipeline
    pub async fn start_pipeline(&self, name: &str) -> Result<PipelineInfo> {
        let url = format!("{}/pipeline/{}/start", self.base_url, name);
        let response = self.client.post(&url).send().await?;
        self.handle_response(response).await
    }

    /// Pause a pipeline; running jobs finish but no new ones start
    pub async fn stop_pipeline(&self, name: &str) -> Result<PipelineInfo> {
        let url = format!("{}/pipeline/{}/stop", self.base_url, name);
        let response = self.client.post(&url).send().await?;
        self.handle_response(response).await
    }

    /// Delete a pipeline.
    ///
    /// # Arguments
    ///
    /// * `name` - The pipeline to delete
    /// * `delete_jobs` - Delete the pipeline's jobs too instead of just
    ///   stopping them
    pub async fn delete_pipeline(&self, name: &str, delete_jobs: bool) -> Result<()> {
        let url = format!("{}/pipeline/{}", self.base_url, name);
        let response = self
            .client
            .delete(&url)
            .query(&[("delete_jobs", delete_jobs)])
            .send()
            .await?;
        self.handle_empty_response(response).await
    }

    /// Wipe every pipeline and job from the orchestrator
    pub async fn delete_all(&self) -> Result<()> {
        let url = format!("{}/delete-all", self.base_url);
        let response = self.client.post(&url).send().await?;
        self.handle_empty_response(response).await
    }
}
