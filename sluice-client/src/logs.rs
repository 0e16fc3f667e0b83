//! Log retrieval operations

use uuid::Uuid;

use sluice_core::domain::log::LogMessage;
use sluice_core::dto::log::GetLogsQuery;

use crate::{ClientError, OrchestratorClient, Result};

// ============================================================================
// Log Retrieval
// ============================================================================

impl OrchestratorClient {
    /// Fetch logs for a pipeline or a job.
    ///
    /// Exactly one of `pipeline` or `job` must be set on the query. The
    /// server responds with newline-delimited JSON; this method collects
    /// it into a vector of parsed messages.
    pub async fn get_logs(&self, query: &GetLogsQuery) -> Result<Vec<LogMessage>> {
        let url = format!("{}/logs", self.base_url);
        let response = self.client.get(&url).query(query).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), message));
        }

        parse_ndjson(&response.text().await?)
    }

    /// Fetch logs for a pipeline by name
    pub async fn get_pipeline_logs(&self, name: &str) -> Result<Vec<LogMessage>> {
        let query = GetLogsQuery {
            pipeline: Some(name.to_string()),
            ..Default::default()
        };
        self.get_logs(&query).await
    }

    /// Fetch logs for a job by ID
    pub async fn get_job_logs(&self, id: Uuid) -> Result<Vec<LogMessage>> {
        let query = GetLogsQuery {
            job: Some(id),
            ..Default::default()
        };
        self.get_logs(&query).await
    }
}

fn parse_ndjson(body: &str) -> Result<Vec<LogMessage>> {
    let mut messages = Vec::new();
    for line in body.lines().filter(|line| !line.is_empty()) {
        let message: LogMessage = serde_json::from_str(line)
            .map_err(|e| ClientError::ParseError(format!("bad log line: {e}")))?;
        messages.push(message);
    }
    Ok(messages)
}
