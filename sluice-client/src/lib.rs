//! Sluice Client Library
//!
//! HTTP client for the Sluice orchestrator API. Wraps the REST surface in
//! typed async methods that share the DTOs from `sluice-core`.
//!
//! # Example
//!
//! ```no_run
//! use sluice_client::OrchestratorClient;
//! use sluice_core::domain::input::{AtomInput, Input};
//! use sluice_core::domain::pipeline::Transform;
//! use sluice_core::dto::pipeline::CreatePipelineRequest;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = OrchestratorClient::new("http://localhost:8080");
//!
//!     let request = CreatePipelineRequest {
//!         name: "edges".to_string(),
//!         transform: Transform {
//!             image: "edge-detector:1.4".to_string(),
//!             cmd: vec!["/bin/process".to_string()],
//!             env: Default::default(),
//!         },
//!         parallelism: None,
//!         input: Input::Atom(AtomInput {
//!             name: String::new(),
//!             repo: "images".to_string(),
//!             commit: String::new(),
//!             glob: "/*".to_string(),
//!             lazy: false,
//!             from_commit: None,
//!         }),
//!         output_branch: None,
//!         egress: None,
//!         scale_down_threshold: None,
//!         update: false,
//!     };
//!     let pipeline = client.create_pipeline(&request).await?;
//!     println!("Created pipeline {} v{}", pipeline.name, pipeline.version);
//!     Ok(())
//! }
//! ```

pub mod error;

mod jobs;
mod logs;
mod pipelines;

pub use error::{ClientError, Result};

/// Client for the Sluice orchestrator API
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    base_url: String,
    client: reqwest::Client,
}

impl OrchestratorClient {
    /// Create a new client for the given base URL.
    ///
    /// A trailing slash on the URL is ignored.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    /// Create a client backed by a caller-supplied `reqwest::Client`.
    ///
    /// Useful for custom timeouts, proxies or connection pools.
    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    /// The base URL this client talks to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Decode a JSON response, mapping non-2xx statuses to `ApiError`.
    pub(crate) async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            response
                .json::<T>()
                .await
                .map_err(|e| ClientError::ParseError(e.to_string()))
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::debug!("API error {}: {}", status, message);
            Err(ClientError::api_error(status.as_u16(), message))
        }
    }

    /// Check the status of a response whose body we do not care about.
    pub(crate) async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::debug!("API error {}: {}", status, message);
            Err(ClientError::api_error(status.as_u16(), message))
        }
    }
}
