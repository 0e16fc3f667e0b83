//! Log DTOs for the orchestrator API

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Query for log streaming; exactly one of `pipeline` or `job` must be
/// set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetLogsQuery {
    #[serde(default)]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub job: Option<Uuid>,
    /// Comma-separated datum paths; a line is kept only if its datum
    /// contains all of them.
    #[serde(default)]
    pub data_filters: Option<String>,
}

impl GetLogsQuery {
    pub fn data_filter_list(&self) -> Vec<String> {
        self.data_filters
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
