//! Worker log types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One log line emitted by a worker, attributed to the pipeline, job and
/// datum it was processing at the time.
///
/// Workers write these as JSON lines on stdout; the orchestrator parses
/// and filters them when serving log requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    #[serde(default)]
    pub pipeline_name: Option<String>,
    #[serde(default)]
    pub job_id: Option<Uuid>,
    /// Input paths of the datum being processed.
    #[serde(default)]
    pub data: Vec<String>,
    /// Name of the worker task that emitted the line.
    #[serde(default)]
    pub task: String,
    pub ts: chrono::DateTime<chrono::Utc>,
    pub message: String,
}

impl LogMessage {
    /// True when every filter string names one of the line's datum paths.
    pub fn matches_data_filters<S: AsRef<str>>(&self, filters: &[S]) -> bool {
        filters
            .iter()
            .all(|f| self.data.iter().any(|path| path == f.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_filters() {
        let msg = LogMessage {
            pipeline_name: Some("edges".to_string()),
            job_id: None,
            data: vec!["/a.png".to_string()],
            task: "worker-0".to_string(),
            ts: chrono::Utc::now(),
            message: "processed".to_string(),
        };
        assert!(msg.matches_data_filters::<&str>(&[]));
        assert!(msg.matches_data_filters(&["/a.png"]));
        assert!(!msg.matches_data_filters(&["/b.png"]));
    }
}
