//! Commit and branch identifiers for the versioned filesystem

use serde::{Deserialize, Serialize};

/// Branch used whenever a pipeline or input omits one.
pub const DEFAULT_BRANCH: &str = "master";

/// A commit in a repository of the versioned filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Commit {
    pub repo: String,
    pub id: String,
}

impl Commit {
    pub fn new(repo: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.repo, self.id)
    }
}

/// A named branch in a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Branch {
    pub repo: String,
    pub name: String,
}

impl Branch {
    pub fn new(repo: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.repo, self.name)
    }
}
