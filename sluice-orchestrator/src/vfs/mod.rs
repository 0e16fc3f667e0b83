//! Versioned filesystem the orchestrator reads inputs from and writes
//! outputs to.
//!
//! The orchestrator never touches storage directly; everything goes
//! through the [`Vfs`] trait: repos hold commits, branches name head
//! commits, commits carry files plus the provenance commits they were
//! derived from. The in-memory implementation backs local mode and
//! tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use sluice_core::domain::commit::Commit;

/// Filesystem error type
#[derive(Debug, Clone)]
pub enum VfsError {
    RepoNotFound(String),
    RepoExists(String),
    CommitNotFound(String),
    BranchNotFound(String),
    FileNotFound(String),
    ObjectNotFound(String),
    InvalidTree(String),
}

impl VfsError {
    pub fn is_exists(&self) -> bool {
        matches!(self, VfsError::RepoExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            VfsError::RepoNotFound(_)
                | VfsError::CommitNotFound(_)
                | VfsError::BranchNotFound(_)
                | VfsError::FileNotFound(_)
                | VfsError::ObjectNotFound(_)
        )
    }
}

impl std::fmt::Display for VfsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VfsError::RepoNotFound(name) => write!(f, "repo {name} not found"),
            VfsError::RepoExists(name) => write!(f, "repo {name} already exists"),
            VfsError::CommitNotFound(id) => write!(f, "commit {id} not found"),
            VfsError::BranchNotFound(name) => write!(f, "branch {name} not found"),
            VfsError::FileNotFound(path) => write!(f, "file {path} not found"),
            VfsError::ObjectNotFound(hash) => write!(f, "object {hash} not found"),
            VfsError::InvalidTree(hash) => write!(f, "object {hash} is not a file tree"),
        }
    }
}

pub type Result<T> = std::result::Result<T, VfsError>;

#[derive(Debug, Clone)]
pub struct RepoInfo {
    pub name: String,
    /// Repos whose commits feed this one, set for pipeline outputs.
    pub provenance: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub commit: Commit,
    pub parent: Option<String>,
    /// Input commits this commit was derived from.
    pub provenance: Vec<Commit>,
    /// Hash of the merged output tree, set for commits built by jobs.
    pub tree: Option<String>,
}

/// Storage operations the orchestrator needs. Commit arguments accept a
/// branch name in place of a commit id and resolve it to the head.
#[async_trait]
pub trait Vfs: Send + Sync {
    async fn create_repo(&self, name: &str, provenance: Vec<String>) -> Result<()>;

    async fn inspect_repo(&self, name: &str) -> Result<RepoInfo>;

    async fn inspect_commit(&self, commit: &Commit) -> Result<CommitInfo>;

    async fn branch_head(&self, repo: &str, branch: &str) -> Result<Option<Commit>>;

    async fn set_branch(&self, repo: &str, branch: &str, commit_id: &str) -> Result<()>;

    async fn delete_branch(&self, repo: &str, branch: &str) -> Result<()>;

    /// Streams head commits of a branch: the current head first (unless
    /// it equals `from`), then every subsequent move.
    async fn subscribe_branch(
        &self,
        repo: &str,
        branch: &str,
        from: Option<String>,
    ) -> Result<BoxStream<'static, Result<Commit>>>;

    /// Paths in a commit matching a glob pattern, sorted. Candidates
    /// include the files, their parent directories, and the root `/`.
    async fn glob_files(&self, commit: &Commit, pattern: &str) -> Result<Vec<String>>;

    async fn get_file(&self, commit: &Commit, path: &str) -> Result<Vec<u8>>;

    /// Stores an immutable blob, returns its content hash.
    async fn put_object(&self, bytes: Vec<u8>) -> Result<String>;

    async fn get_object(&self, hash: &str) -> Result<Vec<u8>>;

    /// Appends a commit holding the file tree in `tree_hash` to a
    /// branch. The previous head becomes the parent.
    async fn build_commit(
        &self,
        repo: &str,
        branch: &str,
        provenance: Vec<Commit>,
        tree_hash: &str,
    ) -> Result<Commit>;

    /// Pushes a finished commit's contents to an external URL.
    async fn push_egress(&self, commit: &Commit, url: &str) -> Result<()>;
}
