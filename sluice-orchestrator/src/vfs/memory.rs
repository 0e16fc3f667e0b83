//! In-memory filesystem for local mode and tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use sluice_core::domain::commit::Commit;
use sluice_core::glob::glob_match;

use super::{CommitInfo, RepoInfo, Result, Vfs, VfsError};

const HEAD_BUFFER: usize = 256;

#[derive(Debug, Clone)]
struct HeadEvent {
    repo: String,
    branch: String,
    commit: Commit,
}

#[derive(Debug, Clone)]
struct CommitData {
    parent: Option<String>,
    provenance: Vec<Commit>,
    files: BTreeMap<String, Vec<u8>>,
    tree: Option<String>,
}

struct RepoState {
    info: RepoInfo,
    commits: HashMap<String, CommitData>,
    branches: HashMap<String, String>,
}

#[derive(Default)]
struct State {
    repos: HashMap<String, RepoState>,
    objects: HashMap<String, Vec<u8>>,
    egress: Vec<(Commit, String)>,
}

struct Inner {
    state: Mutex<State>,
    heads: broadcast::Sender<HeadEvent>,
}

#[derive(Clone)]
pub struct MemVfs {
    inner: Arc<Inner>,
}

impl MemVfs {
    pub fn new() -> Self {
        let (heads, _) = broadcast::channel(HEAD_BUFFER);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                heads,
            }),
        }
    }

    /// Appends a commit to a branch carrying the parent's files plus
    /// the given ones. Test entry point for feeding input repos.
    pub fn commit_files(&self, repo: &str, branch: &str, files: &[(&str, &[u8])]) -> Result<Commit> {
        let commit = {
            let mut state = self.inner.state.lock().unwrap();
            let repo_state = state
                .repos
                .get_mut(repo)
                .ok_or_else(|| VfsError::RepoNotFound(repo.to_string()))?;

            let parent = repo_state.branches.get(branch).cloned();
            let mut tree = parent
                .as_ref()
                .and_then(|id| repo_state.commits.get(id))
                .map(|data| data.files.clone())
                .unwrap_or_default();
            for (path, content) in files {
                tree.insert(normalize(path), content.to_vec());
            }

            let id = Uuid::new_v4().simple().to_string();
            repo_state.commits.insert(id.clone(), CommitData {
                parent,
                provenance: Vec::new(),
                files: tree,
                tree: None,
            });
            repo_state.branches.insert(branch.to_string(), id.clone());
            Commit::new(repo, id)
        };
        let _ = self.inner.heads.send(HeadEvent {
            repo: repo.to_string(),
            branch: branch.to_string(),
            commit: commit.clone(),
        });
        Ok(commit)
    }

    /// Everything shipped through [`Vfs::push_egress`] so far.
    pub fn egress_pushes(&self) -> Vec<(Commit, String)> {
        self.inner.state.lock().unwrap().egress.clone()
    }
}

impl Default for MemVfs {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Accepts a commit id or a branch name, returns the commit id.
fn resolve_id(repo_state: &RepoState, id_or_branch: &str) -> Option<String> {
    if repo_state.commits.contains_key(id_or_branch) {
        return Some(id_or_branch.to_string());
    }
    repo_state.branches.get(id_or_branch).cloned()
}

fn resolve_commit<'a>(
    state: &'a State,
    commit: &Commit,
) -> Result<(&'a RepoState, String, &'a CommitData)> {
    let repo_state = state
        .repos
        .get(&commit.repo)
        .ok_or_else(|| VfsError::RepoNotFound(commit.repo.clone()))?;
    let id = resolve_id(repo_state, &commit.id)
        .ok_or_else(|| VfsError::CommitNotFound(commit.to_string()))?;
    let data = repo_state
        .commits
        .get(&id)
        .ok_or_else(|| VfsError::CommitNotFound(commit.to_string()))?;
    Ok((repo_state, id, data))
}

#[async_trait]
impl Vfs for MemVfs {
    async fn create_repo(&self, name: &str, provenance: Vec<String>) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.repos.contains_key(name) {
            return Err(VfsError::RepoExists(name.to_string()));
        }
        state.repos.insert(name.to_string(), RepoState {
            info: RepoInfo {
                name: name.to_string(),
                provenance,
                created_at: Utc::now(),
            },
            commits: HashMap::new(),
            branches: HashMap::new(),
        });
        Ok(())
    }

    async fn inspect_repo(&self, name: &str) -> Result<RepoInfo> {
        let state = self.inner.state.lock().unwrap();
        state
            .repos
            .get(name)
            .map(|repo_state| repo_state.info.clone())
            .ok_or_else(|| VfsError::RepoNotFound(name.to_string()))
    }

    async fn inspect_commit(&self, commit: &Commit) -> Result<CommitInfo> {
        let state = self.inner.state.lock().unwrap();
        let (_, id, data) = resolve_commit(&state, commit)?;
        Ok(CommitInfo {
            commit: Commit::new(commit.repo.clone(), id),
            parent: data.parent.clone(),
            provenance: data.provenance.clone(),
            tree: data.tree.clone(),
        })
    }

    async fn branch_head(&self, repo: &str, branch: &str) -> Result<Option<Commit>> {
        let state = self.inner.state.lock().unwrap();
        let repo_state = state
            .repos
            .get(repo)
            .ok_or_else(|| VfsError::RepoNotFound(repo.to_string()))?;
        Ok(repo_state
            .branches
            .get(branch)
            .map(|id| Commit::new(repo, id.clone())))
    }

    async fn set_branch(&self, repo: &str, branch: &str, commit_id: &str) -> Result<()> {
        let commit = {
            let mut state = self.inner.state.lock().unwrap();
            let repo_state = state
                .repos
                .get_mut(repo)
                .ok_or_else(|| VfsError::RepoNotFound(repo.to_string()))?;
            let id = resolve_id(repo_state, commit_id)
                .ok_or_else(|| VfsError::CommitNotFound(commit_id.to_string()))?;
            repo_state.branches.insert(branch.to_string(), id.clone());
            Commit::new(repo, id)
        };
        let _ = self.inner.heads.send(HeadEvent {
            repo: repo.to_string(),
            branch: branch.to_string(),
            commit,
        });
        Ok(())
    }

    async fn delete_branch(&self, repo: &str, branch: &str) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        let repo_state = state
            .repos
            .get_mut(repo)
            .ok_or_else(|| VfsError::RepoNotFound(repo.to_string()))?;
        repo_state
            .branches
            .remove(branch)
            .map(|_| ())
            .ok_or_else(|| VfsError::BranchNotFound(branch.to_string()))
    }

    async fn subscribe_branch(
        &self,
        repo: &str,
        branch: &str,
        from: Option<String>,
    ) -> Result<BoxStream<'static, Result<Commit>>> {
        // Subscribe before reading the head so no move falls in between.
        let mut events = self.inner.heads.subscribe();
        let head = {
            let state = self.inner.state.lock().unwrap();
            state
                .repos
                .get(repo)
                .and_then(|repo_state| repo_state.branches.get(branch))
                .map(|id| Commit::new(repo, id.clone()))
        };

        let inner = self.inner.clone();
        let repo = repo.to_string();
        let branch = branch.to_string();
        let (tx, rx) = mpsc::channel::<Result<Commit>>(8);
        tokio::spawn(async move {
            if let Some(head) = head {
                if from.as_deref() != Some(head.id.as_str())
                    && tx.send(Ok(head)).await.is_err()
                {
                    return;
                }
            }
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if event.repo == repo && event.branch == branch {
                            if tx.send(Ok(event.commit)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Missed moves; the head is all that matters.
                        let head = {
                            let state = inner.state.lock().unwrap();
                            state
                                .repos
                                .get(&repo)
                                .and_then(|repo_state| repo_state.branches.get(&branch))
                                .map(|id| Commit::new(repo.clone(), id.clone()))
                        };
                        if let Some(head) = head {
                            if tx.send(Ok(head)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn glob_files(&self, commit: &Commit, pattern: &str) -> Result<Vec<String>> {
        let state = self.inner.state.lock().unwrap();
        let (_, _, data) = resolve_commit(&state, commit)?;

        // Files, their parent directories, and the root.
        let mut candidates: BTreeSet<String> = BTreeSet::new();
        candidates.insert("/".to_string());
        for path in data.files.keys() {
            candidates.insert(path.clone());
            let mut dir = path.as_str();
            while let Some(pos) = dir.rfind('/') {
                if pos == 0 {
                    break;
                }
                dir = &dir[..pos];
                candidates.insert(dir.to_string());
            }
        }

        Ok(candidates
            .into_iter()
            .filter(|path| glob_match(pattern, path))
            .collect())
    }

    async fn get_file(&self, commit: &Commit, path: &str) -> Result<Vec<u8>> {
        let state = self.inner.state.lock().unwrap();
        let (_, _, data) = resolve_commit(&state, commit)?;
        data.files
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| VfsError::FileNotFound(path.to_string()))
    }

    async fn put_object(&self, bytes: Vec<u8>) -> Result<String> {
        let hash = blake3::hash(&bytes).to_hex().to_string();
        let mut state = self.inner.state.lock().unwrap();
        state.objects.insert(hash.clone(), bytes);
        Ok(hash)
    }

    async fn get_object(&self, hash: &str) -> Result<Vec<u8>> {
        let state = self.inner.state.lock().unwrap();
        state
            .objects
            .get(hash)
            .cloned()
            .ok_or_else(|| VfsError::ObjectNotFound(hash.to_string()))
    }

    async fn build_commit(
        &self,
        repo: &str,
        branch: &str,
        provenance: Vec<Commit>,
        tree_hash: &str,
    ) -> Result<Commit> {
        let commit = {
            let mut state = self.inner.state.lock().unwrap();
            let bytes = state
                .objects
                .get(tree_hash)
                .ok_or_else(|| VfsError::ObjectNotFound(tree_hash.to_string()))?;
            let files: BTreeMap<String, Vec<u8>> = serde_json::from_slice(bytes)
                .map_err(|_| VfsError::InvalidTree(tree_hash.to_string()))?;

            let repo_state = state
                .repos
                .get_mut(repo)
                .ok_or_else(|| VfsError::RepoNotFound(repo.to_string()))?;
            let parent = repo_state.branches.get(branch).cloned();
            let id = Uuid::new_v4().simple().to_string();
            repo_state.commits.insert(id.clone(), CommitData {
                parent,
                provenance,
                files,
                tree: Some(tree_hash.to_string()),
            });
            repo_state.branches.insert(branch.to_string(), id.clone());
            Commit::new(repo, id)
        };
        let _ = self.inner.heads.send(HeadEvent {
            repo: repo.to_string(),
            branch: branch.to_string(),
            commit: commit.clone(),
        });
        Ok(commit)
    }

    async fn push_egress(&self, commit: &Commit, url: &str) -> Result<()> {
        tracing::info!(commit = %commit, url, "pushing egress");
        let mut state = self.inner.state.lock().unwrap();
        state.egress.push((commit.clone(), url.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_files_chains_parents() {
        let vfs = MemVfs::new();
        vfs.create_repo("data", Vec::new()).await.unwrap();

        let first = vfs.commit_files("data", "master", &[("/a.txt", b"1")]).unwrap();
        let second = vfs.commit_files("data", "master", &[("/b.txt", b"2")]).unwrap();

        let info = vfs.inspect_commit(&second).await.unwrap();
        assert_eq!(info.parent.as_deref(), Some(first.id.as_str()));

        // The second commit carries both files.
        assert_eq!(vfs.get_file(&second, "/a.txt").await.unwrap(), b"1");
        assert_eq!(vfs.get_file(&second, "/b.txt").await.unwrap(), b"2");
        let head = vfs.branch_head("data", "master").await.unwrap();
        assert_eq!(head, Some(second));
    }

    #[tokio::test]
    async fn test_branch_name_resolves_to_head() {
        let vfs = MemVfs::new();
        vfs.create_repo("data", Vec::new()).await.unwrap();
        let commit = vfs.commit_files("data", "master", &[("/a.txt", b"1")]).unwrap();

        let by_branch = Commit::new("data", "master");
        let info = vfs.inspect_commit(&by_branch).await.unwrap();
        assert_eq!(info.commit, commit);
    }

    #[tokio::test]
    async fn test_glob_includes_directories_and_root() {
        let vfs = MemVfs::new();
        vfs.create_repo("data", Vec::new()).await.unwrap();
        let commit = vfs
            .commit_files("data", "master", &[
                ("/logs/a.txt", b"1"),
                ("/logs/b.txt", b"2"),
                ("/readme", b"3"),
            ])
            .unwrap();

        let all = vfs.glob_files(&commit, "/*").await.unwrap();
        assert_eq!(all, vec!["/logs".to_string(), "/readme".to_string()]);

        let logs = vfs.glob_files(&commit, "/logs/*").await.unwrap();
        assert_eq!(logs, vec!["/logs/a.txt".to_string(), "/logs/b.txt".to_string()]);

        let root = vfs.glob_files(&commit, "/").await.unwrap();
        assert_eq!(root, vec!["/".to_string()]);
    }

    #[tokio::test]
    async fn test_subscribe_branch_replays_head_then_moves() {
        let vfs = MemVfs::new();
        vfs.create_repo("data", Vec::new()).await.unwrap();
        let first = vfs.commit_files("data", "master", &[("/a", b"1")]).unwrap();

        let mut stream = vfs.subscribe_branch("data", "master", None).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), first);

        let second = vfs.commit_files("data", "master", &[("/b", b"2")]).unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), second);
    }

    #[tokio::test]
    async fn test_subscribe_branch_skips_from_commit() {
        let vfs = MemVfs::new();
        vfs.create_repo("data", Vec::new()).await.unwrap();
        let first = vfs.commit_files("data", "master", &[("/a", b"1")]).unwrap();

        let mut stream = vfs
            .subscribe_branch("data", "master", Some(first.id.clone()))
            .await
            .unwrap();
        let second = vfs.commit_files("data", "master", &[("/b", b"2")]).unwrap();
        // The head equal to `from` is not replayed.
        assert_eq!(stream.next().await.unwrap().unwrap(), second);
    }

    #[tokio::test]
    async fn test_build_commit_from_tree_object() {
        let vfs = MemVfs::new();
        vfs.create_repo("out", Vec::new()).await.unwrap();

        let mut files = BTreeMap::new();
        files.insert("/result".to_string(), b"42".to_vec());
        let tree = serde_json::to_vec(&files).unwrap();
        let hash = vfs.put_object(tree).await.unwrap();

        let provenance = vec![Commit::new("data", "abc")];
        let commit = vfs
            .build_commit("out", "master", provenance.clone(), &hash)
            .await
            .unwrap();

        assert_eq!(vfs.get_file(&commit, "/result").await.unwrap(), b"42");
        let info = vfs.inspect_commit(&commit).await.unwrap();
        assert_eq!(info.provenance, provenance);
        assert_eq!(info.tree.as_deref(), Some(hash.as_str()));
    }
}
