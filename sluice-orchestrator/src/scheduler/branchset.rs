//! Input branch tracking.
//!
//! A pipeline reacts to new data by watching the head of every branch
//! its input tree names. The tracker subscribes to each distinct
//! branch, waits until all of them have a head, and then emits one
//! [`BranchSet`] per observed combination. Bursts coalesce to the
//! newest combination and consecutive duplicates are dropped.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sluice_core::domain::commit::{Branch, Commit};
use sluice_core::domain::input::Input;

use crate::vfs::{Vfs, VfsError};

/// Heads of every input branch at one instant, sorted by branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSet {
    pub heads: Vec<(Branch, Commit)>,
}

impl BranchSet {
    pub fn head_of(&self, branch: &Branch) -> Option<&Commit> {
        self.heads
            .iter()
            .find(|(b, _)| b == branch)
            .map(|(_, commit)| commit)
    }
}

/// Spawns watchers for every distinct branch in `input` and returns a
/// channel of complete head sets. A watcher error ends the channel
/// after one terminal `Err`; cancelling the token tears everything
/// down.
pub fn track(
    vfs: Arc<dyn Vfs>,
    input: &Input,
    token: CancellationToken,
) -> mpsc::Receiver<Result<BranchSet, VfsError>> {
    let mut branches: Vec<(Branch, Option<String>)> = Vec::new();
    for atom in input.atoms() {
        let branch = Branch::new(atom.repo.clone(), atom.commit.clone());
        if !branches.iter().any(|(b, _)| *b == branch) {
            branches.push((branch, atom.from_commit.clone()));
        }
    }
    let expected = branches.len();

    let (head_tx, mut head_rx) = mpsc::channel::<Result<(Branch, Commit), VfsError>>(16);
    for (branch, from) in branches {
        let vfs = vfs.clone();
        let head_tx = head_tx.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let mut stream = match vfs
                .subscribe_branch(&branch.repo, &branch.name, from)
                .await
            {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = head_tx.send(Err(err)).await;
                    return;
                }
            };
            loop {
                tokio::select! {
                    item = stream.next() => match item {
                        Some(Ok(commit)) => {
                            if head_tx.send(Ok((branch.clone(), commit))).await.is_err() {
                                return;
                            }
                        }
                        Some(Err(err)) => {
                            let _ = head_tx.send(Err(err)).await;
                            return;
                        }
                        None => return,
                    },
                    _ = token.cancelled() => return,
                }
            }
        });
    }
    drop(head_tx);

    let (set_tx, set_rx) = mpsc::channel::<Result<BranchSet, VfsError>>(8);
    tokio::spawn(async move {
        let mut heads: HashMap<Branch, Commit> = HashMap::new();
        let mut last: Option<BranchSet> = None;
        loop {
            let item = tokio::select! {
                item = head_rx.recv() => item,
                _ = token.cancelled() => return,
            };
            let Some(mut item) = item else { return };
            // Coalesce whatever else already arrived.
            loop {
                match item {
                    Ok((branch, commit)) => {
                        heads.insert(branch, commit);
                    }
                    Err(err) => {
                        let _ = set_tx.send(Err(err)).await;
                        return;
                    }
                }
                match head_rx.try_recv() {
                    Ok(next) => item = next,
                    Err(_) => break,
                }
            }
            if heads.len() < expected {
                continue;
            }

            let mut combo: Vec<(Branch, Commit)> = heads
                .iter()
                .map(|(branch, commit)| (branch.clone(), commit.clone()))
                .collect();
            combo.sort_by(|a, b| a.0.cmp(&b.0));
            let set = BranchSet { heads: combo };
            if last.as_ref() == Some(&set) {
                continue;
            }
            last = Some(set.clone());
            if set_tx.send(Ok(set)).await.is_err() {
                return;
            }
        }
    });
    set_rx
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use sluice_core::domain::input::AtomInput;

    use crate::vfs::memory::MemVfs;

    use super::*;

    fn atom(name: &str, repo: &str) -> Input {
        Input::Atom(AtomInput {
            name: name.to_string(),
            repo: repo.to_string(),
            commit: "master".to_string(),
            glob: "/*".to_string(),
            lazy: false,
            from_commit: None,
        })
    }

    async fn recv(
        rx: &mut mpsc::Receiver<Result<BranchSet, VfsError>>,
    ) -> BranchSet {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for branch set")
            .expect("channel closed")
            .expect("tracker error")
    }

    #[tokio::test]
    async fn test_waits_for_all_branches() {
        let vfs = Arc::new(MemVfs::new());
        vfs.create_repo("alpha", Vec::new()).await.unwrap();
        vfs.create_repo("beta", Vec::new()).await.unwrap();
        let input = Input::Cross(vec![atom("a", "alpha"), atom("b", "beta")]);

        let token = CancellationToken::new();
        let mut rx = track(vfs.clone(), &input, token.clone());

        let a1 = vfs.commit_files("alpha", "master", &[("/a", b"1")]).unwrap();
        // Only one branch has a head; nothing complete yet.
        let b1 = vfs.commit_files("beta", "master", &[("/b", b"1")]).unwrap();

        let set = recv(&mut rx).await;
        assert_eq!(set.heads.len(), 2);
        assert_eq!(set.head_of(&Branch::new("alpha", "master")), Some(&a1));
        assert_eq!(set.head_of(&Branch::new("beta", "master")), Some(&b1));

        token.cancel();
    }

    #[tokio::test]
    async fn test_new_head_emits_new_set() {
        let vfs = Arc::new(MemVfs::new());
        vfs.create_repo("alpha", Vec::new()).await.unwrap();
        let input = atom("a", "alpha");

        let token = CancellationToken::new();
        let mut rx = track(vfs.clone(), &input, token.clone());

        let first = vfs.commit_files("alpha", "master", &[("/a", b"1")]).unwrap();
        let set = recv(&mut rx).await;
        assert_eq!(set.head_of(&Branch::new("alpha", "master")), Some(&first));

        let second = vfs.commit_files("alpha", "master", &[("/b", b"2")]).unwrap();
        let set = recv(&mut rx).await;
        assert_eq!(set.head_of(&Branch::new("alpha", "master")), Some(&second));

        token.cancel();
    }

    #[tokio::test]
    async fn test_from_commit_skips_current_head() {
        let vfs = Arc::new(MemVfs::new());
        vfs.create_repo("alpha", Vec::new()).await.unwrap();
        let first = vfs.commit_files("alpha", "master", &[("/a", b"1")]).unwrap();

        let input = Input::Atom(AtomInput {
            name: "a".to_string(),
            repo: "alpha".to_string(),
            commit: "master".to_string(),
            glob: "/*".to_string(),
            lazy: false,
            from_commit: Some(first.id.clone()),
        });

        let token = CancellationToken::new();
        let mut rx = track(vfs.clone(), &input, token.clone());

        // The pre-existing head is skipped, the next commit arrives.
        let second = vfs.commit_files("alpha", "master", &[("/b", b"2")]).unwrap();
        let set = recv(&mut rx).await;
        assert_eq!(set.head_of(&Branch::new("alpha", "master")), Some(&second));

        token.cancel();
    }

    #[tokio::test]
    async fn test_same_branch_twice_tracked_once() {
        let vfs = Arc::new(MemVfs::new());
        vfs.create_repo("alpha", Vec::new()).await.unwrap();
        // Same repo and branch under two names crosses with itself.
        let input = Input::Cross(vec![atom("x", "alpha"), atom("y", "alpha")]);

        let token = CancellationToken::new();
        let mut rx = track(vfs.clone(), &input, token.clone());

        vfs.commit_files("alpha", "master", &[("/a", b"1")]).unwrap();
        let set = recv(&mut rx).await;
        assert_eq!(set.heads.len(), 1);

        token.cancel();
    }
}
