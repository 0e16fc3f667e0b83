//! Datum enumeration.
//!
//! Expands a resolved input tree against the filesystem: each atom
//! becomes one datum per matched path, a cross becomes the product of
//! its children, a union their concatenation. The set is indexable so
//! the job controller can hand out datums without materializing all of
//! them up front.

use futures::future::BoxFuture;
use futures::FutureExt;

use sluice_core::domain::commit::Commit;
use sluice_core::domain::datum::{Datum, DatumInput};
use sluice_core::domain::input::Input;

use crate::vfs::{Result, Vfs};

enum Node {
    Atom(Vec<DatumInput>),
    Cross(Vec<Node>),
    Union(Vec<Node>),
}

/// The datums of one input snapshot, in a stable order.
pub struct DatumSet {
    root: Node,
}

impl DatumSet {
    pub fn len(&self) -> usize {
        node_len(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> Option<Datum> {
        let mut inputs = Vec::new();
        if collect(&self.root, i, &mut inputs) {
            Some(Datum::new(inputs))
        } else {
            None
        }
    }
}

fn node_len(node: &Node) -> usize {
    match node {
        Node::Atom(entries) => entries.len(),
        Node::Cross(children) => children.iter().map(node_len).product(),
        Node::Union(children) => children.iter().map(node_len).sum(),
    }
}

fn collect(node: &Node, mut i: usize, out: &mut Vec<DatumInput>) -> bool {
    match node {
        Node::Atom(entries) => match entries.get(i) {
            Some(entry) => {
                out.push(entry.clone());
                true
            }
            None => false,
        },
        Node::Cross(children) => {
            // Mixed radix, first child varies fastest.
            for child in children {
                let len = node_len(child);
                if len == 0 {
                    return false;
                }
                let idx = i % len;
                i /= len;
                if !collect(child, idx, out) {
                    return false;
                }
            }
            i == 0
        }
        Node::Union(children) => {
            for child in children {
                let len = node_len(child);
                if i < len {
                    return collect(child, i, out);
                }
                i -= len;
            }
            false
        }
    }
}

/// Expands `input` into its datum set. Atom commits must already be
/// resolved to ids or resolvable branch names.
pub async fn enumerate(vfs: &dyn Vfs, input: &Input) -> Result<DatumSet> {
    let root = build(vfs, input).await?;
    Ok(DatumSet { root })
}

fn build<'a>(vfs: &'a dyn Vfs, input: &'a Input) -> BoxFuture<'a, Result<Node>> {
    async move {
        match input {
            Input::Atom(atom) => {
                let commit = Commit::new(atom.repo.clone(), atom.commit.clone());
                let paths = vfs.glob_files(&commit, &atom.glob).await?;
                let entries = paths
                    .into_iter()
                    .map(|path| DatumInput {
                        name: atom.name.clone(),
                        commit: commit.clone(),
                        path,
                        lazy: atom.lazy,
                    })
                    .collect();
                Ok(Node::Atom(entries))
            }
            Input::Cross(children) => {
                let mut nodes = Vec::with_capacity(children.len());
                for child in children {
                    nodes.push(build(vfs, child).await?);
                }
                Ok(Node::Cross(nodes))
            }
            Input::Union(children) => {
                let mut nodes = Vec::with_capacity(children.len());
                for child in children {
                    nodes.push(build(vfs, child).await?);
                }
                Ok(Node::Union(nodes))
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sluice_core::domain::input::AtomInput;

    use crate::vfs::memory::MemVfs;

    use super::*;

    fn atom(name: &str, repo: &str, glob: &str) -> Input {
        Input::Atom(AtomInput {
            name: name.to_string(),
            repo: repo.to_string(),
            commit: "master".to_string(),
            glob: glob.to_string(),
            lazy: false,
            from_commit: None,
        })
    }

    async fn seeded_vfs() -> Arc<MemVfs> {
        let vfs = Arc::new(MemVfs::new());
        vfs.create_repo("alpha", Vec::new()).await.unwrap();
        vfs.create_repo("beta", Vec::new()).await.unwrap();
        vfs.commit_files("alpha", "master", &[("/a1", b"1"), ("/a2", b"2")])
            .unwrap();
        vfs.commit_files("beta", "master", &[("/b1", b"1"), ("/b2", b"2"), ("/b3", b"3")])
            .unwrap();
        vfs
    }

    #[tokio::test]
    async fn test_atom_one_datum_per_path() {
        let vfs = seeded_vfs().await;
        let set = enumerate(vfs.as_ref(), &atom("a", "alpha", "/*")).await.unwrap();
        assert_eq!(set.len(), 2);

        let first = set.get(0).unwrap();
        assert_eq!(first.inputs.len(), 1);
        assert_eq!(first.inputs[0].path, "/a1");
        assert_eq!(first.inputs[0].name, "a");
        assert_eq!(set.get(1).unwrap().inputs[0].path, "/a2");
        assert!(set.get(2).is_none());
    }

    #[tokio::test]
    async fn test_cross_is_the_product() {
        let vfs = seeded_vfs().await;
        let input = Input::Cross(vec![atom("a", "alpha", "/*"), atom("b", "beta", "/*")]);
        let set = enumerate(vfs.as_ref(), &input).await.unwrap();
        assert_eq!(set.len(), 6);

        // First child varies fastest.
        let d0 = set.get(0).unwrap();
        assert_eq!(d0.paths(), vec!["/a1".to_string(), "/b1".to_string()]);
        let d1 = set.get(1).unwrap();
        assert_eq!(d1.paths(), vec!["/a2".to_string(), "/b1".to_string()]);
        let d2 = set.get(2).unwrap();
        assert_eq!(d2.paths(), vec!["/a1".to_string(), "/b2".to_string()]);
        let d5 = set.get(5).unwrap();
        assert_eq!(d5.paths(), vec!["/a2".to_string(), "/b3".to_string()]);
    }

    #[tokio::test]
    async fn test_union_concatenates() {
        let vfs = seeded_vfs().await;
        let input = Input::Union(vec![atom("a", "alpha", "/*"), atom("b", "beta", "/*")]);
        let set = enumerate(vfs.as_ref(), &input).await.unwrap();
        assert_eq!(set.len(), 5);

        assert_eq!(set.get(0).unwrap().paths(), vec!["/a1".to_string()]);
        assert_eq!(set.get(1).unwrap().paths(), vec!["/a2".to_string()]);
        assert_eq!(set.get(2).unwrap().paths(), vec!["/b1".to_string()]);
        assert_eq!(set.get(4).unwrap().paths(), vec!["/b3".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_match_empties_the_cross() {
        let vfs = seeded_vfs().await;
        let input = Input::Cross(vec![atom("a", "alpha", "/*"), atom("b", "beta", "/none/*")]);
        let set = enumerate(vfs.as_ref(), &input).await.unwrap();
        assert_eq!(set.len(), 0);
        assert!(set.get(0).is_none());
    }
}
