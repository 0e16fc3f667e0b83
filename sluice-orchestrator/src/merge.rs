//! Output tree assembly.
//!
//! Every successful datum yields a fragment of files. The merge tree
//! folds fragments together as they arrive and serializes the final
//! tree once, so the job can store it as a single object and build the
//! output commit from it.

use std::collections::{BTreeMap, BTreeSet};

/// Files produced by one datum.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeFragment {
    pub files: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Clone)]
pub enum MergeError {
    /// Two datums wrote different contents to the same path.
    Conflicts(Vec<String>),
    /// The tree was already finished.
    Finished,
    Codec(String),
}

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeError::Conflicts(paths) => {
                write!(f, "conflicting writes to {}", paths.join(", "))
            }
            MergeError::Finished => write!(f, "merge tree already finished"),
            MergeError::Codec(msg) => write!(f, "merge tree encoding failed: {msg}"),
        }
    }
}

#[derive(Debug, Default)]
pub struct MergeTree {
    entries: BTreeMap<String, Vec<u8>>,
    conflicts: BTreeSet<String>,
    finished: bool,
}

impl MergeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one fragment in. Identical bytes at the same path are
    /// idempotent; differing bytes mark the path conflicted, which
    /// surfaces at [`finish`](Self::finish).
    pub fn merge(&mut self, fragment: MergeFragment) -> Result<(), MergeError> {
        if self.finished {
            return Err(MergeError::Finished);
        }
        for (path, content) in fragment.files {
            let path = if path.starts_with('/') {
                path
            } else {
                format!("/{path}")
            };
            match self.entries.get(&path) {
                Some(existing) if *existing != content => {
                    self.conflicts.insert(path);
                }
                _ => {
                    self.entries.insert(path, content);
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Seals the tree and serializes it, or reports the conflicted
    /// paths. Either way no further merges are accepted.
    pub fn finish(&mut self) -> Result<Vec<u8>, MergeError> {
        if self.finished {
            return Err(MergeError::Finished);
        }
        self.finished = true;
        if !self.conflicts.is_empty() {
            return Err(MergeError::Conflicts(
                self.conflicts.iter().cloned().collect(),
            ));
        }
        serde_json::to_vec(&self.entries).map_err(|e| MergeError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(files: &[(&str, &[u8])]) -> MergeFragment {
        MergeFragment {
            files: files
                .iter()
                .map(|(path, content)| (path.to_string(), content.to_vec()))
                .collect(),
        }
    }

    #[test]
    fn test_merge_combines_fragments() {
        let mut tree = MergeTree::new();
        tree.merge(fragment(&[("/a.txt", b"1")])).unwrap();
        tree.merge(fragment(&[("b.txt", b"2")])).unwrap();
        assert_eq!(tree.len(), 2);

        let bytes = tree.finish().unwrap();
        let entries: BTreeMap<String, Vec<u8>> = serde_json::from_slice(&bytes).unwrap();
        // Paths come out normalized and sorted.
        let paths: Vec<&str> = entries.keys().map(|s| s.as_str()).collect();
        assert_eq!(paths, vec!["/a.txt", "/b.txt"]);
    }

    #[test]
    fn test_disjoint_fragments_merge_in_any_order() {
        let a = fragment(&[("/a.txt", b"1"), ("/c.txt", b"3")]);
        let b = fragment(&[("/b.txt", b"2")]);

        let mut forward = MergeTree::new();
        forward.merge(a.clone()).unwrap();
        forward.merge(b.clone()).unwrap();

        let mut reverse = MergeTree::new();
        reverse.merge(b).unwrap();
        reverse.merge(a).unwrap();

        assert_eq!(forward.finish().unwrap(), reverse.finish().unwrap());
    }

    #[test]
    fn test_identical_writes_are_idempotent() {
        let mut tree = MergeTree::new();
        tree.merge(fragment(&[("/a.txt", b"same")])).unwrap();
        tree.merge(fragment(&[("/a.txt", b"same")])).unwrap();
        assert!(tree.finish().is_ok());
    }

    #[test]
    fn test_conflicting_writes_fail_finish() {
        let mut tree = MergeTree::new();
        tree.merge(fragment(&[("/a.txt", b"1"), ("/b.txt", b"x")]))
            .unwrap();
        tree.merge(fragment(&[("/a.txt", b"2")])).unwrap();

        match tree.finish() {
            Err(MergeError::Conflicts(paths)) => assert_eq!(paths, vec!["/a.txt".to_string()]),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_finished_tree_rejects_everything() {
        let mut tree = MergeTree::new();
        tree.finish().unwrap();
        assert!(matches!(
            tree.merge(fragment(&[("/a", b"1")])),
            Err(MergeError::Finished)
        ));
        assert!(matches!(tree.finish(), Err(MergeError::Finished)));
    }
}
