//! Pipeline input trees
//!
//! An input describes where a pipeline's data comes from: a single repo
//! branch (atom), the cross product of several inputs, or their union.
//! Jobs carry a snapshot of the same tree with branches resolved to
//! concrete commit IDs.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::commit::{Commit, DEFAULT_BRANCH};

/// A tree of data sources for a pipeline or job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Input {
    Atom(AtomInput),
    Cross(Vec<Input>),
    Union(Vec<Input>),
}

/// A single repo/branch data source.
///
/// `commit` names a branch when the input belongs to a pipeline and a
/// concrete commit ID once it has been resolved into a job snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomInput {
    #[serde(default)]
    pub name: String,
    pub repo: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub glob: String,
    #[serde(default)]
    pub lazy: bool,
    /// Lower bound for incremental processing, cleared during resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_commit: Option<String>,
}

/// Which fields an input tree must carry to be usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Atoms name a branch to watch.
    Pipeline,
    /// Atoms name a resolved commit ID.
    Job,
}

/// Structural validation failure for an input tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("input must specify a name")]
    MissingName,
    #[error("input cannot be named \"out\", the output tree is mounted there")]
    ReservedName,
    #[error("input {0} must specify a repo")]
    MissingRepo(String),
    #[error("input {0} must specify a commit ID")]
    MissingCommit(String),
    #[error("input {0} must specify a branch")]
    MissingBranch(String),
    #[error("input {0} must specify a glob")]
    MissingGlob(String),
    #[error("conflicting input names: {0}")]
    ConflictingName(String),
    #[error("cross and union inputs need at least one child")]
    Empty,
}

impl Input {
    /// Visits every node in ascending order (children before parents,
    /// root last).
    pub fn visit<'a, F>(&'a self, f: &mut F)
    where
        F: FnMut(&'a Input),
    {
        if let Input::Cross(children) | Input::Union(children) = self {
            for child in children {
                child.visit(f);
            }
        }
        f(self);
    }

    /// Mutable variant of [`visit`](Self::visit), same order.
    pub fn visit_mut<F>(&mut self, f: &mut F)
    where
        F: FnMut(&mut Input),
    {
        if let Input::Cross(children) | Input::Union(children) = self {
            for child in children {
                child.visit_mut(f);
            }
        }
        f(self);
    }

    /// The node's sort key: an atom's own name, or the name of the first
    /// child for cross and union nodes.
    pub fn name(&self) -> &str {
        match self {
            Input::Atom(atom) => &atom.name,
            Input::Cross(children) | Input::Union(children) => {
                children.first().map_or("", |child| child.name())
            }
        }
    }

    /// Sorts every level of the tree by node name. The sort is stable, so
    /// two trees containing the same nodes end up identical regardless of
    /// the order they were written in.
    pub fn sort_by_name(&mut self) {
        self.visit_mut(&mut |input| {
            if let Input::Cross(children) | Input::Union(children) = input {
                children.sort_by(|a, b| a.name().cmp(b.name()));
            }
        });
    }

    /// Fills omitted atom fields: the commit defaults to the default
    /// branch and the name defaults to the repo name.
    pub fn apply_defaults(&mut self) {
        self.visit_mut(&mut |input| {
            if let Input::Atom(atom) = input {
                if atom.commit.is_empty() {
                    atom.commit = DEFAULT_BRANCH.to_string();
                }
                if atom.name.is_empty() {
                    atom.name = atom.repo.clone();
                }
            }
        });
    }

    /// All atoms of the tree in visit order.
    pub fn atoms(&self) -> Vec<&AtomInput> {
        let mut result = Vec::new();
        self.visit(&mut |input| {
            if let Input::Atom(atom) = input {
                result.push(atom);
            }
        });
        result
    }

    /// The commits referenced by the tree's atoms, in visit order. Only
    /// meaningful once the tree has been resolved into a job snapshot.
    pub fn commits(&self) -> Vec<Commit> {
        self.atoms()
            .into_iter()
            .map(|atom| Commit::new(atom.repo.clone(), atom.commit.clone()))
            .collect()
    }

    /// Checks the tree structurally. Atom names must be present, unique
    /// across the whole tree, and not collide with the output mount;
    /// every atom needs a repo, a glob, and a commit ID (job mode) or
    /// branch (pipeline mode). Existence of the referenced repos and
    /// commits is checked separately against the filesystem.
    pub fn validate(&self, mode: InputMode) -> Result<(), InputError> {
        let mut names = HashSet::new();
        self.validate_inner(mode, &mut names)
    }

    fn validate_inner(
        &self,
        mode: InputMode,
        names: &mut HashSet<String>,
    ) -> Result<(), InputError> {
        match self {
            Input::Atom(atom) => {
                if atom.name.is_empty() {
                    return Err(InputError::MissingName);
                }
                if atom.name == "out" {
                    return Err(InputError::ReservedName);
                }
                if atom.repo.is_empty() {
                    return Err(InputError::MissingRepo(atom.name.clone()));
                }
                if atom.commit.is_empty() {
                    return Err(match mode {
                        InputMode::Job => InputError::MissingCommit(atom.name.clone()),
                        InputMode::Pipeline => InputError::MissingBranch(atom.name.clone()),
                    });
                }
                if atom.glob.is_empty() {
                    return Err(InputError::MissingGlob(atom.name.clone()));
                }
                if !names.insert(atom.name.clone()) {
                    return Err(InputError::ConflictingName(atom.name.clone()));
                }
                Ok(())
            }
            Input::Cross(children) | Input::Union(children) => {
                if children.is_empty() {
                    return Err(InputError::Empty);
                }
                for child in children {
                    child.validate_inner(mode, names)?;
                }
                Ok(())
            }
        }
    }
}
