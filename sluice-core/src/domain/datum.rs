//! Datums: the unit of work handed to workers

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::domain::commit::Commit;

/// One unit of work: a combination of concrete input files, one entry per
/// atom that contributed to it.
///
/// Identity (equality and hashing) covers the resolved inputs only; the
/// retry counter is delivery bookkeeping and two datums that differ only
/// in retries are the same datum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datum {
    pub inputs: Vec<DatumInput>,
    /// Failed processing attempts so far.
    #[serde(default)]
    pub retries: u64,
}

/// One resolved file within a datum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatumInput {
    pub name: String,
    pub commit: Commit,
    pub path: String,
    pub lazy: bool,
}

impl Datum {
    pub fn new(inputs: Vec<DatumInput>) -> Self {
        Self { inputs, retries: 0 }
    }

    /// The input paths, used for log filtering and restart requests.
    pub fn paths(&self) -> Vec<&str> {
        self.inputs.iter().map(|input| input.path.as_str()).collect()
    }

    /// True when every filter string names one of the datum's paths. An
    /// empty filter matches everything.
    pub fn matches_filters<S: AsRef<str>>(&self, filters: &[S]) -> bool {
        filters
            .iter()
            .all(|f| self.inputs.iter().any(|input| input.path == f.as_ref()))
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        self.inputs == other.inputs
    }
}

impl Eq for Datum {}

impl Hash for Datum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inputs.hash(state);
    }
}
