//! Channel plumbing between a job controller and the workers chewing
//! through its datums.

use tokio::sync::{broadcast, mpsc};

use sluice_core::domain::datum::Datum;

use crate::merge::MergeFragment;

/// A successfully processed datum and the files it produced.
#[derive(Debug, Clone)]
pub struct DatumResult {
    pub datum: Datum,
    pub fragment: MergeFragment,
}

/// Why a datum came back unprocessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The transform failed; counts against the datum's retry budget.
    Failed,
    /// Processing was abandoned on request; does not count.
    Restarted,
}

#[derive(Debug, Clone)]
pub struct DatumFailure {
    pub datum: Datum,
    pub error: String,
    pub kind: FailureKind,
}

/// Control messages fanned out to every worker of a job.
#[derive(Debug, Clone)]
pub enum PoolControl {
    /// Abandon in-flight datums whose paths match all the filters.
    RestartDatums { data_filters: Vec<String> },
}

/// Controller side of a worker pool. Datums go down `tasks`, outcomes
/// come back on `successes` and `failures`, control fans out through
/// `control`. Dropping the handle closes the task channel and lets the
/// workers drain and exit.
pub struct PoolHandle {
    pub tasks: mpsc::Sender<Datum>,
    pub successes: mpsc::Receiver<DatumResult>,
    pub failures: mpsc::Receiver<DatumFailure>,
    pub control: broadcast::Sender<PoolControl>,
}
