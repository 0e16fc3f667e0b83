//! Coordination store
//!
//! Transactional state shared by every orchestrator replica. Rows are
//! JSON documents in named collections with per-row revisions; writes go
//! through optimistic transactions that re-run on conflict, and watches
//! deliver a snapshot followed by live changes so controllers can resume
//! after a crash without missing state.
//!
//! Two backends exist: an in-memory one for local mode and tests, and a
//! Postgres one for real deployments.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use sluice_core::domain::input::Input;
use sluice_core::domain::job::JobInfo;
use sluice_core::domain::pipeline::PipelineInfo;

// ============================================================================
// Errors
// ============================================================================

/// Store error type
#[derive(Debug, Clone)]
pub enum StoreError {
    /// A create hit an existing row.
    AlreadyExists {
        collection: &'static str,
        key: String,
    },
    /// A transaction's read set changed before commit. Retried
    /// internally, only surfaced if a backend cannot say more.
    Conflict,
    /// A watcher fell behind the event stream and must re-establish.
    WatchLagged,
    /// Backend infrastructure failure, safe to retry.
    Backend(String),
    /// A row failed to encode or decode.
    Codec(String),
}

impl StoreError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::AlreadyExists { collection, key } => {
                write!(f, "{collection} {key} already exists")
            }
            StoreError::Conflict => write!(f, "transaction conflict"),
            StoreError::WatchLagged => write!(f, "watch fell behind the event stream"),
            StoreError::Backend(msg) => write!(f, "backend error: {msg}"),
            StoreError::Codec(msg) => write!(f, "codec error: {msg}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Backend contract
// ============================================================================

/// A stored row with its revision.
#[derive(Debug, Clone)]
pub struct Raw {
    pub rev: u64,
    pub value: serde_json::Value,
}

/// A change delivered by a watch.
#[derive(Debug, Clone)]
pub enum RawEvent {
    /// Row created, updated, or entered the watch filter.
    Put { key: String, raw: Raw },
    /// Row deleted or left the watch filter.
    Delete { key: String },
}

/// One observed row a transaction commit validates: the row must still
/// be at this revision (or still absent) when the writes apply.
#[derive(Debug, Clone)]
pub struct ReadGuard {
    pub collection: &'static str,
    pub key: String,
    pub rev: Option<u64>,
}

/// One row write with its precomputed index values. `value: None`
/// deletes the row and clears its index entries.
#[derive(Debug, Clone)]
pub struct RowWrite {
    pub collection: &'static str,
    pub key: String,
    pub value: Option<serde_json::Value>,
    pub index: Vec<IndexWrite>,
}

#[derive(Debug, Clone)]
pub struct IndexWrite {
    pub index: &'static str,
    pub values: Vec<String>,
}

/// Restricts a watch to rows carrying this value in the named index.
#[derive(Debug, Clone)]
pub struct IndexFilter {
    pub index: &'static str,
    pub value: String,
}

/// Storage backend the typed layer sits on.
///
/// Watches deliver the matching rows as an initial burst of puts, then
/// live changes in commit order. With a filter set, a row moving out of
/// the filter arrives as a delete and one moving in as a put.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, collection: &'static str, key: &str) -> Result<Option<Raw>>;

    async fn list(&self, collection: &'static str) -> Result<Vec<(String, Raw)>>;

    async fn index_scan(
        &self,
        collection: &'static str,
        index: &'static str,
        value: &str,
    ) -> Result<Vec<(String, Raw)>>;

    /// Validates every read guard, then applies all writes atomically.
    /// Fails with [`StoreError::Conflict`] when any guard is stale.
    async fn commit(&self, reads: Vec<ReadGuard>, writes: Vec<RowWrite>) -> Result<()>;

    async fn watch(
        &self,
        collection: &'static str,
        filter: Option<IndexFilter>,
    ) -> Result<BoxStream<'static, Result<RawEvent>>>;
}

// ============================================================================
// Typed collections
// ============================================================================

/// Schema of one collection: its name and secondary indexes.
pub struct CollectionSpec<T: 'static> {
    pub name: &'static str,
    pub indexes: &'static [IndexDef<T>],
}

/// One secondary index, fed by an extractor over the row value.
pub struct IndexDef<T: 'static> {
    pub name: &'static str,
    pub extract: fn(&T) -> Vec<String>,
}

impl<T> CollectionSpec<T> {
    fn index_values(&self, value: &T) -> Vec<IndexWrite> {
        self.indexes
            .iter()
            .map(|ix| IndexWrite {
                index: ix.name,
                values: (ix.extract)(value),
            })
            .collect()
    }
}

pub const INDEX_PIPELINE: &str = "pipeline";
pub const INDEX_INPUT: &str = "input";
pub const INDEX_STOPPED: &str = "stopped";

/// Pipelines, keyed by pipeline name.
pub static PIPELINES: CollectionSpec<PipelineInfo> = CollectionSpec {
    name: "pipelines",
    indexes: &[IndexDef {
        name: INDEX_STOPPED,
        extract: pipeline_stopped,
    }],
};

/// Jobs, keyed by job id.
pub static JOBS: CollectionSpec<JobInfo> = CollectionSpec {
    name: "jobs",
    indexes: &[
        IndexDef {
            name: INDEX_PIPELINE,
            extract: job_pipeline,
        },
        IndexDef {
            name: INDEX_INPUT,
            extract: job_input,
        },
        IndexDef {
            name: INDEX_STOPPED,
            extract: job_stopped,
        },
    ],
};

fn pipeline_stopped(pipeline: &PipelineInfo) -> Vec<String> {
    vec![pipeline.stopped.to_string()]
}

fn job_pipeline(job: &JobInfo) -> Vec<String> {
    job.pipeline
        .as_ref()
        .map(|p| vec![p.name.clone()])
        .unwrap_or_default()
}

fn job_input(job: &JobInfo) -> Vec<String> {
    vec![input_key(&job.input)]
}

fn job_stopped(job: &JobInfo) -> Vec<String> {
    vec![job.stopped.to_string()]
}

/// Canonical string for an input tree, used to find an existing job for
/// the same resolved input snapshot. Sorting first makes two trees that
/// differ only in sibling order produce the same key.
pub fn input_key(input: &Input) -> String {
    let mut sorted = input.clone();
    sorted.sort_by_name();
    serde_json::to_string(&sorted).unwrap_or_default()
}

// ============================================================================
// Store
// ============================================================================

/// A typed change delivered by a watch.
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    Put { key: String, value: T },
    Delete { key: String },
}

/// Typed facade over a [`Backend`]. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
}

impl Store {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub async fn get<T>(&self, spec: &'static CollectionSpec<T>, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self.backend.get(spec.name, key).await? {
            Some(raw) => Ok(Some(decode(spec.name, key, raw.value)?)),
            None => Ok(None),
        }
    }

    pub async fn list<T>(&self, spec: &'static CollectionSpec<T>) -> Result<Vec<(String, T)>>
    where
        T: DeserializeOwned,
    {
        let rows = self.backend.list(spec.name).await?;
        rows.into_iter()
            .map(|(key, raw)| {
                let value = decode(spec.name, &key, raw.value)?;
                Ok((key, value))
            })
            .collect()
    }

    pub async fn index_scan<T>(
        &self,
        spec: &'static CollectionSpec<T>,
        index: &'static str,
        value: &str,
    ) -> Result<Vec<(String, T)>>
    where
        T: DeserializeOwned,
    {
        let rows = self.backend.index_scan(spec.name, index, value).await?;
        rows.into_iter()
            .map(|(key, raw)| {
                let value = decode(spec.name, &key, raw.value)?;
                Ok((key, value))
            })
            .collect()
    }

    /// Opens a watch on a collection, optionally filtered to rows whose
    /// index contains `filter`'s value.
    pub async fn watch<T>(
        &self,
        spec: &'static CollectionSpec<T>,
        filter: Option<(&'static str, String)>,
    ) -> Result<BoxStream<'static, Result<WatchEvent<T>>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let filter = filter.map(|(index, value)| IndexFilter { index, value });
        let raw = self.backend.watch(spec.name, filter).await?;
        let name = spec.name;
        Ok(raw
            .map(move |event| {
                event.and_then(|event| match event {
                    RawEvent::Put { key, raw } => {
                        let value = decode::<T>(name, &key, raw.value)?;
                        Ok(WatchEvent::Put { key, value })
                    }
                    RawEvent::Delete { key } => Ok(WatchEvent::Delete { key }),
                })
            })
            .boxed())
    }

    /// Watches a single row. The first event replays the row's current
    /// state if it exists.
    pub async fn watch_key<T>(
        &self,
        spec: &'static CollectionSpec<T>,
        key: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent<T>>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let key = key.to_string();
        let stream = self.watch(spec, None).await?;
        Ok(stream
            .filter(move |event| {
                let keep = match event {
                    Ok(WatchEvent::Put { key: k, .. }) | Ok(WatchEvent::Delete { key: k }) => {
                        *k == key
                    }
                    Err(_) => true,
                };
                futures::future::ready(keep)
            })
            .boxed())
    }

    /// Runs `body` inside an optimistic transaction, retrying it from
    /// scratch whenever the commit detects that an observed row changed
    /// underneath it. Errors returned by `body` abort without writing.
    pub async fn in_txn<R, F>(&self, mut body: F) -> Result<R>
    where
        F: AsyncFnMut(&mut Txn) -> Result<R>,
    {
        loop {
            let mut txn = Txn {
                backend: self.backend.clone(),
                reads: Vec::new(),
                writes: Vec::new(),
            };
            let value = body(&mut txn).await?;
            match self.backend.commit(txn.reads, txn.writes).await {
                Ok(()) => return Ok(value),
                Err(StoreError::Conflict) => {
                    tracing::debug!("transaction conflict, retrying");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// One optimistic transaction: reads record revision guards, writes are
/// buffered until commit. Reads observe the transaction's own pending
/// writes.
pub struct Txn {
    backend: Arc<dyn Backend>,
    reads: Vec<ReadGuard>,
    writes: Vec<RowWrite>,
}

impl Txn {
    pub async fn get<T>(
        &mut self,
        spec: &'static CollectionSpec<T>,
        key: &str,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        if let Some(write) = self
            .writes
            .iter()
            .find(|w| w.collection == spec.name && w.key == key)
        {
            return match &write.value {
                Some(value) => Ok(Some(decode(spec.name, key, value.clone())?)),
                None => Ok(None),
            };
        }

        let raw = self.backend.get(spec.name, key).await?;
        if !self
            .reads
            .iter()
            .any(|r| r.collection == spec.name && r.key == key)
        {
            self.reads.push(ReadGuard {
                collection: spec.name,
                key: key.to_string(),
                rev: raw.as_ref().map(|r| r.rev),
            });
        }
        match raw {
            Some(raw) => Ok(Some(decode(spec.name, key, raw.value)?)),
            None => Ok(None),
        }
    }

    pub fn put<T>(&mut self, spec: &'static CollectionSpec<T>, key: &str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        let index = spec.index_values(value);
        let encoded =
            serde_json::to_value(value).map_err(|e| StoreError::Codec(e.to_string()))?;
        self.push_write(RowWrite {
            collection: spec.name,
            key: key.to_string(),
            value: Some(encoded),
            index,
        });
        Ok(())
    }

    /// Like [`put`](Self::put), but fails if the row already exists and
    /// guards against a concurrent create of the same key.
    pub async fn create<T>(
        &mut self,
        spec: &'static CollectionSpec<T>,
        key: &str,
        value: &T,
    ) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
    {
        if self.get(spec, key).await?.is_some() {
            return Err(StoreError::AlreadyExists {
                collection: spec.name,
                key: key.to_string(),
            });
        }
        self.put(spec, key, value)
    }

    pub fn delete<T>(&mut self, spec: &'static CollectionSpec<T>, key: &str) {
        self.push_write(RowWrite {
            collection: spec.name,
            key: key.to_string(),
            value: None,
            index: Vec::new(),
        });
    }

    fn push_write(&mut self, write: RowWrite) {
        if let Some(existing) = self
            .writes
            .iter_mut()
            .find(|w| w.collection == write.collection && w.key == write.key)
        {
            *existing = write;
        } else {
            self.writes.push(write);
        }
    }
}

fn decode<T>(collection: &'static str, key: &str, value: serde_json::Value) -> Result<T>
where
    T: DeserializeOwned,
{
    serde_json::from_value(value)
        .map_err(|e| StoreError::Codec(format!("{collection}/{key}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::domain::input::{AtomInput, Input};

    fn atom(name: &str, repo: &str, commit: &str) -> Input {
        Input::Atom(AtomInput {
            name: name.to_string(),
            repo: repo.to_string(),
            commit: commit.to_string(),
            glob: "/*".to_string(),
            lazy: false,
            from_commit: None,
        })
    }

    #[test]
    fn test_input_key_ignores_sibling_order() {
        let a = Input::Cross(vec![atom("a", "alpha", "c1"), atom("b", "beta", "c2")]);
        let b = Input::Cross(vec![atom("b", "beta", "c2"), atom("a", "alpha", "c1")]);
        assert_eq!(input_key(&a), input_key(&b));
    }

    #[test]
    fn test_input_key_distinguishes_commits() {
        let a = atom("a", "alpha", "c1");
        let b = atom("a", "alpha", "c2");
        assert_ne!(input_key(&a), input_key(&b));
    }
}
