//! In-memory store backend for local mode and tests.
//!
//! Rows live in a mutex-guarded map and share one monotonic revision
//! counter. Change events are broadcast while the state lock is held,
//! so subscribers observe commits in revision order and a watch can
//! splice its snapshot and the live feed together without gaps.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};

use super::{Backend, IndexFilter, IndexWrite, Raw, RawEvent, ReadGuard, Result, RowWrite,
            StoreError};

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
struct StoredRow {
    rev: u64,
    value: serde_json::Value,
    index: Vec<IndexWrite>,
}

#[derive(Debug, Clone)]
struct Event {
    collection: &'static str,
    key: String,
    rev: u64,
    /// New row state, `None` for a delete.
    row: Option<StoredRow>,
}

#[derive(Default)]
struct State {
    collections: HashMap<&'static str, HashMap<String, StoredRow>>,
    next_rev: u64,
}

pub struct MemoryBackend {
    state: Mutex<State>,
    events: broadcast::Sender<Event>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn row_matches(row: &StoredRow, filter: &IndexFilter) -> bool {
    row.index
        .iter()
        .any(|iw| iw.index == filter.index && iw.values.contains(&filter.value))
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, collection: &'static str, key: &str) -> Result<Option<Raw>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .collections
            .get(collection)
            .and_then(|rows| rows.get(key))
            .map(|row| Raw {
                rev: row.rev,
                value: row.value.clone(),
            }))
    }

    async fn list(&self, collection: &'static str) -> Result<Vec<(String, Raw)>> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<(String, Raw)> = state
            .collections
            .get(collection)
            .map(|rows| {
                rows.iter()
                    .map(|(key, row)| {
                        (key.clone(), Raw {
                            rev: row.rev,
                            value: row.value.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }

    async fn index_scan(
        &self,
        collection: &'static str,
        index: &'static str,
        value: &str,
    ) -> Result<Vec<(String, Raw)>> {
        let filter = IndexFilter {
            index,
            value: value.to_string(),
        };
        let state = self.state.lock().unwrap();
        let mut rows: Vec<(String, Raw)> = state
            .collections
            .get(collection)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, row)| row_matches(row, &filter))
                    .map(|(key, row)| {
                        (key.clone(), Raw {
                            rev: row.rev,
                            value: row.value.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }

    async fn commit(&self, reads: Vec<ReadGuard>, writes: Vec<RowWrite>) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        for guard in &reads {
            let current = state
                .collections
                .get(guard.collection)
                .and_then(|rows| rows.get(&guard.key))
                .map(|row| row.rev);
            if current != guard.rev {
                return Err(StoreError::Conflict);
            }
        }

        for write in writes {
            state.next_rev += 1;
            let rev = state.next_rev;
            let rows = state.collections.entry(write.collection).or_default();
            let event = match write.value {
                Some(value) => {
                    let row = StoredRow {
                        rev,
                        value,
                        index: write.index,
                    };
                    rows.insert(write.key.clone(), row.clone());
                    Event {
                        collection: write.collection,
                        key: write.key,
                        rev,
                        row: Some(row),
                    }
                }
                None => {
                    if rows.remove(&write.key).is_none() {
                        continue;
                    }
                    Event {
                        collection: write.collection,
                        key: write.key,
                        rev,
                        row: None,
                    }
                }
            };
            // Sent under the lock so receivers see commit order.
            let _ = self.events.send(event);
        }
        Ok(())
    }

    async fn watch(
        &self,
        collection: &'static str,
        filter: Option<IndexFilter>,
    ) -> Result<BoxStream<'static, Result<RawEvent>>> {
        // Subscribe before snapshotting; the pump drops any event the
        // snapshot already covers.
        let mut events = self.events.subscribe();
        let (snapshot, snapshot_rev) = {
            let state = self.state.lock().unwrap();
            let mut snapshot: Vec<(String, StoredRow)> = state
                .collections
                .get(collection)
                .map(|rows| {
                    rows.iter()
                        .filter(|(_, row)| filter.as_ref().is_none_or(|f| row_matches(row, f)))
                        .map(|(key, row)| (key.clone(), row.clone()))
                        .collect()
                })
                .unwrap_or_default();
            snapshot.sort_by(|a, b| a.0.cmp(&b.0));
            (snapshot, state.next_rev)
        };

        let (tx, rx) = mpsc::channel::<Result<RawEvent>>(16);
        tokio::spawn(async move {
            let mut in_filter: HashSet<String> =
                snapshot.iter().map(|(key, _)| key.clone()).collect();

            for (key, row) in snapshot {
                let event = RawEvent::Put {
                    key,
                    raw: Raw {
                        rev: row.rev,
                        value: row.value,
                    },
                };
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }

            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let _ = tx.send(Err(StoreError::WatchLagged)).await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                if event.collection != collection || event.rev <= snapshot_rev {
                    continue;
                }

                let out = match (&filter, event.row) {
                    (None, Some(row)) => Some(RawEvent::Put {
                        key: event.key,
                        raw: Raw {
                            rev: row.rev,
                            value: row.value,
                        },
                    }),
                    (None, None) => Some(RawEvent::Delete { key: event.key }),
                    (Some(f), row) => {
                        let now_in = row.as_ref().is_some_and(|r| row_matches(r, f));
                        let was_in = in_filter.contains(&event.key);
                        if now_in {
                            in_filter.insert(event.key.clone());
                            let row = row.unwrap();
                            Some(RawEvent::Put {
                                key: event.key,
                                raw: Raw {
                                    rev: row.rev,
                                    value: row.value,
                                },
                            })
                        } else if was_in {
                            in_filter.remove(&event.key);
                            Some(RawEvent::Delete { key: event.key })
                        } else {
                            None
                        }
                    }
                };
                if let Some(out) = out {
                    if tx.send(Ok(out)).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}
