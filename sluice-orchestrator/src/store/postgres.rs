//! Postgres store backend.
//!
//! Rows and their index entries live in two tables sharing one revision
//! sequence. Transactions lock the read set with `SELECT ... FOR
//! UPDATE` and turn stale revisions into [`StoreError::Conflict`].
//! Watches ride on `pg_notify`: commits announce touched keys and the
//! watch task re-reads each one, so bursts may collapse into the latest
//! state. Watchers are level-triggered, that is enough.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgPool, Row};
use tokio::sync::mpsc;

use super::{Backend, IndexFilter, Raw, RawEvent, ReadGuard, Result, RowWrite, StoreError};

const NOTIFY_CHANNEL: &str = "sluice_watch";

pub async fn create_pool(database_url: &str) -> std::result::Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> std::result::Result<(), sqlx::Error> {
    // Create rows table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sluice_rows (
            collection TEXT NOT NULL,
            key TEXT NOT NULL,
            rev BIGINT NOT NULL,
            value JSONB NOT NULL,
            PRIMARY KEY (collection, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create index entries table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sluice_index (
            collection TEXT NOT NULL,
            index_name TEXT NOT NULL,
            index_value TEXT NOT NULL,
            key TEXT NOT NULL,
            PRIMARY KEY (collection, index_name, index_value, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create index for scan queries
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sluice_index_lookup ON sluice_index(collection, index_name, index_value)",
    )
    .execute(pool)
    .await?;

    // Create shared revision sequence
    sqlx::query("CREATE SEQUENCE IF NOT EXISTS sluice_rev")
        .execute(pool)
        .await?;

    tracing::info!("store schema is up to date");
    Ok(())
}

fn sql_err(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        // Unique violation: a concurrent create won the race.
        if db.code().as_deref() == Some("23505") {
            return StoreError::Conflict;
        }
    }
    StoreError::Backend(err.to_string())
}

fn raw_from_row(row: &sqlx::postgres::PgRow) -> Raw {
    Raw {
        rev: row.get::<i64, _>("rev") as u64,
        value: row.get("value"),
    }
}

async fn fetch_raw(pool: &PgPool, collection: &str, key: &str) -> Result<Option<Raw>> {
    let row = sqlx::query("SELECT rev, value FROM sluice_rows WHERE collection = $1 AND key = $2")
        .bind(collection)
        .bind(key)
        .fetch_optional(pool)
        .await
        .map_err(sql_err)?;
    Ok(row.as_ref().map(raw_from_row))
}

async fn in_index(
    pool: &PgPool,
    collection: &str,
    filter: &IndexFilter,
    key: &str,
) -> Result<bool> {
    let row = sqlx::query(
        "SELECT 1 AS present FROM sluice_index
         WHERE collection = $1 AND index_name = $2 AND index_value = $3 AND key = $4",
    )
    .bind(collection)
    .bind(filter.index)
    .bind(&filter.value)
    .bind(key)
    .fetch_optional(pool)
    .await
    .map_err(sql_err)?;
    Ok(row.is_some())
}

pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    async fn get(&self, collection: &'static str, key: &str) -> Result<Option<Raw>> {
        fetch_raw(&self.pool, collection, key).await
    }

    async fn list(&self, collection: &'static str) -> Result<Vec<(String, Raw)>> {
        let rows = sqlx::query(
            "SELECT key, rev, value FROM sluice_rows WHERE collection = $1 ORDER BY key",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(rows
            .iter()
            .map(|row| (row.get("key"), raw_from_row(row)))
            .collect())
    }

    async fn index_scan(
        &self,
        collection: &'static str,
        index: &'static str,
        value: &str,
    ) -> Result<Vec<(String, Raw)>> {
        let rows = sqlx::query(
            "SELECT r.key, r.rev, r.value FROM sluice_rows r
             JOIN sluice_index i ON i.collection = r.collection AND i.key = r.key
             WHERE i.collection = $1 AND i.index_name = $2 AND i.index_value = $3
             ORDER BY r.key",
        )
        .bind(collection)
        .bind(index)
        .bind(value)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(rows
            .iter()
            .map(|row| (row.get("key"), raw_from_row(row)))
            .collect())
    }

    async fn commit(&self, mut reads: Vec<ReadGuard>, writes: Vec<RowWrite>) -> Result<()> {
        // Stable lock order across transactions.
        reads.sort_by(|a, b| (a.collection, &a.key).cmp(&(b.collection, &b.key)));

        let mut tx = self.pool.begin().await.map_err(sql_err)?;

        for guard in &reads {
            let row = sqlx::query(
                "SELECT rev FROM sluice_rows WHERE collection = $1 AND key = $2 FOR UPDATE",
            )
            .bind(guard.collection)
            .bind(&guard.key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(sql_err)?;
            let current = row.map(|row| row.get::<i64, _>("rev") as u64);
            if current != guard.rev {
                return Err(StoreError::Conflict);
            }
        }

        for write in writes {
            match write.value {
                Some(value) => {
                    // A row observed absent must still be absent; the
                    // plain insert turns a lost create race into a
                    // unique violation and from there into a conflict.
                    let observed_absent = reads.iter().any(|g| {
                        g.collection == write.collection && g.key == write.key && g.rev.is_none()
                    });
                    if observed_absent {
                        sqlx::query(
                            "INSERT INTO sluice_rows (collection, key, rev, value)
                             VALUES ($1, $2, nextval('sluice_rev'), $3)",
                        )
                        .bind(write.collection)
                        .bind(&write.key)
                        .bind(&value)
                        .execute(&mut *tx)
                        .await
                        .map_err(sql_err)?;
                    } else {
                        sqlx::query(
                            "INSERT INTO sluice_rows (collection, key, rev, value)
                             VALUES ($1, $2, nextval('sluice_rev'), $3)
                             ON CONFLICT (collection, key)
                             DO UPDATE SET rev = nextval('sluice_rev'), value = EXCLUDED.value",
                        )
                        .bind(write.collection)
                        .bind(&write.key)
                        .bind(&value)
                        .execute(&mut *tx)
                        .await
                        .map_err(sql_err)?;
                    }

                    sqlx::query("DELETE FROM sluice_index WHERE collection = $1 AND key = $2")
                        .bind(write.collection)
                        .bind(&write.key)
                        .execute(&mut *tx)
                        .await
                        .map_err(sql_err)?;
                    for iw in &write.index {
                        for index_value in &iw.values {
                            sqlx::query(
                                "INSERT INTO sluice_index (collection, index_name, index_value, key)
                                 VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
                            )
                            .bind(write.collection)
                            .bind(iw.index)
                            .bind(index_value)
                            .bind(&write.key)
                            .execute(&mut *tx)
                            .await
                            .map_err(sql_err)?;
                        }
                    }
                }
                None => {
                    sqlx::query("DELETE FROM sluice_rows WHERE collection = $1 AND key = $2")
                        .bind(write.collection)
                        .bind(&write.key)
                        .execute(&mut *tx)
                        .await
                        .map_err(sql_err)?;
                    sqlx::query("DELETE FROM sluice_index WHERE collection = $1 AND key = $2")
                        .bind(write.collection)
                        .bind(&write.key)
                        .execute(&mut *tx)
                        .await
                        .map_err(sql_err)?;
                }
            }

            let payload = serde_json::json!({
                "collection": write.collection,
                "key": write.key,
            });
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(NOTIFY_CHANNEL)
                .bind(payload.to_string())
                .execute(&mut *tx)
                .await
                .map_err(sql_err)?;
        }

        tx.commit().await.map_err(sql_err)
    }

    async fn watch(
        &self,
        collection: &'static str,
        filter: Option<IndexFilter>,
    ) -> Result<BoxStream<'static, Result<RawEvent>>> {
        // Listen before snapshotting so nothing falls in the gap;
        // duplicate notifications dedup on revision.
        let mut listener = PgListener::connect_with(&self.pool).await.map_err(sql_err)?;
        listener.listen(NOTIFY_CHANNEL).await.map_err(sql_err)?;

        let snapshot = match &filter {
            Some(f) => self.index_scan(collection, f.index, &f.value).await?,
            None => self.list(collection).await?,
        };

        let pool = self.pool.clone();
        let (tx, rx) = mpsc::channel::<Result<RawEvent>>(16);
        tokio::spawn(async move {
            let mut seen: HashMap<String, u64> = HashMap::new();
            let mut in_filter: HashSet<String> = HashSet::new();

            for (key, raw) in snapshot {
                seen.insert(key.clone(), raw.rev);
                in_filter.insert(key.clone());
                if tx.send(Ok(RawEvent::Put { key, raw })).await.is_err() {
                    return;
                }
            }

            loop {
                let notification = match listener.recv().await {
                    Ok(notification) => notification,
                    Err(err) => {
                        let _ = tx.send(Err(sql_err(err))).await;
                        return;
                    }
                };
                let payload: serde_json::Value =
                    match serde_json::from_str(notification.payload()) {
                        Ok(payload) => payload,
                        Err(_) => continue,
                    };
                if payload.get("collection").and_then(|v| v.as_str()) != Some(collection) {
                    continue;
                }
                let Some(key) = payload.get("key").and_then(|v| v.as_str()).map(String::from)
                else {
                    continue;
                };

                let raw = match fetch_raw(&pool, collection, &key).await {
                    Ok(raw) => raw,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };
                let out = match raw {
                    None => {
                        let was_visible = match &filter {
                            None => seen.remove(&key).is_some(),
                            Some(_) => {
                                seen.remove(&key);
                                in_filter.remove(&key)
                            }
                        };
                        if was_visible {
                            Some(RawEvent::Delete { key })
                        } else {
                            None
                        }
                    }
                    Some(raw) => {
                        if seen.get(&key) == Some(&raw.rev) {
                            None
                        } else {
                            seen.insert(key.clone(), raw.rev);
                            match &filter {
                                None => Some(RawEvent::Put { key, raw }),
                                Some(f) => {
                                    let now_in = match in_index(&pool, collection, f, &key).await {
                                        Ok(now_in) => now_in,
                                        Err(err) => {
                                            let _ = tx.send(Err(err)).await;
                                            return;
                                        }
                                    };
                                    let was_in = in_filter.contains(&key);
                                    if now_in {
                                        in_filter.insert(key.clone());
                                        Some(RawEvent::Put { key, raw })
                                    } else if was_in {
                                        in_filter.remove(&key);
                                        Some(RawEvent::Delete { key })
                                    } else {
                                        None
                                    }
                                }
                            }
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
