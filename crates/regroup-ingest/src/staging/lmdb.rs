//! Embedded staging backend on LMDB
//!
//! One environment per topic under `<root>/<topic>`, holding two named
//! databases: `meta` for headers and `record` for rows. LMDB keeps keys in
//! byte order, which is exactly the replay order we need.

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::queue::{PendingRecord, WriteQueue};
use super::{QueueOptions, RecordCursor, StagingBackend, StagingMode, StagingStore};
use crate::error::{IngestError, IngestResult};
use crate::key::{Schema, SortableKey};

const META_DB: &str = "meta";
const RECORD_DB: &str = "record";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LmdbConfig {
    /// Directory holding one environment per topic
    pub root: PathBuf,
    /// Maximum size of the memory map in bytes
    pub map_size: usize,
}

impl Default for LmdbConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./staging"),
            map_size: 10 * 1024 * 1024 * 1024,
        }
    }
}

pub struct LmdbStagingStore {
    topic: String,
    path: PathBuf,
    env: Env,
    meta: Database<Bytes, Bytes>,
    records: Database<Bytes, Bytes>,
    schema: Arc<Schema>,
    queue: WriteQueue,
    fetch_size: usize,
}

impl LmdbStagingStore {
    /// Open the environment for `topic`
    ///
    /// In [`StagingMode::Prepare`] both databases are cleared before the
    /// store is handed out.
    pub async fn open(
        config: &LmdbConfig,
        topic: &str,
        schema: Arc<Schema>,
        mode: StagingMode,
        options: &QueueOptions,
    ) -> IngestResult<Self> {
        super::postgres::validate_topic(topic)?;
        let path = config.root.join(topic);
        let map_size = config.map_size;

        let open_path = path.clone();
        let (env, meta, records, staged) =
            tokio::task::spawn_blocking(move || open_env(&open_path, map_size, mode)).await??;

        info!(
            topic = %topic,
            path = %path.display(),
            map_size,
            ?mode,
            staged,
            "Opened LMDB staging store"
        );

        Ok(Self {
            topic: topic.to_string(),
            path,
            env,
            meta,
            records,
            schema,
            queue: WriteQueue::new(options)?.starting_at(staged),
            fetch_size: options.fetch_size.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn queue(&self) -> &WriteQueue {
        &self.queue
    }
}

type OpenedEnv = (Env, Database<Bytes, Bytes>, Database<Bytes, Bytes>, u64);

/// Open or create the environment; returns it with the number of staged rows
fn open_env(path: &Path, map_size: usize, mode: StagingMode) -> IngestResult<OpenedEnv> {
    std::fs::create_dir_all(path)?;

    // SAFETY: the environment files are only touched through heed, and heed
    // hands back the already-open environment for a path opened twice.
    let env = unsafe {
        EnvOpenOptions::new()
            .map_size(map_size)
            .max_dbs(2)
            .open(path)?
    };

    let mut wtxn = env.write_txn()?;
    let meta: Database<Bytes, Bytes> = env.create_database(&mut wtxn, Some(META_DB))?;
    let records: Database<Bytes, Bytes> = env.create_database(&mut wtxn, Some(RECORD_DB))?;
    if mode == StagingMode::Prepare {
        meta.clear(&mut wtxn)?;
        records.clear(&mut wtxn)?;
    }
    let staged = records.len(&wtxn)?;
    wtxn.commit()?;

    Ok((env, meta, records, staged))
}

fn commit_batch(
    env: &Env,
    records: Database<Bytes, Bytes>,
    batch: &[PendingRecord],
) -> IngestResult<()> {
    let mut wtxn = env.write_txn()?;
    for record in batch {
        records.put(&mut wtxn, &record.key[..], &record.value[..])?;
    }
    wtxn.commit()?;
    Ok(())
}

impl LmdbStagingStore {
    async fn drain(&mut self) -> IngestResult<usize> {
        let batch = self.queue.take_all();
        if batch.is_empty() {
            return Ok(0);
        }

        let env = self.env.clone();
        let records = self.records;
        let (batch, result) = tokio::task::spawn_blocking(move || {
            let result = commit_batch(&env, records, &batch);
            (batch, result)
        })
        .await?;

        let committed = batch.len();
        self.queue.release(batch);
        result?;

        debug!(topic = %self.topic, committed, "Drained staging queue");
        Ok(committed)
    }
}

#[async_trait]
impl StagingStore for LmdbStagingStore {
    fn backend(&self) -> StagingBackend {
        StagingBackend::Lmdb
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    async fn write_header(&mut self, key: &str, value: &str) -> IngestResult<()> {
        let env = self.env.clone();
        let meta = self.meta;
        let (key, value) = (key.to_string(), value.to_string());
        tokio::task::spawn_blocking(move || -> IngestResult<()> {
            let mut wtxn = env.write_txn()?;
            meta.put(&mut wtxn, key.as_bytes(), value.as_bytes())?;
            wtxn.commit()?;
            Ok(())
        })
        .await?
    }

    async fn write_record(&mut self, key: &SortableKey, row: &str) -> IngestResult<()> {
        let record = self.queue.prepare(key, row, &self.schema).await?;
        if let Err(record) = self.queue.push(record) {
            self.drain().await?;
            self.queue.push_after_drain(record)?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> IngestResult<usize> {
        self.drain().await
    }

    async fn read_headers(
        &self,
        visit: &mut (dyn for<'v> FnMut(&'v str, &'v str, bool) + Send),
    ) -> IngestResult<usize> {
        let env = self.env.clone();
        let meta = self.meta;
        let headers = tokio::task::spawn_blocking(move || -> IngestResult<Vec<(String, String)>> {
            let rtxn = env.read_txn()?;
            let mut headers = Vec::new();
            for item in meta.iter(&rtxn)? {
                let (key, value) = item?;
                headers.push((utf8(key, "meta key")?, utf8(value, "meta value")?));
            }
            Ok(headers)
        })
        .await??;

        let total = headers.len();
        for (i, (key, value)) in headers.iter().enumerate() {
            visit(key.as_str(), value.as_str(), i + 1 < total);
        }
        Ok(total)
    }

    async fn read_records(&self, schema: Arc<Schema>) -> IngestResult<RecordCursor> {
        let env = self.env.clone();
        let records = self.records;
        let (tx, rx) = mpsc::channel(self.fetch_size);

        let reader = tokio::task::spawn_blocking(move || {
            let scan = || -> IngestResult<()> {
                let rtxn = env.read_txn()?;
                for item in records.iter(&rtxn)? {
                    let (key, value) = item?;
                    let entry = (key.to_vec(), utf8(value, "row")?);
                    if tx.blocking_send(Ok(entry)).is_err() {
                        // Cursor dropped.
                        return Ok(());
                    }
                }
                Ok(())
            };
            if let Err(e) = scan() {
                let _ = tx.blocking_send(Err(e));
            }
        });

        Ok(RecordCursor::new(rx, reader, schema))
    }

    async fn close(&mut self) -> IngestResult<()> {
        let drained = self.drain().await?;
        let env = self.env.clone();
        tokio::task::spawn_blocking(move || env.force_sync()).await??;
        info!(topic = %self.topic, drained, "Closed LMDB staging store");
        Ok(())
    }
}

fn utf8(bytes: &[u8], what: &str) -> IngestResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| IngestError::decoding(format!("staged {} is not UTF-8: {}", what, e)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> LmdbConfig {
        LmdbConfig {
            root: dir.path().to_path_buf(),
            map_size: 16 * 1024 * 1024,
        }
    }

    fn options(capacity: usize) -> QueueOptions {
        QueueOptions {
            capacity,
            key_buffer_capacity: 32,
            value_buffer_capacity: 64,
            fetch_size: 4,
        }
    }

    async fn open_orders(dir: &TempDir, schema: &Arc<Schema>, mode: StagingMode) -> LmdbStagingStore {
        LmdbStagingStore::open(&config(dir), "orders", Arc::clone(schema), mode, &options(2))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_forced_drain_when_queue_fills() {
        let dir = TempDir::new().unwrap();
        let schema = Arc::new(Schema::parse("id:int32").unwrap());
        let mut store = LmdbStagingStore::open(
            &config(&dir),
            "orders",
            Arc::clone(&schema),
            StagingMode::Prepare,
            &options(2),
        )
        .await
        .unwrap();

        for id in 0..3 {
            store
                .write_record(&SortableKey::new().with("id", id), "row")
                .await
                .unwrap();
        }
        // Two committed by the forced drain, one still queued.
        assert_eq!(store.queue().len(), 1);
        assert_eq!(store.flush().await.unwrap(), 1);
        assert!(store.path().ends_with("orders"));
    }

    #[tokio::test]
    async fn test_prepare_clears_while_env_is_shared() {
        let dir = TempDir::new().unwrap();
        let schema = Arc::new(Schema::parse("id:int32").unwrap());

        let mut first = open_orders(&dir, &schema, StagingMode::Prepare).await;
        first.write_header("source.file", "a.csv").await.unwrap();
        first
            .write_record(&SortableKey::new().with("id", 1), "old")
            .await
            .unwrap();
        first.close().await.unwrap();

        // `first` still holds the environment open.
        let mut second = open_orders(&dir, &schema, StagingMode::Prepare).await;
        assert_eq!(second.queue().next_row(), 0);
        assert!(super::super::read_meta(&second).await.unwrap().is_empty());
        second
            .write_record(&SortableKey::new().with("id", 2), "new")
            .await
            .unwrap();
        second.close().await.unwrap();
        drop(first);

        let reader = open_orders(&dir, &schema, StagingMode::Produce).await;
        assert_eq!(reader.queue().next_row(), 1);
        let mut cursor = reader.read_records(Arc::clone(&schema)).await.unwrap();
        let (entry, has_next) = cursor.next_entry().await.unwrap().unwrap();
        assert_eq!(entry.row, "new");
        assert!(!has_next);
    }

    #[tokio::test]
    async fn test_invalid_topic_rejected() {
        let dir = TempDir::new().unwrap();
        let schema = Arc::new(Schema::parse("id:int32").unwrap());
        let result = LmdbStagingStore::open(
            &config(&dir),
            "../escape",
            schema,
            StagingMode::Prepare,
            &options(2),
        )
        .await;
        assert!(matches!(result, Err(IngestError::Config(_))));
    }
}
