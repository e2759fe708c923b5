//! Key-sorted staging store
//!
//! Rows are staged under their encoded [`SortableKey`] and replayed in
//! ascending byte order of that key. Two interchangeable backends implement
//! [`StagingStore`]:
//!
//! - [`lmdb::LmdbStagingStore`]: embedded LMDB environment, one per topic
//! - [`postgres::PostgresStagingStore`]: `<topic>_meta_item` and
//!   `<topic>_record_item` tables behind a connection pool
//!
//! Writes are queued (see [`queue::WriteQueue`]) and committed one batch per
//! drain. Reads stream through a [`RecordCursor`] fed by a background task,
//! since neither an LMDB read transaction nor a server-side cursor can be
//! shared across tasks.

pub mod lmdb;
pub mod postgres;
pub mod queue;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{IngestError, IngestResult};
use crate::key::{decode, Schema, SortableKey};

pub use lmdb::{LmdbConfig, LmdbStagingStore};
pub use postgres::{PostgresConfig, PostgresStagingStore};
pub use queue::{PendingRecord, WriteQueue};

/// Meta header: source file name
pub const META_SOURCE_FILE: &str = "source.file";
/// Meta header: source file path
pub const META_SOURCE_PATH: &str = "source.path";
/// Meta header: original delimiter
pub const META_DELIMITER: &str = "source.delimiter";
/// Meta header: JSON array of original column names
pub const META_SOURCE_COLUMNS: &str = "columns.source";
/// Meta header: JSON array of normalized column names
pub const META_TARGET_COLUMNS: &str = "columns.target";

/// Bytes of the row number that follows each encoded key in the record namespace
pub const ROW_ID_LEN: usize = 8;

/// Whether a run builds the store or reads it back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingMode {
    /// Discard prior contents, then write
    Prepare,
    /// Keep prior contents for replay
    Produce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingBackend {
    Lmdb,
    Postgres,
}

impl fmt::Display for StagingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StagingBackend::Lmdb => f.write_str("lmdb"),
            StagingBackend::Postgres => f.write_str("postgres"),
        }
    }
}

impl FromStr for StagingBackend {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lmdb" | "embedded" => Ok(StagingBackend::Lmdb),
            "postgres" | "postgresql" | "pg" => Ok(StagingBackend::Postgres),
            other => Err(IngestError::config(format!(
                "Unknown staging backend '{}'. Use 'lmdb' or 'postgres'",
                other
            ))),
        }
    }
}

/// Write-path sizing shared by both backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Records queued before a forced drain
    pub capacity: usize,
    /// Initial capacity of each key buffer
    pub key_buffer_capacity: usize,
    /// Initial capacity of each row buffer
    pub value_buffer_capacity: usize,
    /// Rows per read batch (channel depth, cursor fetch size)
    pub fetch_size: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            key_buffer_capacity: 256,
            value_buffer_capacity: 4096,
            fetch_size: 10_000,
        }
    }
}

/// One replayed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedEntry {
    /// 1-based replay position within one read
    pub ordinal: u64,
    /// Encoded key, without the row number
    pub key_bytes: Vec<u8>,
    pub key: SortableKey,
    pub row: String,
}

/// Raw `(key, row)` pair as sent by a backend reader
pub(crate) type RawEntry = (Vec<u8>, String);

/// Ordered replay of staged records
///
/// Keeps a one-entry lookahead so each entry can be reported together with
/// whether another one follows it.
pub struct RecordCursor {
    rx: mpsc::Receiver<IngestResult<RawEntry>>,
    reader: Option<JoinHandle<()>>,
    schema: Arc<Schema>,
    lookahead: Option<RawEntry>,
    primed: bool,
    ordinal: u64,
}

impl RecordCursor {
    pub(crate) fn new(
        rx: mpsc::Receiver<IngestResult<RawEntry>>,
        reader: JoinHandle<()>,
        schema: Arc<Schema>,
    ) -> Self {
        Self {
            rx,
            reader: Some(reader),
            schema,
            lookahead: None,
            primed: false,
            ordinal: 0,
        }
    }

    /// Next entry and whether more follow it
    pub async fn next_entry(&mut self) -> IngestResult<Option<(StagedEntry, bool)>> {
        if !self.primed {
            self.lookahead = self.recv().await?;
            self.primed = true;
        }

        let Some((key_bytes, row)) = self.lookahead.take() else {
            return Ok(None);
        };
        self.lookahead = self.recv().await?;

        let key_bytes = strip_row_id(key_bytes)?;
        let key = decode(&key_bytes, &self.schema)?;
        self.ordinal += 1;
        let entry = StagedEntry {
            ordinal: self.ordinal,
            key_bytes,
            key,
            row,
        };
        Ok(Some((entry, self.lookahead.is_some())))
    }

    /// Drive `visit(entry, has_next)` over the remaining entries
    pub async fn for_each<F>(mut self, mut visit: F) -> IngestResult<u64>
    where
        F: FnMut(StagedEntry, bool) -> IngestResult<()>,
    {
        let mut visited = 0;
        while let Some((entry, has_next)) = self.next_entry().await? {
            visit(entry, has_next)?;
            visited += 1;
        }
        Ok(visited)
    }

    async fn recv(&mut self) -> IngestResult<Option<RawEntry>> {
        match self.rx.recv().await {
            Some(Ok(entry)) => Ok(Some(entry)),
            Some(Err(e)) => Err(e),
            None => {
                // Closed channel: surface a reader panic instead of a short read.
                if let Some(reader) = self.reader.take() {
                    reader.await?;
                }
                Ok(None)
            },
        }
    }
}

fn strip_row_id(mut raw: Vec<u8>) -> IngestResult<Vec<u8>> {
    if raw.len() < ROW_ID_LEN {
        return Err(IngestError::decoding(format!(
            "staged key of {} bytes has no row number",
            raw.len()
        )));
    }
    raw.truncate(raw.len() - ROW_ID_LEN);
    Ok(raw)
}

impl Drop for RecordCursor {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Durable, key-sorted write and replay
#[async_trait]
pub trait StagingStore: Send + Sync {
    fn backend(&self) -> StagingBackend;

    fn topic(&self) -> &str;

    /// Upsert one meta header, committed immediately
    async fn write_header(&mut self, key: &str, value: &str) -> IngestResult<()>;

    /// Encode `key` and queue `(key, row)`, draining first if the queue is full
    async fn write_record(&mut self, key: &SortableKey, row: &str) -> IngestResult<()>;

    /// Commit every queued record in one batch; returns the number committed
    async fn flush(&mut self) -> IngestResult<usize>;

    /// Visit meta headers in key order as `visit(key, value, has_next)`
    async fn read_headers(
        &self,
        visit: &mut (dyn for<'v> FnMut(&'v str, &'v str, bool) + Send),
    ) -> IngestResult<usize>;

    /// Replay records in ascending key order, decoding keys with `schema`
    async fn read_records(&self, schema: Arc<Schema>) -> IngestResult<RecordCursor>;

    /// Drain remaining writes and release resources
    async fn close(&mut self) -> IngestResult<()>;
}

/// Collect the meta headers of `store` into a map
pub async fn read_meta(
    store: &dyn StagingStore,
) -> IngestResult<std::collections::BTreeMap<String, String>> {
    let mut meta = std::collections::BTreeMap::new();
    store
        .read_headers(&mut |key, value, _| {
            meta.insert(key.to_string(), value.to_string());
        })
        .await?;
    Ok(meta)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::key::encode;

    fn cursor_over(entries: Vec<IngestResult<RawEntry>>) -> RecordCursor {
        let schema = Arc::new(Schema::parse("id:int32").unwrap());
        let (tx, rx) = mpsc::channel(4);
        let reader = tokio::spawn(async move {
            for entry in entries {
                if tx.send(entry).await.is_err() {
                    break;
                }
            }
        });
        RecordCursor::new(rx, reader, schema)
    }

    fn raw(id: i32, row: &str) -> IngestResult<RawEntry> {
        let schema = Schema::parse("id:int32").unwrap();
        let key = SortableKey::new().with("id", id);
        let mut bytes = encode(&key, &schema).unwrap();
        bytes.extend_from_slice(&(id as u64).to_be_bytes());
        Ok((bytes, row.to_string()))
    }

    #[test]
    fn test_backend_names() {
        assert_eq!("LMDB".parse::<StagingBackend>().unwrap(), StagingBackend::Lmdb);
        assert_eq!("pg".parse::<StagingBackend>().unwrap(), StagingBackend::Postgres);
        assert!("rocks".parse::<StagingBackend>().is_err());
    }

    #[tokio::test]
    async fn test_cursor_reports_tail() {
        let cursor = cursor_over(vec![raw(1, "a"), raw(2, "b"), raw(3, "c")]);
        let mut seen = Vec::new();
        let count = cursor
            .for_each(|entry, has_next| {
                seen.push((entry.ordinal, entry.row, has_next));
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(count, 3);
        assert_eq!(
            seen,
            vec![
                (1, "a".to_string(), true),
                (2, "b".to_string(), true),
                (3, "c".to_string(), false)
            ]
        );
    }

    #[tokio::test]
    async fn test_cursor_propagates_reader_error() {
        let mut cursor = cursor_over(vec![raw(1, "a"), Err(IngestError::staging("boom"))]);
        let err = cursor.next_entry().await.unwrap_err();
        assert!(matches!(err, IngestError::StagingIo(_)));
    }

    #[tokio::test]
    async fn test_cursor_rejects_undecodable_key() {
        let mut cursor = cursor_over(vec![Ok((vec![1, 2], "x".to_string()))]);
        assert!(matches!(cursor.next_entry().await, Err(IngestError::Decoding(_))));

        let mut cursor = cursor_over(vec![Ok((vec![0; 10], "x".to_string()))]);
        assert!(matches!(cursor.next_entry().await, Err(IngestError::Decoding(_))));
    }

    #[tokio::test]
    async fn test_cursor_strips_row_number() {
        let mut cursor = cursor_over(vec![raw(4, "a")]);
        let (entry, _) = cursor.next_entry().await.unwrap().unwrap();
        let schema = Schema::parse("id:int32").unwrap();
        assert_eq!(entry.key_bytes, encode(&entry.key, &schema).unwrap());
        assert_eq!(entry.key, SortableKey::new().with("id", 4));
    }

    #[tokio::test]
    async fn test_empty_cursor() {
        let mut cursor = cursor_over(Vec::new());
        assert!(cursor.next_entry().await.unwrap().is_none());
        assert!(cursor.next_entry().await.unwrap().is_none());
    }
}
