//! Bounded write queue shared by the staging backends

use bytes::{BufMut, BytesMut};
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::QueueOptions;
use crate::buffer_pool::BufferPool;
use crate::error::{IngestError, IngestResult};
use crate::key::{encode_into, Schema, SortableKey};

/// Encoded key and row awaiting commit, both backed by pooled buffers
#[derive(Debug)]
pub struct PendingRecord {
    pub key: BytesMut,
    pub value: BytesMut,
}

/// Records waiting for the next drain
///
/// Key and row buffers come from two pools of `capacity + 1` buffers, so the
/// queue can be full while one more record is being encoded.
///
/// Every prepared key is followed by a big-endian row number
/// ([`super::ROW_ID_LEN`] bytes), so rows with equal keys stay distinct and
/// replay in write order.
pub struct WriteQueue {
    pending: ArrayQueue<PendingRecord>,
    keys: Arc<BufferPool>,
    values: Arc<BufferPool>,
    next_row: AtomicU64,
}

impl WriteQueue {
    pub fn new(options: &QueueOptions) -> IngestResult<Self> {
        if options.capacity == 0 {
            return Err(IngestError::config("Staging queue capacity must be greater than 0"));
        }
        Ok(Self {
            pending: ArrayQueue::new(options.capacity),
            keys: Arc::new(BufferPool::for_queue(options.capacity, options.key_buffer_capacity)?),
            values: Arc::new(BufferPool::for_queue(
                options.capacity,
                options.value_buffer_capacity,
            )?),
            next_row: AtomicU64::new(0),
        })
    }

    /// Number rows from `first_row`, past the rows a store already holds
    pub fn starting_at(self, first_row: u64) -> Self {
        self.next_row.store(first_row, Ordering::Relaxed);
        self
    }

    pub fn next_row(&self) -> u64 {
        self.next_row.load(Ordering::Relaxed)
    }

    /// Encode `key` plus the next row number, and copy `row` into pooled buffers
    pub async fn prepare(
        &self,
        key: &SortableKey,
        row: &str,
        schema: &Schema,
    ) -> IngestResult<PendingRecord> {
        let mut key_buf = self.keys.acquire().await?;
        if let Err(e) = encode_into(key, schema, &mut key_buf) {
            self.keys.release(key_buf);
            return Err(e);
        }
        key_buf.put_u64(self.next_row.fetch_add(1, Ordering::Relaxed));

        let mut value_buf = match self.values.acquire().await {
            Ok(buf) => buf,
            Err(e) => {
                self.keys.release(key_buf);
                return Err(e);
            },
        };
        value_buf.put_slice(row.as_bytes());

        Ok(PendingRecord {
            key: key_buf,
            value: value_buf,
        })
    }

    /// Queue `record`, handing it back if the queue is full
    pub fn push(&self, record: PendingRecord) -> Result<(), PendingRecord> {
        self.pending.push(record)
    }

    /// Queue `record` after a drain, failing if there is still no room
    pub fn push_after_drain(&self, record: PendingRecord) -> IngestResult<()> {
        self.pending.push(record).map_err(|rejected| {
            self.release(vec![rejected]);
            IngestError::QueueSaturation {
                capacity: self.capacity(),
            }
        })
    }

    /// Remove every queued record in queue order
    pub fn take_all(&self) -> Vec<PendingRecord> {
        let mut batch = Vec::with_capacity(self.pending.len());
        while let Some(record) = self.pending.pop() {
            batch.push(record);
        }
        batch
    }

    /// Return the buffers of a committed batch to their pools
    pub fn release(&self, batch: Vec<PendingRecord>) {
        for record in batch {
            self.keys.release(record.key);
            self.values.release(record.value);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.pending.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.pending.capacity()
    }

    pub fn key_pool(&self) -> &BufferPool {
        &self.keys
    }

    pub fn value_pool(&self) -> &BufferPool {
        &self.values
    }
}
