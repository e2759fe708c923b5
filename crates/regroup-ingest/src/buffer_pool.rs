//! Bounded pool of reusable staging buffers
//!
//! The pool holds exactly `size` pre-allocated `BytesMut` buffers. Unlike an
//! allocating pool it never grows: [`BufferPool::acquire`] waits until a
//! buffer is released, and [`BufferPool::try_acquire`] returns `None` when
//! the pool is empty. Staging stores size it to the write queue capacity plus
//! one, so every queued record and the one being filled each own a buffer.

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Semaphore;

use crate::error::{IngestError, IngestResult};

/// Counters for pool diagnostics
#[derive(Debug, Default)]
pub struct BufferPoolMetrics {
    /// Buffers handed out
    pub acquisitions: AtomicU64,
    /// Buffers handed back
    pub releases: AtomicU64,
    /// Acquisitions that found the pool empty and had to wait
    pub waits: AtomicU64,
    /// Releases dropped because the pool was already full
    pub drops: AtomicU64,
}

/// Point-in-time copy of [`BufferPoolMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub acquisitions: u64,
    pub releases: u64,
    pub waits: u64,
    pub drops: u64,
}

impl BufferPoolMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
        }
    }
}

pub struct BufferPool {
    queue: ArrayQueue<BytesMut>,
    available: Semaphore,
    buffer_capacity: usize,
    metrics: BufferPoolMetrics,
}

impl BufferPool {
    /// Pre-allocate `size` buffers of `buffer_capacity` bytes each
    pub fn new(size: usize, buffer_capacity: usize) -> IngestResult<Self> {
        if size == 0 {
            return Err(IngestError::config("Buffer pool size must be greater than 0"));
        }

        let queue = ArrayQueue::new(size);
        for _ in 0..size {
            let _ = queue.push(BytesMut::with_capacity(buffer_capacity));
        }

        Ok(Self {
            queue,
            available: Semaphore::new(size),
            buffer_capacity,
            metrics: BufferPoolMetrics::default(),
        })
    }

    /// Pool sized for a staging queue of `queue_capacity` records
    pub fn for_queue(queue_capacity: usize, buffer_capacity: usize) -> IngestResult<Self> {
        Self::new(queue_capacity + 1, buffer_capacity)
    }

    /// Take a buffer, waiting for a release if none is free
    pub async fn acquire(&self) -> IngestResult<BytesMut> {
        let permit = match self.available.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                self.metrics.waits.fetch_add(1, Ordering::Relaxed);
                self.available
                    .acquire()
                    .await
                    .map_err(|e| IngestError::Task(format!("buffer pool closed: {}", e)))?
            },
        };
        permit.forget();
        self.take()
    }

    /// Take a buffer if one is free right now
    pub fn try_acquire(&self) -> Option<BytesMut> {
        let permit = self.available.try_acquire().ok()?;
        permit.forget();
        self.take().ok()
    }

    /// Clear `buf` and hand it back
    pub fn release(&self, mut buf: BytesMut) {
        buf.clear();
        match self.queue.push(buf) {
            Ok(()) => {
                self.metrics.releases.fetch_add(1, Ordering::Relaxed);
                self.available.add_permits(1);
            },
            Err(_) => {
                self.metrics.drops.fetch_add(1, Ordering::Relaxed);
            },
        }
    }

    /// Release every buffer yielded by `bufs`
    pub fn release_all(&self, bufs: impl IntoIterator<Item = BytesMut>) {
        for buf in bufs {
            self.release(buf);
        }
    }

    pub fn available(&self) -> usize {
        self.queue.len()
    }

    pub fn size(&self) -> usize {
        self.queue.capacity()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub fn metrics(&self) -> &BufferPoolMetrics {
        &self.metrics
    }

    // A permit guarantees a queued buffer.
    fn take(&self) -> IngestResult<BytesMut> {
        let buf = self
            .queue
            .pop()
            .ok_or_else(|| IngestError::Task("buffer pool permit without buffer".into()))?;
        self.metrics.acquisitions.fetch_add(1, Ordering::Relaxed);
        Ok(buf)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("size", &self.size())
            .field("available", &self.available())
            .field("buffer_capacity", &self.buffer_capacity)
            .finish()
    }
}
