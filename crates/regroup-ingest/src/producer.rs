//! Batched ordered producer
//!
//! Messages are queued until the queue fills (or [`BatchedProducer::drain`]
//! is called). A drain fans the queued messages out to a bounded set of
//! worker tasks, each of which optionally seals every payload field and
//! buffers the message with the sink. When every task has succeeded the
//! drain issues exactly one publish carrying the batch's positions in
//! submission order. If any task fails, nothing from that batch is published.

use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::context::RunContext;
use crate::crypto::Sealer;
use crate::error::{IngestError, IngestResult};
use crate::sink::{OutputMessage, Producer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerOptions {
    /// Messages queued before a forced drain
    pub queue_capacity: usize,
    /// Concurrent seal-and-buffer tasks per drain
    pub workers: usize,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 1_000,
            workers: 8,
        }
    }
}

pub struct BatchedProducer {
    sink: Arc<dyn Producer>,
    queue: ArrayQueue<OutputMessage>,
    sealer: Option<Arc<Sealer>>,
    workers: Arc<Semaphore>,
    worker_count: usize,
    drain_lock: Mutex<()>,
    context: Option<Arc<RunContext>>,
    drains: AtomicU64,
}

impl BatchedProducer {
    pub fn new(
        sink: Arc<dyn Producer>,
        options: ProducerOptions,
        sealer: Option<Sealer>,
    ) -> IngestResult<Self> {
        if options.queue_capacity == 0 {
            return Err(IngestError::config("Producer queue capacity must be greater than 0"));
        }
        if options.workers == 0 {
            return Err(IngestError::config("Producer worker count must be greater than 0"));
        }

        info!(
            topic = %sink.topic(),
            queue_capacity = options.queue_capacity,
            workers = options.workers,
            encrypted = sealer.is_some(),
            "Batched producer ready"
        );

        Ok(Self {
            sink,
            queue: ArrayQueue::new(options.queue_capacity),
            sealer: sealer.map(Arc::new),
            workers: Arc::new(Semaphore::new(options.workers)),
            worker_count: options.workers,
            drain_lock: Mutex::new(()),
            context: None,
            drains: AtomicU64::new(0),
        })
    }

    /// Count published messages on `context`
    pub fn with_context(mut self, context: Arc<RunContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn topic(&self) -> &str {
        self.sink.topic()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Completed drains that published at least one message
    pub fn drains(&self) -> u64 {
        self.drains.load(Ordering::Relaxed)
    }

    /// Queue `message`, draining first when the queue is full
    pub async fn produce(&self, message: OutputMessage) -> IngestResult<()> {
        let Err(message) = self.queue.push(message) else {
            return Ok(());
        };

        debug!(topic = %self.topic(), "Producer queue full, draining");
        self.drain().await?;

        self.queue.push(message).map_err(|_| IngestError::QueueSaturation {
            capacity: self.queue.capacity(),
        })
    }

    /// Seal, buffer and publish everything queued; returns the batch size
    pub async fn drain(&self) -> IngestResult<usize> {
        let _guard = self.drain_lock.lock().await;

        let mut batch = Vec::with_capacity(self.queue.len());
        while let Some(message) = self.queue.pop() {
            batch.push(message);
        }
        if batch.is_empty() {
            return Ok(0);
        }

        let positions: Vec<String> = batch.iter().map(|m| m.position().to_string()).collect();
        let mut tasks = JoinSet::new();

        for message in batch {
            let permit = Arc::clone(&self.workers)
                .acquire_owned()
                .await
                .map_err(|e| IngestError::Task(format!("worker pool closed: {}", e)))?;
            let sink = Arc::clone(&self.sink);
            let sealer = self.sealer.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let outgoing = match sealer {
                    Some(sealer) => message.try_map_fields(|_, payload| sealer.seal(payload))?,
                    None => message,
                };
                sink.buffer(outgoing).await?;
                Ok::<(), IngestError>(())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => IngestError::from(e),
            };
            tasks.abort_all();
            warn!(
                topic = %self.topic(),
                batch = positions.len(),
                error = %failure,
                "Drain aborted, batch not published"
            );
            return Err(failure);
        }

        self.sink.publish(&positions).await?;
        self.drains.fetch_add(1, Ordering::Relaxed);
        if let Some(context) = &self.context {
            context.record_published(positions.len() as u64);
        }

        debug!(topic = %self.topic(), published = positions.len(), "Drain published");
        Ok(positions.len())
    }

    /// Drain what is left and wait for every worker to finish
    pub async fn close(&self) -> IngestResult<usize> {
        let drained = self.drain().await?;

        let all = u32::try_from(self.worker_count).unwrap_or(u32::MAX);
        let permits = self
            .workers
            .acquire_many(all)
            .await
            .map_err(|e| IngestError::Task(format!("worker pool closed: {}", e)))?;
        permits.forget();
        self.workers.close();

        info!(topic = %self.topic(), drained, drains = self.drains(), "Batched producer closed");
        Ok(drained)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::crypto::AesGcmCipher;
    use crate::sink::MemorySink;
    use zeroize::Zeroizing;

    fn message(position: &str) -> OutputMessage {
        OutputMessage::builder()
            .position(position)
            .put("data", format!("row {}", position))
            .build()
            .unwrap()
    }

    fn producer(sink: &MemorySink, capacity: usize, sealer: Option<Sealer>) -> BatchedProducer {
        BatchedProducer::new(
            Arc::new(sink.memory_producer("t")),
            ProducerOptions {
                queue_capacity: capacity,
                workers: 2,
            },
            sealer,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_full_queue_drains_before_accepting() {
        let sink = MemorySink::new();
        let producer = producer(&sink, 2, None);

        producer.produce(message("p1")).await.unwrap();
        producer.produce(message("p2")).await.unwrap();
        assert!(sink.publish_calls("t").is_empty());

        producer.produce(message("p3")).await.unwrap();
        assert_eq!(sink.publish_calls("t"), vec![vec!["p1".to_string(), "p2".to_string()]]);
        assert_eq!(producer.pending(), 1);

        producer.close().await.unwrap();
        assert_eq!(
            sink.publish_calls("t"),
            vec![vec!["p1".to_string(), "p2".to_string()], vec!["p3".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_sealed_payloads_open_with_same_key() {
        let sealer = Sealer::derive(
            Arc::new(AesGcmCipher),
            Zeroizing::new("secret".to_string()),
            Zeroizing::new("saltsaltsalt".to_string()),
        )
        .unwrap();
        let opener = sealer.clone();

        let sink = MemorySink::new();
        let producer = producer(&sink, 4, Some(sealer));
        producer.produce(message("p1")).await.unwrap();
        producer.drain().await.unwrap();

        let published = sink.published("t");
        let sealed = published[0].message.field("data").unwrap();
        assert_ne!(sealed.as_ref(), b"row p1");
        assert_eq!(opener.open(sealed).unwrap(), b"row p1");
    }

    #[tokio::test]
    async fn test_empty_drain_publishes_nothing() {
        let sink = MemorySink::new();
        let producer = producer(&sink, 4, None);
        assert_eq!(producer.drain().await.unwrap(), 0);
        assert!(sink.publish_calls("t").is_empty());
        assert_eq!(producer.drains(), 0);
    }

    #[test]
    fn test_rejects_zero_sizes() {
        let sink = MemorySink::new();
        let zero_queue = BatchedProducer::new(
            Arc::new(sink.memory_producer("t")),
            ProducerOptions { queue_capacity: 0, workers: 1 },
            None,
        );
        assert!(zero_queue.is_err());
    }
}
