//! In-process sink
//!
//! Keeps every topic in memory. Besides serving tests, it records each
//! publish call so ordering can be asserted on directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use super::{Consumer, OutputMessage, PendingSlots, Producer, PublishedMessage, Sink, SinkResult};

#[derive(Debug, Default)]
struct TopicState {
    buffered: PendingSlots<OutputMessage>,
    published: Vec<PublishedMessage>,
    publish_calls: Vec<Vec<String>>,
}

#[derive(Debug, Default)]
struct TopicLog {
    state: Mutex<TopicState>,
    appended: Notify,
}

impl TopicLog {
    fn lock(&self) -> MutexGuard<'_, TopicState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    topics: Arc<Mutex<HashMap<String, Arc<TopicLog>>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic_log(&self, topic: &str) -> Arc<TopicLog> {
        let mut topics = self
            .topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(topics.entry(topic.to_string()).or_default())
    }

    pub fn memory_producer(&self, topic: &str) -> MemoryProducer {
        MemoryProducer {
            topic: topic.to_string(),
            log: self.topic_log(topic),
        }
    }

    /// Messages published to `topic`, in publish order
    pub fn published(&self, topic: &str) -> Vec<PublishedMessage> {
        self.topic_log(topic).lock().published.clone()
    }

    /// Positions of each publish call on `topic`
    pub fn publish_calls(&self, topic: &str) -> Vec<Vec<String>> {
        self.topic_log(topic).lock().publish_calls.clone()
    }

    /// Number of messages buffered but not yet published
    pub fn buffered_count(&self, topic: &str) -> usize {
        self.topic_log(topic).lock().buffered.len()
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn producer(&self, topic: &str) -> SinkResult<Arc<dyn Producer>> {
        Ok(Arc::new(self.memory_producer(topic)))
    }

    async fn consumer(&self, topic: &str) -> SinkResult<Box<dyn Consumer>> {
        Ok(Box::new(MemoryConsumer {
            topic: topic.to_string(),
            log: self.topic_log(topic),
            offset: 0,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct MemoryProducer {
    topic: String,
    log: Arc<TopicLog>,
}

#[async_trait]
impl Producer for MemoryProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn buffer(&self, message: OutputMessage) -> SinkResult<()> {
        let position = message.position().to_string();
        self.log.lock().buffered.insert(position, message);
        Ok(())
    }

    async fn publish(&self, positions: &[String]) -> SinkResult<()> {
        {
            let mut state = self.log.lock();
            let messages = state.buffered.take(positions)?;

            let now = Utc::now();
            state
                .published
                .extend(messages.into_iter().map(|message| PublishedMessage {
                    message,
                    published_at: now,
                }));
            state.publish_calls.push(positions.to_vec());
        }
        self.log.appended.notify_waiters();
        Ok(())
    }
}

pub struct MemoryConsumer {
    topic: String,
    log: Arc<TopicLog>,
    offset: usize,
}

impl MemoryConsumer {
    fn poll(&mut self) -> Option<PublishedMessage> {
        let state = self.log.lock();
        let next = state.published.get(self.offset).cloned();
        if next.is_some() {
            self.offset += 1;
        }
        next
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn receive(&mut self, timeout: Duration) -> SinkResult<Option<PublishedMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let log = Arc::clone(&self.log);
        loop {
            let appended = log.appended.notified();
            if let Some(message) = self.poll() {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(self.poll());
            }
        }
    }

    async fn seek(&mut self, at: DateTime<Utc>) -> SinkResult<()> {
        let state = self.log.lock();
        self.offset = state
            .published
            .iter()
            .position(|m| m.published_at >= at)
            .unwrap_or(state.published.len());
        Ok(())
    }
}
