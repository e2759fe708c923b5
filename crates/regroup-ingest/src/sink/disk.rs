//! Local directory sink
//!
//! ```text
//! <root>/<topic>/messages/<slot>/<field>   one file per payload field
//! <root>/<topic>/journal.jsonl             one line per published message
//! ```
//!
//! Buffering writes the field files into a fresh slot directory; publishing
//! appends journal lines naming the slots. A message is visible to consumers
//! once its journal line exists.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    encode_component, slot_name, Consumer, OutputMessage, PendingSlots, Producer,
    PublishedMessage, Sink, SinkError, SinkResult,
};

const JOURNAL_FILE: &str = "journal.jsonl";
const MESSAGES_DIR: &str = "messages";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct JournalEntry {
    position: String,
    slot: String,
    published_at: DateTime<Utc>,
    fields: Vec<String>,
}

/// Where one buffered message was written
#[derive(Debug, Clone)]
struct BufferedSlot {
    slot: String,
    fields: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DiskSink {
    root: PathBuf,
}

impl DiskSink {
    pub async fn new(root: impl AsRef<Path>) -> SinkResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn topic_dir(&self, topic: &str) -> PathBuf {
        self.root.join(encode_component(topic))
    }
}

#[async_trait]
impl Sink for DiskSink {
    fn name(&self) -> &'static str {
        "disk"
    }

    async fn producer(&self, topic: &str) -> SinkResult<Arc<dyn Producer>> {
        let dir = self.topic_dir(topic);
        tokio::fs::create_dir_all(dir.join(MESSAGES_DIR)).await?;
        Ok(Arc::new(DiskProducer {
            topic: topic.to_string(),
            dir,
            pending: StdMutex::new(PendingSlots::default()),
            journal_lock: Mutex::new(()),
        }))
    }

    async fn consumer(&self, topic: &str) -> SinkResult<Box<dyn Consumer>> {
        Ok(Box::new(DiskConsumer {
            topic: topic.to_string(),
            dir: self.topic_dir(topic),
            offset: 0,
        }))
    }
}

pub struct DiskProducer {
    topic: String,
    dir: PathBuf,
    pending: StdMutex<PendingSlots<BufferedSlot>>,
    journal_lock: Mutex<()>,
}

impl DiskProducer {
    fn pending(&self) -> MutexGuard<'_, PendingSlots<BufferedSlot>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn append_journal(&self, lines: &str) -> SinkResult<()> {
        let _guard = self.journal_lock.lock().await;
        let mut journal = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(JOURNAL_FILE))
            .await?;
        journal.write_all(lines.as_bytes()).await?;
        journal.sync_data().await?;
        Ok(())
    }
}

#[async_trait]
impl Producer for DiskProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn buffer(&self, message: OutputMessage) -> SinkResult<()> {
        let slot = slot_name(message.position());
        let dir = self.dir.join(MESSAGES_DIR).join(&slot);
        tokio::fs::create_dir_all(&dir).await?;

        let mut fields = Vec::with_capacity(message.field_count());
        for (name, payload) in message.fields() {
            let file_name = encode_component(name);
            let mut file = tokio::fs::File::create(dir.join(&file_name)).await?;
            file.write_all(payload).await?;
            file.sync_data().await?;
            fields.push(file_name);
        }

        debug!(topic = %self.topic, position = %message.position(), slot = %slot, "Buffered message");
        self.pending()
            .insert(message.position(), BufferedSlot { slot, fields });
        Ok(())
    }

    async fn publish(&self, positions: &[String]) -> SinkResult<()> {
        let slots = self.pending().take(positions)?;

        let now = Utc::now();
        let mut lines = String::new();
        for (position, buffered) in positions.iter().zip(&slots) {
            let entry = JournalEntry {
                position: position.clone(),
                slot: buffered.slot.clone(),
                published_at: now,
                fields: buffered.fields.clone(),
            };
            lines.push_str(&serde_json::to_string(&entry)?);
            lines.push('\n');
        }

        if let Err(e) = self.append_journal(&lines).await {
            self.pending().restore(positions, slots);
            return Err(e);
        }

        debug!(topic = %self.topic, count = positions.len(), "Published batch");
        Ok(())
    }
}

pub struct DiskConsumer {
    topic: String,
    dir: PathBuf,
    offset: usize,
}

impl DiskConsumer {
    async fn journal(&self) -> SinkResult<Vec<JournalEntry>> {
        let path = self.dir.join(JOURNAL_FILE);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(SinkError::from))
            .collect()
    }

    async fn load(&self, entry: &JournalEntry) -> SinkResult<PublishedMessage> {
        let dir = self.dir.join(MESSAGES_DIR).join(&entry.slot);
        let mut builder = OutputMessage::builder().position(entry.position.clone());
        for field in &entry.fields {
            let payload = tokio::fs::read(dir.join(field)).await?;
            builder = builder.put(decode_component(field), Bytes::from(payload));
        }
        Ok(PublishedMessage {
            message: builder.build()?,
            published_at: entry.published_at,
        })
    }
}

#[async_trait]
impl Consumer for DiskConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn receive(&mut self, timeout: Duration) -> SinkResult<Option<PublishedMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let journal = self.journal().await?;
            if let Some(entry) = journal.get(self.offset) {
                let message = self.load(entry).await?;
                self.offset += 1;
                return Ok(Some(message));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn seek(&mut self, at: DateTime<Utc>) -> SinkResult<()> {
        let journal = self.journal().await?;
        self.offset = journal
            .iter()
            .position(|e| e.published_at >= at)
            .unwrap_or(journal.len());
        Ok(())
    }
}

fn decode_component(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(b) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn message(position: &str, body: &str) -> OutputMessage {
        OutputMessage::builder()
            .position(position)
            .put("data", body.to_string())
            .put("manifest", "{}")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_then_consume_in_order() {
        let dir = TempDir::new().unwrap();
        let sink = DiskSink::new(dir.path()).await.unwrap();
        let producer = sink.producer("people").await.unwrap();

        producer.buffer(message("John Doe.25", "a")).await.unwrap();
        producer.buffer(message("Ann.31", "b")).await.unwrap();
        producer
            .publish(&["John Doe.25".into(), "Ann.31".into()])
            .await
            .unwrap();

        let mut consumer = sink.consumer("people").await.unwrap();
        let first = consumer.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.message.position(), "John Doe.25");
        assert_eq!(first.message.field("data").unwrap().as_ref(), b"a");
        assert_eq!(first.message.field_count(), 2);

        let second = consumer.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(second.message.position(), "Ann.31");
        assert!(consumer.receive(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unbuffered_publish_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let sink = DiskSink::new(dir.path()).await.unwrap();
        let producer = sink.producer("t").await.unwrap();
        producer.buffer(message("a", "x")).await.unwrap();

        let err = producer.publish(&["a".into(), "b".into()]).await.unwrap_err();
        assert!(matches!(err, SinkError::NotBuffered(_)));

        let mut consumer = sink.consumer("t").await.unwrap();
        assert!(consumer.receive(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repeated_position_keeps_published_payload() {
        let dir = TempDir::new().unwrap();
        let sink = DiskSink::new(dir.path()).await.unwrap();
        let producer = sink.producer("people").await.unwrap();

        producer.buffer(message("ann", "ann,1,Oslo")).await.unwrap();
        producer.publish(&["ann".into()]).await.unwrap();
        producer.buffer(message("ann", "ann,2,Lima")).await.unwrap();
        producer.buffer(message("ann", "ann,3,Rome")).await.unwrap();
        producer.publish(&["ann".into(), "ann".into()]).await.unwrap();

        let mut consumer = sink.consumer("people").await.unwrap();
        let mut bodies = Vec::new();
        while let Some(next) = consumer.receive(Duration::from_millis(10)).await.unwrap() {
            assert_eq!(next.message.position(), "ann");
            bodies.push(String::from_utf8(next.message.field("data").unwrap().to_vec()).unwrap());
        }
        assert_eq!(bodies, vec!["ann,1,Oslo", "ann,2,Lima", "ann,3,Rome"]);
    }

    #[tokio::test]
    async fn test_seek_by_publish_time() {
        let dir = TempDir::new().unwrap();
        let sink = DiskSink::new(dir.path()).await.unwrap();
        let producer = sink.producer("t").await.unwrap();

        producer.buffer(message("old", "x")).await.unwrap();
        producer.publish(&["old".into()]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let cutoff = Utc::now();
        producer.buffer(message("new", "y")).await.unwrap();
        producer.publish(&["new".into()]).await.unwrap();

        let mut consumer = sink.consumer("t").await.unwrap();
        consumer.seek(cutoff).await.unwrap();
        let next = consumer.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(next.message.position(), "new");
    }

    #[test]
    fn test_component_round_trip() {
        for name in ["data", "John Doe.25", "a/b%c", "ünï"] {
            assert_eq!(decode_component(&encode_component(name)), name);
        }
    }
}
