//! Object storage sink
//!
//! ```text
//! <topic>/messages/<slot>/<field>              one object per payload field
//! <topic>/journal/<millis>-<uuid>.json         one object per publish call
//! ```
//!
//! Journal object names start with the zero-padded publish time, so a plain
//! listing returns batches in publish order.

use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::env;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{
    encode_component, slot_name, Consumer, OutputMessage, PendingSlots, Producer,
    PublishedMessage, Sink, SinkError, SinkResult,
};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            bucket: "regroup-output".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: false,
        }
    }
}

impl S3Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            endpoint: env::var("S3_ENDPOINT").ok(),
            region: env::var("S3_REGION").unwrap_or(defaults.region),
            bucket: env::var("S3_BUCKET").unwrap_or(defaults.bucket),
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .unwrap_or(defaults.access_key),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .unwrap_or(defaults.secret_key),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        }
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            bucket: bucket.into(),
            path_style: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalBatch {
    published_at: DateTime<Utc>,
    messages: Vec<JournalSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct JournalSlot {
    position: String,
    slot: String,
}

fn backend_error<E>(what: &str, err: E) -> SinkError
where
    E: std::error::Error,
{
    SinkError::backend(format!("{}: {}", what, DisplayErrorContext(err)))
}

fn messages_prefix(topic: &str, slot: &str) -> String {
    format!("{}/messages/{}/", encode_component(topic), slot)
}

fn journal_prefix(topic: &str) -> String {
    format!("{}/journal/", encode_component(topic))
}

#[derive(Clone)]
pub struct S3Sink {
    client: Client,
    bucket: String,
}

impl S3Sink {
    pub fn new(config: S3Config) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "regroup-sink",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());
        info!(bucket = %config.bucket, "S3 sink client initialized");

        Self {
            client,
            bucket: config.bucket,
        }
    }

    #[instrument(skip(self, data))]
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> SinkResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| backend_error("put_object", e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> SinkResult<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| backend_error("get_object", e))?;
        let body = response
            .body
            .collect()
            .await
            .map_err(|e| backend_error("read object body", e))?;
        Ok(body.into_bytes())
    }

    /// Keys under `prefix` after `start_after`, in listing order
    async fn list(&self, prefix: &str, start_after: Option<String>) -> SinkResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_start_after(start_after.clone())
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| backend_error("list_objects_v2", e))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(str::to_string)),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                },
                _ => break,
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl Sink for S3Sink {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn producer(&self, topic: &str) -> SinkResult<Arc<dyn Producer>> {
        Ok(Arc::new(S3Producer {
            sink: self.clone(),
            topic: topic.to_string(),
            buffered: Mutex::new(PendingSlots::default()),
        }))
    }

    async fn consumer(&self, topic: &str) -> SinkResult<Box<dyn Consumer>> {
        Ok(Box::new(S3Consumer {
            sink: self.clone(),
            topic: topic.to_string(),
            last_journal: None,
            pending: VecDeque::new(),
        }))
    }
}

pub struct S3Producer {
    sink: S3Sink,
    topic: String,
    buffered: Mutex<PendingSlots<String>>,
}

impl S3Producer {
    fn buffered(&self) -> MutexGuard<'_, PendingSlots<String>> {
        self.buffered.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Producer for S3Producer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn buffer(&self, message: OutputMessage) -> SinkResult<()> {
        let slot = slot_name(message.position());
        let prefix = messages_prefix(&self.topic, &slot);
        for (name, payload) in message.fields() {
            let key = format!("{}{}", prefix, encode_component(name));
            self.sink
                .put(&key, payload.to_vec(), "application/octet-stream")
                .await?;
        }
        debug!(topic = %self.topic, position = %message.position(), slot = %slot, "Buffered message");
        self.buffered().insert(message.position(), slot);
        Ok(())
    }

    async fn publish(&self, positions: &[String]) -> SinkResult<()> {
        let slots = self.buffered().take(positions)?;

        let now = Utc::now();
        let batch = JournalBatch {
            published_at: now,
            messages: positions
                .iter()
                .zip(&slots)
                .map(|(position, slot)| JournalSlot {
                    position: position.clone(),
                    slot: slot.clone(),
                })
                .collect(),
        };
        let key = format!(
            "{}{:020}-{}.json",
            journal_prefix(&self.topic),
            now.timestamp_millis(),
            Uuid::now_v7()
        );

        let written = match serde_json::to_vec(&batch) {
            Ok(body) => self.sink.put(&key, body, "application/json").await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            self.buffered().restore(positions, slots);
            return Err(e);
        }
        Ok(())
    }
}

pub struct S3Consumer {
    sink: S3Sink,
    topic: String,
    last_journal: Option<String>,
    pending: VecDeque<(JournalSlot, DateTime<Utc>)>,
}

impl S3Consumer {
    /// Queue positions from journal objects newer than the last one read
    async fn refill(&mut self) -> SinkResult<()> {
        let keys = self
            .sink
            .list(&journal_prefix(&self.topic), self.last_journal.clone())
            .await?;
        for key in keys {
            let batch: JournalBatch = serde_json::from_slice(&self.sink.get(&key).await?)?;
            let published_at = batch.published_at;
            self.pending
                .extend(batch.messages.into_iter().map(|m| (m, published_at)));
            self.last_journal = Some(key);
        }
        Ok(())
    }

    async fn load(&self, entry: &JournalSlot, published_at: DateTime<Utc>) -> SinkResult<PublishedMessage> {
        let prefix = messages_prefix(&self.topic, &entry.slot);
        let mut fields = HashMap::new();
        for key in self.sink.list(&prefix, None).await? {
            let name = key.trim_start_matches(&prefix).to_string();
            fields.insert(name, self.sink.get(&key).await?);
        }

        let mut builder = OutputMessage::builder().position(entry.position.clone());
        for (name, payload) in fields {
            builder = builder.put(name, payload);
        }
        Ok(PublishedMessage {
            message: builder.build()?,
            published_at,
        })
    }
}

#[async_trait]
impl Consumer for S3Consumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn receive(&mut self, timeout: Duration) -> SinkResult<Option<PublishedMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.pending.is_empty() {
                self.refill().await?;
            }
            if let Some((entry, published_at)) = self.pending.pop_front() {
                return self.load(&entry, published_at).await.map(Some);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn seek(&mut self, at: DateTime<Utc>) -> SinkResult<()> {
        self.pending.clear();
        let millis = at.timestamp_millis().max(0);
        self.last_journal = Some(format!("{}{:020}", journal_prefix(&self.topic), millis));
        Ok(())
    }
}

/// Publish time encoded in a journal object name
pub fn journal_time(key: &str) -> Option<DateTime<Utc>> {
    let name = key.rsplit('/').next()?;
    let millis: i64 = name.split('-').next()?.parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}
