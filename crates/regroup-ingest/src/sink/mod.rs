//! Append-only message sinks
//!
//! A sink hands out a [`Producer`] and a [`Consumer`] per topic. Producing is
//! two-phase: [`Producer::buffer`] stores a message durably but invisibly,
//! and [`Producer::publish`] makes a batch of buffered positions visible in
//! the order given. Consumers only ever see published messages.
//!
//! Sinks are chosen by name through [`open_sink`]:
//!
//! | name     | backend                                   |
//! |----------|-------------------------------------------|
//! | `memory` | in-process, for tests and inspection      |
//! | `disk`   | one directory per topic plus a journal    |
//! | `s3`     | object storage via `aws-sdk-s3`           |

pub mod disk;
pub mod memory;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use disk::DiskSink;
pub use memory::MemorySink;
pub use s3::{S3Config, S3Sink};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sink backend error: {0}")]
    Backend(String),

    /// Publish named a position that was never buffered
    #[error("Position '{0}' was published without being buffered")]
    NotBuffered(String),

    #[error("Unsupported sink operation: {0}")]
    Unsupported(String),
}

impl SinkError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Backend(format!("journal encoding: {}", err))
    }
}

pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// Position plus named binary payload fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMessage {
    position: String,
    fields: BTreeMap<String, Bytes>,
}

impl OutputMessage {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    pub fn position(&self) -> &str {
        &self.position
    }

    pub fn field(&self, name: &str) -> Option<&Bytes> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Copy of this message with every payload replaced by `f(name, payload)`
    pub fn try_map_fields<E, F>(&self, mut f: F) -> Result<Self, E>
    where
        F: FnMut(&str, &[u8]) -> Result<Vec<u8>, E>,
    {
        let fields = self
            .fields
            .iter()
            .map(|(name, payload)| Ok((name.clone(), Bytes::from(f(name.as_str(), &payload[..])?))))
            .collect::<Result<_, E>>()?;
        Ok(Self {
            position: self.position.clone(),
            fields,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    position: Option<String>,
    fields: BTreeMap<String, Bytes>,
}

impl MessageBuilder {
    pub fn position(mut self, position: impl Into<String>) -> Self {
        self.position = Some(position.into());
        self
    }

    pub fn put(mut self, field: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        self.fields.insert(field.into(), payload.into());
        self
    }

    pub fn build(self) -> SinkResult<OutputMessage> {
        let position = self
            .position
            .filter(|p| !p.is_empty())
            .ok_or_else(|| SinkError::backend("message has no position"))?;
        if self.fields.is_empty() {
            return Err(SinkError::backend(format!(
                "message '{}' has no payload fields",
                position
            )));
        }
        Ok(OutputMessage {
            position,
            fields: self.fields,
        })
    }
}

/// A message as seen by a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub message: OutputMessage,
    pub published_at: DateTime<Utc>,
}

#[async_trait]
pub trait Producer: Send + Sync {
    fn topic(&self) -> &str;

    fn builder(&self) -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Durably store `message` without making it visible
    async fn buffer(&self, message: OutputMessage) -> SinkResult<()>;

    /// Make buffered `positions` visible, in the given order
    async fn publish(&self, positions: &[String]) -> SinkResult<()>;
}

#[async_trait]
pub trait Consumer: Send {
    fn topic(&self) -> &str;

    /// Next published message, or `None` if nothing arrives within `timeout`
    async fn receive(&mut self, timeout: Duration) -> SinkResult<Option<PublishedMessage>>;

    /// Continue from the first message published at or after `at`
    async fn seek(&mut self, at: DateTime<Utc>) -> SinkResult<()>;
}

#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn producer(&self, topic: &str) -> SinkResult<Arc<dyn Producer>>;

    async fn consumer(&self, topic: &str) -> SinkResult<Box<dyn Consumer>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Memory,
    Disk,
    S3,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::Memory => f.write_str("memory"),
            SinkKind::Disk => f.write_str("disk"),
            SinkKind::S3 => f.write_str("s3"),
        }
    }
}

impl FromStr for SinkKind {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "mem" => Ok(SinkKind::Memory),
            "disk" | "file" => Ok(SinkKind::Disk),
            "s3" | "object" => Ok(SinkKind::S3),
            "kafka" | "broker" => Err(SinkError::Unsupported(format!(
                "sink '{}' is not available in this build",
                s
            ))),
            other => Err(SinkError::Unsupported(format!("unknown sink '{}'", other))),
        }
    }
}

/// Everything needed to open any of the sinks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub kind: SinkKind,
    pub disk_root: PathBuf,
    pub s3: S3Config,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Disk,
            disk_root: PathBuf::from("./output"),
            s3: S3Config::default(),
        }
    }
}

pub async fn open_sink(config: &SinkConfig) -> SinkResult<Arc<dyn Sink>> {
    let sink: Arc<dyn Sink> = match config.kind {
        SinkKind::Memory => Arc::new(MemorySink::new()),
        SinkKind::Disk => Arc::new(DiskSink::new(&config.disk_root).await?),
        SinkKind::S3 => Arc::new(S3Sink::new(config.s3.clone())),
    };
    tracing::info!(sink = sink.name(), "Sink opened");
    Ok(sink)
}

/// Storage name for one buffered copy of `position`
///
/// Unique per call, so a repeated position never overwrites a message that
/// was buffered or published before it.
pub(crate) fn slot_name(position: &str) -> String {
    format!("{}.{}", encode_component(position), Uuid::now_v7().simple())
}

/// Buffered-but-unpublished entries, queued per position oldest first
#[derive(Debug)]
pub(crate) struct PendingSlots<T> {
    by_position: HashMap<String, VecDeque<T>>,
}

impl<T> Default for PendingSlots<T> {
    fn default() -> Self {
        Self {
            by_position: HashMap::new(),
        }
    }
}

impl<T> PendingSlots<T> {
    pub(crate) fn insert(&mut self, position: impl Into<String>, entry: T) {
        self.by_position.entry(position.into()).or_default().push_back(entry);
    }

    /// Take the oldest entry for each listed position, repeats included
    ///
    /// Takes nothing when any position is short of buffered entries.
    pub(crate) fn take(&mut self, positions: &[String]) -> SinkResult<Vec<T>> {
        let mut wanted: HashMap<&str, usize> = HashMap::new();
        for position in positions {
            let count = wanted.entry(position.as_str()).or_default();
            *count += 1;
            let available = self.by_position.get(position).map_or(0, VecDeque::len);
            if available < *count {
                return Err(SinkError::NotBuffered(position.clone()));
            }
        }

        let mut taken = Vec::with_capacity(positions.len());
        for position in positions {
            if let Some(queue) = self.by_position.get_mut(position) {
                if let Some(entry) = queue.pop_front() {
                    taken.push(entry);
                }
                if queue.is_empty() {
                    self.by_position.remove(position);
                }
            }
        }
        Ok(taken)
    }

    /// Put back entries returned by [`PendingSlots::take`] for `positions`
    pub(crate) fn restore(&mut self, positions: &[String], entries: Vec<T>) {
        for (position, entry) in positions.iter().zip(entries).rev() {
            self.by_position
                .entry(position.clone())
                .or_default()
                .push_front(entry);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.by_position.values().map(VecDeque::len).sum()
    }
}

/// Escape a position for use as a file or object name
pub(crate) fn encode_component(position: &str) -> String {
    let mut out = String::with_capacity(position.len());
    for b in position.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}
