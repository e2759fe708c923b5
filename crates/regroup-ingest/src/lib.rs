//! Regroup Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Re-groups rows of delimited files into keyed output messages.
//!
//! # Overview
//!
//! - **Keys**: [`key::SortableKey`] values encode to bytes whose order is the
//!   staging order
//! - **Staging**: [`staging::StagingStore`] persists `(key, row)` pairs in an
//!   embedded LMDB environment or in Postgres and replays them sorted
//! - **Grouping**: [`grouping::GroupDetector`] cuts the sorted replay into runs
//!   of related rows
//! - **Producing**: [`producer::BatchedProducer`] seals, buffers and publishes
//!   messages in batches; [`barrier::ReorderingBarrier`] restores submission
//!   order for unstaged runs
//! - **Sinks**: memory, local directory and S3 destinations
//!
//! # Example
//!
//! ```no_run
//! use regroup_ingest::{pipeline, sink::open_sink, IngestConfig};
//! use std::path::PathBuf;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     pipeline::prepare(&config, &[PathBuf::from("people.csv")]).await?;
//!
//!     let sink = open_sink(&config.sink).await?;
//!     let stats = pipeline::produce(&config, sink.as_ref()).await?;
//!     tracing::info!(groups = stats.groups_emitted, "done");
//!     Ok(())
//! }
//! ```

pub mod barrier;
pub mod buffer_pool;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod grouping;
pub mod key;
pub mod manifest;
pub mod pipeline;
pub mod producer;
pub mod sink;
pub mod staging;
pub mod tokenizer;

// Re-export commonly used types
pub use config::IngestConfig;
pub use context::{RunContext, RunStats};
pub use error::{IngestError, IngestResult};
pub use key::{Schema, SortableKey, Value};
