//! Pipeline workers and the wiring that builds them from configuration
//!
//! Two ways through the engine:
//!
//! - **Staged**: [`prepare`] tokenizes sources into the staging store, then
//!   [`produce`] replays it in key order, detects groups and publishes one
//!   message per group.
//! - **Unstaged**: [`direct`] publishes one message per row, in row order.

pub mod direct;
pub mod prepare;
pub mod produce;

use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub use direct::DirectWorker;
pub use prepare::PrepareWorker;
pub use produce::ProduceWorker;

use crate::config::{IngestConfig, StagingConfig};
use crate::context::{RunContext, RunStats};
use crate::error::IngestResult;
use crate::grouping::SameFields;
use crate::key::{KeyBuilder, Schema};
use crate::producer::BatchedProducer;
use crate::sink::Sink;
use crate::staging::postgres::create_pool;
use crate::staging::{
    LmdbStagingStore, PostgresStagingStore, StagingBackend, StagingMode, StagingStore,
};

/// Open the configured staging backend for `topic`
pub async fn open_store(
    config: &StagingConfig,
    topic: &str,
    schema: Arc<Schema>,
    mode: StagingMode,
) -> IngestResult<Box<dyn StagingStore>> {
    let store: Box<dyn StagingStore> = match config.backend {
        StagingBackend::Lmdb => Box::new(
            LmdbStagingStore::open(&config.lmdb, topic, schema, mode, &config.queue).await?,
        ),
        StagingBackend::Postgres => {
            let pool = create_pool(&config.postgres).await?;
            Box::new(PostgresStagingStore::open(pool, topic, schema, mode, &config.queue).await?)
        },
    };
    Ok(store)
}

fn context(config: &IngestConfig) -> Arc<RunContext> {
    Arc::new(RunContext::with_progress_interval(
        config.run.topic.clone(),
        config.run.progress_interval,
    ))
}

/// Stage `sources` into a fresh store
pub async fn prepare(config: &IngestConfig, sources: &[PathBuf]) -> IngestResult<RunStats> {
    let schema = Arc::new(config.schema()?);
    for warning in schema.layout_warnings() {
        tracing::warn!(topic = %config.run.topic, "{}", warning);
    }

    let store = open_store(
        &config.staging,
        &config.run.topic,
        Arc::clone(&schema),
        StagingMode::Prepare,
    )
    .await?;
    let mut worker = PrepareWorker::new(
        store,
        KeyBuilder::new(schema),
        context(config),
        config.delimiter_byte(),
    );

    for source in sources {
        info!(source = %source.display(), "Staging source");
        worker.stage_file(source).await?;
    }
    worker.finish().await
}

/// Replay the staged topic into `sink`, one message per group
pub async fn produce(config: &IngestConfig, sink: &dyn Sink) -> IngestResult<RunStats> {
    let schema = Arc::new(config.schema()?);
    let position = config.position(&schema)?;
    let group_fields = config.group_fields(&schema)?;
    let context = context(config);

    let store = open_store(
        &config.staging,
        &config.run.topic,
        Arc::clone(&schema),
        StagingMode::Produce,
    )
    .await?;
    let producer = BatchedProducer::new(
        sink.producer(&config.run.topic).await?,
        config.producer,
        config.sealer()?,
    )?
    .with_context(Arc::clone(&context));

    ProduceWorker::new(
        store,
        schema,
        position,
        SameFields::new(group_fields),
        producer,
        context,
    )
    .run()
    .await
}

/// Publish every row of `sources` into `sink` without staging
pub async fn direct(
    config: &IngestConfig,
    sink: &dyn Sink,
    sources: &[PathBuf],
) -> IngestResult<RunStats> {
    let schema = Arc::new(config.schema()?);
    let position = config.position(&schema)?;
    let worker = DirectWorker::new(
        sink.producer(&config.run.topic).await?,
        KeyBuilder::new(schema),
        position,
        config.sealer()?,
        config.max_in_flight,
        config.delimiter_byte(),
        context(config),
    )?;

    for source in sources {
        worker.run_file(source).await?;
    }

    let stats = worker.stats();
    info!(
        topic = %config.run.topic,
        published = stats.messages_published,
        elapsed_ms = stats.elapsed_ms,
        "Direct run complete"
    );
    Ok(stats)
}
