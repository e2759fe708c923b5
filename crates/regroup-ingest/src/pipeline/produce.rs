//! Replay pass: staged rows to grouped output messages

use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::context::{RunContext, RunStats};
use crate::error::IngestResult;
use crate::grouping::{Group, GroupDetector, GroupPredicate};
use crate::key::{PositionSpec, Schema};
use crate::manifest::{Manifest, Provenance, CONTENT_FIELD, MANIFEST_FIELD};
use crate::producer::BatchedProducer;
use crate::sink::OutputMessage;
use crate::staging::{read_meta, StagingStore};

pub struct ProduceWorker<P> {
    store: Box<dyn StagingStore>,
    schema: Arc<Schema>,
    position: PositionSpec,
    detector: GroupDetector<P>,
    producer: BatchedProducer,
    context: Arc<RunContext>,
}

impl<P: GroupPredicate> ProduceWorker<P> {
    pub fn new(
        store: Box<dyn StagingStore>,
        schema: Arc<Schema>,
        position: PositionSpec,
        predicate: P,
        producer: BatchedProducer,
        context: Arc<RunContext>,
    ) -> Self {
        Self {
            store,
            schema,
            position,
            detector: GroupDetector::new(predicate),
            producer,
            context,
        }
    }

    /// Replay the whole store and publish one message per group
    #[instrument(skip(self), fields(topic = %self.context.topic()))]
    pub async fn run(mut self) -> IngestResult<RunStats> {
        let meta = read_meta(self.store.as_ref()).await?;
        let provenance = Provenance::from_meta(&meta)?;

        let mut cursor = self.store.read_records(Arc::clone(&self.schema)).await?;
        let mut replayed = 0u64;
        while let Some((entry, has_next)) = cursor.next_entry().await? {
            replayed += 1;
            if let Some(group) = self.detector.push(entry, has_next) {
                self.context.record_group();
                let message = self.render(&provenance, &group)?;
                self.producer.produce(message).await?;
            }
        }
        drop(cursor);

        self.producer.close().await?;
        self.store.close().await?;

        let stats = self.context.stats();
        info!(
            replayed,
            groups = self.detector.emitted(),
            skipped = self.detector.skipped(),
            published = stats.messages_published,
            elapsed_ms = stats.elapsed_ms,
            "Produce complete"
        );
        Ok(stats)
    }

    fn render(&self, provenance: &Provenance, group: &Group) -> IngestResult<OutputMessage> {
        let Some(first) = group.first() else {
            return Err(crate::error::IngestError::encoding("cannot render an empty group"));
        };
        let position = self.position.position(&first.key, &self.schema, &self.context)?;
        let content = provenance.render(group.rows());
        let manifest = Manifest::describe(
            self.context.topic(),
            &position,
            provenance,
            content.as_bytes(),
        );
        debug!(%position, rows = group.len(), "Group rendered");

        Ok(OutputMessage::builder()
            .position(position)
            .put(CONTENT_FIELD, content)
            .put(MANIFEST_FIELD, manifest.to_json()?)
            .build()?)
    }
}
