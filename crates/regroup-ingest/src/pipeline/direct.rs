//! Unstaged pass: one message per row, published in row order
//!
//! Each row becomes its own unit of work (seal, buffer). Units run
//! concurrently up to the in-flight bound and finish in any order; the
//! reordering barrier holds finished units back until everything submitted
//! before them is done, so publishes follow the source order.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::barrier::ReorderingBarrier;
use crate::context::{RunContext, RunStats};
use crate::crypto::Sealer;
use crate::error::{IngestError, IngestResult};
use crate::key::{KeyBuilder, PositionSpec};
use crate::manifest::{Manifest, Provenance, CONTENT_FIELD, MANIFEST_FIELD};
use crate::sink::{OutputMessage, Producer};
use crate::tokenizer::DelimitedReader;

type Unit = JoinSet<IngestResult<String>>;

pub struct DirectWorker {
    sink: Arc<dyn Producer>,
    keys: KeyBuilder,
    position: PositionSpec,
    sealer: Option<Arc<Sealer>>,
    max_in_flight: usize,
    delimiter: u8,
    context: Arc<RunContext>,
}

/// Units submitted but not yet published
struct InFlight {
    tasks: Unit,
    barrier: ReorderingBarrier,
    positions: HashSet<String>,
}

impl DirectWorker {
    pub fn new(
        sink: Arc<dyn Producer>,
        keys: KeyBuilder,
        position: PositionSpec,
        sealer: Option<Sealer>,
        max_in_flight: usize,
        delimiter: u8,
        context: Arc<RunContext>,
    ) -> IngestResult<Self> {
        if max_in_flight == 0 {
            return Err(IngestError::config("In-flight bound must be greater than 0"));
        }
        position.validate(keys.schema())?;
        Ok(Self {
            sink,
            keys,
            position,
            sealer: sealer.map(Arc::new),
            max_in_flight,
            delimiter,
            context,
        })
    }

    #[instrument(skip(self), fields(topic = %self.context.topic()))]
    pub async fn run_file(&self, path: &Path) -> IngestResult<u64> {
        let reader = DelimitedReader::open(path, self.delimiter)?;
        self.run(reader).await
    }

    /// Publish one message per row of `reader`; returns the number published
    pub async fn run<R: Read + Send>(&self, mut reader: DelimitedReader<R>) -> IngestResult<u64> {
        let provenance = Provenance::from_header(reader.header());
        let mut in_flight = InFlight {
            tasks: JoinSet::new(),
            barrier: ReorderingBarrier::new(),
            positions: HashSet::new(),
        };
        let mut published = 0u64;

        while let Some(record) = reader.next_record()? {
            self.context.record_row_read();
            let key = self.keys.build(&record)?;
            let position = self.position.position(&key, self.keys.schema(), &self.context)?;
            let message = render(self.context.topic(), &position, &provenance, &record.row_text)?;

            // Equal positions must not be in flight together.
            while in_flight.positions.contains(&position)
                || in_flight.tasks.len() >= self.max_in_flight
            {
                published += self.settle_one(&mut in_flight).await?;
            }

            in_flight.barrier.add_expected(position.clone());
            in_flight.positions.insert(position.clone());
            let sink = Arc::clone(&self.sink);
            let sealer = self.sealer.clone();
            in_flight.tasks.spawn(async move {
                let outgoing = match sealer {
                    Some(sealer) => message.try_map_fields(|_, payload| sealer.seal(payload))?,
                    None => message,
                };
                sink.buffer(outgoing).await?;
                Ok::<String, IngestError>(position)
            });
        }

        while !in_flight.tasks.is_empty() {
            published += self.settle_one(&mut in_flight).await?;
        }

        info!(
            source = %reader.header().source_path,
            published,
            "Source published"
        );
        Ok(published)
    }

    /// Wait for one unit and publish whatever its completion releases
    async fn settle_one(&self, in_flight: &mut InFlight) -> IngestResult<u64> {
        let Some(joined) = in_flight.tasks.join_next().await else {
            return Ok(0);
        };
        let position = match joined {
            Ok(Ok(position)) => position,
            Ok(Err(e)) => return Err(self.abort(in_flight, e)),
            Err(e) => return Err(self.abort(in_flight, IngestError::from(e))),
        };

        let released = in_flight.barrier.complete(position);
        if released.is_empty() {
            return Ok(0);
        }

        self.sink.publish(&released).await?;
        for position in &released {
            in_flight.positions.remove(position);
        }
        self.context.record_published(released.len() as u64);
        debug!(count = released.len(), held = in_flight.barrier.held(), "Released batch published");
        Ok(released.len() as u64)
    }

    fn abort(&self, in_flight: &mut InFlight, error: IngestError) -> IngestError {
        in_flight.tasks.abort_all();
        warn!(
            pending = in_flight.barrier.pending(),
            error = %error,
            "Unit failed, unpublished rows dropped"
        );
        error
    }

    pub fn stats(&self) -> RunStats {
        self.context.stats()
    }
}

fn render(
    topic: &str,
    position: &str,
    provenance: &Provenance,
    row: &str,
) -> IngestResult<OutputMessage> {
    let content = provenance.render([row]);
    let manifest = Manifest::describe(topic, position, provenance, content.as_bytes());
    Ok(OutputMessage::builder()
        .position(position)
        .put(CONTENT_FIELD, content)
        .put(MANIFEST_FIELD, manifest.to_json()?)
        .build()?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::key::Schema;
    use crate::sink::{MemorySink, SinkResult};
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::time::Duration;

    fn reader(text: &str) -> DelimitedReader<Cursor<Vec<u8>>> {
        DelimitedReader::new(Cursor::new(text.as_bytes().to_vec()), PathBuf::from("/in.csv"), b',')
            .unwrap()
    }

    fn worker(sink: Arc<dyn Producer>, position: &str, max_in_flight: usize) -> DirectWorker {
        let schema = Arc::new(Schema::parse("name:string,delay:int32").unwrap());
        DirectWorker::new(
            sink,
            KeyBuilder::new(schema),
            PositionSpec::parse(position).unwrap(),
            None,
            max_in_flight,
            b',',
            Arc::new(RunContext::with_progress_interval("t", 0)),
        )
        .unwrap()
    }

    /// Buffers after a per-row delay so completions arrive out of order
    struct SlowProducer {
        inner: Arc<dyn Producer>,
    }

    #[async_trait]
    impl Producer for SlowProducer {
        fn topic(&self) -> &str {
            self.inner.topic()
        }

        async fn buffer(&self, message: OutputMessage) -> SinkResult<()> {
            let content = message.field(CONTENT_FIELD).unwrap().clone();
            let text = String::from_utf8_lossy(&content).to_string();
            let delay: u64 = text
                .lines()
                .nth(1)
                .and_then(|row| row.split(',').nth(1))
                .and_then(|d| d.parse().ok())
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.inner.buffer(message).await
        }

        async fn publish(&self, positions: &[String]) -> SinkResult<()> {
            self.inner.publish(positions).await
        }
    }

    #[tokio::test]
    async fn test_publishes_in_row_order_despite_completion_order() {
        let sink = MemorySink::new();
        let slow = Arc::new(SlowProducer {
            inner: Arc::new(sink.memory_producer("t")),
        });
        let worker = worker(slow, "name", 8);

        let published = worker
            .run(reader("name,delay\na,40\nb,5\nc,20\nd,0\n"))
            .await
            .unwrap();
        assert_eq!(published, 4);

        let order: Vec<String> = sink
            .published("t")
            .iter()
            .map(|m| m.message.position().to_string())
            .collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
        assert_eq!(worker.stats().messages_published, 4);
    }

    #[tokio::test]
    async fn test_duplicate_positions_are_serialized() {
        let sink = MemorySink::new();
        let worker = worker(Arc::new(sink.memory_producer("t")), "name", 4);

        worker
            .run(reader("name,delay\na,1\na,2\nb,3\n"))
            .await
            .unwrap();

        let published = sink.published("t");
        assert_eq!(published.len(), 3);
        let rows: Vec<String> = published
            .iter()
            .map(|m| String::from_utf8_lossy(m.message.field(CONTENT_FIELD).unwrap()).to_string())
            .collect();
        assert_eq!(rows[0], "name,delay\na,1\n");
        assert_eq!(rows[1], "name,delay\na,2\n");
    }

    #[tokio::test]
    async fn test_in_flight_bound_of_one() {
        let sink = MemorySink::new();
        let worker = worker(Arc::new(sink.memory_producer("t")), "name,@sequence", 1);
        worker.run(reader("name,delay\nx,0\ny,0\n")).await.unwrap();

        let calls = sink.publish_calls("t");
        assert_eq!(calls, vec![vec!["x.1".to_string()], vec!["y.2".to_string()]]);
    }
}
