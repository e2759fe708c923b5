//! Staging pass: tokenize source files into the staging store

use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::context::{RunContext, RunStats};
use crate::error::IngestResult;
use crate::key::KeyBuilder;
use crate::manifest::Provenance;
use crate::staging::StagingStore;
use crate::tokenizer::{DelimitedReader, SourceHeader};

pub struct PrepareWorker {
    store: Box<dyn StagingStore>,
    keys: KeyBuilder,
    context: Arc<RunContext>,
    delimiter: u8,
    header: Option<Arc<SourceHeader>>,
}

impl PrepareWorker {
    pub fn new(
        store: Box<dyn StagingStore>,
        keys: KeyBuilder,
        context: Arc<RunContext>,
        delimiter: u8,
    ) -> Self {
        Self {
            store,
            keys,
            context,
            delimiter,
            header: None,
        }
    }

    /// Stage every row of the file at `path`
    #[instrument(skip(self), fields(topic = %self.context.topic()))]
    pub async fn stage_file(&mut self, path: &Path) -> IngestResult<u64> {
        let reader = DelimitedReader::open(path, self.delimiter)?;
        self.stage(reader).await
    }

    /// Stage every row yielded by `reader`; returns the rows staged
    pub async fn stage<R: Read + Send>(&mut self, mut reader: DelimitedReader<R>) -> IngestResult<u64> {
        self.write_meta_once(reader.header()).await?;

        let mut staged = 0u64;
        while let Some(record) = reader.next_record()? {
            self.context.record_row_read();
            let key = self.keys.build(&record)?;
            self.store.write_record(&key, &record.row_text).await?;
            self.context.record_row_staged();
            staged += 1;
        }

        info!(
            source = %reader.header().source_path,
            rows = staged,
            "Source staged"
        );
        Ok(staged)
    }

    /// Commit remaining rows and close the store
    pub async fn finish(mut self) -> IngestResult<RunStats> {
        self.store.close().await?;
        let stats = self.context.stats();
        info!(
            topic = %self.context.topic(),
            backend = %self.store.backend(),
            rows_staged = stats.rows_staged,
            elapsed_ms = stats.elapsed_ms,
            "Staging complete"
        );
        Ok(stats)
    }

    async fn write_meta_once(&mut self, header: &Arc<SourceHeader>) -> IngestResult<()> {
        match &self.header {
            Some(first) => {
                if first.columns != header.columns {
                    warn!(
                        first = %first.source_path,
                        source = %header.source_path,
                        "Header differs from the first staged source; keeping the first"
                    );
                }
            },
            None => {
                for (key, value) in Provenance::from_header(header).to_meta()? {
                    self.store.write_header(key, &value).await?;
                }
                self.header = Some(Arc::clone(header));
            },
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::key::{decode, Schema};
    use crate::staging::{
        read_meta, LmdbConfig, LmdbStagingStore, QueueOptions, StagingMode, META_SOURCE_FILE,
    };
    use std::io::Cursor;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn reader(text: &str, name: &str) -> DelimitedReader<Cursor<Vec<u8>>> {
        DelimitedReader::new(Cursor::new(text.as_bytes().to_vec()), PathBuf::from(name), b',')
            .unwrap()
    }

    #[tokio::test]
    async fn test_stages_rows_in_key_order() {
        let dir = TempDir::new().unwrap();
        let config = LmdbConfig {
            root: dir.path().to_path_buf(),
            map_size: 16 * 1024 * 1024,
        };
        let schema = Arc::new(Schema::parse("name:string,age:int32").unwrap());
        let store = LmdbStagingStore::open(
            &config,
            "people",
            Arc::clone(&schema),
            StagingMode::Prepare,
            &QueueOptions::default(),
        )
        .await
        .unwrap();

        let context = Arc::new(RunContext::with_progress_interval("people", 0));
        let mut worker = PrepareWorker::new(
            Box::new(store),
            KeyBuilder::new(Arc::clone(&schema)),
            Arc::clone(&context),
            b',',
        );
        worker
            .stage(reader("Name,Age\nbob,30\nann,31\n", "/a.csv"))
            .await
            .unwrap();
        worker
            .stage(reader("Name,Age\nann,29\n", "/b.csv"))
            .await
            .unwrap();
        let stats = worker.finish().await.unwrap();
        assert_eq!(stats.rows_read, 3);
        assert_eq!(stats.rows_staged, 3);

        let store = LmdbStagingStore::open(
            &config,
            "people",
            Arc::clone(&schema),
            StagingMode::Produce,
            &QueueOptions::default(),
        )
        .await
        .unwrap();
        let meta = read_meta(&store).await.unwrap();
        assert_eq!(meta.get(META_SOURCE_FILE).map(String::as_str), Some("a.csv"));

        let mut cursor = store.read_records(Arc::clone(&schema)).await.unwrap();
        let mut rows = Vec::new();
        while let Some((entry, _)) = cursor.next_entry().await.unwrap() {
            assert_eq!(decode(&entry.key_bytes, &schema).unwrap(), entry.key);
            rows.push(entry.row);
        }
        assert_eq!(rows, vec!["ann,29", "ann,31", "bob,30"]);
    }
}
