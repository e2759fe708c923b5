//! Shared fixtures for the regroup-ingest integration tests
//!
//! The embedded backend always runs, in a temporary directory. The relational
//! backend runs only when `REGROUP_TEST_DATABASE_URL` points at a reachable
//! Postgres; each test then works on its own uniquely named topic.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use regroup_ingest::config::{IngestConfig, RunConfig, StagingConfig};
use regroup_ingest::producer::ProducerOptions;
use regroup_ingest::sink::{S3Config, SinkConfig, SinkKind};
use regroup_ingest::staging::postgres::create_pool;
use regroup_ingest::staging::{
    LmdbConfig, LmdbStagingStore, PostgresConfig, PostgresStagingStore, QueueOptions,
    StagingBackend, StagingMode, StagingStore,
};
use regroup_ingest::Schema;
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const TEST_DATABASE_URL_VAR: &str = "REGROUP_TEST_DATABASE_URL";

/// One staging backend under test
pub struct Harness {
    pub backend: StagingBackend,
    dir: TempDir,
    pool: Option<PgPool>,
}

impl Harness {
    pub fn lmdb() -> Self {
        Self {
            backend: StagingBackend::Lmdb,
            dir: TempDir::new().unwrap(),
            pool: None,
        }
    }

    /// `None` unless the test database is configured and reachable
    pub async fn postgres() -> Option<Self> {
        let url = std::env::var(TEST_DATABASE_URL_VAR).ok()?;
        let config = PostgresConfig {
            url,
            max_connections: 4,
            ..PostgresConfig::default()
        };
        match create_pool(&config).await {
            Ok(pool) => Some(Self {
                backend: StagingBackend::Postgres,
                dir: TempDir::new().unwrap(),
                pool: Some(pool),
            }),
            Err(e) => {
                eprintln!("Skipping Postgres backend: {}", e);
                None
            },
        }
    }

    pub fn lmdb_config(&self) -> LmdbConfig {
        LmdbConfig {
            root: self.dir.path().to_path_buf(),
            map_size: 64 * 1024 * 1024,
        }
    }

    pub async fn open(
        &self,
        topic: &str,
        schema: Arc<Schema>,
        mode: StagingMode,
        options: &QueueOptions,
    ) -> Box<dyn StagingStore> {
        match &self.pool {
            None => Box::new(
                LmdbStagingStore::open(&self.lmdb_config(), topic, schema, mode, options)
                    .await
                    .unwrap(),
            ),
            Some(pool) => Box::new(
                PostgresStagingStore::open(pool.clone(), topic, schema, mode, options)
                    .await
                    .unwrap(),
            ),
        }
    }
}

/// Every backend available in this environment
pub async fn harnesses() -> Vec<Harness> {
    let mut all = vec![Harness::lmdb()];
    match Harness::postgres().await {
        Some(pg) => all.push(pg),
        None => println!("Postgres contract run skipped: {} not set", TEST_DATABASE_URL_VAR),
    }
    all
}

/// Topic name unique to one test run
pub fn unique_topic(prefix: &str) -> String {
    format!("{}_{}", prefix, &uuid::Uuid::new_v4().simple().to_string()[..12])
}

pub fn small_queue(capacity: usize) -> QueueOptions {
    QueueOptions {
        capacity,
        key_buffer_capacity: 16,
        value_buffer_capacity: 32,
        fetch_size: 3,
    }
}

pub fn write_source(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}

/// Configuration for a staged run on the embedded backend
pub fn ingest_config(topic: &str, staging_root: &Path, sink: SinkKind, disk_root: &Path) -> IngestConfig {
    IngestConfig {
        run: RunConfig {
            topic: topic.to_string(),
            schema: "name:string,age:int32".to_string(),
            position: "name".to_string(),
            group_fields: vec!["name".to_string()],
            delimiter: ',',
            progress_interval: 0,
        },
        staging: StagingConfig {
            backend: StagingBackend::Lmdb,
            lmdb: LmdbConfig {
                root: staging_root.to_path_buf(),
                map_size: 64 * 1024 * 1024,
            },
            postgres: PostgresConfig::default(),
            queue: small_queue(2),
        },
        producer: ProducerOptions {
            queue_capacity: 1,
            workers: 2,
        },
        max_in_flight: 4,
        encryption: None,
        sink: SinkConfig {
            kind: sink,
            disk_root: disk_root.to_path_buf(),
            s3: S3Config::default(),
        },
    }
}
