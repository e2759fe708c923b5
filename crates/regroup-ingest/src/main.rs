//! Regroup Ingest - delimited rows to keyed output messages

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use regroup_common::logging::{init_logging, LogConfig, LogLevel};
use regroup_ingest::manifest::{Manifest, CONTENT_FIELD, MANIFEST_FIELD};
use regroup_ingest::sink::open_sink;
use regroup_ingest::{pipeline, IngestConfig, RunStats};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "regroup-ingest")]
#[command(author, version, about = "Regroup delimited rows into keyed messages")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Topic, overriding REGROUP_TOPIC
    #[arg(short, long, global = true)]
    topic: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tokenize sources into a fresh staging store
    Prepare {
        /// Delimited source files
        #[arg(required = true)]
        sources: Vec<PathBuf>,
    },

    /// Replay the staging store and publish one message per group
    Produce,

    /// Publish one message per row, in row order, without staging
    Direct {
        /// Delimited source files
        #[arg(required = true)]
        sources: Vec<PathBuf>,
    },

    /// Print messages published to the configured sink
    Inspect {
        /// Start at the first message published at or after this RFC 3339 time
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Stop after this many messages
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Give up after waiting this long for the next message
        #[arg(long, default_value_t = 2_000)]
        timeout_ms: u64,
    },
}

fn log_stats(command: &str, stats: &RunStats) {
    info!(
        command,
        rows_read = stats.rows_read,
        rows_staged = stats.rows_staged,
        groups = stats.groups_emitted,
        published = stats.messages_published,
        elapsed_ms = stats.elapsed_ms,
        "Run complete"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("regroup-ingest")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    let _guard = init_logging(&log_config)?;

    let mut config = IngestConfig::load_env().context("Failed to load configuration")?;
    if let Some(topic) = cli.topic {
        config.run.topic = topic;
    }
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Command::Prepare { sources } => {
            let stats = pipeline::prepare(&config, &sources)
                .await
                .context("Staging failed")?;
            log_stats("prepare", &stats);
        },
        Command::Produce => {
            let sink = open_sink(&config.sink).await.context("Failed to open sink")?;
            let stats = pipeline::produce(&config, sink.as_ref())
                .await
                .context("Produce failed")?;
            log_stats("produce", &stats);
        },
        Command::Direct { sources } => {
            let sink = open_sink(&config.sink).await.context("Failed to open sink")?;
            let stats = pipeline::direct(&config, sink.as_ref(), &sources)
                .await
                .context("Direct run failed")?;
            log_stats("direct", &stats);
        },
        Command::Inspect {
            since,
            limit,
            timeout_ms,
        } => {
            inspect(&config, since, limit, Duration::from_millis(timeout_ms)).await?;
        },
    }

    Ok(())
}

async fn inspect(
    config: &IngestConfig,
    since: Option<DateTime<Utc>>,
    limit: Option<usize>,
    timeout: Duration,
) -> Result<()> {
    let sink = open_sink(&config.sink).await.context("Failed to open sink")?;
    let mut consumer = sink.consumer(&config.run.topic).await?;
    if let Some(since) = since {
        consumer.seek(since).await?;
    }
    let sealer = config.sealer()?;

    let mut seen = 0usize;
    while limit.is_none_or(|limit| seen < limit) {
        let Some(published) = consumer.receive(timeout).await? else {
            break;
        };
        seen += 1;

        let open = |name: &str| -> Result<Option<Vec<u8>>> {
            let Some(payload) = published.message.field(name) else {
                return Ok(None);
            };
            Ok(Some(match &sealer {
                Some(sealer) => sealer.open(payload)?,
                None => payload.to_vec(),
            }))
        };

        println!(
            "== {} (published {})",
            published.message.position(),
            published.published_at.to_rfc3339()
        );
        if let Some(manifest) = open(MANIFEST_FIELD)? {
            let manifest = Manifest::from_json(&manifest)?;
            println!(
                "   source {} | {} bytes | {} {}",
                manifest.provenance.source_path,
                manifest.content_length,
                manifest.digest_algorithm,
                manifest.digest
            );
            if let Some(content) = open(CONTENT_FIELD)? {
                manifest
                    .verify(&content)
                    .with_context(|| format!("Content of {} failed verification", manifest.position))?;
                print!("{}", String::from_utf8_lossy(&content));
            }
        }
    }

    info!(topic = %config.run.topic, messages = seen, "Inspection complete");
    Ok(())
}
