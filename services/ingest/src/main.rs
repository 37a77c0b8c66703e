//! phonelog ingest
//!
//! Reads a JSON-lines manifest of staged chunks (from a file or stdin) and
//! ingests them concurrently into per-boot-session archives.
//!
//! Exits with status 2 if any boot session was quarantined, 130 if cancelled.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use phonelog_ingest::config::default_concurrency;
use phonelog_ingest::merge::DEFAULT_BUFFER_SIZE;
use phonelog_ingest::{source, IngestPool, IngestSettings, Pipeline, PipelineConfig};
use phonelog_logline::{LogLineParser, TaggedLineParser};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Ingest staged device log chunks into boot session archives.
#[derive(Debug, Parser)]
#[command(name = "phonelog-ingest")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON-lines manifest of work items. Reads stdin when omitted.
    #[arg(long, env = "PHONELOG_MANIFEST")]
    manifest: Option<PathBuf>,

    /// Extension for boot session archives.
    #[arg(long, env = "PHONELOG_ARCHIVE_EXT", default_value = "gz")]
    archive_ext: String,

    /// Extension for metadata records.
    #[arg(long, env = "PHONELOG_META_EXT", default_value = "yaml")]
    meta_ext: String,

    /// Transfer buffer size in bytes.
    #[arg(long, env = "PHONELOG_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Skip the start/end timestamp scan.
    #[arg(long, env = "PHONELOG_NO_SCAN_TIMESTAMPS")]
    no_scan_timestamps: bool,

    /// Maximum work items processed at once.
    #[arg(long, env = "PHONELOG_MAX_CONCURRENT", default_value_t = default_concurrency())]
    max_concurrent: usize,

    /// Emit logs as JSON.
    #[arg(long, env = "PHONELOG_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn settings(&self) -> IngestSettings {
        IngestSettings {
            archive_ext: self.archive_ext.clone(),
            meta_ext: self.meta_ext.clone(),
            buffer_size: self.buffer_size,
            scan_timestamps: !self.no_scan_timestamps,
            max_concurrent: self.max_concurrent,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let settings = cli.settings();
    info!(
        archive_ext = %settings.archive_ext,
        meta_ext = %settings.meta_ext,
        buffer_size = settings.buffer_size,
        max_concurrent = settings.max_concurrent,
        "Starting phonelog ingest"
    );

    let parser: Arc<dyn LogLineParser> = Arc::new(TaggedLineParser);
    let pipeline = Pipeline::new(PipelineConfig::standard(&settings, parser));
    let pool = IngestPool::new(pipeline, settings.max_concurrent);

    let (tx, rx) = mpsc::channel(settings.max_concurrent.max(1) * 2);
    let manifest = cli.manifest.clone();
    let reader_handle = tokio::task::spawn_blocking(move || -> Result<usize> {
        match manifest {
            Some(path) => {
                let file = File::open(&path)
                    .with_context(|| format!("failed to open manifest {}", path.display()))?;
                Ok(source::feed(BufReader::new(file), tx)?)
            }
            None => Ok(source::feed(io::stdin().lock(), tx)?),
        }
    });

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Received shutdown signal, cancelling in-flight work");
                cancel.cancel();
            }
        }
    });

    let report = pool.process(rx, cancel.clone()).await;

    // The manifest reader may be blocked on stdin after cancellation
    if !cancel.is_cancelled() {
        let sent = reader_handle.await.context("manifest reader panicked")??;
        info!(items = sent, "Manifest fully read");
    }

    let quarantined = pool.pipeline().quarantine().entries();
    for entry in &quarantined {
        error!(
            out_dir = %entry.out_dir.display(),
            boot_id = %entry.boot_id,
            device_id = %entry.device_id,
            staging = %entry.staging_path.display(),
            reason = %entry.reason,
            "Boot session quarantined"
        );
    }

    info!(
        completed = report.completed,
        completed_with_failures = report.completed_with_failures,
        aborted = report.aborted,
        quarantined = report.quarantined,
        skipped = report.skipped,
        "Ingest finished"
    );

    // Exit directly: a cancelled stdin reader would otherwise hold up runtime shutdown
    if cancel.is_cancelled() {
        std::process::exit(130);
    }
    if !quarantined.is_empty() {
        std::process::exit(2);
    }
    Ok(())
}
