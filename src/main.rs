//! # Hash Harvester CLI (`harvester`)
//!
//! The `harvester` binary drives the harvesting engine. It provides
//! commands for job-store initialization, running the discovery and
//! processing loop, and inspecting job records.
//!
//! ## Usage
//!
//! ```bash
//! harvester --config ./config/harvester.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvester init` | Create the SQLite job store schema |
//! | `harvester run` | Discover repositories and process new sources |
//! | `harvester jobs` | List job records (`--failed` for failures only) |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the job store
//! harvester init --config ./config/harvester.toml
//!
//! # Process everything new, four workers per repository
//! harvester run --processing-worker-count 4
//!
//! # Re-run two sources that were already exported
//! harvester run --reprocess deadbeef...,cafef00d...
//!
//! # Skip exporters and save first-observation samples to disk
//! harvester run --export false --export-path /srv/harvester-uploads
//!
//! # Show what failed
//! harvester jobs --failed
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use hash_harvester::config::{self, Config};
use hash_harvester::engine::{Harvester, HarvesterOptions};
use hash_harvester::exporter_postgres::PostgresExporter;
use hash_harvester::jobstore::SqliteJobStore;
use hash_harvester::processor::{CommandProcessor, WalkProcessor};
use hash_harvester::traits::{Exporter, ExporterRegistry, Importer, ImporterRegistry, Processor};

/// Hash Harvester — builds hash sets from heterogeneous artifact
/// repositories.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file with the engine, importer, exporter, and processor settings.
#[derive(Parser)]
#[command(
    name = "harvester",
    about = "Hash Harvester — builds hash sets from heterogeneous artifact repositories",
    version,
    long_about = "Hash Harvester discovers artifacts (archives, images, packages) in configured \
    repositories, unpacks each one down to its constituent files, and produces a hash set: a \
    SHA-256 digest and provenance for every extracted file, with repository-level deduplication \
    so each source is processed exactly once."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harvester.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the job store schema.
    ///
    /// Creates the SQLite database file and the `jobs` table. Idempotent;
    /// running it multiple times is safe.
    Init,

    /// Discover repositories and process new sources.
    ///
    /// Iterates the configured importers in order. Sources whose
    /// quick-hash is already in the job store are skipped unless listed
    /// for reprocessing. Individual source failures are recorded on their
    /// job records and do not fail the run.
    Run {
        /// Number of processing workers per repository.
        #[arg(long)]
        processing_worker_count: Option<usize>,

        /// Directory for the per-repository cache files.
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Whether to run the configured exporters. When false, samples
        /// are saved to disk under --export-path instead.
        #[arg(long)]
        export: Option<bool>,

        /// Destination folder for save-to-disk mode.
        #[arg(long)]
        export_path: Option<PathBuf>,

        /// Comma-separated quick-hashes of sources to reprocess.
        #[arg(long, value_delimiter = ',')]
        reprocess: Vec<String>,
    },

    /// List job records, newest first.
    Jobs {
        /// Only show failed jobs.
        #[arg(long)]
        failed: bool,
    },
}

fn build_importers(config: &Config) -> Result<Vec<Box<dyn Importer>>> {
    let registry = ImporterRegistry::from_config(config)?;
    if registry.is_empty() {
        anyhow::bail!("no importers configured; add an [importers.*] section to the config");
    }
    Ok(registry.into_inner())
}

fn build_processor(config: &Config) -> Result<Arc<dyn Processor>> {
    match config.processor.kind.as_str() {
        "command" => Ok(Arc::new(CommandProcessor::new(
            config.processor.command.clone(),
        )?)),
        _ => Ok(Arc::new(WalkProcessor)),
    }
}

async fn build_exporters(config: &Config) -> Result<Vec<Box<dyn Exporter>>> {
    let mut registry = ExporterRegistry::new();

    if let Some(postgres) = &config.exporters.postgres {
        registry.register(Box::new(
            PostgresExporter::connect(&postgres.url, postgres.upload_payloads).await?,
        ));
    }

    Ok(registry.into_inner())
}

async fn run(config: &Config, options: HarvesterOptions) -> Result<()> {
    let importers = build_importers(config)?;
    let processor = build_processor(config)?;
    let exporters = if options.export {
        let exporters = build_exporters(config).await?;
        if exporters.is_empty() {
            warn!("export is enabled but no exporters are configured; samples will only be counted");
        }
        exporters
    } else {
        Vec::new()
    };

    let job_store = Arc::new(SqliteJobStore::connect(&config.jobstore.path).await?);
    job_store.init_schema().await?;

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, finishing in-flight sources");
            signal_token.cancel();
        }
    });

    let harvester = Harvester::new(importers, processor, exporters, job_store, options);
    harvester.run(cancel).await?;

    println!("ok");
    Ok(())
}

async fn list_jobs(config: &Config, failed: bool) -> Result<()> {
    let store = SqliteJobStore::connect(&config.jobstore.path).await?;
    store.init_schema().await?;
    let records = store.list(failed).await?;

    if records.is_empty() {
        println!("no jobs recorded");
        return Ok(());
    }

    for (quick_hash, record) in &records {
        let imported = Utc
            .timestamp_opt(record.imported_at, 0)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| record.imported_at.to_string());
        println!(
            "{:<12} {:<8} {} {} {} {}",
            record.status, record.repo, imported, quick_hash, record.source_id, record.error
        );
    }
    println!("{} job(s)", records.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let store = SqliteJobStore::connect(&cfg.jobstore.path).await?;
            store.init_schema().await?;
            println!("Job store initialized successfully.");
        }
        Commands::Run {
            processing_worker_count,
            cache_dir,
            export,
            export_path,
            reprocess,
        } => {
            let options = HarvesterOptions {
                worker_count: processing_worker_count.unwrap_or(cfg.engine.worker_count),
                cache_dir: cache_dir.unwrap_or_else(|| cfg.engine.cache_dir.clone()),
                temp_root: cfg.engine.temp_root.clone(),
                export: export.unwrap_or(cfg.engine.export),
                export_path: export_path.unwrap_or_else(|| cfg.engine.export_path.clone()),
                reprocess,
            };
            run(&cfg, options).await?;
        }
        Commands::Jobs { failed } => {
            list_jobs(&cfg, failed).await?;
        }
    }

    Ok(())
}
