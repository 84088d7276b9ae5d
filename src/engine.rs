//! The harvesting engine: run coordinator and per-source pipeline.
//!
//! Repositories are processed one after the other. Within a repository the
//! coordinator diffs discovered sources against the job store, then feeds
//! the new ones to a bounded pool of workers over an unbounded channel.
//! Each worker drives one source at a time through the state machine:
//!
//! ```text
//! discovered → preprocessed → processed → cached → exported
//!      └───────────┴──────────────┴──────────┴────→ failed
//! ```
//!
//! The preprocess/extract stages run in parallel across workers. From the
//! cache check through cleanup (first-observation decisions, the periodic
//! cache save, the export or save-to-disk) a per-repository mutex
//! serialises the workers, which is what guarantees at most one
//! `upload=true` per file digest per repository and keeps periodic cache
//! snapshots coherent.
//!
//! No stage error escapes the pipeline: a failing source transitions to
//! `failed`, its local storage is purged, and the worker moves on. The run
//! as a whole succeeds as long as every repository finished its
//! discovery/dispatch loop.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::RepoCache;
use crate::hashing;
use crate::models::{Extraction, JobRecord, JobStatus, Sample};
use crate::traits::{ExportSource, Exporter, Importer, JobStore, Processor, Source};

/// Cache files can be very large; persist only after this many sources
/// (plus once when the repository completes).
const CACHE_SAVE_EVERY: usize = 20;

/// Engine-level options, assembled from config and CLI flags.
#[derive(Debug, Clone)]
pub struct HarvesterOptions {
    /// Number of pipeline workers per repository.
    pub worker_count: usize,
    /// Directory holding the per-repository cache files.
    pub cache_dir: PathBuf,
    /// Root under which all engine-owned temp directories live. Cleanup
    /// refuses to delete anything outside this prefix.
    pub temp_root: PathBuf,
    /// Run the configured exporters (`true`) or save samples to disk.
    pub export: bool,
    /// Destination for save-to-disk mode.
    pub export_path: PathBuf,
    /// Quick-hashes whose sources are forced through the pipeline again.
    pub reprocess: Vec<String>,
}

/// The harvesting engine.
pub struct Harvester {
    importers: Vec<Box<dyn Importer>>,
    processor: Arc<dyn Processor>,
    exporters: Arc<Vec<Box<dyn Exporter>>>,
    job_store: Arc<dyn JobStore>,
    options: Arc<HarvesterOptions>,
}

/// Repository cache plus the periodic-save counter, guarded by one mutex
/// so saves always snapshot a coherent cache.
struct CacheState {
    cache: RepoCache,
    sources_since_save: usize,
}

type SourceQueue = Arc<Mutex<mpsc::UnboundedReceiver<(String, Box<dyn Source>)>>>;

impl Harvester {
    pub fn new(
        importers: Vec<Box<dyn Importer>>,
        processor: Arc<dyn Processor>,
        exporters: Vec<Box<dyn Exporter>>,
        job_store: Arc<dyn JobStore>,
        options: HarvesterOptions,
    ) -> Harvester {
        Harvester {
            importers,
            processor,
            exporters: Arc::new(exporters),
            job_store,
            options: Arc::new(options),
        }
    }

    /// Executes the main processing loop: every repository in configured
    /// order, each with its own worker pool. Individual source failures
    /// are recorded on their job records and do not fail the run.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        for importer in &self.importers {
            if cancel.is_cancelled() {
                info!("cancellation requested, stopping before next repository");
                break;
            }

            let repo_name = importer.repo_name().to_string();
            let new_sources = match self.new_sources(importer.as_ref()).await {
                Ok(sources) => sources,
                Err(err) => {
                    error!(repo = %repo_name, err = format!("{err:#}"), "skipping repository");
                    continue;
                }
            };

            if new_sources.is_empty() {
                info!(
                    repo = %repo_name,
                    repo_path = importer.repo_path(),
                    "no new sources"
                );
                continue;
            }

            let cache = match RepoCache::load(&repo_name, &self.options.cache_dir) {
                Ok(cache) => cache,
                Err(err) => {
                    error!(repo = %repo_name, err = format!("{err:#}"), "skipping repository");
                    continue;
                }
            };
            let state = Arc::new(Mutex::new(CacheState {
                cache,
                sources_since_save: 0,
            }));

            let (tx, rx) = mpsc::unbounded_channel();
            for pair in new_sources {
                // Receiver outlives every send; the channel is unbounded.
                let _ = tx.send(pair);
            }
            drop(tx);
            let queue: SourceQueue = Arc::new(Mutex::new(rx));

            let mut pool = JoinSet::new();
            for _ in 0..self.options.worker_count.max(1) {
                let worker = Worker {
                    repo_name: repo_name.clone(),
                    processor: Arc::clone(&self.processor),
                    exporters: Arc::clone(&self.exporters),
                    job_store: Arc::clone(&self.job_store),
                    options: Arc::clone(&self.options),
                    state: Arc::clone(&state),
                    queue: Arc::clone(&queue),
                    cancel: cancel.clone(),
                };
                pool.spawn(worker.run());
            }
            while let Some(joined) = pool.join_next().await {
                if let Err(err) = joined {
                    error!(repo = %repo_name, %err, "pipeline worker panicked");
                }
            }

            let state = state.lock().await;
            if let Err(err) = state.cache.save(&repo_name, &self.options.cache_dir) {
                error!(repo = %repo_name, err = format!("{err:#}"), "could not save repository cache");
            }
        }

        Ok(())
    }

    /// Discovers the repository and returns the sources that still need
    /// processing, paired with their quick-hashes.
    async fn new_sources(
        &self,
        importer: &dyn Importer,
    ) -> Result<Vec<(String, Box<dyn Source>)>> {
        info!(
            repo = importer.repo_name(),
            repo_path = importer.repo_path(),
            "discovering repository"
        );
        let sources = importer
            .discover_repo()
            .await
            .with_context(|| format!("{}: discovering repository", importer.repo_name()))?;
        info!(
            repo = importer.repo_name(),
            count = sources.len(),
            "discovered sources"
        );

        let statuses = self
            .job_store
            .fetch_all()
            .await
            .context("could not fetch processed sources from job store")?;

        let mut fresh = Vec::new();
        for source in sources {
            let quick_hash = match source.quick_hash() {
                Ok(hash) => hash,
                Err(err) => {
                    error!(
                        source = source.id(),
                        err = format!("{err:#}"),
                        "skipping source, quick hash failed"
                    );
                    continue;
                }
            };
            debug!(source = source.id(), quick_hash = %quick_hash, "discovered source");

            if self.should_process(&quick_hash, statuses.get(&quick_hash).map(String::as_str)) {
                fresh.push((quick_hash, source));
            }
        }

        info!(
            repo = importer.repo_name(),
            repo_path = importer.repo_path(),
            count = fresh.len(),
            "new sources"
        );
        Ok(fresh)
    }

    /// A source is dispatched when its quick-hash is unknown, on the
    /// caller-supplied reprocess list, or stored with the `reprocess`
    /// sentinel status. Comparisons are case-insensitive.
    fn should_process(&self, quick_hash: &str, status: Option<&str>) -> bool {
        match status {
            None => true,
            Some(status) => {
                self.options
                    .reprocess
                    .iter()
                    .any(|hash| hash.eq_ignore_ascii_case(quick_hash))
                    || status.eq_ignore_ascii_case(JobStatus::Reprocess.as_str())
            }
        }
    }
}

/// One pipeline worker. Pulls sources off the shared queue and owns each
/// one exclusively from dispatch until cleanup.
struct Worker {
    repo_name: String,
    processor: Arc<dyn Processor>,
    exporters: Arc<Vec<Box<dyn Exporter>>>,
    job_store: Arc<dyn JobStore>,
    options: Arc<HarvesterOptions>,
    state: Arc<Mutex<CacheState>>,
    queue: SourceQueue,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        loop {
            // In-flight sources finish their current state; cancellation
            // is honoured between sources.
            if self.cancel.is_cancelled() {
                info!(repo = %self.repo_name, "cancellation requested, worker stopping");
                break;
            }

            let next = { self.queue.lock().await.recv().await };
            let Some((quick_hash, source)) = next else {
                break;
            };
            self.process_source(quick_hash, source).await;
        }
    }

    async fn process_source(&self, quick_hash: String, mut source: Box<dyn Source>) {
        let mut record = JobRecord::discovered(
            source.id(),
            source.repo_name(),
            source.repo_path(),
            &source.remote_path(),
            chrono::Utc::now().timestamp(),
        );
        self.update_job(&quick_hash, &record).await;

        // Preprocess: materialise the artifact locally.
        info!(source = source.id(), "preprocessing");
        let started = Instant::now();
        let extractor_input = match source.preprocess().await {
            Ok(path) => path,
            Err(err) => {
                let base_dir = base_dir_of(&source.local_path());
                self.fail(
                    &quick_hash,
                    &mut record,
                    base_dir.as_deref(),
                    err.context("error while preprocessing"),
                )
                .await;
                return;
            }
        };
        record.preprocessing_duration = started.elapsed();
        info!(source = source.id(), "done preprocessing");

        let local_path = source.local_path();
        let base_dir = base_dir_of(&local_path);

        // Full digest of the preprocessed artifact, then extraction.
        let started = Instant::now();
        info!(path = %local_path.display(), "calculating sha256");
        match hashing::sha256_file(&local_path) {
            Ok(digest) => record.sha256 = digest,
            Err(err) => {
                self.fail(
                    &quick_hash,
                    &mut record,
                    base_dir.as_deref(),
                    err.context("error while hashing"),
                )
                .await;
                return;
            }
        }
        record.status = JobStatus::Preprocessed;
        self.update_job(&quick_hash, &record).await;

        let output = match self.processor.extract(&extractor_input).await {
            Ok(output) => output,
            Err(err) => {
                self.fail(
                    &quick_hash,
                    &mut record,
                    base_dir.as_deref(),
                    err.context("error while processing"),
                )
                .await;
                return;
            }
        };
        record.processing_duration = started.elapsed();
        record.status = JobStatus::Processed;
        self.update_job(&quick_hash, &record).await;
        info!(source = source.id(), "done processing");

        let extraction = Extraction {
            source_id: source.id().to_string(),
            source_sha256: record.sha256.clone(),
            base_dir: base_dir.clone().unwrap_or_default(),
            path: output,
        };

        // Everything from here to cleanup holds the repository lock: the
        // first-observation decision, the periodic cache save, the export
        // and the cleanup must be serialised per repository.
        let mut state = self.state.lock().await;

        info!(source = source.id(), "checking cache for existing samples");
        let samples = match state.cache.check(&extraction) {
            Ok(samples) => samples,
            Err(err) => {
                self.fail(
                    &quick_hash,
                    &mut record,
                    base_dir.as_deref(),
                    err.context("error while checking cache"),
                )
                .await;
                return;
            }
        };
        record.status = JobStatus::Cached;
        record.sample_count = samples.len() as i64;
        self.update_job(&quick_hash, &record).await;

        if state.sources_since_save >= CACHE_SAVE_EVERY {
            info!(repo = %self.repo_name, "saving cache checkpoint");
            if let Err(err) = state.cache.save(&self.repo_name, &self.options.cache_dir) {
                error!(repo = %self.repo_name, err = format!("{err:#}"), "could not save repository cache");
            }
            state.sources_since_save = 0;
        }

        let started = Instant::now();
        let exported = if self.options.export {
            self.export_samples(source.as_ref(), &record.sha256, &samples)
                .await
        } else {
            self.save_samples(source.repo_name(), source.id(), &record.sha256, &samples)
        };
        if let Err(err) = exported {
            self.fail(&quick_hash, &mut record, base_dir.as_deref(), err)
                .await;
            return;
        }
        record.export_duration = started.elapsed();
        record.export_count = samples.iter().filter(|sample| sample.upload).count() as i64;
        record.status = JobStatus::Exported;
        self.update_job(&quick_hash, &record).await;
        info!(
            source = source.id(),
            sha256 = %record.sha256,
            samples = record.sample_count,
            exported = record.export_count,
            "done exporting samples"
        );

        if let Some(dir) = base_dir.as_deref() {
            self.cleanup_local_storage(dir);
        }
        state.sources_since_save += 1;
    }

    /// Runs every configured exporter sequentially; the first error aborts
    /// the rest and fails the source.
    async fn export_samples(
        &self,
        source: &dyn Source,
        source_sha256: &str,
        samples: &[Sample],
    ) -> Result<()> {
        let remote_path = source.remote_path();
        let description = source.description();

        for exporter in self.exporters.iter() {
            info!(
                exporter = exporter.name(),
                source = source.id(),
                sha256 = source_sha256,
                "exporting samples"
            );
            exporter
                .export(
                    ExportSource {
                        repo_name: source.repo_name(),
                        repo_path: source.repo_path(),
                        id: source.id(),
                        sha256: source_sha256,
                        remote_path: &remote_path,
                        description: &description,
                    },
                    samples,
                )
                .await
                .with_context(|| format!("error while exporting with {}", exporter.name()))?;
        }

        Ok(())
    }

    /// Save-to-disk mode: copy first-observation samples under the export
    /// root and write a `samples.json` manifest covering every sample.
    fn save_samples(
        &self,
        repo_name: &str,
        source_id: &str,
        source_sha256: &str,
        samples: &[Sample],
    ) -> Result<()> {
        let dest_dir = self
            .options
            .export_path
            .join(format!("{repo_name}___{source_id}___{source_sha256}"));
        info!(dest = %dest_dir.display(), "saving samples locally");
        fs::create_dir_all(&dest_dir)
            .with_context(|| format!("creating {}", dest_dir.display()))?;

        let mut samples_out = Vec::with_capacity(samples.len());
        for sample in samples {
            if !sample.upload {
                samples_out.push(Sample {
                    sha256: sample.sha256.clone(),
                    paths: Vec::new(),
                    upload: false,
                });
                continue;
            }

            // More than one path can carry the digest; take the first that
            // still exists.
            let sample_path = sample
                .paths
                .iter()
                .find(|path| Path::new(path).exists())
                .with_context(|| format!("no existing path for sample {}", sample.sha256))?;
            let basename = Path::new(sample_path)
                .file_name()
                .with_context(|| format!("{sample_path} has no file name"))?;

            let sample_dir = dest_dir.join(&sample.sha256);
            fs::create_dir_all(&sample_dir)
                .with_context(|| format!("creating {}", sample_dir.display()))?;
            let dest_file = sample_dir.join(basename);
            fs::copy(sample_path, &dest_file)
                .with_context(|| format!("copying {sample_path} to {}", dest_file.display()))?;

            samples_out.push(Sample {
                sha256: sample.sha256.clone(),
                paths: vec![dest_file.to_string_lossy().into_owned()],
                upload: true,
            });
        }

        let manifest = dest_dir.join("samples.json");
        fs::write(&manifest, serde_json::to_vec(&samples_out)?)
            .with_context(|| format!("writing {}", manifest.display()))?;
        Ok(())
    }

    /// Transitions the source to `failed`, records the error, and purges
    /// its local storage. The worker then moves on to the next source.
    async fn fail(
        &self,
        quick_hash: &str,
        record: &mut JobRecord,
        base_dir: Option<&Path>,
        err: anyhow::Error,
    ) {
        error!(
            repo = %record.repo,
            source = %record.source_id,
            err = format!("{err:#}"),
            "skipping source"
        );
        record.status = JobStatus::Failed;
        record.error = format!("{err:#}");
        self.update_job(quick_hash, record).await;

        if let Some(dir) = base_dir {
            self.cleanup_local_storage(dir);
        }
    }

    /// Job store writes are best effort: failures are logged, never fatal.
    async fn update_job(&self, quick_hash: &str, record: &JobRecord) {
        if let Err(err) = self.job_store.update(quick_hash, record).await {
            error!(
                quick_hash,
                err = format!("{err:#}"),
                "could not update job store"
            );
        }
    }

    /// Recursively deletes an extraction's base directory. Refuses paths
    /// outside the engine's temp root, so a misbehaving importer cannot
    /// point the engine at unrelated data.
    fn cleanup_local_storage(&self, path: &Path) {
        if path.as_os_str().is_empty() {
            return;
        }
        if !path.starts_with(&self.options.temp_root) {
            warn!(
                path = %path.display(),
                temp_root = %self.options.temp_root.display(),
                "refusing to delete outside the temp root"
            );
            return;
        }

        info!(path = %path.display(), "deleting local storage");
        if let Err(err) = fs::remove_dir_all(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                error!(path = %path.display(), %err, "could not clean up local storage");
            }
        }
    }
}

/// Parent directory of the preprocessed artifact, i.e. the engine-owned
/// temp directory for the source. `None` before preprocessing set a local
/// path.
fn base_dir_of(local_path: &Path) -> Option<PathBuf> {
    if local_path.as_os_str().is_empty() {
        return None;
    }
    local_path.parent().map(Path::to_path_buf)
}
