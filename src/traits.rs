//! Extension traits for importers, processors, exporters, and job stores.
//!
//! The engine never talks to a concrete repository type, extractor, or
//! sink. Everything flows through the four contracts in this module:
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │             ImporterRegistry              │
//! │  ┌─────────┐ ┌─────────┐ ┌────────────┐  │
//! │  │ tar.gz  │ │  zip    │ │  Custom    │  │
//! │  └─────────┘ └─────────┘ └────────────┘  │
//! └──────────────┬────────────────────────────┘
//!                ▼ discover_repo() → [Source]
//!        Harvester::run() → per-source pipeline
//!                ▼
//!     Processor::extract() → ExporterRegistry
//! ```
//!
//! Implement [`Importer`] (and its [`Source`]) to plug in a new repository
//! type, [`Exporter`] to plug in a new sink, and [`JobStore`] to persist
//! job records somewhere else. All four are object-safe and registered as
//! boxed trait objects.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{JobRecord, Sample};

/// An artifact discovered in a repository, to be processed.
///
/// A source is produced by an [`Importer`] and is exclusively owned by one
/// pipeline worker from dispatch until cleanup. Identity decisions are
/// routed through [`quick_hash`](Source::quick_hash) only; the engine never
/// inspects source contents directly.
#[async_trait]
pub trait Source: Send + Sync {
    /// Non-unique, human-readable identifier (e.g. the archive filename).
    fn id(&self) -> &str;

    /// Name of the repository this source came from.
    fn repo_name(&self) -> &str;

    /// Path of the repository this source came from.
    fn repo_path(&self) -> &str;

    /// Origin location of the source (opaque to the engine).
    fn remote_path(&self) -> String;

    /// Path of the artifact on the local filesystem. Empty until
    /// [`preprocess`](Source::preprocess) has materialised it.
    fn local_path(&self) -> PathBuf;

    /// Optional free-form description, passed through to exporters.
    /// Importers without one return the empty string.
    fn description(&self) -> String {
        String::new()
    }

    /// Cheap, stable SHA-256-sized fingerprint used as the dedup key.
    ///
    /// Must be pure: repeated calls on an unchanged source return the same
    /// digest, and successful computation has no side effects.
    fn quick_hash(&self) -> Result<String>;

    /// Materialises the artifact locally (download, copy, unpack, mount)
    /// and returns the directory to hand to the file-level extractor.
    ///
    /// May be arbitrarily expensive; the engine calls it at most once per
    /// source. After it returns, [`local_path`](Source::local_path) points
    /// at the preprocessed artifact and its parent directory is owned by
    /// the engine until cleanup.
    async fn preprocess(&mut self) -> Result<PathBuf>;
}

/// A repository of artifacts (archive directory, image store, registry).
#[async_trait]
pub trait Importer: Send + Sync {
    /// Repository name. Used as the cache scope and job-record repo field.
    fn repo_name(&self) -> &str;

    /// Repository path (root directory, bucket, registry URL).
    fn repo_path(&self) -> &str;

    /// Returns the full current listing of candidate sources. May perform
    /// I/O. Called once per run per repository.
    async fn discover_repo(&self) -> Result<Vec<Box<dyn Source>>>;
}

/// The file-level extractor.
///
/// Turns a preprocessed artifact directory into a flat tree of files plus
/// a `hashes.json` manifest. Synchronous and expensive from the engine's
/// point of view.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Runs the extraction over `input` (the path returned by
    /// [`Source::preprocess`]) and returns the output directory containing
    /// the extracted files and `hashes.json`.
    async fn extract(&self, input: &Path) -> Result<PathBuf>;
}

/// Provenance of the source being exported, passed alongside its samples.
#[derive(Debug, Clone, Copy)]
pub struct ExportSource<'a> {
    pub repo_name: &'a str,
    pub repo_path: &'a str,
    pub id: &'a str,
    pub sha256: &'a str,
    pub remote_path: &'a str,
    pub description: &'a str,
}

/// A sink for extracted samples.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Exporter name, for configuration and logs.
    fn name(&self) -> &str;

    /// Persists the samples of one source. The exporter decides what to
    /// store and where; the engine treats the call as all-or-nothing for
    /// the source. Any error fails the source and skips the remaining
    /// exporters.
    async fn export(&self, source: ExportSource<'_>, samples: &[Sample]) -> Result<()>;
}

/// Durable map from source quick-hash to job record.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Returns `quick_hash → status` for every known job. Called once per
    /// repository discovery; an error here skips the repository.
    async fn fetch_all(&self) -> Result<HashMap<String, String>>;

    /// Upserts the record for `quick_hash`. Called at every state
    /// transition. Failures are logged by the engine and never abort
    /// processing; in-memory state stays authoritative for the run.
    async fn update(&self, quick_hash: &str, record: &JobRecord) -> Result<()>;
}

/// Registry of configured importers, iterated in registration order.
pub struct ImporterRegistry {
    importers: Vec<Box<dyn Importer>>,
}

impl ImporterRegistry {
    pub fn new() -> Self {
        Self {
            importers: Vec::new(),
        }
    }

    /// Creates a registry pre-loaded with every importer enabled in the
    /// config, in the order repositories are processed.
    pub fn from_config(config: &crate::config::Config) -> Result<Self> {
        use crate::importer_deb::DebRepo;
        use crate::importer_iso::IsoRepo;
        use crate::importer_targz::TarGzRepo;
        use crate::importer_wim::WimRepo;
        use crate::importer_zip::ZipRepo;

        let mut registry = Self::new();
        let temp_root = &config.engine.temp_root;

        if let Some(targz) = &config.importers.targz {
            registry.register(Box::new(TarGzRepo::new(targz, temp_root)?));
        }
        if let Some(zip) = &config.importers.zip {
            registry.register(Box::new(ZipRepo::new(zip, temp_root)?));
        }
        if let Some(deb) = &config.importers.deb {
            registry.register(Box::new(DebRepo::new(deb, temp_root)?));
        }
        if let Some(iso) = &config.importers.iso {
            registry.register(Box::new(IsoRepo::new(iso, temp_root)?));
        }
        if let Some(wim) = &config.importers.wim {
            registry.register(Box::new(WimRepo::new(wim, temp_root)?));
        }

        Ok(registry)
    }

    pub fn register(&mut self, importer: Box<dyn Importer>) {
        self.importers.push(importer);
    }

    pub fn importers(&self) -> &[Box<dyn Importer>] {
        &self.importers
    }

    pub fn into_inner(self) -> Vec<Box<dyn Importer>> {
        self.importers
    }

    pub fn is_empty(&self) -> bool {
        self.importers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.importers.len()
    }
}

impl Default for ImporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of configured exporters. Order matters: the engine runs them
/// sequentially per source, in registration order.
pub struct ExporterRegistry {
    exporters: Vec<Box<dyn Exporter>>,
}

impl ExporterRegistry {
    pub fn new() -> Self {
        Self {
            exporters: Vec::new(),
        }
    }

    pub fn register(&mut self, exporter: Box<dyn Exporter>) {
        self.exporters.push(exporter);
    }

    pub fn exporters(&self) -> &[Box<dyn Exporter>] {
        &self.exporters
    }

    pub fn into_inner(self) -> Vec<Box<dyn Exporter>> {
        self.exporters
    }

    pub fn is_empty(&self) -> bool {
        self.exporters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.exporters.len()
    }
}

impl Default for ExporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
