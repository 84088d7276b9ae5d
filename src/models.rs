//! Core data models that flow through the harvesting pipeline.
//!
//! The data lifecycle is:
//!
//! ```text
//! Importer → Source → preprocess() → Extraction → cache check → Sample
//!                                         ↓
//!                                    JobRecord (one per source quick-hash)
//! ```
//!
//! - An **[`Extraction`]** is the on-disk result of preprocessing a source
//!   and running the file-level extractor over it.
//! - A **[`Sample`]** is one extracted file: a content digest, every path
//!   it was found under, and whether this is the first time the digest was
//!   observed in the repository (`upload`).
//! - A **[`JobRecord`]** tracks one source through the state machine and is
//!   persisted in the job store, keyed by the source's quick-hash.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A single extracted file occurrence.
///
/// Produced by the cache check from the extractor's `hashes.json` manifest.
/// `paths` holds every location the file was found at within the extraction
/// (the same content can appear under several names); `upload` is set when
/// the digest was absent from the repository cache, i.e. this occurrence is
/// the first observation and the file's bytes should be exported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    /// SHA-256 of the file contents, lowercase hex.
    pub sha256: String,
    /// Absolute paths of this file within the extraction directory.
    #[serde(default)]
    pub paths: Vec<String>,
    /// First observation of this digest in the repository cache.
    #[serde(default)]
    pub upload: bool,
}

/// Result of preprocessing a source and extracting its files.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    /// Source identifier (non-unique across repositories).
    pub source_id: String,
    /// SHA-256 of the preprocessed artifact bytes.
    pub source_sha256: String,
    /// Root directory on local disk owned by this extraction. Purged when
    /// the source reaches a terminal state.
    pub base_dir: PathBuf,
    /// Directory holding the extracted files and the `hashes.json` manifest.
    pub path: PathBuf,
}

/// Lifecycle state of a processing job.
///
/// A job moves strictly forward through `Discovered` → `Preprocessed` →
/// `Processed` → `Cached` → `Exported`, or jumps to `Failed` from any
/// state. `Reprocess` is a sentinel written by an operator to force a
/// source through the pipeline again on the next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Discovered,
    Preprocessed,
    Processed,
    Cached,
    Exported,
    Failed,
    Reprocess,
}

impl JobStatus {
    /// Canonical lowercase name, as stored in the job store.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Discovered => "discovered",
            JobStatus::Preprocessed => "preprocessed",
            JobStatus::Processed => "processed",
            JobStatus::Cached => "cached",
            JobStatus::Exported => "exported",
            JobStatus::Failed => "failed",
            JobStatus::Reprocess => "reprocess",
        }
    }

    /// Parses a stored status, case-insensitively. Unknown values map to
    /// `None` so callers can decide how to treat records written by newer
    /// or older versions.
    pub fn parse(s: &str) -> Option<JobStatus> {
        match s.to_ascii_lowercase().as_str() {
            "discovered" => Some(JobStatus::Discovered),
            "preprocessed" => Some(JobStatus::Preprocessed),
            "processed" => Some(JobStatus::Processed),
            "cached" => Some(JobStatus::Cached),
            "exported" => Some(JobStatus::Exported),
            "failed" => Some(JobStatus::Failed),
            "reprocess" => Some(JobStatus::Reprocess),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one source's trip through the pipeline, persisted in the job
/// store keyed by the source's quick-hash.
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// Human-readable source identifier.
    pub source_id: String,
    /// Repository name the source came from.
    pub repo: String,
    /// Repository path.
    pub repo_path: String,
    /// Origin location of the source (opaque string).
    pub remote_path: String,
    /// Full SHA-256 of the preprocessed artifact, once known.
    pub sha256: String,
    pub status: JobStatus,
    /// Unix timestamp of when the source was dispatched.
    pub imported_at: i64,
    /// Error message, once failed.
    pub error: String,
    pub preprocessing_duration: Duration,
    pub processing_duration: Duration,
    pub export_duration: Duration,
    /// Number of samples enumerated by the cache check.
    pub sample_count: i64,
    /// Number of samples exported with their bytes (`upload=true`).
    pub export_count: i64,
}

impl JobRecord {
    /// A fresh record in the `Discovered` state.
    pub fn discovered(
        source_id: &str,
        repo: &str,
        repo_path: &str,
        remote_path: &str,
        imported_at: i64,
    ) -> Self {
        JobRecord {
            source_id: source_id.to_string(),
            repo: repo.to_string(),
            repo_path: repo_path.to_string(),
            remote_path: remote_path.to_string(),
            sha256: String::new(),
            status: JobStatus::Discovered,
            imported_at,
            error: String::new(),
            preprocessing_duration: Duration::ZERO,
            processing_duration: Duration::ZERO,
            export_duration: Duration::ZERO,
            sample_count: 0,
            export_count: 0,
        }
    }
}
