//! Per-repository persistent cache of observed file digests.
//!
//! The cache maps a file content digest to every occurrence of that digest
//! across the repository's sources. Its single job is to decide which
//! files in a fresh extraction are *new*: the first observation of a
//! digest marks the returned sample `upload=true`, every later observation
//! only accumulates provenance.
//!
//! On disk the cache is one binary file per repository under the engine's
//! cache directory (these can grow past 10 GiB for large repositories,
//! which is why saving is periodic rather than per-source). A cache file
//! that fails to read or decode is treated as recoverable corruption: it
//! is deleted and an empty cache is returned.
//!
//! The cache is per-process. Two engines running concurrently against the
//! same repository may both emit `upload=true` for the same digest; there
//! is no cross-process coordination.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::{Extraction, Sample};

/// Name of the manifest the file-level extractor leaves in its output
/// directory.
const MANIFEST_NAME: &str = "hashes.json";

/// One observation of a file digest: which source it came from and where
/// the file sat inside that source's extraction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Occurrence {
    pub source_id: String,
    /// Full SHA-256 of the source the file was extracted from.
    pub source_hash: String,
    pub path: String,
}

/// All known occurrences of one file digest.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Entries {
    /// Unix timestamp of the most recent occurrence.
    pub last_updated: i64,
    pub occurrences: Vec<Occurrence>,
}

/// In-memory form of one repository's cache.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RepoCache {
    entries: HashMap<String, Entries>,
}

fn cache_file(cache_dir: &Path, repo_name: &str) -> PathBuf {
    cache_dir.join(format!("harvester-cache-{repo_name}"))
}

impl RepoCache {
    /// Loads the cache for `repo_name` from `cache_dir`.
    ///
    /// A missing file yields an empty cache. A file that cannot be read or
    /// decoded is deleted and an empty cache is returned; the error is
    /// only propagated if the corrupt file cannot be removed.
    pub fn load(repo_name: &str, cache_dir: &Path) -> Result<RepoCache> {
        let path = cache_file(cache_dir, repo_name);
        if !path.exists() {
            info!(repo = repo_name, path = %path.display(), "no cache file, starting empty");
            return Ok(RepoCache::default());
        }

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) => {
                warn!(repo = repo_name, %err, "unreadable cache file, discarding");
                fs::remove_file(&path)
                    .with_context(|| format!("removing corrupt cache file {}", path.display()))?;
                return Ok(RepoCache::default());
            }
        };

        match bincode::deserialize(&data) {
            Ok(cache) => {
                info!(repo = repo_name, path = %path.display(), "loaded repository cache");
                Ok(cache)
            }
            Err(err) => {
                warn!(repo = repo_name, %err, "corrupt cache file, discarding");
                fs::remove_file(&path)
                    .with_context(|| format!("removing corrupt cache file {}", path.display()))?;
                Ok(RepoCache::default())
            }
        }
    }

    /// Persists the cache atomically: encode, write to a sibling temp
    /// file, rename over the final path.
    pub fn save(&self, repo_name: &str, cache_dir: &Path) -> Result<()> {
        fs::create_dir_all(cache_dir)
            .with_context(|| format!("creating cache dir {}", cache_dir.display()))?;
        let path = cache_file(cache_dir, repo_name);
        let tmp = path.with_extension("tmp");

        let data = bincode::serialize(self)
            .with_context(|| format!("encoding {repo_name} repository cache"))?;
        fs::write(&tmp, data)
            .with_context(|| format!("writing cache file {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("renaming cache file into {}", path.display()))?;

        info!(repo = repo_name, path = %path.display(), "saved repository cache");
        Ok(())
    }

    /// Diffs an extraction against the cache.
    ///
    /// Reads the extraction's `hashes.json` manifest and returns one
    /// sample per listed digest, with its paths resolved against the
    /// extraction directory. A digest already present in the cache gains a
    /// new occurrence and comes back `upload=false`; an absent digest is
    /// inserted and comes back `upload=true`.
    ///
    /// Callers processing the same repository concurrently must serialise
    /// calls to this method, otherwise two workers can both observe a
    /// digest as new.
    pub fn check(&mut self, extraction: &Extraction) -> Result<Vec<Sample>> {
        let manifest = read_manifest(extraction)?;
        let now = chrono::Utc::now().timestamp();

        let mut samples = Vec::with_capacity(manifest.len());
        for entry in manifest {
            let occurrence = Occurrence {
                source_id: extraction.source_id.clone(),
                source_hash: extraction.source_sha256.clone(),
                path: entry.paths.first().cloned().unwrap_or_default(),
            };

            let mut sample = Sample {
                sha256: entry.sha256.clone(),
                paths: entry.paths,
                upload: false,
            };

            match self.entries.entry(entry.sha256) {
                std::collections::hash_map::Entry::Occupied(mut known) => {
                    let known = known.get_mut();
                    known.occurrences.push(occurrence);
                    known.last_updated = now;
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(Entries {
                        last_updated: now,
                        occurrences: vec![occurrence],
                    });
                    sample.upload = true;
                }
            }

            samples.push(sample);
        }

        Ok(samples)
    }

    pub fn contains(&self, sha256: &str) -> bool {
        self.entries.contains_key(sha256)
    }

    pub fn get(&self, sha256: &str) -> Option<&Entries> {
        self.entries.get(sha256)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reads `hashes.json` from the extraction directory and resolves every
/// relative path against it.
fn read_manifest(extraction: &Extraction) -> Result<Vec<Sample>> {
    let manifest_path = extraction.path.join(MANIFEST_NAME);
    let data = fs::read(&manifest_path)
        .with_context(|| format!("reading manifest {}", manifest_path.display()))?;
    let mut samples: Vec<Sample> = serde_json::from_slice(&data)
        .with_context(|| format!("parsing manifest {}", manifest_path.display()))?;

    for sample in &mut samples {
        for path in &mut sample.paths {
            *path = extraction.path.join(&path).to_string_lossy().into_owned();
        }
    }

    Ok(samples)
}
