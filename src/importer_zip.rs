//! `.zip` archive repository importer.
//!
//! Same shape as the tar.gz importer: every file under the configured
//! root whose extension is on the configured list (default `zip`) is one
//! source. Preprocessing copies the archive into an engine-owned temp
//! directory and unpacks it there.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use globset::GlobSet;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::ZipImporterConfig;
use crate::hashing;
use crate::importer_common::{build_globset, copy_to_local, local_temp_dir};
use crate::traits::{Importer, Source};

pub const REPO_NAME: &str = "zip";

/// A repository of zip archives rooted at a local directory.
pub struct ZipRepo {
    root: PathBuf,
    temp_root: PathBuf,
    extensions: Vec<String>,
    exclude: GlobSet,
}

impl ZipRepo {
    pub fn new(config: &ZipImporterConfig, temp_root: &Path) -> Result<ZipRepo> {
        Ok(ZipRepo {
            root: config.root.clone(),
            temp_root: temp_root.to_path_buf(),
            extensions: config.extensions.clone(),
            exclude: build_globset(&config.exclude_globs)?,
        })
    }
}

#[async_trait]
impl Importer for ZipRepo {
    fn repo_name(&self) -> &str {
        REPO_NAME
    }

    fn repo_path(&self) -> &str {
        self.root.to_str().unwrap_or_default()
    }

    async fn discover_repo(&self) -> Result<Vec<Box<dyn Source>>> {
        let mut sources: Vec<Box<dyn Source>> = Vec::new();

        for entry in WalkDir::new(&self.root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(%err, "skipping unreadable repository entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let matches_ext = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(|ext| self.extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
                .unwrap_or(false);
            if !matches_ext || self.exclude.is_match(entry.path()) {
                continue;
            }

            sources.push(Box::new(ZipFile {
                filename: entry.file_name().to_string_lossy().into_owned(),
                remote_path: entry.path().to_path_buf(),
                local_path: PathBuf::new(),
                repo_path: self.repo_path().to_string(),
                temp_root: self.temp_root.clone(),
            }));
        }

        Ok(sources)
    }
}

/// One zip archive in the repository.
pub struct ZipFile {
    filename: String,
    remote_path: PathBuf,
    local_path: PathBuf,
    repo_path: String,
    temp_root: PathBuf,
}

#[async_trait]
impl Source for ZipFile {
    fn id(&self) -> &str {
        &self.filename
    }

    fn repo_name(&self) -> &str {
        REPO_NAME
    }

    fn repo_path(&self) -> &str {
        &self.repo_path
    }

    fn remote_path(&self) -> String {
        self.remote_path.to_string_lossy().into_owned()
    }

    fn local_path(&self) -> PathBuf {
        self.local_path.clone()
    }

    fn quick_hash(&self) -> Result<String> {
        hashing::quick_sha256_file(&self.remote_path)
    }

    async fn preprocess(&mut self) -> Result<PathBuf> {
        let temp_dir = local_temp_dir(&self.temp_root, &self.filename)?;
        self.local_path = copy_to_local(&self.remote_path, &temp_dir)
            .with_context(|| format!("copying {} to local storage", self.remote_path.display()))?;

        let extraction_dir = temp_dir.join("extracted");
        extract_zip(&self.local_path, &extraction_dir)?;
        Ok(extraction_dir)
    }
}

/// Unpacks `archive` into `output`. Entries whose names would escape the
/// output directory are skipped with a warning.
pub fn extract_zip(archive: &Path, output: &Path) -> Result<()> {
    fs::create_dir_all(output)
        .with_context(|| format!("creating extraction dir {}", output.display()))?;

    let file =
        File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file)
        .with_context(|| format!("reading {}", archive.display()))?;

    info!(archive = %archive.display(), to = %output.display(), "extracting");
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .with_context(|| format!("reading entry {index} in {}", archive.display()))?;

        let Some(rel) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!(entry = entry.name(), "not extracting, potential path traversal");
            continue;
        };

        let dest = output.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&dest)
                .with_context(|| format!("creating {}", dest.display()))?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let mut out = File::create(&dest)
                .with_context(|| format!("creating {}", dest.display()))?;
            std::io::copy(&mut entry, &mut out)
                .with_context(|| format!("extracting {}", dest.display()))?;
        }
    }

    Ok(())
}
