//! `.tar.gz` archive repository importer.
//!
//! Treats a directory tree as a repository of gzipped tarballs: every
//! `*.tar.gz` file found under the configured root is one source.
//! Preprocessing copies the archive into an engine-owned temp directory
//! and unpacks it; the extraction then runs over the unpacked tree.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use globset::GlobSet;
use tracing::warn;
use walkdir::WalkDir;

use crate::config::TarGzImporterConfig;
use crate::hashing;
use crate::importer_common::{build_globset, copy_to_local, extract_tar_gz, local_temp_dir};
use crate::traits::{Importer, Source};

pub const REPO_NAME: &str = "targz";

/// A repository of `.tar.gz` archives rooted at a local directory.
pub struct TarGzRepo {
    root: PathBuf,
    temp_root: PathBuf,
    exclude: GlobSet,
}

impl TarGzRepo {
    pub fn new(config: &TarGzImporterConfig, temp_root: &Path) -> Result<TarGzRepo> {
        Ok(TarGzRepo {
            root: config.root.clone(),
            temp_root: temp_root.to_path_buf(),
            exclude: build_globset(&config.exclude_globs)?,
        })
    }
}

#[async_trait]
impl Importer for TarGzRepo {
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
            let name = entry.file_name().to_string_lossy();
            if !name.ends_with(".tar.gz") {
                continue;
            }
            if self.exclude.is_match(entry.path()) {
                continue;
            }

            sources.push(Box::new(TarGzFile {
                filename: name.into_owned(),
                remote_path: entry.path().to_path_buf(),
                local_path: PathBuf::new(),
                repo_path: self.repo_path().to_string(),
                temp_root: self.temp_root.clone(),
            }));
        }

        Ok(sources)
    }
}

/// One `.tar.gz` archive in the repository.
pub struct TarGzFile {
    filename: String,
    remote_path: PathBuf,
    local_path: PathBuf,
    repo_path: String,
    temp_root: PathBuf,
}

#[async_trait]
impl Source for TarGzFile {
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
        extract_tar_gz(&self.local_path, &extraction_dir)?;
        Ok(extraction_dir)
    }
}
