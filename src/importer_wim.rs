//! WIM image repository importer.
//!
//! Every `*.wim` file under the configured root is one source (Windows
//! installation media carry their filesystem images as WIM archives).
//! Preprocessing copies the image into an engine-owned temp directory and
//! applies it with a configurable host extraction tool (`wimlib-imagex`
//! by default), using the same `{input}`/`{output}` command template the
//! ISO importer uses.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::GlobSet;
use tracing::warn;
use walkdir::WalkDir;

use crate::config::WimImporterConfig;
use crate::hashing;
use crate::importer_common::{
    build_globset, copy_to_local, local_temp_dir, run_extraction_tool,
};
use crate::traits::{Importer, Source};

pub const REPO_NAME: &str = "wim";

/// A repository of WIM images rooted at a local directory.
pub struct WimRepo {
    root: PathBuf,
    temp_root: PathBuf,
    exclude: GlobSet,
    extract_command: Vec<String>,
}

impl WimRepo {
    pub fn new(config: &WimImporterConfig, temp_root: &Path) -> Result<WimRepo> {
        if config.extract_command.is_empty() {
            bail!("wim importer extract_command must not be empty");
        }
        Ok(WimRepo {
            root: config.root.clone(),
            temp_root: temp_root.to_path_buf(),
            exclude: build_globset(&config.exclude_globs)?,
            extract_command: config.extract_command.clone(),
        })
    }
}

#[async_trait]
impl Importer for WimRepo {
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
            if !name.ends_with(".wim") {
                continue;
            }
            if self.exclude.is_match(entry.path()) {
                continue;
            }

            sources.push(Box::new(WimImage {
                filename: name.into_owned(),
                remote_path: entry.path().to_path_buf(),
                local_path: PathBuf::new(),
                repo_path: self.repo_path().to_string(),
                temp_root: self.temp_root.clone(),
                extract_command: self.extract_command.clone(),
            }));
        }

        Ok(sources)
    }
}

/// One WIM image in the repository.
pub struct WimImage {
    filename: String,
    remote_path: PathBuf,
    local_path: PathBuf,
    repo_path: String,
    temp_root: PathBuf,
    extract_command: Vec<String>,
}

#[async_trait]
impl Source for WimImage {
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
        run_extraction_tool(&self.extract_command, &self.local_path, &extraction_dir)
            .with_context(|| format!("extracting {}", self.local_path.display()))?;
        Ok(extraction_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config(root: &Path, extract_command: &[&str]) -> WimImporterConfig {
        WimImporterConfig {
            root: root.to_path_buf(),
            exclude_globs: Vec::new(),
            extract_command: extract_command.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn discovers_only_wim_files() {
        let repo = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        fs::write(repo.path().join("install.wim"), b"image").unwrap();
        fs::write(repo.path().join("boot.iso"), b"other").unwrap();

        let importer = WimRepo::new(&config(repo.path(), &["wimlib-imagex"]), temp.path()).unwrap();
        let sources = importer.discover_repo().await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].id(), "install.wim");
        assert_eq!(sources[0].repo_name(), "wim");
    }

    #[tokio::test]
    async fn preprocess_copies_then_runs_tool() {
        let repo = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        fs::write(repo.path().join("install.wim"), b"wim bytes").unwrap();

        let importer = WimRepo::new(
            &config(
                repo.path(),
                &["sh", "-c", "cp {input} {output}/applied.bin"],
            ),
            temp.path(),
        )
        .unwrap();
        let mut sources = importer.discover_repo().await.unwrap();
        let extracted = sources[0].preprocess().await.unwrap();

        assert!(extracted.starts_with(temp.path()));
        assert_eq!(fs::read(extracted.join("applied.bin")).unwrap(), b"wim bytes");
    }

    #[test]
    fn empty_extract_command_is_rejected() {
        let repo = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        assert!(WimRepo::new(&config(repo.path(), &[]), temp.path()).is_err());
    }
}
