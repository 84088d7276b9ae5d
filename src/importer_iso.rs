//! ISO image repository importer.
//!
//! Every `*.iso` file under the configured root is one source.
//! Preprocessing copies the image into an engine-owned temp directory and
//! unpacks it with a configurable host extraction tool (`bsdtar` by
//! default, which reads ISO 9660 and UDF images). The tool command is a
//! template with `{input}`/`{output}` placeholders, the same contract the
//! command processor uses.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::GlobSet;
use tracing::warn;
use walkdir::WalkDir;

use crate::config::IsoImporterConfig;
use crate::hashing;
use crate::importer_common::{
    build_globset, copy_to_local, local_temp_dir, run_extraction_tool,
};
use crate::traits::{Importer, Source};

pub const REPO_NAME: &str = "iso9660";

/// A repository of ISO images rooted at a local directory.
pub struct IsoRepo {
    root: PathBuf,
    temp_root: PathBuf,
    exclude: GlobSet,
    extract_command: Vec<String>,
}

impl IsoRepo {
    pub fn new(config: &IsoImporterConfig, temp_root: &Path) -> Result<IsoRepo> {
        if config.extract_command.is_empty() {
            bail!("iso importer extract_command must not be empty");
        }
        Ok(IsoRepo {
            root: config.root.clone(),
            temp_root: temp_root.to_path_buf(),
            exclude: build_globset(&config.exclude_globs)?,
            extract_command: config.extract_command.clone(),
        })
    }
}

#[async_trait]
impl Importer for IsoRepo {
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
            if !name.ends_with(".iso") {
                continue;
            }
            if self.exclude.is_match(entry.path()) {
                continue;
            }

            sources.push(Box::new(IsoImage {
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

/// One ISO image in the repository.
pub struct IsoImage {
    filename: String,
    remote_path: PathBuf,
    local_path: PathBuf,
    repo_path: String,
    temp_root: PathBuf,
    extract_command: Vec<String>,
}

#[async_trait]
impl Source for IsoImage {
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

    fn config(root: &Path, extract_command: &[&str]) -> IsoImporterConfig {
        IsoImporterConfig {
            root: root.to_path_buf(),
            exclude_globs: Vec::new(),
            extract_command: extract_command.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn discovers_only_iso_files() {
        let repo = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        fs::write(repo.path().join("install.iso"), b"image").unwrap();
        fs::write(repo.path().join("install.iso.sha256"), b"digest").unwrap();
        fs::write(repo.path().join("notes.txt"), b"no").unwrap();

        let importer = IsoRepo::new(&config(repo.path(), &["bsdtar"]), temp.path()).unwrap();
        let sources = importer.discover_repo().await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].id(), "install.iso");
        assert_eq!(sources[0].repo_name(), "iso9660");
    }

    #[tokio::test]
    async fn preprocess_copies_then_runs_tool() {
        let repo = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        fs::write(repo.path().join("install.iso"), b"image bytes").unwrap();

        // Stand-in for bsdtar: "unpack" by copying the image into the
        // output directory.
        let importer = IsoRepo::new(
            &config(
                repo.path(),
                &["sh", "-c", "cp {input} {output}/root.bin"],
            ),
            temp.path(),
        )
        .unwrap();
        let mut sources = importer.discover_repo().await.unwrap();
        let extracted = sources[0].preprocess().await.unwrap();

        assert!(extracted.starts_with(temp.path()));
        assert_eq!(fs::read(extracted.join("root.bin")).unwrap(), b"image bytes");

        // The local copy sits next to the extraction dir.
        let local = sources[0].local_path();
        assert_eq!(local.file_name().unwrap(), "install.iso");
        assert_eq!(local.parent(), extracted.parent());
    }

    #[test]
    fn empty_extract_command_is_rejected() {
        let repo = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        assert!(IsoRepo::new(&config(repo.path(), &[]), temp.path()).is_err());
    }
}
