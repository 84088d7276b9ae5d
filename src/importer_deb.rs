//! `.deb` package repository importer.
//!
//! Same shape as the tar.gz importer: every `*.deb` file under the
//! configured root is one source. A Debian package is an `ar` archive;
//! preprocessing copies it into an engine-owned temp directory, locates
//! the `data.tar[.gz|.xz|.zst]` member, and unpacks it through the shared
//! tar path. Only the data member contributes files to the hash set;
//! control metadata is not extracted.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use globset::GlobSet;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::DebImporterConfig;
use crate::hashing;
use crate::importer_common::{build_globset, copy_to_local, extract_tar, local_temp_dir};
use crate::traits::{Importer, Source};

pub const REPO_NAME: &str = "deb";

/// A repository of Debian packages rooted at a local directory.
pub struct DebRepo {
    root: PathBuf,
    temp_root: PathBuf,
    exclude: GlobSet,
}

impl DebRepo {
    pub fn new(config: &DebImporterConfig, temp_root: &Path) -> Result<DebRepo> {
        Ok(DebRepo {
            root: config.root.clone(),
            temp_root: temp_root.to_path_buf(),
            exclude: build_globset(&config.exclude_globs)?,
        })
    }
}

#[async_trait]
impl Importer for DebRepo {
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
            if !name.ends_with(".deb") {
                continue;
            }
            if self.exclude.is_match(entry.path()) {
                continue;
            }

            sources.push(Box::new(DebPackage {
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

/// One `.deb` package in the repository.
pub struct DebPackage {
    filename: String,
    remote_path: PathBuf,
    local_path: PathBuf,
    repo_path: String,
    temp_root: PathBuf,
}

#[async_trait]
impl Source for DebPackage {
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
        extract_deb(&self.local_path, &extraction_dir)?;
        Ok(extraction_dir)
    }
}

/// Unpacks the `data.tar` member of the package at `archive` into
/// `output`.
pub fn extract_deb(archive: &Path, output: &Path) -> Result<()> {
    let file =
        File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    let mut package = ar::Archive::new(file);

    info!(archive = %archive.display(), to = %output.display(), "extracting");
    while let Some(entry) = package.next_entry() {
        let mut entry =
            entry.with_context(|| format!("reading member in {}", archive.display()))?;
        let name = String::from_utf8_lossy(entry.header().identifier())
            .trim_end_matches('/')
            .to_string();
        if !name.starts_with("data.tar") {
            continue;
        }

        return match name.as_str() {
            "data.tar" => extract_tar(entry, output),
            "data.tar.gz" => extract_tar(GzDecoder::new(entry), output),
            "data.tar.xz" => {
                let mut decompressed = Vec::new();
                lzma_rs::xz_decompress(&mut BufReader::new(entry), &mut decompressed)
                    .map_err(|err| anyhow!("decompressing {name}: {err:?}"))?;
                extract_tar(decompressed.as_slice(), output)
            }
            "data.tar.zst" => {
                let decoder = zstd::stream::read::Decoder::new(&mut entry)
                    .with_context(|| format!("decompressing {name}"))?;
                extract_tar(decoder, output)
            }
            other => bail!("unsupported data member compression: {other}"),
        }
        .with_context(|| format!("extracting {} from {}", name, archive.display()));
    }

    bail!("no data.tar member in {}", archive.display())
}
