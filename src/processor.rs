//! File-level extractor implementations.
//!
//! Both processors satisfy the same contract: given the preprocessed
//! artifact path, populate an output directory next to it with extracted
//! files plus a `hashes.json` manifest, and return that directory.
//!
//! [`CommandProcessor`] wraps an external extraction tool that is
//! expected to understand disk images, partitions and whatever else the
//! repository holds. [`WalkProcessor`] is the
//! self-contained fallback for sources whose preprocessing already yields
//! a plain file tree: it hashes every regular file and writes the
//! manifest itself.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;
use walkdir::WalkDir;

use crate::hashing;
use crate::traits::Processor;

/// Directory created next to the input for the extraction output.
const OUTPUT_DIR_NAME: &str = "export";

#[derive(Serialize)]
struct ManifestEntry {
    sha256: String,
    paths: Vec<String>,
}

fn output_dir(input: &Path) -> Result<PathBuf> {
    let base = input
        .parent()
        .with_context(|| format!("extraction input {} has no parent", input.display()))?;
    Ok(base.join(OUTPUT_DIR_NAME))
}

/// Runs a configured external command to perform the extraction.
///
/// The command is a template; `{input}` and `{output}` placeholders are
/// substituted per invocation. The tool must leave extracted files and a
/// `hashes.json` manifest in the output directory.
pub struct CommandProcessor {
    command: Vec<String>,
}

impl CommandProcessor {
    pub fn new(command: Vec<String>) -> Result<CommandProcessor> {
        if command.is_empty() {
            bail!("processor command must not be empty");
        }
        Ok(CommandProcessor { command })
    }
}

#[async_trait]
impl Processor for CommandProcessor {
    async fn extract(&self, input: &Path) -> Result<PathBuf> {
        let out = output_dir(input)?;
        fs::create_dir_all(&out)
            .with_context(|| format!("creating extraction dir {}", out.display()))?;

        let rendered: Vec<String> = self
            .command
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input.to_string_lossy())
                    .replace("{output}", &out.to_string_lossy())
            })
            .collect();

        info!(command = ?rendered, "running extraction tool");
        let output = Command::new(&rendered[0])
            .args(&rendered[1..])
            .output()
            .with_context(|| format!("spawning extraction tool {}", rendered[0]))?;

        if !output.status.success() {
            bail!(
                "extraction tool {} failed ({}): {}",
                rendered[0],
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(out)
    }
}

/// Walks the preprocessed directory, hashing every regular file.
///
/// Files are copied into the output directory with their relative layout
/// preserved, identical contents are grouped under one manifest entry
/// with multiple paths.
pub struct WalkProcessor;

#[async_trait]
impl Processor for WalkProcessor {
    async fn extract(&self, input: &Path) -> Result<PathBuf> {
        let out = output_dir(input)?;
        fs::create_dir_all(&out)
            .with_context(|| format!("creating extraction dir {}", out.display()))?;

        // BTreeMap keeps the manifest deterministic across runs.
        let mut by_digest: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut file_count = 0usize;

        for entry in WalkDir::new(input) {
            let entry = entry.with_context(|| format!("walking {}", input.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let rel = entry
                .path()
                .strip_prefix(input)
                .with_context(|| format!("{} outside walk root", entry.path().display()))?;
            let digest = hashing::sha256_file(entry.path())?;

            let dest = out.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            fs::copy(entry.path(), &dest)
                .with_context(|| format!("copying {} into extraction", entry.path().display()))?;

            by_digest
                .entry(digest)
                .or_default()
                .push(rel.to_string_lossy().into_owned());
            file_count += 1;
        }

        let manifest: Vec<ManifestEntry> = by_digest
            .into_iter()
            .map(|(sha256, paths)| ManifestEntry { sha256, paths })
            .collect();
        let manifest_path = out.join("hashes.json");
        fs::write(&manifest_path, serde_json::to_vec(&manifest)?)
            .with_context(|| format!("writing manifest {}", manifest_path.display()))?;

        info!(
            input = %input.display(),
            files = file_count,
            digests = manifest.len(),
            "walk extraction complete"
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn walk_processor_hashes_and_groups_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("extracted");
        fs::create_dir_all(input.join("nested")).unwrap();
        fs::write(input.join("a.txt"), b"same bytes").unwrap();
        fs::write(input.join("nested/b.txt"), b"same bytes").unwrap();
        fs::write(input.join("c.txt"), b"different").unwrap();

        let out = WalkProcessor.extract(&input).await.unwrap();
        assert_eq!(out, dir.path().join("export"));

        let manifest: Vec<serde_json::Value> =
            serde_json::from_slice(&fs::read(out.join("hashes.json")).unwrap()).unwrap();
        assert_eq!(manifest.len(), 2);

        let dup = manifest
            .iter()
            .find(|entry| entry["paths"].as_array().unwrap().len() == 2)
            .expect("duplicate contents grouped into one entry");
        let paths: Vec<&str> = dup["paths"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p.as_str().unwrap())
            .collect();
        assert!(paths.contains(&"a.txt"));

        // Files are copied into the output tree at their relative paths.
        assert!(out.join("nested/b.txt").exists());
        assert!(out.join("c.txt").exists());
    }

    #[tokio::test]
    async fn command_processor_substitutes_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("extracted");
        fs::create_dir_all(&input).unwrap();

        let processor = CommandProcessor::new(vec![
            "sh".into(),
            "-c".into(),
            "echo '[]' > {output}/hashes.json".into(),
        ])
        .unwrap();

        let out = processor.extract(&input).await.unwrap();
        assert!(out.join("hashes.json").exists());
    }

    #[tokio::test]
    async fn command_processor_surfaces_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("extracted");
        fs::create_dir_all(&input).unwrap();

        let processor = CommandProcessor::new(vec![
            "sh".into(),
            "-c".into(),
            "echo boom >&2; exit 3".into(),
        ])
        .unwrap();

        let err = processor.extract(&input).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandProcessor::new(Vec::new()).is_err());
    }
}
