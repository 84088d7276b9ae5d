//! Helpers shared by the archive and image importers: engine-owned temp
//! directories, local copies, tar unpacking, host extraction tools, and
//! the archive-entry traversal guard.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{info, warn};
use uuid::Uuid;

/// Creates a fresh temp directory for one source under the engine's temp
/// root. The directory (and everything the source puts in it) is purged
/// by the engine when the source reaches a terminal state.
pub fn local_temp_dir(temp_root: &Path, source_id: &str) -> Result<PathBuf> {
    let dir = temp_root.join(format!(
        "harvester-{}-{}",
        source_id,
        Uuid::new_v4().simple()
    ));
    fs::create_dir_all(&dir)
        .with_context(|| format!("creating temp dir {}", dir.display()))?;
    Ok(dir)
}

/// Copies a repository file into `temp_dir`, returning the local path.
pub fn copy_to_local(remote_path: &Path, temp_dir: &Path) -> Result<PathBuf> {
    let file_name = remote_path
        .file_name()
        .with_context(|| format!("{} has no file name", remote_path.display()))?;
    let dest = temp_dir.join(file_name);

    info!(from = %remote_path.display(), to = %dest.display(), "copying to local storage");
    fs::copy(remote_path, &dest)
        .with_context(|| format!("copying {} to {}", remote_path.display(), dest.display()))?;

    Ok(dest)
}

/// Compiles the optional exclude patterns importers accept in their
/// config. An empty list yields a set that matches nothing.
pub fn build_globset(globs: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for glob in globs {
        builder.add(Glob::new(glob).with_context(|| format!("invalid glob {glob:?}"))?);
    }
    Ok(builder.build()?)
}

/// True when an archive entry path would escape the extraction directory.
/// Such entries are skipped, not extracted.
pub fn escapes_extraction_dir(entry_path: &Path) -> bool {
    entry_path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
}

/// Unpacks a tar stream into `output`, creating it if needed. Entries
/// whose paths would escape the output directory are skipped with a
/// warning; only directories and regular files are materialised.
pub fn extract_tar<R: Read>(reader: R, output: &Path) -> Result<()> {
    fs::create_dir_all(output)
        .with_context(|| format!("creating extraction dir {}", output.display()))?;

    let mut tar = tar::Archive::new(reader);
    for entry in tar.entries().context("reading tar stream")? {
        let mut entry = entry.context("reading tar entry")?;
        let entry_path = entry.path()?.into_owned();
        if escapes_extraction_dir(&entry_path) {
            warn!(entry = %entry_path.display(), "not extracting, potential path traversal");
            continue;
        }

        let dest = output.join(&entry_path);
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            fs::create_dir_all(&dest)
                .with_context(|| format!("creating {}", dest.display()))?;
        } else if entry_type.is_file() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            entry
                .unpack(&dest)
                .with_context(|| format!("extracting {}", dest.display()))?;
        }
    }

    Ok(())
}

/// Unpacks a gzipped tarball at `archive` into `output`.
pub fn extract_tar_gz(archive: &Path, output: &Path) -> Result<()> {
    let file =
        File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    info!(archive = %archive.display(), to = %output.display(), "extracting");
    extract_tar(GzDecoder::new(file), output)
        .with_context(|| format!("extracting {}", archive.display()))
}

/// Runs a host extraction tool over an image the engine cannot unpack
/// natively. `{input}` and `{output}` placeholders in the command template
/// are substituted per invocation; the tool must populate `output`.
pub fn run_extraction_tool(command: &[String], input: &Path, output: &Path) -> Result<()> {
    if command.is_empty() {
        bail!("extraction command must not be empty");
    }
    fs::create_dir_all(output)
        .with_context(|| format!("creating extraction dir {}", output.display()))?;

    let rendered: Vec<String> = command
        .iter()
        .map(|arg| {
            arg.replace("{input}", &input.to_string_lossy())
                .replace("{output}", &output.to_string_lossy())
        })
        .collect();

    info!(command = ?rendered, "running extraction tool");
    let result = Command::new(&rendered[0])
        .args(&rendered[1..])
        .output()
        .with_context(|| format!("spawning extraction tool {}", rendered[0]))?;

    if !result.status.success() {
        bail!(
            "extraction tool {} failed ({}): {}",
            rendered[0],
            result.status,
            String::from_utf8_lossy(&result.stderr).trim()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_guard_flags_escaping_paths() {
        assert!(escapes_extraction_dir(Path::new("../outside")));
        assert!(escapes_extraction_dir(Path::new("ok/../../outside")));
        assert!(escapes_extraction_dir(Path::new("/etc/passwd")));
        assert!(!escapes_extraction_dir(Path::new("fine/inner/file.txt")));
        assert!(!escapes_extraction_dir(Path::new("dots..in..name")));
    }

    #[test]
    fn temp_dirs_are_unique_per_call() {
        let root = tempfile::tempdir().unwrap();
        let a = local_temp_dir(root.path(), "src").unwrap();
        let b = local_temp_dir(root.path(), "src").unwrap();
        assert_ne!(a, b);
        assert!(a.is_dir() && b.is_dir());
    }

    #[test]
    fn extraction_tool_substitutes_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("image.bin");
        fs::write(&input, b"image").unwrap();
        let output = dir.path().join("extracted");

        run_extraction_tool(
            &[
                "sh".to_string(),
                "-c".to_string(),
                "cp {input} {output}/copy.bin".to_string(),
            ],
            &input,
            &output,
        )
        .unwrap();

        assert_eq!(fs::read(output.join("copy.bin")).unwrap(), b"image");
    }

    #[test]
    fn extraction_tool_surfaces_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_extraction_tool(
            &["sh".to_string(), "-c".to_string(), "echo broken >&2; exit 2".to_string()],
            &dir.path().join("in"),
            &dir.path().join("out"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn empty_extraction_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run_extraction_tool(&[], &dir.path().join("in"), &dir.path().join("out")).is_err());
    }
}
