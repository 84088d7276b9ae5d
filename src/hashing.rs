//! SHA-256 helpers: full-file digests and the cheap "quick hash" used as
//! the engine's dedup key.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Size of the leading/trailing chunk sampled by [`quick_sha256_file`].
const QUICK_HASH_CHUNK: u64 = 10 * 1024 * 1024;

/// Streaming SHA-256 of a file's full contents, as lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("opening {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .with_context(|| format!("hashing {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 of a byte slice, as lowercase hex.
pub fn sha256_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Cheap, stable fingerprint of a file.
///
/// Files under 20 MiB are hashed whole. Larger files hash the first and
/// last 10 MiB concatenated, so the digest stays cheap for multi-gigabyte
/// artifacts while remaining stable for unchanged inputs. The result is
/// the engine's dedup key, so it must be deterministic: same file bytes,
/// same digest, on every run.
pub fn quick_sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("opening {} for quick hashing", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();

    if len < QUICK_HASH_CHUNK * 2 {
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)
            .with_context(|| format!("hashing {}", path.display()))?;
        return Ok(format!("{:x}", hasher.finalize()));
    }

    let mut header = vec![0u8; QUICK_HASH_CHUNK as usize];
    file.read_exact(&mut header)
        .with_context(|| format!("reading header of {}", path.display()))?;

    let mut footer = vec![0u8; QUICK_HASH_CHUNK as usize];
    file.seek(SeekFrom::Start(len - QUICK_HASH_CHUNK))
        .with_context(|| format!("seeking in {}", path.display()))?;
    file.read_exact(&mut footer)
        .with_context(|| format!("reading footer of {}", path.display()))?;

    let mut hasher = Sha256::new();
    hasher.update(&header);
    hasher.update(&footer);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sha256_file_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn quick_hash_of_small_file_is_full_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.bin");
        std::fs::write(&path, b"some small artifact").unwrap();
        assert_eq!(
            quick_sha256_file(&path).unwrap(),
            sha256_file(&path).unwrap()
        );
    }

    #[test]
    fn quick_hash_is_stable_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        let mut file = File::create(&path).unwrap();
        // 25 MiB, forcing the first+last chunk branch.
        let block = vec![0xABu8; 1024 * 1024];
        for _ in 0..25 {
            file.write_all(&block).unwrap();
        }
        drop(file);

        let first = quick_sha256_file(&path).unwrap();
        let second = quick_sha256_file(&path).unwrap();
        assert_eq!(first, second);
        // And it is not the whole-file digest.
        assert_ne!(first, sha256_file(&path).unwrap());
    }

    #[test]
    fn quick_hash_ignores_middle_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let make = |name: &str, middle: u8| {
            let path = dir.path().join(name);
            let mut file = File::create(&path).unwrap();
            let edge = vec![0x11u8; 10 * 1024 * 1024];
            let mid = vec![middle; 5 * 1024 * 1024];
            file.write_all(&edge).unwrap();
            file.write_all(&mid).unwrap();
            file.write_all(&edge).unwrap();
            path
        };
        let a = make("a.bin", 0x22);
        let b = make("b.bin", 0x33);
        assert_eq!(
            quick_sha256_file(&a).unwrap(),
            quick_sha256_file(&b).unwrap()
        );
    }
}
