//! Content hashing policy.
//!
//! Each entry hashes as `xxh64(content, seed = xxh64(relative_path))`, where
//! `relative_path` is the `/`-joined path below the top-level entry. The
//! top-level entry has the empty path, so a single file's hash depends only
//! on its bytes. A directory hashes as the wrapping sum of all its
//! descendants (sub-directories contribute empty content): independent of
//! traversal order, sensitive to names and nesting.
//!
//! This is a namespace hash, not a cryptographic one.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::Path;

use walkdir::WalkDir;
use xxhash_rust::xxh64::{xxh64, Xxh64};

const READ_CHUNK: usize = 64 * 1024;

/// Hash of one entry given its relative path and full content.
#[inline]
pub fn entry_hash(relative_path: &str, content: &[u8]) -> u64 {
    xxh64(content, xxh64(relative_path.as_bytes(), 0))
}

/// Hash of an in-memory top-level file.
#[inline]
pub fn hash_bytes(content: &[u8]) -> u64 {
    entry_hash("", content)
}

/// Integrity checksum sent alongside transferred payloads.
#[inline]
pub fn checksum(payload: &[u8]) -> u64 {
    xxh64(payload, 0)
}

/// Hash a file or directory tree on disk.
pub fn hash_path(path: &Path) -> io::Result<u64> {
    let meta = fs::metadata(path)?;
    if !meta.is_dir() {
        return hash_file(path, "");
    }

    let mut sum = 0u64;
    for entry in WalkDir::new(path).min_depth(1).follow_links(false) {
        let entry = entry?;
        let relative = relative_key(entry.path().strip_prefix(path).map_err(io::Error::other)?);
        let hash = if entry.file_type().is_file() {
            hash_file(entry.path(), &relative)?
        } else {
            entry_hash(&relative, &[])
        };
        sum = sum.wrapping_add(hash);
    }
    Ok(sum)
}

fn hash_file(path: &Path, relative: &str) -> io::Result<u64> {
    let mut hasher = Xxh64::new(xxh64(relative.as_bytes(), 0));
    let mut reader = BufReader::with_capacity(READ_CHUNK, File::open(path)?);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.digest())
}

fn relative_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_hash_ignores_top_level_name() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("b.txt");
        let b = temp.path().join("c.txt");
        fs::write(&a, "hello").unwrap();
        fs::write(&b, "hello").unwrap();

        assert_eq!(hash_path(&a).unwrap(), hash_path(&b).unwrap());
        assert_eq!(hash_path(&a).unwrap(), hash_bytes(b"hello"));
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("big.bin");
        let data: Vec<u8> = (0..(READ_CHUNK * 3 + 17)).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).unwrap();
        assert_eq!(hash_path(&path).unwrap(), hash_bytes(&data));
    }

    #[test]
    fn test_directory_hash_is_structure_sensitive() {
        let temp = TempDir::new().unwrap();

        let flat = temp.path().join("flat");
        fs::create_dir_all(flat.join("sub")).unwrap();
        fs::write(flat.join("x.txt"), "x").unwrap();

        let nested = temp.path().join("nested");
        fs::create_dir_all(nested.join("sub")).unwrap();
        fs::write(nested.join("sub").join("x.txt"), "x").unwrap();

        assert_ne!(hash_path(&flat).unwrap(), hash_path(&nested).unwrap());
    }

    #[test]
    fn test_directory_hash_ignores_root_name() {
        let temp = TempDir::new().unwrap();
        for root in ["one", "two"] {
            let dir = temp.path().join(root);
            fs::create_dir_all(dir.join("a")).unwrap();
            fs::write(dir.join("a").join("f"), "data").unwrap();
            fs::write(dir.join("g"), "more").unwrap();
        }
        assert_eq!(
            hash_path(&temp.path().join("one")).unwrap(),
            hash_path(&temp.path().join("two")).unwrap()
        );
    }
}
