use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Size of the read buffer used while streaming a file through CRC32.
const CRC_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// CRC32 (IEEE) of a file's contents, computed by streaming fixed-size chunks
/// through a running checksum so large files never load fully into memory.
pub fn crc32_file(path: &Path) -> Result<u32> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; CRC_CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Convert an absolute path under `root` into a forward-slash relative path,
/// never leading with `/` and never containing `..`.
pub fn to_rel_posix(root: &Path, abs_path: &Path) -> Result<String> {
    let rel = abs_path
        .strip_prefix(root)
        .with_context(|| format!("{} is not under {}", abs_path.display(), root.display()))?;
    let mut parts = Vec::new();
    for comp in rel.components() {
        match comp {
            std::path::Component::Normal(seg) => {
                let seg = seg.to_str().with_context(|| {
                    format!("non-utf8 path component in {}", abs_path.display())
                })?;
                parts.push(seg.to_string());
            }
            std::path::Component::ParentDir => {
                anyhow::bail!("path escapes root via ..: {}", abs_path.display())
            }
            std::path::Component::CurDir => {}
            _ => anyhow::bail!("unexpected path component in {}", abs_path.display()),
        }
    }
    Ok(parts.join("/"))
}

/// Join a rel_path (forward-slash, validated) onto an absolute root.
pub fn rel_to_abs(root: &Path, rel_path: &str) -> Result<PathBuf> {
    validate_rel_path(rel_path)?;
    Ok(root.join(rel_path))
}

/// Reject rel_paths that are absolute, empty, or contain `..` segments.
pub fn validate_rel_path(rel_path: &str) -> Result<()> {
    if rel_path.is_empty() {
        anyhow::bail!("rel_path is empty");
    }
    if rel_path.starts_with('/') {
        anyhow::bail!("rel_path must not be absolute: {rel_path}");
    }
    if rel_path.split('/').any(|seg| seg == "..") {
        anyhow::bail!("rel_path must not contain ..: {rel_path}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tmp(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "wpdrive-hash-test-{prefix}-{}",
            uuid::Uuid::new_v4()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn crc32_matches_known_value() {
        let dir = tmp("crc");
        let path = dir.join("notes.txt");
        fs::write(&path, b"hello world!").unwrap();
        // zlib.crc32(b"hello world!") == 0x1c291ca3
        assert_eq!(crc32_file(&path).unwrap(), 0x1c29_1ca3);
    }

    #[test]
    fn crc32_is_stable_across_chunk_boundary() {
        let dir = tmp("crc-big");
        let path = dir.join("big.bin");
        let data = vec![7u8; CRC_CHUNK_SIZE * 2 + 13];
        fs::write(&path, &data).unwrap();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data);
        assert_eq!(crc32_file(&path).unwrap(), hasher.finalize());
    }

    #[test]
    fn to_rel_posix_normalizes_separators() {
        let root = tmp("rel");
        let abs = root.join("a").join("b.txt");
        fs::create_dir_all(abs.parent().unwrap()).unwrap();
        fs::write(&abs, b"x").unwrap();
        assert_eq!(to_rel_posix(&root, &abs).unwrap(), "a/b.txt");
    }

    #[test]
    fn validate_rel_path_rejects_traversal_and_absolute() {
        assert!(validate_rel_path("../etc/passwd").is_err());
        assert!(validate_rel_path("/etc/passwd").is_err());
        assert!(validate_rel_path("").is_err());
        assert!(validate_rel_path("a/b.txt").is_ok());
    }
}
