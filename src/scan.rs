use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::{DirEntry, WalkDir};

use crate::hash::to_rel_posix;

/// Default ignore pattern that must always be effectively applied, even if a
/// caller-supplied ignore list omits it.
const CONTROL_DIR_IGNORE: &str = ".wpdrive/**";

/// Enumerates files under a root, honoring a glob-style ignore list.
///
/// A directory is pruned if its relative path matches any pattern either bare
/// or with a trailing `/`. A file is skipped if its relative path matches any
/// pattern. Symlinks outside the root are never followed. Permission errors
/// on individual entries are logged and skipped rather than raised.
pub struct Scanner {
    ignore: GlobSet,
}

impl Scanner {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut saw_control_dir = false;
        for pat in patterns {
            if pat == CONTROL_DIR_IGNORE {
                saw_control_dir = true;
            }
            builder.add(Glob::new(pat).with_context(|| format!("invalid ignore glob: {pat}"))?);
        }
        if !saw_control_dir {
            builder.add(Glob::new(CONTROL_DIR_IGNORE).unwrap());
        }
        let ignore = builder.build().context("build ignore glob set")?;
        Ok(Self { ignore })
    }

    fn matches(&self, rel: &str) -> bool {
        self.ignore.is_match(rel) || self.ignore.is_match(format!("{rel}/"))
    }

    /// Returns rel_path -> absolute path for every non-ignored regular file
    /// under `root`. Ordering is lexical by rel_path (callers that don't need
    /// ordering may still rely on this for determinism in tests).
    pub fn scan(&self, root: &Path) -> Result<HashMap<String, PathBuf>> {
        let mut out = HashMap::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| self.should_descend(root, entry));

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    crate::logging::error(format!("scan error: {err}"));
                    continue;
                }
            };
            if entry.depth() == 0 || !entry.file_type().is_file() {
                continue;
            }
            let abs = entry.path().to_path_buf();
            let rel = match to_rel_posix(root, &abs) {
                Ok(r) => r,
                Err(err) => {
                    crate::logging::error(format!("scan path error: {err}"));
                    continue;
                }
            };
            if self.matches(&rel) {
                continue;
            }
            out.insert(rel, abs);
        }
        Ok(out)
    }

    fn should_descend(&self, root: &Path, entry: &DirEntry) -> bool {
        if entry.depth() == 0 {
            return true;
        }
        let rel = match to_rel_posix(root, entry.path()) {
            Ok(r) => r,
            Err(_) => return false,
        };
        if entry.file_type().is_dir() {
            !self.matches(&rel)
        } else {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tmp(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("wpdrive-scan-test-{prefix}-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn scan_excludes_control_dir_by_default() {
        let root = tmp("default-ignore");
        fs::create_dir_all(root.join(".wpdrive").join("tmp")).unwrap();
        fs::write(root.join(".wpdrive").join("state.db"), b"x").unwrap();
        fs::write(root.join("notes.txt"), b"hello").unwrap();

        let scanner = Scanner::new(&[]).unwrap();
        let files = scanner.scan(&root).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files.contains_key("notes.txt"));
    }

    #[test]
    fn scan_prunes_ignored_directories() {
        let root = tmp("prune-dir");
        fs::create_dir_all(root.join("node_modules").join("pkg")).unwrap();
        fs::write(root.join("node_modules").join("pkg").join("x.js"), b"x").unwrap();
        fs::write(root.join("keep.txt"), b"x").unwrap();

        let scanner = Scanner::new(&["node_modules/**".to_string()]).unwrap();
        let files = scanner.scan(&root).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files.contains_key("keep.txt"));
    }

    #[test]
    fn scan_skips_ignored_files_without_pruning_siblings() {
        let root = tmp("skip-file");
        fs::create_dir_all(root.join("dir")).unwrap();
        fs::write(root.join("dir").join("a.log"), b"x").unwrap();
        fs::write(root.join("dir").join("b.txt"), b"x").unwrap();

        let scanner = Scanner::new(&["**/*.log".to_string()]).unwrap();
        let files = scanner.scan(&root).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files.contains_key("dir/b.txt"));
    }
}
