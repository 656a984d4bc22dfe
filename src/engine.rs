use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::api::{HttpWpDriveApi, RemoteChange, WpDriveApi};
use crate::conflicts::conflict_name;
use crate::config::Config;
use crate::hash::{crc32_file, rel_to_abs};
use crate::scan::Scanner;
use crate::state::{FileState, StateDb};
use crate::telemetry::HttpStats;
use crate::uploader::upload_file;

/// Number of changes requested per page in the pull phase.
const CHANGES_PAGE_LIMIT: i64 = 500;

/// Drives one reconciliation cycle between a local directory tree and its
/// WPDrive-backed remote: pulling the change log, then scanning and pushing
/// local edits. The engine itself is synchronous; callers that want a
/// recurring cycle wrap `sync_once` in their own loop (see `daemon.rs`).
pub struct SyncEngine {
    api: Box<dyn WpDriveApi>,
    db: StateDb,
    scanner: Scanner,
    stats: Arc<HttpStats>,
    root: PathBuf,
    tmp_dir: PathBuf,
    device_id: String,
    device_label: String,
    chunk_size_mb: u64,
    min_chunk_size_mb: u64,
}

impl SyncEngine {
    pub fn new(cfg: &Config) -> Result<Self> {
        let api = HttpWpDriveApi::new(&cfg.url, &cfg.user, &cfg.app_password, cfg.timeout_seconds)?;
        Self::with_api(
            &cfg.root,
            &cfg.ignore,
            cfg.resolved_device_label(),
            cfg.chunk_size_mb,
            cfg.min_chunk_size_mb,
            Box::new(api),
        )
    }

    /// Builds an engine around an arbitrary `WpDriveApi` implementation, so
    /// tests can exercise the full pull/push cycle against a scripted fake
    /// without a network.
    pub fn with_api(
        root: &Path,
        ignore: &[String],
        device_label: String,
        chunk_size_mb: u64,
        min_chunk_size_mb: u64,
        api: Box<dyn WpDriveApi>,
    ) -> Result<Self> {
        let control_dir = root.join(crate::config::CONTROL_DIR_NAME);
        std::fs::create_dir_all(&control_dir)
            .with_context(|| format!("create {}", control_dir.display()))?;
        let tmp_dir = control_dir.join("tmp");
        std::fs::create_dir_all(&tmp_dir)
            .with_context(|| format!("create {}", tmp_dir.display()))?;

        let db = StateDb::new(&control_dir);
        db.initialize()?;
        let device_id = db.get_device_id()?;
        let scanner = Scanner::new(ignore)?;

        Ok(Self {
            api,
            db,
            scanner,
            stats: Arc::new(HttpStats::default()),
            root: root.to_path_buf(),
            tmp_dir,
            device_id,
            device_label,
            chunk_size_mb,
            min_chunk_size_mb,
        })
    }

    pub fn stats(&self) -> Arc<HttpStats> {
        self.stats.clone()
    }

    /// Runs one full pull-then-push cycle. Aborts (without running the push
    /// phase) if any remote change fails to apply, leaving `last_change_id`
    /// at the last change that was applied successfully.
    pub fn sync_once(&self) -> Result<()> {
        self.pull_changes().context("pull phase")?;
        self.push_local_changes().context("push phase")?;
        Ok(())
    }

    fn pull_changes(&self) -> Result<()> {
        let mut since = self.db.get_last_change_id()?;
        loop {
            let page = self
                .api
                .changes(since, CHANGES_PAGE_LIMIT)
                .context("fetch changes")?;
            if page.changes.is_empty() {
                break;
            }

            for change in &page.changes {
                let is_echo = change.device_id() == Some(self.device_id.as_str());
                let result = if is_echo {
                    Ok(())
                } else {
                    match change {
                        RemoteChange::Upsert { .. } => self.apply_remote_upsert(change),
                        RemoteChange::Delete { .. } => self.apply_remote_delete(change),
                        RemoteChange::Unknown { .. } => Ok(()),
                    }
                };

                match result {
                    Ok(()) => {
                        since = change.change_id();
                        self.db.set_last_change_id(since)?;
                    }
                    Err(err) => {
                        return Err(err)
                            .with_context(|| format!("applying remote change {}", change.change_id()));
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_remote_upsert(&self, change: &RemoteChange) -> Result<()> {
        let RemoteChange::Upsert {
            rel_path,
            rev,
            mtime,
            crc32,
            ..
        } = change
        else {
            unreachable!("apply_remote_upsert called with a non-upsert change")
        };

        let abs_path = rel_to_abs(&self.root, rel_path)?;
        let state = self.db.get_file(rel_path)?;

        if abs_path.exists() {
            if let Some(state) = &state {
                let (cur_size, cur_mtime) = stat_size_mtime(&abs_path)?;
                let metadata_changed = (cur_size, cur_mtime) != (state.size, state.mtime);

                if metadata_changed {
                    let local_crc = crc32_file(&abs_path)?;
                    if local_crc != state.crc32 {
                        self.set_aside_as_conflict(rel_path, &abs_path)?;
                    }
                }
            }
        }

        self.download_remote_to(rel_path, &abs_path, *crc32)?;

        if *mtime > 0 {
            let _ = filetime::set_file_mtime(&abs_path, filetime::FileTime::from_unix_time(*mtime, 0));
        }

        let (size, mtime_on_disk) = stat_size_mtime(&abs_path)?;
        let final_crc = if *crc32 != 0 {
            *crc32
        } else {
            crc32_file(&abs_path)?
        };
        self.db.upsert_file(&FileState {
            rel_path: rel_path.clone(),
            size,
            mtime: mtime_on_disk,
            crc32: final_crc,
            server_rev: *rev,
        })?;
        Ok(())
    }

    fn apply_remote_delete(&self, change: &RemoteChange) -> Result<()> {
        let RemoteChange::Delete {
            rel_path,
            deleted_size,
            deleted_crc32,
            ..
        } = change
        else {
            unreachable!("apply_remote_delete called with a non-delete change")
        };

        let abs_path = rel_to_abs(&self.root, rel_path)?;
        if !abs_path.exists() {
            self.db.delete_file(rel_path)?;
            return Ok(());
        }

        if let (Some(size), Some(crc)) = (deleted_size, deleted_crc32) {
            let (cur_size, _) = stat_size_mtime(&abs_path)?;
            if cur_size == *size && crc32_file(&abs_path)? == *crc {
                std::fs::remove_file(&abs_path)
                    .with_context(|| format!("remove {}", abs_path.display()))?;
                self.db.delete_file(rel_path)?;
                return Ok(());
            }
        }

        // Local content doesn't match what was deleted remotely: the delete
        // races a local edit. Keep the local edit under a conflict name
        // rather than silently discarding it.
        self.set_aside_as_conflict(rel_path, &abs_path)?;
        self.db.delete_file(rel_path)?;
        crate::logging::info_kv("remote delete conflicted with local edit", &[("rel_path", rel_path)]);
        Ok(())
    }

    fn set_aside_as_conflict(&self, rel_path: &str, abs_path: &Path) -> Result<()> {
        let (conflict_rel, conflict_abs) = self.place_conflict_copy(rel_path)?;
        if let Some(parent) = conflict_abs.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        std::fs::rename(abs_path, &conflict_abs).with_context(|| {
            format!("rename {} to {}", abs_path.display(), conflict_abs.display())
        })?;
        let (size, mtime) = stat_size_mtime(&conflict_abs)?;
        let crc = crc32_file(&conflict_abs)?;
        self.db.upsert_file(&FileState {
            rel_path: conflict_rel,
            size,
            mtime,
            crc32: crc,
            server_rev: 0,
        })?;
        crate::logging::info_kv("set aside conflicting local copy", &[("rel_path", rel_path)]);
        Ok(())
    }

    fn download_remote_to(&self, rel_path: &str, abs_path: &Path, expected_crc32: u32) -> Result<()> {
        if let Some(parent) = abs_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let file_name = abs_path
            .file_name()
            .context("rel_path has no file name component")?
            .to_string_lossy()
            .to_string();
        let tmp_path = self.tmp_dir.join(format!("{file_name}.download.part"));
        if tmp_path.exists() {
            std::fs::remove_file(&tmp_path)
                .with_context(|| format!("remove stale {}", tmp_path.display()))?;
        }

        {
            let mut tmp_file = std::fs::File::create(&tmp_path)
                .with_context(|| format!("create {}", tmp_path.display()))?;
            self.api
                .download_stream(rel_path, &mut tmp_file)
                .with_context(|| format!("download {rel_path}"))?;
        }

        if expected_crc32 != 0 {
            let downloaded_crc = crc32_file(&tmp_path)?;
            if downloaded_crc != expected_crc32 {
                let _ = std::fs::remove_file(&tmp_path);
                anyhow::bail!(
                    "crc32 mismatch downloading {rel_path}: expected {expected_crc32}, got {downloaded_crc}"
                );
            }
        }

        if abs_path.exists() {
            std::fs::remove_file(abs_path).with_context(|| format!("remove {}", abs_path.display()))?;
        }
        std::fs::rename(&tmp_path, abs_path)
            .with_context(|| format!("replace {} with downloaded content", abs_path.display()))?;
        Ok(())
    }

    fn push_local_changes(&self) -> Result<()> {
        let local_files = self.scanner.scan(&self.root)?;
        let known: HashMap<String, FileState> = self
            .db
            .iter_files()?
            .into_iter()
            .map(|f| (f.rel_path.clone(), f))
            .collect();

        let mut to_upload = Vec::new();
        for (rel_path, abs_path) in &local_files {
            let (size, mtime) = stat_size_mtime(abs_path)?;
            let state = known.get(rel_path);
            let metadata_changed = state.map(|s| (size, mtime) != (s.size, s.mtime)).unwrap_or(true);
            if !metadata_changed {
                continue;
            }

            let crc = crc32_file(abs_path)?;
            let content_changed = state.map(|s| crc != s.crc32).unwrap_or(true);
            if content_changed {
                to_upload.push(rel_path.clone());
            } else {
                // mtime/size drifted (e.g. a touch) but content is unchanged;
                // refresh the cheap fields without a network round-trip.
                let server_rev = state.map(|s| s.server_rev).unwrap_or(0);
                self.db.upsert_file(&FileState {
                    rel_path: rel_path.clone(),
                    size,
                    mtime,
                    crc32: crc,
                    server_rev,
                })?;
            }
        }

        let mut to_delete: Vec<String> = known
            .keys()
            .filter(|rel_path| !local_files.contains_key(*rel_path))
            .cloned()
            .collect();

        to_upload.sort();
        to_delete.sort();

        for rel_path in &to_upload {
            let abs_path = local_files.get(rel_path).expect("just collected from scan");
            if let Err(err) = self.push_one_file(rel_path, abs_path) {
                crate::logging::error(format!("push {rel_path} failed: {err:#}"));
            }
        }
        for rel_path in &to_delete {
            if let Err(err) = self.push_one_delete(rel_path) {
                crate::logging::error(format!("push delete {rel_path} failed: {err:#}"));
            }
        }
        Ok(())
    }

    fn push_one_file(&self, rel_path: &str, abs_path: &Path) -> Result<()> {
        let (size, mtime) = stat_size_mtime(abs_path)?;
        let crc = crc32_file(abs_path)?;
        let state = self.db.get_file(rel_path)?;
        let base_rev = state.map(|s| s.server_rev).unwrap_or(0);

        let finalize = upload_file(
            self.api.as_ref(),
            &self.stats,
            abs_path,
            rel_path,
            size,
            mtime,
            crc,
            base_rev,
            &self.device_id,
            &self.device_label,
            self.chunk_size_mb,
            self.min_chunk_size_mb,
        )?;

        let mut final_abs = abs_path.to_path_buf();
        let mut final_rel = finalize.rel_path.clone();

        if finalize.rel_path != rel_path {
            let mut dest_abs = rel_to_abs(&self.root, &finalize.rel_path)?;
            if dest_abs.exists() {
                let (conflict_rel, conflict_abs) = self.place_conflict_copy(&finalize.rel_path)?;
                dest_abs = conflict_abs;
                final_rel = conflict_rel;
            }
            if let Some(parent) = dest_abs.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            std::fs::rename(abs_path, &dest_abs)
                .with_context(|| format!("rename {} to {}", abs_path.display(), dest_abs.display()))?;
            self.db.delete_file(rel_path)?;
            final_abs = dest_abs;
            crate::logging::info_kv(
                "server decided a different path for upload",
                &[("requested", rel_path), ("decided", &final_rel)],
            );
        }

        let (size, mtime) = stat_size_mtime(&final_abs)?;
        let crc = crc32_file(&final_abs)?;
        self.db.upsert_file(&FileState {
            rel_path: final_rel,
            size,
            mtime,
            crc32: crc,
            server_rev: finalize.rev,
        })?;
        Ok(())
    }

    fn push_one_delete(&self, rel_path: &str) -> Result<()> {
        self.api
            .delete(rel_path, &self.device_id)
            .with_context(|| format!("delete {rel_path}"))?;
        self.db.delete_file(rel_path)?;
        Ok(())
    }

    /// Finds a rel_path that doesn't currently exist on disk, retrying with a
    /// fresh timestamp if the first candidate collides.
    fn place_conflict_copy(&self, rel_path: &str) -> Result<(String, PathBuf)> {
        for attempt in 0..20 {
            let candidate_rel = conflict_name(rel_path, &self.device_label, None);
            let candidate_abs = rel_to_abs(&self.root, &candidate_rel)?;
            if !candidate_abs.exists() {
                return Ok((candidate_rel, candidate_abs));
            }
            if attempt < 19 {
                std::thread::sleep(std::time::Duration::from_millis(1100));
            }
        }
        anyhow::bail!("could not find a free conflict name for {rel_path}")
    }
}

fn stat_size_mtime(path: &Path) -> Result<(i64, i64)> {
    let meta = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok((meta.len() as i64, mtime))
}
