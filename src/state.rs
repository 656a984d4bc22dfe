use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};

/// Durable per-file reconciliation state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub rel_path: String,
    pub size: i64,
    pub mtime: i64,
    pub crc32: u32,
    pub server_rev: i64,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT
);
CREATE TABLE IF NOT EXISTS files (
    rel_path TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    mtime INTEGER NOT NULL,
    crc32 INTEGER NOT NULL,
    server_rev INTEGER NOT NULL DEFAULT 0
);
"#;

/// Crash-consistent, single-writer key-value + per-file state store backed by
/// SQLite in WAL mode. Every public mutation opens a connection, runs inside
/// SQLite's own implicit transaction, and commits before returning, so a
/// crash mid-mutation leaves either the pre- or post-mutation state, never
/// torn.
pub struct StateDb {
    path: PathBuf,
}

impl StateDb {
    pub fn new(control_dir: &Path) -> Self {
        Self {
            path: control_dir.join("state.db"),
        }
    }

    fn connect(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let conn = Connection::open(&self.path)
            .with_context(|| format!("open state db {}", self.path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("set journal_mode=WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("set synchronous=NORMAL")?;
        Ok(conn)
    }

    /// Idempotent: creates the schema if it doesn't already exist.
    pub fn initialize(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(SCHEMA).context("init state db schema")?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.connect()?;
        conn.query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .context("get_meta")
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO meta(key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .context("set_meta")?;
        Ok(())
    }

    pub fn get_last_change_id(&self) -> Result<i64> {
        Ok(self
            .get_meta("last_change_id")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    pub fn set_last_change_id(&self, change_id: i64) -> Result<()> {
        self.set_meta("last_change_id", &change_id.to_string())
    }

    /// Generated exactly once per sync root; stable forever after.
    /// 16 random bytes, hex-encoded.
    pub fn get_device_id(&self) -> Result<String> {
        if let Some(v) = self.get_meta("device_id")? {
            return Ok(v);
        }
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let id = hex::encode(bytes);
        self.set_meta("device_id", &id)?;
        Ok(id)
    }

    pub fn get_file(&self, rel_path: &str) -> Result<Option<FileState>> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT rel_path, size, mtime, crc32, server_rev FROM files WHERE rel_path = ?1",
            params![rel_path],
            Self::row_to_state,
        )
        .optional()
        .context("get_file")
    }

    pub fn upsert_file(&self, state: &FileState) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO files(rel_path, size, mtime, crc32, server_rev) VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(rel_path) DO UPDATE SET \
             size = excluded.size, mtime = excluded.mtime, crc32 = excluded.crc32, server_rev = excluded.server_rev",
            params![
                state.rel_path,
                state.size,
                state.mtime,
                state.crc32 as i64,
                state.server_rev
            ],
        )
        .context("upsert_file")?;
        Ok(())
    }

    pub fn delete_file(&self, rel_path: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM files WHERE rel_path = ?1", params![rel_path])
            .context("delete_file")?;
        Ok(())
    }

    pub fn iter_files(&self) -> Result<Vec<FileState>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT rel_path, size, mtime, crc32, server_rev FROM files")
            .context("prepare iter_files")?;
        let rows = stmt
            .query_map([], Self::row_to_state)
            .context("query iter_files")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("collect iter_files")
    }

    fn row_to_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileState> {
        let crc32_i64: i64 = row.get(3)?;
        Ok(FileState {
            rel_path: row.get(0)?,
            size: row.get(1)?,
            mtime: row.get(2)?,
            crc32: crc32_i64 as u32,
            server_rev: row.get(4)?,
        })
    }
}
