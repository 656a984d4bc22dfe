use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{Context, Result};

use crate::api::{ApiError, UploadFinalizeResponse, WpDriveApi};
use crate::telemetry::HttpStats;

/// Uploads one file through `upload_init` / repeated `upload_chunk` /
/// `upload_finalize`, halving the chunk size whenever the server returns a
/// transient status and retrying the same offset, per the push scenario's
/// adaptive backoff.
///
/// Returns the server's finalize response; the caller decides whether the
/// server renamed the file (a same-path-different-content race) and updates
/// local state accordingly.
#[allow(clippy::too_many_arguments)]
pub fn upload_file(
    api: &dyn WpDriveApi,
    stats: &HttpStats,
    abs_path: &Path,
    rel_path: &str,
    size: i64,
    mtime: i64,
    crc32: u32,
    base_rev: i64,
    device_id: &str,
    device_label: &str,
    chunk_size_mb: u64,
    min_chunk_size_mb: u64,
) -> Result<UploadFinalizeResponse> {
    let init = api
        .upload_init(rel_path, size, mtime, crc32, base_rev, device_id, device_label)
        .with_context(|| format!("upload_init {rel_path}"))?;

    if let Some(decided) = init.decided_path.as_deref().filter(|d| *d != rel_path) {
        crate::logging::info_kv(
            "server flagged a conflict rename at upload_init",
            &[("requested", rel_path), ("decided_path", decided)],
        );
    }

    let mut file =
        File::open(abs_path).with_context(|| format!("open {}", abs_path.display()))?;
    let mut offset: i64 = 0;
    let mut chunk_mb = chunk_size_mb.max(min_chunk_size_mb).max(1);

    while offset < size {
        let chunk_bytes = (chunk_mb * 1024 * 1024) as usize;
        let want = chunk_bytes.min((size - offset) as usize);
        file.seek(SeekFrom::Start(offset as u64))
            .with_context(|| format!("seek {}", abs_path.display()))?;
        let mut buf = vec![0u8; want];
        file.read_exact(&mut buf)
            .with_context(|| format!("read {}", abs_path.display()))?;

        match api.upload_chunk(&init.upload_id, offset, &buf) {
            Ok(()) => {
                stats.on_send(buf.len() as i64);
                offset += buf.len() as i64;
            }
            Err(err) => {
                let Some(api_err) = err.downcast_ref::<ApiError>() else {
                    stats.set_last_error(err.to_string());
                    return Err(err);
                };
                if !api_err.is_transient_upload_error() {
                    stats.set_last_error(api_err.to_string());
                    return Err(err);
                }
                let new_mb = min_chunk_size_mb.max((chunk_mb / 2).max(1));
                if new_mb >= chunk_mb {
                    stats.set_last_error(api_err.to_string());
                    return Err(err);
                }
                crate::logging::info_kv(
                    "halving upload chunk size after transient error",
                    &[
                        ("rel_path", rel_path),
                        ("from_mb", &chunk_mb.to_string()),
                        ("to_mb", &new_mb.to_string()),
                    ],
                );
                chunk_mb = new_mb;
                continue;
            }
        }
    }

    api.upload_finalize(&init.upload_id)
        .with_context(|| format!("upload_finalize {rel_path}"))
}
