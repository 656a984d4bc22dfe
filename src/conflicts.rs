use std::path::Path;

use chrono::{DateTime, Utc};

/// Derive a collision-free-by-construction rename for a conflicted file.
///
/// The caller is responsible for re-invoking this with a fresh `when` if the
/// returned path already exists on disk; a new timestamp yields a distinct
/// name.
pub fn conflict_name(rel_path: &str, device_label: &str, when: Option<DateTime<Utc>>) -> String {
    let label = sanitize_device_label(device_label);
    let when = when.unwrap_or_else(Utc::now);
    let ts = when.format("%Y-%m-%d_%H-%M-%S");
    let info = format!("conflict from {label} {ts}");

    let p = Path::new(rel_path);
    match (p.parent(), p.file_stem(), p.extension()) {
        (parent, Some(stem), Some(ext)) => {
            let stem = stem.to_string_lossy();
            let ext = ext.to_string_lossy();
            let new_name = format!("{stem} ({info}).{ext}");
            join_rel(parent, &new_name)
        }
        _ => format!("{rel_path} ({info})"),
    }
}

fn join_rel(parent: Option<&Path>, name: &str) -> String {
    match parent {
        Some(p) if !p.as_os_str().is_empty() => {
            format!("{}/{name}", p.to_string_lossy())
        }
        _ => name.to_string(),
    }
}

/// Alphanumerics plus space, underscore, dot, hyphen; empty -> "device".
fn sanitize_device_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ' ' | '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "device".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 7).unwrap()
    }

    #[test]
    fn inserts_suffix_before_extension() {
        let out = conflict_name("notes.txt", "laptop", Some(fixed_time()));
        assert_eq!(out, "notes (conflict from laptop 2024-03-05_14-30-07).txt");
    }

    #[test]
    fn appends_suffix_when_no_extension() {
        let out = conflict_name("README", "laptop", Some(fixed_time()));
        assert_eq!(out, "README (conflict from laptop 2024-03-05_14-30-07)");
    }

    #[test]
    fn preserves_directory_prefix() {
        let out = conflict_name("docs/a/notes.txt", "laptop", Some(fixed_time()));
        assert_eq!(
            out,
            "docs/a/notes (conflict from laptop 2024-03-05_14-30-07).txt"
        );
    }

    #[test]
    fn sanitizes_device_label() {
        let out = conflict_name("a.txt", "my/phone!", Some(fixed_time()));
        assert!(out.contains("conflict from my_phone_ "));
    }

    #[test]
    fn empty_label_falls_back_to_device() {
        let out = conflict_name("a.txt", "", Some(fixed_time()));
        assert!(out.contains("conflict from device "));
    }

    #[test]
    fn is_idempotent_given_identical_inputs() {
        let a = conflict_name("a/b.txt", "laptop", Some(fixed_time()));
        let b = conflict_name("a/b.txt", "laptop", Some(fixed_time()));
        assert_eq!(a, b);
    }
}
