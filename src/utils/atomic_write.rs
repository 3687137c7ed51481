//! Safe output of delivered payloads.
//!
//! - Names announced by a remote peer are reduced to a single safe file name.
//! - Content goes to a `.part` sibling first, then an atomic rename replaces
//!   the target; a failed rename removes the temp file.
//! - Parent directories are created if absent.

use anyhow::Result;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::error;

/// Reduce a (possibly adversarial) remote file name to one safe path component.
///
/// - Normalizes `\` to `/` and keeps only the last non-empty component.
/// - `.` and `..` are dropped.
/// - Keeps only alphanumeric chars plus `.`, `-`, `_`, and ` `.
/// - Falls back to `"file"` when nothing is left.
pub fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let last = normalized
        .split('/')
        .filter(|s| !s.is_empty() && !matches!(*s, "." | ".."))
        .next_back()
        .unwrap_or_default();

    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    let safe = safe.trim_start_matches('.').trim().to_string();

    if safe.is_empty() { "file".to_string() } else { safe }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

/// Atomically write `content` to `path` via a temporary file and rename.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = temp_path(path);

    std::fs::write(&tmp_path, content).map_err(|e| {
        error!(
            event = "atomic_write_failure",
            path = %tmp_path.display(),
            error = %e,
            "Failed to write temp file"
        );
        e
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        error!(
            event = "atomic_rename_failure",
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        e
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("directdrop_test")
            .join("atomic_write")
            .join(name);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    #[test]
    fn test_sanitize_strips_traversal() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("..\\..\\boot.ini"), "boot.ini");
        assert_eq!(sanitize_file_name("report (final).pdf"), "report final.pdf");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name("../"), "file");
        assert_eq!(sanitize_file_name(""), "file");
    }

    #[test]
    fn test_atomic_write_overwrites_and_cleans_up() {
        let dir = test_dir("overwrite");
        let path = dir.join("nested").join("out.bin");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!temp_path(&path).exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
