//! Formatter adapter: rewrites a file to canonical indentation in place.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::core::indent::normalize_source;

/// Rewrites one file in place. Implementations must be safe to call from
/// several threads at once on distinct paths.
pub trait Formatter: Sync {
    /// Returns `true` when the file content changed.
    fn normalize(&self, path: &Path, indent_width: usize) -> Result<bool>;
}

/// Built-in whitespace normalizer backed by [`normalize_source`].
pub struct IndentFormatter;

impl Formatter for IndentFormatter {
    fn normalize(&self, path: &Path, indent_width: usize) -> Result<bool> {
        let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let text = String::from_utf8(bytes)
            .with_context(|| format!("{} is not valid UTF-8", path.display()))?;
        let normalized = normalize_source(&text, indent_width);
        if normalized == text {
            return Ok(false);
        }
        write_atomic(path, &normalized)?;
        Ok(true)
    }
}

/// Atomically replace `path` (temp file in the same directory + rename).
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let tmp_path = parent.join(format!(".{}.redeploy.tmp", file_name.to_string_lossy()));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    if let Ok(meta) = fs::metadata(path) {
        fs::set_permissions(&tmp_path, meta.permissions())
            .with_context(|| format!("copy permissions to {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_only_when_needed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("bot.py");
        fs::write(&path, "def f():\r\n\treturn 1\r\n").expect("write");

        assert!(IndentFormatter.normalize(&path, 4).expect("first"));
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "def f():\n    return 1\n"
        );
        assert!(!IndentFormatter.normalize(&path, 4).expect("second"));
    }

    #[test]
    fn non_utf8_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("blob.txt");
        fs::write(&path, [0xff, 0xfe, 0x00]).expect("write");
        let err = IndentFormatter.normalize(&path, 4).unwrap_err();
        assert!(format!("{err:#}").contains("not valid UTF-8"));
    }
}
