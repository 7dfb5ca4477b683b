//! Source file discovery and per-file parallel execution.

use std::path::{Path, PathBuf};
use std::thread;

use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// Which files a stage operates on.
#[derive(Debug, Clone, Copy)]
pub struct FileFilter<'a> {
    /// Extensions without the leading dot (e.g. `py`). Dotfiles such as
    /// `.env` match on their name after the dot.
    pub extensions: &'a [String],
    /// Directory names skipped at any depth.
    pub excluded_dirs: &'a [String],
}

impl FileFilter<'_> {
    fn is_excluded_dir(&self, entry: &DirEntry) -> bool {
        entry.depth() > 0
            && entry.file_type().is_dir()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| self.excluded_dirs.iter().any(|d| d == name))
    }

    pub fn matches(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let ext = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => ext,
            None => name.strip_prefix('.').unwrap_or(""),
        };
        !ext.is_empty() && self.extensions.iter().any(|e| e == ext)
    }
}

/// A path the walk could not descend into or read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unreadable {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of [`collect_files`].
#[derive(Debug, Default)]
pub struct FileScan {
    /// Matching files, sorted for deterministic output.
    pub files: Vec<PathBuf>,
    /// Entries skipped because they could not be walked.
    pub unreadable: Vec<Unreadable>,
}

/// List matching files under `root`. Entries that cannot be walked are
/// skipped and reported instead of aborting the scan.
pub fn collect_files(root: &Path, filter: FileFilter<'_>) -> FileScan {
    let mut scan = FileScan::default();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !filter.is_excluded_dir(entry));
    for entry in walker {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file() && filter.matches(entry.path()) {
                    scan.files.push(entry.into_path());
                }
            }
            Err(err) => {
                let path = err.path().unwrap_or(root).to_path_buf();
                let reason = match err.io_error() {
                    Some(io) => io.to_string(),
                    None => err.to_string(),
                };
                warn!(path = %path.display(), %reason, "skipping unwalkable entry");
                scan.unreadable.push(Unreadable { path, reason });
            }
        }
    }
    scan.files.sort();
    scan
}

/// Apply `f` to every item using scoped worker threads.
///
/// Results come back in input order. Items are independent; there is no
/// ordering between calls.
pub fn parallel_map<T, R, F>(items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    if items.is_empty() {
        return Vec::new();
    }
    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(items.len());
    let chunk_size = items.len().div_ceil(workers);
    let f = &f;
    thread::scope(|scope| {
        let handles: Vec<_> = items
            .chunks(chunk_size)
            .map(|chunk| scope.spawn(move || chunk.iter().map(f).collect::<Vec<R>>()))
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| match handle.join() {
                Ok(results) => results,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn skips_excluded_directories_and_other_extensions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        for dir in ["src", "venv/lib", "__pycache__", ".git"] {
            fs::create_dir_all(root.join(dir)).expect("mkdir");
        }
        for file in [
            "main.py",
            "src/bot.py",
            "src/notes.bin",
            "venv/lib/site.py",
            "__pycache__/main.py",
            ".git/hook.py",
            ".env",
        ] {
            fs::write(root.join(file), "x\n").expect("write");
        }

        let extensions = strings(&["py", "env"]);
        let excluded = strings(&["venv", "__pycache__", ".git"]);
        let scan = collect_files(
            root,
            FileFilter {
                extensions: &extensions,
                excluded_dirs: &excluded,
            },
        );
        assert!(scan.unreadable.is_empty());
        let rel: Vec<String> = scan
            .files
            .iter()
            .map(|p| p.strip_prefix(root).expect("prefix").display().to_string())
            .collect();
        assert_eq!(rel, vec![".env", "main.py", "src/bot.py"]);
    }

    #[test]
    fn unwalkable_root_is_reported_not_raised() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("gone");
        let extensions = strings(&["py"]);

        let scan = collect_files(
            &missing,
            FileFilter {
                extensions: &extensions,
                excluded_dirs: &[],
            },
        );

        assert!(scan.files.is_empty());
        assert_eq!(scan.unreadable.len(), 1);
        assert_eq!(scan.unreadable[0].path, missing);
    }

    #[test]
    fn parallel_map_preserves_order() {
        let items: Vec<u32> = (0..100).collect();
        let doubled = parallel_map(&items, |n| n * 2);
        assert_eq!(doubled, (0..100).map(|n| n * 2).collect::<Vec<_>>());
        assert!(parallel_map(&Vec::<u32>::new(), |n| *n).is_empty());
    }
}
