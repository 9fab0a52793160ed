// --- Library scan ---------------------------------------------------------------
//
// Walks a directory tree and registers every media file in the catalog.
// Per-file problems are logged and skipped; only an unusable root is an error.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::db::Store;
use crate::error::{PlayoutError, Result};
use crate::probe::ProbeData;

pub const DEFAULT_EXTENSIONS: [&str; 5] = ["ts", "mp4", "mkv", "avi", "mov"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Register files only; the schedule picks them up from the catalog.
    CatalogOnly,
    /// Register and append each file to the play queue.
    CatalogAndQueue,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ScanReport {
    pub found: usize,
    pub cataloged: usize,
    pub queued: usize,
    pub failed: usize,
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let ext = ext.to_ascii_lowercase();
    extensions.iter().any(|a| *a == ext)
}

/// Normalize a user-supplied extension list (`".MP4"` -> `"mp4"`), falling
/// back to the defaults when it is empty.
pub fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    let cleaned: Vec<String> = extensions
        .iter()
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect();
    if cleaned.is_empty() {
        DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
    } else {
        cleaned
    }
}

/// Media files under `root`, sorted by path.
///
/// Symlinks are not followed, so a link back to an ancestor cannot make the
/// walk revisit (and re-catalog) the same files.
pub fn find_media_files(root: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(PlayoutError::NotFound(format!(
            "directory {}",
            root.display()
        )));
    }
    // The root itself must be readable; nested failures are only logged.
    std::fs::read_dir(root)?;

    let mut out = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("failed to read directory entry: {e}");
                continue;
            }
        };
        if entry.file_type().is_file() && has_extension(entry.path(), extensions) {
            out.push(entry.into_path());
        }
    }
    out.sort();
    Ok(out)
}

pub fn scan_directory(
    store: &Store,
    root: &Path,
    extensions: &[String],
    mode: ScanMode,
    probe: impl Fn(&Path) -> ProbeData,
) -> Result<ScanReport> {
    let extensions = normalize_extensions(extensions);
    info!(directory = %root.display(), extensions = ?extensions, "scanning directory for media");

    let files = find_media_files(root, &extensions)?;
    let mut report = ScanReport {
        found: files.len(),
        ..ScanReport::default()
    };

    for path in files {
        let entry = match store.catalog().register(&path, &probe) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %path.display(), "failed to catalog file: {e}");
                report.failed += 1;
                continue;
            }
        };
        report.cataloged += 1;

        if mode == ScanMode::CatalogAndQueue {
            match store.queue().enqueue(&entry.id, false) {
                Ok(_) => report.queued += 1,
                Err(e) => {
                    warn!(path = %path.display(), "failed to queue file: {e}");
                    report.failed += 1;
                }
            }
        }
    }

    info!(
        directory = %root.display(),
        found = report.found,
        cataloged = report.cataloged,
        queued = report.queued,
        failed = report.failed,
        "directory scan completed"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"\x47\x40\x00\x10").unwrap();
    }

    #[test]
    fn extensions_are_normalized() {
        assert_eq!(
            normalize_extensions(&[".MP4".to_string(), " ts ".to_string()]),
            vec!["mp4".to_string(), "ts".to_string()]
        );
        assert_eq!(normalize_extensions(&[]).len(), DEFAULT_EXTENSIONS.len());
    }

    #[test]
    fn finds_nested_media_case_insensitively() {
        let dir = tempfile::TempDir::new().unwrap();
        touch(&dir.path().join("b.ts"));
        touch(&dir.path().join("shows/season1/a.MKV"));
        touch(&dir.path().join("notes.txt"));
        touch(&dir.path().join("noext"));

        let found = find_media_files(dir.path(), &normalize_extensions(&[])).unwrap();
        let names: Vec<String> = found
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["b.ts".to_string(), "shows/season1/a.MKV".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_back_to_an_ancestor_is_not_followed() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        touch(&dir.path().join("shows/a.ts"));
        std::os::unix::fs::symlink(dir.path(), dir.path().join("shows/loop")).unwrap();

        let report = scan_directory(&store, dir.path(), &[], ScanMode::CatalogOnly, |_| {
            ProbeData::unknown()
        })
        .unwrap();
        assert_eq!(report.found, 1);
        assert_eq!(store.catalog().list().unwrap().len(), 1);
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = find_media_files(&dir.path().join("nope"), &normalize_extensions(&[])).unwrap_err();
        assert_eq!(err.reason(), "not_found");
    }

    #[test]
    fn scan_catalogs_and_queues_in_path_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        touch(&dir.path().join("02.ts"));
        touch(&dir.path().join("01.mp4"));

        let report = scan_directory(
            &store,
            dir.path(),
            &[],
            ScanMode::CatalogAndQueue,
            |_| ProbeData::with_duration(30),
        )
        .unwrap();
        assert_eq!(report.found, 2);
        assert_eq!(report.cataloged, 2);
        assert_eq!(report.queued, 2);

        let queue = store.queue().list().unwrap();
        let first = store.catalog().get(&queue[0].catalog_id).unwrap().unwrap();
        assert!(first.path.ends_with("01.mp4"));
        assert_eq!(first.duration_seconds, 30);
    }

    #[test]
    fn rescanning_does_not_duplicate_catalog_rows() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        touch(&dir.path().join("a.ts"));

        for _ in 0..2 {
            scan_directory(&store, dir.path(), &[], ScanMode::CatalogOnly, |_| ProbeData::unknown())
                .unwrap();
        }
        assert_eq!(store.catalog().list().unwrap().len(), 1);
        assert!(store.queue().list().unwrap().is_empty());
    }
}
