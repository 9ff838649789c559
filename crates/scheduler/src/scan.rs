//! Scanner module for expanding input paths into media files.
//!
//! Explicit file arguments are taken as given; directories are walked
//! recursively for video files so the whole tree can be queued at once.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Video file extensions picked up from directories (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[".mkv", ".mp4", ".avi", ".mov", ".m4v", ".ts", ".m2ts"];

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Expands inputs into the ordered list of files to probe.
///
/// - Files are kept in argument order regardless of extension
/// - Directories contribute their video files, sorted by path
/// - Hidden subdirectories are skipped
/// - Paths that do not exist are returned separately
pub fn collect_inputs(inputs: &[PathBuf]) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut files = Vec::new();
    let mut missing = Vec::new();

    for input in inputs {
        if input.is_file() {
            files.push(input.clone());
            continue;
        }
        if !input.is_dir() {
            missing.push(input.clone());
            continue;
        }

        let walker = WalkDir::new(input)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                // Allow the root directory even if it starts with '.'
                !(entry.file_type().is_dir()
                    && entry.depth() > 0
                    && entry
                        .file_name()
                        .to_str()
                        .map(|name| name.starts_with('.'))
                        .unwrap_or(false))
            });

        for entry in walker.filter_map(|e| e.ok()) {
            if entry.file_type().is_file() && is_video_file(entry.path()) {
                files.push(entry.into_path());
            }
        }
    }

    (files, missing)
}
