//! Scanner module for collecting video files from command-line arguments.
//!
//! Files are taken as given. Directories are walked recursively, skipping
//! hidden directories, and filtered by the configured video extensions.

use crate::config::Config;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Rules deciding which files are picked up from directories
#[derive(Debug, Clone, PartialEq)]
pub struct ScanFilter {
    /// Lowercase extensions without the dot
    pub extensions: Vec<String>,
    /// Names starting with this prefix are skipped when set
    pub skip_prefix: Option<String>,
}

impl ScanFilter {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            extensions: cfg
                .scan
                .video_extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
            skip_prefix: cfg
                .output
                .ignore_temp_files
                .then(|| cfg.output.temp_file_prefix.clone())
                .filter(|prefix| !prefix.is_empty()),
        }
    }

    /// Checks if a file has a video extension (case-insensitive).
    pub fn is_video_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext_lower = ext.to_lowercase();
                self.extensions.iter().any(|e| *e == ext_lower)
            })
            .unwrap_or(false)
    }

    /// Checks if a file is a temporary output of a job.
    pub fn is_temp_file(&self, path: &Path) -> bool {
        match (&self.skip_prefix, path.file_name().and_then(|n| n.to_str())) {
            (Some(prefix), Some(name)) => name.starts_with(prefix.as_str()),
            _ => false,
        }
    }

    pub fn accepts(&self, path: &Path) -> bool {
        self.is_video_file(path) && !self.is_temp_file(path)
    }
}

/// Collects the files to submit for the given arguments.
///
/// This function:
/// - Keeps file arguments as given, in order
/// - Recursively walks directory arguments, in sorted order
/// - Skips hidden directories (names starting with `.`)
/// - Filters directory entries by extension and temporary-file prefix
/// - Ignores arguments that do not exist
pub fn collect_videos(args: &[PathBuf], filter: &ScanFilter) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for arg in args {
        if arg.is_file() {
            files.push(arg.clone());
            continue;
        }
        if !arg.is_dir() {
            tracing::warn!(path = %arg.display(), "not a file or directory, skipping");
            continue;
        }

        let walker = WalkDir::new(arg)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                // Skip hidden directories (but allow hidden files to be filtered later)
                if entry.file_type().is_dir() && entry.depth() > 0 {
                    if let Some(name) = entry.file_name().to_str() {
                        if name.starts_with('.') {
                            return false;
                        }
                    }
                }
                true
            });

        for entry in walker.filter_map(|e| e.ok()) {
            if entry.file_type().is_file() && filter.accepts(entry.path()) {
                files.push(entry.into_path());
            }
        }
    }

    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    fn filter() -> ScanFilter {
        ScanFilter::from_config(&Config::default())
    }

    #[test]
    fn test_filter_from_default_config() {
        let f = filter();
        assert_eq!(f.extensions, vec!["mp4", "avi", "mkv"]);
        assert_eq!(f.skip_prefix.as_deref(), Some("ffmpeg_temp_"));

        let mut cfg = Config::default();
        cfg.output.ignore_temp_files = false;
        assert_eq!(ScanFilter::from_config(&cfg).skip_prefix, None);
    }

    #[test]
    fn test_collect_walks_directories() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("season 1")).unwrap();
        fs::create_dir_all(root.join(".hidden")).unwrap();
        fs::write(root.join("b.MKV"), b"").unwrap();
        fs::write(root.join("a.mp4"), b"").unwrap();
        fs::write(root.join("notes.txt"), b"").unwrap();
        fs::write(root.join("ffmpeg_temp_abc.mkv"), b"").unwrap();
        fs::write(root.join("season 1").join("e01.avi"), b"").unwrap();
        fs::write(root.join(".hidden").join("secret.mkv"), b"").unwrap();

        let files = collect_videos(&[root.to_path_buf()], &filter());
        assert_eq!(
            files,
            vec![
                root.join("a.mp4"),
                root.join("b.MKV"),
                root.join("season 1").join("e01.avi"),
            ]
        );
    }

    #[test]
    fn test_explicit_files_are_kept_as_given() {
        let dir = TempDir::new().unwrap();
        let odd = dir.path().join("clip.webm");
        fs::write(&odd, b"").unwrap();
        let missing = dir.path().join("missing.mkv");

        let files = collect_videos(&[odd.clone(), missing], &filter());
        assert_eq!(files, vec![odd]);
    }

    #[test]
    fn test_temp_files_kept_when_not_ignored() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("ffmpeg_temp_abc.mkv"), b"").unwrap();

        let mut cfg = Config::default();
        cfg.output.ignore_temp_files = false;
        let files = collect_videos(&[dir.path().to_path_buf()], &ScanFilter::from_config(&cfg));
        assert_eq!(files.len(), 1);
    }

    // **Property: extension matching is case-insensitive**
    //
    // *For any* file stem and casing of a configured extension, the file is
    // recognized as a video.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_extension_case_insensitive(
            stem in "[a-zA-Z0-9_ -]{1,20}",
            ext_idx in 0usize..3,
            upper_mask in proptest::collection::vec(proptest::bool::ANY, 3),
        ) {
            let f = filter();
            let ext: String = f.extensions[ext_idx]
                .chars()
                .zip(upper_mask.iter())
                .map(|(c, up)| if *up { c.to_ascii_uppercase() } else { c })
                .collect();
            let path = PathBuf::from(format!("/media/{}.{}", stem, ext));
            prop_assert!(f.is_video_file(&path));
            let txt_path = PathBuf::from(format!("/media/{}.txt", stem));
            prop_assert!(!f.is_video_file(&txt_path));
        }
    }
}
