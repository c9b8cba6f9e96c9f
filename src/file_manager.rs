//! # File Management Module
//!
//! Operazioni sui file usate dalla pipeline e dalla CLI.
//!
//! ## Responsabilità:
//! - Lettura di size e modification time (pre-check del fingerprint)
//! - Discovery ricorsiva dei file video con `walkdir`
//! - Scrittura atomica (temp file nella stessa directory + rename)
//! - Formattazione human-readable delle dimensioni

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use walkdir::WalkDir;

/// Video extensions accepted as embed candidates
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v", "avi", "mkv", "webm", "wmv", "flv", "mpg", "mpeg", "ogv"];

/// Manages file operations and discovery
pub struct FileManager;

impl FileManager {
    /// Get information about a file (size and modification time in nanoseconds)
    pub async fn get_file_info(path: &Path) -> std::io::Result<(u64, u128)> {
        let metadata = fs::metadata(path).await?;
        let size = metadata.len();
        let modified = metadata
            .modified()?
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Ok((size, modified))
    }

    /// Find all video files below a path (or the path itself if it is a file)
    pub fn find_video_files(root: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| Self::is_video(p))
            .collect();
        files.sort();
        files
    }

    /// Check if a file is a video
    pub fn is_video(path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .map(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false)
    }

    /// Write `contents` to `path` through a temporary sibling and an atomic rename.
    ///
    /// Readers see either the previous file or the complete new one.
    pub async fn write_atomic(path: &Path, contents: Vec<u8>) -> std::io::Result<()> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let dir = path.parent().unwrap_or(Path::new("."));
            std::fs::create_dir_all(dir)?;
            let mut temp = tempfile::Builder::new()
                .prefix(".inline-video-")
                .suffix(".part")
                .tempfile_in(dir)?;
            temp.write_all(&contents)?;
            temp.as_file().sync_all()?;
            temp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(std::io::Error::other)?
    }

    /// Get human-readable file size
    pub fn format_size(size: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = size as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        if unit_index == 0 {
            format!("{} {}", size as u64, UNITS[unit_index])
        } else {
            format!("{:.2} {}", size, UNITS[unit_index])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_is_video() {
        assert!(FileManager::is_video(Path::new("clip.MOV")));
        assert!(FileManager::is_video(Path::new("dir/clip.mkv")));
        assert!(!FileManager::is_video(Path::new("poster.png")));
        assert!(!FileManager::is_video(Path::new("README")));
    }

    #[test]
    fn test_find_video_files() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("nested")).unwrap();
        std::fs::write(temp_dir.path().join("a.mov"), b"a").unwrap();
        std::fs::write(temp_dir.path().join("nested/b.mp4"), b"b").unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), b"c").unwrap();

        let files = FileManager::find_video_files(temp_dir.path());
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| FileManager::is_video(f)));
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.json");

        FileManager::write_atomic(&path, b"first".to_vec()).await.unwrap();
        FileManager::write_atomic(&path, b"second".to_vec()).await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let leftovers = std::fs::read_dir(temp_dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(FileManager::format_size(512), "512 B");
        assert_eq!(FileManager::format_size(2048), "2.00 KB");
        assert_eq!(FileManager::format_size(5 * 1024 * 1024), "5.00 MB");
    }
}
