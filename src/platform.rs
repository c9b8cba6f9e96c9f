//! # Tool Resolution
//!
//! Finds the external `ffmpeg` / `ffprobe` binaries:
//! 1. an explicit path from the configuration
//! 2. `INLINE_VIDEO_FFMPEG` / `INLINE_VIDEO_FFPROBE` environment variables
//! 3. a bundled `TOOLS_DIR`
//! 4. the system `PATH`

use crate::error::{PipelineError, Result};
use std::env;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Platform-specific executable name (`ffmpeg.exe` on Windows)
pub fn executable_name(base_name: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", base_name)
    } else {
        base_name.to_string()
    }
}

/// Resolve a tool, or fail with installation instructions
pub fn resolve_tool(base_name: &str, explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            debug!("Using configured {}: {}", base_name, path.display());
            return Ok(path.to_path_buf());
        }
        return Err(PipelineError::MissingDependency(format!(
            "configured {} does not exist: {}",
            base_name,
            path.display()
        )));
    }

    let env_key = format!("INLINE_VIDEO_{}", base_name.to_uppercase());
    if let Some(path) = env::var_os(&env_key).map(PathBuf::from) {
        if path.is_file() {
            debug!("Using {} from {}: {}", base_name, env_key, path.display());
            return Ok(path);
        }
    }

    let file_name = executable_name(base_name);

    if let Some(tools_dir) = env::var_os("TOOLS_DIR").map(PathBuf::from) {
        let bundled = tools_dir.join(&file_name);
        if bundled.is_file() {
            debug!("Using bundled {}: {}", base_name, bundled.display());
            return Ok(bundled);
        }
    }

    find_in_system_path(&file_name).ok_or_else(|| {
        PipelineError::MissingDependency(format!(
            "{} not found in PATH (install with: {})",
            base_name,
            install_instructions()
        ))
    })
}

fn find_in_system_path(file_name: &str) -> Option<PathBuf> {
    env::split_paths(&env::var_os("PATH")?)
        .map(|dir| dir.join(file_name))
        .find(|path| path.is_file())
}

fn install_instructions() -> &'static str {
    if cfg!(target_os = "linux") {
        "sudo apt-get install ffmpeg"
    } else if cfg!(target_os = "macos") {
        "brew install ffmpeg"
    } else {
        "download from https://ffmpeg.org/download.html"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_explicit_path_wins() {
        let temp_dir = TempDir::new().unwrap();
        let tool = temp_dir.path().join("my-ffmpeg");
        std::fs::write(&tool, b"").unwrap();

        assert_eq!(resolve_tool("ffmpeg", Some(&tool)).unwrap(), tool);
    }

    #[test]
    fn test_missing_explicit_path_is_missing_dependency() {
        let result = resolve_tool("ffmpeg", Some(Path::new("/nowhere/ffmpeg")));
        assert!(matches!(result, Err(PipelineError::MissingDependency(_))));
    }

    #[test]
    fn test_unknown_tool_is_missing_dependency() {
        let result = resolve_tool("inline-video-no-such-tool", None);
        assert!(matches!(result, Err(PipelineError::MissingDependency(_))));
    }

    #[test]
    fn test_executable_name() {
        let name = executable_name("ffprobe");
        assert!(name.starts_with("ffprobe"));
    }
}
