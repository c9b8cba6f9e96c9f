//! # Configuration Management Module
//!
//! Questo modulo gestisce la configurazione della pipeline di conversione.
//!
//! ## Responsabilità:
//! - Definisce la struct `Config` con tutti i parametri della pipeline
//! - Fornisce validazione dei parametri di input
//! - Supporta caricamento/salvataggio da/verso file JSON
//! - Fornisce valori di default sensati per tutti i parametri
//!
//! ## Parametri di configurazione:
//! - `artifact_dir`: Directory dei file convertiti e dell'indice cache
//! - `workers`: Numero massimo di conversioni parallele (default: 2)
//! - `max_queue_depth`: Job vivi (queued + running) oltre i quali si rifiuta (default: 8)
//! - `max_attempts`: Tentativi per fingerprint prima del fallimento permanente (default: 3)
//! - `timeout_secs`: Timeout per singola conversione (default: 600)
//! - `job_grace_secs`: Permanenza dei job terminati nella tabella (default: 300)
//! - `target`: Container e codec riproducibili nativamente (default: WebM VP8/VP9/AV1 + Opus/Vorbis)
//! - `encoder`: Parametri passati a ffmpeg
//! - `player`: Impostazioni globali del player
//!
//! ## Esempio:
//! ```rust,ignore
//! let config = Config {
//!     workers: 4,
//!     max_attempts: 5,
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use crate::error::{PipelineError, Result};
use crate::player_config::PlayerSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Container/codec combination the inline player decodes without conversion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetFormat {
    /// Short container name as reported by ffprobe (`format_name`)
    pub container: String,
    /// File extension of produced artifacts
    pub extension: String,
    /// MIME type written into the `<source type>` attribute
    pub mime_type: String,
    pub video_codecs: Vec<String>,
    pub audio_codecs: Vec<String>,
}

impl Default for TargetFormat {
    fn default() -> Self {
        Self {
            container: "webm".to_string(),
            extension: "webm".to_string(),
            mime_type: "video/webm".to_string(),
            video_codecs: vec!["vp8".to_string(), "vp9".to_string(), "av1".to_string()],
            audio_codecs: vec!["opus".to_string(), "vorbis".to_string()],
        }
    }
}

/// Encoder settings for the external conversion tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub video_codec: String,
    pub audio_codec: String,
    /// Constant quality factor (0-63 for libvpx)
    pub crf: u8,
    /// Audio bitrate
    pub audio_bitrate: String,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            video_codec: "libvpx-vp9".to_string(),
            audio_codec: "libopus".to_string(),
            crf: 32,
            audio_bitrate: "128k".to_string(),
        }
    }
}

/// Configuration for the conversion pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding converted artifacts and the cache index
    pub artifact_dir: PathBuf,
    /// Number of parallel conversions
    pub workers: usize,
    /// Live jobs (queued + running) beyond which enqueue is rejected
    pub max_queue_depth: usize,
    /// Attempts per fingerprint before it is permanently failed
    pub max_attempts: u32,
    /// Wall-clock limit for a single conversion, in seconds
    pub timeout_secs: u64,
    /// How long terminal jobs stay queryable, in seconds
    pub job_grace_secs: u64,
    /// Extract a poster frame after each successful conversion
    pub generate_posters: bool,
    /// Explicit ffmpeg binary (None = resolve from PATH)
    pub ffmpeg_path: Option<PathBuf>,
    /// Explicit ffprobe binary (None = resolve from PATH)
    pub ffprobe_path: Option<PathBuf>,
    pub target: TargetFormat,
    pub encoder: EncoderSettings,
    /// Global player settings
    pub player: PlayerSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            artifact_dir: default_artifact_dir(),
            workers: 2,
            max_queue_depth: 8,
            max_attempts: 3,
            timeout_secs: 600,
            job_grace_secs: 300,
            generate_posters: true,
            ffmpeg_path: None,
            ffprobe_path: None,
            target: TargetFormat::default(),
            encoder: EncoderSettings::default(),
            player: PlayerSettings::default(),
        }
    }
}

/// `<local data dir>/inline-video/artifacts`, falling back to the working directory
fn default_artifact_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("inline-video")
        .join("artifacts")
}

impl Config {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PipelineError::Validation(
                "Number of workers must be greater than 0".to_string(),
            ));
        }

        if self.max_queue_depth == 0 {
            return Err(PipelineError::Validation(
                "Max queue depth must be greater than 0".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(PipelineError::Validation(
                "Max attempts must be greater than 0".to_string(),
            ));
        }

        if self.timeout_secs == 0 {
            return Err(PipelineError::Validation(
                "Conversion timeout must be greater than 0".to_string(),
            ));
        }

        if self.encoder.crf > 63 {
            return Err(PipelineError::Validation(
                "CRF must be between 0 and 63".to_string(),
            ));
        }

        if self.target.extension.is_empty() || self.target.extension.contains('.') {
            return Err(PipelineError::Validation(format!(
                "Invalid target extension: '{}'",
                self.target.extension
            )));
        }

        if let Some(volume) = self.player.volume {
            if !volume.is_finite() {
                return Err(PipelineError::Validation(
                    "Player volume must be a finite number".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn job_grace(&self) -> Duration {
        Duration::from_secs(self.job_grace_secs)
    }

    /// Sidecar index file of the conversion cache
    pub fn cache_index_path(&self) -> PathBuf {
        self.artifact_dir.join(".inline-video-cache.json")
    }

    /// Load configuration from file
    pub async fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| PipelineError::Validation(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.workers = 0;
        assert!(config.validate().is_err());

        config.workers = 2;
        config.max_queue_depth = 0;
        assert!(config.validate().is_err());

        config.max_queue_depth = 2;
        config.encoder.crf = 64;
        assert!(config.validate().is_err());

        config.encoder.crf = 30;
        config.target.extension = ".webm".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_queue_depth, 8);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.timeout(), Duration::from_secs(600));
        assert_eq!(config.target.container, "webm");
        assert!(config.artifact_dir.ends_with("inline-video/artifacts"));
    }

    #[tokio::test]
    async fn test_config_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");

        let original_config = Config {
            artifact_dir: temp_dir.path().join("artifacts"),
            workers: 3,
            max_attempts: 5,
            timeout_secs: 30,
            player: PlayerSettings {
                autoplay: Some(false),
                size: Some("640x360".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        original_config.save_to_file(&config_path).await.unwrap();
        let loaded_config = Config::from_file(&config_path).await.unwrap();

        assert_eq!(loaded_config.artifact_dir, temp_dir.path().join("artifacts"));
        assert_eq!(loaded_config.workers, 3);
        assert_eq!(loaded_config.max_attempts, 5);
        assert_eq!(loaded_config.timeout_secs, 30);
        assert_eq!(loaded_config.player.autoplay, Some(false));
        assert_eq!(loaded_config.player.size.as_deref(), Some("640x360"));
    }

    #[tokio::test]
    async fn test_partial_config_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        tokio::fs::write(&config_path, r#"{"workers": 4, "player": {"loop": false}}"#)
            .await
            .unwrap();

        let config = Config::from_file(&config_path).await.unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_queue_depth, 8);
        assert_eq!(config.player.loop_playback, Some(false));
    }

    #[test]
    fn test_invalid_config_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        std::fs::write(&config_path, r#"{"workers": 0}"#).unwrap();

        let result = tokio_test::block_on(Config::from_file(&config_path));
        tokio_test::assert_err!(&result);
        assert!(matches!(result, Err(PipelineError::Validation(_))));

        let missing = tokio_test::block_on(Config::from_file(&temp_dir.path().join("absent.json")));
        tokio_test::assert_ok!(missing);
    }
}
