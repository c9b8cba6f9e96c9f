//! # Media Probe Module
//!
//! Classifica un file media come "riproducibile nativamente" oppure
//! "da convertire", usando `ffprobe`.
//!
//! ## Politica di decisione:
//! Un input è nativo se e solo se:
//! 1. Il container corrisponde al formato target (format_name di ffprobe + estensione)
//! 2. Tutti gli stream video usano codec supportati dal player inline
//! 3. Tutti gli stream audio usano codec supportati
//! 4. Non ci sono altri stream se non sottotitoli webvtt
//!
//! ## Errori:
//! `ProbeError` (media corrotto, nessuno stream video) non è ritentabile:
//! il riferimento resta non convertito e marcato.

use crate::config::TargetFormat;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Outcome of probing a single file
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub natively_playable: bool,
    /// Container names as reported by the probe (`matroska,webm`, `mov,mp4,m4a,3gp,3g2,mj2`, ...)
    pub container: String,
    pub video_codec: String,
    /// Codecs of every audio/video stream, in stream order
    pub codecs: Vec<String>,
    pub duration_micros: u64,
}

/// Inspects media files; the only process boundary besides the transcoder
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<ProbeReport>;
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
}

impl ProbeReport {
    /// Build a report from ffprobe's `-print_format json -show_format -show_streams` output
    pub fn from_ffprobe_json(path: &Path, json: &str, target: &TargetFormat) -> Result<Self> {
        let probe_error = |reason: String| PipelineError::Probe {
            path: path.display().to_string(),
            reason,
        };

        let output: FfprobeOutput =
            serde_json::from_str(json).map_err(|e| probe_error(format!("invalid ffprobe output: {}", e)))?;
        let format = output
            .format
            .ok_or_else(|| probe_error("no container information".to_string()))?;
        let container = format.format_name.unwrap_or_default();

        let duration_micros = format
            .duration
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d >= 0.0)
            .map(|d| (d * 1_000_000.0) as u64)
            .unwrap_or(0);

        let mut codecs = Vec::new();
        let mut video_codec = None;
        let mut streams_supported = true;

        for stream in &output.streams {
            let codec = stream.codec_name.clone().unwrap_or_default().to_lowercase();
            match stream.codec_type.as_deref() {
                Some("video") => {
                    if video_codec.is_none() {
                        video_codec = Some(codec.clone());
                    }
                    streams_supported &= target.video_codecs.iter().any(|c| *c == codec);
                    codecs.push(codec);
                }
                Some("audio") => {
                    streams_supported &= target.audio_codecs.iter().any(|c| *c == codec);
                    codecs.push(codec);
                }
                Some("subtitle") if codec == "webvtt" => {}
                _ => streams_supported = false,
            }
        }

        let video_codec = video_codec.ok_or_else(|| probe_error("no video stream".to_string()))?;

        let container_matches = container
            .split(',')
            .any(|name| name.trim().eq_ignore_ascii_case(&target.container));
        let extension_matches = path
            .extension()
            .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(&target.extension))
            .unwrap_or(false);

        Ok(ProbeReport {
            natively_playable: container_matches && extension_matches && streams_supported,
            container,
            video_codec,
            codecs,
            duration_micros,
        })
    }
}

/// `MediaProbe` backed by the ffprobe binary
pub struct FfprobeProbe {
    program: PathBuf,
    target: TargetFormat,
}

impl FfprobeProbe {
    pub fn new(program: PathBuf, target: TargetFormat) -> Self {
        Self { program, target }
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe(&self, path: &Path) -> Result<ProbeReport> {
        if !path.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not a readable file", path.display()),
            )
            .into());
        }

        let output = tokio::process::Command::new(&self.program)
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                PipelineError::MissingDependency(format!("failed to execute {}: {}", self.program.display(), e))
            })?;

        if !output.status.success() {
            return Err(PipelineError::Probe {
                path: path.display().to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let report = ProbeReport::from_ffprobe_json(path, &String::from_utf8_lossy(&output.stdout), &self.target)?;
        debug!(
            "Probed {}: container={} codecs={:?} native={}",
            path.display(),
            report.container,
            report.codecs,
            report.natively_playable
        );
        Ok(report)
    }
}
