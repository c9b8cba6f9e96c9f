//! # Transcoder Module
//!
//! Questo modulo incapsula una singola invocazione del tool di conversione esterno.
//!
//! ## Responsabilità:
//! - Costruisce gli argomenti di FFmpeg dal formato target e dai parametri encoder
//! - Esegue il processo con timeout wall-clock e cancellazione esplicita
//! - Cattura exit code e coda dello stderr
//! - Estrae un frame poster (best-effort)
//!
//! ## Atomicità:
//! FFmpeg scrive sempre su un file temporaneo nella stessa directory del target
//! (`.inline-video-*.part`). Solo in caso di successo il temp viene rinominato
//! atomicamente sul path finale; su errore, timeout o cancellazione viene rimosso.
//! Un processo ucciso lascia al massimo un `.part`, mai un artifact troncato.
//!
//! ## Pipeline FFmpeg:
//! - Codec video: libvpx-vp9 (CRF configurabile, `-b:v 0`)
//! - Codec audio: libopus
//! - Muxer esplicito (`-f webm`) perché il temp ha estensione `.part`

use crate::config::EncoderSettings;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lines of stderr kept for error reports
const STDERR_TAIL_LINES: usize = 20;
/// Bytes of stderr kept in memory while the process runs
const STDERR_KEEP_BYTES: usize = 16 * 1024;

/// Outcome of a successful external conversion
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionResult {
    pub exit_code: i32,
    pub duration_spent: Duration,
    pub stderr_tail: String,
}

/// A single external conversion.
///
/// Implementations must either publish exactly one complete file at `target`
/// or leave no file there at all.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn convert(&self, source: &Path, target: &Path, cancel: &CancellationToken) -> Result<ConversionResult>;

    /// Extract one frame at `at` into `target`. Returns `false` when posters are unsupported.
    async fn extract_poster(
        &self,
        _source: &Path,
        _target: &Path,
        _at: Duration,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(false)
    }
}

/// `Transcoder` backed by the ffmpeg binary
pub struct FfmpegTranscoder {
    program: PathBuf,
    encoder: EncoderSettings,
    muxer: String,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(program: PathBuf, encoder: EncoderSettings, muxer: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program,
            encoder,
            muxer: muxer.into(),
            timeout,
        }
    }

    /// Arguments for converting `source` into `output`
    pub fn conversion_args(&self, source: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-nostdin", "-y", "-i"]
            .iter()
            .map(OsString::from)
            .collect();
        args.push(source.as_os_str().to_owned());

        let crf = self.encoder.crf.to_string();
        let tail = [
            "-map", "0:v:0",
            "-map", "0:a?",
            "-c:v", self.encoder.video_codec.as_str(),
            "-crf", crf.as_str(),
            "-b:v", "0",
            "-c:a", self.encoder.audio_codec.as_str(),
            "-b:a", self.encoder.audio_bitrate.as_str(),
            "-f", self.muxer.as_str(),
        ];
        args.extend(tail.iter().map(OsString::from));
        args.push(output.as_os_str().to_owned());
        args
    }

    /// Arguments for grabbing a single PNG frame at `at`
    pub fn poster_args(&self, source: &Path, output: &Path, at: Duration) -> Vec<OsString> {
        let seek = format!("{:.3}", at.as_secs_f64());
        let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-nostdin", "-y", "-ss", seek.as_str(), "-i"]
            .iter()
            .map(OsString::from)
            .collect();
        args.push(source.as_os_str().to_owned());
        args.extend(
            ["-frames:v", "1", "-update", "1", "-f", "image2", "-c:v", "png"]
                .iter()
                .map(OsString::from),
        );
        args.push(output.as_os_str().to_owned());
        args
    }

    async fn run_to_temp(
        &self,
        args_for: impl FnOnce(&Path) -> Vec<OsString>,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<ConversionResult> {
        let dir = target.parent().unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(dir).await?;

        let temp = tempfile::Builder::new()
            .prefix(".inline-video-")
            .suffix(".part")
            .tempfile_in(dir)?
            .into_temp_path();

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(args_for(&*temp));

        // temp is removed on drop for every early return below
        let result = run_process(cmd, self.timeout, cancel).await?;

        let written = tokio::fs::metadata(&temp).await.map(|m| m.len()).unwrap_or(0);
        if written == 0 {
            return Err(PipelineError::TranscodeFailed {
                exit_code: Some(result.exit_code),
                stderr_tail: "conversion produced an empty file".to_string(),
            });
        }

        temp.persist(target).map_err(|e| PipelineError::from(e.error))?;
        Ok(result)
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn convert(&self, source: &Path, target: &Path, cancel: &CancellationToken) -> Result<ConversionResult> {
        debug!(
            "🎬 Converting {} -> {} ({} / {}, CRF {})",
            source.display(),
            target.display(),
            self.encoder.video_codec,
            self.encoder.audio_codec,
            self.encoder.crf
        );

        let result = self
            .run_to_temp(|temp| self.conversion_args(source, temp), target, cancel)
            .await?;

        debug!(
            "✅ Conversion of {} finished in {:.1}s",
            source.display(),
            result.duration_spent.as_secs_f64()
        );
        Ok(result)
    }

    async fn extract_poster(
        &self,
        source: &Path,
        target: &Path,
        at: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.run_to_temp(|temp| self.poster_args(source, temp, at), target, cancel)
            .await?;
        Ok(true)
    }
}

enum ProcessOutcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Run a prepared command to completion, enforcing `timeout` and `cancel`
pub async fn run_process(
    mut cmd: tokio::process::Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ConversionResult> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let program = cmd.as_std().get_program().to_string_lossy().to_string();
    let mut child = cmd
        .spawn()
        .map_err(|e| PipelineError::MissingDependency(format!("failed to execute {}: {}", program, e)))?;

    let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(read_tail(stderr)));

    let outcome = tokio::select! {
        status = child.wait() => ProcessOutcome::Exited(status),
        _ = tokio::time::sleep(timeout) => ProcessOutcome::TimedOut,
        _ = cancel.cancelled() => ProcessOutcome::Cancelled,
    };

    let status = match outcome {
        ProcessOutcome::Exited(status) => status?,
        ProcessOutcome::TimedOut => {
            warn!("{} exceeded {:?}, killing it", program, timeout);
            let _ = child.kill().await;
            if let Some(task) = stderr_task {
                task.abort();
            }
            return Err(PipelineError::TranscodeTimeout {
                seconds: timeout.as_secs(),
            });
        }
        ProcessOutcome::Cancelled => {
            debug!("Cancelling {}", program);
            let _ = child.kill().await;
            if let Some(task) = stderr_task {
                task.abort();
            }
            return Err(PipelineError::Cancelled);
        }
    };

    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };
    let stderr_tail = tail_lines(&String::from_utf8_lossy(&stderr), STDERR_TAIL_LINES);

    if !status.success() {
        return Err(PipelineError::TranscodeFailed {
            exit_code: status.code(),
            stderr_tail,
        });
    }

    Ok(ConversionResult {
        exit_code: status.code().unwrap_or(0),
        duration_spent: start.elapsed(),
        stderr_tail,
    })
}

async fn read_tail(mut reader: impl AsyncRead + Unpin) -> Vec<u8> {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                kept.extend_from_slice(&chunk[..n]);
                if kept.len() > STDERR_KEEP_BYTES * 2 {
                    kept.drain(..kept.len() - STDERR_KEEP_BYTES);
                }
            }
        }
    }
    kept
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(count)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcoder(program: PathBuf, timeout: Duration) -> FfmpegTranscoder {
        FfmpegTranscoder::new(program, EncoderSettings::default(), "webm", timeout)
    }

    #[test]
    fn test_conversion_args() {
        let t = transcoder(PathBuf::from("ffmpeg"), Duration::from_secs(60));
        let args: Vec<String> = t
            .conversion_args(Path::new("in.mov"), Path::new("out.part"))
            .into_iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect();

        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "in.mov");
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "libvpx-vp9"));
        assert!(args.windows(2).any(|w| w[0] == "-crf" && w[1] == "32"));
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "webm"));
        assert!(args.contains(&"-y".to_string()));
        assert_eq!(args.last().unwrap(), "out.part");
    }

    #[test]
    fn test_poster_args_seek_before_input() {
        let t = transcoder(PathBuf::from("ffmpeg"), Duration::from_secs(60));
        let args: Vec<String> = t
            .poster_args(Path::new("in.webm"), Path::new("poster.part"), Duration::from_millis(2500))
            .into_iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect();

        let seek = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(seek < input);
        assert_eq!(args[seek + 1], "2.500");
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "png"));
    }

    #[test]
    fn test_tail_lines() {
        let text = (1..=30).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
        let tail = tail_lines(&text, 3);
        assert_eq!(tail, "line 28\nline 29\nline 30");
        assert_eq!(tail_lines("", 3), "");
    }

    #[tokio::test]
    async fn test_missing_program_is_missing_dependency() {
        let t = transcoder(PathBuf::from("/no/such/ffmpeg"), Duration::from_secs(5));
        let temp_dir = tempfile::TempDir::new().unwrap();
        let target = temp_dir.path().join("out.webm");

        let result = t.convert(Path::new("in.mov"), &target, &CancellationToken::new()).await;
        assert!(matches!(result, Err(PipelineError::MissingDependency(_))));
        assert!(!target.exists());
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        /// Fake ffmpeg: the output path is always the last argument
        fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\nfor last; do :; done\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn leftovers(dir: &Path) -> Vec<String> {
            std::fs::read_dir(dir)
                .unwrap()
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|n| n.ends_with(".part"))
                .collect()
        }

        #[tokio::test]
        async fn test_success_publishes_exactly_one_file() {
            let tools = TempDir::new().unwrap();
            let out = TempDir::new().unwrap();
            let program = script(tools.path(), "ok.sh", "printf converted > \"$last\"\nexit 0");
            let target = out.path().join("clip.webm");

            let result = transcoder(program, Duration::from_secs(10))
                .convert(Path::new("in.mov"), &target, &CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(result.exit_code, 0);
            assert_eq!(std::fs::read(&target).unwrap(), b"converted");
            assert!(leftovers(out.path()).is_empty());
        }

        #[tokio::test]
        async fn test_non_zero_exit_leaves_no_partial_file() {
            let tools = TempDir::new().unwrap();
            let out = TempDir::new().unwrap();
            let program = script(
                tools.path(),
                "fail.sh",
                "printf half > \"$last\"\necho 'in.mov: Invalid data found when processing input' >&2\nexit 1",
            );
            let target = out.path().join("clip.webm");

            let result = transcoder(program, Duration::from_secs(10))
                .convert(Path::new("in.mov"), &target, &CancellationToken::new())
                .await;

            match result {
                Err(PipelineError::TranscodeFailed { exit_code, stderr_tail }) => {
                    assert_eq!(exit_code, Some(1));
                    assert!(stderr_tail.contains("Invalid data"));
                }
                other => panic!("unexpected result: {:?}", other),
            }
            assert!(!target.exists());
            assert!(leftovers(out.path()).is_empty());
        }

        #[tokio::test]
        async fn test_timeout_kills_process() {
            let tools = TempDir::new().unwrap();
            let out = TempDir::new().unwrap();
            let program = script(tools.path(), "slow.sh", "printf half > \"$last\"\nsleep 5");
            let target = out.path().join("clip.webm");

            let started = Instant::now();
            let result = transcoder(program, Duration::from_millis(200))
                .convert(Path::new("in.mov"), &target, &CancellationToken::new())
                .await;

            assert!(matches!(result, Err(PipelineError::TranscodeTimeout { .. })));
            assert!(started.elapsed() < Duration::from_secs(4));
            assert!(!target.exists());
            assert!(leftovers(out.path()).is_empty());
        }

        #[tokio::test]
        async fn test_cancellation_kills_process() {
            let tools = TempDir::new().unwrap();
            let out = TempDir::new().unwrap();
            let program = script(tools.path(), "slow.sh", "sleep 5");
            let target = out.path().join("clip.webm");
            let cancel = CancellationToken::new();

            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                trigger.cancel();
            });

            let result = transcoder(program, Duration::from_secs(30))
                .convert(Path::new("in.mov"), &target, &cancel)
                .await;

            assert!(matches!(result, Err(PipelineError::Cancelled)));
            assert!(!target.exists());
        }

        #[tokio::test]
        async fn test_empty_output_is_failure() {
            let tools = TempDir::new().unwrap();
            let out = TempDir::new().unwrap();
            let program = script(tools.path(), "noop.sh", "exit 0");
            let target = out.path().join("clip.webm");

            let result = transcoder(program, Duration::from_secs(10))
                .convert(Path::new("in.mov"), &target, &CancellationToken::new())
                .await;

            assert!(matches!(result, Err(PipelineError::TranscodeFailed { .. })));
            assert!(!target.exists());
        }
    }
}
