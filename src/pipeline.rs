//! # Embed Pipeline Orchestrator
//!
//! Orchestratore che collega probe, fingerprint, scheduler e patcher.
//!
//! ## Flusso per ogni nuovo riferimento:
//! 1. `MediaProbe` classifica il file (nativo o da convertire)
//! 2. Nativo → il riferimento resta com'è
//! 3. Altrimenti `Fingerprinter` calcola l'identità del contenuto
//! 4. `ConversionScheduler` risponde dalla cache o accoda/aggancia un job
//! 5. A conversione riuscita `FieldPatcher` riscrive il riferimento nel campo
//! 6. Su errore di conversione il markup originale resta intatto
//! 7. Un file non analizzabile viene marcato `data-inline-video-status="failed"`
//!
//! Le attese sui job girano in task separati: il chiamante (l'editor) non
//! resta mai bloccato sulla conversione.

use crate::cache::{CacheEntry, ConversionCache};
use crate::config::Config;
use crate::document::DocumentField;
use crate::error::{PipelineError, Result};
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::patcher::{EmbedSource, FieldPatcher, MediaReference};
use crate::platform;
use crate::player_config::{ConfigResolver, GlobalConfig, PlayerOverride};
use crate::probe::{FfprobeProbe, MediaProbe};
use crate::scheduler::{Admission, ConversionRequest, ConversionScheduler, SchedulerSettings};
use crate::transcoder::FfmpegTranscoder;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What happened to a newly added reference
#[derive(Debug)]
pub enum Submission {
    /// Plays inline as-is
    Native,
    /// Already converted; the field has been patched
    Patched(CacheEntry),
    /// Conversion in progress; the field is patched when it finishes
    Pending(PendingPatch),
}

/// Background patch of one reference
#[derive(Debug)]
pub struct PendingPatch {
    fingerprint: Fingerprint,
    handle: JoinHandle<Result<CacheEntry>>,
}

impl PendingPatch {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Wait for the conversion and the patch
    pub async fn wait(self) -> Result<CacheEntry> {
        self.handle
            .await
            .map_err(|e| PipelineError::State(format!("patch task failed: {}", e)))?
    }
}

struct PendingReference {
    fingerprint: Fingerprint,
    source: PathBuf,
}

struct Shared {
    global: RwLock<Arc<GlobalConfig>>,
    /// Reference id → its pending conversion
    pending: Mutex<HashMap<String, PendingReference>>,
    artifact_mime: String,
}

impl Shared {
    fn global(&self) -> Arc<GlobalConfig> {
        self.global.read().clone()
    }

    fn artifact_source(&self, entry: &CacheEntry) -> EmbedSource {
        EmbedSource {
            path: entry.artifact.clone(),
            mime_type: self.artifact_mime.clone(),
            poster: entry.poster.clone(),
        }
    }
}

pub struct Pipeline {
    probe: Arc<dyn MediaProbe>,
    fingerprinter: Fingerprinter,
    scheduler: ConversionScheduler,
    shared: Arc<Shared>,
}

impl Pipeline {
    pub fn new(
        probe: Arc<dyn MediaProbe>,
        scheduler: ConversionScheduler,
        global: GlobalConfig,
        artifact_mime: impl Into<String>,
    ) -> Self {
        Self {
            probe,
            fingerprinter: Fingerprinter::new(),
            scheduler,
            shared: Arc::new(Shared {
                global: RwLock::new(Arc::new(global)),
                pending: Mutex::new(HashMap::new()),
                artifact_mime: artifact_mime.into(),
            }),
        }
    }

    /// Build the ffmpeg-backed pipeline described by `config`
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let ffmpeg = platform::resolve_tool("ffmpeg", config.ffmpeg_path.as_deref())?;
        let ffprobe = platform::resolve_tool("ffprobe", config.ffprobe_path.as_deref())?;

        tokio::fs::create_dir_all(&config.artifact_dir).await?;
        let cache = ConversionCache::open(config.cache_index_path()).await?;
        info!(
            "📦 Conversion cache: {} entries in {}",
            cache.len(),
            config.artifact_dir.display()
        );

        let transcoder = FfmpegTranscoder::new(
            ffmpeg,
            config.encoder.clone(),
            config.target.container.clone(),
            config.timeout(),
        );
        let probe = FfprobeProbe::new(ffprobe, config.target.clone());
        let scheduler = ConversionScheduler::start(
            cache,
            Arc::new(transcoder),
            SchedulerSettings::from_config(config),
        );

        Ok(Self::new(
            Arc::new(probe),
            scheduler,
            GlobalConfig::new(config.player.to_override()),
            config.target.mime_type.clone(),
        ))
    }

    pub fn scheduler(&self) -> &ConversionScheduler {
        &self.scheduler
    }

    /// Current global player configuration snapshot
    pub fn global_config(&self) -> Arc<GlobalConfig> {
        self.shared.global()
    }

    /// Replace the global player configuration.
    ///
    /// Only future resolutions see the new values; embeds already written keep theirs.
    pub fn update_global_config(&self, values: PlayerOverride) -> Arc<GlobalConfig> {
        let mut global = self.shared.global.write();
        let next = Arc::new(global.updated(values));
        info!("Global player config updated to version {}", next.version());
        *global = next.clone();
        next
    }

    /// Markup for a freshly embedded reference
    pub fn render(&self, reference: &MediaReference) -> String {
        let config = ConfigResolver::resolve(&self.shared.global(), &PlayerOverride::default());
        FieldPatcher::render_embed(&reference.id, &reference.embed_source(), &config)
    }

    /// A reference was added to `field`.
    ///
    /// Probe and queue errors return immediately. A probe failure also flags
    /// the embed as failed; queue errors leave the field untouched.
    pub async fn reference_added(
        &self,
        field: Arc<dyn DocumentField>,
        reference: &MediaReference,
    ) -> Result<Submission> {
        let report = match self.probe.probe(&reference.source).await {
            Ok(report) => report,
            Err(e) => {
                warn!("⚠️  Cannot probe {}: {}", reference.source.display(), e);
                if let Err(flag_error) = FieldPatcher::flag_failed(field.as_ref(), &reference.id).await {
                    warn!("Could not flag {} as failed: {}", reference.id, flag_error);
                }
                return Err(e);
            }
        };
        if report.natively_playable {
            debug!("{} plays natively ({})", reference.source.display(), report.container);
            return Ok(Submission::Native);
        }

        let (fingerprint, source_size) = self.fingerprinter.fingerprint(&reference.source).await?;
        let request = ConversionRequest {
            fingerprint: fingerprint.clone(),
            source: reference.source.clone(),
            source_size,
            duration_micros: report.duration_micros,
        };

        let ticket = match self.scheduler.enqueue(request).await? {
            Admission::Cached(entry) => {
                let source = self.shared.artifact_source(&entry);
                FieldPatcher::patch_field(field.as_ref(), &reference.id, &source, &self.shared.global()).await?;
                info!("♻️  {} reused {}", reference.id, entry.artifact.display());
                return Ok(Submission::Patched(entry));
            }
            Admission::Queued(ticket) | Admission::Attached(ticket) => ticket,
        };

        self.shared.pending.lock().insert(
            reference.id.clone(),
            PendingReference {
                fingerprint: fingerprint.clone(),
                source: reference.source.clone(),
            },
        );

        let shared = self.shared.clone();
        let id = reference.id.clone();
        let handle = tokio::spawn(async move {
            let outcome = ticket.wait().await;
            shared.pending.lock().remove(&id);

            let entry = outcome.map_err(|e| {
                warn!("⚠️  Keeping original markup for {}: {}", id, e);
                e
            })?;

            let source = shared.artifact_source(&entry);
            match FieldPatcher::patch_field(field.as_ref(), &id, &source, &shared.global()).await {
                Ok(_) => {
                    info!("✅ Patched {} -> {}", id, entry.artifact.display());
                    Ok(entry)
                }
                Err(e) => {
                    warn!("Discarding conversion result for {}: {}", id, e);
                    Err(e)
                }
            }
        });

        Ok(Submission::Pending(PendingPatch { fingerprint, handle }))
    }

    /// A reference was removed from its field.
    ///
    /// Cancels the conversion when no other pending reference needs the same content.
    pub fn reference_removed(&self, id: &str) -> bool {
        let removed = {
            let mut pending = self.shared.pending.lock();
            let Some(removed) = pending.remove(id) else {
                return false;
            };
            if pending.values().any(|other| other.source == removed.source) {
                debug!("{} removed, {} still embedded elsewhere", id, removed.source.display());
            } else {
                self.fingerprinter.forget(&removed.source);
            }
            if pending.values().any(|other| other.fingerprint == removed.fingerprint) {
                debug!("{} removed, conversion still needed by another reference", id);
                return false;
            }
            removed
        };
        self.scheduler.cancel(&removed.fingerprint)
    }

    /// Number of references waiting for a conversion
    pub fn pending_references(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}
