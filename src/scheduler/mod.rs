//! # Conversion Scheduler Module
//!
//! Coda di conversione con deduplica per fingerprint e concorrenza limitata.
//!
//! ## Responsabilità:
//! - Al massimo un job attivo (Queued o Running) per fingerprint
//! - Richieste duplicate agganciate al job esistente, risultato identico per tutti
//! - Al massimo N conversioni contemporanee (semaforo con N permessi)
//! - Dispatch FIFO in ordine di accodamento
//! - Backpressure: oltre `max_queue_depth` job vivi l'enqueue fallisce subito
//! - Limite di tentativi per fingerprint, nessun retry automatico
//!
//! ## Coordinamento:
//! Tabella dei job e cache sono protette da lock separati, presi sempre
//! nell'ordine tabella → cache. Il worker registra l'artifact in cache e
//! chiude il job nella stessa sezione critica, quindi un enqueue concorrente
//! vede o il job vivo o l'entry in cache, mai nessuno dei due.

pub mod job;
mod table;

pub use job::{Admission, ConversionJob, ConversionRequest, JobEvent, JobOutcome, JobStatus, JobTicket};

use crate::cache::{ArtifactRecord, CacheEntry, ConversionCache};
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::fingerprint::Fingerprint;
use crate::transcoder::Transcoder;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use table::{Admitted, Cancelled, ClaimedJob, JobTable};
use tokio::fs;
use tokio::sync::{broadcast, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Scheduler tuning, usually derived from [`Config`]
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub workers: usize,
    pub max_queue_depth: usize,
    pub max_attempts: u32,
    /// How long finished jobs stay visible to `status`
    pub job_grace: Duration,
    pub artifact_dir: PathBuf,
    pub extension: String,
    pub generate_posters: bool,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.workers,
            max_queue_depth: config.max_queue_depth,
            max_attempts: config.max_attempts,
            job_grace: config.job_grace(),
            artifact_dir: config.artifact_dir.clone(),
            extension: config.target.extension.clone(),
            generate_posters: config.generate_posters,
        }
    }

    /// Final artifact location for a fingerprint
    pub fn artifact_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.artifact_dir
            .join(format!("inline-video-{}.{}", fingerprint.short(), self.extension))
    }

    pub fn poster_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.artifact_dir
            .join(format!("inline-video-{}.png", fingerprint.short()))
    }
}

struct Inner {
    table: Mutex<JobTable>,
    cache: Mutex<ConversionCache>,
    /// Serializes index writes so a newer snapshot never loses to an older one
    persist_lock: tokio::sync::Mutex<()>,
    transcoder: Arc<dyn Transcoder>,
    settings: SchedulerSettings,
    slots: Arc<Semaphore>,
    wakeup: Notify,
    events: broadcast::Sender<JobEvent>,
    shutdown: CancellationToken,
}

/// Deduplicating, bounded conversion queue
pub struct ConversionScheduler {
    inner: Arc<Inner>,
}

impl ConversionScheduler {
    /// Start the dispatcher. Must be called inside a Tokio runtime.
    pub fn start(cache: ConversionCache, transcoder: Arc<dyn Transcoder>, settings: SchedulerSettings) -> Self {
        let workers = settings.workers.max(1);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            table: Mutex::new(JobTable::new(
                settings.max_queue_depth,
                settings.max_attempts,
                settings.job_grace,
            )),
            cache: Mutex::new(cache),
            persist_lock: tokio::sync::Mutex::new(()),
            transcoder,
            settings,
            slots: Arc::new(Semaphore::new(workers)),
            wakeup: Notify::new(),
            events,
            shutdown: CancellationToken::new(),
        });

        info!("🚀 Conversion scheduler started with {} workers", workers);
        tokio::spawn(dispatch(inner.clone()));
        Self { inner }
    }

    /// Submit a conversion request.
    ///
    /// Returns the cached artifact, a ticket on a new job, or a ticket on the
    /// job already converting the same content.
    pub async fn enqueue(&self, request: ConversionRequest) -> Result<Admission> {
        if self.inner.shutdown.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        self.inner.verify_cached(&request.fingerprint).await;

        let fingerprint = request.fingerprint.clone();
        let source = request.source.clone();
        let cancel = self.inner.shutdown.child_token();
        let admitted = {
            let mut table = self.inner.table.lock();
            // shutdown drains the table under this lock
            if self.inner.shutdown.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let cache = self.inner.cache.lock();
            table.admit(request, &cache, cancel)?
        };

        match admitted {
            Admitted::Cached(entry) => {
                debug!("♻️  Cache hit for {}", fingerprint.short());
                Ok(Admission::Cached(entry))
            }
            Admitted::Queued { ticket, attempt } => {
                info!(
                    "📥 Queued {} ({}) attempt {}",
                    source.display(),
                    fingerprint.short(),
                    attempt
                );
                let _ = self.inner.events.send(JobEvent::Queued { fingerprint, attempt });
                self.inner.wakeup.notify_one();
                Ok(Admission::Queued(ticket))
            }
            Admitted::Attached(ticket) => Ok(Admission::Attached(ticket)),
            Admitted::Parked(ticket) => {
                info!(
                    "⏳ {} ({}) waits for its cancelled conversion to stop",
                    source.display(),
                    fingerprint.short()
                );
                Ok(Admission::Queued(ticket))
            }
        }
    }

    /// Cancel the job for a fingerprint. Returns `false` when there is no live job.
    pub fn cancel(&self, fingerprint: &Fingerprint) -> bool {
        let cancelled = self.inner.table.lock().cancel(fingerprint);
        match cancelled {
            Cancelled::NotFound => false,
            Cancelled::Signalled => {
                info!("🛑 Cancelling running job {}", fingerprint.short());
                true
            }
            Cancelled::Dequeued { attempt, waiters } => {
                info!("🛑 Removed queued job {}", fingerprint.short());
                let _ = self.inner.events.send(JobEvent::Failed {
                    fingerprint: fingerprint.clone(),
                    attempt,
                    error: PipelineError::Cancelled,
                });
                for waiter in waiters {
                    let _ = waiter.send(Err(PipelineError::Cancelled));
                }
                true
            }
        }
    }

    /// Current or recently finished job for a fingerprint
    pub fn status(&self, fingerprint: &Fingerprint) -> Option<ConversionJob> {
        self.inner.table.lock().status(fingerprint)
    }

    /// Failed attempts recorded for a fingerprint
    pub fn attempts(&self, fingerprint: &Fingerprint) -> u32 {
        self.inner.table.lock().failed_attempts(fingerprint)
    }

    pub fn running_jobs(&self) -> usize {
        self.inner.table.lock().running()
    }

    pub fn queued_jobs(&self) -> usize {
        self.inner.table.lock().queued()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub fn cached(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.inner.cache.lock().lookup(fingerprint).cloned()
    }

    /// Entry count, total source bytes, total artifact bytes
    pub fn cache_stats(&self) -> (usize, u64, u64) {
        self.inner.cache.lock().stats()
    }

    /// Stop dispatching, fail queued jobs with `Cancelled` and kill running ones
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let waiters = self.inner.table.lock().drain_queued();
        if !waiters.is_empty() {
            info!("Shutting down with {} pending waiters", waiters.len());
        }
        for waiter in waiters {
            let _ = waiter.send(Err(PipelineError::Cancelled));
        }
    }
}

impl Drop for ConversionScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn dispatch(inner: Arc<Inner>) {
    loop {
        let permit = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            permit = inner.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let claimed = loop {
            let notified = inner.wakeup.notified();
            let next = inner.table.lock().claim_next();
            if next.is_some() {
                break next;
            }
            tokio::select! {
                _ = inner.shutdown.cancelled() => break None,
                _ = notified => {}
            }
        };

        let Some(job) = claimed else {
            break;
        };

        let worker = inner.clone();
        tokio::spawn(async move {
            worker.run_job(job).await;
            drop(permit);
        });
    }
    debug!("Dispatcher stopped");
}

impl Inner {
    /// Evict a cached entry whose artifact vanished, so the next admission re-converts
    async fn verify_cached(&self, fingerprint: &Fingerprint) {
        let entry = self.cache.lock().lookup(fingerprint).cloned();
        let Some(entry) = entry else {
            return;
        };
        if entry.is_present().await {
            return;
        }

        warn!(
            "Cached artifact for {} is gone: {}",
            fingerprint.short(),
            entry.artifact.display()
        );
        let evicted = {
            let mut cache = self.cache.lock();
            if cache.lookup(fingerprint) == Some(&entry) {
                cache.evict(fingerprint).is_some()
            } else {
                false
            }
        };
        if evicted {
            self.persist().await;
        }
    }

    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let (snapshot, path) = {
            let cache = self.cache.lock();
            (cache.snapshot(), cache.index_path().to_path_buf())
        };
        if let Err(e) = snapshot.write(&path).await {
            error!("Failed to save cache index {}: {}", path.display(), e);
        }
    }

    async fn run_job(self: Arc<Self>, job: ClaimedJob) {
        let fingerprint = job.request.fingerprint.clone();
        let attempt = job.attempt;
        let _ = self.events.send(JobEvent::Started {
            fingerprint: fingerprint.clone(),
            attempt,
        });
        info!("🎬 Converting {} (attempt {})", job.request.source.display(), attempt);

        let converted = self.convert(&job).await;

        let (outcome, finished) = {
            let mut table = self.table.lock();
            let outcome = converted.and_then(|record| self.record(&fingerprint, record));
            let finished = table.finish(&fingerprint, &outcome);
            (outcome, finished)
        };

        match &outcome {
            Ok(entry) => {
                self.persist().await;
                info!(
                    "✅ Converted {} -> {}",
                    job.request.source.display(),
                    entry.artifact.display()
                );
                let _ = self.events.send(JobEvent::Succeeded { entry: entry.clone() });
            }
            Err(PipelineError::Cancelled) => {
                info!("Conversion of {} cancelled", job.request.source.display());
                let _ = self.events.send(JobEvent::Failed {
                    fingerprint: fingerprint.clone(),
                    attempt,
                    error: PipelineError::Cancelled,
                });
            }
            Err(e) => {
                warn!("❌ Conversion of {} failed: {}", job.request.source.display(), e);
                let _ = self.events.send(JobEvent::Failed {
                    fingerprint: fingerprint.clone(),
                    attempt,
                    error: e.clone(),
                });
            }
        }

        for waiter in finished.waiters {
            let _ = waiter.send(outcome.clone());
        }

        if let Some(attempt) = finished.requeued {
            info!(
                "📥 Re-queued {} ({}) after cancellation, attempt {}",
                job.request.source.display(),
                fingerprint.short(),
                attempt
            );
            let _ = self.events.send(JobEvent::Queued {
                fingerprint: fingerprint.clone(),
                attempt,
            });
            self.wakeup.notify_one();
        }
        if let Some((error, refused)) = finished.refused {
            for waiter in refused {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    /// Called with the table lock held
    fn record(&self, fingerprint: &Fingerprint, record: ArtifactRecord) -> Result<CacheEntry> {
        let mut cache = self.cache.lock();
        match cache.record(fingerprint, record.clone()) {
            Err(PipelineError::CacheIntegrity(_)) => {
                warn!("Replacing inconsistent cache entry for {}", fingerprint.short());
                cache.evict(fingerprint);
                cache.record(fingerprint, record)
            }
            other => other,
        }
    }

    async fn convert(&self, job: &ClaimedJob) -> Result<ArtifactRecord> {
        let fingerprint = &job.request.fingerprint;
        let target = self.settings.artifact_path(fingerprint);
        fs::create_dir_all(&self.settings.artifact_dir).await?;

        let result = self
            .transcoder
            .convert(&job.request.source, &target, &job.cancel)
            .await?;
        debug!(
            "Transcoder finished {} in {:.1}s",
            fingerprint.short(),
            result.duration_spent.as_secs_f64()
        );

        let artifact_size = fs::metadata(&target).await?.len();
        let poster = if self.settings.generate_posters {
            self.extract_poster(job).await
        } else {
            None
        };

        Ok(ArtifactRecord {
            artifact: target,
            poster,
            source_size: job.request.source_size,
            artifact_size,
        })
    }

    /// Best-effort frame from the middle of the source
    async fn extract_poster(&self, job: &ClaimedJob) -> Option<PathBuf> {
        let target = self.settings.poster_path(&job.request.fingerprint);
        let at = Duration::from_micros(job.request.duration_micros / 2);
        match self
            .transcoder
            .extract_poster(&job.request.source, &target, at, &job.cancel)
            .await
        {
            Ok(true) => Some(target),
            Ok(false) => None,
            Err(e) => {
                warn!("Poster extraction failed for {}: {}", job.request.source.display(), e);
                None
            }
        }
    }
}
