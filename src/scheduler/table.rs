//! Job table: the only shared mutable scheduling state.
//!
//! Every method runs under the scheduler's single table lock; nothing here awaits.
//!
//! A running job that was cancelled stays live until its worker exits. Requests
//! for the same content arriving in that window are parked as its successor and
//! queued once the cancelled job clears.

use super::job::{ConversionJob, ConversionRequest, JobOutcome, JobStatus, JobTicket};
use crate::cache::{CacheEntry, ConversionCache};
use crate::error::{PipelineError, Result};
use crate::fingerprint::Fingerprint;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Failure records kept before the oldest are forgotten
const MAX_FAILURE_RECORDS: usize = 1024;

struct LiveJob {
    job: ConversionJob,
    request: ConversionRequest,
    waiters: Vec<oneshot::Sender<JobOutcome>>,
    cancel: CancellationToken,
    successor: Option<Successor>,
}

/// Request parked behind a cancelled running job of the same content
struct Successor {
    request: ConversionRequest,
    waiters: Vec<oneshot::Sender<JobOutcome>>,
    cancel: CancellationToken,
}

struct FailureRecord {
    attempts: u32,
    seq: u64,
}

struct FinishedJob {
    job: ConversionJob,
    finished_at: Instant,
}

/// A job handed to a worker
pub(crate) struct ClaimedJob {
    pub request: ConversionRequest,
    pub attempt: u32,
    pub cancel: CancellationToken,
}

pub(crate) enum Admitted {
    Cached(CacheEntry),
    Queued { ticket: JobTicket, attempt: u32 },
    Attached(JobTicket),
    /// Waiting for a cancelled job of the same content to clear
    Parked(JobTicket),
}

/// Waiters of a finished job, and what became of its successor
pub(crate) struct Finished {
    pub waiters: Vec<oneshot::Sender<JobOutcome>>,
    /// Attempt number of the successor now queued in its place
    pub requeued: Option<u32>,
    /// Successor waiters turned away because the attempt limit was reached
    pub refused: Option<(PipelineError, Vec<oneshot::Sender<JobOutcome>>)>,
}

pub(crate) enum Cancelled {
    NotFound,
    /// Removed from the queue; these waiters must be told
    Dequeued {
        attempt: u32,
        waiters: Vec<oneshot::Sender<JobOutcome>>,
    },
    /// Running; the worker was signalled
    Signalled,
}

pub(crate) struct JobTable {
    live: HashMap<Fingerprint, LiveJob>,
    queue: VecDeque<Fingerprint>,
    running: usize,
    finished: HashMap<Fingerprint, FinishedJob>,
    /// Failed attempts per fingerprint, cleared on success
    failures: HashMap<Fingerprint, FailureRecord>,
    failure_seq: u64,
    max_depth: usize,
    max_attempts: u32,
    grace: Duration,
}

impl JobTable {
    pub fn new(max_depth: usize, max_attempts: u32, grace: Duration) -> Self {
        Self {
            live: HashMap::new(),
            queue: VecDeque::new(),
            running: 0,
            finished: HashMap::new(),
            failures: HashMap::new(),
            failure_seq: 0,
            max_depth,
            max_attempts,
            grace,
        }
    }

    /// Dedup, cache check, retry limit and backpressure, in that order
    pub fn admit(
        &mut self,
        request: ConversionRequest,
        cache: &ConversionCache,
        cancel: CancellationToken,
    ) -> Result<Admitted> {
        self.prune();
        let fingerprint = request.fingerprint.clone();
        let failed_attempts = self.failed_attempts(&fingerprint);

        if let Some(live) = self.live.get_mut(&fingerprint) {
            let (ticket, sender) = JobTicket::new(fingerprint.clone());
            if live.cancel.is_cancelled() {
                if let Some(successor) = live.successor.as_mut() {
                    successor.waiters.push(sender);
                    return Ok(Admitted::Attached(ticket));
                }
                debug!("Parked {} behind its cancelled job", fingerprint.short());
                live.successor = Some(Successor {
                    request,
                    waiters: vec![sender],
                    cancel,
                });
                return Ok(Admitted::Parked(ticket));
            }
            live.waiters.push(sender);
            live.job.waiters = live.waiters.len();
            debug!(
                "Attached waiter #{} to {} job {}",
                live.job.waiters,
                if live.job.status == JobStatus::Running { "running" } else { "queued" },
                fingerprint.short()
            );
            return Ok(Admitted::Attached(ticket));
        }

        if let Some(entry) = cache.lookup(&fingerprint) {
            return Ok(Admitted::Cached(entry.clone()));
        }

        if failed_attempts >= self.max_attempts {
            return Err(PipelineError::RetryExhausted {
                attempts: failed_attempts,
            });
        }

        if self.live.len() >= self.max_depth {
            return Err(PipelineError::QueueSaturated {
                depth: self.live.len(),
            });
        }

        let attempt = failed_attempts + 1;
        let (ticket, sender) = JobTicket::new(fingerprint);
        self.insert_queued(request, vec![sender], cancel, attempt);
        Ok(Admitted::Queued { ticket, attempt })
    }

    fn insert_queued(
        &mut self,
        request: ConversionRequest,
        waiters: Vec<oneshot::Sender<JobOutcome>>,
        cancel: CancellationToken,
        attempt: u32,
    ) {
        let fingerprint = request.fingerprint.clone();
        let job = ConversionJob {
            fingerprint: fingerprint.clone(),
            source: request.source.clone(),
            requested_at: SystemTime::now(),
            status: JobStatus::Queued,
            attempt,
            waiters: waiters.len(),
            error: None,
        };

        self.finished.remove(&fingerprint);
        self.live.insert(
            fingerprint.clone(),
            LiveJob {
                job,
                request,
                waiters,
                cancel,
                successor: None,
            },
        );
        self.queue.push_back(fingerprint);
    }

    /// Pop the oldest queued job and mark it running
    pub fn claim_next(&mut self) -> Option<ClaimedJob> {
        self.prune();
        while let Some(fingerprint) = self.queue.pop_front() {
            let Some(live) = self.live.get_mut(&fingerprint) else {
                continue;
            };
            if live.job.status != JobStatus::Queued {
                continue;
            }
            live.job.status = JobStatus::Running;
            self.running += 1;
            return Some(ClaimedJob {
                request: live.request.clone(),
                attempt: live.job.attempt,
                cancel: live.cancel.clone(),
            });
        }
        None
    }

    /// Move a running job to its terminal status and hand back its waiters in attachment order.
    ///
    /// A parked successor shares a successful outcome; otherwise it is queued
    /// as a fresh job, or refused when no attempts are left.
    pub fn finish(&mut self, fingerprint: &Fingerprint, outcome: &JobOutcome) -> Finished {
        let Some(mut live) = self.live.remove(fingerprint) else {
            return Finished {
                waiters: Vec::new(),
                requeued: None,
                refused: None,
            };
        };
        if live.job.status == JobStatus::Running {
            self.running = self.running.saturating_sub(1);
        }

        match outcome {
            Ok(_) => {
                live.job.status = JobStatus::Succeeded;
                self.failures.remove(fingerprint);
            }
            Err(error) => {
                live.job.status = JobStatus::Failed;
                live.job.error = Some(error.to_string());
                if !matches!(error, PipelineError::Cancelled) {
                    self.record_failure(fingerprint, live.job.attempt);
                }
            }
        }

        self.archive(live.job);
        let mut finished = Finished {
            waiters: live.waiters,
            requeued: None,
            refused: None,
        };

        if let Some(successor) = live.successor {
            if outcome.is_ok() {
                finished.waiters.extend(successor.waiters);
                return finished;
            }
            let failed = self.failed_attempts(fingerprint);
            if failed >= self.max_attempts {
                finished.refused = Some((PipelineError::RetryExhausted { attempts: failed }, successor.waiters));
            } else {
                self.insert_queued(successor.request, successor.waiters, successor.cancel, failed + 1);
                finished.requeued = Some(failed + 1);
            }
        }
        finished
    }

    fn record_failure(&mut self, fingerprint: &Fingerprint, attempts: u32) {
        self.failure_seq += 1;
        self.failures.insert(
            fingerprint.clone(),
            FailureRecord {
                attempts,
                seq: self.failure_seq,
            },
        );
        if self.failures.len() > MAX_FAILURE_RECORDS {
            let oldest = self
                .failures
                .iter()
                .min_by_key(|(_, record)| record.seq)
                .map(|(fingerprint, _)| fingerprint.clone());
            if let Some(oldest) = oldest {
                self.failures.remove(&oldest);
            }
        }
    }

    pub fn cancel(&mut self, fingerprint: &Fingerprint) -> Cancelled {
        let failed_attempts = self.failed_attempts(fingerprint);
        let Some(live) = self.live.get_mut(fingerprint) else {
            return Cancelled::NotFound;
        };

        if live.job.status == JobStatus::Running {
            if let Some(successor) = live.successor.take() {
                return Cancelled::Dequeued {
                    attempt: failed_attempts + 1,
                    waiters: successor.waiters,
                };
            }
            live.cancel.cancel();
            return Cancelled::Signalled;
        }

        self.queue.retain(|queued| queued != fingerprint);
        match self.live.remove(fingerprint) {
            Some(mut live) => {
                live.job.status = JobStatus::Failed;
                live.job.error = Some(PipelineError::Cancelled.to_string());
                let attempt = live.job.attempt;
                self.archive(live.job);
                Cancelled::Dequeued {
                    attempt,
                    waiters: live.waiters,
                }
            }
            None => Cancelled::NotFound,
        }
    }

    /// Remove every queued job (shutdown)
    pub fn drain_queued(&mut self) -> Vec<oneshot::Sender<JobOutcome>> {
        let queued: Vec<Fingerprint> = self.queue.drain(..).collect();
        let mut waiters = Vec::new();
        for live in self.live.values_mut() {
            if let Some(mut successor) = live.successor.take() {
                waiters.append(&mut successor.waiters);
            }
        }
        for fingerprint in queued {
            if let Some(mut live) = self.live.remove(&fingerprint) {
                live.job.status = JobStatus::Failed;
                live.job.error = Some(PipelineError::Cancelled.to_string());
                waiters.append(&mut live.waiters);
                self.archive(live.job);
            }
        }
        waiters
    }

    pub fn status(&self, fingerprint: &Fingerprint) -> Option<ConversionJob> {
        self.live
            .get(fingerprint)
            .map(|live| live.job.clone())
            .or_else(|| self.finished.get(fingerprint).map(|f| f.job.clone()))
    }

    pub fn failed_attempts(&self, fingerprint: &Fingerprint) -> u32 {
        self.failures.get(fingerprint).map(|record| record.attempts).unwrap_or(0)
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn queued(&self) -> usize {
        self.live.len() - self.running
    }

    fn archive(&mut self, job: ConversionJob) {
        self.finished.insert(
            job.fingerprint.clone(),
            FinishedJob {
                job,
                finished_at: Instant::now(),
            },
        );
    }

    fn prune(&mut self) {
        let grace = self.grace;
        self.finished.retain(|_, f| f.finished_at.elapsed() < grace);
    }
}
