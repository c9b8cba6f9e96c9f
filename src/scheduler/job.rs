use crate::cache::CacheEntry;
use crate::error::{PipelineError, Result};
use crate::fingerprint::Fingerprint;
use serde::Serialize;
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::sync::oneshot;

/// Lifecycle of a conversion job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

/// Public view of a job
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionJob {
    pub fingerprint: Fingerprint,
    pub source: PathBuf,
    pub requested_at: SystemTime,
    pub status: JobStatus,
    pub attempt: u32,
    pub waiters: usize,
    pub error: Option<String>,
}

/// A request to convert one source file
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub fingerprint: Fingerprint,
    pub source: PathBuf,
    pub source_size: u64,
    /// Source duration, used to pick the poster frame
    pub duration_micros: u64,
}

pub type JobOutcome = Result<CacheEntry>;

/// Handle on the outcome of a job, one per waiter
#[derive(Debug)]
pub struct JobTicket {
    fingerprint: Fingerprint,
    receiver: oneshot::Receiver<JobOutcome>,
}

impl JobTicket {
    pub(crate) fn new(fingerprint: Fingerprint) -> (Self, oneshot::Sender<JobOutcome>) {
        let (sender, receiver) = oneshot::channel();
        (Self { fingerprint, receiver }, sender)
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Wait for the job to finish. A scheduler that went away counts as cancellation.
    pub async fn wait(self) -> Result<CacheEntry> {
        self.receiver.await.unwrap_or(Err(PipelineError::Cancelled))
    }
}

/// Result of an enqueue
#[derive(Debug)]
pub enum Admission {
    /// Content was already converted
    Cached(CacheEntry),
    /// A new job was created
    Queued(JobTicket),
    /// Folded into an existing queued or running job
    Attached(JobTicket),
}

impl Admission {
    /// Wait for the artifact regardless of how the request was admitted
    pub async fn wait(self) -> Result<CacheEntry> {
        match self {
            Admission::Cached(entry) => Ok(entry),
            Admission::Queued(ticket) | Admission::Attached(ticket) => ticket.wait().await,
        }
    }
}

/// Events published by the scheduler
#[derive(Debug, Clone)]
pub enum JobEvent {
    Queued { fingerprint: Fingerprint, attempt: u32 },
    Started { fingerprint: Fingerprint, attempt: u32 },
    Succeeded { entry: CacheEntry },
    Failed { fingerprint: Fingerprint, attempt: u32, error: PipelineError },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_monotonic() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Succeeded));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Succeeded.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Queued));
    }

    #[tokio::test]
    async fn test_dropped_sender_reads_as_cancelled() {
        let (ticket, sender) = JobTicket::new(Fingerprint::of_bytes(b"x"));
        drop(sender);
        assert!(matches!(ticket.wait().await, Err(PipelineError::Cancelled)));
    }
}
