//! # Error Types Module
//!
//! Questo modulo definisce tutti i tipi di errore della pipeline di conversione.
//!
//! ## Categorie di errori:
//! - `Io`: file non leggibile o non scrivibile
//! - `Probe`: media corrotto o non analizzabile (non ritentabile)
//! - `TranscodeFailed` / `TranscodeTimeout`: fallimento del tool esterno
//! - `CacheIntegrity`: fingerprint già registrato con contenuto diverso
//! - `QueueSaturated`: backpressure della coda di conversione
//! - `ConfigParse`: configurazione embedded malformata
//! - `PatchTargetMissing`: il riferimento è sparito dal documento
//! - `Cancelled`, `RetryExhausted`, `MissingDependency`, `State`, `Validation`
//!
//! Gli errori sono `Clone`: un singolo fallimento di un job viene consegnato
//! a tutti i waiter agganciati allo stesso fingerprint.
//!
//! ## Esempio:
//! ```rust,ignore
//! if live_jobs >= max_queue_depth {
//!     return Err(PipelineError::QueueSaturated { depth: live_jobs });
//! }
//! ```

use std::sync::Arc;

/// Errors produced by the conversion pipeline and the config codec
#[derive(thiserror::Error, Debug, Clone)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Probe error for {path}: {reason}")]
    Probe { path: String, reason: String },

    #[error("Transcode failed with exit code {exit_code:?}: {stderr_tail}")]
    TranscodeFailed {
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("Transcode timed out after {seconds}s")]
    TranscodeTimeout { seconds: u64 },

    #[error("Cache integrity error for fingerprint {0}")]
    CacheIntegrity(String),

    #[error("Conversion queue saturated ({depth} live jobs)")]
    QueueSaturated { depth: usize },

    #[error("Config parse error: {0}")]
    ConfigParse(String),

    #[error("Patch target missing: reference {0} is no longer in the document")]
    PatchTargetMissing(String),

    #[error("Conversion cancelled")]
    Cancelled,

    #[error("Conversion permanently failed after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    #[error("Dependency missing: {0}")]
    MissingDependency(String),

    #[error("Pipeline state error: {0}")]
    State(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl PipelineError {
    /// Whether a caller may enqueue the same content again after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Io(_)
                | PipelineError::TranscodeFailed { .. }
                | PipelineError::TranscodeTimeout { .. }
                | PipelineError::CacheIntegrity(_)
                | PipelineError::Cancelled
        )
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::State(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_errors_are_not_retryable() {
        let err = PipelineError::Probe {
            path: "broken.mov".to_string(),
            reason: "moov atom not found".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(!PipelineError::RetryExhausted { attempts: 3 }.is_retryable());
    }

    #[test]
    fn test_io_error_is_shared_between_clones() {
        let err: PipelineError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        let copy = err.clone();
        assert!(copy.is_retryable());
        assert_eq!(err.to_string(), copy.to_string());
    }
}
