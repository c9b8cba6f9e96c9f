//! # Inline Video Library
//!
//! Pipeline di conversione asincrona per video embedded inline in un campo documento.
//!
//! ## Responsabilità:
//! - Definisce la struttura modulare della pipeline
//! - Espone i tipi principali tramite re-exports
//! - Fornisce un'interfaccia pulita per il main.rs e per altri consumatori (editor)
//!
//! ## Architettura dei moduli:
//! - `fingerprint`: Identità del contenuto (SHA-256) con memo size/mtime
//! - `probe`: Classificazione nativo / da convertire via ffprobe
//! - `cache`: Mapping durevole fingerprint → artifact (indice JSON sidecar)
//! - `transcoder`: Singola conversione ffmpeg con timeout, cancellazione e rename atomico
//! - `scheduler`: Coda FIFO con dedup, concorrenza limitata e backpressure
//! - `player_config`: Merge globale/istanza della configurazione del player
//! - `patcher`: Rendering e riscrittura degli embed nel documento
//! - `document`: Astrazione del campo documento modificabile
//! - `pipeline`: Orchestratore del flusso completo
//! - `config`, `error`, `platform`, `file_manager`, `progress`: infrastruttura
//!
//! ## Utilizzo:
//! ```rust,ignore
//! use inline_video::{Config, MediaReference, Pipeline};
//!
//! let pipeline = Pipeline::from_config(&Config::default()).await?;
//! let reference = MediaReference::new("clip.mov");
//! let markup = pipeline.render(&reference);
//! // ... insert `markup` into the field ...
//! pipeline.reference_added(field, &reference).await?;
//! ```

pub mod cache;
pub mod config;
pub mod document;
pub mod error;
pub mod file_manager;
pub mod fingerprint;
pub mod patcher;
pub mod pipeline;
pub mod platform;
pub mod player_config;
pub mod probe;
pub mod progress;
pub mod scheduler;
pub mod transcoder;

pub use cache::{CacheEntry, ConversionCache};
pub use config::Config;
pub use document::{DocumentField, FileField, MemoryField};
pub use error::{PipelineError, Result};
pub use fingerprint::{Fingerprint, Fingerprinter};
pub use patcher::{EmbedSource, FieldPatcher, MediaReference};
pub use pipeline::{PendingPatch, Pipeline, Submission};
pub use player_config::{ConfigResolver, GlobalConfig, PlayerConfig, PlayerOverride};
pub use probe::{MediaProbe, ProbeReport};
pub use scheduler::{Admission, ConversionJob, ConversionRequest, ConversionScheduler, JobEvent, JobStatus};
pub use transcoder::{ConversionResult, Transcoder};
