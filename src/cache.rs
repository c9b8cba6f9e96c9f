//! # Conversion Cache Module
//!
//! Mapping durevole fingerprint → artifact convertito.
//!
//! ## Responsabilità:
//! - Unica fonte di verità per "questo contenuto è già stato convertito?"
//! - Entry immutabili una volta scritte (`record` idempotente)
//! - Eviction di entry il cui artifact è sparito dal disco (self-healing)
//! - Persistenza in un indice JSON sidecar nella directory degli artifact
//! - Riconciliazione all'avvio: scarta entry senza file e sweep dei temp file orfani
//!
//! ## Esempio indice:
//! ```json
//! {
//!   "version": 1,
//!   "entries": {
//!     "9f86d081884c7d65...": {
//!       "fingerprint": "9f86d081884c7d65...",
//!       "artifact": "/data/artifacts/inline-video-9f86d081884c7d65.webm",
//!       "poster": "/data/artifacts/inline-video-9f86d081884c7d65.png",
//!       "created_at": 1642680000,
//!       "source_size": 1048576,
//!       "artifact_size": 524288
//!     }
//!   }
//! }
//! ```

use crate::error::{PipelineError, Result};
use crate::file_manager::FileManager;
use crate::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, info, warn};

const INDEX_VERSION: u32 = 1;

/// A converted artifact known to the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub artifact: PathBuf,
    #[serde(default)]
    pub poster: Option<PathBuf>,
    pub created_at: u64,
    pub source_size: u64,
    pub artifact_size: u64,
}

impl CacheEntry {
    /// Whether the backing artifact is still on disk with the recorded size
    pub async fn is_present(&self) -> bool {
        match fs::metadata(&self.artifact).await {
            Ok(metadata) => metadata.is_file() && metadata.len() == self.artifact_size,
            Err(_) => false,
        }
    }
}

/// What a finished conversion hands to the cache
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRecord {
    pub artifact: PathBuf,
    pub poster: Option<PathBuf>,
    pub source_size: u64,
    pub artifact_size: u64,
}

/// Serialized form of the cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheIndex {
    pub version: u32,
    pub entries: HashMap<Fingerprint, CacheEntry>,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            entries: HashMap::new(),
        }
    }
}

impl CacheIndex {
    pub async fn write(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_vec_pretty(self)?;
        FileManager::write_atomic(path, content).await?;
        Ok(())
    }
}

/// Durable fingerprint → artifact mapping
pub struct ConversionCache {
    index_path: PathBuf,
    index: CacheIndex,
}

impl ConversionCache {
    /// Empty cache that will persist to `index_path`
    pub fn new(index_path: PathBuf) -> Self {
        Self {
            index_path,
            index: CacheIndex::default(),
        }
    }

    /// Load the index (if any) and reconcile it against the artifact directory
    pub async fn open(index_path: PathBuf) -> Result<Self> {
        let index = if index_path.exists() {
            let content = fs::read_to_string(&index_path).await?;
            match serde_json::from_str::<CacheIndex>(&content) {
                Ok(index) if index.version == INDEX_VERSION => index,
                Ok(index) => {
                    warn!("Discarding cache index with unknown version {}", index.version);
                    CacheIndex::default()
                }
                Err(e) => {
                    warn!("Discarding unreadable cache index {}: {}", index_path.display(), e);
                    CacheIndex::default()
                }
            }
        } else {
            CacheIndex::default()
        };

        let mut cache = Self { index_path, index };
        cache.reconcile().await?;
        Ok(cache)
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<&CacheEntry> {
        self.index.entries.get(fingerprint)
    }

    /// Record a finished conversion.
    ///
    /// Recording the same artifact twice returns the existing entry. A
    /// different artifact under an existing fingerprint is a `CacheIntegrity` error.
    pub fn record(&mut self, fingerprint: &Fingerprint, record: ArtifactRecord) -> Result<CacheEntry> {
        if let Some(existing) = self.index.entries.get(fingerprint) {
            let same_content = existing.artifact == record.artifact
                && existing.source_size == record.source_size
                && existing.artifact_size == record.artifact_size;
            if same_content {
                debug!("Cache entry for {} already recorded", fingerprint.short());
                return Ok(existing.clone());
            }
            return Err(PipelineError::CacheIntegrity(fingerprint.to_string()));
        }

        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            artifact: record.artifact,
            poster: record.poster,
            created_at: now_secs(),
            source_size: record.source_size,
            artifact_size: record.artifact_size,
        };
        self.index.entries.insert(fingerprint.clone(), entry.clone());
        info!("Cached {} -> {}", fingerprint.short(), entry.artifact.display());
        Ok(entry)
    }

    /// Forget an entry. Only the index changes; no file is removed.
    pub fn evict(&mut self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let removed = self.index.entries.remove(fingerprint);
        if removed.is_some() {
            info!("Evicted cache entry {}", fingerprint.short());
        }
        removed
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.index.entries.values()
    }

    pub fn len(&self) -> usize {
        self.index.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.entries.is_empty()
    }

    /// Entry count, total source bytes, total artifact bytes
    pub fn stats(&self) -> (usize, u64, u64) {
        let source: u64 = self.index.entries.values().map(|e| e.source_size).sum();
        let artifact: u64 = self.index.entries.values().map(|e| e.artifact_size).sum();
        (self.index.entries.len(), source, artifact)
    }

    pub fn snapshot(&self) -> CacheIndex {
        self.index.clone()
    }

    /// Save current index to its sidecar file
    pub async fn save(&self) -> Result<()> {
        self.index.write(&self.index_path).await
    }

    /// Drop entries whose artifact is gone and sweep orphaned temp files.
    ///
    /// Returns the number of dropped entries.
    pub async fn reconcile(&mut self) -> Result<usize> {
        let mut missing = Vec::new();
        for (fingerprint, entry) in &self.index.entries {
            if !entry.is_present().await {
                warn!(
                    "Artifact for {} is missing or truncated: {}",
                    fingerprint.short(),
                    entry.artifact.display()
                );
                missing.push(fingerprint.clone());
            }
        }

        for fingerprint in &missing {
            self.index.entries.remove(fingerprint);
        }

        let swept = self.sweep_temp_files().await;
        if swept > 0 {
            info!("Removed {} unfinished temp files", swept);
        }

        if !missing.is_empty() {
            self.save().await?;
        }

        Ok(missing.len())
    }

    async fn sweep_temp_files(&self) -> usize {
        let Some(dir) = self.index_path.parent() else {
            return 0;
        };
        let Ok(mut read_dir) = fs::read_dir(dir).await else {
            return 0;
        };

        let mut swept = 0;
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(".inline-video-") && name.ends_with(".part") {
                if fs::remove_file(entry.path()).await.is_ok() {
                    swept += 1;
                }
            }
        }
        swept
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn artifact(dir: &Path, name: &str, bytes: &[u8]) -> ArtifactRecord {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        ArtifactRecord {
            artifact: path,
            poster: None,
            source_size: 1000,
            artifact_size: bytes.len() as u64,
        }
    }

    #[test]
    fn test_record_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let mut cache = ConversionCache::new(temp_dir.path().join("index.json"));
        let fp = Fingerprint::of_bytes(b"source");
        let record = artifact(temp_dir.path(), "a.webm", b"converted");

        let first = cache.record(&fp, record.clone()).unwrap();
        let second = cache.record(&fp, record).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_record_with_different_content_is_integrity_error() {
        let temp_dir = TempDir::new().unwrap();
        let mut cache = ConversionCache::new(temp_dir.path().join("index.json"));
        let fp = Fingerprint::of_bytes(b"source");

        cache.record(&fp, artifact(temp_dir.path(), "a.webm", b"converted")).unwrap();
        let other = artifact(temp_dir.path(), "b.webm", b"something else");
        assert!(matches!(cache.record(&fp, other), Err(PipelineError::CacheIntegrity(_))));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evict_keeps_files() {
        let temp_dir = TempDir::new().unwrap();
        let mut cache = ConversionCache::new(temp_dir.path().join("index.json"));
        let fp = Fingerprint::of_bytes(b"source");
        let record = artifact(temp_dir.path(), "a.webm", b"converted");
        let path = record.artifact.clone();

        cache.record(&fp, record).unwrap();
        assert!(cache.evict(&fp).is_some());
        assert!(cache.lookup(&fp).is_none());
        assert!(cache.evict(&fp).is_none());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let index_path = temp_dir.path().join("index.json");
        let fp = Fingerprint::of_bytes(b"source");

        let mut cache = ConversionCache::new(index_path.clone());
        cache.record(&fp, artifact(temp_dir.path(), "a.webm", b"converted")).unwrap();
        cache.save().await.unwrap();

        let reopened = ConversionCache::open(index_path).await.unwrap();
        let entry = reopened.lookup(&fp).unwrap();
        assert_eq!(entry.artifact_size, 9);
        assert_eq!(reopened.stats(), (1, 1000, 9));
    }

    #[tokio::test]
    async fn test_reconcile_drops_missing_and_truncated_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let index_path = temp_dir.path().join("index.json");
        let kept = Fingerprint::of_bytes(b"kept");
        let gone = Fingerprint::of_bytes(b"gone");
        let truncated = Fingerprint::of_bytes(b"truncated");

        let mut cache = ConversionCache::new(index_path.clone());
        cache.record(&kept, artifact(temp_dir.path(), "kept.webm", b"ok")).unwrap();
        let gone_record = artifact(temp_dir.path(), "gone.webm", b"bye");
        std::fs::remove_file(&gone_record.artifact).unwrap();
        cache.record(&gone, gone_record).unwrap();
        let truncated_record = artifact(temp_dir.path(), "cut.webm", b"full length");
        std::fs::write(&truncated_record.artifact, b"full").unwrap();
        cache.record(&truncated, truncated_record).unwrap();
        cache.save().await.unwrap();

        std::fs::write(temp_dir.path().join(".inline-video-abc.part"), b"half").unwrap();

        let reopened = ConversionCache::open(index_path).await.unwrap();
        assert!(reopened.lookup(&kept).is_some());
        assert!(reopened.lookup(&gone).is_none());
        assert!(reopened.lookup(&truncated).is_none());
        assert!(!temp_dir.path().join(".inline-video-abc.part").exists());
    }

    #[tokio::test]
    async fn test_corrupt_index_starts_empty() {
        let temp_dir = TempDir::new().unwrap();
        let index_path = temp_dir.path().join("index.json");
        std::fs::write(&index_path, b"{ not json").unwrap();

        let cache = ConversionCache::open(index_path).await.unwrap();
        assert!(cache.is_empty());
    }
}
