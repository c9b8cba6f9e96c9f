//! # Fingerprint Module
//!
//! Identità stabile del contenuto di un file media.
//!
//! ## Responsabilità:
//! - Calcola lo SHA-256 dei byte del file (nessuna dipendenza da path o timestamp)
//! - Memoizza il risultato per path, invalidato da size/mtime (fast path)
//! - Il memo è limitato: oltre la capacità si scartano i path più vecchi
//! - L'hashing gira su un thread blocking, mai sul thread del chiamante
//!
//! Contenuto identico ⇒ fingerprint identico, indipendentemente da nome o posizione.

use crate::error::Result;
use crate::file_manager::FileManager;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

const READ_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_MEMO_CAPACITY: usize = 4096;

/// Content identity of a media file (hex encoded SHA-256)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Fingerprint(hex::encode(Sha256::digest(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix used in artifact file names
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(16)]
    }

    fn of_reader(mut reader: impl Read) -> std::io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(Fingerprint(hex::encode(hasher.finalize())))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
struct MemoEntry {
    size: u64,
    modified: u128,
    fingerprint: Fingerprint,
}

#[derive(Default)]
struct Memo {
    entries: HashMap<PathBuf, MemoEntry>,
    /// Insertion order, oldest first
    order: VecDeque<PathBuf>,
}

impl Memo {
    fn insert(&mut self, path: PathBuf, entry: MemoEntry, capacity: usize) {
        if self.entries.insert(path.clone(), entry).is_none() {
            self.order.push_back(path);
        }
        while self.entries.len() > capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn remove(&mut self, path: &Path) {
        if self.entries.remove(path).is_some() {
            self.order.retain(|known| known != path);
        }
    }
}

/// Computes fingerprints, skipping the re-hash when size and mtime are unchanged
pub struct Fingerprinter {
    memo: Mutex<Memo>,
    capacity: usize,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMO_CAPACITY)
    }
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memoize at most `capacity` paths
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            memo: Mutex::new(Memo::default()),
            capacity: capacity.max(1),
        }
    }

    /// Fingerprint a file, returning it along with the file size
    pub async fn fingerprint(&self, path: &Path) -> Result<(Fingerprint, u64)> {
        let (size, modified) = FileManager::get_file_info(path).await?;

        let memoized = self.memo.lock().entries.get(path).cloned();
        if let Some(entry) = memoized {
            if entry.size == size && entry.modified == modified {
                debug!("Fingerprint fast path for {}", path.display());
                return Ok((entry.fingerprint, size));
            }
        }

        let owned = path.to_path_buf();
        let fingerprint = tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&owned)?;
            Fingerprint::of_reader(std::io::BufReader::new(file))
        })
        .await
        .map_err(std::io::Error::other)??;

        debug!("Fingerprinted {} -> {}", path.display(), fingerprint.short());
        self.memo.lock().insert(
            path.to_path_buf(),
            MemoEntry {
                size,
                modified,
                fingerprint: fingerprint.clone(),
            },
            self.capacity,
        );
        Ok((fingerprint, size))
    }

    /// Drop the memoized value for a path
    pub fn forget(&self, path: &Path) {
        self.memo.lock().remove(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_same_content_same_fingerprint_regardless_of_path() {
        let temp_dir = TempDir::new().unwrap();
        let a = temp_dir.path().join("holiday.mov");
        let b = temp_dir.path().join("copy of holiday.mkv");
        std::fs::write(&a, b"identical bytes").unwrap();
        std::fs::write(&b, b"identical bytes").unwrap();

        let fingerprinter = Fingerprinter::new();
        let (fa, size) = fingerprinter.fingerprint(&a).await.unwrap();
        let (fb, _) = fingerprinter.fingerprint(&b).await.unwrap();
        assert_eq!(fa, fb);
        assert_eq!(size, 15);
        assert_eq!(fa, Fingerprint::of_bytes(b"identical bytes"));
    }

    #[tokio::test]
    async fn test_fingerprint_stable_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("clip.avi");
        std::fs::write(&path, vec![7u8; 200_000]).unwrap();

        let (first, _) = Fingerprinter::new().fingerprint(&path).await.unwrap();
        let (second, _) = Fingerprinter::new().fingerprint(&path).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), 64);
        assert_eq!(first.short().len(), 16);
    }

    #[tokio::test]
    async fn test_changed_content_changes_fingerprint() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("clip.mov");
        let fingerprinter = Fingerprinter::new();

        std::fs::write(&path, b"version one").unwrap();
        let (before, _) = fingerprinter.fingerprint(&path).await.unwrap();

        std::fs::write(&path, b"version two, longer").unwrap();
        let (after, _) = fingerprinter.fingerprint(&path).await.unwrap();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_unreadable_file_is_io_error() {
        let result = Fingerprinter::new()
            .fingerprint(Path::new("/definitely/not/here.mov"))
            .await;
        assert!(matches!(result, Err(PipelineError::Io(_))));
    }

    #[tokio::test]
    async fn test_memo_is_bounded_and_forgets() {
        let temp_dir = TempDir::new().unwrap();
        let fingerprinter = Fingerprinter::with_capacity(2);
        let mut paths = Vec::new();
        for name in ["a.mov", "b.mov", "c.mov"] {
            let path = temp_dir.path().join(name);
            std::fs::write(&path, name.as_bytes()).unwrap();
            fingerprinter.fingerprint(&path).await.unwrap();
            paths.push(path);
        }
        assert_eq!(fingerprinter.memo.lock().entries.len(), 2);
        assert!(!fingerprinter.memo.lock().entries.contains_key(&paths[0]));

        fingerprinter.forget(&paths[2]);
        assert_eq!(fingerprinter.memo.lock().entries.len(), 1);
        assert_eq!(fingerprinter.memo.lock().order.len(), 1);

        let (again, _) = fingerprinter.fingerprint(&paths[0]).await.unwrap();
        assert_eq!(again, Fingerprint::of_bytes(b"a.mov"));
        assert_eq!(fingerprinter.memo.lock().entries.len(), 2);
    }
}
