//! # Document Field Module
//!
//! Il campo di testo (HTML) che ospita gli embed. L'editor può modificarlo in
//! qualsiasi momento, quindi ogni scrittura è un compare-and-swap sul contenuto letto.
//!
//! ## Implementazioni:
//! - `FileField`: un file HTML su disco, scritto con rename atomico
//! - `MemoryField`: contenuto in memoria, usato da test ed embedding in-process

use crate::error::Result;
use crate::file_manager::FileManager;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use tokio::fs;

/// A document field that can change underneath a pending patch
#[async_trait]
pub trait DocumentField: Send + Sync {
    /// Current content of the field
    async fn snapshot(&self) -> Result<String>;

    /// Replace the content only if it still equals `expected`.
    ///
    /// Returns `false` when the field changed since `expected` was read.
    async fn replace(&self, expected: &str, content: String) -> Result<bool>;
}

/// HTML document stored in a file
pub struct FileField {
    path: PathBuf,
    /// Serializes in-process writers; external editors are caught by the content check
    write_lock: tokio::sync::Mutex<()>,
}

impl FileField {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl DocumentField for FileField {
    async fn snapshot(&self) -> Result<String> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, expected: &str, content: String) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        if self.snapshot().await? != expected {
            return Ok(false);
        }
        FileManager::write_atomic(&self.path, content.into_bytes()).await?;
        Ok(true)
    }
}

/// In-memory field
#[derive(Default)]
pub struct MemoryField {
    content: Mutex<String>,
}

impl MemoryField {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: Mutex::new(content.into()),
        }
    }

    pub fn content(&self) -> String {
        self.content.lock().clone()
    }

    /// Unconditional edit, as the user typing in the editor
    pub fn edit(&self, f: impl FnOnce(&mut String)) {
        f(&mut self.content.lock());
    }
}

#[async_trait]
impl DocumentField for MemoryField {
    async fn snapshot(&self) -> Result<String> {
        Ok(self.content())
    }

    async fn replace(&self, expected: &str, content: String) -> Result<bool> {
        let mut current = self.content.lock();
        if *current != expected {
            return Ok(false);
        }
        *current = content;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_field_rejects_stale_replace() {
        let field = MemoryField::new("<p>one</p>");
        let seen = field.snapshot().await.unwrap();
        field.edit(|content| content.push_str("<p>two</p>"));

        assert!(!field.replace(&seen, "patched".to_string()).await.unwrap());
        assert_eq!(field.content(), "<p>one</p><p>two</p>");

        let seen = field.snapshot().await.unwrap();
        assert!(field.replace(&seen, "patched".to_string()).await.unwrap());
        assert_eq!(field.content(), "patched");
    }

    #[tokio::test]
    async fn test_file_field_replace() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("note.html");
        std::fs::write(&path, "<p>draft</p>").unwrap();
        let field = FileField::new(&path);

        let seen = field.snapshot().await.unwrap();
        std::fs::write(&path, "<p>edited</p>").unwrap();
        assert!(!field.replace(&seen, "patched".to_string()).await.unwrap());

        let seen = field.snapshot().await.unwrap();
        assert!(field.replace(&seen, "patched".to_string()).await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "patched");
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let temp_dir = TempDir::new().unwrap();
        let field = FileField::new(temp_dir.path().join("new.html"));
        assert_eq!(field.snapshot().await.unwrap(), "");
    }
}
