//! # Progress Tracking and Statistics Module
//!
//! Feedback da terminale per il comando `embed`.
//!
//! ## Responsabilità:
//! - Progress bar con `indicatif` sui riferimenti da completare
//! - Messaggi di stato pilotati dagli eventi dello scheduler
//! - Statistiche finali: nativi, convertiti, riusati dalla cache, falliti
//!
//! ## Visual feedback:
//! ```text
//! ⠋ [00:02:15] [========================================] 3/3 (100%) ✅ clip.mov
//! ```

use crate::file_manager::FileManager;
use crate::scheduler::JobEvent;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Progress bar over the references of one run
#[derive(Clone)]
pub struct ProgressManager {
    bar: ProgressBar,
}

impl ProgressManager {
    pub fn new(total: u64) -> Self {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    /// Hidden bar, for quiet runs and tests
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    /// One reference is done
    pub fn update(&self, message: &str) {
        self.bar.inc(1);
        self.bar.set_message(message.to_string());
    }

    pub fn set_message(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    /// Reflect a scheduler event in the status line
    pub fn observe(&self, event: &JobEvent) {
        let message = match event {
            JobEvent::Queued { fingerprint, .. } => format!("📥 queued {}", fingerprint.short()),
            JobEvent::Started { fingerprint, attempt } => {
                format!("🎬 converting {} (attempt {})", fingerprint.short(), attempt)
            }
            JobEvent::Succeeded { entry } => format!(
                "✅ {} ({})",
                entry.fingerprint.short(),
                FileManager::format_size(entry.artifact_size)
            ),
            JobEvent::Failed { fingerprint, error, .. } => format!("❌ {}: {}", fingerprint.short(), error),
        };
        self.set_message(&message);
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }
}

/// Counters for one `embed` run
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EmbedStats {
    pub native: usize,
    pub converted: usize,
    pub reused: usize,
    pub failed: usize,
    pub source_bytes: u64,
    pub artifact_bytes: u64,
}

impl EmbedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_native(&mut self) {
        self.native += 1;
    }

    pub fn add_converted(&mut self, source_size: u64, artifact_size: u64) {
        self.converted += 1;
        self.source_bytes += source_size;
        self.artifact_bytes += artifact_size;
    }

    pub fn add_reused(&mut self) {
        self.reused += 1;
    }

    pub fn add_failed(&mut self) {
        self.failed += 1;
    }

    pub fn total(&self) -> usize {
        self.native + self.converted + self.reused + self.failed
    }

    pub fn format_summary(&self) -> String {
        format!(
            "Embedded: {} | Native: {} | Converted: {} ({} -> {}) | From cache: {} | Failed: {}",
            self.total(),
            self.native,
            self.converted,
            FileManager::format_size(self.source_bytes),
            FileManager::format_size(self.artifact_bytes),
            self.reused,
            self.failed
        )
    }
}
