//! # Inline Video - Main Entry Point
//!
//! Punto di ingresso della CLI.
//!
//! ## Responsabilità:
//! - Parsing degli argomenti della command line con `clap`
//! - Inizializzazione del sistema di logging con `tracing`
//! - Caricamento della configurazione e override da CLI
//! - Dispatch dei sottocomandi `embed`, `cache`, `resolve`
//!
//! ## Esempio di utilizzo:
//! ```bash
//! inline-video embed --document note.html ~/Videos/clip.mov ~/Videos/trip/ --workers 4
//! inline-video cache
//! inline-video resolve --document note.html
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use inline_video::document::{DocumentField, FileField};
use inline_video::file_manager::FileManager;
use inline_video::progress::{EmbedStats, ProgressManager};
use inline_video::{
    Config, ConfigResolver, ConversionCache, FieldPatcher, GlobalConfig, MediaReference, PendingPatch,
    PipelineError, Pipeline, Submission,
};

#[derive(Parser)]
#[command(name = "inline-video")]
#[command(about = "Embed videos inline, converting unsupported formats in the background")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory for converted artifacts and the cache index
    #[arg(long, global = true)]
    artifact_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Embed media files into a document, converting them when needed
    Embed {
        /// HTML document to embed into
        #[arg(short, long)]
        document: PathBuf,

        /// Number of parallel conversions
        #[arg(short, long)]
        workers: Option<usize>,

        /// Media files or directories
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Reconcile the conversion cache and list its entries
    Cache,
    /// Print the resolved player configuration of every embed in a document
    Resolve {
        #[arg(short, long)]
        document: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .await
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = args.artifact_dir {
        config.artifact_dir = dir;
    }

    match args.command {
        Command::Embed {
            document,
            workers,
            paths,
        } => {
            if let Some(workers) = workers {
                config.workers = workers;
            }
            config.validate()?;
            embed(config, &document, &paths).await
        }
        Command::Cache => show_cache(&config).await,
        Command::Resolve { document } => resolve(&config, &document).await,
    }
}

async fn embed(config: Config, document: &Path, paths: &[PathBuf]) -> Result<()> {
    let mut media = Vec::new();
    for path in paths {
        if !path.exists() {
            return Err(anyhow::anyhow!("Media path does not exist: {}", path.display()));
        }
        media.extend(FileManager::find_video_files(path));
    }
    if media.is_empty() {
        info!("No video files found");
        return Ok(());
    }

    let pipeline = Pipeline::from_config(&config).await?;
    let field: Arc<dyn DocumentField> = Arc::new(FileField::new(document));
    let progress = ProgressManager::new(media.len() as u64);

    let mut events = pipeline.scheduler().subscribe();
    let observer = {
        let progress = progress.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => progress.observe(&event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    let mut stats = EmbedStats::new();
    let mut pending: VecDeque<(PathBuf, PendingPatch)> = VecDeque::new();

    for path in media {
        let reference = MediaReference::new(&path);
        insert_embed(field.as_ref(), &pipeline.render(&reference)).await?;

        loop {
            match pipeline.reference_added(field.clone(), &reference).await {
                Ok(Submission::Native) => {
                    stats.add_native();
                    progress.update(&format!("▶️  {} (native)", display_name(&path)));
                }
                Ok(Submission::Patched(_)) => {
                    stats.add_reused();
                    progress.update(&format!("♻️  {}", display_name(&path)));
                }
                Ok(Submission::Pending(patch)) => pending.push_back((path.clone(), patch)),
                Err(PipelineError::QueueSaturated { .. }) if !pending.is_empty() => {
                    if let Some((done, patch)) = pending.pop_front() {
                        settle(&done, patch, &mut stats, &progress).await;
                    }
                    continue;
                }
                Err(e) => {
                    warn!("❌ {}: {}", path.display(), e);
                    stats.add_failed();
                    progress.update(&format!("❌ {}", display_name(&path)));
                }
            }
            break;
        }
    }

    let remaining: Vec<_> = pending.into_iter().collect();
    let progress_ref = &progress;
    let outcomes = join_all(remaining.into_iter().map(|(path, patch)| async move {
        let outcome = patch.wait().await;
        progress_ref.update(&display_name(&path));
        (path, outcome)
    }))
    .await;
    for (path, outcome) in outcomes {
        record_outcome(&path, outcome, &mut stats);
    }

    pipeline.shutdown();
    observer.abort();
    progress.finish(&stats.format_summary());
    info!("{}", stats.format_summary());
    Ok(())
}

async fn settle(path: &Path, patch: PendingPatch, stats: &mut EmbedStats, progress: &ProgressManager) {
    let outcome = patch.wait().await;
    progress.update(&display_name(path));
    record_outcome(path, outcome, stats);
}

fn record_outcome(path: &Path, outcome: inline_video::Result<inline_video::CacheEntry>, stats: &mut EmbedStats) {
    match outcome {
        Ok(entry) => stats.add_converted(entry.source_size, entry.artifact_size),
        Err(e) => {
            warn!("❌ {} left unconverted: {}", path.display(), e);
            stats.add_failed();
        }
    }
}

/// Append embed markup to the end of the document
async fn insert_embed(field: &dyn DocumentField, markup: &str) -> Result<()> {
    loop {
        let current = field.snapshot().await?;
        let mut updated = current.clone();
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(markup);
        updated.push('\n');
        if field.replace(&current, updated).await? {
            return Ok(());
        }
    }
}

async fn show_cache(config: &Config) -> Result<()> {
    let cache = ConversionCache::open(config.cache_index_path()).await?;
    let mut entries: Vec<_> = cache.entries().collect();
    entries.sort_by_key(|entry| entry.created_at);

    for entry in entries {
        println!(
            "{}  {}  {} -> {}",
            entry.fingerprint.short(),
            entry.artifact.display(),
            FileManager::format_size(entry.source_size),
            FileManager::format_size(entry.artifact_size)
        );
    }

    let (count, source, artifact) = cache.stats();
    println!(
        "{} entries | sources: {} | artifacts: {}",
        count,
        FileManager::format_size(source),
        FileManager::format_size(artifact)
    );
    Ok(())
}

async fn resolve(config: &Config, document: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(document)
        .await
        .with_context(|| format!("reading {}", document.display()))?;
    let global = GlobalConfig::new(config.player.to_override());

    for reference in FieldPatcher::references(&content) {
        let resolved = ConfigResolver::resolve_markup(&global, &reference.body);
        println!("{}  {}", reference.id, reference.src.as_deref().unwrap_or("-"));
        for line in ConfigResolver::serialize(&resolved).lines() {
            println!("    {}", line);
        }
    }
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
