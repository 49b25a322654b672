use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use waferview::config::{CacheBackend, EngineConfig};
use waferview::index::EntryKind;
use waferview::thumbnail::store::{DiskStore, ThumbnailStore};
use waferview::thumbnail::{placeholder, Payload, Priority, ThumbnailEngine};
use waferview::ThumbnailError;

/// Browse wafer-map folders and manage their thumbnail cache
#[derive(Parser, Debug)]
#[command(name = "waferview", version, about)]
struct Cli {
    /// JSON config file; environment variables override its values
    #[arg(long, global = true, env = "WAFERVIEW_CONFIG")]
    config: Option<PathBuf>,

    /// Project root, overriding the config file and PROJECT_ROOT
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List one folder, directories first
    List {
        /// Folder relative to the project root
        #[arg(default_value = "")]
        path: PathBuf,

        /// Print an aligned table instead of JSON
        #[arg(long)]
        table: bool,
    },

    /// Generate thumbnails for every image beneath a folder
    Prewarm {
        #[arg(default_value = "")]
        path: PathBuf,

        /// Edge length of the thumbnail box (defaults to the configured size)
        #[arg(long)]
        size: Option<u32>,
    },

    /// Generate (or fetch) one thumbnail and write it to a file
    Thumb {
        /// Image path relative to the project root
        path: PathBuf,

        #[arg(long)]
        size: Option<u32>,

        /// Output file (defaults to <name>.<format> in the current directory)
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Drop cache entries whose source image changed or disappeared
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("waferview=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    debug!("Effective config: {config:?}");

    match cli.command {
        Command::List { path, table } => list(&config, &path, table),
        Command::Prewarm { path, size } => {
            let size = size.unwrap_or(config.thumbnail_size);
            prewarm(&config, &path, size).await
        }
        Command::Thumb { path, size, out } => {
            let size = size.unwrap_or(config.thumbnail_size);
            thumb(&config, &path, size, out).await
        }
        Command::Sweep => sweep(&config),
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    }
    .apply_env()?;

    if let Some(root) = &cli.root {
        config.root = root.clone();
    }

    Ok(config.validate()?)
}

fn list(config: &EngineConfig, path: &Path, table: bool) -> Result<()> {
    let index = waferview::DirectoryIndex::new(&config.root, config.listing_order, config.skip_dirs.iter().cloned())
        .with_context(|| format!("Cannot open project root {}", config.root.display()))?;
    let entries = index.list(path)?;

    if !table {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for entry in &entries {
        let marker = match entry.kind {
            EntryKind::Directory => "📁",
            EntryKind::File => "  ",
        };
        let size = entry
            .size_bytes
            .map(|bytes| bytes.to_string())
            .unwrap_or_default();
        println!(
            "{marker} {}  {:>12}  {}",
            entry.modified_at.format("%Y-%m-%d %H:%M:%S"),
            size,
            entry.name
        );
    }
    println!("{} entries", entries.len());

    Ok(())
}

async fn prewarm(config: &EngineConfig, path: &Path, size: u32) -> Result<()> {
    let engine = ThumbnailEngine::from_config(config)?;

    println!("🔍 Scanning folder: {}", engine.index().root().join(path).display());
    let report = engine.prewarm_folder(path, size, size)?;
    println!(
        "⏳ {} images found: {} queued, {} already cached, {} skipped",
        report.requested, report.queued, report.already_cached, report.skipped
    );

    // Background jobs have no waiters; poll until the pool drains
    let mut last_reported = 0;
    loop {
        let stats = engine.stats();
        if stats.in_flight == 0 {
            break;
        }

        let finished = stats.generated + stats.failures;
        if finished >= last_reported + 100 {
            last_reported = finished;
            println!("⏳ Generated {finished} thumbnails...");
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    let stats = engine.stats();
    println!(
        "✅ Pre-warm complete: {} generated, {} failed, {} timed out (avg {:.1} ms)",
        stats.generated, stats.failures, stats.timeouts, stats.average_generation_ms
    );
    info!("Final engine stats: {}", serde_json::to_string(&stats)?);

    engine.shutdown().await;
    Ok(())
}

async fn thumb(config: &EngineConfig, path: &Path, size: u32, out: Option<PathBuf>) -> Result<()> {
    let engine = ThumbnailEngine::from_config(config)?;

    let key = engine.key_for(path, size, size)?;
    let payload = match engine.request(key.clone(), Priority::Interactive).await {
        Ok(payload) => payload,
        // Unreadable sources still get an image so grids never show holes
        Err(
            e @ (ThumbnailError::Decode { .. }
            | ThumbnailError::UnsupportedFormat(_)
            | ThumbnailError::Timeout { .. }),
        ) => {
            warn!("{e}; writing placeholder instead");
            Payload::from(placeholder(size, size, config.format)?)
        }
        Err(e) => return Err(e.into()),
    };

    let out = match out {
        Some(out) => out,
        None => {
            let Some(stem) = path.file_stem() else {
                bail!("Cannot derive an output name from {}", path.display());
            };
            PathBuf::from(format!("{}.{}", stem.to_string_lossy(), config.format.extension()))
        }
    };

    tokio::fs::write(&out, &payload)
        .await
        .with_context(|| format!("Failed to write {}", out.display()))?;
    println!("✅ {key} -> {} ({} bytes)", out.display(), payload.len());

    engine.shutdown().await;
    Ok(())
}

fn sweep(config: &EngineConfig) -> Result<()> {
    match config.cache_backend {
        CacheBackend::Disk => {
            let store = DiskStore::open(&config.cache_dir, config.format)?;
            let missing = store.verify()?;
            let report = store.reclaim_stale()?;
            let usage = store.usage()?;
            println!(
                "✅ Sweep complete: {} of {} entries removed ({} bytes freed), {} catalog rows without files",
                report.removed, report.examined, report.bytes_freed, missing
            );
            println!("📦 {} entries, {} bytes in {}", usage.entries, usage.total_bytes, store.dir().display());
        }
        CacheBackend::Memory { .. } => {
            println!("Memory cache lives only inside a running engine; nothing to sweep");
        }
    }

    Ok(())
}
