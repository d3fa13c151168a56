//! Bagcache CLI - Handle pool inspection
//!
//! Opens bags through a [`Manager`] configured like a long-running service
//! would be, and prints what the pool holds afterwards.

use anyhow::{Context, Result};
use bagcache_common::CacheConfig;
use bagcache_core::{BagFile, HandleSummary, Manager, ManagerStats};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "bagcache")]
#[command(about = "Bag handle cache inspection")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "bagcache.toml", env = "BAGCACHE_CONFIG")]
    config: PathBuf,

    /// Log level (overrides the configuration file)
    #[arg(long)]
    log_level: Option<String>,

    /// Maximum number of open bags (overrides the configuration file)
    #[arg(long)]
    max_open: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open bags and print the pool contents
    Open {
        /// Bag files or bag directories
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Build a byte-offset index per bag and optionally query it
    Index {
        /// Bag files or bag directories
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Bytes per indexed chunk
        #[arg(long, default_value = "65536")]
        chunk_size: u64,

        /// Offset to look up in every index
        #[arg(long)]
        nearest: Option<i64>,

        /// Maximum distance for --nearest
        #[arg(long, default_value = "0")]
        tolerance: i64,
    },
}

/// Result of an index lookup on one bag
#[derive(Debug, Serialize)]
struct Lookup {
    path: PathBuf,
    chunks: usize,
    nearest_chunk: Option<usize>,
    nearest_offset: Option<i64>,
}

#[derive(Debug, Serialize)]
struct Report {
    stats: ManagerStats,
    handles: Vec<HandleSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    lookups: Vec<Lookup>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = CacheConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(max_open) = args.max_open {
        config.max_open = max_open;
    }
    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_level.clone());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    info!(
        max_open = config.max_open,
        idle_ttl_secs = config.idle_ttl_secs,
        "starting bag cache"
    );
    let manager = Manager::with_file_opener(config)?;

    let lookups = match args.command {
        Commands::Open { paths } => {
            for path in &paths {
                open(&manager, path);
            }
            Vec::new()
        }
        Commands::Index {
            paths,
            chunk_size,
            nearest,
            tolerance,
        } => {
            anyhow::ensure!(chunk_size > 0, "--chunk-size must be positive");
            let mut lookups = Vec::with_capacity(paths.len());
            for path in &paths {
                match index(&manager, path, chunk_size, nearest, tolerance) {
                    Ok(lookup) => lookups.push(lookup),
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to index bag"),
                }
            }
            lookups
        }
    };

    let report = Report {
        stats: manager.stats(),
        handles: manager.handles(),
        lookups,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    manager.clear();
    Ok(())
}

fn open(manager: &Manager, path: &Path) {
    if let Err(e) = manager.get_handle(path) {
        warn!(path = %path.display(), error = %e, "failed to open bag");
    }
}

fn index(
    manager: &Manager,
    path: &Path,
    chunk_size: u64,
    nearest: Option<i64>,
    tolerance: i64,
) -> Result<Lookup> {
    let handle = manager.get_handle(path)?;
    let series_id = format!("bytes/{chunk_size}");
    let index = handle.get_or_build_index(&series_id, || -> Result<Vec<i64>> {
        let bag = handle.acquire()?;
        chunk_offsets(&bag, chunk_size)
    })?;

    let nearest_chunk = nearest.and_then(|target| index.find_nearest(target, tolerance));
    Ok(Lookup {
        path: path.to_path_buf(),
        chunks: index.len(),
        nearest_chunk,
        nearest_offset: nearest_chunk.map(|i| index.timestamps()[i]),
    })
}

/// Read the whole data file and return the start offset of every chunk
fn chunk_offsets(bag: &BagFile, chunk_size: u64) -> Result<Vec<i64>> {
    let mut reader = bag.file().context("bag file is closed")?;
    let mut offsets = Vec::new();
    let mut offset: u64 = 0;
    loop {
        let read = io::copy(&mut reader.by_ref().take(chunk_size), &mut io::sink())?;
        if read == 0 {
            break;
        }
        offsets.push(i64::try_from(offset)?);
        offset += read;
    }
    Ok(offsets)
}
