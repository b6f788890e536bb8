use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use cairn_config::{logging, Config};
use cairn_engine::{Engine, EngineOptions, MountTree};

#[derive(Parser, Debug)]
#[command(name = "cairn")]
#[command(version, about = "Local content-addressed repository indexer")]
struct Cli {
    /// Store directory (defaults to $STORE, then the user config dir).
    #[arg(long)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile the index with the published filesystem trees
    Scan,

    /// Hash files the scanner left unhashed
    Hash {
        /// Number of hashing worker threads (defaults to min(4, cpus))
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Write the manifest artifacts
    Publish {
        /// Write even when the index is unchanged
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// Scan, hash and publish in one pass
    Run {
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Print index counters and artifact roots
    Status,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let store_root = cairn_config::store_root(cli.store.as_deref())
        .context("failed to resolve the store directory")?;
    std::fs::create_dir_all(&store_root)
        .with_context(|| format!("failed to create store directory {}", store_root.display()))?;

    let config = Config::load(&store_root)
        .with_context(|| format!("unreadable configuration in {}", store_root.display()))?;
    logging::init(config.log_level);

    let mut mounts = MountTree::new();
    for p in &config.published_paths {
        mounts
            .insert(&p.virtual_path, p.fs.clone())
            .with_context(|| format!("invalid published path {:?}", p.virtual_path))?;
    }

    let engine = Engine::open(
        &store_root,
        mounts,
        EngineOptions {
            piece_size: config.blake3_piece_size,
            ..EngineOptions::default()
        },
    )
    .with_context(|| format!("failed to open store in {}", store_root.display()))?;

    let threads = |cli_threads: Option<usize>| {
        cli_threads.or(config.hash_threads.map(|n| n as usize))
    };

    match cli.cmd {
        Command::Scan => {
            let stats = run_scan(&engine);
            tracing::info!(
                dirs = stats.dirs,
                added = stats.added,
                deleted = stats.deleted,
                "scan finished"
            );
        }

        Command::Hash { threads: t } => {
            let stats = engine.hash_pending(threads(t))?;
            tracing::info!(hashed = stats.hashed, skipped = stats.skipped, "hashing finished");
        }

        Command::Publish { force } => match engine.publish(force)? {
            Some(roots) => print_roots(&roots),
            None => println!("index unchanged, nothing written"),
        },

        Command::Run { threads: t } => {
            let scan = run_scan(&engine);
            let hash = engine.hash_pending(threads(t))?;
            tracing::info!(
                dirs = scan.dirs,
                added = scan.added,
                deleted = scan.deleted,
                hashed = hash.hashed,
                skipped = hash.skipped,
                "index refreshed"
            );
            if let Some(roots) = engine.publish(false)? {
                print_roots(&roots);
            }
        }

        Command::Status => {
            let status = engine.status()?;
            println!("directories:    {}", status.dirs);
            println!("hashed files:   {}", status.hashed_files);
            println!("unhashed files: {}", status.unhashed_files);
            println!("total bytes:    {}", status.total_bytes);
            println!("hash list:      {} entries", status.hash_list_len);
            match status.dir_listing_root {
                Some(r) => println!("dir listing:    {}", hex::encode(r)),
                None => println!("dir listing:    (none)"),
            }
            match status.hash_list_root {
                Some(r) => println!("hash list root: {}", hex::encode(r)),
                None => println!("hash list root: (none)"),
            }
        }
    }
    Ok(())
}

/// Scan errors are runtime errors: logged, never fatal to the process.
fn run_scan(engine: &Engine) -> cairn_engine::ScanStats {
    match engine.scan() {
        Ok(stats) => stats,
        Err(e) => {
            tracing::error!(error = %e, "scan failed");
            cairn_engine::ScanStats::default()
        }
    }
}

fn print_roots(roots: &cairn_engine::PublishedRoots) {
    println!("dir listing:    {}", hex::encode(roots.dir_listing));
    match roots.hash_list {
        Some(r) => println!("hash list root: {} ({} hashes)", hex::encode(r), roots.hash_count),
        None => println!("hash list root: (no hashed files yet)"),
    }
}
