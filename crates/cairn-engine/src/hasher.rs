//! Hashing worker pool.
//!
//! Workers drain the hash queue until it is empty: pop an entry under a
//! read transaction, resolve its virtual path, memory-map the file,
//! compute the root and per-piece hashes, and store the result under a
//! write transaction. Per-file failures are logged and skipped; a result
//! whose entry changed underneath it is dropped by the queue.

use std::fs::File;

use memmap2::Mmap;
use tracing::{debug, warn};

use cairn_hash::{Blake3Hash, ChainingValue, EMPTY_HASH};

use crate::queue::QueueEntry;
use crate::{Engine, EngineError, Result};

/// Default worker count: up to four threads, never more than the machine
/// has.
pub fn default_threads() -> usize {
    num_cpus::get().clamp(1, 4)
}

/// Counters for one hashing run.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashStats {
    /// Files hashed and stored.
    pub hashed: u64,
    /// Files skipped (I/O failure or lost race with the scanner).
    pub skipped: u64,
    /// Bytes hashed.
    pub bytes: u64,
}

pub(crate) fn run(engine: &Engine, threads: usize) -> Result<HashStats> {
    engine
        .store()
        .read(|txn, db| engine.queue().populate(txn, db))?;
    let (files, bytes) = engine.queue().totals();
    debug!(threads, files, bytes, "hashing starting");

    let stats = std::thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|worker| s.spawn(move || worker_loop(engine, worker)))
            .collect();
        let mut total = HashStats::default();
        for h in handles {
            if let Ok(st) = h.join() {
                total.hashed += st.hashed;
                total.skipped += st.skipped;
                total.bytes += st.bytes;
            }
        }
        total
    });
    Ok(stats)
}

fn worker_loop(engine: &Engine, worker: usize) -> HashStats {
    let mut stats = HashStats::default();
    loop {
        let entry = match engine.store().read(|txn, db| engine.queue().next(txn, db)) {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(worker, error = %e, "hash queue unavailable, worker stopping");
                break;
            }
        };
        match hash_entry(engine, &entry) {
            Ok((b3, pieces)) => {
                let stored = engine
                    .store()
                    .update(|txn, db| engine.queue().store(txn, db, &entry, &b3, &pieces));
                match stored {
                    Ok(true) => {
                        stats.hashed += 1;
                        stats.bytes += entry.size;
                    }
                    Ok(false) => {
                        debug!(path = %entry.vpath, "entry changed while hashing, result dropped");
                        stats.skipped += 1;
                    }
                    Err(e) => {
                        warn!(path = %entry.vpath, error = %e, "storing hash failed");
                        stats.skipped += 1;
                    }
                }
            }
            Err(e) => {
                warn!(path = %entry.vpath, error = %e, "hashing failed, entry skipped");
                stats.skipped += 1;
            }
        }
    }
    debug!(worker, hashed = stats.hashed, skipped = stats.skipped, "hash worker exiting");
    stats
}

fn hash_entry(engine: &Engine, entry: &QueueEntry) -> Result<(Blake3Hash, Vec<ChainingValue>)> {
    let fs_path = engine
        .mounts()
        .resolve(&entry.vpath)
        .ok_or_else(|| EngineError::Unresolved(entry.vpath.clone()))?;
    let file = File::open(&fs_path)?;
    if file.metadata()?.len() == 0 {
        return Ok((EMPTY_HASH, Vec::new()));
    }
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(cairn_hash::hash_file_pieces(&mmap, engine.piece_size()))
}
