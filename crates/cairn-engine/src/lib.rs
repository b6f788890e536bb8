//! # cairn-engine
//!
//! Indexing engine for the cairn content-addressed repository.
//!
//! The engine maintains a persistent index of every regular file under
//! the published mount points, keyed by BLAKE3 hash, and exports two
//! content-addressed manifest artifacts for peer synchronization. One
//! [`Engine`] handle owns all process-wide state (the store, the mount
//! tree, the hash queue and the publish throttle) and is shared by
//! reference across the scanner thread and the hashing workers.
//!
//! ```no_run
//! use cairn_engine::{Engine, EngineOptions, MountTree};
//! # fn main() -> cairn_engine::Result<()> {
//! let mut mounts = MountTree::new();
//! mounts.insert("docs", "/srv/docs".into())?;
//! let engine = Engine::open("/var/lib/cairn".as_ref(), mounts, EngineOptions::default())?;
//! engine.scan()?;
//! engine.hash_pending(None)?;
//! engine.publish(false)?;
//! # Ok(())
//! # }
//! ```

pub mod mounts;
pub mod queue;
pub mod vpath;

mod hasher;
mod manifest;
mod scanner;

pub use hasher::{default_threads, HashStats};
pub use manifest::{decode_directory, DirListing, PublishedRoots, DEFAULT_PUBLISH_INTERVAL};
pub use mounts::MountTree;
pub use queue::{HashQueue, QueueEntry};
pub use scanner::ScanStats;

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use cairn_hash::{Blake3Hash, CHUNK_LEN};
use cairn_store::keys::{self, DirEntry, HDR_DIR_LIST_ROOT, HDR_HASH_LIST_ROOT};
use cairn_store::{self as store, Store};

/// Errors raised by the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] cairn_store::StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] cairn_codec::CodecError),

    #[error("invalid virtual path: {0}")]
    Path(String),

    #[error("duplicate mount for {0:?}")]
    DuplicateMount(String),

    #[error("no mount resolves {0:?}")]
    Unresolved(String),

    #[error("invalid piece size {0}: must be a power of two of at least 1024")]
    PieceSize(u64),

    #[error("malformed manifest artifact: {0}")]
    Manifest(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Default piece size: 1 MiB.
pub const DEFAULT_PIECE_SIZE: u64 = 1024 * 1024;

/// Tunables for [`Engine::open`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Piece size in bytes; a power of two, at least the BLAKE3 chunk
    /// length.
    pub piece_size: u64,
    /// Minimum interval between throttled manifest writes.
    pub publish_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            piece_size: DEFAULT_PIECE_SIZE,
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
        }
    }
}

/// Aggregate index counters, for status reporting.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Status {
    pub dirs: u64,
    pub hashed_files: u64,
    pub unhashed_files: u64,
    pub total_bytes: u64,
    pub hash_list_len: u64,
    pub dir_listing_root: Option<Blake3Hash>,
    pub hash_list_root: Option<Blake3Hash>,
}

/// The process-wide engine handle.
pub struct Engine {
    store: Store,
    mounts: MountTree,
    queue: HashQueue,
    piece_size: usize,
    obj_dir: PathBuf,
    throttle: manifest::Throttle,
}

impl Engine {
    /// Open the engine over a store root directory (`db/` and `obj/` live
    /// beneath it).
    pub fn open(store_root: &Path, mounts: MountTree, opts: EngineOptions) -> Result<Engine> {
        if !opts.piece_size.is_power_of_two() || opts.piece_size < CHUNK_LEN as u64 {
            return Err(EngineError::PieceSize(opts.piece_size));
        }
        let store = Store::open(&store_root.join("db"))?;
        Ok(Engine {
            store,
            mounts,
            queue: HashQueue::new(),
            piece_size: opts.piece_size as usize,
            obj_dir: store_root.join("obj"),
            throttle: manifest::Throttle::new(opts.publish_interval),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn mounts(&self) -> &MountTree {
        &self.mounts
    }

    pub fn queue(&self) -> &HashQueue {
        &self.queue
    }

    pub fn piece_size(&self) -> usize {
        self.piece_size
    }

    pub(crate) fn obj_dir(&self) -> &Path {
        &self.obj_dir
    }

    /// Reconcile the persisted tree with the published filesystems.
    pub fn scan(&self) -> Result<ScanStats> {
        scanner::scan(self)
    }

    /// Hash everything the scanner left unhashed. `threads` defaults to
    /// [`default_threads`].
    pub fn hash_pending(&self, threads: Option<usize>) -> Result<HashStats> {
        let threads = threads.unwrap_or_else(default_threads).max(1);
        hasher::run(self, threads)
    }

    /// Write the manifest artifacts now. With `force` the write happens
    /// even when the index is unchanged.
    pub fn publish(&self, force: bool) -> Result<Option<PublishedRoots>> {
        manifest::publish(self, force)
    }

    /// Throttled manifest write: at most one attempt per configured
    /// interval, and only when the index changed.
    pub fn maybe_publish(&self) -> Result<Option<PublishedRoots>> {
        if !self.throttle.ready() {
            return Ok(None);
        }
        manifest::publish(self, false)
    }

    /// Walk the index and report aggregate counters.
    pub fn status(&self) -> Result<Status> {
        let status = self.store.read(|txn, db| {
            let mut status = Status::default();
            for item in db.prefix_iter(txn, &[keys::NS_DIR_ENTRY][..])? {
                let (_, value) = item?;
                match DirEntry::decode(value)? {
                    DirEntry::Subdir { .. } => status.dirs += 1,
                    DirEntry::Unhashed { size, .. } => {
                        status.unhashed_files += 1;
                        status.total_bytes += size;
                    }
                    DirEntry::Hashed { size, .. } => {
                        status.hashed_files += 1;
                        status.total_bytes += size;
                    }
                }
            }
            status.hash_list_len = store::hash_list_len(txn, db)?;
            status.dir_listing_root = store::artifact_root(txn, db, HDR_DIR_LIST_ROOT)?;
            status.hash_list_root = store::artifact_root(txn, db, HDR_HASH_LIST_ROOT)?;
            Ok(status)
        })?;
        Ok(status)
    }
}
