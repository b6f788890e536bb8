//! Manifest artifacts.
//!
//! Two artifacts are exported for peer synchronization, both under `obj/`
//! and both named by the lowercase hex of their own BLAKE3 root:
//!
//! - the directory listing: a streamed, nested encoding of the whole
//!   tree. Each directory is `[subdir_names, files, subdirs]` with
//!   indefinite-length arrays, subdirectory names ahead of their contents
//!   so a consumer can stream the shape without reading every file entry.
//!   Files are maps `{0: name, 1: size, 2: b3}`; only hashed files appear.
//! - the hash list: the sorted distinct 32-byte file hashes, raw. Absent
//!   while nothing is hashed.
//!
//! Artifacts are written to a temporary name, memory-mapped, hashed, and
//! renamed to their digest; a follow-up write transaction records the new
//! roots and the previous artifacts are unlinked. Writes are throttled by
//! a persistent dirty flag plus a per-process interval.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use memmap2::Mmap;
use tracing::{debug, info};

use cairn_codec::{Decoder, Encoder};
use cairn_hash::{hash_piece, Blake3Hash, EMPTY_HASH};
use cairn_store::keys::{DirEntry, HDR_DIR_LIST_ROOT, HDR_HASH_LIST_LEN, HDR_HASH_LIST_ROOT, ROOT_DIR_ID};
use cairn_store::{self as store, Db, DirCursor, HashIter, Result as StoreResult, RoTxn};

use crate::{Engine, EngineError, Result};

/// Default minimum interval between throttled manifest writes.
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Roots of the artifacts produced by one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedRoots {
    pub dir_listing: Blake3Hash,
    pub hash_list: Option<Blake3Hash>,
    pub hash_count: u64,
}

/// Per-process write throttle.
#[derive(Debug)]
pub(crate) struct Throttle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Whether the interval has elapsed; records the attempt when it has.
    pub(crate) fn ready(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        match *last {
            Some(t) if t.elapsed() < self.interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

/// Write both artifacts if the index changed since the last write (or
/// unconditionally with `force`). Returns the new roots, or `None` when
/// the writer had nothing to do.
pub(crate) fn publish(engine: &Engine, force: bool) -> Result<Option<PublishedRoots>> {
    // Clearing the flag before writing lets concurrent updates re-mark it.
    let dirty = engine.store().update(|txn, db| store::take_dirty(txn, db))?;
    if !dirty && !force {
        debug!("index unchanged since last manifest write");
        return Ok(None);
    }

    let obj = engine.obj_dir();
    fs::create_dir_all(obj)?;

    let (dir_tmp, hash_tmp, hash_count) = engine.store().read(|txn, db| {
        let dir_tmp = write_dir_listing(txn, db, obj)?;
        let (hash_tmp, hash_count) = write_hash_list(txn, db, obj)?;
        Ok((dir_tmp, hash_tmp, hash_count))
    })?;

    let (dir_root, _) = seal(obj, dir_tmp)?;
    let hash_root = match hash_tmp {
        Some(tmp) => Some(seal(obj, tmp)?.0),
        None => None,
    };

    let stale = engine.store().update(|txn, db| {
        let mut stale: Vec<PathBuf> = Vec::new();
        let old = store::artifact_root(txn, db, HDR_DIR_LIST_ROOT)?;
        if old != Some(dir_root) {
            store::set_artifact_root(txn, db, HDR_DIR_LIST_ROOT, &dir_root)?;
            if let Some(old) = old {
                stale.push(obj.join(hex::encode(old)));
            }
        }
        let old = store::artifact_root(txn, db, HDR_HASH_LIST_ROOT)?;
        match hash_root {
            Some(root) => {
                if old != Some(root) {
                    store::set_artifact_root(txn, db, HDR_HASH_LIST_ROOT, &root)?;
                    store::set_hash_list_len(txn, db, hash_count)?;
                    if let Some(old) = old {
                        stale.push(obj.join(hex::encode(old)));
                    }
                }
            }
            None => {
                if let Some(old) = old {
                    store::del_header(txn, db, HDR_HASH_LIST_ROOT)?;
                    store::del_header(txn, db, HDR_HASH_LIST_LEN)?;
                    stale.push(obj.join(hex::encode(old)));
                }
            }
        }
        Ok(stale)
    })?;

    for path in stale {
        if let Err(e) = fs::remove_file(&path) {
            debug!(path = %path.display(), error = %e, "stale artifact already gone");
        }
    }

    info!(
        dir_listing = %hex::encode(dir_root),
        hash_list = ?hash_root.map(hex::encode),
        hash_count,
        "manifests written"
    );
    Ok(Some(PublishedRoots {
        dir_listing: dir_root,
        hash_list: hash_root,
        hash_count,
    }))
}

/// Stream the directory-listing artifact to a temporary file. Depth-first
/// with an explicit frame stack; one read transaction sees a consistent
/// tree.
fn write_dir_listing(txn: &RoTxn, db: Db, obj: &Path) -> StoreResult<PathBuf> {
    let tmp = obj.join(format!("tmp.dirs.{}", std::process::id()));
    let file = File::create(&tmp)?;
    let mut enc = Encoder::new(BufWriter::new(file));

    let subdirs = open_directory(&mut enc, txn, db, ROOT_DIR_ID)?;
    let mut stack = vec![subdirs.into_iter()];
    while let Some(top) = stack.last_mut() {
        match top.next() {
            Some(id) => {
                let subdirs = open_directory(&mut enc, txn, db, id)?;
                stack.push(subdirs.into_iter());
            }
            None => {
                // Close the subdirs array, then the directory itself.
                enc.end()?;
                enc.end()?;
                stack.pop();
            }
        }
    }
    enc.into_inner().flush()?;
    Ok(tmp)
}

/// Emit one directory's head (names and files) and leave its subdirs
/// array open. Returns the subdirectory identifiers in name order.
fn open_directory<W: Write>(
    enc: &mut Encoder<W>,
    txn: &RoTxn,
    db: Db,
    dir_id: u64,
) -> StoreResult<Vec<u64>> {
    let mut subdir_names: Vec<String> = Vec::new();
    let mut subdir_ids: Vec<u64> = Vec::new();
    let mut files: Vec<(String, u64, Blake3Hash)> = Vec::new();

    let mut cur = DirCursor::new(dir_id);
    while let Some((name, ent)) = cur.next(txn, db)? {
        let name = String::from_utf8(name).map_err(|_| {
            cairn_store::StoreError::Corrupt("non-UTF-8 entry name in directory tree".into())
        })?;
        match ent {
            DirEntry::Subdir { id } => {
                subdir_names.push(name);
                subdir_ids.push(id);
            }
            DirEntry::Hashed { size, b3, .. } => files.push((name, size, b3)),
            DirEntry::Unhashed { .. } => {}
        }
    }

    enc.begin_array()?; // directory
    enc.begin_array()?;
    for name in &subdir_names {
        enc.text(name)?;
    }
    enc.end()?;
    enc.begin_array()?;
    for (name, size, b3) in &files {
        enc.map(3)?;
        enc.uint(0)?;
        enc.text(name)?;
        enc.uint(1)?;
        enc.uint(*size)?;
        enc.uint(2)?;
        enc.bytes(b3)?;
    }
    enc.end()?;
    enc.begin_array()?; // subdirs, closed by the caller
    Ok(subdir_ids)
}

/// Write the sorted distinct file hashes to a temporary file. Returns
/// `None` when no file is hashed yet.
fn write_hash_list(txn: &RoTxn, db: Db, obj: &Path) -> StoreResult<(Option<PathBuf>, u64)> {
    let tmp = obj.join(format!("tmp.hashes.{}", std::process::id()));
    let file = File::create(&tmp)?;
    let mut w = BufWriter::new(file);

    let mut iter = HashIter::new();
    let mut count = 0u64;
    while let Some(b3) = iter.next(txn, db)? {
        w.write_all(&b3)?;
        count += 1;
    }
    w.flush()?;
    drop(w);

    if count == 0 {
        fs::remove_file(&tmp)?;
        Ok((None, 0))
    } else {
        Ok((Some(tmp), count))
    }
}

/// Content-address a finished temporary file: mmap, hash, rename to the
/// lowercase hex of the root.
fn seal(obj: &Path, tmp: PathBuf) -> Result<(Blake3Hash, PathBuf)> {
    let file = File::open(&tmp)?;
    let root = if file.metadata()?.len() == 0 {
        EMPTY_HASH
    } else {
        let mmap = unsafe { Mmap::map(&file)? };
        hash_piece(0, &mmap).root()
    };
    let path = obj.join(hex::encode(root));
    fs::rename(&tmp, &path)?;
    Ok((root, path))
}

/// Decoded form of the directory-listing artifact.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DirListing {
    /// Subdirectories, in name order, with their decoded contents.
    pub subdirs: Vec<(String, DirListing)>,
    /// Hashed files: (name, size, root).
    pub files: Vec<(String, u64, Blake3Hash)>,
}

/// Decode a directory-listing artifact, for consumers and round-trip
/// checks.
pub fn decode_directory(bytes: &[u8]) -> Result<DirListing> {
    let mut dec = Decoder::new(bytes);
    let listing = decode_dir(&mut dec)?;
    if !dec.is_end() {
        return Err(EngineError::Manifest("trailing bytes after listing".into()));
    }
    Ok(listing)
}

fn streamed_array(dec: &mut Decoder) -> Result<()> {
    match dec.array()? {
        None => Ok(()),
        Some(_) => Err(EngineError::Manifest(
            "expected an indefinite-length array".into(),
        )),
    }
}

fn decode_dir(dec: &mut Decoder) -> Result<DirListing> {
    streamed_array(dec)?;
    let mut names: Vec<String> = Vec::new();
    streamed_array(dec)?;
    while !dec.at_break() {
        names.push(dec.text()?.to_owned());
    }
    dec.break_marker()?;

    let mut files = Vec::new();
    streamed_array(dec)?;
    while !dec.at_break() {
        if dec.map()? != Some(3) {
            return Err(EngineError::Manifest("file entry is not a 3-entry map".into()));
        }
        let mut name = None;
        let mut size = None;
        let mut b3 = None;
        for _ in 0..3 {
            match dec.uint()? {
                0 => name = Some(dec.text()?.to_owned()),
                1 => size = Some(dec.uint()?),
                2 => {
                    let raw = dec.bytes()?;
                    let hash: Blake3Hash = raw
                        .try_into()
                        .map_err(|_| EngineError::Manifest("file hash is not 32 bytes".into()))?;
                    b3 = Some(hash);
                }
                k => {
                    return Err(EngineError::Manifest(format!("unknown file map key {k}")));
                }
            }
        }
        match (name, size, b3) {
            (Some(name), Some(size), Some(b3)) => files.push((name, size, b3)),
            _ => return Err(EngineError::Manifest("incomplete file entry".into())),
        }
    }
    dec.break_marker()?;

    let mut subdirs = Vec::new();
    streamed_array(dec)?;
    for name in names {
        subdirs.push((name, decode_dir(dec)?));
    }
    dec.break_marker()?; // subdirs
    dec.break_marker()?; // directory
    Ok(DirListing { subdirs, files })
}
