//! Hash work queue.
//!
//! A bounded in-memory cache of unhashed file entries backed by the
//! persisted directory tree. The cache is refilled from a resume cursor
//! (the virtual path of the last cached entry) so the walk never has to
//! hold more than the cache capacity in memory, and aggregate counters
//! report how much work remains.
//!
//! The queue holds no authority over the tree: the scanner may delete or
//! rewrite an entry while its hash is being computed, so `store` re-checks
//! the entry inside the caller's write transaction and silently drops the
//! result when it no longer matches.

use std::sync::Mutex;

use tracing::debug;

use cairn_hash::{Blake3Hash, ChainingValue};
use cairn_store::keys::{self, DirEntry, ROOT_DIR_ID};
use cairn_store::{self as store, Db, DirCursor, Result as StoreResult, RoTxn, RwTxn, StoreError};

use crate::vpath;

/// Cache capacity, in entries.
pub const CACHE_CAP: usize = 100;

/// One unit of hashing work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Identifier of the directory holding the entry.
    pub dir_id: u64,
    /// File size recorded at scan time.
    pub size: u64,
    /// Full virtual path of the file.
    pub vpath: String,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Filled in walk order, then reversed so `pop` yields natural order.
    cache: Vec<QueueEntry>,
    /// Virtual path of the last cached entry, when the walk was cut short.
    resume: Option<String>,
    total_files: u64,
    total_size: u64,
}

/// Shared hashing work queue.
#[derive(Debug, Default)]
pub struct HashQueue {
    state: Mutex<QueueState>,
}

impl HashQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the cache, the counters and the resume cursor. Called whenever
    /// an unhashed entry is deleted, since a cached item may reference it.
    pub fn reset(&self) {
        let mut st = self.state.lock().unwrap();
        *st = QueueState::default();
        debug!("hash queue reset");
    }

    /// Remaining (files, bytes) of hashing work. Advisory: updated under
    /// the queue mutex, so it can briefly disagree with the store.
    pub fn totals(&self) -> (u64, u64) {
        let st = self.state.lock().unwrap();
        (st.total_files, st.total_size)
    }

    /// Fill the cache from the directory tree. Without a resume cursor the
    /// whole tree is walked and the aggregate counters recomputed; with
    /// one, the walk re-enters at the cursor and only fills the cache.
    pub fn populate(&self, txn: &RoTxn, db: Db) -> StoreResult<()> {
        let mut st = self.state.lock().unwrap();
        if !st.cache.is_empty() {
            return Ok(());
        }
        fill(&mut st, txn, db)
    }

    /// Pop the next work item, refilling from the resume cursor when the
    /// cache has drained.
    pub fn next(&self, txn: &RoTxn, db: Db) -> StoreResult<Option<QueueEntry>> {
        let mut st = self.state.lock().unwrap();
        if st.cache.is_empty() && st.resume.is_some() {
            fill(&mut st, txn, db)?;
        }
        Ok(st.cache.pop())
    }

    /// Record a finished hash inside the caller's write transaction.
    ///
    /// The entry is re-read first: it must still exist, still be unhashed
    /// and still have the same size, otherwise the result is dropped (the
    /// scanner won the race). Returns whether the result was stored.
    pub fn store(
        &self,
        txn: &mut RwTxn,
        db: Db,
        entry: &QueueEntry,
        b3: &Blake3Hash,
        pieces: &[ChainingValue],
    ) -> StoreResult<bool> {
        let name = vpath::file_name(&entry.vpath);
        match store::get_dir_entry(txn, db, entry.dir_id, name.as_bytes())? {
            Some(DirEntry::Unhashed { lastmod, size }) if size == entry.size => {
                store::put_dir_entry(
                    txn,
                    db,
                    entry.dir_id,
                    name.as_bytes(),
                    &DirEntry::Hashed {
                        lastmod,
                        size,
                        b3: *b3,
                    },
                )?;
                if !pieces.is_empty() {
                    db.put(txn, &keys::pieces(b3), &keys::encode_pieces(size, pieces))?;
                }
                db.put(txn, &keys::hash_path(b3, &entry.vpath), entry.vpath.as_bytes())?;
                store::mark_dirty(txn, db)?;

                let mut st = self.state.lock().unwrap();
                st.total_files = st.total_files.saturating_sub(1);
                st.total_size = st.total_size.saturating_sub(size);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn utf8_name(name: Vec<u8>) -> StoreResult<String> {
    String::from_utf8(name)
        .map_err(|_| StoreError::Corrupt("non-UTF-8 entry name in directory tree".into()))
}

fn push_component(path: &mut String, name: &str) {
    if !path.is_empty() {
        path.push('/');
    }
    path.push_str(name);
}

fn pop_component(path: &mut String) {
    match path.rfind('/') {
        Some(i) => path.truncate(i),
        None => path.clear(),
    }
}

fn fill(st: &mut QueueState, txn: &RoTxn, db: Db) -> StoreResult<()> {
    debug_assert!(st.cache.is_empty());
    let resume = st.resume.take();
    let counting = resume.is_none();
    if counting {
        st.total_files = 0;
        st.total_size = 0;
    }

    let mut cursors: Vec<DirCursor> = vec![DirCursor::new(ROOT_DIR_ID)];
    let mut dir_ids: Vec<u64> = vec![ROOT_DIR_ID];
    let mut path = String::new();
    // The resume entry itself was handed out last time; drop it on sight.
    let mut skip_exact: Option<&str> = None;
    // An entry consumed while re-entering the tree that still needs the
    // normal treatment.
    let mut pending: Option<(String, DirEntry)> = None;

    if let Some(cursor_path) = resume.as_deref() {
        let mut rest = cursor_path;
        loop {
            let name = vpath::head(rest);
            let rem = vpath::tail(rest);
            let cursor = cursors.last_mut().unwrap();
            cursor.skip_to(name.as_bytes());
            if rem.is_empty() {
                skip_exact = Some(cursor_path);
                break;
            }
            match cursor.next(txn, db)? {
                Some((n, DirEntry::Subdir { id })) if n == name.as_bytes() => {
                    push_component(&mut path, name);
                    cursors.push(DirCursor::new(id));
                    dir_ids.push(id);
                    rest = rem;
                }
                Some((n, ent)) => {
                    // The recorded subtree is gone; treat whatever the
                    // cursor landed on as ordinary walk input.
                    pending = Some((utf8_name(n)?, ent));
                    break;
                }
                None => break,
            }
        }
    }

    'walk: loop {
        let (name, ent) = match pending.take() {
            Some(item) => item,
            None => {
                let Some(cursor) = cursors.last_mut() else {
                    break;
                };
                match cursor.next(txn, db)? {
                    Some((n, ent)) => (utf8_name(n)?, ent),
                    None => {
                        cursors.pop();
                        dir_ids.pop();
                        if !cursors.is_empty() {
                            pop_component(&mut path);
                        }
                        continue;
                    }
                }
            }
        };

        match ent {
            DirEntry::Subdir { id } => {
                push_component(&mut path, &name);
                cursors.push(DirCursor::new(id));
                dir_ids.push(id);
            }
            DirEntry::Unhashed { size, .. } => {
                let full = vpath::join(&path, &name);
                if skip_exact == Some(full.as_str()) {
                    skip_exact = None;
                    continue;
                }
                if counting {
                    st.total_files += 1;
                    st.total_size += size;
                }
                if st.cache.len() < CACHE_CAP {
                    st.cache.push(QueueEntry {
                        dir_id: *dir_ids.last().unwrap(),
                        size,
                        vpath: full,
                    });
                } else if !counting {
                    break 'walk;
                }
            }
            DirEntry::Hashed { .. } => {}
        }
    }

    st.resume = if st.cache.len() == CACHE_CAP {
        st.cache.last().map(|e| e.vpath.clone())
    } else {
        None
    };
    st.cache.reverse();
    debug!(
        cached = st.cache.len(),
        remaining_files = st.total_files,
        "hash queue filled"
    );
    Ok(())
}
