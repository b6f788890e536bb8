//! # cairn-store
//!
//! Transactional key-value store for the cairn repository index.
//!
//! Wraps an LMDB environment (via heed) holding one ordered database with
//! the key schema in [`keys`]. The wrapper owns the two store-capacity
//! signals LMDB can raise mid-flight: `MDB_MAP_FULL` grows the map by half
//! and re-runs the transaction body, `MDB_MAP_RESIZED` adopts the new size
//! and re-runs. Bodies must therefore be idempotent given the same
//! committed state; they re-read whatever they need on every attempt.
//!
//! Commits are not synced to disk (`NO_SYNC`); the index is rebuildable
//! from the filesystem, so durability on power loss is not a goal.

pub mod keys;

mod cursor;

pub use cursor::{hash_has_paths, hash_paths, DirCursor, HashIter};

use std::path::Path;
use std::sync::{Condvar, Mutex};

use heed::types::Bytes;
use heed::{Env, EnvFlags, EnvOpenOptions, MdbError, PutFlags};

pub use heed::{RoTxn, RwTxn};
use thiserror::Error;
use tracing::debug;

use cairn_hash::Blake3Hash;

use keys::{
    HDR_DIRTY, HDR_DIR_SEQ, HDR_HASH_LIST_LEN, HDR_VERSION,
};

/// Schema version; a major mismatch refuses to open the store.
pub const SCHEMA_MAJOR: u8 = 1;
pub const SCHEMA_MINOR: u8 = 0;

/// Initial LMDB map size.
const INITIAL_MAP_SIZE: usize = 32 * 1024 * 1024;

const MAX_READERS: u32 = 126;

/// Errors raised by the store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("LMDB error: {0}")]
    Heed(#[from] heed::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store schema {found_major}.{found_minor} is not readable by schema {SCHEMA_MAJOR}.{SCHEMA_MINOR}")]
    Version { found_major: u8, found_minor: u8 },

    #[error("store corrupted: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The single ordered database; raw byte keys and values.
pub type Db = heed::Database<Bytes, Bytes>;

/// How a failed attempt should be retried, if at all.
enum Capacity {
    Full,
    Resized,
}

fn capacity_signal(err: &StoreError) -> Option<Capacity> {
    match err {
        StoreError::Heed(heed::Error::Mdb(MdbError::MapFull)) => Some(Capacity::Full),
        StoreError::Heed(heed::Error::Mdb(MdbError::MapResized)) => Some(Capacity::Resized),
        _ => None,
    }
}

#[derive(Default, Debug)]
struct GateState {
    active_txns: usize,
    resizing: bool,
}

/// Coordination between live transactions and map resizes: a resize must
/// observe no live transaction in this process, so transactions may not
/// begin while a resize is pending and the resizer waits for the active
/// count to drain (its own failed attempt has already ended).
#[derive(Debug)]
struct TxnGate {
    state: Mutex<GateState>,
    txn_done: Condvar,
    resize_done: Condvar,
}

impl TxnGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            txn_done: Condvar::new(),
            resize_done: Condvar::new(),
        }
    }

    fn begin_attempt(&self) {
        let mut st = self.state.lock().unwrap();
        while st.resizing {
            st = self.resize_done.wait(st).unwrap();
        }
        st.active_txns += 1;
    }

    fn end_attempt(&self) {
        let mut st = self.state.lock().unwrap();
        st.active_txns -= 1;
        self.txn_done.notify_all();
    }

    fn resize_with(&self, f: impl FnOnce() -> Result<()>) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.resizing = true;
        while st.active_txns > 0 {
            st = self.txn_done.wait(st).unwrap();
        }
        let result = f();
        st.resizing = false;
        drop(st);
        self.resize_done.notify_all();
        result
    }
}

/// Handle to one open store. Cheap to share by reference across threads;
/// the process owns the store exclusively while this exists.
#[derive(Debug)]
pub struct Store {
    env: Env,
    db: Db,
    gate: TxnGate,
}

impl Store {
    /// Open or create the store environment at `dir`.
    pub fn open(dir: &Path) -> Result<Store> {
        Self::open_with_map_size(dir, INITIAL_MAP_SIZE)
    }

    /// Open with an explicit initial map size. The map grows on demand, so
    /// a small initial size only means earlier growth.
    pub fn open_with_map_size(dir: &Path, map_size: usize) -> Result<Store> {
        std::fs::create_dir_all(dir)?;
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_readers(MAX_READERS)
                .max_dbs(1)
                .flags(EnvFlags::NO_SYNC)
                .open(dir)?
        };
        let db = {
            let mut wtxn = env.write_txn()?;
            let db = env.create_database(&mut wtxn, Some("index"))?;
            wtxn.commit()?;
            db
        };
        let store = Store {
            env,
            db,
            gate: TxnGate::new(),
        };
        store.check_version()?;
        debug!(dir = %dir.display(), map_size, "store opened");
        Ok(store)
    }

    fn check_version(&self) -> Result<()> {
        self.update(|txn, db| match get_header(txn, db, HDR_VERSION)? {
            Some(v) if v.len() == 2 => {
                if v[0] != SCHEMA_MAJOR {
                    Err(StoreError::Version {
                        found_major: v[0],
                        found_minor: v[1],
                    })
                } else {
                    Ok(())
                }
            }
            Some(v) => Err(StoreError::Corrupt(format!(
                "version header of {} bytes",
                v.len()
            ))),
            None => {
                put_header(txn, db, HDR_VERSION, &[SCHEMA_MAJOR, SCHEMA_MINOR])?;
                Ok(())
            }
        })
    }

    /// Current LMDB map size.
    pub fn map_size(&self) -> usize {
        self.env.info().map_size
    }

    /// Run `body` in a read-only transaction, retrying on map-capacity
    /// signals.
    pub fn read<T>(&self, mut body: impl FnMut(&RoTxn, Db) -> Result<T>) -> Result<T> {
        loop {
            self.gate.begin_attempt();
            let attempt = (|| {
                let txn = self.env.read_txn()?;
                body(&txn, self.db)
            })();
            self.gate.end_attempt();
            match attempt {
                Err(e) => self.recover(e)?,
                ok => return ok,
            }
        }
    }

    /// Run `body` in a read-write transaction and commit it, retrying on
    /// map-capacity signals. The body re-runs from scratch on retry.
    pub fn update<T>(&self, mut body: impl FnMut(&mut RwTxn, Db) -> Result<T>) -> Result<T> {
        loop {
            self.gate.begin_attempt();
            let attempt = (|| {
                let mut txn = self.env.write_txn()?;
                let value = body(&mut txn, self.db)?;
                txn.commit()?;
                Ok(value)
            })();
            self.gate.end_attempt();
            match attempt {
                Err(e) => self.recover(e)?,
                ok => return ok,
            }
        }
    }

    /// Resolve a capacity signal by resizing, or propagate the error.
    fn recover(&self, err: StoreError) -> Result<()> {
        match capacity_signal(&err) {
            Some(Capacity::Full) => self.gate.resize_with(|| {
                let current = self.env.info().map_size;
                let grown = current + current / 2;
                debug!(current, grown, "store map full, growing");
                unsafe { self.env.resize(grown) }.map_err(Into::into)
            }),
            Some(Capacity::Resized) => self.gate.resize_with(|| {
                debug!("store map resized externally, adopting");
                // Size zero adopts the map size currently on disk.
                unsafe { self.env.resize(0) }.map_err(Into::into)
            }),
            None => Err(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Point operations
// ---------------------------------------------------------------------------

pub fn get_header(txn: &RoTxn, db: Db, sub: u8) -> Result<Option<Vec<u8>>> {
    Ok(db.get(txn, &keys::header(sub))?.map(|v| v.to_vec()))
}

pub fn put_header(txn: &mut RwTxn, db: Db, sub: u8, value: &[u8]) -> Result<()> {
    db.put(txn, &keys::header(sub), value)?;
    Ok(())
}

pub fn del_header(txn: &mut RwTxn, db: Db, sub: u8) -> Result<bool> {
    Ok(db.delete(txn, &keys::header(sub))?)
}

/// Allocate the next directory identifier; strictly monotonic, never
/// reused within a committed transaction history.
pub fn next_dir_id(txn: &mut RwTxn, db: Db) -> Result<u64> {
    let next = match get_header(txn, db, HDR_DIR_SEQ)? {
        Some(v) if v.len() == 8 => {
            let mut a = [0u8; 8];
            a.copy_from_slice(&v);
            u64::from_le_bytes(a) + 1
        }
        Some(v) => {
            return Err(StoreError::Corrupt(format!(
                "directory sequence header of {} bytes",
                v.len()
            )))
        }
        None => 1,
    };
    put_header(txn, db, HDR_DIR_SEQ, &next.to_le_bytes())?;
    Ok(next)
}

/// Current value of the directory identifier sequence.
pub fn dir_seq(txn: &RoTxn, db: Db) -> Result<u64> {
    match get_header(txn, db, HDR_DIR_SEQ)? {
        Some(v) if v.len() == 8 => {
            let mut a = [0u8; 8];
            a.copy_from_slice(&v);
            Ok(u64::from_le_bytes(a))
        }
        Some(v) => Err(StoreError::Corrupt(format!(
            "directory sequence header of {} bytes",
            v.len()
        ))),
        None => Ok(0),
    }
}

/// Mark the index as changed since the last manifest write.
pub fn mark_dirty(txn: &mut RwTxn, db: Db) -> Result<()> {
    put_header(txn, db, HDR_DIRTY, &[1])
}

/// Atomically read and clear the dirty flag.
pub fn take_dirty(txn: &mut RwTxn, db: Db) -> Result<bool> {
    del_header(txn, db, HDR_DIRTY)
}

/// Read a 32-byte artifact root header.
pub fn artifact_root(txn: &RoTxn, db: Db, sub: u8) -> Result<Option<Blake3Hash>> {
    match get_header(txn, db, sub)? {
        Some(v) if v.len() == 32 => {
            let mut h = [0u8; 32];
            h.copy_from_slice(&v);
            Ok(Some(h))
        }
        Some(v) => Err(StoreError::Corrupt(format!(
            "artifact root header of {} bytes",
            v.len()
        ))),
        None => Ok(None),
    }
}

pub fn set_artifact_root(txn: &mut RwTxn, db: Db, sub: u8, root: &Blake3Hash) -> Result<()> {
    put_header(txn, db, sub, root)
}

/// Number of entries in the hash-list artifact.
pub fn hash_list_len(txn: &RoTxn, db: Db) -> Result<u64> {
    match get_header(txn, db, HDR_HASH_LIST_LEN)? {
        Some(v) if v.len() == 8 => {
            let mut a = [0u8; 8];
            a.copy_from_slice(&v);
            Ok(u64::from_le_bytes(a))
        }
        Some(v) => Err(StoreError::Corrupt(format!(
            "hash list length header of {} bytes",
            v.len()
        ))),
        None => Ok(0),
    }
}

pub fn set_hash_list_len(txn: &mut RwTxn, db: Db, len: u64) -> Result<()> {
    put_header(txn, db, HDR_HASH_LIST_LEN, &len.to_le_bytes())
}

pub fn get_dir_entry(
    txn: &RoTxn,
    db: Db,
    parent: u64,
    name: &[u8],
) -> Result<Option<keys::DirEntry>> {
    match db.get(txn, &keys::dir_entry(parent, name))? {
        Some(v) => Ok(Some(keys::DirEntry::decode(v)?)),
        None => Ok(None),
    }
}

/// Write a directory entry, replacing any existing one.
pub fn put_dir_entry(
    txn: &mut RwTxn,
    db: Db,
    parent: u64,
    name: &[u8],
    ent: &keys::DirEntry,
) -> Result<()> {
    db.put(txn, &keys::dir_entry(parent, name), &ent.encode())?;
    Ok(())
}

/// Insert a strictly new directory entry; fails if the key exists.
pub fn insert_dir_entry(
    txn: &mut RwTxn,
    db: Db,
    parent: u64,
    name: &[u8],
    ent: &keys::DirEntry,
) -> Result<()> {
    db.put_with_flags(
        txn,
        PutFlags::NO_OVERWRITE,
        &keys::dir_entry(parent, name),
        &ent.encode(),
    )?;
    Ok(())
}

pub fn del_dir_entry(txn: &mut RwTxn, db: Db, parent: u64, name: &[u8]) -> Result<bool> {
    Ok(db.delete(txn, &keys::dir_entry(parent, name))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{DirEntry, HDR_DIR_LIST_ROOT};
    use tempfile::TempDir;

    fn open_store(tmp: &TempDir) -> Store {
        Store::open(tmp.path()).unwrap()
    }

    #[test]
    fn open_initializes_and_reopens() {
        let tmp = TempDir::new().unwrap();
        {
            let store = open_store(&tmp);
            store
                .update(|txn, db| put_dir_entry(txn, db, 0, b"a", &DirEntry::Subdir { id: 1 }))
                .unwrap();
        }
        let store = open_store(&tmp);
        let ent = store
            .read(|txn, db| get_dir_entry(txn, db, 0, b"a"))
            .unwrap();
        assert_eq!(ent, Some(DirEntry::Subdir { id: 1 }));
    }

    #[test]
    fn major_version_mismatch_refuses_open() {
        let tmp = TempDir::new().unwrap();
        {
            let store = open_store(&tmp);
            store
                .update(|txn, db| put_header(txn, db, HDR_VERSION, &[SCHEMA_MAJOR + 1, 0]))
                .unwrap();
        }
        match Store::open(tmp.path()) {
            Err(StoreError::Version { found_major, .. }) => {
                assert_eq!(found_major, SCHEMA_MAJOR + 1)
            }
            other => panic!("expected version error, got {other:?}"),
        }
    }

    #[test]
    fn minor_version_skew_is_tolerated() {
        let tmp = TempDir::new().unwrap();
        {
            let store = open_store(&tmp);
            store
                .update(|txn, db| put_header(txn, db, HDR_VERSION, &[SCHEMA_MAJOR, 99]))
                .unwrap();
        }
        assert!(Store::open(tmp.path()).is_ok());
    }

    #[test]
    fn dir_ids_are_strictly_monotonic_across_transactions() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let a = store.update(|txn, db| next_dir_id(txn, db)).unwrap();
        let b = store
            .update(|txn, db| {
                let x = next_dir_id(txn, db)?;
                let y = next_dir_id(txn, db)?;
                assert!(y > x);
                Ok(y)
            })
            .unwrap();
        assert!(b > a);
        assert_eq!(store.read(|txn, db| dir_seq(txn, db)).unwrap(), b);
    }

    #[test]
    fn cursor_walks_one_directory_in_name_order() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store
            .update(|txn, db| {
                for name in [&b"b"[..], b"a", b"c"] {
                    put_dir_entry(
                        txn,
                        db,
                        7,
                        name,
                        &DirEntry::Unhashed {
                            lastmod: 0,
                            size: 1,
                        },
                    )?;
                }
                // A neighboring directory must not leak into the walk.
                put_dir_entry(
                    txn,
                    db,
                    8,
                    b"zz",
                    &DirEntry::Unhashed {
                        lastmod: 0,
                        size: 1,
                    },
                )
            })
            .unwrap();

        let names = store
            .read(|txn, db| {
                let mut cur = DirCursor::new(7);
                let mut out = Vec::new();
                while let Some((name, _)) = cur.next(txn, db)? {
                    out.push(name);
                }
                Ok(out)
            })
            .unwrap();
        assert_eq!(names, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn skip_to_positions_at_or_after_the_name() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store
            .update(|txn, db| {
                for name in [&b"a"[..], b"c"] {
                    put_dir_entry(
                        txn,
                        db,
                        1,
                        name,
                        &DirEntry::Unhashed {
                            lastmod: 0,
                            size: 1,
                        },
                    )?;
                }
                Ok(())
            })
            .unwrap();

        store
            .read(|txn, db| {
                // Exact hit steps onto the sought entry.
                let mut cur = DirCursor::new(1);
                cur.skip_to(b"c");
                assert_eq!(cur.next(txn, db)?.map(|(n, _)| n), Some(b"c".to_vec()));

                // A missing name steps onto the entry immediately after.
                let mut cur = DirCursor::new(1);
                cur.skip_to(b"b");
                assert_eq!(cur.next(txn, db)?.map(|(n, _)| n), Some(b"c".to_vec()));

                // Past the last name the cursor is exhausted.
                let mut cur = DirCursor::new(1);
                cur.skip_to(b"d");
                assert!(cur.next(txn, db)?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn insert_strictly_new_rejects_duplicates() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let ent = DirEntry::Subdir { id: 1 };
        store
            .update(|txn, db| insert_dir_entry(txn, db, 0, b"x", &ent))
            .unwrap();
        let dup = store.update(|txn, db| insert_dir_entry(txn, db, 0, b"x", &ent));
        assert!(matches!(
            dup,
            Err(StoreError::Heed(heed::Error::Mdb(MdbError::KeyExist)))
        ));
    }

    #[test]
    fn hash_iter_returns_distinct_hashes_sorted() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let h1 = [1u8; 32];
        let h2 = [2u8; 32];
        store
            .update(|txn, db| {
                db.put(txn, &keys::hash_path(&h2, "p/one"), b"p/one")?;
                db.put(txn, &keys::hash_path(&h1, "p/two"), b"p/two")?;
                db.put(txn, &keys::hash_path(&h1, "p/three"), b"p/three")?;
                Ok(())
            })
            .unwrap();

        let hashes = store
            .read(|txn, db| {
                let mut iter = HashIter::new();
                let mut out = Vec::new();
                while let Some(h) = iter.next(txn, db)? {
                    out.push(h);
                }
                Ok(out)
            })
            .unwrap();
        assert_eq!(hashes, vec![h1, h2]);

        let paths = store
            .read(|txn, db| hash_paths(txn, db, &h1))
            .unwrap();
        assert_eq!(paths.len(), 2);
        assert!(store.read(|txn, db| hash_has_paths(txn, db, &h2)).unwrap());
    }

    #[test]
    fn dirty_flag_reads_once() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        assert!(!store.update(|txn, db| take_dirty(txn, db)).unwrap());
        store.update(|txn, db| mark_dirty(txn, db)).unwrap();
        assert!(store.update(|txn, db| take_dirty(txn, db)).unwrap());
        assert!(!store.update(|txn, db| take_dirty(txn, db)).unwrap());
    }

    #[test]
    fn artifact_root_headers_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let root = [0xABu8; 32];
        store
            .update(|txn, db| {
                set_artifact_root(txn, db, HDR_DIR_LIST_ROOT, &root)?;
                set_hash_list_len(txn, db, 5)
            })
            .unwrap();
        store
            .read(|txn, db| {
                assert_eq!(artifact_root(txn, db, HDR_DIR_LIST_ROOT)?, Some(root));
                assert_eq!(hash_list_len(txn, db)?, 5);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn map_full_grows_until_the_transaction_fits() {
        let tmp = TempDir::new().unwrap();
        // Far too small for the data one transaction inserts.
        let store = Store::open_with_map_size(tmp.path(), 256 * 1024).unwrap();
        let initial = store.map_size();

        let value = vec![0xA5u8; 4096];
        store
            .update(|txn, db| {
                for i in 0..400u32 {
                    let mut key = vec![keys::NS_FILE_META];
                    key.extend_from_slice(&i.to_le_bytes());
                    db.put(txn, &key, &value)?;
                }
                Ok(())
            })
            .unwrap();

        assert!(store.map_size() > initial, "map should have grown");
        let count = store
            .read(|txn, db| {
                let mut n = 0;
                for item in db.prefix_iter(txn, &[keys::NS_FILE_META][..])? {
                    item?;
                    n += 1;
                }
                Ok(n)
            })
            .unwrap();
        assert_eq!(count, 400);
    }

    #[test]
    fn concurrent_writers_survive_growth() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open_with_map_size(tmp.path(), 256 * 1024).unwrap();
        let value = vec![0x5Au8; 2048];

        std::thread::scope(|s| {
            for t in 0..4u8 {
                let store = &store;
                let value = &value;
                s.spawn(move || {
                    for i in 0..100u32 {
                        store
                            .update(|txn, db| {
                                let mut key = vec![keys::NS_FILE_META, t];
                                key.extend_from_slice(&i.to_le_bytes());
                                db.put(txn, &key, value)?;
                                Ok(())
                            })
                            .unwrap();
                    }
                });
            }
        });

        let count = store
            .read(|txn, db| {
                let mut n = 0;
                for item in db.prefix_iter(txn, &[keys::NS_FILE_META][..])? {
                    item?;
                    n += 1;
                }
                Ok(n)
            })
            .unwrap();
        assert_eq!(count, 400);
    }
}
