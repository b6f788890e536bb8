//! Ordered iteration over the key space.
//!
//! Cursors here are stateless between steps: each step seeks the smallest
//! key at or above a stored lower bound and then advances the bound past
//! the returned key. That keeps them valid across interleaved writes in
//! the same transaction, which the scanner relies on while it inserts and
//! deletes entries mid-walk.

use heed::RoTxn;

use cairn_hash::Blake3Hash;

use crate::keys::{self, DirEntry, NS_HASH_PATH};
use crate::{Db, Result, StoreError};

/// The immediate successor of `key` in byte order.
fn successor(key: &[u8]) -> Vec<u8> {
    let mut s = Vec::with_capacity(key.len() + 1);
    s.extend_from_slice(key);
    s.push(0);
    s
}

/// Cursor over the entries of a single directory, in name byte order.
pub struct DirCursor {
    parent: u64,
    prefix: [u8; 9],
    lower: Vec<u8>,
}

impl DirCursor {
    pub fn new(parent: u64) -> Self {
        let prefix = keys::dir_prefix(parent);
        Self {
            parent,
            prefix,
            lower: prefix.to_vec(),
        }
    }

    /// Position the cursor so the next step yields the entry whose name is
    /// the smallest name ≥ `name`.
    pub fn skip_to(&mut self, name: &[u8]) {
        self.lower = keys::dir_entry(self.parent, name);
    }

    /// Step to the next entry, or `None` once the directory is exhausted.
    pub fn next(&mut self, txn: &RoTxn, db: Db) -> Result<Option<(Vec<u8>, DirEntry)>> {
        match db.get_greater_than_or_equal_to(txn, &self.lower)? {
            Some((key, value)) if key.starts_with(&self.prefix) => {
                let name = key[self.prefix.len()..].to_vec();
                let ent = DirEntry::decode(value)?;
                self.lower = successor(key);
                Ok(Some((name, ent)))
            }
            _ => Ok(None),
        }
    }
}

/// All virtual paths recorded for one file hash.
pub fn hash_paths(txn: &RoTxn, db: Db, b3: &Blake3Hash) -> Result<Vec<String>> {
    let prefix = keys::hash_path_prefix(b3);
    let mut out = Vec::new();
    for item in db.prefix_iter(txn, &prefix[..])? {
        let (_, value) = item?;
        let path = std::str::from_utf8(value)
            .map_err(|_| StoreError::Corrupt("non-UTF-8 path in reverse index".into()))?;
        out.push(path.to_owned());
    }
    Ok(out)
}

/// Whether any path still references the given file hash.
pub fn hash_has_paths(txn: &RoTxn, db: Db, b3: &Blake3Hash) -> Result<bool> {
    let prefix = keys::hash_path_prefix(b3);
    Ok(db.prefix_iter(txn, &prefix[..])?.next().transpose()?.is_some())
}

/// Iterator over the distinct file hashes in the reverse index, in hash
/// byte order. Duplicate path keys under one hash are suppressed by
/// seeking past the whole 33-byte hash prefix after each step.
pub struct HashIter {
    lower: Vec<u8>,
}

impl HashIter {
    pub fn new() -> Self {
        Self {
            lower: vec![NS_HASH_PATH],
        }
    }

    pub fn next(&mut self, txn: &RoTxn, db: Db) -> Result<Option<Blake3Hash>> {
        match db.get_greater_than_or_equal_to(txn, &self.lower)? {
            Some((key, _)) if key.first() == Some(&NS_HASH_PATH) => {
                if key.len() < 33 {
                    return Err(StoreError::Corrupt(format!(
                        "reverse-index key of {} bytes",
                        key.len()
                    )));
                }
                let mut b3 = [0u8; 32];
                b3.copy_from_slice(&key[1..33]);
                // Past every possible path-hash suffix for this hash.
                let mut next = Vec::with_capacity(42);
                next.push(NS_HASH_PATH);
                next.extend_from_slice(&b3);
                next.extend_from_slice(&[0xFF; 8]);
                next.push(0);
                self.lower = next;
                Ok(Some(b3))
            }
            _ => Ok(None),
        }
    }
}

impl Default for HashIter {
    fn default() -> Self {
        Self::new()
    }
}
