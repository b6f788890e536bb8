//! Persistent key schema.
//!
//! One ordered byte-string key space; every key starts with a single-byte
//! namespace tag. Fixed-width integers inside keys and values are
//! little-endian so stores move between machines intact.

use cairn_hash::Blake3Hash;

use crate::{Result, StoreError};

/// Header records.
pub const NS_HEADER: u8 = 0;
/// Directory entries: `1 + parent_id(8) + name`.
pub const NS_DIR_ENTRY: u8 = 1;
/// Piece index: `2 + file_hash(32)`.
pub const NS_PIECES: u8 = 2;
/// Per-hash metadata (reserved): `3 + file_hash(32)`.
pub const NS_FILE_META: u8 = 3;
/// Hash-to-path reverse index: `4 + file_hash(32) + path_hash(8)`.
pub const NS_HASH_PATH: u8 = 4;

/// Header sub-tags.
pub const HDR_VERSION: u8 = 0x00;
pub const HDR_DIR_SEQ: u8 = 0x01;
pub const HDR_DIR_LIST_ROOT: u8 = 0x02;
pub const HDR_HASH_LIST_ROOT: u8 = 0x03;
pub const HDR_HASH_LIST_LEN: u8 = 0x04;
/// Set when the index changed since the last manifest write.
pub const HDR_DIRTY: u8 = 0x05;

/// The repository root directory identifier.
pub const ROOT_DIR_ID: u64 = 0;

pub fn header(sub: u8) -> [u8; 2] {
    [NS_HEADER, sub]
}

pub fn dir_prefix(parent: u64) -> [u8; 9] {
    let mut k = [0u8; 9];
    k[0] = NS_DIR_ENTRY;
    k[1..].copy_from_slice(&parent.to_le_bytes());
    k
}

pub fn dir_entry(parent: u64, name: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(9 + name.len());
    k.extend_from_slice(&dir_prefix(parent));
    k.extend_from_slice(name);
    k
}

/// Split a namespace-1 key back into parent identifier and entry name.
pub fn split_dir_entry(key: &[u8]) -> Option<(u64, &[u8])> {
    if key.len() < 9 || key[0] != NS_DIR_ENTRY {
        return None;
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&key[1..9]);
    Some((u64::from_le_bytes(id), &key[9..]))
}

pub fn pieces(b3: &Blake3Hash) -> [u8; 33] {
    hash_key(NS_PIECES, b3)
}

pub fn file_meta(b3: &Blake3Hash) -> [u8; 33] {
    hash_key(NS_FILE_META, b3)
}

pub fn hash_path_prefix(b3: &Blake3Hash) -> [u8; 33] {
    hash_key(NS_HASH_PATH, b3)
}

fn hash_key(ns: u8, b3: &Blake3Hash) -> [u8; 33] {
    let mut k = [0u8; 33];
    k[0] = ns;
    k[1..].copy_from_slice(b3);
    k
}

/// Reverse-index key for one (file hash, virtual path) pair. The 8-byte
/// path-hash suffix lets a single file hash map to multiple paths.
pub fn hash_path(b3: &Blake3Hash, vpath: &str) -> [u8; 41] {
    let mut k = [0u8; 41];
    k[0] = NS_HASH_PATH;
    k[1..33].copy_from_slice(b3);
    k[33..].copy_from_slice(&blake3::hash(vpath.as_bytes()).as_bytes()[..8]);
    k
}

/// One directory entry. On disk the value length discriminates the
/// variant: 16 bytes unhashed, 48 bytes hashed, 8 bytes subdirectory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirEntry {
    /// Regular file not yet hashed.
    Unhashed { lastmod: i64, size: u64 },
    /// Regular file with its BLAKE3 root.
    Hashed {
        lastmod: i64,
        size: u64,
        b3: Blake3Hash,
    },
    /// Subdirectory, by child identifier.
    Subdir { id: u64 },
}

impl DirEntry {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            DirEntry::Unhashed { lastmod, size } => {
                let mut v = Vec::with_capacity(16);
                v.extend_from_slice(&lastmod.to_le_bytes());
                v.extend_from_slice(&size.to_le_bytes());
                v
            }
            DirEntry::Hashed { lastmod, size, b3 } => {
                let mut v = Vec::with_capacity(48);
                v.extend_from_slice(&lastmod.to_le_bytes());
                v.extend_from_slice(&size.to_le_bytes());
                v.extend_from_slice(b3);
                v
            }
            DirEntry::Subdir { id } => id.to_le_bytes().to_vec(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        match bytes.len() {
            8 => {
                let mut id = [0u8; 8];
                id.copy_from_slice(bytes);
                Ok(DirEntry::Subdir {
                    id: u64::from_le_bytes(id),
                })
            }
            16 => Ok(DirEntry::Unhashed {
                lastmod: read_i64(&bytes[..8]),
                size: read_u64(&bytes[8..16]),
            }),
            48 => {
                let mut b3 = [0u8; 32];
                b3.copy_from_slice(&bytes[16..48]);
                Ok(DirEntry::Hashed {
                    lastmod: read_i64(&bytes[..8]),
                    size: read_u64(&bytes[8..16]),
                    b3,
                })
            }
            n => Err(StoreError::Corrupt(format!(
                "directory entry value of {n} bytes"
            ))),
        }
    }

    pub fn is_file(&self) -> bool {
        !matches!(self, DirEntry::Subdir { .. })
    }
}

fn read_u64(b: &[u8]) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(b);
    u64::from_le_bytes(a)
}

fn read_i64(b: &[u8]) -> i64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(b);
    i64::from_le_bytes(a)
}

/// Piece-index value: file size then the flat chaining values.
pub fn encode_pieces(size: u64, cvs: &[[u8; 32]]) -> Vec<u8> {
    let mut v = Vec::with_capacity(8 + cvs.len() * 32);
    v.extend_from_slice(&size.to_le_bytes());
    for cv in cvs {
        v.extend_from_slice(cv);
    }
    v
}

pub fn decode_pieces(bytes: &[u8]) -> Result<(u64, Vec<[u8; 32]>)> {
    if bytes.len() < 8 || (bytes.len() - 8) % 32 != 0 {
        return Err(StoreError::Corrupt(format!(
            "piece index value of {} bytes",
            bytes.len()
        )));
    }
    let size = read_u64(&bytes[..8]);
    let cvs = bytes[8..]
        .chunks_exact(32)
        .map(|c| {
            let mut cv = [0u8; 32];
            cv.copy_from_slice(c);
            cv
        })
        .collect();
    Ok((size, cvs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_entry_length_discriminates_variant() {
        let unhashed = DirEntry::Unhashed {
            lastmod: -5,
            size: 42,
        };
        let hashed = DirEntry::Hashed {
            lastmod: 1_700_000_000,
            size: u64::MAX,
            b3: [7u8; 32],
        };
        let subdir = DirEntry::Subdir { id: 3 };

        assert_eq!(unhashed.encode().len(), 16);
        assert_eq!(hashed.encode().len(), 48);
        assert_eq!(subdir.encode().len(), 8);

        for ent in [unhashed, hashed, subdir] {
            assert_eq!(DirEntry::decode(&ent.encode()).unwrap(), ent);
        }
    }

    #[test]
    fn unknown_value_length_is_corrupt() {
        assert!(DirEntry::decode(&[0u8; 17]).is_err());
        assert!(DirEntry::decode(&[]).is_err());
    }

    #[test]
    fn dir_entry_keys_sort_by_parent_then_name() {
        let a = dir_entry(1, b"a");
        let b = dir_entry(1, b"b");
        let other_parent = dir_entry(2, b"a");
        assert!(a < b);
        assert!(a.starts_with(&dir_prefix(1)));
        assert!(!other_parent.starts_with(&dir_prefix(1)));
        assert_eq!(split_dir_entry(&a), Some((1, &b"a"[..])));
    }

    #[test]
    fn hash_path_keys_differ_per_path() {
        let b3 = [9u8; 32];
        let k1 = hash_path(&b3, "a/b");
        let k2 = hash_path(&b3, "c/d");
        assert_ne!(k1, k2);
        assert!(k1.starts_with(&hash_path_prefix(&b3)));
        assert!(k2.starts_with(&hash_path_prefix(&b3)));
    }

    #[test]
    fn piece_value_round_trip() {
        let cvs = vec![[1u8; 32], [2u8; 32]];
        let v = encode_pieces(999, &cvs);
        assert_eq!(v.len(), 8 + 64);
        let (size, back) = decode_pieces(&v).unwrap();
        assert_eq!(size, 999);
        assert_eq!(back, cvs);
        assert!(decode_pieces(&v[..v.len() - 1]).is_err());
    }
}
