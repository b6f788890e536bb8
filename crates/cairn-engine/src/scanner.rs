//! Filesystem reconciliation.
//!
//! The scanner brings the persisted directory tree in line with the
//! published filesystem trees. Each persisted directory is reconciled in
//! one write transaction by a single linear merge: the sorted filesystem
//! listing (directories and files, with child mount points folded in) is
//! walked jointly with the store cursor, which yields the persisted
//! entries in the same byte order. Unchanged subdirectories keep their
//! identifiers and unchanged files keep their hash state, so a scan over
//! an unchanged tree writes nothing.
//!
//! Descent uses an explicit frame stack, not program-stack recursion, to
//! bound stack depth on deep trees. The same applies to the deletion
//! cascade.

use std::cmp::Ordering;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use cairn_store::keys::{self, DirEntry, ROOT_DIR_ID};
use cairn_store::{self as store, Db, DirCursor, Result as StoreResult, RwTxn, StoreError};

use crate::mounts::MountTree;
use crate::queue::HashQueue;
use crate::vpath::{self, valid_name};
use crate::{Engine, Result};

/// Counters for one scan pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    /// Directories reconciled.
    pub dirs: u64,
    /// Entries inserted.
    pub added: u64,
    /// Entries deleted (including cascade deletions).
    pub deleted: u64,
}

/// One filesystem entry expected by the merge, already name-sorted.
enum FsEntry {
    Dir(String),
    File { name: String, lastmod: i64, size: u64 },
}

impl FsEntry {
    fn name(&self) -> &str {
        match self {
            FsEntry::Dir(name) => name,
            FsEntry::File { name, .. } => name,
        }
    }
}

/// Reconcile the whole published namespace, starting at the root.
pub(crate) fn scan(engine: &Engine) -> Result<ScanStats> {
    struct Frame {
        subdirs: std::vec::IntoIter<(String, u64)>,
    }

    let mut stats = ScanStats::default();
    let mut path = vpath::VPathBuf::new();
    let subdirs = reconcile_dir(engine, ROOT_DIR_ID, "", &mut stats)?;
    let mut stack = vec![Frame {
        subdirs: subdirs.into_iter(),
    }];

    while !stack.is_empty() {
        let next = stack.last_mut().unwrap().subdirs.next();
        match next {
            Some((name, dir_id)) => {
                if let Err(e) = path.push(&name) {
                    warn!(error = %e, "tree too deep, subtree skipped");
                    continue;
                }
                let subdirs = reconcile_dir(engine, dir_id, path.as_str(), &mut stats)?;
                stack.push(Frame {
                    subdirs: subdirs.into_iter(),
                });
            }
            None => {
                stack.pop();
                path.pop();
            }
        }
    }
    Ok(stats)
}

/// Reconcile one persisted directory against the filesystem. Returns the
/// subdirectories (name, identifier) to descend into, in name order.
fn reconcile_dir(
    engine: &Engine,
    dir_id: u64,
    vpath: &str,
    stats: &mut ScanStats,
) -> Result<Vec<(String, u64)>> {
    let mount_node = engine.mounts.subdir(vpath);
    // Failures on a mount point itself are structural; anywhere deeper
    // they only cost this directory's refresh.
    let strict = mount_node.is_some_and(|n| n.has_binding());

    let mut entries = match engine.mounts.resolve(vpath) {
        Some(fs_dir) => match list_dir(&fs_dir, mount_node) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound && !strict => {
                info!(path = vpath, "directory vanished, removing its entries");
                Vec::new()
            }
            Err(e) if !strict => {
                warn!(path = vpath, error = %e, "directory unreadable, keeping previous state");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        },
        None => Vec::new(),
    };

    // Child mount points appear as directories even when the backing
    // filesystem has no entry of that name.
    if let Some(node) = mount_node {
        for child in node.child_names() {
            entries.push(FsEntry::Dir(child.to_owned()));
        }
    }
    // Name order, directories first on a tie.
    entries.sort_by(|a, b| {
        a.name()
            .as_bytes()
            .cmp(b.name().as_bytes())
            .then_with(|| matches!(b, FsEntry::Dir(_)).cmp(&matches!(a, FsEntry::Dir(_))))
    });

    let (subdirs, added, deleted) = engine.store.update(|txn, db| {
        let mut out: Vec<(String, u64)> = Vec::new();
        let mut added = 0u64;
        let mut deleted = 0u64;

        let mut exp_iter = entries.iter();
        let mut expected = exp_iter.next();
        let mut cur = DirCursor::new(dir_id);
        let mut pending = cur.next(txn, db)?;

        loop {
            let order = match (&expected, &pending) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(e), Some((pname, _))) => e.name().as_bytes().cmp(pname.as_slice()),
            };
            match order {
                Ordering::Less => {
                    let e = expected.unwrap();
                    added += insert_expected(txn, db, dir_id, e, &mut out)?;
                    expected = exp_iter.next();
                }
                Ordering::Greater => {
                    let (pname, pent) = pending.take().unwrap();
                    deleted +=
                        delete_entry(txn, db, &engine.queue, dir_id, &pname, &pent, vpath)?;
                    pending = cur.next(txn, db)?;
                }
                Ordering::Equal => {
                    let e = expected.unwrap();
                    let (pname, pent) = pending.take().unwrap();
                    let (a, d) = reconcile_pair(
                        txn,
                        db,
                        &engine.queue,
                        dir_id,
                        vpath,
                        e,
                        &pname,
                        &pent,
                        &mut out,
                    )?;
                    added += a;
                    deleted += d;
                    expected = exp_iter.next();
                    pending = cur.next(txn, db)?;
                }
            }
        }

        if added + deleted > 0 {
            store::mark_dirty(txn, db)?;
        }
        Ok((out, added, deleted))
    })?;

    stats.dirs += 1;
    stats.added += added;
    stats.deleted += deleted;
    Ok(subdirs)
}

/// List one filesystem directory, applying the entry filter. Skipped
/// entries are reported at info level; per-entry stat failures are
/// skipped too.
fn list_dir(dir: &Path, mount_node: Option<&MountTree>) -> io::Result<Vec<FsEntry>> {
    let mut entries = Vec::new();
    for item in std::fs::read_dir(dir)? {
        let item = match item {
            Ok(i) => i,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "unreadable directory entry skipped");
                continue;
            }
        };
        let raw_name = item.file_name();
        let Some(name) = raw_name.to_str() else {
            info!(dir = %dir.display(), "non-UTF-8 name skipped");
            continue;
        };
        if !valid_name(name) {
            info!(dir = %dir.display(), name, "invalid name skipped");
            continue;
        }
        if mount_node.is_some_and(|n| n.has_child(name)) {
            info!(dir = %dir.display(), name, "shadowed by mount point, skipped");
            continue;
        }
        let ft = match item.file_type() {
            Ok(ft) => ft,
            Err(e) => {
                info!(dir = %dir.display(), name, error = %e, "stat failed, entry skipped");
                continue;
            }
        };
        if ft.is_symlink() {
            info!(dir = %dir.display(), name, "symlink skipped");
        } else if ft.is_dir() {
            entries.push(FsEntry::Dir(name.to_owned()));
        } else if ft.is_file() {
            let md = match item.metadata() {
                Ok(md) => md,
                Err(e) => {
                    info!(dir = %dir.display(), name, error = %e, "stat failed, entry skipped");
                    continue;
                }
            };
            let lastmod = match md.modified() {
                Ok(t) => systemtime_secs(t),
                Err(e) => {
                    info!(dir = %dir.display(), name, error = %e, "mtime unreadable, entry skipped");
                    continue;
                }
            };
            entries.push(FsEntry::File {
                name: name.to_owned(),
                lastmod,
                size: md.len(),
            });
        } else {
            info!(dir = %dir.display(), name, "not a regular file, skipped");
        }
    }
    Ok(entries)
}

fn systemtime_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Insert a filesystem entry with no persisted counterpart.
fn insert_expected(
    txn: &mut RwTxn,
    db: Db,
    dir_id: u64,
    e: &FsEntry,
    out: &mut Vec<(String, u64)>,
) -> StoreResult<u64> {
    match e {
        FsEntry::Dir(name) => {
            let id = store::next_dir_id(txn, db)?;
            store::insert_dir_entry(txn, db, dir_id, name.as_bytes(), &DirEntry::Subdir { id })?;
            out.push((name.clone(), id));
        }
        FsEntry::File {
            name,
            lastmod,
            size,
        } => {
            store::insert_dir_entry(
                txn,
                db,
                dir_id,
                name.as_bytes(),
                &DirEntry::Unhashed {
                    lastmod: *lastmod,
                    size: *size,
                },
            )?;
        }
    }
    Ok(1)
}

/// Reconcile a filesystem entry with the persisted entry of the same
/// name. Returns (added, deleted).
#[allow(clippy::too_many_arguments)]
fn reconcile_pair(
    txn: &mut RwTxn,
    db: Db,
    queue: &HashQueue,
    dir_id: u64,
    dir_vpath: &str,
    e: &FsEntry,
    pname: &[u8],
    pent: &DirEntry,
    out: &mut Vec<(String, u64)>,
) -> StoreResult<(u64, u64)> {
    match (e, pent) {
        // Same kind, directory: keep the identifier.
        (FsEntry::Dir(name), DirEntry::Subdir { id }) => {
            out.push((name.clone(), *id));
            Ok((0, 0))
        }
        // Same kind, file: keep the entry (and its hash state) unless the
        // content moved forward.
        (
            FsEntry::File {
                lastmod: fs_lastmod,
                size: fs_size,
                ..
            },
            DirEntry::Unhashed { lastmod, size } | DirEntry::Hashed { lastmod, size, .. },
        ) => {
            if *fs_lastmod > *lastmod || *fs_size != *size {
                let deleted = delete_entry(txn, db, queue, dir_id, pname, pent, dir_vpath)?;
                let added = insert_expected(txn, db, dir_id, e, out)?;
                Ok((added, deleted))
            } else {
                Ok((0, 0))
            }
        }
        // Kind changed: replace wholesale.
        _ => {
            let deleted = delete_entry(txn, db, queue, dir_id, pname, pent, dir_vpath)?;
            let added = insert_expected(txn, db, dir_id, e, out)?;
            Ok((added, deleted))
        }
    }
}

/// Delete a persisted entry, cascading into subdirectories (sub-entries
/// first) and purging the hash-keyed namespaces. Returns the number of
/// entries removed.
pub(crate) fn delete_entry(
    txn: &mut RwTxn,
    db: Db,
    queue: &HashQueue,
    dir_id: u64,
    name: &[u8],
    ent: &DirEntry,
    dir_vpath: &str,
) -> StoreResult<u64> {
    let name = utf8_name(name)?;
    let vpath = vpath::join(dir_vpath, &name);
    match ent {
        DirEntry::Subdir { id } => delete_dir_recursive(txn, db, queue, dir_id, &name, *id, vpath),
        _ => {
            delete_file_entry(txn, db, queue, dir_id, &name, ent, &vpath)?;
            Ok(1)
        }
    }
}

fn delete_file_entry(
    txn: &mut RwTxn,
    db: Db,
    queue: &HashQueue,
    dir_id: u64,
    name: &str,
    ent: &DirEntry,
    vpath: &str,
) -> StoreResult<()> {
    store::del_dir_entry(txn, db, dir_id, name.as_bytes())?;
    match ent {
        DirEntry::Unhashed { .. } => {
            // A queued work item may reference this entry.
            queue.reset();
        }
        DirEntry::Hashed { b3, .. } => {
            db.delete(txn, &keys::hash_path(b3, vpath))?;
            if !store::hash_has_paths(txn, db, b3)? {
                db.delete(txn, &keys::pieces(b3))?;
                db.delete(txn, &keys::file_meta(b3))?;
            }
        }
        DirEntry::Subdir { .. } => unreachable!("directories go through delete_dir_recursive"),
    }
    Ok(())
}

fn delete_dir_recursive(
    txn: &mut RwTxn,
    db: Db,
    queue: &HashQueue,
    parent: u64,
    name: &str,
    dir_id: u64,
    vpath: String,
) -> StoreResult<u64> {
    struct DelFrame {
        parent: u64,
        name: String,
        dir_id: u64,
        vpath: String,
        expanded: bool,
    }

    let mut deleted = 0u64;
    let mut stack = vec![DelFrame {
        parent,
        name: name.to_owned(),
        dir_id,
        vpath,
        expanded: false,
    }];

    while let Some(top) = stack.last_mut() {
        if top.expanded {
            let f = stack.pop().unwrap();
            store::del_dir_entry(txn, db, f.parent, f.name.as_bytes())?;
            deleted += 1;
            continue;
        }
        top.expanded = true;
        let (dir_id, vpath) = (top.dir_id, top.vpath.clone());

        let mut cur = DirCursor::new(dir_id);
        let mut subframes = Vec::new();
        while let Some((nb, ent)) = cur.next(txn, db)? {
            let n = utf8_name(&nb)?;
            let child_vpath = vpath::join(&vpath, &n);
            match ent {
                DirEntry::Subdir { id } => subframes.push(DelFrame {
                    parent: dir_id,
                    name: n,
                    dir_id: id,
                    vpath: child_vpath,
                    expanded: false,
                }),
                _ => {
                    delete_file_entry(txn, db, queue, dir_id, &n, &ent, &child_vpath)?;
                    deleted += 1;
                }
            }
        }
        stack.extend(subframes);
    }
    Ok(deleted)
}

fn utf8_name(name: &[u8]) -> StoreResult<String> {
    std::str::from_utf8(name)
        .map(str::to_owned)
        .map_err(|_| StoreError::Corrupt("non-UTF-8 entry name in directory tree".into()))
}
