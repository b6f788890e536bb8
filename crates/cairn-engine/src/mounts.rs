//! Published mount points.
//!
//! Operators publish pairs of (virtual path, filesystem path); the mount
//! tree resolves any virtual path to its backing filesystem location by
//! walking down, remembering the deepest binding seen, and appending the
//! unconsumed suffix. Children are kept in a `BTreeMap` keyed by name so
//! enumeration matches the store's byte ordering.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::vpath::{head, tail, valid_name};
use crate::{EngineError, Result};

/// Tree of published virtual-to-filesystem mappings.
#[derive(Debug, Default)]
pub struct MountTree {
    fs: Option<PathBuf>,
    children: BTreeMap<String, MountTree>,
}

impl MountTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mount. The virtual path may be empty (the repository
    /// root). Duplicate virtual paths and invalid component names are
    /// rejected.
    pub fn insert(&mut self, vpath: &str, fs: PathBuf) -> Result<()> {
        self.insert_at(vpath, vpath, fs)
    }

    fn insert_at(&mut self, full: &str, rest: &str, fs: PathBuf) -> Result<()> {
        let name = head(rest);
        if name.is_empty() {
            if self.fs.is_some() {
                return Err(EngineError::DuplicateMount(full.to_owned()));
            }
            self.fs = Some(fs);
            return Ok(());
        }
        if !valid_name(name) {
            return Err(EngineError::Path(format!(
                "invalid mount component {name:?} in {full:?}"
            )));
        }
        self.children
            .entry(name.to_owned())
            .or_default()
            .insert_at(full, tail(rest), fs)
    }

    /// Resolve a virtual path to a filesystem path: the deepest binding on
    /// the walk wins and the residual virtual suffix is appended to it.
    pub fn resolve(&self, vpath: &str) -> Option<PathBuf> {
        let comps: Vec<&str> = components(vpath).collect();
        let mut node = self;
        let mut best: Option<(&PathBuf, usize)> = node.fs.as_ref().map(|f| (f, 0));
        for (i, comp) in comps.iter().enumerate() {
            match node.children.get(*comp) {
                Some(child) => {
                    node = child;
                    if let Some(f) = &node.fs {
                        best = Some((f, i + 1));
                    }
                }
                None => break,
            }
        }
        best.map(|(fs, consumed)| {
            let mut path = fs.clone();
            for comp in &comps[consumed..] {
                path.push(comp);
            }
            path
        })
    }

    /// The subtree rooted at `vpath`, if any mount lives at or below it.
    pub fn subdir(&self, vpath: &str) -> Option<&MountTree> {
        let mut node = self;
        for comp in components(vpath) {
            node = node.children.get(comp)?;
        }
        Some(node)
    }

    /// Child mount names directly below this node, in byte order.
    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(|s| s.as_str())
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.children.contains_key(name)
    }

    /// Whether this node itself binds a filesystem path.
    pub fn has_binding(&self) -> bool {
        self.fs.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.fs.is_none() && self.children.is_empty()
    }
}

fn components(p: &str) -> impl Iterator<Item = &str> {
    p.split('/').filter(|c| !c.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn tree(mounts: &[(&str, &str)]) -> MountTree {
        let mut t = MountTree::new();
        for (v, f) in mounts {
            t.insert(v, PathBuf::from(f)).unwrap();
        }
        t
    }

    #[test]
    fn root_mount_resolves_everything() {
        let t = tree(&[("", "/srv/data")]);
        assert_eq!(t.resolve(""), Some(PathBuf::from("/srv/data")));
        assert_eq!(t.resolve("a/b"), Some(PathBuf::from("/srv/data/a/b")));
    }

    #[test]
    fn deepest_binding_wins() {
        let t = tree(&[("", "/srv/root"), ("pub/media", "/mnt/media")]);
        assert_eq!(t.resolve("pub/media"), Some(PathBuf::from("/mnt/media")));
        assert_eq!(
            t.resolve("pub/media/x/y"),
            Some(PathBuf::from("/mnt/media/x/y"))
        );
        // Matching an unbound intermediate node falls back to the root
        // binding with the full suffix.
        assert_eq!(t.resolve("pub/other"), Some(PathBuf::from("/srv/root/pub/other")));
    }

    #[test]
    fn unbound_tree_resolves_nothing() {
        let t = tree(&[("a/b", "/x")]);
        assert_eq!(t.resolve(""), None);
        assert_eq!(t.resolve("a"), None);
        assert_eq!(t.resolve("c"), None);
        assert_eq!(t.resolve("a/b/c"), Some(PathBuf::from("/x/c")));
    }

    #[test]
    fn subdir_returns_intermediate_nodes() {
        let t = tree(&[("a/b", "/x"), ("a/c", "/y")]);
        let a = t.subdir("a").unwrap();
        let names: Vec<&str> = a.child_names().collect();
        assert_eq!(names, vec!["b", "c"]);
        assert!(a.has_child("b"));
        assert!(t.subdir("a/b").is_some());
        assert!(t.subdir("z").is_none());
    }

    #[test]
    fn duplicate_virtual_rejected() {
        let mut t = tree(&[("a", "/x")]);
        assert!(matches!(
            t.insert("a", PathBuf::from("/y")),
            Err(EngineError::DuplicateMount(_))
        ));
        // A nested mount below an existing one is fine.
        t.insert("a/b", PathBuf::from("/y")).unwrap();
    }

    #[test]
    fn invalid_component_rejected() {
        let mut t = MountTree::new();
        assert!(t.insert("a/../b", Path::new("/x").to_path_buf()).is_err());
        assert!(t.insert("bad\x01name", PathBuf::from("/x")).is_err());
    }
}
