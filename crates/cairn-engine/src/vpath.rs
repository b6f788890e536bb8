//! Virtual path utilities.
//!
//! Virtual paths are rootless, slash-separated UTF-8 strings; the empty
//! string names the repository root. Entry names are byte-compared, which
//! makes them sort identically in memory and in the store's key space.

use crate::{EngineError, Result};

/// Longest accepted entry name, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Longest accepted virtual path, in bytes.
pub const MAX_VPATH_LEN: usize = 4096;

/// First component of a path, with leading slashes collapsed.
pub fn head(p: &str) -> &str {
    let p = p.trim_start_matches('/');
    match p.find('/') {
        Some(i) => &p[..i],
        None => p,
    }
}

/// Everything after the first component, minus a single trailing slash.
/// `head(p)` joined to `tail(p)` with one slash reproduces `p` up to
/// leading-slash collapsing and trailing-slash removal.
pub fn tail(p: &str) -> &str {
    let p = p.trim_start_matches('/');
    match p.find('/') {
        Some(i) => {
            let t = &p[i + 1..];
            t.strip_suffix('/').unwrap_or(t)
        }
        None => "",
    }
}

/// Whether `name` is acceptable as a single directory entry name.
///
/// Rejected: empty, `.` and `..`, names over 255 bytes, and names
/// containing a slash, backslash, 0x00–0x1F or 0x7F. Non-UTF-8 names are
/// rejected upstream at the `OsStr` boundary.
pub fn valid_name(name: &str) -> bool {
    if name.is_empty() || name == "." || name == ".." || name.len() > MAX_NAME_LEN {
        return false;
    }
    !name
        .bytes()
        .any(|b| b == b'/' || b == b'\\' || b < 0x20 || b == 0x7F)
}

/// Whether `p` is a valid virtual path: every component a valid name. The
/// empty path (the root) is valid.
pub fn valid_vpath(p: &str) -> bool {
    let mut rest = p.trim_start_matches('/');
    if rest.len() > MAX_VPATH_LEN {
        return false;
    }
    while !rest.is_empty() {
        let h = head(rest);
        if !valid_name(h) {
            return false;
        }
        rest = tail(rest);
    }
    true
}

/// Bounded virtual path buffer used while walking the tree; pushes and
/// pops whole components.
#[derive(Debug, Clone, Default)]
pub struct VPathBuf {
    buf: String,
}

impl VPathBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from(path: &str) -> Self {
        Self {
            buf: path.to_owned(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn push(&mut self, name: &str) -> Result<()> {
        let extra = if self.buf.is_empty() {
            name.len()
        } else {
            name.len() + 1
        };
        if self.buf.len() + extra > MAX_VPATH_LEN {
            return Err(EngineError::Path(format!(
                "virtual path over {MAX_VPATH_LEN} bytes at {}",
                self.buf
            )));
        }
        if !self.buf.is_empty() {
            self.buf.push('/');
        }
        self.buf.push_str(name);
        Ok(())
    }

    pub fn pop(&mut self) {
        match self.buf.rfind('/') {
            Some(i) => self.buf.truncate(i),
            None => self.buf.clear(),
        }
    }
}

/// Join a parent virtual path and an entry name.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_owned()
    } else {
        format!("{parent}/{name}")
    }
}

/// Final component of a virtual path.
pub fn file_name(p: &str) -> &str {
    p.rsplit('/').next().unwrap_or(p)
}
