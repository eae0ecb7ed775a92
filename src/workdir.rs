//! Working-directory staging (spec §3 "Working-directory entry", §4.5, §4.6).

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::FsResult;

/// Unique staging names are drawn from a monotonic counter, never reused
/// within a process lifetime (spec §5).
pub struct WorkDir {
    root: PathBuf,
    counter: AtomicU64,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> FsResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, counter: AtomicU64::new(0) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Generate a fresh staging name and return its full path in the
    /// working directory.
    pub fn stage_path(&self) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!("#{:x}", n))
    }

    pub fn stage_name(&self) -> OsString {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        OsString::from(format!("#{:x}", n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_names_never_repeat() {
        let dir = tempfile::tempdir().unwrap();
        let wd = WorkDir::new(dir.path().join("work")).unwrap();
        let a = wd.stage_path();
        let b = wd.stage_path();
        assert_ne!(a, b);
    }
}
