//! Layer store abstraction (spec §4.1) and the ordered layer stack (spec §3).

use std::ffi::{OsStr, OsString};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crate::error::{FsError, FsResult};

#[derive(Clone, Debug)]
pub struct StatInfo {
    pub ino: u64,
    pub dev: u64,
    pub rdev: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u64,
    pub atime: std::time::SystemTime,
    pub mtime: std::time::SystemTime,
    pub ctime: std::time::SystemTime,
}

impl From<fs::Metadata> for StatInfo {
    fn from(m: fs::Metadata) -> Self {
        Self {
            ino: m.ino(),
            dev: m.dev(),
            rdev: m.rdev(),
            mode: m.mode(),
            uid: m.uid(),
            gid: m.gid(),
            size: m.size(),
            nlink: m.nlink(),
            atime: m.accessed().unwrap_or(std::time::UNIX_EPOCH),
            mtime: m.modified().unwrap_or(std::time::UNIX_EPOCH),
            ctime: std::time::UNIX_EPOCH + std::time::Duration::new(m.ctime() as u64, m.ctime_nsec() as u32),
        }
    }
}

/// Whether a `stat` call should follow a trailing symlink. All lookups
/// across layer boundaries use `NoFollow`; a handful of interfaces (reading
/// the target of a symlink the caller explicitly asked to follow) opt in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FollowMode {
    NoFollow,
    Follow,
}

#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: OsString,
    pub ino: u64,
    pub file_type: libc::mode_t,
}

/// Uniform read (and, for the upper layer, write) operations over a
/// directory tree, relative to the layer's root. All path operations are
/// no-follow unless `FollowMode::Follow` is passed explicitly: an
/// implementation must never let a symlink inside one layer walk into
/// another layer's tree.
pub trait LayerStore: Send + Sync {
    fn root(&self) -> &Path;

    /// Resolve a unified-view-relative path to the real path backing it on
    /// this layer. Meaningful only for filesystem-backed stores; used by
    /// the whiteout/opaque helpers, which operate on real paths directly.
    fn full_path(&self, path: &Path) -> PathBuf {
        if path == Path::new("/") {
            self.root().to_path_buf()
        } else {
            self.root().join(path.strip_prefix("/").unwrap_or(path))
        }
    }

    fn open(&self, path: &Path, flags: i32) -> FsResult<File>;

    fn stat(&self, path: &Path, follow: FollowMode) -> FsResult<StatInfo>;

    fn fstat(&self, fd: &File) -> FsResult<StatInfo>;

    fn readdir(&self, path: &Path) -> FsResult<Vec<DirEntry>>;

    fn readlink(&self, path: &Path) -> FsResult<PathBuf>;

    fn getxattr(&self, path: &Path, name: &str) -> FsResult<Option<Vec<u8>>>;

    fn listxattr(&self, path: &Path) -> FsResult<Vec<String>>;

    /// 0 if present, distinct not-found signal (`Ok(false)`) if absent.
    /// Any other error (permission, I/O) is propagated.
    fn file_exists(&self, path: &Path) -> FsResult<bool> {
        match self.stat(path, FollowMode::NoFollow) {
            Ok(_) => Ok(true),
            Err(FsError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// The only implementation shipped here: direct access to a real directory
/// tree via the host filesystem. Alternative `LayerStore`s (network blob
/// stores, content-addressed layers, ...) would be loaded through
/// `load_data_source`-style plugin hooks, out of this crate's scope.
pub struct DirLayerStore {
    root: PathBuf,
}

impl DirLayerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full(&self, path: &Path) -> PathBuf {
        // `path` is always layer-relative ("/" == layer root).
        if path == Path::new("/") {
            self.root.clone()
        } else {
            self.root.join(path.strip_prefix("/").unwrap_or(path))
        }
    }
}

impl LayerStore for DirLayerStore {
    fn root(&self) -> &Path {
        &self.root
    }

    fn open(&self, path: &Path, flags: i32) -> FsResult<File> {
        let full = self.full(path);
        Ok(OpenOptions::new()
            .read(true)
            .write(flags & libc::O_WRONLY != 0 || flags & libc::O_RDWR != 0)
            .custom_flags(flags & !(libc::O_WRONLY | libc::O_RDWR | libc::O_CREAT))
            .open(full)?)
    }

    fn stat(&self, path: &Path, follow: FollowMode) -> FsResult<StatInfo> {
        let full = self.full(path);
        let md = match follow {
            FollowMode::NoFollow => fs::symlink_metadata(&full),
            FollowMode::Follow => fs::metadata(&full),
        }?;
        Ok(md.into())
    }

    fn fstat(&self, fd: &File) -> FsResult<StatInfo> {
        Ok(fd.metadata()?.into())
    }

    fn readdir(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        let full = self.full(path);
        let mut out = Vec::new();
        for entry in fs::read_dir(&full)? {
            let entry = entry?;
            let md = entry.metadata()?;
            out.push(DirEntry {
                name: entry.file_name(),
                ino: md.ino(),
                file_type: md.mode() & libc::S_IFMT,
            });
        }
        Ok(out)
    }

    fn readlink(&self, path: &Path) -> FsResult<PathBuf> {
        Ok(fs::read_link(self.full(path))?)
    }

    fn getxattr(&self, path: &Path, name: &str) -> FsResult<Option<Vec<u8>>> {
        Ok(xattr::get(self.full(path), name)?)
    }

    fn listxattr(&self, path: &Path) -> FsResult<Vec<String>> {
        let list = xattr::list(self.full(path))?;
        Ok(list.into_iter().map(|n| n.to_string_lossy().into_owned()).collect())
    }
}

/// One position in the layer stack (spec §3). Lowers are ordered first
/// (most recently pushed) to last; the upper, when present, sits above
/// them. Immutable after mount.
pub struct Layer {
    pub store: Box<dyn LayerStore>,
    pub is_upper: bool,
}

impl Layer {
    pub fn lower(root: impl Into<PathBuf>) -> Self {
        Self { store: Box::new(DirLayerStore::new(root)), is_upper: false }
    }

    pub fn upper(root: impl Into<PathBuf>) -> Self {
        Self { store: Box::new(DirLayerStore::new(root)), is_upper: true }
    }
}

/// The ordered layer stack: lowers first, upper (if any) last.
pub struct LayerStack {
    pub layers: Vec<Layer>,
}

impl LayerStack {
    pub fn new(lowers: Vec<PathBuf>, upper: Option<PathBuf>) -> Self {
        let mut layers: Vec<Layer> = lowers.into_iter().map(Layer::lower).collect();
        if let Some(upper) = upper {
            layers.push(Layer::upper(upper));
        }
        Self { layers }
    }

    pub fn num_of_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn upper_index(&self) -> Option<usize> {
        self.layers.last().filter(|l| l.is_upper).map(|_| self.layers.len() - 1)
    }

    pub fn has_upper(&self) -> bool {
        self.upper_index().is_some()
    }

    pub fn upper(&self) -> Option<&Layer> {
        self.upper_index().map(|i| &self.layers[i])
    }

    /// Layer indices from top (upper, if present) to bottom, as the
    /// resolver and directory merger walk them.
    pub fn top_down(&self) -> impl Iterator<Item = usize> {
        (0..self.layers.len()).rev()
    }

    pub fn cleanup(&self) {
        // no persistent per-layer resources to release for the direct
        // filesystem store; a plugin-backed store would close its handles here.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_exists_distinguishes_present_and_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("a")).unwrap();
        let store = DirLayerStore::new(dir.path());
        assert!(store.file_exists(Path::new("/a")).unwrap());
        assert!(!store.file_exists(Path::new("/missing")).unwrap());
    }

    #[test]
    fn stat_is_no_follow_by_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("target")).unwrap();
        std::os::unix::fs::symlink("target", dir.path().join("link")).unwrap();
        let store = DirLayerStore::new(dir.path());
        let st = store.stat(Path::new("/link"), FollowMode::NoFollow).unwrap();
        assert_eq!(st.mode & libc::S_IFMT, libc::S_IFLNK);
    }

    #[test]
    fn layer_stack_orders_upper_last() {
        let stack = LayerStack::new(vec!["/a".into(), "/b".into()], Some("/u".into()));
        assert_eq!(stack.num_of_layers(), 3);
        assert!(stack.has_upper());
        assert_eq!(stack.top_down().collect::<Vec<_>>(), vec![2, 1, 0]);
    }
}
