//! Top-level filesystem instance (spec §9 "global mutable state -> scoped
//! context"): owns the layer stack, node graph, id maps, hide-list,
//! working directory, crypto key/config, access gate, and the big lock
//! that serializes dispatch (spec §5).

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::access::AccessGate;
use crate::config::{HideList, MountOptions, XattrPermissions};
use crate::copyup::copy_up;
use crate::crypto::{self, CryptoConfig, Key};
use crate::dirmerge;
use crate::error::{FsError, FsResult};
use crate::idmap::IdMap;
use crate::layer::LayerStack;
use crate::mutate::{self, MutationCtx, SetattrChanges, XattrOverrideMode};
use crate::node::{HiddenState, NodeGraph, NodeId};
use crate::resolver;
use crate::workdir::WorkDir;

/// A single filesystem mount's worth of state. One instance per `mount(2)`
/// session; the `fuser::Filesystem` glue in `fuse::cli` holds one of these
/// and forwards every kernel request into it under `big_lock`.
pub struct Overlay {
    pub layers: LayerStack,
    pub graph: NodeGraph,
    pub workdir: WorkDir,
    pub uid_map: IdMap,
    pub gid_map: IdMap,
    pub hide_list: HideList,
    pub access_gate: AccessGate,
    pub crypto_cfg: CryptoConfig,
    key: Key,
    pub xattr_permissions: XattrPermissions,
    pub noxattrs: bool,
    pub static_nlink: bool,
    /// Sticky capability flag: cleared the first time a `mknod` for a
    /// char-device whiteout is denied (spec §4.7, §9).
    can_mknod: Mutex<bool>,
    /// Process-wide serialization mutex (spec §5 "big lock"). Handlers
    /// acquire a guard from `lock()` for the duration of a request.
    big_lock: Mutex<()>,
}

impl Overlay {
    pub fn new(opts: &MountOptions, mount_point: &Path) -> FsResult<Self> {
        if opts.upperdir.is_some() && opts.workdir.is_none() {
            return Err(FsError::InvalidInput);
        }
        let layers = LayerStack::new(opts.lowerdir.clone(), opts.upperdir.clone());
        let workdir_path = opts.workdir.clone().unwrap_or_else(|| PathBuf::from("/tmp/.fuseoverlayfs-workdir"));
        let workdir = WorkDir::new(workdir_path)?;

        let overflow_uid = IdMap::read_overflow("/proc/sys/kernel/overflowuid");
        let overflow_gid = IdMap::read_overflow("/proc/sys/kernel/overflowgid");
        let uid_map = IdMap::new(opts.uid_ranges.clone(), opts.uid_squash, overflow_uid);
        let gid_map = IdMap::new(opts.gid_ranges.clone(), opts.gid_squash, overflow_gid);

        let hide_list = HideList::load(Path::new(crate::config::DEFAULT_CONFIG_PATH));
        let access_gate = AccessGate::new(None, vec!["pkexec".into()], mount_point);
        let key = crypto::derive_key(&opts.password);

        Ok(Self {
            layers,
            graph: NodeGraph::new(),
            workdir,
            uid_map,
            gid_map,
            hide_list,
            access_gate,
            crypto_cfg: CryptoConfig { block_size: crypto::DEFAULT_BLOCK_SIZE, allow_holes: true },
            key,
            xattr_permissions: opts.xattr_permissions,
            noxattrs: opts.noxattrs,
            static_nlink: opts.static_nlink,
            can_mknod: Mutex::new(true),
            big_lock: Mutex::new(()),
        })
    }

    /// Acquire the big lock for the duration of one dispatcher call.
    pub fn lock(&self) -> FsResult<std::sync::MutexGuard<'_, ()>> {
        self.big_lock.lock().map_err(|_| FsError::MutexError)
    }

    pub fn lookup(&self, parent: NodeId, name: &OsStr) -> FsResult<Option<NodeId>> {
        resolver::lookup(&self.graph, &self.layers, parent, name)
    }

    pub fn readdir(&self, node_id: NodeId) -> FsResult<Vec<(std::ffi::OsString, NodeId)>> {
        dirmerge::load_dir(&self.graph, &self.layers, &self.hide_list, node_id)?;
        dirmerge::readdir(&self.graph, node_id)
    }

    pub fn get_node_up(&self, id: NodeId) -> FsResult<NodeId> {
        let mut guard = self.can_mknod.lock().map_err(|_| FsError::MutexError)?;
        copy_up(&self.graph, &self.layers, &self.workdir, &self.key, &self.crypto_cfg, &mut guard, self.mode_override(), id)?;
        Ok(id)
    }

    fn mode_override(&self) -> bool {
        self.xattr_permissions != XattrPermissions::Disabled
    }

    pub fn create(&self, parent: NodeId, name: &OsStr, mode: u32, uid: u32, gid: u32) -> FsResult<NodeId> {
        self.with_mutation_ctx(|ctx| mutate::create(ctx, parent, name, mode, uid, gid))
    }

    pub fn mknod(&self, parent: NodeId, name: &OsStr, mode: u32, rdev: u64, uid: u32, gid: u32) -> FsResult<NodeId> {
        self.with_mutation_ctx(|ctx| mutate::mknod(ctx, parent, name, mode, rdev, uid, gid))
    }

    pub fn symlink(&self, parent: NodeId, name: &OsStr, target: &Path, uid: u32, gid: u32) -> FsResult<NodeId> {
        self.with_mutation_ctx(|ctx| mutate::symlink(ctx, parent, name, target, uid, gid))
    }

    pub fn mkdir(&self, parent: NodeId, name: &OsStr, mode: u32, uid: u32, gid: u32) -> FsResult<NodeId> {
        self.with_mutation_ctx(|ctx| mutate::mkdir(ctx, parent, name, mode, uid, gid))
    }

    pub fn link(&self, src: NodeId, new_parent: NodeId, new_name: &OsStr) -> FsResult<NodeId> {
        self.with_mutation_ctx(|ctx| mutate::link(ctx, src, new_parent, new_name))
    }

    pub fn unlink(&self, parent: NodeId, name: &OsStr) -> FsResult<()> {
        self.with_mutation_ctx(|ctx| mutate::unlink_or_rmdir(ctx, parent, name, false))
    }

    pub fn rmdir(&self, parent: NodeId, name: &OsStr) -> FsResult<()> {
        self.with_mutation_ctx(|ctx| mutate::unlink_or_rmdir(ctx, parent, name, true))
    }

    pub fn rename(&self, src_parent: NodeId, src_name: &OsStr, dst_parent: NodeId, dst_name: &OsStr, exchange: bool, no_replace: bool) -> FsResult<()> {
        self.with_mutation_ctx(|ctx| {
            if exchange {
                mutate::rename_exchange(ctx, src_parent, src_name, dst_parent, dst_name)
            } else {
                mutate::rename_direct(ctx, src_parent, src_name, dst_parent, dst_name, no_replace)
            }
        })
    }

    pub fn setattr(&self, id: NodeId, changes: &SetattrChanges) -> FsResult<()> {
        let mode = match self.xattr_permissions {
            XattrPermissions::Disabled => XattrOverrideMode::Disabled,
            XattrPermissions::PrivilegedOverrideStat => XattrOverrideMode::PrivilegedOverrideStat,
            XattrPermissions::UserOverrideStat => XattrOverrideMode::OverrideStat,
        };
        self.with_mutation_ctx(|ctx| mutate::setattr(ctx, id, changes, mode))
    }

    /// Release a node once the kernel's lookup count for it drops to zero.
    /// If it was hidden (deleted while still referenced), perform the
    /// deferred staging cleanup now (spec §3, §9).
    pub fn forget(&self, id: NodeId, n: u64) -> FsResult<()> {
        self.graph.dec_lookup(id, n)?;
        let node = self.graph.get(id)?;
        if node.hidden != HiddenState::Active {
            self.with_mutation_ctx(|ctx| mutate::finalize_hidden(ctx, id))?;
        }
        Ok(())
    }

    fn with_mutation_ctx<T>(&self, f: impl FnOnce(&mut MutationCtx) -> FsResult<T>) -> FsResult<T> {
        let mut can_mknod = self.can_mknod.lock().map_err(|_| FsError::MutexError)?;
        let mut ctx = MutationCtx {
            graph: &self.graph,
            layers: &self.layers,
            workdir: &self.workdir,
            key: &self.key,
            crypto_cfg: &self.crypto_cfg,
            can_mknod: &mut can_mknod,
            mode_override: self.mode_override(),
        };
        f(&mut ctx)
    }

    pub fn stats(&self) -> (usize, usize) {
        self.graph.stats()
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// `stat` with host->presented id translation applied (spec §4.10).
    pub fn getattr(&self, id: NodeId) -> FsResult<crate::layer::StatInfo> {
        let node = self.graph.get(id)?;
        let store = &self.layers.layers[node.layer].store;
        let mut st = store.stat(&node.path, crate::layer::FollowMode::NoFollow)?;
        st.uid = self.uid_map.map_out(st.uid);
        st.gid = self.gid_map.map_out(st.gid);
        if self.static_nlink && node.kind == crate::node::FileKind::Dir {
            st.nlink = 2;
        }
        Ok(st)
    }

    /// Read up to `out.len()` bytes at `offset`. Content on the upper layer
    /// is block-encrypted (spec §4.8); lower-layer content is read as-is
    /// (lower layers are never written to by this filesystem).
    pub fn read(&self, id: NodeId, offset: u64, out: &mut [u8]) -> FsResult<usize> {
        let node = self.graph.get(id)?;
        let store = &self.layers.layers[node.layer].store;
        let file = store.open(&node.path, libc::O_RDONLY)?;
        let file_len = store.fstat(&file)?.size;
        if node.layer == self.layers.upper_index().unwrap_or(usize::MAX) {
            let mut guard = node.crypto.lock().map_err(|_| FsError::MutexError)?;
            crypto::read_at(&file, &self.key, &self.crypto_cfg, &mut guard, offset, out, file_len)
        } else {
            use std::os::unix::fs::FileExt;
            if offset >= file_len {
                return Ok(0);
            }
            let want = out.len().min((file_len - offset) as usize);
            file.read_exact_at(&mut out[..want], offset)?;
            Ok(want)
        }
    }

    /// Write, ensuring copy-up first: the upper layer is the only mutable
    /// target (spec §4.6, §4.8).
    pub fn write(&self, id: NodeId, offset: u64, data: &[u8]) -> FsResult<usize> {
        let id = self.get_node_up(id)?;
        let node = self.graph.get(id)?;
        let upper_idx = self.layers.upper_index().ok_or(FsError::NoUpperLayer)?;
        let store = &self.layers.layers[upper_idx].store;
        let file = store.open(&node.path, libc::O_RDWR)?;
        let file_len = store.fstat(&file)?.size;
        let mut guard = node.crypto.lock().map_err(|_| FsError::MutexError)?;
        crypto::write_at(&file, &self.key, &self.crypto_cfg, &mut guard, offset, data, file_len)
    }

    pub fn getxattr(&self, id: NodeId, name: &str) -> FsResult<Option<Vec<u8>>> {
        if crate::xattr_filter::is_reserved(name) {
            return Err(FsError::NotFound);
        }
        let node = self.graph.get(id)?;
        let store = &self.layers.layers[node.layer].store;
        store.getxattr(&node.path, name)
    }

    pub fn listxattr(&self, id: NodeId) -> FsResult<Vec<String>> {
        let node = self.graph.get(id)?;
        let store = &self.layers.layers[node.layer].store;
        Ok(crate::xattr_filter::filter_listxattr(store.listxattr(&node.path)?))
    }

    pub fn setxattr(&self, id: NodeId, name: &str, value: &[u8]) -> FsResult<()> {
        if crate::xattr_filter::is_reserved(name) {
            return Err(FsError::PermissionDenied);
        }
        let id = self.get_node_up(id)?;
        let node = self.graph.get(id)?;
        let upper = self.layers.upper().ok_or(FsError::NoUpperLayer)?;
        let full = upper.store.full_path(&node.path);
        xattr::set(&full, name, value)?;
        Ok(())
    }

    pub fn removexattr(&self, id: NodeId, name: &str) -> FsResult<()> {
        if crate::xattr_filter::is_reserved(name) {
            return Err(FsError::PermissionDenied);
        }
        let id = self.get_node_up(id)?;
        let node = self.graph.get(id)?;
        let upper = self.layers.upper().ok_or(FsError::NoUpperLayer)?;
        let full = upper.store.full_path(&node.path);
        xattr::remove(&full, name)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts_for(lower: &Path, upper: &Path, work: &Path) -> MountOptions {
        let mut o = MountOptions::default();
        o.lowerdir = vec![lower.to_path_buf()];
        o.upperdir = Some(upper.to_path_buf());
        o.workdir = Some(work.to_path_buf());
        o
    }

    #[test]
    fn lookup_and_readdir_merge_layers() {
        let lower = tempfile::tempdir().unwrap();
        let upper = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        std::fs::write(lower.path().join("a"), b"x").unwrap();
        let ovl = Overlay::new(&opts_for(lower.path(), upper.path(), work.path()), Path::new("/mnt/x")).unwrap();
        let listing = ovl.readdir(crate::ROOT_INODE_ID).unwrap();
        assert!(listing.iter().any(|(n, _)| n == "a"));
    }

    #[test]
    fn create_then_unlink_then_create_has_same_visible_effect() {
        let lower = tempfile::tempdir().unwrap();
        let upper = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let ovl = Overlay::new(&opts_for(lower.path(), upper.path(), work.path()), Path::new("/mnt/x")).unwrap();
        ovl.create(crate::ROOT_INODE_ID, OsStr::new("f"), 0o644, 0, 0).unwrap();
        ovl.unlink(crate::ROOT_INODE_ID, OsStr::new("f")).unwrap();
        let id = ovl.create(crate::ROOT_INODE_ID, OsStr::new("f"), 0o644, 0, 0).unwrap();
        assert!(upper.path().join("f").exists());
        assert_eq!(ovl.graph.get(id).unwrap().kind, crate::node::FileKind::Reg);
    }

    #[test]
    fn rename_makes_old_name_not_found_and_new_name_resolve() {
        let lower = tempfile::tempdir().unwrap();
        let upper = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let ovl = Overlay::new(&opts_for(lower.path(), upper.path(), work.path()), Path::new("/mnt/x")).unwrap();
        ovl.create(crate::ROOT_INODE_ID, OsStr::new("a"), 0o644, 0, 0).unwrap();
        ovl.rename(crate::ROOT_INODE_ID, OsStr::new("a"), crate::ROOT_INODE_ID, OsStr::new("b"), false, false).unwrap();
        assert!(ovl.lookup(crate::ROOT_INODE_ID, OsStr::new("a")).unwrap().is_none());
        assert!(ovl.lookup(crate::ROOT_INODE_ID, OsStr::new("b")).unwrap().is_some());
    }
}
