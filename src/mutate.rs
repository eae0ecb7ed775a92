//! Mutation protocol (spec §4.6): create, unlink, rename, rmdir, mknod,
//! symlink, link, mkdir, setattr. Every mutation operates on the upper
//! layer only and ensures copy-up of its target (and, where required, its
//! ancestors) first.

use std::ffi::OsStr;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use crate::copyup::copy_up;
use crate::crypto::{CryptoConfig, Key};
use crate::dirmerge;
use crate::error::{FsError, FsResult};
use crate::layer::{FollowMode, LayerStack};
use crate::node::{new_node, FileKind, HiddenState, NodeGraph, NodeId};
use crate::resolver;
use crate::whiteout;
use crate::workdir::WorkDir;
use crate::xattr_filter;

/// Shared handles every mutation needs; mirrors the subset of `Overlay`
/// relevant to this module so each function doesn't take a dozen params.
pub struct MutationCtx<'a> {
    pub graph: &'a NodeGraph,
    pub layers: &'a LayerStack,
    pub workdir: &'a WorkDir,
    pub key: &'a Key,
    pub crypto_cfg: &'a CryptoConfig,
    pub can_mknod: &'a mut bool,
    pub mode_override: bool,
}

impl<'a> MutationCtx<'a> {
    fn copy_up(&mut self, id: NodeId) -> FsResult<()> {
        copy_up(self.graph, self.layers, self.workdir, self.key, self.crypto_cfg, self.can_mknod, self.mode_override, id)
    }

    fn upper_path(&self, path: &Path) -> FsResult<std::path::PathBuf> {
        let upper = self.layers.upper().ok_or(FsError::NoUpperLayer)?;
        Ok(upper.store.full_path(path))
    }

    /// Ensure every ancestor of `node_id` (not the node itself) is on the
    /// upper layer, deepest ancestor last.
    fn copy_up_ancestors(&mut self, node_id: NodeId) -> FsResult<()> {
        let mut chain = Vec::new();
        let mut cur = self.graph.get(node_id)?.parent;
        while let Some(p) = cur {
            chain.push(p);
            cur = self.graph.get(p)?.parent;
        }
        for p in chain.into_iter().rev() {
            self.copy_up(p)?;
        }
        Ok(())
    }
}

fn upper_index(ctx: &MutationCtx) -> FsResult<usize> {
    ctx.layers.upper_index().ok_or(FsError::NoUpperLayer)
}

/// Remove any stale `.wh.<name>` marker at `dir/name` on the upper layer.
fn clear_whiteout_at(upper_dir: &Path, name: &OsStr) {
    let _ = std::fs::remove_file(upper_dir.join(whiteout::whiteout_name_for(name)));
}

/// Common tail of create/mknod/symlink/mkdir: register the freshly made
/// upper-layer entry as a node and clear any stale whiteout at its name.
fn register_new_child(
    ctx: &MutationCtx,
    parent: NodeId,
    name: &OsStr,
    kind: FileKind,
) -> FsResult<NodeId> {
    let parent_node = ctx.graph.get(parent)?;
    let path = parent_node.path.join(name);
    let upper_idx = upper_index(ctx)?;
    let upper_store = &ctx.layers.layers[upper_idx].store;
    let st = upper_store.stat(&path, FollowMode::NoFollow)?;
    let node = new_node(name.to_os_string(), path, Some(parent), kind, upper_idx, false, st.ino, st.dev);
    ctx.graph.insert_child(parent, node)
}

/// `ovl_create` / regular-file creation through `open(O_CREAT)`.
pub fn create(ctx: &mut MutationCtx, parent: NodeId, name: &OsStr, mode: u32, uid: u32, gid: u32) -> FsResult<NodeId> {
    ctx.copy_up_ancestors_including(parent)?;
    let parent_node = ctx.graph.get(parent)?;
    let upper_dir = ctx.upper_path(&parent_node.path)?;

    let stage = ctx.workdir.stage_path();
    {
        use std::os::unix::fs::OpenOptionsExt;
        let f = std::fs::OpenOptions::new().write(true).create_new(true).mode(mode & 0o7777).open(&stage)?;
        let _ = nix::unistd::fchown(
            std::os::unix::io::AsRawFd::as_raw_fd(&f),
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        );
    }
    let dest = upper_dir.join(name);
    if let Err(e) = std::fs::rename(&stage, &dest) {
        let _ = std::fs::remove_file(&stage);
        return Err(e.into());
    }
    clear_whiteout_at(&upper_dir, name);
    register_new_child(ctx, parent, name, FileKind::Reg)
}

pub fn mknod(ctx: &mut MutationCtx, parent: NodeId, name: &OsStr, mode: u32, rdev: u64, uid: u32, gid: u32) -> FsResult<NodeId> {
    ctx.copy_up_ancestors_including(parent)?;
    let parent_node = ctx.graph.get(parent)?;
    let upper_dir = ctx.upper_path(&parent_node.path)?;
    let dest = upper_dir.join(name);

    let c_path = std::ffi::CString::new(dest.as_os_str().as_encoded_bytes()).map_err(|_| FsError::InvalidInput)?;
    let rc = unsafe { libc::mknod(c_path.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let _ = nix::unistd::chown(&dest, Some(nix::unistd::Uid::from_raw(uid)), Some(nix::unistd::Gid::from_raw(gid)));
    clear_whiteout_at(&upper_dir, name);
    register_new_child(ctx, parent, name, FileKind::Reg)
}

pub fn symlink(ctx: &mut MutationCtx, parent: NodeId, name: &OsStr, target: &Path, uid: u32, gid: u32) -> FsResult<NodeId> {
    ctx.copy_up_ancestors_including(parent)?;
    let parent_node = ctx.graph.get(parent)?;
    let upper_dir = ctx.upper_path(&parent_node.path)?;
    let dest = upper_dir.join(name);
    let _ = std::fs::remove_file(&dest);
    std::os::unix::fs::symlink(target, &dest)?;
    let _ = nix::unistd::fchownat(
        None,
        &dest,
        Some(nix::unistd::Uid::from_raw(uid)),
        Some(nix::unistd::Gid::from_raw(gid)),
        nix::unistd::FchownatFlags::NoFollowSymlink,
    );
    clear_whiteout_at(&upper_dir, name);
    register_new_child(ctx, parent, name, FileKind::Lnk)
}

pub fn mkdir(ctx: &mut MutationCtx, parent: NodeId, name: &OsStr, mode: u32, uid: u32, gid: u32) -> FsResult<NodeId> {
    ctx.copy_up_ancestors_including(parent)?;
    let parent_node = ctx.graph.get(parent)?;
    let upper_dir = ctx.upper_path(&parent_node.path)?;
    let dest = upper_dir.join(name);
    std::fs::create_dir(&dest)?;
    std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode & 0o7777))?;
    let _ = nix::unistd::chown(&dest, Some(nix::unistd::Uid::from_raw(uid)), Some(nix::unistd::Gid::from_raw(gid)));
    clear_whiteout_at(&upper_dir, name);
    // mkdir over a formerly-existing lower-layer directory must start out
    // opaque: nothing from the lower layer should resurface (spec §8 inv. 4).
    let id = register_new_child(ctx, parent, name, FileKind::Dir)?;
    ctx.graph.mark_loaded(id)?;
    Ok(id)
}

pub fn link(ctx: &mut MutationCtx, src: NodeId, new_parent: NodeId, new_name: &OsStr) -> FsResult<NodeId> {
    ctx.copy_up(src)?;
    ctx.copy_up_ancestors_including(new_parent)?;
    let src_node = ctx.graph.get(src)?;
    let upper_idx = upper_index(ctx)?;
    let src_upper = ctx.layers.layers[upper_idx].store.full_path(&src_node.path);
    let new_parent_node = ctx.graph.get(new_parent)?;
    let dst_dir = ctx.upper_path(&new_parent_node.path)?;
    let dst = dst_dir.join(new_name);
    let _ = std::fs::remove_file(&dst);
    std::fs::hard_link(&src_upper, &dst)?;
    clear_whiteout_at(&dst_dir, new_name);

    let st = ctx.layers.layers[upper_idx].store.stat(&new_parent_node.path.join(new_name), FollowMode::NoFollow)?;
    let node = new_node(new_name.to_os_string(), new_parent_node.path.join(new_name), Some(new_parent), src_node.kind, upper_idx, false, st.ino, st.dev);
    ctx.graph.insert_child(new_parent, node)
}

/// Unlink or rmdir, sharing the hide-and-whiteout tail (spec §4.6).
pub fn unlink_or_rmdir(ctx: &mut MutationCtx, parent: NodeId, name: &OsStr, is_rmdir: bool) -> FsResult<()> {
    let id = resolver::lookup(ctx.graph, ctx.layers, parent, name)?.ok_or(FsError::NotFound)?;
    let node = ctx.graph.get(id)?;
    if node.is_whiteout {
        return Err(FsError::NotFound);
    }
    if is_rmdir {
        if node.kind != FileKind::Dir {
            return Err(FsError::NotADirectory);
        }
        dirmerge::load_dir(ctx.graph, ctx.layers, &crate::config::HideList::default(), id)?;
        let reloaded = ctx.graph.get(id)?;
        let children = reloaded.children.clone().unwrap_or_default();
        let all_whiteouts = children.values().all(|&c| ctx.graph.get(c).map(|n| n.is_whiteout).unwrap_or(true));
        if !all_whiteouts {
            return Err(FsError::DirectoryNotEmpty);
        }
        // If the upper-layer directory itself holds whiteout markers,
        // empty it before hiding so the rmdir on the real fs can succeed.
        if node.layer == ctx.layers.upper_index().unwrap_or(usize::MAX) {
            let upper_dir = ctx.upper_path(&node.path)?;
            if let Ok(entries) = std::fs::read_dir(&upper_dir) {
                for e in entries.flatten() {
                    let _ = std::fs::remove_file(e.path());
                }
            }
        }
    } else if node.kind == FileKind::Dir {
        return Err(FsError::IsADirectory);
    }

    ctx.copy_up(id)?;
    ctx.copy_up(parent)?;

    let parent_node = ctx.graph.get(parent)?;
    let upper_dir = ctx.upper_path(&parent_node.path)?;
    let node = ctx.graph.get(id)?;

    let stage_name = ctx.workdir.stage_name();
    let stage_path = ctx.workdir.root().join(&stage_name);
    let upper_entry = upper_dir.join(name);
    if std::fs::rename(&upper_entry, &stage_path).is_ok() {
        ctx.graph.update(id, |n| {
            n.hidden = if is_rmdir { HiddenState::HiddenPendingRmdir } else { HiddenState::HiddenPendingUnlink };
            n.hidden_name = Some(stage_name.clone());
        })?;
    }

    // Was this name still reachable from a lower layer? If so (and it isn't
    // shadowed by an opaque ancestor directory, which would already have
    // stopped the resolver from seeing it), leave a whiteout behind.
    let upper_idx = ctx.layers.upper_index().unwrap_or(usize::MAX);
    let visible_in_lower = ctx.layers.top_down().any(|idx| {
        idx != upper_idx && ctx.layers.layers[idx].store.file_exists(&node.path).unwrap_or(false)
    });
    if visible_in_lower {
        whiteout::create_whiteout(&upper_dir, name, ctx.can_mknod)?;
    }

    ctx.graph.remove_from_parent(id)?;
    Ok(())
}

/// Called once a hidden node's kernel-side lookup count reaches zero
/// (spec §3, §9 "hidden" state machine): perform the deferred unlink/rmdir
/// of its working-directory staging entry and tear the node down.
pub fn finalize_hidden(ctx: &mut MutationCtx, id: NodeId) -> FsResult<()> {
    let node = ctx.graph.get(id)?;
    if let Some(stage_name) = &node.hidden_name {
        let stage_path = ctx.workdir.root().join(stage_name);
        match node.hidden {
            HiddenState::HiddenPendingRmdir => {
                let _ = std::fs::remove_dir_all(&stage_path);
            }
            HiddenState::HiddenPendingUnlink => {
                let _ = std::fs::remove_file(&stage_path);
            }
            HiddenState::Active => {}
        }
    }
    ctx.graph.detach(id)
}

/// Exchange-mode rename (`RENAME_EXCHANGE`): both endpoints must already be
/// on the upper layer; swap their real paths, then swap the node records.
pub fn rename_exchange(ctx: &mut MutationCtx, a_parent: NodeId, a_name: &OsStr, b_parent: NodeId, b_name: &OsStr) -> FsResult<()> {
    let a_id = resolver::lookup(ctx.graph, ctx.layers, a_parent, a_name)?.ok_or(FsError::NotFound)?;
    let b_id = resolver::lookup(ctx.graph, ctx.layers, b_parent, b_name)?.ok_or(FsError::NotFound)?;
    ctx.copy_up(a_id)?;
    ctx.copy_up(b_id)?;

    let a_node = ctx.graph.get(a_id)?;
    let b_node = ctx.graph.get(b_id)?;
    let upper_idx = upper_index(ctx)?;
    let store = &ctx.layers.layers[upper_idx].store;
    let a_path = store.full_path(&a_node.path);
    let b_path = store.full_path(&b_node.path);

    nix::fcntl::renameat2(
        None,
        &a_path,
        None,
        &b_path,
        nix::fcntl::RenameFlags::RENAME_EXCHANGE,
    )
    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

    ctx.graph.reparent(a_id, b_parent, b_name.to_os_string())?;
    ctx.graph.reparent(b_id, a_parent, a_name.to_os_string())?;

    let a_parent_dir = ctx.upper_path(&ctx.graph.get(a_parent)?.path)?;
    let b_parent_dir = ctx.upper_path(&ctx.graph.get(b_parent)?.path)?;
    clear_whiteout_at(&b_parent_dir, b_name);
    clear_whiteout_at(&a_parent_dir, a_name);
    Ok(())
}

/// Direct-mode rename.
pub fn rename_direct(ctx: &mut MutationCtx, src_parent: NodeId, src_name: &OsStr, dst_parent: NodeId, dst_name: &OsStr, no_replace: bool) -> FsResult<()> {
    let src_id = resolver::lookup(ctx.graph, ctx.layers, src_parent, src_name)?.ok_or(FsError::NotFound)?;
    ctx.copy_up(src_id)?;
    ctx.copy_up_ancestors_including(dst_parent)?;

    if let Some(dst_id) = resolver::lookup(ctx.graph, ctx.layers, dst_parent, dst_name)? {
        let dst_node = ctx.graph.get(dst_id)?;
        if !dst_node.is_whiteout {
            if no_replace {
                return Err(FsError::AlreadyExists);
            }
            if dst_node.kind == FileKind::Dir {
                dirmerge::load_dir(ctx.graph, ctx.layers, &crate::config::HideList::default(), dst_id)?;
                let reloaded = ctx.graph.get(dst_id)?;
                let non_empty = reloaded.children.as_ref().map(|c| !c.is_empty()).unwrap_or(false);
                if non_empty {
                    return Err(FsError::DirectoryNotEmpty);
                }
            }
            unlink_or_rmdir(ctx, dst_parent, dst_name, dst_node.kind == FileKind::Dir)?;
        }
    }

    let src_node = ctx.graph.get(src_id)?;
    let upper_idx = upper_index(ctx)?;
    let store = &ctx.layers.layers[upper_idx].store;
    let src_path = store.full_path(&src_node.path);
    let dst_parent_node = ctx.graph.get(dst_parent)?;
    let dst_dir = ctx.upper_path(&dst_parent_node.path)?;
    let dst_path = dst_dir.join(dst_name);

    std::fs::rename(&src_path, &dst_path)?;
    clear_whiteout_at(&dst_dir, dst_name);

    if src_node.kind == FileKind::Dir {
        // Lower-layer children that would now resurface under the new name
        // must be shadowed with explicit whiteouts.
        dirmerge::load_dir(ctx.graph, ctx.layers, &crate::config::HideList::default(), src_id)?;
        let reloaded = ctx.graph.get(src_id)?;
        if let Some(children) = &reloaded.children {
            for (child_name, child_id) in children {
                let child = ctx.graph.get(*child_id)?;
                if child.layer != upper_idx && !child.is_whiteout {
                    whiteout::create_whiteout(&dst_path, child_name, ctx.can_mknod)?;
                }
            }
        }
    }

    // If the old name is still reachable from a lower layer, leave a
    // whiteout at the source.
    let src_parent_node = ctx.graph.get(src_parent)?;
    let shadowed_by_lower = ctx.layers.top_down().any(|idx| {
        idx != upper_idx && ctx.layers.layers[idx].store.file_exists(&src_parent_node.path.join(src_name)).unwrap_or(false)
    });
    if shadowed_by_lower {
        let src_dir = ctx.upper_path(&src_parent_node.path)?;
        whiteout::create_whiteout(&src_dir, src_name, ctx.can_mknod)?;
    }

    ctx.graph.reparent(src_id, dst_parent, dst_name.to_os_string())?;
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XattrOverrideMode {
    Disabled,
    PrivilegedOverrideStat,
    OverrideStat,
}

/// Apply time/mode/size/ownership changes, in that order (spec §4.6).
pub struct SetattrChanges {
    pub size: Option<u64>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<std::time::SystemTime>,
    pub mtime: Option<std::time::SystemTime>,
}

pub fn setattr(ctx: &mut MutationCtx, id: NodeId, changes: &SetattrChanges, override_mode: XattrOverrideMode) -> FsResult<()> {
    ctx.copy_up(id)?;
    let node = ctx.graph.get(id)?;
    let upper_idx = upper_index(ctx)?;
    let path = ctx.layers.layers[upper_idx].store.full_path(&node.path);

    if changes.atime.is_some() || changes.mtime.is_some() {
        let to_timespec = |t: std::time::SystemTime| {
            let dur = t.duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
            nix::sys::time::TimeSpec::new(dur.as_secs() as i64, dur.subsec_nanos() as i64)
        };
        let omit = nix::sys::time::TimeSpec::new(0, libc::UTIME_OMIT as i64);
        let atime = changes.atime.map(to_timespec).unwrap_or(omit);
        let mtime = changes.mtime.map(to_timespec).unwrap_or(omit);
        nix::sys::stat::utimensat(None, &path, &atime, &mtime, nix::sys::stat::UtimensatFlags::NoFollowSymlink)
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    }

    match override_mode {
        XattrOverrideMode::Disabled => {
            if let Some(mode) = changes.mode {
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 0o7777))?;
            }
        }
        XattrOverrideMode::PrivilegedOverrideStat | XattrOverrideMode::OverrideStat => {
            if changes.mode.is_some() || changes.uid.is_some() || changes.gid.is_some() {
                let cur = std::fs::symlink_metadata(&path)?;
                let uid = changes.uid.unwrap_or(cur.uid());
                let gid = changes.gid.unwrap_or(cur.gid());
                let mode = changes.mode.unwrap_or(cur.mode() & 0o7777);
                let value = format!("{uid}:{gid}:{mode:o}");
                let attr = if override_mode == XattrOverrideMode::PrivilegedOverrideStat {
                    xattr_filter::OVERRIDE_STAT_TRUSTED
                } else {
                    xattr_filter::OVERRIDE_STAT_USER
                };
                let res = xattr::set(&path, attr, value.as_bytes());
                match (res, override_mode) {
                    (Err(e), XattrOverrideMode::PrivilegedOverrideStat) => return Err(e.into()),
                    (Err(e), XattrOverrideMode::OverrideStat) if e.raw_os_error() != Some(libc::EPERM) => return Err(e.into()),
                    _ => {}
                }
            }
        }
    }

    if let Some(size) = changes.size {
        let f = std::fs::OpenOptions::new().write(true).open(&path)?;
        f.set_len(size)?;
    }

    if override_mode == XattrOverrideMode::Disabled {
        if changes.uid.is_some() || changes.gid.is_some() {
            let _ = nix::unistd::chown(
                &path,
                changes.uid.map(nix::unistd::Uid::from_raw),
                changes.gid.map(nix::unistd::Gid::from_raw),
            );
        }
    }
    Ok(())
}

impl<'a> MutationCtx<'a> {
    /// Copy up every ancestor of `id`, then `id` itself (used when `id` is
    /// the directory a new child is about to be created in).
    fn copy_up_ancestors_including(&mut self, id: NodeId) -> FsResult<()> {
        self.copy_up_ancestors(id)?;
        self.copy_up(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerStack;
    use crate::node::NodeGraph;

    fn setup() -> (NodeGraph, LayerStack, WorkDir, tempfile::TempDir, tempfile::TempDir) {
        let lower = tempfile::tempdir().unwrap();
        let upper = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(upper.path().join(".work")).unwrap();
        let stack = LayerStack::new(vec![lower.path().into()], Some(upper.path().into()));
        (NodeGraph::new(), stack, workdir, lower, upper)
    }

    #[test]
    fn create_registers_upper_file() {
        let (graph, stack, workdir, _lower, upper) = setup();
        let key = crate::crypto::derive_key("pw");
        let cfg = CryptoConfig::default();
        let mut can_mknod = false;
        let mut ctx = MutationCtx { graph: &graph, layers: &stack, workdir: &workdir, key: &key, crypto_cfg: &cfg, can_mknod: &mut can_mknod, mode_override: false };
        let id = create(&mut ctx, crate::ROOT_INODE_ID, OsStr::new("new"), 0o644, 0, 0).unwrap();
        assert!(upper.path().join("new").exists());
        assert_eq!(graph.get(id).unwrap().kind, FileKind::Reg);
    }

    #[test]
    fn unlink_leaves_whiteout_for_lower_entry() {
        let (graph, stack, workdir, lower, upper) = setup();
        std::fs::write(lower.path().join("a"), b"x").unwrap();
        let key = crate::crypto::derive_key("pw");
        let cfg = CryptoConfig::default();
        let mut can_mknod = false;
        let mut ctx = MutationCtx { graph: &graph, layers: &stack, workdir: &workdir, key: &key, crypto_cfg: &cfg, can_mknod: &mut can_mknod, mode_override: false };
        unlink_or_rmdir(&mut ctx, crate::ROOT_INODE_ID, OsStr::new("a"), false).unwrap();
        assert!(upper.path().join(".wh.a").exists() || {
            let md = std::fs::symlink_metadata(upper.path().join("a"));
            md.map(|m| whiteout::is_whiteout_chardev(m.mode() & libc::S_IFMT, m.rdev())).unwrap_or(false)
        });
    }

    #[test]
    fn mkdir_creates_upper_directory() {
        let (graph, stack, workdir, _lower, upper) = setup();
        let key = crate::crypto::derive_key("pw");
        let cfg = CryptoConfig::default();
        let mut can_mknod = false;
        let mut ctx = MutationCtx { graph: &graph, layers: &stack, workdir: &workdir, key: &key, crypto_cfg: &cfg, can_mknod: &mut can_mknod, mode_override: false };
        mkdir(&mut ctx, crate::ROOT_INODE_ID, OsStr::new("newdir"), 0o755, 0, 0).unwrap();
        assert!(upper.path().join("newdir").is_dir());
    }
}
