//! Copy-up engine (spec §4.5): promotes a node from a lower layer to the
//! upper layer via the working directory's staged-rename protocol.

use std::fs::OpenOptions;
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

use crate::crypto::{self, CryptoConfig, Key};
use crate::error::{FsError, FsResult};
use crate::layer::{FollowMode, LayerStack};
use crate::node::{FileKind, NodeGraph, NodeId};
use crate::whiteout;
use crate::workdir::WorkDir;
use crate::xattr_filter;

/// Recursively ensure `dir_path` (and every ancestor) exists on the upper
/// layer, copying mode/ownership/times from whichever layer currently
/// contributes it.
fn ensure_parent_dir_upper(
    graph: &NodeGraph,
    layers: &LayerStack,
    upper_root: &Path,
    dir_path: &Path,
) -> FsResult<()> {
    if dir_path == Path::new("/") {
        std::fs::create_dir_all(upper_root)?;
        return Ok(());
    }
    let upper_path = upper_root.join(dir_path.strip_prefix("/").unwrap_or(dir_path));
    if upper_path.is_dir() {
        return Ok(());
    }
    if let Some(parent) = dir_path.parent() {
        ensure_parent_dir_upper(graph, layers, upper_root, parent)?;
    }

    // find the lower-layer metadata to clone the mode/owner/times from.
    for idx in layers.top_down() {
        let store = &layers.layers[idx].store;
        if let Ok(st) = store.stat(dir_path, FollowMode::NoFollow) {
            std::fs::create_dir(&upper_path)?;
            std::fs::set_permissions(&upper_path, std::fs::Permissions::from_mode(st.mode & 0o7777))?;
            let _ = nix::unistd::chown(
                &upper_path,
                Some(nix::unistd::Uid::from_raw(st.uid)),
                Some(nix::unistd::Gid::from_raw(st.gid)),
            );
            return Ok(());
        }
    }
    std::fs::create_dir_all(&upper_path)?;
    Ok(())
}

/// Copy user-space extended attributes from `src` to `dst`, skipping the
/// reserved overlay namespaces (spec §4.11).
fn copy_user_xattrs(src: &Path, dst: &Path) -> FsResult<()> {
    let names = match xattr::list(src) {
        Ok(n) => n,
        Err(_) => return Ok(()),
    };
    for name in names {
        let name = name.to_string_lossy().into_owned();
        if xattr_filter::is_reserved(&name) {
            continue;
        }
        if let Ok(Some(value)) = xattr::get(src, &name) {
            let _ = xattr::set(dst, &name, &value);
        }
    }
    Ok(())
}

fn copy_times(src_meta: &std::fs::Metadata, dst: &Path) {
    let atime = nix::sys::time::TimeSpec::new(src_meta.atime(), src_meta.atime_nsec());
    let mtime = nix::sys::time::TimeSpec::new(src_meta.mtime(), src_meta.mtime_nsec());
    let _ = nix::sys::stat::utimensat(
        None,
        dst,
        &atime,
        &mtime,
        nix::sys::stat::UtimensatFlags::NoFollowSymlink,
    );
}

/// Promote `node_id` to the upper layer. No-op if it is already there.
/// Preconditions: an upper layer must be configured.
pub fn copy_up(
    graph: &NodeGraph,
    layers: &LayerStack,
    workdir: &WorkDir,
    key: &Key,
    crypto_cfg: &CryptoConfig,
    can_mknod: &mut bool,
    mode_override: bool,
    node_id: NodeId,
) -> FsResult<()> {
    let upper_idx = layers.upper_index().ok_or(FsError::NoUpperLayer)?;
    let node = graph.get(node_id)?;
    if node.layer == upper_idx {
        return Ok(());
    }

    let upper_store = &layers.layers[upper_idx].store;
    let upper_root = upper_store.root();

    if let Some(parent) = node.path.parent() {
        ensure_parent_dir_upper(graph, layers, upper_root, parent)?;
    }

    let upper_path = upper_store.full_path(&node.path);
    log::debug!("copy_up: promoting {:?} ({:?})", node.path, node.kind);

    match node.kind {
        FileKind::Dir => {
            let lower_store = &layers.layers[node.layer].store;
            let st = lower_store.stat(&node.path, FollowMode::NoFollow)?;
            std::fs::create_dir_all(&upper_path)?;
            std::fs::set_permissions(&upper_path, std::fs::Permissions::from_mode(st.mode & 0o7777))?;
            let _ = nix::unistd::chown(
                &upper_path,
                Some(nix::unistd::Uid::from_raw(st.uid)),
                Some(nix::unistd::Gid::from_raw(st.gid)),
            );
        }
        FileKind::Lnk => {
            let lower_store = &layers.layers[node.layer].store;
            let target = lower_store.readlink(&node.path)?;
            let _ = std::fs::remove_file(&upper_path);
            std::os::unix::fs::symlink(&target, &upper_path)?;
        }
        FileKind::Reg => {
            copy_up_regular_file(layers, workdir, key, crypto_cfg, node.layer, &node.path, &upper_path, can_mknod, mode_override)?;
        }
    }

    let stage_wh = upper_store.full_path(&node.path.parent().unwrap_or(Path::new("/")).join(whiteout::whiteout_name_for(
        node.path.file_name().unwrap_or_default(),
    )));
    let _ = std::fs::remove_file(&stage_wh);

    graph.update(node_id, |n| n.layer = upper_idx)?;
    Ok(())
}

fn copy_up_regular_file(
    layers: &LayerStack,
    workdir: &WorkDir,
    key: &Key,
    crypto_cfg: &CryptoConfig,
    lower_idx: usize,
    rel_path: &Path,
    upper_path: &Path,
    can_mknod: &mut bool,
    mode_override: bool,
) -> FsResult<()> {
    let lower_store = &layers.layers[lower_idx].store;
    let src = lower_store.open(rel_path, libc::O_RDONLY)?;
    let src_meta = src.metadata()?;
    let src_file_type = src_meta.file_type();
    if !src_file_type.is_file() {
        return Err(FsError::InvalidInput);
    }

    let stage_path = workdir.stage_path();
    let staged = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .custom_flags(libc::O_EXCL)
        .open(&stage_path)?;

    let cleanup_on_err = |e: FsError| -> FsError {
        let _ = std::fs::remove_file(&stage_path);
        e
    };

    // The staged file takes on the destination mode (spec §4.5 step 4):
    // the lower file's own mode, unless override-stat is enabled, in which
    // case the physical mode is forced open and the xattr-backed override
    // stat is the real access-control surface.
    let mode = if mode_override { 0o755u32 } else { src_meta.mode() & 0o7777 };
    let root_caller = nix::unistd::geteuid().is_root();
    let owner_mode = if root_caller { mode | 0o200 } else { mode };
    if let Err(e) = std::fs::set_permissions(&stage_path, std::fs::Permissions::from_mode(owner_mode)) {
        return Err(cleanup_on_err(e.into()));
    }
    let _ = nix::unistd::chown(
        &stage_path,
        Some(nix::unistd::Uid::from_raw(src_meta.uid())),
        Some(nix::unistd::Gid::from_raw(src_meta.gid())),
    );

    let len = src_meta.len();
    let block_size = crypto_cfg.block_size as u64;
    let mut offset = 0u64;
    let mut buf = vec![0u8; crypto_cfg.block_size];
    use std::os::unix::fs::FileExt as _;
    while offset < len {
        let n = (len - offset).min(block_size) as usize;
        if let Err(e) = src.read_exact_at(&mut buf[..n], offset) {
            return Err(cleanup_on_err(FsError::from(e)));
        }
        let block_number = offset / block_size;
        let write_result: FsResult<()> = (|| {
            if n == crypto_cfg.block_size {
                let mut cipher = buf.clone();
                crypto::block_encode(key, block_number, &mut cipher)?;
                staged.write_all_at(&cipher, offset)?;
            } else {
                let mut cipher = buf[..n].to_vec();
                crypto::stream_encode(key, block_number, &mut cipher);
                staged.write_all_at(&cipher, offset)?;
            }
            Ok(())
        })();
        if let Err(e) = write_result {
            return Err(cleanup_on_err(e));
        }
        offset += n as u64;
    }
    staged.set_len(len)?;

    copy_times(&src_meta, &stage_path);
    if let Err(e) = copy_user_xattrs(&lower_store.full_path(rel_path), &stage_path) {
        return Err(cleanup_on_err(e));
    }
    let _ = xattr::set(&stage_path, xattr_filter::ORIGIN_XATTR, rel_path.as_os_str().as_encoded_bytes());

    // Stage complete; atomically install at the destination. A collision
    // with a pre-existing file is handled by plain rename (overlayfs's
    // rename-with-whiteout syscall isn't available to ordinary rename(2)
    // on most backing filesystems, so we fall back to remove-then-rename).
    let _ = can_mknod; // capability flag is consulted by whiteout::create_whiteout, not here
    if let Err(e) = std::fs::rename(&stage_path, upper_path) {
        let _ = std::fs::remove_file(&stage_path);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerStack;
    use crate::node::NodeGraph;
    use crate::resolver;

    fn setup() -> (NodeGraph, LayerStack, WorkDir, tempfile::TempDir, tempfile::TempDir) {
        let lower = tempfile::tempdir().unwrap();
        let upper = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(upper.path().join(".work")).unwrap();
        let stack = LayerStack::new(vec![lower.path().into()], Some(upper.path().into()));
        (NodeGraph::new(), stack, workdir, lower, upper)
    }

    #[test]
    fn copy_up_regular_file_matches_lower_content() {
        let (graph, stack, workdir, lower, upper) = setup();
        std::fs::write(lower.path().join("a"), b"hello world").unwrap();
        let id = resolver::lookup(&graph, &stack, crate::ROOT_INODE_ID, std::ffi::OsStr::new("a")).unwrap().unwrap();

        let key = crypto::derive_key("pw");
        let cfg = CryptoConfig::default();
        let mut can_mknod = false;
        copy_up(&graph, &stack, &workdir, &key, &cfg, &mut can_mknod, false, id).unwrap();

        assert!(upper.path().join("a").exists());
        let node = graph.get(id).unwrap();
        assert_eq!(node.layer, stack.upper_index().unwrap());

        let file = std::fs::File::open(upper.path().join("a")).unwrap();
        let file_len = file.metadata().unwrap().len();
        let mut state = crypto::NodeCipherState::default();
        let mut out = vec![0u8; file_len as usize];
        crypto::read_at(&file, &key, &cfg, &mut state, 0, &mut out, file_len).unwrap();
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn copy_up_directory_preserves_mode() {
        let (graph, stack, workdir, lower, upper) = setup();
        std::fs::create_dir(lower.path().join("d")).unwrap();
        std::fs::set_permissions(lower.path().join("d"), std::fs::Permissions::from_mode(0o750)).unwrap();
        let id = resolver::lookup(&graph, &stack, crate::ROOT_INODE_ID, std::ffi::OsStr::new("d")).unwrap().unwrap();

        let key = crypto::derive_key("pw");
        let cfg = CryptoConfig::default();
        let mut can_mknod = false;
        copy_up(&graph, &stack, &workdir, &key, &cfg, &mut can_mknod, false, id).unwrap();
        let meta = std::fs::metadata(upper.path().join("d")).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o750);
    }

    #[test]
    fn copy_up_regular_file_preserves_lower_mode() {
        let (graph, stack, workdir, lower, upper) = setup();
        std::fs::write(lower.path().join("a"), b"secret").unwrap();
        std::fs::set_permissions(lower.path().join("a"), std::fs::Permissions::from_mode(0o600)).unwrap();
        let id = resolver::lookup(&graph, &stack, crate::ROOT_INODE_ID, std::ffi::OsStr::new("a")).unwrap().unwrap();

        let key = crypto::derive_key("pw");
        let cfg = CryptoConfig::default();
        let mut can_mknod = false;
        copy_up(&graph, &stack, &workdir, &key, &cfg, &mut can_mknod, false, id).unwrap();
        let meta = std::fs::metadata(upper.path().join("a")).unwrap();
        assert_eq!(meta.mode() & 0o7777, 0o600);
    }

    #[test]
    fn copy_up_regular_file_forces_mode_when_override_enabled() {
        let (graph, stack, workdir, lower, upper) = setup();
        std::fs::write(lower.path().join("a"), b"secret").unwrap();
        std::fs::set_permissions(lower.path().join("a"), std::fs::Permissions::from_mode(0o600)).unwrap();
        let id = resolver::lookup(&graph, &stack, crate::ROOT_INODE_ID, std::ffi::OsStr::new("a")).unwrap().unwrap();

        let key = crypto::derive_key("pw");
        let cfg = CryptoConfig::default();
        let mut can_mknod = false;
        copy_up(&graph, &stack, &workdir, &key, &cfg, &mut can_mknod, true, id).unwrap();
        let meta = std::fs::metadata(upper.path().join("a")).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o755);
    }

    #[test]
    fn copy_up_is_noop_when_already_upper() {
        let (graph, stack, workdir, _lower, upper) = setup();
        std::fs::write(upper.path().join("a"), b"already here").unwrap();
        let id = resolver::lookup(&graph, &stack, crate::ROOT_INODE_ID, std::ffi::OsStr::new("a")).unwrap().unwrap();
        let key = crypto::derive_key("pw");
        let cfg = CryptoConfig::default();
        let mut can_mknod = false;
        copy_up(&graph, &stack, &workdir, &key, &cfg, &mut can_mknod, false, id).unwrap();
        assert_eq!(std::fs::read(upper.path().join("a")).unwrap(), b"already here");
    }
}
