//! Directory merger (spec §4.3): builds the merged listing for a directory
//! node by walking layers top-down and folding entries into the node's
//! children container.

use std::collections::HashMap;
use std::ffi::OsString;

use crate::config::HideList;
use crate::error::{FsError, FsResult};
use crate::layer::{FollowMode, LayerStack};
use crate::node::{new_node, FileKind, NodeGraph, NodeId};
use crate::whiteout;

/// One logical entry seen while folding layers together, before being
/// turned into a graph node.
struct Seen {
    kind: FileKind,
    is_whiteout: bool,
    layer: usize,
    ino: u64,
    dev: u64,
}

/// Populate `node`'s children by merging every layer's directory listing,
/// honoring whiteouts, opaque early-stop, and the hide-list (lower layers
/// only). Idempotent: re-running on an already-loaded node is a no-op.
pub fn load_dir(graph: &NodeGraph, layers: &LayerStack, hide_list: &HideList, node_id: NodeId) -> FsResult<()> {
    let node = graph.get(node_id)?;
    if node.kind != FileKind::Dir {
        return Err(FsError::NotADirectory);
    }
    if node.loaded {
        return Ok(());
    }

    let mut merged: HashMap<OsString, Seen> = HashMap::new();

    for idx in layers.top_down() {
        let layer = &layers.layers[idx];
        let full = layer.store.full_path(&node.path);
        if !full.is_dir() {
            if idx == node.last_layer {
                break;
            }
            continue;
        }

        let entries = match layer.store.readdir(&node.path) {
            Ok(e) => e,
            Err(FsError::NotFound) => Vec::new(),
            Err(e) => return Err(e),
        };

        for entry in &entries {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            if entry.name == whiteout::OPAQUE_SENTINEL {
                continue;
            }
            let is_chardev_whiteout = whiteout::is_whiteout_chardev(entry.file_type, {
                let p = node.path.join(&entry.name);
                layer.store.stat(&p, FollowMode::NoFollow).map(|s| s.rdev).unwrap_or(0)
            });

            let (real_name, is_whiteout) = match whiteout::strip_whiteout_prefix(&entry.name) {
                Some(stripped) => (stripped, true),
                None => (entry.name.clone(), is_chardev_whiteout),
            };

            if !layer.is_upper && hide_list.is_hidden(&node.path.join(&real_name).to_string_lossy()) {
                continue;
            }

            let already = merged.get(&real_name);
            if let Some(prev) = already {
                // An entry already present from a higher layer is not
                // overwritten unless the higher entry was a whiteout and
                // this contributing layer is the upper layer.
                if !(prev.is_whiteout && layer.is_upper) {
                    continue;
                }
            }

            let kind = if is_whiteout {
                FileKind::Reg
            } else {
                match entry.file_type & libc::S_IFMT {
                    libc::S_IFDIR => FileKind::Dir,
                    libc::S_IFLNK => FileKind::Lnk,
                    _ => FileKind::Reg,
                }
            };

            let (ino, dev) = if is_whiteout {
                (0, 0)
            } else {
                let p = node.path.join(&real_name);
                match layer.store.stat(&p, FollowMode::NoFollow) {
                    Ok(s) => (s.ino, s.dev),
                    Err(_) => (0, 0),
                }
            };

            merged.insert(real_name, Seen { kind, is_whiteout, layer: idx, ino, dev });
        }

        // Opaque directories (or a parent-side whiteout for this name on an
        // outer layer) stop the merge from descending into lower layers.
        if whiteout::is_opaque(&full) {
            break;
        }
        if idx == node.last_layer {
            break;
        }
    }

    for (name, seen) in merged {
        if graph.lookup_child(node_id, &name)?.is_some() {
            continue;
        }
        let path = node.path.join(&name);
        let mut child = new_node(name, path, Some(node_id), seen.kind, seen.layer, seen.is_whiteout, seen.ino, seen.dev);
        child.last_layer = seen.layer;
        graph.insert_child(node_id, child)?;
    }

    graph.mark_loaded(node_id)?;
    Ok(())
}

/// Produce the merged listing (including synthesized `.`/`..`) for a
/// directory that has already been loaded via `load_dir`.
pub fn readdir(graph: &NodeGraph, node_id: NodeId) -> FsResult<Vec<(OsString, NodeId)>> {
    let node = graph.get(node_id)?;
    let children = node.children.ok_or(FsError::NotADirectory)?;
    let mut out = Vec::with_capacity(children.len() + 2);
    out.push((OsString::from("."), node_id));
    out.push((OsString::from(".."), node.parent.unwrap_or(node_id)));
    for (name, id) in children {
        let child = graph.get(id)?;
        if child.is_whiteout {
            continue;
        }
        out.push((name, id));
    }
    Ok(out)
}

/// Whether mutating `parent` should schedule a kernel cache invalidation:
/// true while any reader has an outstanding `readdir` in flight (spec §4.3,
/// §5).
pub fn needs_invalidation(node_in_readdir: &std::sync::atomic::AtomicUsize) -> bool {
    node_in_readdir.load(std::sync::atomic::Ordering::SeqCst) > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerStack;

    fn graph_with_stack() -> (NodeGraph, LayerStack, tempfile::TempDir, tempfile::TempDir) {
        let lower = tempfile::tempdir().unwrap();
        let upper = tempfile::tempdir().unwrap();
        let stack = LayerStack::new(vec![lower.path().into()], Some(upper.path().into()));
        (NodeGraph::new(), stack, lower, upper)
    }

    #[test]
    fn merges_entries_across_layers() {
        let (graph, stack, lower, upper) = graph_with_stack();
        std::fs::write(lower.path().join("a"), b"1").unwrap();
        std::fs::write(upper.path().join("b"), b"2").unwrap();
        let hl = HideList::default();
        load_dir(&graph, &stack, &hl, crate::ROOT_INODE_ID).unwrap();
        let listing = readdir(&graph, crate::ROOT_INODE_ID).unwrap();
        let names: Vec<_> = listing.iter().map(|(n, _)| n.clone()).collect();
        assert!(names.contains(&OsString::from("a")));
        assert!(names.contains(&OsString::from("b")));
    }

    #[test]
    fn whiteout_hides_lower_entry_from_listing() {
        let (graph, stack, lower, upper) = graph_with_stack();
        std::fs::write(lower.path().join("a"), b"1").unwrap();
        std::fs::write(upper.path().join(".wh.a"), b"").unwrap();
        let hl = HideList::default();
        load_dir(&graph, &stack, &hl, crate::ROOT_INODE_ID).unwrap();
        let listing = readdir(&graph, crate::ROOT_INODE_ID).unwrap();
        assert!(!listing.iter().any(|(n, _)| n == "a"));
    }

    #[test]
    fn opaque_directory_is_empty_when_upper_shadows_lower() {
        let (graph, stack, lower, upper) = graph_with_stack();
        std::fs::create_dir(lower.path().join("d")).unwrap();
        std::fs::write(lower.path().join("d/x"), b"1").unwrap();
        std::fs::create_dir(upper.path().join("d")).unwrap();
        whiteout::set_opaque(&upper.path().join("d")).unwrap();
        let hl = HideList::default();
        load_dir(&graph, &stack, &hl, crate::ROOT_INODE_ID).unwrap();
        let listing = readdir(&graph, crate::ROOT_INODE_ID).unwrap();
        let d_id = listing.iter().find(|(n, _)| n == "d").unwrap().1;
        load_dir(&graph, &stack, &hl, d_id).unwrap();
        let inner = readdir(&graph, d_id).unwrap();
        // only "." and ".." -- the lower "x" must not surface.
        assert_eq!(inner.len(), 2);
    }

    #[test]
    fn hide_list_filters_lower_layer_entries() {
        let (graph, stack, lower, _upper) = graph_with_stack();
        std::fs::write(lower.path().join("secret"), b"1").unwrap();
        let hl = HideList::parse("blacklist /secret", None);
        load_dir(&graph, &stack, &hl, crate::ROOT_INODE_ID).unwrap();
        let listing = readdir(&graph, crate::ROOT_INODE_ID).unwrap();
        assert!(!listing.iter().any(|(n, _)| n == "secret"));
    }
}
