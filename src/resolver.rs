//! Name resolver (spec §4.2): locates the effective entry for `(parent,
//! name)` across the layer stack, honoring whiteouts and opaque directories.

use std::ffi::OsStr;

use crate::error::{FsError, FsResult};
use crate::layer::{FollowMode, LayerStack};
use crate::node::{new_node, FileKind, Node, NodeGraph, NodeId};
use crate::whiteout;

/// Resolve `name` under `parent`, consulting the children cache first and
/// otherwise walking the layer stack top-down per the tie-break rules in
/// spec §4.2: upper wins over lower; among lowers, the first non-whiteout
/// contributor wins; an opaque directory stops the walk immediately.
pub fn lookup(graph: &NodeGraph, layers: &LayerStack, parent: NodeId, name: &OsStr) -> FsResult<Option<NodeId>> {
    if whiteout::is_reserved_name(name) {
        return Err(FsError::NotFound);
    }
    if name.is_empty() || name == "." {
        return Ok(Some(parent));
    }

    if let Some(id) = graph.lookup_child(parent, name)? {
        return Ok(Some(id));
    }

    let parent_node = graph.get(parent)?;
    if parent_node.kind != FileKind::Dir {
        return Err(FsError::NotADirectory);
    }

    let mut found: Option<Node> = None;

    for idx in layers.top_down() {
        let store = &layers.layers[idx].store;
        let candidate_path = parent_node.path.join(name);

        let stat = match store.stat(&candidate_path, FollowMode::NoFollow) {
            Ok(s) => s,
            Err(FsError::NotFound) => {
                // A sibling `.wh.<name>` on this layer shadows any entry a
                // lower layer might still contribute.
                let wh_path = parent_node.path.join(whiteout::whiteout_name_for(name));
                if store.file_exists(&wh_path)? {
                    let mut node = new_node(name.to_os_string(), candidate_path.clone(), Some(parent), FileKind::Reg, idx, true, 0, 0);
                    node.last_layer = idx;
                    found = Some(node);
                    break;
                }
                if found.is_some() && parent_node.last_layer == idx {
                    break;
                }
                continue;
            }
            Err(e) => return Err(e),
        };

        let is_whiteout_chardev = whiteout::is_whiteout_chardev(stat.mode & libc::S_IFMT, stat.rdev);
        let kind = match stat.mode & libc::S_IFMT {
            libc::S_IFDIR => FileKind::Dir,
            libc::S_IFLNK => FileKind::Lnk,
            _ => FileKind::Reg,
        };

        if is_whiteout_chardev {
            let mut node = new_node(name.to_os_string(), candidate_path, Some(parent), FileKind::Reg, idx, true, 0, 0);
            node.last_layer = idx;
            found = Some(node);
            break;
        }

        match &mut found {
            Some(existing) if existing.kind == FileKind::Dir && kind == FileKind::Dir => {
                // A directory already provisionally resolved at a higher
                // layer keeps descending to merge lower contributions;
                // update its origin identity to the deepest layer seen.
                existing.orig_ino = stat.ino;
                existing.orig_dev = stat.dev;
                existing.last_layer = idx;
            }
            Some(_) => {
                // Non-directory (or kind mismatch): first hit wins, stop.
                break;
            }
            None => {
                let mut node = new_node(name.to_os_string(), candidate_path.clone(), Some(parent), kind, idx, false, stat.ino, stat.dev);
                node.last_layer = idx;
                found = Some(node);
            }
        }

        if kind == FileKind::Dir {
            let full = store.full_path(&candidate_path);
            if whiteout::is_opaque(&full) {
                if let Some(existing) = &mut found {
                    existing.last_layer = idx;
                }
                break;
            }
        } else {
            // Regular file or symlink: first-hit-wins, do not descend further.
            break;
        }

        if parent_node.last_layer == idx {
            break;
        }
    }

    match found {
        Some(node) => {
            let id = graph.insert_child(parent, node)?;
            Ok(Some(id))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerStack;
    use std::ffi::OsStr;

    fn setup() -> (tempfile::TempDir, tempfile::TempDir) {
        let lower = tempfile::tempdir().unwrap();
        let upper = tempfile::tempdir().unwrap();
        (lower, upper)
    }

    #[test]
    fn lookup_finds_lower_only_entry() {
        let (lower, upper) = setup();
        std::fs::write(lower.path().join("a"), b"x").unwrap();
        let stack = LayerStack::new(vec![lower.path().into()], Some(upper.path().into()));
        let graph = NodeGraph::new();
        let id = lookup(&graph, &stack, crate::ROOT_INODE_ID, OsStr::new("a")).unwrap().unwrap();
        assert_eq!(graph.get(id).unwrap().kind, FileKind::Reg);
    }

    #[test]
    fn lookup_missing_returns_none() {
        let (lower, upper) = setup();
        let stack = LayerStack::new(vec![lower.path().into()], Some(upper.path().into()));
        let graph = NodeGraph::new();
        assert!(lookup(&graph, &stack, crate::ROOT_INODE_ID, OsStr::new("missing")).unwrap().is_none());
    }

    #[test]
    fn upper_whiteout_hides_lower_entry() {
        let (lower, upper) = setup();
        std::fs::write(lower.path().join("a"), b"x").unwrap();
        std::fs::write(upper.path().join(".wh.a"), b"").unwrap();
        let stack = LayerStack::new(vec![lower.path().into()], Some(upper.path().into()));
        let graph = NodeGraph::new();
        let id = lookup(&graph, &stack, crate::ROOT_INODE_ID, OsStr::new("a")).unwrap().unwrap();
        assert!(graph.get(id).unwrap().is_whiteout);
    }

    #[test]
    fn upper_entry_wins_over_lower() {
        let (lower, upper) = setup();
        std::fs::write(lower.path().join("a"), b"lower").unwrap();
        std::fs::write(upper.path().join("a"), b"upper").unwrap();
        let stack = LayerStack::new(vec![lower.path().into()], Some(upper.path().into()));
        let graph = NodeGraph::new();
        let id = lookup(&graph, &stack, crate::ROOT_INODE_ID, OsStr::new("a")).unwrap().unwrap();
        assert_eq!(graph.get(id).unwrap().layer, 1);
    }

    #[test]
    fn opaque_directory_stops_the_walk() {
        let (lower, upper) = setup();
        std::fs::create_dir(lower.path().join("d")).unwrap();
        std::fs::write(lower.path().join("d/x"), b"hidden").unwrap();
        std::fs::create_dir(upper.path().join("d")).unwrap();
        crate::whiteout::set_opaque(&upper.path().join("d")).unwrap();
        let stack = LayerStack::new(vec![lower.path().into()], Some(upper.path().into()));
        let graph = NodeGraph::new();
        let id = lookup(&graph, &stack, crate::ROOT_INODE_ID, OsStr::new("d")).unwrap().unwrap();
        let node = graph.get(id).unwrap();
        assert_eq!(node.last_layer, 1);
    }

    #[test]
    fn reserved_name_lookup_is_rejected() {
        let (lower, upper) = setup();
        let stack = LayerStack::new(vec![lower.path().into()], Some(upper.path().into()));
        let graph = NodeGraph::new();
        assert_eq!(lookup(&graph, &stack, crate::ROOT_INODE_ID, OsStr::new(".wh.x")), Err(FsError::NotFound));
    }
}
