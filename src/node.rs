//! Node graph and inode identity (spec §3, §4.4).
//!
//! The node/parent/child structure is cyclic in the conceptual model (a
//! child's parent pointer is a lookup aid, not an owner). Rather than build
//! that as a pointer graph we keep a flat table keyed by `NodeId`, the way
//! the teacher's `overlay.rs` keeps a flat `icac: RwLock<HashMap<InodeID,
//! Inode>>` instead of raw parent/child references: children point at their
//! parent and at each other only through ids looked up in the table.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::crypto::NodeCipherState;
use crate::error::{FsError, FsResult};
use crate::{rwlock_read, rwlock_write};

pub type NodeId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Reg,
    Dir,
    Lnk,
}

/// "Hidden" state machine for a node deleted from the visible tree while a
/// kernel lookup still references it (spec §9).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HiddenState {
    Active,
    HiddenPendingUnlink,
    HiddenPendingRmdir,
}

#[derive(Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: OsString,
    pub path: PathBuf,
    pub parent: Option<NodeId>,
    pub kind: FileKind,
    /// Layer index (into `LayerStack::layers`) this node currently lives on.
    pub layer: usize,
    /// Deepest layer contributing to this name; lookup stops descending once
    /// this layer has been consulted.
    pub last_layer: usize,
    pub is_whiteout: bool,
    /// `Some` (possibly empty) for directories, `None` otherwise -- the
    /// children-container invariant from spec §3.
    pub children: Option<HashMap<OsString, NodeId>>,
    pub hidden: HiddenState,
    /// Generated staging name in the working directory once hidden.
    pub hidden_name: Option<OsString>,
    pub orig_ino: u64,
    pub orig_dev: u64,
    pub crypto: Arc<Mutex<NodeCipherState>>,
    pub in_readdir: Arc<AtomicUsize>,
    /// Whether `children` has been materialized by the directory merger.
    pub loaded: bool,
}

impl Node {
    fn new_dir_container(kind: FileKind) -> Option<HashMap<OsString, NodeId>> {
        match kind {
            FileKind::Dir => Some(HashMap::new()),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct InodeRecord {
    pub lookups: u64,
    pub mode: u32,
    pub nodes: Vec<NodeId>,
}

pub struct NodeGraph {
    nodes: std::sync::RwLock<HashMap<NodeId, Node>>,
    inodes: std::sync::RwLock<HashMap<(u64, u64), InodeRecord>>,
    next_id: Mutex<NodeId>,
}

impl NodeGraph {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            crate::ROOT_INODE_ID,
            Node {
                id: crate::ROOT_INODE_ID,
                name: OsString::from("/"),
                path: PathBuf::from("/"),
                parent: None,
                kind: FileKind::Dir,
                layer: 0,
                last_layer: 0,
                is_whiteout: false,
                children: Node::new_dir_container(FileKind::Dir),
                hidden: HiddenState::Active,
                hidden_name: None,
                orig_ino: 0,
                orig_dev: 0,
                crypto: Arc::new(Mutex::new(NodeCipherState::default())),
                in_readdir: Arc::new(AtomicUsize::new(0)),
                loaded: false,
            },
        );
        Self {
            nodes: std::sync::RwLock::new(nodes),
            inodes: std::sync::RwLock::new(HashMap::new()),
            next_id: Mutex::new(crate::ROOT_INODE_ID + 1),
        }
    }

    pub fn alloc_id(&self) -> FsResult<NodeId> {
        let mut id = mutex_lock_id(&self.next_id)?;
        let v = *id;
        *id += 1;
        Ok(v)
    }

    pub fn get(&self, id: NodeId) -> FsResult<Node> {
        let lock = rwlock_read!(self.nodes);
        lock.get(&id).cloned().ok_or(FsError::NotFound)
    }

    pub fn update<F: FnOnce(&mut Node)>(&self, id: NodeId, f: F) -> FsResult<()> {
        let mut lock = rwlock_write!(self.nodes);
        let node = lock.get_mut(&id).ok_or(FsError::NotFound)?;
        f(node);
        Ok(())
    }

    /// Register a freshly constructed child node under `parent`.
    /// Returns the id actually registered: if a node for this (ino, dev)
    /// already exists with the same parent/name, collapse to the existing
    /// node instead of creating a duplicate (spec §4.4).
    pub fn insert_child(&self, parent: NodeId, mut node: Node) -> FsResult<NodeId> {
        if node.orig_ino != 0 || node.orig_dev != 0 {
            let key = (node.orig_ino, node.orig_dev);
            let mut inodes = rwlock_write!(self.inodes);
            let nodes = rwlock_read!(self.nodes);
            if let Some(rec) = inodes.get(&key) {
                for &cand in &rec.nodes {
                    if let Some(c) = nodes.get(&cand) {
                        if c.parent == Some(parent) && c.name == node.name {
                            return Ok(cand);
                        }
                    }
                }
            }
            drop(nodes);
            let rec = inodes.entry(key).or_insert_with(InodeRecord::default);
            // the id isn't known until after we insert below; record it after.
            let _ = rec;
        }

        let id = self.alloc_id()?;
        node.id = id;
        let name = node.name.clone();
        {
            let mut nodes = rwlock_write!(self.nodes);
            if let Some(p) = nodes.get_mut(&parent) {
                if let Some(children) = p.children.as_mut() {
                    if children.contains_key(&name) {
                        return Err(FsError::AlreadyExists);
                    }
                    children.insert(name, id);
                } else {
                    return Err(FsError::NotADirectory);
                }
            } else {
                return Err(FsError::NotFound);
            }
            nodes.insert(id, node.clone());
        }
        if node.orig_ino != 0 || node.orig_dev != 0 {
            let mut inodes = rwlock_write!(self.inodes);
            let rec = inodes.entry((node.orig_ino, node.orig_dev)).or_insert_with(InodeRecord::default);
            rec.nodes.push(id);
        }
        Ok(id)
    }

    pub fn lookup_child(&self, parent: NodeId, name: &std::ffi::OsStr) -> FsResult<Option<NodeId>> {
        let nodes = rwlock_read!(self.nodes);
        let p = nodes.get(&parent).ok_or(FsError::NotFound)?;
        let children = p.children.as_ref().ok_or(FsError::NotADirectory)?;
        Ok(children.get(name).copied())
    }

    pub fn mark_loaded(&self, id: NodeId) -> FsResult<()> {
        self.update(id, |n| n.loaded = true)
    }

    /// Recursive path fixup after a rename (spec invariant 1): `n.path ==
    /// n.parent.path + "/" + n.name` must hold for every descendant too.
    pub fn reparent(&self, id: NodeId, new_parent: NodeId, new_name: std::ffi::OsString) -> FsResult<()> {
        let new_parent_path = self.get(new_parent)?.path;
        let new_path = new_parent_path.join(&new_name);
        self.update(id, |n| {
            n.parent = Some(new_parent);
            n.name = new_name;
            n.path = new_path.clone();
        })?;
        self.fixup_descendant_paths(id, &new_path)
    }

    fn fixup_descendant_paths(&self, id: NodeId, base: &std::path::Path) -> FsResult<()> {
        let children: Vec<(OsString, NodeId)> = {
            let nodes = rwlock_read!(self.nodes);
            match nodes.get(&id).and_then(|n| n.children.as_ref()) {
                Some(c) => c.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                None => return Ok(()),
            }
        };
        for (name, child) in children {
            let child_path = base.join(&name);
            self.update(child, |n| n.path = child_path.clone())?;
            self.fixup_descendant_paths(child, &child_path)?;
        }
        Ok(())
    }

    /// Remove a node from its parent's children map only, without touching
    /// the node/inode tables. Used when a name is unlinked/renamed away but
    /// a kernel lookup may still reference the node by id (spec §3/§9
    /// "hidden" state machine); full teardown happens later via `detach`.
    pub fn remove_from_parent(&self, id: NodeId) -> FsResult<()> {
        let node = self.get(id)?;
        if let Some(parent) = node.parent {
            self.update(parent, |p| {
                if let Some(children) = p.children.as_mut() {
                    children.remove(&node.name);
                }
            })?;
        }
        Ok(())
    }

    /// Detach a node from its parent's children container. Freeing a
    /// directory detaches its children first.
    pub fn detach(&self, id: NodeId) -> FsResult<()> {
        let (parent, name, is_dir) = {
            let node = self.get(id)?;
            (node.parent, node.name.clone(), node.children.is_some())
        };
        if is_dir {
            let child_ids: Vec<NodeId> = {
                let nodes = rwlock_read!(self.nodes);
                nodes.get(&id).and_then(|n| n.children.as_ref()).map(|c| c.values().copied().collect()).unwrap_or_default()
            };
            for c in child_ids {
                self.detach(c)?;
            }
        }
        if let Some(parent) = parent {
            self.update(parent, |p| {
                if let Some(children) = p.children.as_mut() {
                    children.remove(&name);
                }
            })?;
        }
        let mut nodes = rwlock_write!(self.nodes);
        nodes.remove(&id);
        Ok(())
    }

    pub fn dec_lookup(&self, id: NodeId, n: u64) -> FsResult<()> {
        let key = {
            let node = self.get(id)?;
            (node.orig_ino, node.orig_dev)
        };
        let mut inodes = rwlock_write!(self.inodes);
        if let Some(rec) = inodes.get_mut(&key) {
            rec.lookups = rec.lookups.saturating_sub(n);
            if rec.lookups == 0 {
                rec.nodes.retain(|&x| x != id);
                if rec.nodes.is_empty() {
                    inodes.remove(&key);
                }
            }
        }
        Ok(())
    }

    pub fn inc_lookup(&self, id: NodeId, n: u64) -> FsResult<()> {
        let key = {
            let node = self.get(id)?;
            (node.orig_ino, node.orig_dev)
        };
        let mut inodes = rwlock_write!(self.inodes);
        let rec = inodes.entry(key).or_insert_with(InodeRecord::default);
        rec.lookups += n;
        Ok(())
    }

    pub fn stats(&self) -> (usize, usize) {
        let nodes = self.nodes.read().map(|l| l.len()).unwrap_or(0);
        let inodes = self.inodes.read().map(|l| l.len()).unwrap_or(0);
        (nodes, inodes)
    }
}

fn mutex_lock_id(m: &Mutex<NodeId>) -> FsResult<std::sync::MutexGuard<'_, NodeId>> {
    m.lock().map_err(|_| FsError::MutexError)
}

pub fn new_node(
    name: std::ffi::OsString,
    path: PathBuf,
    parent: Option<NodeId>,
    kind: FileKind,
    layer: usize,
    is_whiteout: bool,
    orig_ino: u64,
    orig_dev: u64,
) -> Node {
    Node {
        id: 0,
        name,
        path,
        parent,
        kind,
        layer,
        last_layer: layer,
        is_whiteout,
        children: Node::new_dir_container(kind),
        hidden: HiddenState::Active,
        hidden_name: None,
        orig_ino,
        orig_dev,
        crypto: Arc::new(Mutex::new(NodeCipherState::default())),
        in_readdir: Arc::new(AtomicUsize::new(0)),
        loaded: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::{OsStr, OsString};

    #[test]
    fn root_node_exists() {
        let g = NodeGraph::new();
        let root = g.get(crate::ROOT_INODE_ID).unwrap();
        assert_eq!(root.kind, FileKind::Dir);
        assert!(root.children.is_some());
    }

    #[test]
    fn insert_and_lookup_child() {
        let g = NodeGraph::new();
        let n = new_node(OsString::from("a"), PathBuf::from("/a"), Some(crate::ROOT_INODE_ID), FileKind::Reg, 0, false, 42, 1);
        let id = g.insert_child(crate::ROOT_INODE_ID, n).unwrap();
        assert_eq!(g.lookup_child(crate::ROOT_INODE_ID, std::ffi::OsStr::new("a")).unwrap(), Some(id));
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let g = NodeGraph::new();
        let n1 = new_node(OsString::from("a"), PathBuf::from("/a"), Some(crate::ROOT_INODE_ID), FileKind::Reg, 0, false, 1, 1);
        g.insert_child(crate::ROOT_INODE_ID, n1).unwrap();
        let n2 = new_node(OsString::from("a"), PathBuf::from("/a"), Some(crate::ROOT_INODE_ID), FileKind::Reg, 0, false, 2, 1);
        assert_eq!(g.insert_child(crate::ROOT_INODE_ID, n2), Err(FsError::AlreadyExists));
    }

    #[test]
    fn rename_fixes_up_path_recursively() {
        let g = NodeGraph::new();
        let dir = new_node(OsString::from("d"), PathBuf::from("/d"), Some(crate::ROOT_INODE_ID), FileKind::Dir, 0, false, 1, 1);
        let dir_id = g.insert_child(crate::ROOT_INODE_ID, dir).unwrap();
        let child = new_node(OsString::from("c"), PathBuf::from("/d/c"), Some(dir_id), FileKind::Reg, 0, false, 2, 1);
        let child_id = g.insert_child(dir_id, child).unwrap();

        let dir2 = new_node(OsString::from("d2"), PathBuf::from("/d2"), Some(crate::ROOT_INODE_ID), FileKind::Dir, 0, false, 3, 1);
        let dir2_id = g.insert_child(crate::ROOT_INODE_ID, dir2).unwrap();

        g.reparent(dir_id, dir2_id, OsString::from("moved")).unwrap();
        assert_eq!(g.get(dir_id).unwrap().path, PathBuf::from("/d2/moved"));
        assert_eq!(g.get(child_id).unwrap().path, PathBuf::from("/d2/moved/c"));
    }

    #[test]
    fn inode_record_freed_when_empty() {
        let g = NodeGraph::new();
        let n = new_node(OsString::from("a"), PathBuf::from("/a"), Some(crate::ROOT_INODE_ID), FileKind::Reg, 0, false, 7, 1);
        let id = g.insert_child(crate::ROOT_INODE_ID, n).unwrap();
        g.inc_lookup(id, 1).unwrap();
        g.dec_lookup(id, 1).unwrap();
        let (_, inode_count) = g.stats();
        assert_eq!(inode_count, 0);
    }

    #[test]
    fn remove_from_parent_unlinks_name_but_keeps_node() {
        let g = NodeGraph::new();
        let n = new_node(OsString::from("a"), PathBuf::from("/a"), Some(crate::ROOT_INODE_ID), FileKind::Reg, 0, false, 9, 1);
        let id = g.insert_child(crate::ROOT_INODE_ID, n).unwrap();
        g.remove_from_parent(id).unwrap();
        assert_eq!(g.lookup_child(crate::ROOT_INODE_ID, OsStr::new("a")).unwrap(), None);
        assert!(g.get(id).is_ok());
    }
}
