pub mod error;
pub use error::*;

pub mod idmap;
pub mod xattr_filter;
pub mod whiteout;
pub mod layer;
pub mod node;
pub mod resolver;
pub mod dirmerge;
pub mod copyup;
pub mod mutate;
pub mod crypto;
pub mod access;
pub mod config;
pub mod workdir;
pub mod overlay;

pub use log::{debug, info, warn};

/// Root inode number handed to the kernel. fuser reserves 1 for it.
pub const ROOT_INODE_ID: u64 = 1;

#[macro_export]
macro_rules! mutex_lock {
    ($mu: expr) => {
        $mu.lock().map_err(|_| $crate::FsError::MutexError)?
    };
}

#[macro_export]
macro_rules! rwlock_read {
    ($mu: expr) => {
        $mu.read().map_err(|_| $crate::FsError::RwLockError)?
    };
}

#[macro_export]
macro_rules! rwlock_write {
    ($mu: expr) => {
        $mu.write().map_err(|_| $crate::FsError::RwLockError)?
    };
}
