//! ext0: a small block-group filesystem with one inode per group.
//!
//! The crate holds the on-disk format (superblock, group descriptors, inodes, directory
//! blocks), the allocation and address translation engine, and the image builder. Talking to
//! a kernel is left to the `ext0_mount` binary.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod bitmap;
pub mod check;
pub mod descriptor;
pub mod device;
pub mod dir;
pub mod error;
pub mod inode;
pub mod layout;
pub mod mkfs;
pub mod node;
pub mod superblock;
pub mod translate;
pub mod types;
pub mod volume;

pub use error::{Ext0Error, Result};
pub use node::{DirNode, FileNode, Node, SetAttr, SpecialNode, SymlinkNode};
pub use volume::{StatFs, Volume};

// A panic while holding one of these leaves plain data behind, so poisoning is ignored.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
