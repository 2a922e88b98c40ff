#![forbid(unsafe_code)]
//! In-memory data/metadata engine for toyfs.
//!
//! The crate is organized the way the operations dispatch:
//!
//! - [`super_block`]: super-block lifecycle, statvfs accounting, page and
//!   slab acquisition wrappers that keep the counters honest.
//! - [`itable`]: ino → inode-info hash table.
//! - [`inode`]: inode records, inode-info control blocks, create/free,
//!   `iget`, `setattr`.
//! - [`dir`]: directory entries, lookup, readdir, rename.
//! - [`file`]: the offset-indexed block map — read, write, truncate,
//!   fallocate, seek, `get_block`.
//! - [`clone`]: refcounted copy-on-write cloning between regular files.
//! - [`symlink`]: inline and long symlink targets.
//!
//! Concurrency: three lock domains (pool, inode table, super) plus one
//! mutex per live inode and one `RwLock` per arena page. Lock order is
//! inode → super → pool; user-data copies only ever hold a page lock.

pub mod clone;
pub mod dir;
pub mod file;
pub mod inode;
pub mod itable;
pub mod super_block;
pub mod symlink;

pub use inode::{
    Inode, InodeInfo, InodePayload, NewInodeAttrs, SetAttr, free_inode, iget, new_inode, setattr,
};
pub use super_block::{MountConfig, MountSource, Sbi, StatVfs};
