//! Symlink target storage.
//!
//! Short targets live inline in the inode record; anything longer owns a
//! full page. `i_size` is the target length in both cases.

use crate::inode::{Inode, InodeInfo, InodePayload, SymlinkTarget};
use crate::super_block::Sbi;
use std::sync::Arc;
use toyfs_error::{Result, TfsError};
use tracing::debug;

/// Read back a symlink's target bytes.
pub fn get_symlink(sbi: &Sbi, ii: &Arc<InodeInfo>) -> Result<Vec<u8>> {
    let inode = ii.inode();
    debug!(ino = %inode.ino, "get_symlink");

    match &inode.payload {
        InodePayload::Symlink(SymlinkTarget::Inline(target)) => Ok(target.clone()),
        InodePayload::Symlink(SymlinkTarget::Long(bn)) => {
            let len = inode.size as usize;
            let page = sbi.pool().read_page(*bn);
            Ok(page[..len].to_vec())
        }
        _ => Err(TfsError::Invalid),
    }
}

/// Drop a symlink's payload, returning the long page to the arena.
pub(crate) fn release_symlink(sbi: &Sbi, inode: &mut Inode) {
    if let InodePayload::Symlink(SymlinkTarget::Long(bn)) = inode.payload {
        sbi.free_page(bn);
        inode.payload = InodePayload::Symlink(SymlinkTarget::Inline(Vec::new()));
    }
    inode.size = 0;
}
