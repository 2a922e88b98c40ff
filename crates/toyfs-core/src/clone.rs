//! Refcounted copy-on-write cloning between regular files.
//!
//! Cloning shares data blocks by bumping their reference counts; the
//! write path unshares on demand, so post-clone writes to either file
//! never leak into the other. Sub-range clones must be page-aligned at
//! both ends.

use crate::file::drop_range;
use crate::inode::{Iblkref, Inode, InodeInfo, lock_pair};
use crate::super_block::Sbi;
use std::sync::Arc;
use toyfs_error::{Result, TfsError};
use toyfs_pool::{DblkrefId, SlabKind};
use toyfs_types::{PAGE_SIZE, is_page_aligned};
use tracing::debug;

/// Clone `len` bytes from `src_off` of `src_ii` to `dst_off` of `dst_ii`.
///
/// Both inodes must be regular files. Cloning a file onto itself is a
/// no-op; all-zero arguments clone the entire file.
pub fn clone(
    sbi: &Sbi,
    src_ii: &Arc<InodeInfo>,
    dst_ii: &Arc<InodeInfo>,
    src_off: u64,
    dst_off: u64,
    len: u64,
) -> Result<()> {
    debug!(
        src_ino = %src_ii.ino(),
        dst_ino = %dst_ii.ino(),
        src_off,
        dst_off,
        len,
        "clone"
    );

    if Arc::ptr_eq(src_ii, dst_ii) {
        if !src_ii.inode().is_reg() {
            return Err(TfsError::NotSupported);
        }
        return Ok(());
    }

    let (src_guard, mut dst_guard) = lock_pair(src_ii, dst_ii);
    let src = &*src_guard;
    let dst = &mut *dst_guard;
    if !src.is_reg() || !dst.is_reg() {
        return Err(TfsError::NotSupported);
    }

    if src_off == 0 && dst_off == 0 && len == 0 {
        return clone_entire(sbi, src, dst);
    }

    // Reflink only page-aligned ranges; anything else is unsupported.
    if !is_page_aligned(src_off, 0)
        || !is_page_aligned(src_off, len)
        || !is_page_aligned(dst_off, 0)
        || !is_page_aligned(dst_off, len)
    {
        return Err(TfsError::NotSupported);
    }

    clone_sub_range(sbi, src, dst, src_off, dst_off, len)
}

// ── Entire file ─────────────────────────────────────────────────────────────

fn clone_entire(sbi: &Sbi, src: &Inode, dst: &mut Inode) -> Result<()> {
    drop_range(sbi, dst, 0);

    let src_reg = src.reg().expect("caller verified a regular inode");
    for entry in &src_reg.iblkrefs {
        sbi.acquire_slot(SlabKind::Iblkref)?;
        sbi.pool().incref(entry.dblkref);
        dst.reg_mut()
            .expect("caller verified a regular inode")
            .iblkrefs
            .push(Iblkref {
                off: entry.off,
                dblkref: entry.dblkref,
            });
        dst.blocks += 1;
    }
    dst.size = src.size;
    Ok(())
}

// ── Sub-range ───────────────────────────────────────────────────────────────

/// Point the destination entry at `dst_off` to the source's block,
/// releasing whatever it referenced before.
fn share_block(sbi: &Sbi, dst: &mut Inode, dst_off: u64, src_id: DblkrefId) -> Result<()> {
    let reg = dst.reg_mut().expect("caller verified a regular inode");
    match reg.iblkrefs.binary_search_by_key(&dst_off, |e| e.off) {
        Ok(idx) => {
            let old = reg.iblkrefs[idx].dblkref;
            reg.iblkrefs[idx].dblkref = src_id;
            sbi.pool().incref(src_id);
            sbi.decref_dblkref(old);
        }
        Err(idx) => {
            sbi.acquire_slot(SlabKind::Iblkref)?;
            reg.iblkrefs.insert(
                idx,
                Iblkref {
                    off: dst_off,
                    dblkref: src_id,
                },
            );
            sbi.pool().incref(src_id);
            dst.blocks += 1;
        }
    }
    Ok(())
}

/// The source page is a hole: the destination block at this offset, if
/// any, must read as zeros. A shared block is replaced with a fresh
/// private one (freshly allocated pages are already zeroed); a private
/// block is zeroed in place.
fn zero_block(sbi: &Sbi, dst: &mut Inode, dst_off: u64) -> Result<bool> {
    let reg = dst.reg_mut().expect("caller verified a regular inode");
    let Ok(idx) = reg.iblkrefs.binary_search_by_key(&dst_off, |e| e.off) else {
        return Ok(false);
    };
    let id = reg.iblkrefs[idx].dblkref;
    if sbi.pool().dblkref_refcnt(id) > 1 {
        let new_id = sbi.new_dblkref()?;
        reg.iblkrefs[idx].dblkref = new_id;
        sbi.decref_dblkref(id);
    } else {
        let bn = sbi.pool().dblkref_bn(id);
        sbi.pool().zero_page(bn);
    }
    Ok(true)
}

fn clone_sub_range(
    sbi: &Sbi,
    src: &Inode,
    dst: &mut Inode,
    src_pos: u64,
    dst_pos: u64,
    nbytes: u64,
) -> Result<()> {
    let src_reg = src.reg().expect("caller verified a regular inode");
    let page = PAGE_SIZE as u64;
    let src_end = src_pos + nbytes;

    let mut src_off = src_pos;
    let mut dst_off = dst_pos;
    while src_off < src_end {
        let src_entry = src_reg
            .iblkrefs
            .binary_search_by_key(&src_off, |e| e.off)
            .ok()
            .map(|idx| src_reg.iblkrefs[idx].dblkref);

        let touched = match src_entry {
            Some(src_id) => {
                share_block(sbi, dst, dst_off, src_id)?;
                true
            }
            None => zero_block(sbi, dst, dst_off)?,
        };
        if touched {
            dst.size = dst.size.max(dst_off + page);
        }

        src_off += page;
        dst_off += page;
    }

    dst.size = dst.size.max(dst_pos + nbytes);
    Ok(())
}
