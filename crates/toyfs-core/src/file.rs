//! File engine: the offset-indexed block map.
//!
//! A regular inode holds a sorted vector of block-map entries keyed by
//! page-aligned file offset; missing entries are holes. Writes
//! materialize blocks on demand and copy-on-write any block whose
//! refcount is above one. Offsets are unsigned end to end, so the
//! negative-offset rejection of the callback ABI is handled by the type.

use crate::inode::{Iblkref, Inode, InodeInfo, RegPayload};
use crate::super_block::Sbi;
use std::sync::Arc;
use toyfs_error::{Result, TfsError};
use toyfs_pool::SlabKind;
use toyfs_types::{
    BlockNumber, IO_MAX_SIZE, ISIZE_MAX, PAGE_SIZE, next_page_off, nbytes_in_range, off_in_page,
    off_to_boff,
};
use tracing::{debug, warn};

// ── Bounds checks ───────────────────────────────────────────────────────────

fn check_io(off: u64, len: u64) -> Result<()> {
    if len == 0 {
        return Err(TfsError::Invalid);
    }
    if off > ISIZE_MAX {
        return Err(TfsError::FileTooBig);
    }
    match off.checked_add(len) {
        Some(end) if end <= ISIZE_MAX => Ok(()),
        _ => Err(TfsError::FileTooBig),
    }
}

fn check_rw(off: u64, len: u64) -> Result<()> {
    if len > IO_MAX_SIZE as u64 {
        warn!(off, len, "I/O larger than the dispatch map window");
        return Err(TfsError::Invalid);
    }
    check_io(off, len)
}

fn require_reg(inode: &Inode) -> Result<&RegPayload> {
    if inode.is_dir() {
        return Err(TfsError::IsDirectory);
    }
    inode.reg().ok_or(TfsError::Invalid)
}

fn find_index(reg: &RegPayload, boff: u64) -> Option<usize> {
    reg.iblkrefs.binary_search_by_key(&boff, |e| e.off).ok()
}

// ── Read ────────────────────────────────────────────────────────────────────

/// Copy out up to `buf.len()` bytes from `off`, zero-filling holes.
/// Returns the byte count, clamped at `i_size`.
pub fn read(sbi: &Sbi, ii: &Arc<InodeInfo>, off: u64, buf: &mut [u8]) -> Result<usize> {
    check_rw(off, buf.len() as u64)?;
    let guard = ii.inode();
    let inode = &*guard;
    let reg = require_reg(inode)?;
    debug!(ino = %inode.ino, off, len = buf.len(), "read");

    let end = (off + buf.len() as u64).min(inode.size);
    let mut cur = off;
    let mut cnt = 0usize;
    while cur < end {
        let nxt = next_page_off(cur);
        let n = nbytes_in_range(cur, nxt, end);
        let dst = &mut buf[cnt..cnt + n];
        if let Some(idx) = find_index(reg, off_to_boff(cur)) {
            let bn = sbi.pool().dblkref_bn(reg.iblkrefs[idx].dblkref);
            let page = sbi.pool().read_page(bn);
            let ip = off_in_page(cur);
            dst.copy_from_slice(&page[ip..ip + n]);
        } else {
            dst.fill(0);
        }
        cnt += n;
        cur = nxt;
    }
    Ok(cnt)
}

// ── Write ───────────────────────────────────────────────────────────────────

/// Find or create the backing block for `off`.
///
/// A shared block (refcount above one) is cloned first so the write never
/// mutates pages observed through another file.
fn require_block(sbi: &Sbi, inode: &mut Inode, off: u64) -> Result<BlockNumber> {
    let boff = off_to_boff(off);
    let reg = inode.reg_mut().ok_or(TfsError::Invalid)?;
    match reg.iblkrefs.binary_search_by_key(&boff, |e| e.off) {
        Ok(idx) => {
            let id = reg.iblkrefs[idx].dblkref;
            if sbi.pool().dblkref_refcnt(id) > 1 {
                let new_id = sbi.new_dblkref()?;
                let new_bn = sbi.pool().dblkref_bn(new_id);
                let old_bn = sbi.pool().dblkref_bn(id);
                sbi.pool().copy_page(new_bn, old_bn);
                sbi.decref_dblkref(id);
                reg.iblkrefs[idx].dblkref = new_id;
                debug!(ino = %inode.ino, boff, %new_bn, "copy-on-write");
                Ok(new_bn)
            } else {
                Ok(sbi.pool().dblkref_bn(id))
            }
        }
        Err(idx) => {
            let id = sbi.new_dblkref()?;
            if let Err(err) = sbi.acquire_slot(SlabKind::Iblkref) {
                sbi.decref_dblkref(id);
                return Err(err);
            }
            reg.iblkrefs.insert(
                idx,
                Iblkref {
                    off: boff,
                    dblkref: id,
                },
            );
            inode.blocks += 1;
            Ok(sbi.pool().dblkref_bn(id))
        }
    }
}

/// Copy `buf` in at `off`, materializing blocks page by page.
///
/// When allocation fails mid-walk the already-written prefix is retained
/// and `i_size` reflects the high watermark before `NoSpace` is returned.
pub fn write(sbi: &Sbi, ii: &Arc<InodeInfo>, off: u64, buf: &[u8]) -> Result<usize> {
    check_rw(off, buf.len() as u64)?;
    let mut guard = ii.inode();
    let inode = &mut *guard;
    require_reg(inode)?;
    debug!(ino = %inode.ino, off, len = buf.len(), "write");

    let from = off;
    let end = off + buf.len() as u64;
    let mut cur = off;
    let mut cnt = 0usize;
    while cur < end {
        let bn = match require_block(sbi, inode, cur) {
            Ok(bn) => bn,
            Err(err) => {
                if cnt > 0 {
                    inode.size = inode.size.max(from + cnt as u64);
                }
                return Err(err);
            }
        };
        let nxt = next_page_off(cur);
        let n = nbytes_in_range(cur, nxt, end);
        {
            let mut page = sbi.pool().write_page(bn);
            let ip = off_in_page(cur);
            page[ip..ip + n].copy_from_slice(&buf[cnt..cnt + n]);
        }
        cnt += n;
        cur = nxt;
    }
    inode.size = inode.size.max(from + cnt as u64);
    Ok(cnt)
}

// ── Truncate ────────────────────────────────────────────────────────────────

/// Drop every block-map entry at or beyond `pos` (rounded up to a page
/// boundary), releasing block references.
pub(crate) fn drop_range(sbi: &Sbi, inode: &mut Inode, pos: u64) {
    let pos = if off_in_page(pos) != 0 {
        next_page_off(pos)
    } else {
        pos
    };
    let reg = inode.reg_mut().expect("caller verified a regular inode");
    let cut = reg.iblkrefs.partition_point(|e| e.off < pos);
    let dropped = reg.iblkrefs.split_off(cut);
    let n = dropped.len() as u64;
    for entry in dropped {
        debug!(ino = %inode.ino, off = entry.off, "drop block");
        sbi.decref_dblkref(entry.dblkref);
        sbi.release_slot(SlabKind::Iblkref);
    }
    assert!(inode.blocks >= n, "block count underflow");
    inode.blocks -= n;
}

/// Truncate with the inode lock already held.
pub(crate) fn truncate_locked(sbi: &Sbi, inode: &mut Inode, size: u64) -> Result<()> {
    if inode.is_dir() {
        return Err(TfsError::IsDirectory);
    }
    if !inode.is_reg() {
        return Err(TfsError::Invalid);
    }
    if size < inode.size {
        drop_range(sbi, inode, size);
    }
    inode.size = size;
    Ok(())
}

/// Set the file size; shrinking releases blocks, growing leaves a hole.
pub fn truncate(sbi: &Sbi, ii: &Arc<InodeInfo>, size: u64) -> Result<()> {
    let mut guard = ii.inode();
    truncate_locked(sbi, &mut guard, size)
}

// ── Fallocate ───────────────────────────────────────────────────────────────

// Not exposed by the `libc` crate; value matches Linux's linux/falloc.h.
const FALLOC_FL_NO_HIDE_STALE: i32 = 0x04;

fn check_falloc_flags(flags: i32) -> Result<()> {
    const REJECTED: i32 = FALLOC_FL_NO_HIDE_STALE
        | libc::FALLOC_FL_COLLAPSE_RANGE
        | libc::FALLOC_FL_INSERT_RANGE
        | libc::FALLOC_FL_UNSHARE_RANGE;
    if flags & REJECTED != 0 {
        return Err(TfsError::NotSupported);
    }
    if flags & libc::FALLOC_FL_PUNCH_HOLE != 0 && flags & libc::FALLOC_FL_KEEP_SIZE == 0 {
        return Err(TfsError::NotSupported);
    }
    Ok(())
}

fn drop_one(sbi: &Sbi, inode: &mut Inode, idx: usize) {
    let reg = inode.reg_mut().expect("caller verified a regular inode");
    let entry = reg.iblkrefs.remove(idx);
    sbi.decref_dblkref(entry.dblkref);
    sbi.release_slot(SlabKind::Iblkref);
    assert!(inode.blocks > 0, "block count underflow");
    inode.blocks -= 1;
}

fn zero_in_place(sbi: &Sbi, inode: &Inode, idx: usize, off: u64, n: usize) {
    let reg = inode.reg().expect("caller verified a regular inode");
    let bn = sbi.pool().dblkref_bn(reg.iblkrefs[idx].dblkref);
    let mut page = sbi.pool().write_page(bn);
    let ip = off_in_page(off);
    page[ip..ip + n].fill(0);
}

fn punch_hole(sbi: &Sbi, inode: &mut Inode, from: u64, nbytes: u64) {
    let end = from + nbytes;
    let mut cur = from;
    while cur < end {
        let nxt = next_page_off(cur);
        let n = nbytes_in_range(cur, nxt, end);
        if let Some(idx) = find_index(inode.reg().expect("regular"), off_to_boff(cur)) {
            if n < PAGE_SIZE {
                zero_in_place(sbi, inode, idx, cur, n);
            } else {
                drop_one(sbi, inode, idx);
            }
        }
        cur = nxt;
    }
}

fn zero_range(sbi: &Sbi, inode: &Inode, from: u64, nbytes: u64) {
    let end = from + nbytes;
    let mut cur = from;
    while cur < end {
        let nxt = next_page_off(cur);
        let n = nbytes_in_range(cur, nxt, end);
        if let Some(idx) = find_index(inode.reg().expect("regular"), off_to_boff(cur)) {
            zero_in_place(sbi, inode, idx, cur, n);
        }
        cur = nxt;
    }
}

fn falloc_range(sbi: &Sbi, inode: &mut Inode, from: u64, nbytes: u64) -> Result<()> {
    let end = from + nbytes;
    let mut cur = from;
    let mut cnt = 0u64;
    while cur < end {
        require_block(sbi, inode, cur)?;
        let nxt = next_page_off(cur);
        cnt += nbytes_in_range(cur, nxt, end) as u64;
        cur = nxt;
    }
    inode.size = inode.size.max(from + cnt);
    Ok(())
}

/// Preallocate, punch, or zero a byte range.
pub fn fallocate(sbi: &Sbi, ii: &Arc<InodeInfo>, off: u64, len: u64, flags: i32) -> Result<()> {
    check_io(off, len)?;
    check_falloc_flags(flags)?;
    let mut guard = ii.inode();
    let inode = &mut *guard;
    require_reg(inode)?;
    debug!(ino = %inode.ino, off, len, flags, "fallocate");

    if flags & libc::FALLOC_FL_PUNCH_HOLE != 0 {
        punch_hole(sbi, inode, off, len);
        Ok(())
    } else if flags & libc::FALLOC_FL_ZERO_RANGE != 0 {
        zero_range(sbi, inode, off, len);
        Ok(())
    } else {
        falloc_range(sbi, inode, off, len)
    }
}

// ── Seek ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    /// `SEEK_DATA`: first offset with a backing page.
    Data,
    /// `SEEK_HOLE`: first offset without one.
    Hole,
}

/// Scan page offsets in `[from, i_size)`. `Data` past the last block and
/// any seek at or past `i_size` report `NoData`; `Hole` falls back to
/// `i_size` (the implicit hole at EOF).
pub fn seek(ii: &Arc<InodeInfo>, from: u64, whence: SeekWhence) -> Result<u64> {
    let guard = ii.inode();
    let inode = &*guard;
    let reg = require_reg(inode)?;
    debug!(ino = %inode.ino, from, ?whence, "seek");

    if from >= inode.size {
        return Err(TfsError::NoData);
    }
    let mut cur = from;
    while cur < inode.size {
        let backed = find_index(reg, off_to_boff(cur)).is_some();
        match whence {
            SeekWhence::Data if backed => return Ok(cur),
            SeekWhence::Hole if !backed => return Ok(cur),
            _ => {}
        }
        cur = next_page_off(cur);
    }
    match whence {
        SeekWhence::Data => Err(TfsError::NoData),
        SeekWhence::Hole => Ok(inode.size),
    }
}

// ── get_block ───────────────────────────────────────────────────────────────

/// Backing block number for a page index, or the null block for holes.
pub fn get_block(sbi: &Sbi, ii: &Arc<InodeInfo>, index: u64) -> Result<BlockNumber> {
    let guard = ii.inode();
    let inode = &*guard;
    if !inode.is_reg() {
        return Err(TfsError::NotSupported);
    }
    let reg = inode.reg().expect("type checked above");

    let Some(off) = index.checked_mul(PAGE_SIZE as u64) else {
        return Ok(BlockNumber::NULL);
    };
    let bn = find_index(reg, off)
        .map_or(BlockNumber::NULL, |idx| {
            sbi.pool().dblkref_bn(reg.iblkrefs[idx].dblkref)
        });
    debug!(ino = %inode.ino, index, %bn, "get_block");
    Ok(bn)
}

// ── Sync ────────────────────────────────────────────────────────────────────

/// Durability hook; nothing to flush for an in-memory arena.
pub fn sync(ii: &Arc<InodeInfo>, off: u64, len: u64) -> Result<()> {
    debug!(ino = %ii.ino(), off, len, "sync");
    Ok(())
}
