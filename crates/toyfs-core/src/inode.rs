//! Inode records and inode-info control blocks.
//!
//! An `Inode` is the fixed-size record allocated from the pool's inode
//! slab; its payload is discriminated by the file type bits of the mode.
//! An `InodeInfo` is the heap control block binding a live inode to the
//! super-block: the inode table hands out `Arc<InodeInfo>` handles, and
//! every access revalidates the `imagic` sentinel.

use crate::file;
use crate::super_block::Sbi;
use crate::symlink;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use toyfs_error::{Result, TfsError};
use toyfs_pool::{DblkrefId, SlabKind};
use toyfs_types::{
    BlockNumber, InodeNumber, PAGE_SIZE, SYMLINK_INLINE_MAX, dtype_of, is_dir, is_fifo, is_lnk,
    is_reg,
};
use tracing::debug;

/// Sentinel stamped into every inode-info; checked on each access.
pub const IMAGIC: u32 = 0x11E_11F5;

// ── Payloads ────────────────────────────────────────────────────────────────

/// One directory entry. Offsets are strictly monotonic within a directory
/// and never reused; 0 and 1 are reserved for "." and "..".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub off: u64,
    pub ino: InodeNumber,
    pub dtype: u8,
    pub name: Vec<u8>,
}

/// One block-map entry: a page-aligned file offset backed by a refcounted
/// data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iblkref {
    pub off: u64,
    pub dblkref: DblkrefId,
}

#[derive(Debug, Default)]
pub struct DirPayload {
    /// Children ordered by insertion; offsets are monotonic, so this is
    /// also ascending `off` order.
    pub children: Vec<Dirent>,
    /// Next directory-offset counter. Starts at 2; "." and ".." occupy
    /// 0 and 1 and are never materialized.
    pub off_max: u64,
}

impl DirPayload {
    #[must_use]
    pub fn ndentry(&self) -> usize {
        self.children.len()
    }
}

#[derive(Debug, Default)]
pub struct RegPayload {
    /// Sorted strictly ascending by page-aligned offset.
    pub iblkrefs: Vec<Iblkref>,
    pub first_parent: InodeNumber,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymlinkTarget {
    /// Short target stored inline in the inode record.
    Inline(Vec<u8>),
    /// Long target stored in one owned page; `i_size` is the length.
    Long(BlockNumber),
}

#[derive(Debug)]
pub enum InodePayload {
    Dir(DirPayload),
    Reg(RegPayload),
    Symlink(SymlinkTarget),
    /// FIFOs and other special files; `rdev` carries the device.
    Special,
}

// ── Inode record ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Inode {
    pub ino: InodeNumber,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub generation: u64,
    pub rdev: u64,
    pub parent_ino: InodeNumber,
    pub payload: InodePayload,
}

impl Inode {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        is_dir(self.mode)
    }

    #[must_use]
    pub fn is_reg(&self) -> bool {
        is_reg(self.mode)
    }

    #[must_use]
    pub fn is_lnk(&self) -> bool {
        is_lnk(self.mode)
    }

    pub fn dir(&self) -> Option<&DirPayload> {
        match &self.payload {
            InodePayload::Dir(d) => Some(d),
            _ => None,
        }
    }

    pub fn dir_mut(&mut self) -> Option<&mut DirPayload> {
        match &mut self.payload {
            InodePayload::Dir(d) => Some(d),
            _ => None,
        }
    }

    pub fn reg(&self) -> Option<&RegPayload> {
        match &self.payload {
            InodePayload::Reg(r) => Some(r),
            _ => None,
        }
    }

    pub fn reg_mut(&mut self) -> Option<&mut RegPayload> {
        match &mut self.payload {
            InodePayload::Reg(r) => Some(r),
            _ => None,
        }
    }
}

// ── Inode-info ──────────────────────────────────────────────────────────────

/// Heap control block for one live inode.
pub struct InodeInfo {
    imagic: u32,
    ino: AtomicU64,
    inode: Mutex<Option<Inode>>,
}

impl InodeInfo {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            imagic: IMAGIC,
            ino: AtomicU64::new(InodeNumber::NULL.0),
            inode: Mutex::new(None),
        })
    }

    fn assert_magic(&self) {
        assert_eq!(self.imagic, IMAGIC, "inode-info magic corrupted");
    }

    /// The bound inode number. Panics on an unbound handle.
    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.assert_magic();
        let ino = self.ino.load(Ordering::Acquire);
        assert_ne!(ino, InodeNumber::NULL.0, "inode-info not bound");
        InodeNumber(ino)
    }

    /// Whether `new_inode`/`iget` has bound an inode to this handle.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.assert_magic();
        self.inode.lock().is_some()
    }

    /// Lock and return the bound inode. Panics on an unbound handle.
    pub fn inode(&self) -> MappedMutexGuard<'_, Inode> {
        self.assert_magic();
        MutexGuard::map(self.inode.lock(), |slot| {
            slot.as_mut().expect("inode-info not bound")
        })
    }

    pub(crate) fn bind(&self, inode: Inode) {
        self.assert_magic();
        let mut slot = self.inode.lock();
        assert!(slot.is_none(), "inode-info already bound");
        self.ino.store(inode.ino.0, Ordering::Release);
        *slot = Some(inode);
    }

    pub(crate) fn unbind(&self) {
        self.assert_magic();
        let mut slot = self.inode.lock();
        assert!(slot.is_some(), "unbinding an unbound inode-info");
        *slot = None;
    }
}

impl std::fmt::Debug for InodeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeInfo")
            .field("ino", &self.ino.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Lock two distinct inodes in a stable (ino) order, returning the guards
/// in argument order.
pub(crate) fn lock_pair<'a>(
    a: &'a InodeInfo,
    b: &'a InodeInfo,
) -> (MappedMutexGuard<'a, Inode>, MappedMutexGuard<'a, Inode>) {
    assert!(!std::ptr::eq(a, b), "pair-locking an inode with itself");
    if a.ino() <= b.ino() {
        let ga = a.inode();
        let gb = b.inode();
        (ga, gb)
    } else {
        let gb = b.inode();
        let ga = a.inode();
        (ga, gb)
    }
}

// ── Standard-VFS link-count helpers ─────────────────────────────────────────

/// A fresh directory points back at its parent and starts with one link.
pub(crate) fn std_new_dir(parent_ino: InodeNumber, child: &mut Inode) {
    child.parent_ino = parent_ino;
    child.nlink = 1;
}

pub(crate) fn std_add_dentry(dir: &mut Inode, child: &mut Inode) {
    child.nlink += 1;
    if child.is_dir() {
        dir.nlink += 1;
    }
}

pub(crate) fn std_remove_dentry(dir: &mut Inode, child: &mut Inode) {
    if child.is_dir() {
        dir.nlink -= 1;
    }
    child.nlink -= 1;
}

// ── Create ──────────────────────────────────────────────────────────────────

/// Attributes for a new inode, as delivered by the shim.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewInodeAttrs<'a> {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    /// Creation timestamp, nanoseconds since the epoch.
    pub time: u64,
    /// Symlink target; required when mode says symlink.
    pub symlink: Option<&'a [u8]>,
    /// `O_TMPFILE`: the inode starts with one link and no dentry.
    pub tmpfile: bool,
}

/// Create a new inode under `dir_ii` and bind it to `ii`.
///
/// Only directories, regular files, symlinks, and FIFOs are supported.
pub fn new_inode(
    sbi: &Sbi,
    ii: &Arc<InodeInfo>,
    dir_ii: &Arc<InodeInfo>,
    attrs: &NewInodeAttrs<'_>,
) -> Result<InodeNumber> {
    let mode = attrs.mode;
    if !(is_dir(mode) || is_reg(mode) || is_lnk(mode) || is_fifo(mode)) {
        return Err(TfsError::NotSupported);
    }

    let symlink = if is_lnk(mode) {
        let target = attrs.symlink.ok_or(TfsError::Invalid)?;
        if target.len() >= PAGE_SIZE {
            return Err(TfsError::Invalid);
        }
        Some(target)
    } else {
        None
    };

    sbi.acquire_slot(SlabKind::Inode)?;
    let ino = sbi.next_ino();
    let dir_ino = dir_ii.ino();

    let mut inode = Inode {
        ino,
        mode,
        nlink: 0,
        uid: attrs.uid,
        gid: attrs.gid,
        size: 0,
        blocks: 0,
        atime: attrs.time,
        mtime: attrs.time,
        ctime: attrs.time,
        generation: 0,
        rdev: 0,
        parent_ino: InodeNumber::NULL,
        payload: InodePayload::Special,
    };

    if is_dir(mode) {
        debug!(%ino, "new_inode(dir)");
        inode.payload = InodePayload::Dir(DirPayload {
            children: Vec::new(),
            off_max: 2,
        });
        inode.size = PAGE_SIZE as u64;
        std_new_dir(dir_ino, &mut inode);
    } else if is_reg(mode) {
        debug!(%ino, "new_inode(reg)");
        inode.payload = InodePayload::Reg(RegPayload {
            iblkrefs: Vec::new(),
            first_parent: dir_ino,
        });
        if attrs.tmpfile {
            inode.nlink = 1;
        }
    } else if let Some(target) = symlink {
        debug!(%ino, len = target.len(), "new_inode(symlink)");
        inode.size = target.len() as u64;
        if target.len() > SYMLINK_INLINE_MAX {
            let bn = match sbi.alloc_page() {
                Ok(bn) => bn,
                Err(err) => {
                    sbi.release_slot(SlabKind::Inode);
                    return Err(err);
                }
            };
            sbi.pool().write_page(bn)[..target.len()].copy_from_slice(target);
            inode.payload = InodePayload::Symlink(SymlinkTarget::Long(bn));
        } else {
            inode.payload = InodePayload::Symlink(SymlinkTarget::Inline(target.to_vec()));
        }
    } else {
        debug!(%ino, mode, "new_inode(special)");
        inode.rdev = attrs.rdev;
    }

    ii.bind(inode);
    sbi.itable().insert(ii.clone());
    Ok(ino)
}

// ── Free ────────────────────────────────────────────────────────────────────

/// Drop an inode's payload and remove it from the inode table.
///
/// Directories refuse while they still have children.
pub fn free_inode(sbi: &Sbi, ii: &Arc<InodeInfo>) -> Result<()> {
    {
        let mut guard = ii.inode();
        let inode: &mut Inode = &mut guard;
        debug!(ino = %inode.ino, mode = inode.mode, nlink = inode.nlink, size = inode.size,
               "free_inode");

        if inode.is_dir() {
            if inode.dir().map_or(0, DirPayload::ndentry) > 0 {
                return Err(TfsError::NotEmpty);
            }
            inode.parent_ino = InodeNumber::NULL;
        } else if inode.is_lnk() {
            symlink::release_symlink(sbi, inode);
        } else if inode.is_reg() {
            file::truncate_locked(sbi, inode, 0)?;
        } else {
            inode.rdev = 0;
        }
    }

    ii.unbind();
    sbi.itable().remove(ii);
    sbi.release_slot(SlabKind::Inode);
    Ok(())
}

// ── Lookup by number ────────────────────────────────────────────────────────

/// Attach the live inode for `ino`.
pub fn iget(sbi: &Sbi, ino: InodeNumber) -> Result<Arc<InodeInfo>> {
    sbi.itable()
        .find(ino)
        .ok_or_else(|| TfsError::NotFound(format!("inode {ino}")))
}

// ── Setattr ─────────────────────────────────────────────────────────────────

/// New attribute values; which ones apply is controlled by the `STATX_*`
/// enable bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub size: u64,
}

/// Apply the enabled attributes; `STATX_SIZE` truncates.
pub fn setattr(sbi: &Sbi, ii: &Arc<InodeInfo>, enable_bits: u32, attrs: &SetAttr) -> Result<()> {
    let mut guard = ii.inode();
    let inode: &mut Inode = &mut guard;
    debug!(ino = %inode.ino, enable_bits, "setattr");

    if enable_bits & libc::STATX_MODE != 0 {
        // File type bits are immutable; only permissions change.
        inode.mode = (inode.mode & toyfs_types::S_IFMT) | (attrs.mode & !toyfs_types::S_IFMT);
    }
    if enable_bits & libc::STATX_NLINK != 0 {
        inode.nlink = attrs.nlink;
    }
    if enable_bits & libc::STATX_UID != 0 {
        inode.uid = attrs.uid;
    }
    if enable_bits & libc::STATX_GID != 0 {
        inode.gid = attrs.gid;
    }
    if enable_bits & libc::STATX_ATIME != 0 {
        inode.atime = attrs.atime;
    }
    if enable_bits & libc::STATX_MTIME != 0 {
        inode.mtime = attrs.mtime;
    }
    if enable_bits & libc::STATX_CTIME != 0 {
        inode.ctime = attrs.ctime;
    }
    if enable_bits & libc::STATX_SIZE != 0 {
        file::truncate_locked(sbi, inode, attrs.size)?;
    }
    Ok(())
}

/// Eviction hook; nothing to do for an in-memory filesystem.
pub fn evict(ii: &Arc<InodeInfo>) {
    debug!(ino = %ii.ino(), "evict");
}

/// Dirent type byte for a child inode.
pub(crate) fn dtype_of_inode(inode: &Inode) -> u8 {
    dtype_of(inode.mode)
}

// ── Test support ────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A bound inode-info with an empty regular payload, for table tests.
    pub(crate) fn bound_info(ino: InodeNumber) -> Arc<InodeInfo> {
        let ii = InodeInfo::new();
        ii.bind(Inode {
            ino,
            mode: toyfs_types::S_IFREG | 0o644,
            nlink: 1,
            uid: 0,
            gid: 0,
            size: 0,
            blocks: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            generation: 0,
            rdev: 0,
            parent_ino: InodeNumber::NULL,
            payload: InodePayload::Reg(RegPayload::default()),
        });
        ii
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_binding() {
        let ii = InodeInfo::new();
        assert!(!ii.is_bound());
        ii.bind(test_inode(InodeNumber(7)));
        assert!(ii.is_bound());
        assert_eq!(ii.ino(), InodeNumber(7));
        assert_eq!(ii.inode().mode, toyfs_types::S_IFREG | 0o644);
        ii.unbind();
        assert!(!ii.is_bound());
    }

    #[test]
    #[should_panic(expected = "not bound")]
    fn unbound_access_panics() {
        let ii = InodeInfo::new();
        let _ = ii.inode();
    }

    #[test]
    fn std_dentry_link_counts() {
        let mut dir = test_dir_inode(InodeNumber(1));
        dir.nlink = 2;
        let mut child = test_dir_inode(InodeNumber(2));
        std_new_dir(dir.ino, &mut child);
        assert_eq!(child.nlink, 1);
        assert_eq!(child.parent_ino, InodeNumber(1));

        std_add_dentry(&mut dir, &mut child);
        assert_eq!(child.nlink, 2);
        assert_eq!(dir.nlink, 3, "subdirectory bumps the parent link count");

        std_remove_dentry(&mut dir, &mut child);
        assert_eq!(child.nlink, 1);
        assert_eq!(dir.nlink, 2);
    }

    #[test]
    fn reg_child_does_not_bump_dir_nlink() {
        let mut dir = test_dir_inode(InodeNumber(1));
        dir.nlink = 2;
        let mut child = test_inode(InodeNumber(2));
        std_add_dentry(&mut dir, &mut child);
        assert_eq!(child.nlink, 1);
        assert_eq!(dir.nlink, 2);
    }

    fn test_inode(ino: InodeNumber) -> Inode {
        Inode {
            ino,
            mode: toyfs_types::S_IFREG | 0o644,
            nlink: 0,
            uid: 0,
            gid: 0,
            size: 0,
            blocks: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            generation: 0,
            rdev: 0,
            parent_ino: InodeNumber::NULL,
            payload: InodePayload::Reg(RegPayload::default()),
        }
    }

    fn test_dir_inode(ino: InodeNumber) -> Inode {
        let mut inode = test_inode(ino);
        inode.mode = toyfs_types::S_IFDIR | 0o755;
        inode.payload = InodePayload::Dir(DirPayload {
            children: Vec::new(),
            off_max: 2,
        });
        inode
    }
}
