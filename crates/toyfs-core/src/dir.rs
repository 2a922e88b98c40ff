//! Directory engine: ordered child list, lookup, readdir, rename.
//!
//! Directory offsets are handed out from a per-directory counter and
//! multiplied by the page size, so they are strictly monotonic and unique
//! for the life of the directory. The observable directory size grows
//! with each link.

use crate::inode::{self, Dirent, InodeInfo, lock_pair};
use crate::super_block::Sbi;
use std::sync::Arc;
use toyfs_error::{Result, TfsError};
use toyfs_pool::SlabKind;
use toyfs_types::{DT_DIR, InodeNumber, NAME_MAX, PAGE_SIZE};
use tracing::debug;

// ── Link ────────────────────────────────────────────────────────────────────

/// Link `child_ii` into `dir_ii` under `name`.
pub fn add_dentry(
    sbi: &Sbi,
    dir_ii: &Arc<InodeInfo>,
    child_ii: &Arc<InodeInfo>,
    name: &[u8],
) -> Result<()> {
    if name.is_empty() {
        return Err(TfsError::Invalid);
    }
    if name.len() > NAME_MAX {
        return Err(TfsError::NameTooLong);
    }

    let (mut dir_guard, mut child_guard) = lock_pair(dir_ii, child_ii);
    let dir = &mut *dir_guard;
    let child = &mut *child_guard;
    if !dir.is_dir() {
        return Err(TfsError::NotDirectory);
    }

    sbi.acquire_slot(SlabKind::Dirent)?;

    let dtype = inode::dtype_of_inode(child);
    let child_ino = child.ino;
    let dirp = dir.dir_mut().expect("type checked above");
    let doff = dirp.off_max;
    dirp.off_max += 1;
    let off = doff * PAGE_SIZE as u64;
    dirp.children.push(Dirent {
        off,
        ino: child_ino,
        dtype,
        name: name.to_vec(),
    });
    dir.size = off + PAGE_SIZE as u64 + 2;
    inode::std_add_dentry(dir, child);

    debug!(
        dir_ino = %dir.ino,
        ino = %child_ino,
        name = %String::from_utf8_lossy(name),
        off,
        dir_nlink = dir.nlink,
        "add_dentry"
    );
    Ok(())
}

// ── Unlink ──────────────────────────────────────────────────────────────────

/// Unlink `name` from `dir_ii`.
///
/// Refuses with `NotEmpty` when the target is a directory that still has
/// children. An empty directory whose link count reaches one is forced to
/// zero links so the shim frees it.
pub fn remove_dentry(sbi: &Sbi, dir_ii: &Arc<InodeInfo>, name: &[u8]) -> Result<()> {
    debug!(dir_ino = %dir_ii.ino(), name = %String::from_utf8_lossy(name), "remove_dentry");

    // Find the child ino under the directory lock alone, then re-lock the
    // pair in canonical order and re-validate.
    let child_ino = {
        let dir = dir_ii.inode();
        let dirp = dir.dir().ok_or(TfsError::NotDirectory)?;
        let dirent = dirp
            .children
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| TfsError::NotFound(String::from_utf8_lossy(name).into_owned()))?;
        dirent.ino
    };

    let child_ii = inode::iget(sbi, child_ino)?;
    let (mut dir_guard, mut child_guard) = lock_pair(dir_ii, &child_ii);
    let dir = &mut *dir_guard;
    let child = &mut *child_guard;

    let dirp = dir.dir_mut().ok_or(TfsError::NotDirectory)?;
    let pos = dirp
        .children
        .iter()
        .position(|d| d.name == name && d.ino == child_ino)
        .ok_or_else(|| TfsError::NotFound(String::from_utf8_lossy(name).into_owned()))?;

    if child.is_dir() && child.dir().map_or(0, |d| d.ndentry()) > 0 {
        return Err(TfsError::NotEmpty);
    }

    dirp.children.remove(pos);
    inode::std_remove_dentry(dir, child);
    sbi.release_slot(SlabKind::Dirent);

    // Force free_inode by dropping the last link of an empty directory;
    // the shim only frees at nlink zero.
    if child.is_dir() && child.nlink == 1 && child.dir().map_or(0, |d| d.ndentry()) == 0 {
        child.nlink = 0;
    }

    Ok(())
}

// ── Lookup ──────────────────────────────────────────────────────────────────

/// Resolve `name` within a directory. Byte-exact comparison with length.
pub fn lookup(dir_ii: &Arc<InodeInfo>, name: &[u8]) -> Result<Option<InodeNumber>> {
    let dir = dir_ii.inode();
    let dirp = dir.dir().ok_or(TfsError::NotDirectory)?;
    Ok(dirp
        .children
        .iter()
        .find(|d| d.name == name)
        .map(|d| d.ino))
}

// ── Readdir ─────────────────────────────────────────────────────────────────

/// One entry handed to the readdir emit callback.
#[derive(Debug, Clone, Copy)]
pub struct DirEntryView<'a> {
    pub name: &'a [u8],
    pub ino: InodeNumber,
    pub dtype: u8,
    pub off: u64,
}

/// Result of one readdir pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaddirOutcome {
    /// Cursor to resume from.
    pub pos: u64,
    /// Whether the emit callback refused an entry before the end.
    pub more: bool,
    /// Entries accepted this pass.
    pub emitted: usize,
}

/// Walk a directory from `pos`, feeding entries to `emit` until it
/// refuses or the listing is exhausted.
///
/// Cursor 0 is "."; cursor 1 is ".."; from 2 on, every stored dirent with
/// `off >= pos` is emitted and the cursor advances to `off + 1`.
pub fn readdir(
    dir_ii: &Arc<InodeInfo>,
    pos: u64,
    emit: &mut dyn FnMut(&DirEntryView<'_>) -> bool,
) -> Result<ReaddirOutcome> {
    let dir = dir_ii.inode();
    let dirp = dir.dir().ok_or(TfsError::NotDirectory)?;
    let mut pos = pos;
    let mut emitted = 0usize;

    if pos == 0 {
        let accepted = emit(&DirEntryView {
            name: b".",
            ino: dir.ino,
            dtype: DT_DIR,
            off: 0,
        });
        if !accepted {
            return Ok(ReaddirOutcome {
                pos,
                more: true,
                emitted,
            });
        }
        emitted += 1;
        pos = 1;
    }
    if pos == 1 {
        let accepted = emit(&DirEntryView {
            name: b"..",
            ino: dir.parent_ino,
            dtype: DT_DIR,
            off: 1,
        });
        if !accepted {
            return Ok(ReaddirOutcome {
                pos,
                more: true,
                emitted,
            });
        }
        emitted += 1;
        pos = 2;
    }

    for dirent in &dirp.children {
        if dirent.off < pos {
            continue;
        }
        let accepted = emit(&DirEntryView {
            name: &dirent.name,
            ino: dirent.ino,
            dtype: dirent.dtype,
            off: dirent.off,
        });
        if !accepted {
            return Ok(ReaddirOutcome {
                pos: dirent.off,
                more: true,
                emitted,
            });
        }
        emitted += 1;
        pos = dirent.off + 1;
    }

    debug!(dir_ino = %dir.ino, emitted, pos, "readdir");
    Ok(ReaddirOutcome {
        pos,
        more: false,
        emitted,
    })
}

// ── Rename ──────────────────────────────────────────────────────────────────

/// Rename request as delivered by the shim.
pub struct RenameRequest<'a> {
    pub old_dir: Arc<InodeInfo>,
    pub new_dir: Arc<InodeInfo>,
    pub old_ii: Arc<InodeInfo>,
    /// Existing inode at the destination name, if any.
    pub new_ii: Option<Arc<InodeInfo>>,
    /// Empty when the shim only links the new name.
    pub old_name: &'a [u8],
    pub new_name: &'a [u8],
    /// ctime stamp for the affected directories, nanoseconds.
    pub time: u64,
}

/// Move a link: add the new name when the destination is unoccupied, then
/// drop the old name when one was given. A request that would do neither
/// is invalid.
pub fn rename(sbi: &Sbi, req: &RenameRequest<'_>) -> Result<()> {
    let mut did_work = false;

    if req.new_ii.is_none() {
        debug!(
            dir_ino = %req.new_dir.ino(),
            ino = %req.old_ii.ino(),
            new_name = %String::from_utf8_lossy(req.new_name),
            "rename: add_dentry"
        );
        add_dentry(sbi, &req.new_dir, &req.old_ii, req.new_name)?;
        req.new_dir.inode().ctime = req.time;
        did_work = true;
    }
    if !req.old_name.is_empty() {
        debug!(
            dir_ino = %req.old_dir.ino(),
            ino = %req.old_ii.ino(),
            old_name = %String::from_utf8_lossy(req.old_name),
            "rename: remove_dentry"
        );
        remove_dentry(sbi, &req.old_dir, req.old_name)?;
        req.old_dir.inode().ctime = req.time;
        did_work = true;
    }

    if !did_work {
        return Err(TfsError::Invalid);
    }
    Ok(())
}
