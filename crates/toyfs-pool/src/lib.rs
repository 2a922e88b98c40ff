#![forbid(unsafe_code)]
//! Page arena and typed slab pool.
//!
//! The arena slices a flat region into fixed `PAGE_SIZE` pages addressed
//! by block number and hands them out from a LIFO free-list. Typed
//! records (inodes, dirents, data-block references, file block-map
//! entries) are sub-allocated by lazily carving one raw page into
//! `PAGE_SIZE / RECORD_SIZE` slots. Carving is irreversible: a page that
//! has been split for a slab never returns to the raw free-list.
//!
//! One mutex guards the raw free-list, every slab ledger, and all
//! data-block reference counts; page payloads sit behind per-page
//! `RwLock`s so data copies never hold the pool mutex.

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use toyfs_error::{Result, TfsError};
use toyfs_types::{
    BlockNumber, DATA_BN_BASE, DBLKREF_RECORD_SIZE, DIRENT_RECORD_SIZE, IBLKREF_RECORD_SIZE,
    INODE_RECORD_SIZE, PAGE_SIZE,
};
use tracing::{debug, trace};

/// Records per carved page for each slab.
const INODES_PER_PAGE: u32 = (PAGE_SIZE / INODE_RECORD_SIZE) as u32;
const DIRENTS_PER_PAGE: u32 = (PAGE_SIZE / DIRENT_RECORD_SIZE) as u32;
const DBLKREFS_PER_PAGE: u32 = (PAGE_SIZE / DBLKREF_RECORD_SIZE) as u32;
const IBLKREFS_PER_PAGE: u32 = (PAGE_SIZE / IBLKREF_RECORD_SIZE) as u32;

type PageBuf = Box<[u8; PAGE_SIZE]>;

/// Handle to a pool-resident data-block reference slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DblkrefId(u32);

/// The four typed slabs carved from raw pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabKind {
    Inode,
    Dirent,
    Iblkref,
}

#[derive(Debug, Default)]
struct SlabLedger {
    free: u32,
}

#[derive(Debug, Clone, Copy)]
struct DblkrefSlot {
    bn: BlockNumber,
    refcnt: u32,
}

struct PoolInner {
    free_pages: Vec<u32>,
    inodes: SlabLedger,
    dirents: SlabLedger,
    iblkrefs: SlabLedger,
    dblkref_slots: Vec<DblkrefSlot>,
    free_dblkrefs: Vec<u32>,
}

impl PoolInner {
    fn ledger_mut(&mut self, kind: SlabKind) -> &mut SlabLedger {
        match kind {
            SlabKind::Inode => &mut self.inodes,
            SlabKind::Dirent => &mut self.dirents,
            SlabKind::Iblkref => &mut self.iblkrefs,
        }
    }

    /// Pop one raw page to refill a slab. The page index is consumed for
    /// the life of the mount.
    fn carve(&mut self, kind: SlabKind) -> Result<()> {
        let Some(idx) = self.free_pages.pop() else {
            return Err(TfsError::NoSpace);
        };
        let per_page = records_per_page(kind);
        self.ledger_mut(kind).free += per_page;
        trace!(page = idx, ?kind, records = per_page, "slab carve");
        Ok(())
    }
}

fn records_per_page(kind: SlabKind) -> u32 {
    match kind {
        SlabKind::Inode => INODES_PER_PAGE,
        SlabKind::Dirent => DIRENTS_PER_PAGE,
        SlabKind::Iblkref => IBLKREFS_PER_PAGE,
    }
}

/// The page arena plus typed slab pool. One per mounted super-block.
pub struct Pool {
    pages: Vec<RwLock<PageBuf>>,
    inner: Mutex<PoolInner>,
}

impl Pool {
    /// Build a pool over `num_pages` fresh pages, all free.
    #[must_use]
    pub fn new(num_pages: usize) -> Self {
        let pages = (0..num_pages)
            .map(|_| RwLock::new(new_page_buf()))
            .collect();
        #[allow(clippy::cast_possible_truncation)] // arena indices fit u32
        let free_pages: Vec<u32> = (0..num_pages as u32).collect();
        debug!(num_pages, "pool setup");
        Self {
            pages,
            inner: Mutex::new(PoolInner {
                free_pages,
                inodes: SlabLedger::default(),
                dirents: SlabLedger::default(),
                iblkrefs: SlabLedger::default(),
                dblkref_slots: Vec::new(),
                free_dblkrefs: Vec::new(),
            }),
        }
    }

    /// Total pages in the arena (free or not).
    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.pages.len() as u64
    }

    /// Pages currently on the raw free-list.
    #[must_use]
    pub fn raw_free_pages(&self) -> u64 {
        self.inner.lock().free_pages.len() as u64
    }

    fn index_of(&self, bn: BlockNumber) -> usize {
        let idx = bn
            .0
            .checked_sub(DATA_BN_BASE)
            .unwrap_or_else(|| panic!("block number {bn} below arena base"));
        assert!(
            (idx as usize) < self.pages.len(),
            "block number {bn} beyond arena end"
        );
        idx as usize
    }

    // ── Raw pages ───────────────────────────────────────────────────────────

    /// Pop one raw page, zeroed. `NoSpace` when the free-list is empty.
    pub fn alloc_page(&self) -> Result<BlockNumber> {
        let idx = {
            let mut inner = self.inner.lock();
            inner.free_pages.pop().ok_or(TfsError::NoSpace)?
        };
        let bn = BlockNumber(u64::from(idx) + DATA_BN_BASE);
        self.zero_page(bn);
        Ok(bn)
    }

    /// Return a page to the raw free-list.
    pub fn free_page(&self, bn: BlockNumber) {
        let idx = self.index_of(bn);
        let mut inner = self.inner.lock();
        debug_assert!(
            !inner.free_pages.contains(&(idx as u32)),
            "double free of page {bn}"
        );
        #[allow(clippy::cast_possible_truncation)]
        inner.free_pages.push(idx as u32);
    }

    // ── Typed slabs ─────────────────────────────────────────────────────────

    /// Take one record slot from a slab, carving a raw page when the slab
    /// is dry. Returns the number of raw pages consumed by the call (0 or
    /// 1) so the caller can keep the statvfs counters consistent.
    pub fn acquire_slot(&self, kind: SlabKind) -> Result<u32> {
        let mut inner = self.inner.lock();
        let mut carved = 0;
        if inner.ledger_mut(kind).free == 0 {
            inner.carve(kind)?;
            carved = 1;
        }
        inner.ledger_mut(kind).free -= 1;
        Ok(carved)
    }

    /// Return one record slot to its slab.
    pub fn release_slot(&self, kind: SlabKind) {
        let mut inner = self.inner.lock();
        inner.ledger_mut(kind).free += 1;
    }

    // ── Data-block references ───────────────────────────────────────────────

    /// Take a dblkref slot (refcount 0, no block). Returns the slot id and
    /// the number of raw pages consumed by carving.
    pub fn acquire_dblkref(&self) -> Result<(DblkrefId, u32)> {
        let mut inner = self.inner.lock();
        let mut carved = 0;
        if inner.free_dblkrefs.is_empty() {
            let Some(idx) = inner.free_pages.pop() else {
                return Err(TfsError::NoSpace);
            };
            trace!(page = idx, records = DBLKREFS_PER_PAGE, "dblkref slab carve");
            let base = inner.dblkref_slots.len();
            for i in 0..DBLKREFS_PER_PAGE as usize {
                inner.dblkref_slots.push(DblkrefSlot {
                    bn: BlockNumber::NULL,
                    refcnt: 0,
                });
                #[allow(clippy::cast_possible_truncation)]
                inner.free_dblkrefs.push((base + i) as u32);
            }
            carved = 1;
        }
        let slot = inner
            .free_dblkrefs
            .pop()
            .expect("dblkref free-list refilled above");
        inner.dblkref_slots[slot as usize] = DblkrefSlot {
            bn: BlockNumber::NULL,
            refcnt: 0,
        };
        Ok((DblkrefId(slot), carved))
    }

    /// Return an unused dblkref slot (refcount must be zero).
    pub fn release_dblkref(&self, id: DblkrefId) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.dblkref_slots[id.0 as usize];
        assert_eq!(slot.refcnt, 0, "releasing referenced dblkref {id:?}");
        slot.bn = BlockNumber::NULL;
        inner.free_dblkrefs.push(id.0);
    }

    /// Bind a freshly acquired dblkref to its data page with refcount 1.
    pub fn init_dblkref(&self, id: DblkrefId, bn: BlockNumber) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.dblkref_slots[id.0 as usize];
        assert_eq!(slot.refcnt, 0, "rebinding live dblkref {id:?}");
        slot.bn = bn;
        slot.refcnt = 1;
    }

    /// Add one reference to a live dblkref.
    pub fn incref(&self, id: DblkrefId) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.dblkref_slots[id.0 as usize];
        assert!(slot.refcnt > 0, "incref on dead dblkref {id:?}");
        slot.refcnt += 1;
    }

    /// Drop one reference. When the count hits zero the slot is released
    /// and the backing block number is returned so the caller can free the
    /// page (and account for it).
    pub fn decref(&self, id: DblkrefId) -> Option<BlockNumber> {
        let mut inner = self.inner.lock();
        let slot = &mut inner.dblkref_slots[id.0 as usize];
        assert!(slot.refcnt > 0, "decref underflow on dblkref {id:?}");
        slot.refcnt -= 1;
        if slot.refcnt > 0 {
            return None;
        }
        let bn = slot.bn;
        slot.bn = BlockNumber::NULL;
        inner.free_dblkrefs.push(id.0);
        Some(bn)
    }

    /// Block number a dblkref points at.
    #[must_use]
    pub fn dblkref_bn(&self, id: DblkrefId) -> BlockNumber {
        self.inner.lock().dblkref_slots[id.0 as usize].bn
    }

    /// Current reference count of a dblkref.
    #[must_use]
    pub fn dblkref_refcnt(&self, id: DblkrefId) -> u32 {
        self.inner.lock().dblkref_slots[id.0 as usize].refcnt
    }

    // ── Page data ───────────────────────────────────────────────────────────

    /// Shared read access to a page's bytes.
    #[must_use]
    pub fn read_page(&self, bn: BlockNumber) -> RwLockReadGuard<'_, PageBuf> {
        self.pages[self.index_of(bn)].read()
    }

    /// Exclusive write access to a page's bytes.
    #[must_use]
    pub fn write_page(&self, bn: BlockNumber) -> RwLockWriteGuard<'_, PageBuf> {
        self.pages[self.index_of(bn)].write()
    }

    /// Fill a whole page with zeros.
    pub fn zero_page(&self, bn: BlockNumber) {
        self.write_page(bn).fill(0);
    }

    /// Copy the full contents of `src` into `dst`.
    pub fn copy_page(&self, dst: BlockNumber, src: BlockNumber) {
        assert_ne!(dst, src, "page copy onto itself");
        let src_guard = self.read_page(src);
        let mut dst_guard = self.write_page(dst);
        dst_guard.copy_from_slice(&src_guard[..]);
    }
}

fn new_page_buf() -> PageBuf {
    vec![0u8; PAGE_SIZE]
        .into_boxed_slice()
        .try_into()
        .expect("boxed slice has PAGE_SIZE bytes")
}
