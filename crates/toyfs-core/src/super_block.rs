//! Super-block lifecycle and statvfs accounting.
//!
//! The `Sbi` owns the pool, the inode table, and the statvfs counters.
//! Every page and slab acquisition funnels through it so the counters
//! stay exact: `f_blocks = f_bfree + pages_in_use` at all times, where
//! pages in use include pages carved into typed slabs.
//!
//! Lock order: the super mutex may be taken while holding an inode
//! mutex, and the pool mutex while holding the super mutex — never the
//! other way around.

use crate::inode::{DirPayload, Inode, InodeInfo, InodePayload};
use crate::itable::{DEFAULT_ITABLE_BUCKETS, Itable};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use toyfs_error::{Result, TfsError};
use toyfs_pool::{DblkrefId, Pool, SlabKind};
use toyfs_types::{BlockNumber, InodeNumber, NAME_MAX, PAGE_SIZE, S_IFDIR};
use tracing::{debug, info};

/// statvfs-like counters, all in `PAGE_SIZE` units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatVfs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub namemax: u64,
    pub flag: u64,
}

/// Mount-time tunables.
#[derive(Debug, Clone, Copy)]
pub struct MountConfig {
    /// Initial inode-table bucket count; the table grows on high load.
    pub itable_buckets: usize,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            itable_buckets: DEFAULT_ITABLE_BUCKETS,
        }
    }
}

/// Where the arena comes from.
pub enum MountSource {
    /// A formatted pmem image: pages 0 and 1 hold the superblock mirrors
    /// and root inode, the rest become the arena. Both mirror halves must
    /// pass magic and checksum validation.
    Pmem { image: Vec<u8> },
    /// Anonymous memory of the given size (no attached pmem).
    Anonymous { bytes: u64 },
}

impl MountSource {
    /// The default anonymous arena: 1 GiB.
    #[must_use]
    pub fn default_anonymous() -> Self {
        Self::Anonymous { bytes: 1 << 30 }
    }
}

/// Per-mount super-block info.
pub struct Sbi {
    config: MountConfig,
    pool: OnceLock<Pool>,
    itable: Itable,
    stats: Mutex<StatVfs>,
    top_ino: AtomicU64,
    root: Mutex<Option<Arc<InodeInfo>>>,
}

impl Sbi {
    /// Allocate an empty super-block; the arena arrives at `init`.
    #[must_use]
    pub fn alloc(config: MountConfig) -> Arc<Self> {
        debug!(itable_buckets = config.itable_buckets, "sbi_alloc");
        Arc::new(Self {
            config,
            pool: OnceLock::new(),
            itable: Itable::new(config.itable_buckets),
            stats: Mutex::new(StatVfs::default()),
            top_ino: AtomicU64::new(InodeNumber::ROOT.0 + 1),
            root: Mutex::new(None),
        })
    }

    /// Bring the filesystem up: build the arena, seed the counters,
    /// create the root inode. Returns the root inode-info.
    pub fn init(&self, source: MountSource) -> Result<Arc<InodeInfo>> {
        let num_pages = match &source {
            MountSource::Pmem { image } => {
                if image.len() % PAGE_SIZE != 0 {
                    return Err(TfsError::Format(format!(
                        "pmem image size {} is not page-aligned",
                        image.len()
                    )));
                }
                let total_pages = (image.len() / PAGE_SIZE) as u64;
                if total_pages <= 2 {
                    return Err(TfsError::Format(format!(
                        "pmem too small: {total_pages} pages"
                    )));
                }
                let table = toyfs_ondisk::parse_super_page(&image[..PAGE_SIZE])?;
                info!(
                    t1_blocks = table.t1_blocks,
                    version = table.version,
                    "pmem superblock validated"
                );
                total_pages - 2
            }
            MountSource::Anonymous { bytes } => {
                if *bytes < PAGE_SIZE as u64 {
                    return Err(TfsError::Invalid);
                }
                bytes / PAGE_SIZE as u64
            }
        };

        #[allow(clippy::cast_possible_truncation)]
        let pool = Pool::new(num_pages as usize);
        assert!(
            self.pool.set(pool).is_ok(),
            "sbi_init called twice on one super-block"
        );

        {
            let mut stats = self.stats.lock();
            *stats = StatVfs {
                bsize: PAGE_SIZE as u64,
                frsize: PAGE_SIZE as u64,
                blocks: num_pages,
                bfree: num_pages,
                bavail: num_pages,
                files: num_pages,
                ffree: num_pages,
                favail: num_pages,
                namemax: NAME_MAX as u64,
                flag: 0,
            };
        }
        self.top_ino
            .store(InodeNumber::ROOT.0 + 1, Ordering::SeqCst);

        let root = self.new_root_inode()?;
        *self.root.lock() = Some(root.clone());
        info!(pages = num_pages, "sbi_init complete");
        Ok(root)
    }

    /// Tear down the mount state.
    pub fn fini(&self) {
        info!("sbi_fini");
        self.itable.clear();
        *self.root.lock() = None;
    }

    fn new_root_inode(&self) -> Result<Arc<InodeInfo>> {
        let ii = self.zii_alloc()?;
        self.acquire_slot(SlabKind::Inode)?;
        ii.bind(Inode {
            ino: InodeNumber::ROOT,
            mode: S_IFDIR | 0o755,
            nlink: 2,
            uid: 0,
            gid: 0,
            size: 0,
            blocks: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            generation: 0,
            rdev: 0,
            parent_ino: InodeNumber::ROOT,
            payload: InodePayload::Dir(DirPayload {
                children: Vec::new(),
                off_max: 2,
            }),
        });
        self.itable.insert(ii.clone());
        Ok(ii)
    }

    /// The root inode-info, once mounted.
    #[must_use]
    pub fn root(&self) -> Option<Arc<InodeInfo>> {
        self.root.lock().clone()
    }

    /// The inode table.
    #[must_use]
    pub fn itable(&self) -> &Itable {
        &self.itable
    }

    pub(crate) fn pool(&self) -> &Pool {
        self.pool.get().expect("sbi not initialized")
    }

    /// Mount-time configuration.
    #[must_use]
    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    /// Next inode number; totally ordered, never reused within a mount.
    pub(crate) fn next_ino(&self) -> InodeNumber {
        InodeNumber(self.top_ino.fetch_add(1, Ordering::SeqCst))
    }

    // ── Counter-consistent resource wrappers ────────────────────────────────

    /// Pop one zeroed data page and debit the free counters.
    pub(crate) fn alloc_page(&self) -> Result<BlockNumber> {
        let mut stats = self.stats.lock();
        if stats.bfree == 0 || stats.bavail == 0 {
            return Err(TfsError::NoSpace);
        }
        let bn = self.pool().alloc_page()?;
        stats.bfree -= 1;
        stats.bavail -= 1;
        debug!(%bn, bfree = stats.bfree, "alloc_page");
        Ok(bn)
    }

    /// Return a data page and credit the free counters.
    pub(crate) fn free_page(&self, bn: BlockNumber) {
        let mut stats = self.stats.lock();
        self.pool().free_page(bn);
        stats.bfree += 1;
        stats.bavail += 1;
        debug!(%bn, bfree = stats.bfree, "free_page");
    }

    /// Take one slab record, debiting the counters when the slab carves a
    /// fresh page.
    pub(crate) fn acquire_slot(&self, kind: SlabKind) -> Result<()> {
        let mut stats = self.stats.lock();
        let carved = self.pool().acquire_slot(kind)?;
        stats.bfree -= u64::from(carved);
        stats.bavail -= u64::from(carved);
        Ok(())
    }

    pub(crate) fn release_slot(&self, kind: SlabKind) {
        self.pool().release_slot(kind);
    }

    /// Allocate a private data block: fresh page, refcount 1.
    pub(crate) fn new_dblkref(&self) -> Result<DblkrefId> {
        let bn = self.alloc_page()?;
        let acquired = {
            let mut stats = self.stats.lock();
            match self.pool().acquire_dblkref() {
                Ok((id, carved)) => {
                    stats.bfree -= u64::from(carved);
                    stats.bavail -= u64::from(carved);
                    Ok(id)
                }
                Err(err) => Err(err),
            }
        };
        match acquired {
            Ok(id) => {
                self.pool().init_dblkref(id, bn);
                Ok(id)
            }
            Err(err) => {
                self.free_page(bn);
                Err(err)
            }
        }
    }

    /// Drop one data-block reference, freeing and crediting its page when
    /// the count reaches zero.
    pub(crate) fn decref_dblkref(&self, id: DblkrefId) {
        if let Some(bn) = self.pool().decref(id) {
            self.free_page(bn);
        }
    }

    // ── Inode-info accounting ───────────────────────────────────────────────

    /// Allocate an inode-info handle, debiting the file counters.
    pub fn zii_alloc(&self) -> Result<Arc<InodeInfo>> {
        let mut stats = self.stats.lock();
        if stats.ffree == 0 || stats.favail == 0 {
            return Err(TfsError::NoMemory);
        }
        stats.ffree -= 1;
        stats.favail -= 1;
        debug!(ffree = stats.ffree, "zii_alloc");
        Ok(InodeInfo::new())
    }

    /// Release an inode-info handle, crediting the file counters.
    pub fn zii_free(&self, ii: Arc<InodeInfo>) {
        let mut stats = self.stats.lock();
        stats.ffree += 1;
        stats.favail += 1;
        debug!(ffree = stats.ffree, "zii_free");
        drop(ii);
    }

    /// Snapshot of the statvfs counters.
    #[must_use]
    pub fn statfs(&self) -> StatVfs {
        let stats = self.stats.lock();
        debug!(
            blocks = stats.blocks,
            bfree = stats.bfree,
            files = stats.files,
            ffree = stats.ffree,
            "statfs"
        );
        *stats
    }
}
