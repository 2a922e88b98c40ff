#![forbid(unsafe_code)]
//! On-media superblock format.
//!
//! Page 0 of a formatted device holds two byte-identical 2048-byte mirror
//! halves, each carrying a little-endian device table protected by a
//! CRC-16 over its static region. Page 1 holds the root inode image.
//! Everything here is bit-exact; the mount path re-validates magic,
//! checksum, and mirror identity on both halves.

use crc::{Crc, CRC_16_MODBUS};
use std::io::{Seek, SeekFrom, Write};
use toyfs_error::{Result, TfsError};
use toyfs_types::{InodeNumber, INODE_RECORD_SIZE, PAGE_SHIFT, PAGE_SIZE};

// ── Constants ───────────────────────────────────────────────────────────────

/// Filesystem magic ("M1FS", little-endian).
pub const SUPER_MAGIC: u64 = 0x5346_314D;

pub const MAJOR_VERSION: u32 = 14;
pub const MINOR_VERSION: u32 = 1;
pub const MINORS_PER_MAJOR: u32 = 1024;

/// Size of one superblock mirror half.
pub const SB_PART_SIZE: usize = 2048;

/// Device-table slots per table.
pub const MAX_DEVICES: usize = 64;

/// End of the checksummed static region within a mirror half.
pub const DEV_TABLE_STATIC_SIZE: usize = 1608;

/// Smallest device a filesystem can be formatted onto.
pub const MIN_DEVICE_SIZE: u64 = 1 << 20;

const VERSION_OFFSET: usize = 4;
const DEV_LIST_OFFSET: usize = 64;
const DEV_ID_SIZE: usize = 24;

const _: () = assert!(2 * SB_PART_SIZE == PAGE_SIZE);
const _: () = assert!(DEV_LIST_OFFSET + 8 + MAX_DEVICES * DEV_ID_SIZE == DEV_TABLE_STATIC_SIZE);
const _: () = assert!(DEV_TABLE_STATIC_SIZE <= SB_PART_SIZE);

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

// ── Little-endian field helpers ─────────────────────────────────────────────

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

fn get_uuid(buf: &[u8], off: usize) -> [u8; 16] {
    let mut b = [0u8; 16];
    b.copy_from_slice(&buf[off..off + 16]);
    b
}

// ── Device table ────────────────────────────────────────────────────────────

/// One device slot in the device list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevId {
    pub uuid: [u8; 16],
    pub blocks: u64,
}

/// The device list carried by each mirror half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevList {
    pub id_index: u16,
    pub t1_count: u16,
    pub t2_count: u16,
    pub rmem_count: u16,
    pub dev_ids: Vec<DevId>,
}

/// Parsed device table (one superblock mirror half).
///
/// Layout of the static region (little-endian):
///
/// | off  | field        |
/// |------|--------------|
/// | 0    | `s_sum` u16  |
/// | 2    | pad          |
/// | 4    | `s_version`  |
/// | 8    | `s_magic`    |
/// | 16   | `s_uuid`     |
/// | 32   | `s_flags`    |
/// | 40   | `s_t1_blocks`|
/// | 48   | `s_t2_blocks`|
/// | 56   | `s_wtime`    |
/// | 64   | `s_dev_list` |
/// | 1608 | end          |
///
/// `s_sum` is the CRC-16 (0xA001 reflected table, init 0xFFFF) of bytes
/// `[4, 1608)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevTable {
    pub version: u32,
    pub magic: u64,
    pub uuid: [u8; 16],
    pub flags: u64,
    pub t1_blocks: u64,
    pub t2_blocks: u64,
    pub wtime: u64,
    pub dev_list: DevList,
}

impl DevTable {
    /// Device table for a freshly formatted single-device filesystem.
    #[must_use]
    pub fn formatted(super_uuid: [u8; 16], dev_uuid: [u8; 16], t1_blocks: u64, wtime: u64) -> Self {
        Self {
            version: MAJOR_VERSION * MINORS_PER_MAJOR + MINOR_VERSION,
            magic: SUPER_MAGIC,
            uuid: super_uuid,
            flags: 0,
            t1_blocks,
            t2_blocks: 0,
            wtime,
            dev_list: DevList {
                id_index: 0,
                t1_count: 1,
                t2_count: 0,
                rmem_count: 0,
                dev_ids: vec![DevId {
                    uuid: dev_uuid,
                    blocks: t1_blocks,
                }],
            },
        }
    }

    /// Serialize into one mirror half, computing `s_sum`.
    #[must_use]
    pub fn to_part_bytes(&self) -> [u8; SB_PART_SIZE] {
        let mut part = [0u8; SB_PART_SIZE];
        put_u32(&mut part, 4, self.version);
        put_u64(&mut part, 8, self.magic);
        part[16..32].copy_from_slice(&self.uuid);
        put_u64(&mut part, 32, self.flags);
        put_u64(&mut part, 40, self.t1_blocks);
        put_u64(&mut part, 48, self.t2_blocks);
        put_u64(&mut part, 56, self.wtime);

        let dl = &self.dev_list;
        put_u16(&mut part, DEV_LIST_OFFSET, dl.id_index);
        put_u16(&mut part, DEV_LIST_OFFSET + 2, dl.t1_count);
        put_u16(&mut part, DEV_LIST_OFFSET + 4, dl.t2_count);
        put_u16(&mut part, DEV_LIST_OFFSET + 6, dl.rmem_count);
        for (i, dev) in dl.dev_ids.iter().take(MAX_DEVICES).enumerate() {
            let off = DEV_LIST_OFFSET + 8 + i * DEV_ID_SIZE;
            part[off..off + 16].copy_from_slice(&dev.uuid);
            put_u64(&mut part, off + 16, dev.blocks);
        }

        let sum = checksum(&part);
        put_u16(&mut part, 0, sum);
        part
    }

    /// Parse and validate one mirror half: magic, then checksum.
    pub fn parse_part(part: &[u8]) -> Result<Self> {
        if part.len() < SB_PART_SIZE {
            return Err(TfsError::Format(format!(
                "superblock part too short: {} bytes",
                part.len()
            )));
        }

        let magic = get_u64(part, 8);
        if magic != SUPER_MAGIC {
            return Err(TfsError::Format(format!(
                "illegal magic: {magic:#x} (expected {SUPER_MAGIC:#x})"
            )));
        }

        let stored = get_u16(part, 0);
        let computed = checksum(part);
        if stored != computed {
            return Err(TfsError::Format(format!(
                "superblock checksum mismatch: stored {stored:#06x}, computed {computed:#06x}"
            )));
        }

        let t1_count = get_u16(part, DEV_LIST_OFFSET + 2);
        if usize::from(t1_count) > MAX_DEVICES {
            return Err(TfsError::Format(format!(
                "device list overflow: t1_count={t1_count}"
            )));
        }
        let dev_ids = (0..usize::from(t1_count))
            .map(|i| {
                let off = DEV_LIST_OFFSET + 8 + i * DEV_ID_SIZE;
                DevId {
                    uuid: get_uuid(part, off),
                    blocks: get_u64(part, off + 16),
                }
            })
            .collect();

        Ok(Self {
            version: get_u32(part, 4),
            magic,
            uuid: get_uuid(part, 16),
            flags: get_u64(part, 32),
            t1_blocks: get_u64(part, 40),
            t2_blocks: get_u64(part, 48),
            wtime: get_u64(part, 56),
            dev_list: DevList {
                id_index: get_u16(part, DEV_LIST_OFFSET),
                t1_count,
                t2_count: get_u16(part, DEV_LIST_OFFSET + 4),
                rmem_count: get_u16(part, DEV_LIST_OFFSET + 6),
                dev_ids,
            },
        })
    }
}

/// CRC-16 over the static region, excluding the checksum field.
#[must_use]
pub fn checksum(part: &[u8]) -> u16 {
    CRC16.checksum(&part[VERSION_OFFSET..DEV_TABLE_STATIC_SIZE])
}

// ── Superblock page ─────────────────────────────────────────────────────────

/// Build page 0: the device table mirrored into both halves.
#[must_use]
pub fn build_super_page(table: &DevTable) -> [u8; PAGE_SIZE] {
    let part = table.to_part_bytes();
    let mut page = [0u8; PAGE_SIZE];
    page[..SB_PART_SIZE].copy_from_slice(&part);
    page[SB_PART_SIZE..].copy_from_slice(&part);
    page
}

/// Validate page 0 of a device: both halves must carry the magic, pass the
/// checksum, and be byte-identical.
pub fn parse_super_page(page: &[u8]) -> Result<DevTable> {
    if page.len() < PAGE_SIZE {
        return Err(TfsError::Format(format!(
            "superblock page too short: {} bytes",
            page.len()
        )));
    }
    let part1 = &page[..SB_PART_SIZE];
    let part2 = &page[SB_PART_SIZE..PAGE_SIZE];

    let table = DevTable::parse_part(part1)?;
    DevTable::parse_part(part2)?;
    if part1 != part2 {
        return Err(TfsError::Format(
            "superblock mirror halves differ".to_owned(),
        ));
    }
    Ok(table)
}

// ── Root inode image ────────────────────────────────────────────────────────

/// Root inode fields as written by the format utility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootInodeImage {
    pub ino: InodeNumber,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub parent_ino: InodeNumber,
    pub ndentry: u64,
    pub off_max: u64,
}

/// Build page 1: the root inode image at offset 0 of a zeroed page.
#[must_use]
pub fn build_root_inode_page() -> [u8; PAGE_SIZE] {
    let mut page = [0u8; PAGE_SIZE];
    let rec = &mut page[..INODE_RECORD_SIZE];
    put_u64(rec, 0, InodeNumber::ROOT.0); // i_ino
    put_u32(rec, 12, 2); // i_nlink
    put_u64(rec, 24, 0); // i_size
    put_u64(rec, 80, InodeNumber::ROOT.0); // i_parent_ino
    put_u64(rec, 96, 2); // d_off_max
    page
}

/// Read back the root inode image (test and inspection aid).
pub fn parse_root_inode_page(page: &[u8]) -> Result<RootInodeImage> {
    if page.len() < INODE_RECORD_SIZE {
        return Err(TfsError::Format(format!(
            "root inode image too short: {} bytes",
            page.len()
        )));
    }
    Ok(RootInodeImage {
        ino: InodeNumber(get_u64(page, 0)),
        mode: get_u32(page, 8),
        nlink: get_u32(page, 12),
        size: get_u64(page, 24),
        parent_ino: InodeNumber(get_u64(page, 80)),
        ndentry: get_u64(page, 88),
        off_max: get_u64(page, 96),
    })
}

// ── Format writer ───────────────────────────────────────────────────────────

/// Write a fresh filesystem image: superblock page at offset 0, root inode
/// page at offset 4096. The caller opens the device, supplies its size and
/// the UUIDs, and syncs after.
pub fn write_image<W: Write + Seek>(
    out: &mut W,
    dev_size: u64,
    super_uuid: [u8; 16],
    dev_uuid: [u8; 16],
    wtime: u64,
) -> Result<u64> {
    if dev_size < MIN_DEVICE_SIZE {
        return Err(TfsError::Format(format!(
            "illegal device size: {dev_size} (minimum {MIN_DEVICE_SIZE})"
        )));
    }

    let t1_blocks = dev_size >> PAGE_SHIFT;
    let table = DevTable::formatted(super_uuid, dev_uuid, t1_blocks, wtime);

    out.seek(SeekFrom::Start(0))?;
    out.write_all(&build_super_page(&table))?;
    out.write_all(&build_root_inode_page())?;
    out.flush()?;
    Ok(t1_blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> DevTable {
        DevTable::formatted([0x11; 16], [0x22; 16], 16384, 1_500_000_000_000_000_000)
    }

    #[test]
    fn crc16_check_value() {
        // CRC-16 with the 0xA001 reflected table, init 0xFFFF, no xor-out.
        assert_eq!(CRC16.checksum(b"123456789"), 0x4B37);
    }

    #[test]
    fn part_roundtrip() {
        let table = sample_table();
        let bytes = table.to_part_bytes();
        let parsed = DevTable::parse_part(&bytes).unwrap();
        assert_eq!(parsed, table);
        assert_eq!(parsed.version, MAJOR_VERSION * MINORS_PER_MAJOR + MINOR_VERSION);
        assert_eq!(parsed.dev_list.dev_ids.len(), 1);
        assert_eq!(parsed.dev_list.dev_ids[0].blocks, 16384);
    }

    #[test]
    fn checksum_covers_static_region() {
        let table = sample_table();
        let mut bytes = table.to_part_bytes();

        // Flipping a bit inside the static region breaks the checksum.
        bytes[40] ^= 0x01;
        assert!(matches!(
            DevTable::parse_part(&bytes),
            Err(TfsError::Format(_))
        ));
        bytes[40] ^= 0x01;
        DevTable::parse_part(&bytes).unwrap();

        // Bytes past the static region are not covered.
        bytes[DEV_TABLE_STATIC_SIZE] ^= 0xFF;
        DevTable::parse_part(&bytes).unwrap();
    }

    #[test]
    fn bad_magic_rejected_before_checksum() {
        let mut bytes = sample_table().to_part_bytes();
        put_u64(&mut bytes, 8, 0xDEAD_BEEF);
        let err = DevTable::parse_part(&bytes).unwrap_err();
        assert!(err.to_string().contains("illegal magic"));
    }

    #[test]
    fn super_page_mirrors_are_identical() {
        let page = build_super_page(&sample_table());
        assert_eq!(&page[..SB_PART_SIZE], &page[SB_PART_SIZE..]);
        parse_super_page(&page).unwrap();
    }

    #[test]
    fn differing_mirrors_rejected() {
        let mut page = build_super_page(&sample_table());
        // Corrupt an uncovered byte of the second half only: each half
        // still validates, but the mirrors no longer match.
        page[SB_PART_SIZE + DEV_TABLE_STATIC_SIZE] ^= 0xFF;
        let err = parse_super_page(&page).unwrap_err();
        assert!(err.to_string().contains("mirror halves differ"));
    }

    #[test]
    fn root_inode_image_fields() {
        let page = build_root_inode_page();
        let root = parse_root_inode_page(&page).unwrap();
        assert_eq!(root.ino, InodeNumber::ROOT);
        assert_eq!(root.nlink, 2);
        assert_eq!(root.size, 0);
        assert_eq!(root.parent_ino, InodeNumber::ROOT);
        assert_eq!(root.ndentry, 0);
        assert_eq!(root.off_max, 2);
        // Everything past the record is zero.
        assert!(page[INODE_RECORD_SIZE..].iter().all(|&b| b == 0));
    }

    #[test]
    fn write_image_layout() {
        let mut buf = std::io::Cursor::new(vec![0u8; 64 << 20]);
        let t1 = write_image(
            &mut buf,
            64 << 20,
            [0xAA; 16],
            [0xBB; 16],
            1_700_000_000_000_000_000,
        )
        .unwrap();
        assert_eq!(t1, 16384);

        let image = buf.into_inner();
        let table = parse_super_page(&image[..PAGE_SIZE]).unwrap();
        assert_eq!(table.t1_blocks, 16384);
        assert_eq!(table.dev_list.t1_count, 1);
        assert_eq!(table.dev_list.dev_ids[0].uuid, [0xBB; 16]);

        let root = parse_root_inode_page(&image[PAGE_SIZE..2 * PAGE_SIZE]).unwrap();
        assert_eq!(root.ino, InodeNumber::ROOT);
    }

    #[test]
    fn format_real_file() {
        use std::io::{Read, Seek, SeekFrom};

        let mut file = tempfile::tempfile().unwrap();
        file.set_len(64 << 20).unwrap();
        let t1 = write_image(&mut file, 64 << 20, [1; 16], [2; 16], 42).unwrap();
        assert_eq!(t1, 16384);
        file.sync_all().unwrap();

        file.seek(SeekFrom::Start(0)).unwrap();
        let mut head = vec![0u8; 2 * PAGE_SIZE];
        file.read_exact(&mut head).unwrap();
        let table = parse_super_page(&head[..PAGE_SIZE]).unwrap();
        assert_eq!(table.t1_blocks, 16384);
        let root = parse_root_inode_page(&head[PAGE_SIZE..]).unwrap();
        assert_eq!(root.nlink, 2);
        assert_eq!(file.metadata().unwrap().len(), 64 << 20);
    }

    #[test]
    fn tiny_device_rejected() {
        let mut buf = std::io::Cursor::new(vec![0u8; 4096]);
        assert!(matches!(
            write_image(&mut buf, 4096, [0; 16], [0; 16], 0),
            Err(TfsError::Format(_))
        ));
    }
}
