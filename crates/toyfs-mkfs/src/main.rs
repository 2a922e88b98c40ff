#![forbid(unsafe_code)]
//! `mkfs <device-path> <uuid>` — write a fresh toyfs image.
//!
//! Produces the on-media layout of `toyfs-ondisk`: two mirrored
//! superblock halves at page 0 and the root inode at page 1, flushed to
//! stable storage before exit.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "toyfs-mkfs", about = "Format a device with a fresh toyfs filesystem")]
struct Cli {
    /// Regular file or block device of at least 1 MiB.
    device: PathBuf,
    /// Device UUID recorded in the device table.
    uuid: String,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("toyfs-mkfs: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let dev_uuid =
        Uuid::parse_str(&cli.uuid).with_context(|| format!("illegal uuid: {}", cli.uuid))?;

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&cli.device)
        .with_context(|| format!("open failed: {}", cli.device.display()))?;

    let meta = file
        .metadata()
        .with_context(|| format!("stat failed: {}", cli.device.display()))?;
    let ftype = meta.file_type();
    if !ftype.is_file() && !ftype.is_block_device() {
        bail!("not a block device or regular file: {}", cli.device.display());
    }

    // Seek-to-end sizes both regular files and block devices.
    let dev_size = file
        .seek(SeekFrom::End(0))
        .with_context(|| format!("failed to size device: {}", cli.device.display()))?;
    println!("open device: {} size={dev_size}", cli.device.display());

    let wtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before epoch")?;
    let wtime = u64::try_from(wtime.as_nanos()).context("timestamp overflow")?;

    let super_uuid = Uuid::new_v4();
    let t1_blocks = toyfs_ondisk::write_image(
        &mut file,
        dev_size,
        *super_uuid.as_bytes(),
        *dev_uuid.as_bytes(),
        wtime,
    )
    .context("failed to write super block")?;

    file.sync_all().context("failed to fsync")?;
    println!("device: uuid={} blocks={t1_blocks}", cli.uuid);
    Ok(())
}
