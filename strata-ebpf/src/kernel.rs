//! Defensive reads of the handful of kernel struct fields the probes need.
//!
//! Field offsets are for x86_64 kernels in the 6.x line (checked against
//! `include/linux/fs.h` and `include/linux/blk_types.h`); a mismatched kernel
//! makes these reads fail, which zeroes the affected event fields rather than
//! aborting the probe. Every accessor returns 0 on a null pointer or a failed
//! read.

use aya_ebpf::helpers::bpf_probe_read_kernel;

/// `struct file` -> `f_inode`.
const FILE_F_INODE: usize = 0x20;
/// `struct inode` -> `i_ino`.
const INODE_I_INO: usize = 0x40;
/// `struct bio` -> `bi_bdev`.
const BIO_BI_BDEV: usize = 0x08;
/// `struct bio` -> `bi_iter`.
const BIO_BI_ITER: usize = 0x20;
/// `struct bvec_iter` -> `bi_sector` / `bi_size`.
const BVEC_ITER_SECTOR: usize = 0x00;
const BVEC_ITER_SIZE: usize = 0x08;
/// `struct block_device` -> `bd_dev`.
const BDEV_BD_DEV: usize = 0x24;

#[inline(always)]
fn read_usize(addr: usize) -> usize {
    if addr == 0 {
        return 0;
    }
    unsafe { bpf_probe_read_kernel(addr as *const usize).unwrap_or(0) }
}

#[inline(always)]
fn read_u64(addr: usize) -> u64 {
    if addr == 0 {
        return 0;
    }
    unsafe { bpf_probe_read_kernel(addr as *const u64).unwrap_or(0) }
}

#[inline(always)]
fn read_u32(addr: usize) -> u32 {
    if addr == 0 {
        return 0;
    }
    unsafe { bpf_probe_read_kernel(addr as *const u32).unwrap_or(0) }
}

/// Inode number behind a `struct file *`, 0 if any link is missing.
#[inline(always)]
pub(crate) fn file_inode(file: usize) -> u64 {
    if file == 0 {
        return 0;
    }
    let inode = read_usize(file + FILE_F_INODE);
    inode_ino(inode)
}

/// `i_ino` of a `struct inode *`.
#[inline(always)]
pub(crate) fn inode_ino(inode: usize) -> u64 {
    if inode == 0 {
        return 0;
    }
    read_u64(inode + INODE_I_INO)
}

/// Residual byte size of a bio (`bi_iter.bi_size`).
#[inline(always)]
pub(crate) fn bio_size(bio: usize) -> u32 {
    if bio == 0 {
        return 0;
    }
    read_u32(bio + BIO_BI_ITER + BVEC_ITER_SIZE)
}

/// Starting sector of a bio (`bi_iter.bi_sector`).
#[inline(always)]
pub(crate) fn bio_sector(bio: usize) -> u64 {
    if bio == 0 {
        return 0;
    }
    read_u64(bio + BIO_BI_ITER + BVEC_ITER_SECTOR)
}

/// Packed device number of the bio's block device, 0 when unreachable.
#[inline(always)]
pub(crate) fn bio_dev(bio: usize) -> u32 {
    if bio == 0 {
        return 0;
    }
    let bdev = read_usize(bio + BIO_BI_BDEV);
    if bdev == 0 {
        return 0;
    }
    read_u32(bdev + BDEV_BD_DEV)
}
