//! Allocation bitmap: one bit per allocation block, MSB-first within each
//! byte, stored in the allocation file. The extents-overflow metadata lock
//! covers these operations at the volume layer; here they are plain
//! functions over the block cache and VCB.

use crate::block::{BlockCache, BlockDevice};
use crate::error::{HfsError, Result};
use crate::extents;
use crate::volume::Vcb;

fn bits_per_block(vcb: &Vcb) -> u32 {
    vcb.block_size * 8
}

fn bitmap_block_offset(vcb: &Vcb, bitmap_block: u32) -> Result<u64> {
    let bs = vcb.block_size as u64;
    extents::map_range(
        vcb,
        &vcb.allocation_fork.extents,
        bitmap_block as u64 * bs,
        bs,
    )
}

/// Scan [from, to) for a free run of at least `min` blocks, clipped to `max`.
fn scan_range<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &Vcb,
    from: u32,
    to: u32,
    min: u32,
    max: u32,
) -> Result<Option<(u32, u32)>> {
    let per = bits_per_block(vcb);
    let mut run_start = 0u32;
    let mut run_len = 0u32;
    let mut block = from;

    while block < to {
        let bmp_block = block / per;
        let upto = to.min((bmp_block + 1) * per);
        let off = bitmap_block_offset(vcb, bmp_block)?;
        let buf = dev.read(off, vcb.block_size as usize)?;
        let mut found: Option<(u32, u32)> = None;
        for b in block..upto {
            let rel = b % per;
            let in_use = buf.data()[(rel / 8) as usize] & (0x80 >> (rel % 8)) != 0;
            if in_use {
                if run_len >= min {
                    found = Some((run_start, run_len.min(max)));
                    break;
                }
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = b;
                }
                run_len += 1;
                if run_len >= max {
                    found = Some((run_start, max));
                    break;
                }
            }
        }
        dev.release(buf);
        if found.is_some() {
            return Ok(found);
        }
        block = upto;
    }

    if run_len >= min {
        Ok(Some((run_start, run_len.min(max))))
    } else {
        Ok(None)
    }
}

/// Set or clear `count` bits starting at `start`, verifying current state.
fn set_range<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &Vcb,
    start: u32,
    count: u32,
    set: bool,
) -> Result<()> {
    if start.checked_add(count).map(|e| e > vcb.total_blocks).unwrap_or(true) {
        return Err(HfsError::BadNode(format!(
            "bitmap range {start}+{count} beyond volume"
        )));
    }
    let per = bits_per_block(vcb);
    let mut b = start;
    let end = start + count;
    while b < end {
        let bmp_block = b / per;
        let upto = end.min((bmp_block + 1) * per);
        let off = bitmap_block_offset(vcb, bmp_block)?;
        let mut buf = dev.read(off, vcb.block_size as usize)?;
        let mut bad = false;
        {
            let data = buf.data_mut();
            for bit in b..upto {
                let rel = bit % per;
                let pos = (rel / 8) as usize;
                let mask = 0x80u8 >> (rel % 8);
                let is_set = data[pos] & mask != 0;
                if is_set == set {
                    bad = true;
                    break;
                }
                if set {
                    data[pos] |= mask;
                } else {
                    data[pos] &= !mask;
                }
            }
        }
        if bad {
            dev.release(buf);
            return Err(HfsError::BadNode(format!(
                "allocation bit near block {b} already {}",
                if set { "set" } else { "clear" }
            )));
        }
        dev.write_delayed(buf);
        b = upto;
    }
    Ok(())
}

/// Allocate a contiguous run of at least `min_blocks` (up to `max_blocks`)
/// starting at or after `start_hint`, wrapping once to search from block 0.
pub fn alloc_contig<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &mut Vcb,
    start_hint: u32,
    min_blocks: u32,
    max_blocks: u32,
) -> Result<(u32, u32)> {
    if min_blocks == 0 || min_blocks > max_blocks {
        return Err(HfsError::BadNode("bad allocation request".into()));
    }
    let total = vcb.total_blocks;
    let hint = start_hint.min(total);
    let hit = match scan_range(dev, vcb, hint, total, min_blocks, max_blocks)? {
        Some(r) => Some(r),
        None => {
            log::debug!("allocator wrapped at volume end (hint {hint})");
            scan_range(dev, vcb, 0, hint, min_blocks, max_blocks)?
        }
    };
    let (start, count) = hit.ok_or(HfsError::DiskFull)?;
    set_range(dev, vcb, start, count, true)?;
    vcb.free_blocks = vcb.free_blocks.saturating_sub(count);
    vcb.dirty = true;
    Ok((start, count))
}

/// Allocate using the volume rover as the hint, then advance the rover.
pub fn alloc_any<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &mut Vcb,
    min_blocks: u32,
    max_blocks: u32,
) -> Result<(u32, u32)> {
    let hint = vcb.next_allocation;
    let (start, count) = alloc_contig(dev, vcb, hint, min_blocks, max_blocks)?;
    vcb.next_allocation = start + count;
    Ok((start, count))
}

/// Return a run of blocks to the free pool.
pub fn free_blocks<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &mut Vcb,
    start: u32,
    count: u32,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    set_range(dev, vcb, start, count, false)?;
    vcb.free_blocks += count;
    vcb.dirty = true;
    Ok(())
}

/// Mark a run in use (mount-time initialization paths); the bits must
/// currently be clear.
pub fn mark_used<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &mut Vcb,
    start: u32,
    count: u32,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    set_range(dev, vcb, start, count, true)?;
    vcb.free_blocks = vcb.free_blocks.saturating_sub(count);
    vcb.dirty = true;
    Ok(())
}

/// Count free blocks by scanning the bitmap.
pub fn count_free<D: BlockDevice>(dev: &mut BlockCache<D>, vcb: &Vcb) -> Result<u32> {
    let per = bits_per_block(vcb);
    let total = vcb.total_blocks;
    let mut free = 0u32;
    let mut b = 0u32;
    while b < total {
        let bmp_block = b / per;
        let upto = total.min((bmp_block + 1) * per);
        let off = bitmap_block_offset(vcb, bmp_block)?;
        let buf = dev.read(off, vcb.block_size as usize)?;
        for bit in b..upto {
            let rel = bit % per;
            if buf.data()[(rel / 8) as usize] & (0x80 >> (rel % 8)) == 0 {
                free += 1;
            }
        }
        dev.release(buf);
        b = upto;
    }
    Ok(free)
}

/// Reserve blocks in memory without touching the bitmap (delayed allocation).
pub fn loan(vcb: &mut Vcb, count: u32) -> Result<()> {
    if vcb.free_blocks_advertised() < count {
        return Err(HfsError::DiskFull);
    }
    vcb.loaned_blocks += count;
    vcb.dirty = true;
    Ok(())
}

/// Return unused loaned blocks (truncation of never-materialized space).
pub fn return_loan(vcb: &mut Vcb, count: u32) {
    vcb.loaned_blocks = vcb.loaned_blocks.saturating_sub(count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{ExtentDescriptor, ForkData, MountOptions, VolumeHeader};
    use std::io::Cursor;

    const BS: u32 = 512;

    fn test_vcb(total_blocks: u32) -> (BlockCache<Cursor<Vec<u8>>>, Vcb) {
        let dev_bytes = (total_blocks as usize + 2) * BS as usize;
        let dev = BlockCache::new(Cursor::new(vec![0u8; dev_bytes]));
        let mut header = VolumeHeader {
            signature: crate::volume::HFS_PLUS_SIGNATURE,
            version: crate::volume::HFS_PLUS_VERSION,
            attributes: 0,
            last_mounted_version: 0,
            journal_info_block: 0,
            create_date: 0,
            modify_date: 0,
            backup_date: 0,
            checked_date: 0,
            file_count: 0,
            folder_count: 0,
            block_size: BS,
            total_blocks,
            free_blocks: total_blocks,
            next_allocation: 0,
            rsrc_clump_size: BS,
            data_clump_size: BS,
            next_catalog_id: 16,
            write_count: 0,
            encodings_bitmap: 1,
            finder_info: [0; 8],
            allocation_file: ForkData::default(),
            extents_file: ForkData::default(),
            catalog_file: ForkData::default(),
            attributes_file: ForkData::default(),
            startup_file: ForkData::default(),
        };
        // bitmap file in block 0 (one block covers 4096 bits)
        header.allocation_file.total_blocks = 1;
        header.allocation_file.logical_size = BS as u64;
        header.allocation_file.extents[0] = ExtentDescriptor {
            start_block: 0,
            block_count: 1,
        };
        let vcb = Vcb::from_header(&header, 0, &MountOptions::default());
        (dev, vcb)
    }

    #[test]
    fn alloc_and_free_restore_count() {
        let (mut dev, mut vcb) = test_vcb(1000);
        let before = vcb.free_blocks;
        let (s1, c1) = alloc_any(&mut dev, &mut vcb, 10, 10).unwrap();
        assert_eq!(c1, 10);
        let (s2, c2) = alloc_any(&mut dev, &mut vcb, 5, 5).unwrap();
        assert_eq!(s2, s1 + c1, "rover advances past the first run");
        assert_eq!(vcb.free_blocks, before - 15);
        assert_eq!(count_free(&mut dev, &vcb).unwrap(), vcb.free_blocks);

        free_blocks(&mut dev, &mut vcb, s1, c1).unwrap();
        free_blocks(&mut dev, &mut vcb, s2, c2).unwrap();
        assert_eq!(vcb.free_blocks, before);
        assert_eq!(count_free(&mut dev, &vcb).unwrap(), before);
    }

    #[test]
    fn contig_wraps_to_front() {
        let (mut dev, mut vcb) = test_vcb(100);
        // occupy the tail so a hint near the end is forced to wrap
        mark_used(&mut dev, &mut vcb, 90, 10).unwrap();
        let (s, c) = alloc_contig(&mut dev, &mut vcb, 95, 20, 20).unwrap();
        assert_eq!(s, 0);
        assert_eq!(c, 20);
    }

    #[test]
    fn disk_full_when_no_run() {
        let (mut dev, mut vcb) = test_vcb(64);
        mark_used(&mut dev, &mut vcb, 0, 64).unwrap();
        assert!(matches!(
            alloc_contig(&mut dev, &mut vcb, 0, 1, 1),
            Err(HfsError::DiskFull)
        ));
        // free one block in the middle; a 2-block run still does not exist
        free_blocks(&mut dev, &mut vcb, 31, 1).unwrap();
        assert!(matches!(
            alloc_contig(&mut dev, &mut vcb, 0, 2, 2),
            Err(HfsError::DiskFull)
        ));
        let (s, c) = alloc_contig(&mut dev, &mut vcb, 0, 1, 4).unwrap();
        assert_eq!((s, c), (31, 1));
    }

    #[test]
    fn fragmented_max_clip() {
        let (mut dev, mut vcb) = test_vcb(64);
        mark_used(&mut dev, &mut vcb, 8, 1).unwrap();
        // first free run is blocks 0..8; ask for up to 32
        let (s, c) = alloc_contig(&mut dev, &mut vcb, 0, 4, 32).unwrap();
        assert_eq!((s, c), (0, 8));
    }

    #[test]
    fn double_free_detected() {
        let (mut dev, mut vcb) = test_vcb(64);
        let (s, c) = alloc_any(&mut dev, &mut vcb, 4, 4).unwrap();
        free_blocks(&mut dev, &mut vcb, s, c).unwrap();
        assert!(matches!(
            free_blocks(&mut dev, &mut vcb, s, c),
            Err(HfsError::BadNode(_))
        ));
    }

    #[test]
    fn loans_reduce_advertised_space() {
        let (_dev, mut vcb) = test_vcb(100);
        loan(&mut vcb, 90).unwrap();
        assert_eq!(vcb.free_blocks_advertised(), 10);
        assert!(matches!(loan(&mut vcb, 20), Err(HfsError::DiskFull)));
        return_loan(&mut vcb, 90);
        assert_eq!(vcb.free_blocks_advertised(), 100);
    }
}
