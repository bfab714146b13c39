//! Extent manager: maps logical fork blocks to disk extents using the eight
//! inline descriptors in each fork record plus the extents-overflow B-tree
//! for fragmented files, and grows/shrinks forks against the allocation
//! bitmap.

use byteorder::{BigEndian, WriteBytesExt};

use crate::bitmap;
use crate::block::{BlockCache, BlockDevice};
use crate::btree::BTree;
use crate::error::{HfsError, Result};
use crate::volume::{ExtentDescriptor, ForkData, Vcb};

pub const FORK_TYPE_DATA: u8 = 0x00;
pub const FORK_TYPE_RESOURCE: u8 = 0xFF;

/// Payload length of an extents-overflow key (after the u16 key length)
pub const EXTENT_KEY_LENGTH: usize = 10;

/// An extents-overflow record is always eight descriptors
pub const EXTENT_RECORD_SIZE: usize = 64;

/// Key into the extents-overflow tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentKey {
    pub fork_type: u8,
    pub file_id: u32,
    pub start_block: u32,
}

impl ExtentKey {
    pub fn encode(&self) -> Vec<u8> {
        let mut k = Vec::with_capacity(EXTENT_KEY_LENGTH);
        k.push(self.fork_type);
        k.push(0); // pad
        k.extend_from_slice(&self.file_id.to_be_bytes());
        k.extend_from_slice(&self.start_block.to_be_bytes());
        k
    }

    pub fn parse(key: &[u8]) -> Result<ExtentKey> {
        if key.len() < EXTENT_KEY_LENGTH {
            return Err(HfsError::BadNode("extent key too short".into()));
        }
        Ok(ExtentKey {
            fork_type: key[0],
            file_id: u32::from_be_bytes([key[2], key[3], key[4], key[5]]),
            start_block: u32::from_be_bytes([key[6], key[7], key[8], key[9]]),
        })
    }
}

pub fn parse_extent_record(payload: &[u8]) -> Result<[ExtentDescriptor; 8]> {
    if payload.len() < EXTENT_RECORD_SIZE {
        return Err(HfsError::BadNode("extent record too short".into()));
    }
    let mut extents = [ExtentDescriptor::default(); 8];
    for (i, e) in extents.iter_mut().enumerate() {
        let o = i * 8;
        e.start_block =
            u32::from_be_bytes([payload[o], payload[o + 1], payload[o + 2], payload[o + 3]]);
        e.block_count = u32::from_be_bytes([
            payload[o + 4],
            payload[o + 5],
            payload[o + 6],
            payload[o + 7],
        ]);
    }
    Ok(extents)
}

pub fn encode_extent_record(extents: &[ExtentDescriptor; 8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(EXTENT_RECORD_SIZE);
    for e in extents {
        buf.write_u32::<BigEndian>(e.start_block).unwrap();
        buf.write_u32::<BigEndian>(e.block_count).unwrap();
    }
    buf
}

/// Absolute device offset for a byte range of a fork. The range must not
/// straddle an extent boundary (callers read and write in aligned units).
pub fn map_range(
    vcb: &Vcb,
    extents: &[ExtentDescriptor],
    offset: u64,
    len: u64,
) -> Result<u64> {
    let bs = vcb.block_size as u64;
    let mut remaining = offset;
    for e in extents {
        if e.block_count == 0 {
            break;
        }
        let extent_bytes = e.block_count as u64 * bs;
        if remaining < extent_bytes {
            if remaining + len > extent_bytes {
                return Err(HfsError::BadNode(format!(
                    "range {offset}+{len} straddles an extent boundary"
                )));
            }
            return Ok(vcb.embedded_offset + e.start_block as u64 * bs + remaining);
        }
        remaining -= extent_bytes;
    }
    Err(HfsError::BadNode(format!(
        "fork offset {offset} beyond mapped extents"
    )))
}

/// Map a logical fork block to (physical block, contiguous blocks remaining).
/// `None` means the block lies past the mapped extents (a hole or past EOF).
pub fn map_block(extents: &[ExtentDescriptor], logical: u32) -> Option<(u32, u32)> {
    let mut base = 0u32;
    for e in extents {
        if e.block_count == 0 {
            break;
        }
        if logical < base + e.block_count {
            let within = logical - base;
            return Some((e.start_block + within, e.block_count - within));
        }
        base += e.block_count;
    }
    None
}

/// Load the full flattened extent list for a fork: inline descriptors plus
/// every overflow record from the extents tree.
pub fn load_extent_map<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &Vcb,
    extents_tree: &BTree,
    file_id: u32,
    fork_type: u8,
    fork: &ForkData,
) -> Result<Vec<ExtentDescriptor>> {
    let mut map: Vec<ExtentDescriptor> = fork
        .extents
        .iter()
        .copied()
        .take_while(|e| e.block_count > 0)
        .collect();
    let mut covered: u32 = map.iter().map(|e| e.block_count).sum();

    while covered < fork.total_blocks {
        let key = ExtentKey {
            fork_type,
            file_id,
            start_block: covered,
        }
        .encode();
        let (k, payload) = extents_tree
            .search_le(dev, vcb, &key)?
            .ok_or_else(|| HfsError::BadNode(format!(
                "file {file_id}: no overflow record at block {covered}"
            )))?;
        let ek = ExtentKey::parse(&k)?;
        if ek.file_id != file_id || ek.fork_type != fork_type || ek.start_block != covered {
            return Err(HfsError::BadNode(format!(
                "file {file_id}: overflow record at block {covered} missing"
            )));
        }
        let descs = parse_extent_record(&payload)?;
        let before = covered;
        for d in descs.iter().take_while(|d| d.block_count > 0) {
            map.push(*d);
            covered += d.block_count;
        }
        if covered == before {
            return Err(HfsError::BadNode(format!(
                "file {file_id}: empty overflow record at block {covered}"
            )));
        }
    }
    Ok(map)
}

/// Policy knobs for `extend_fork`
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtendFlags {
    /// Satisfy the whole request with a single run or fail
    pub contig: bool,
    /// All requested blocks or none
    pub all_or_nothing: bool,
    /// Do not round the request up to the clump size
    pub no_clump_round: bool,
    /// May dip into the 2% reserve at the end of the volume
    pub privileged: bool,
    /// Loan blocks only; the bitmap is untouched until materialization
    pub defer: bool,
    /// Granted runs are trimmed to a multiple of this many blocks
    /// (B-tree node alignment); 0 or 1 disables
    pub run_multiple: u32,
}

fn round_up(n: u32, multiple: u32) -> u32 {
    if multiple <= 1 {
        n
    } else {
        n.div_ceil(multiple) * multiple
    }
}

fn reborrow_tree<'a>(o: &'a mut Option<&mut BTree>) -> Option<&'a mut BTree> {
    o.as_mut().map(|t| &mut **t)
}

fn reborrow_map<'a>(
    o: &'a mut Option<&mut Vec<ExtentDescriptor>>,
) -> Option<&'a mut Vec<ExtentDescriptor>> {
    o.as_mut().map(|m| &mut **m)
}

/// Grow a fork by at least `bytes_requested` (subject to flags).
/// Returns the number of bytes actually added. The caller owns
/// `fork.logical_size`; only block allocation changes here.
///
/// On a mid-commit failure the fork keeps the extents already appended; the
/// caller sees the error and recovers by truncating.
#[allow(clippy::too_many_arguments)]
pub fn extend_fork<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &mut Vcb,
    mut overflow: Option<&mut BTree>,
    file_id: u32,
    fork_type: u8,
    fork: &mut ForkData,
    mut extent_map: Option<&mut Vec<ExtentDescriptor>>,
    bytes_requested: u64,
    flags: ExtendFlags,
) -> Result<u64> {
    if bytes_requested == 0 {
        return Ok(0);
    }
    let bs = vcb.block_size as u64;
    let mult = flags.run_multiple.max(1);
    let need = round_up(bytes_requested.div_ceil(bs) as u32, mult);
    let want = if flags.no_clump_round {
        need
    } else {
        let clump_bytes = if fork.clump_size > 0 {
            fork.clump_size
        } else {
            vcb.data_clump_size
        }
        .max(vcb.block_size);
        let clump_blocks = round_up((clump_bytes as u64 / bs).max(1) as u32, mult);
        round_up(need, clump_blocks)
    };

    let reserve = if flags.privileged {
        0
    } else {
        vcb.total_blocks / 50
    };
    let avail = vcb
        .free_blocks
        .saturating_sub(vcb.loaned_blocks)
        .saturating_sub(reserve);

    if flags.defer {
        if avail < need {
            return Err(HfsError::DiskFull);
        }
        vcb.loaned_blocks += need;
        vcb.dirty = true;
        return Ok(need as u64 * bs);
    }
    if avail == 0 {
        return Err(HfsError::DiskFull);
    }

    // Gather runs first; nothing is committed to the fork until all
    // allocation has succeeded, so failure only has bitmap state to undo.
    let mut runs: Vec<(u32, u32)> = Vec::new();
    let mut got = 0u32;
    while got < need {
        let ask_max = want - got;
        let ask_min = if flags.contig { need } else { mult };
        match bitmap::alloc_any(dev, vcb, ask_min, ask_max) {
            Ok((start, granted)) => {
                let kept = granted - granted % mult;
                if kept < granted {
                    bitmap::free_blocks(dev, vcb, start + kept, granted - kept)?;
                }
                if kept == 0 {
                    break;
                }
                runs.push((start, kept));
                got += kept;
                if flags.contig {
                    break;
                }
            }
            Err(HfsError::DiskFull) => break,
            Err(e) => {
                for (s, c) in &runs {
                    bitmap::free_blocks(dev, vcb, *s, *c)?;
                }
                return Err(e);
            }
        }
    }

    if got < need && (flags.all_or_nothing || flags.contig) {
        for (s, c) in &runs {
            bitmap::free_blocks(dev, vcb, *s, *c)?;
        }
        return Err(HfsError::DiskFull);
    }
    if got == 0 {
        return Err(HfsError::DiskFull);
    }

    let mut added = 0u64;
    for (start, count) in runs {
        append_extent(
            dev,
            vcb,
            reborrow_tree(&mut overflow),
            file_id,
            fork_type,
            fork,
            reborrow_map(&mut extent_map),
            ExtentDescriptor {
                start_block: start,
                block_count: count,
            },
        )?;
        added += count as u64 * bs;
    }
    vcb.dirty = true;
    Ok(added)
}

/// Append one allocated extent to a fork: merge with the tail when adjacent,
/// fill the next inline slot, or append to the overflow tree.
#[allow(clippy::too_many_arguments)]
fn append_extent<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &mut Vcb,
    overflow: Option<&mut BTree>,
    file_id: u32,
    fork_type: u8,
    fork: &mut ForkData,
    extent_map: Option<&mut Vec<ExtentDescriptor>>,
    new: ExtentDescriptor,
) -> Result<()> {
    let logical_start = fork.total_blocks;
    let all_inline = fork.inline_blocks() == fork.total_blocks;

    let mut placed = false;
    if all_inline {
        let count = fork.extent_count();
        if count > 0 {
            let last = &mut fork.extents[count - 1];
            if last.start_block + last.block_count == new.start_block {
                last.block_count += new.block_count;
                placed = true;
            }
        }
        if !placed && count < 8 {
            fork.extents[count] = new;
            placed = true;
        }
    }

    if !placed {
        let tree = overflow.ok_or(HfsError::DiskFull)?;
        let probe = ExtentKey {
            fork_type,
            file_id,
            start_block: u32::MAX,
        }
        .encode();
        let tail = tree.search_le(dev, vcb, &probe)?.and_then(|(k, payload)| {
            match ExtentKey::parse(&k) {
                Ok(ek) if ek.file_id == file_id && ek.fork_type == fork_type => {
                    Some((k, payload))
                }
                _ => None,
            }
        });
        match tail {
            Some((k, payload)) => {
                let mut descs = parse_extent_record(&payload)?;
                let used = descs.iter().take_while(|d| d.block_count > 0).count();
                let last = used.saturating_sub(1);
                if used > 0
                    && descs[last].start_block + descs[last].block_count == new.start_block
                {
                    descs[last].block_count += new.block_count;
                    tree.replace(dev, vcb, None, &k, &encode_extent_record(&descs))?;
                } else if used < 8 {
                    descs[used] = new;
                    tree.replace(dev, vcb, None, &k, &encode_extent_record(&descs))?;
                } else {
                    let mut descs = [ExtentDescriptor::default(); 8];
                    descs[0] = new;
                    let key = ExtentKey {
                        fork_type,
                        file_id,
                        start_block: logical_start,
                    }
                    .encode();
                    tree.insert(dev, vcb, None, &key, &encode_extent_record(&descs))?;
                }
            }
            None => {
                let mut descs = [ExtentDescriptor::default(); 8];
                descs[0] = new;
                let key = ExtentKey {
                    fork_type,
                    file_id,
                    start_block: logical_start,
                }
                .encode();
                tree.insert(dev, vcb, None, &key, &encode_extent_record(&descs))?;
            }
        }
    }

    fork.total_blocks += new.block_count;

    if let Some(map) = extent_map {
        if let Some(tail) = map.last_mut() {
            if tail.start_block + tail.block_count == new.start_block {
                tail.block_count += new.block_count;
            } else {
                map.push(new);
            }
        } else {
            map.push(new);
        }
    }
    Ok(())
}

/// Shrink a fork to `new_size` bytes, returning freed blocks to the bitmap.
/// Leaves `fork.total_blocks * block_size >= new_size`.
#[allow(clippy::too_many_arguments)]
pub fn truncate_fork<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &mut Vcb,
    overflow: Option<&mut BTree>,
    file_id: u32,
    fork_type: u8,
    fork: &mut ForkData,
    extent_map: Option<&mut Vec<ExtentDescriptor>>,
    new_size: u64,
) -> Result<()> {
    let bs = vcb.block_size as u64;
    let new_blocks = (new_size.div_ceil(bs)).min(u32::MAX as u64) as u32;
    if new_blocks >= fork.total_blocks {
        fork.logical_size = new_size;
        return Ok(());
    }

    let inline_blocks = fork.inline_blocks();

    // overflow records first, tail to head
    if fork.total_blocks > inline_blocks {
        let tree = overflow.ok_or_else(|| {
            HfsError::BadNode(format!("file {file_id} has overflow extents but no tree"))
        })?;
        let floor = new_blocks.max(inline_blocks);
        while fork.total_blocks > floor {
            let probe = ExtentKey {
                fork_type,
                file_id,
                start_block: u32::MAX,
            }
            .encode();
            let (k, payload) = tree.search_le(dev, vcb, &probe)?.ok_or_else(|| {
                HfsError::BadNode(format!("file {file_id}: overflow record vanished"))
            })?;
            let ek = ExtentKey::parse(&k)?;
            if ek.file_id != file_id || ek.fork_type != fork_type {
                return Err(HfsError::BadNode(format!(
                    "file {file_id}: overflow record vanished"
                )));
            }
            let mut descs = parse_extent_record(&payload)?;

            if ek.start_block >= new_blocks {
                for d in descs.iter().take_while(|d| d.block_count > 0) {
                    bitmap::free_blocks(dev, vcb, d.start_block, d.block_count)?;
                    fork.total_blocks -= d.block_count;
                }
                tree.delete(dev, vcb, &k)?;
            } else {
                let mut pos = ek.start_block;
                let mut changed = false;
                for d in descs.iter_mut() {
                    if d.block_count == 0 {
                        break;
                    }
                    let end = pos + d.block_count;
                    if pos >= new_blocks {
                        bitmap::free_blocks(dev, vcb, d.start_block, d.block_count)?;
                        fork.total_blocks -= d.block_count;
                        *d = ExtentDescriptor::default();
                        changed = true;
                    } else if end > new_blocks {
                        let keep = new_blocks - pos;
                        bitmap::free_blocks(
                            dev,
                            vcb,
                            d.start_block + keep,
                            d.block_count - keep,
                        )?;
                        fork.total_blocks -= d.block_count - keep;
                        d.block_count = keep;
                        changed = true;
                    }
                    pos = end;
                }
                if changed {
                    tree.replace(dev, vcb, None, &k, &encode_extent_record(&descs))?;
                }
                break;
            }
        }
    }

    // then the inline descriptors
    if new_blocks < fork.inline_blocks() {
        let mut pos = 0u32;
        for slot in fork.extents.iter_mut() {
            if slot.block_count == 0 {
                break;
            }
            let end = pos + slot.block_count;
            if pos >= new_blocks {
                bitmap::free_blocks(dev, vcb, slot.start_block, slot.block_count)?;
                fork.total_blocks -= slot.block_count;
                *slot = ExtentDescriptor::default();
            } else if end > new_blocks {
                let keep = new_blocks - pos;
                bitmap::free_blocks(dev, vcb, slot.start_block + keep, slot.block_count - keep)?;
                fork.total_blocks -= slot.block_count - keep;
                slot.block_count = keep;
            }
            pos = end;
        }
    }

    fork.logical_size = new_size;

    if let Some(map) = extent_map {
        let mut covered = 0u32;
        map.retain_mut(|e| {
            if covered >= new_blocks {
                return false;
            }
            if covered + e.block_count > new_blocks {
                e.block_count = new_blocks - covered;
            }
            covered += e.block_count;
            true
        });
    }

    vcb.dirty = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(start: u32, count: u32) -> ExtentDescriptor {
        ExtentDescriptor {
            start_block: start,
            block_count: count,
        }
    }

    #[test]
    fn extent_key_roundtrip() {
        let k = ExtentKey {
            fork_type: FORK_TYPE_RESOURCE,
            file_id: 0xDEAD_BEEF,
            start_block: 42,
        };
        let bytes = k.encode();
        assert_eq!(bytes.len(), EXTENT_KEY_LENGTH);
        assert_eq!(ExtentKey::parse(&bytes).unwrap(), k);
    }

    #[test]
    fn extent_record_roundtrip() {
        let mut descs = [ExtentDescriptor::default(); 8];
        descs[0] = ext(10, 5);
        descs[1] = ext(100, 1);
        let bytes = encode_extent_record(&descs);
        assert_eq!(bytes.len(), EXTENT_RECORD_SIZE);
        assert_eq!(parse_extent_record(&bytes).unwrap(), descs);
    }

    #[test]
    fn map_block_walks_extents() {
        let list = vec![ext(100, 4), ext(300, 2)];
        assert_eq!(map_block(&list, 0), Some((100, 4)));
        assert_eq!(map_block(&list, 3), Some((103, 1)));
        assert_eq!(map_block(&list, 4), Some((300, 2)));
        assert_eq!(map_block(&list, 5), Some((301, 1)));
        assert_eq!(map_block(&list, 6), None, "past the mapped extents");
    }
}
