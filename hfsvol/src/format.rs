//! Volume initializer: lays an empty HFS+ (or HFSX) filesystem onto a
//! device. Kept deliberately small — enough for the library's own
//! round-trip guarantees and the companion CLI; exotic layout knobs belong
//! to a real formatter.

use crate::block::BlockDevice;
use crate::btnode::{Node, NODE_KIND_LEAF};
use crate::btree::{
    build_header_node, make_record, BTreeHeader, KeyCompare, BT_BIG_KEYS, BT_VARIABLE_INDEX_KEYS,
};
use crate::catalog::{
    BsdInfo, CatalogKey, CatalogRecord, FolderRecord, ThreadRecord, CNID_FIRST_USER,
    CNID_ROOT_FOLDER, CNID_ROOT_PARENT,
};
use crate::error::{HfsError, Result};
use crate::unicode;
use crate::volume::{
    hfs_now, ExtentDescriptor, ForkData, VolumeHeader, ATTR_UNMOUNTED, HFSX_SIGNATURE,
    HFSX_VERSION, HFS_PLUS_SIGNATURE, HFS_PLUS_VERSION, MOUNT_VERSION, VOLUME_HEADER_OFFSET,
    VOLUME_HEADER_SIZE,
};

pub const DEFAULT_VOLUME_NAME: &str = "untitled";
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Smallest volume the formatter accepts; real tools suggest 32 MB and up
pub const MIN_VOLUME_SIZE: u64 = 4 * 1024 * 1024;

const GIB: u64 = 1024 * 1024 * 1024;

/// Catalog clump sizes by log2(volume in GiB), 1 GiB up (in MiB)
const CATALOG_CLUMP_TABLE: [u32; 8] = [4, 8, 16, 32, 64, 128, 192, 256];
/// Extents-overflow clump sizes, same index (in MiB)
const EXTENTS_CLUMP_TABLE: [u32; 8] = [4, 4, 4, 8, 8, 16, 16, 32];

#[derive(Debug, Clone)]
pub struct FormatParams {
    pub volume_name: String,
    pub block_size: u32,
    /// HFSX: catalog keys compared binary
    pub case_sensitive: bool,
    /// 0 = pick a default from the volume size
    pub catalog_node_size: u32,
    pub extents_node_size: u32,
    /// Format only the first N bytes of the device (0 = whole device)
    pub total_bytes: u64,
}

impl Default for FormatParams {
    fn default() -> Self {
        FormatParams {
            volume_name: DEFAULT_VOLUME_NAME.to_string(),
            block_size: DEFAULT_BLOCK_SIZE,
            case_sensitive: false,
            catalog_node_size: 0,
            extents_node_size: 0,
            total_bytes: 0,
        }
    }
}

fn clump_from_table(vol_bytes: u64, table: &[u32; 8]) -> u32 {
    let idx = (vol_bytes / GIB).max(1).ilog2().min(7) as usize;
    table[idx] * 1024 * 1024
}

/// Preferred growth chunk for a metadata B-tree.
fn btree_clump_size(vol_bytes: u64, node_size: u32, table: &[u32; 8]) -> u32 {
    if vol_bytes < GIB {
        // 0.8% of the volume, at least a few nodes
        let raw = (vol_bytes / 128) as u32;
        let raw = raw - raw % node_size;
        raw.max(node_size * 4)
    } else {
        clump_from_table(vol_bytes, table)
    }
}

fn div_ceil_u64(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}

/// Write an empty volume onto `dev`.
pub fn format<D: BlockDevice>(dev: &mut D, params: &FormatParams) -> Result<()> {
    let dev_size = dev.size()?;
    let size = if params.total_bytes == 0 {
        dev_size
    } else {
        params.total_bytes.min(dev_size)
    };
    if size < MIN_VOLUME_SIZE {
        return Err(HfsError::BadFormat(format!(
            "volume of {size} bytes is below the 4 MB minimum"
        )));
    }
    let bs = params.block_size;
    if !bs.is_power_of_two() || bs < 512 {
        return Err(HfsError::BadFormat(format!(
            "allocation block size {bs} is not a power of two >= 512"
        )));
    }
    if size >= 512 * GIB && size % 4096 != 0 {
        return Err(HfsError::BadFormat(
            "volumes of 512 GB and up must be a multiple of 4 KB".into(),
        ));
    }
    let name_units = unicode::decompose(&unicode::string_to_utf16(&params.volume_name));
    if name_units.is_empty() || name_units.len() > 255 {
        return Err(HfsError::NameTooLong);
    }

    let total_blocks = (size / bs as u64).min(u32::MAX as u64) as u32;
    let bsu = bs as u64;

    let cat_node_size = if params.catalog_node_size != 0 {
        params.catalog_node_size
    } else if size < GIB {
        4096
    } else {
        8192
    };
    let ext_node_size = if params.extents_node_size != 0 {
        params.extents_node_size
    } else {
        4096
    };
    for ns in [cat_node_size, ext_node_size] {
        if !ns.is_power_of_two() || !(512..=32768).contains(&ns) {
            return Err(HfsError::BadFormat(format!("node size {ns} unsupported")));
        }
    }

    // sequential layout: boot blocks + header, bitmap, extents tree,
    // catalog tree, then the alternate header in the last blocks
    let head_blocks = div_ceil_u64(1536, bsu) as u32;
    let bitmap_bytes = div_ceil_u64(total_blocks as u64, 8);
    let bitmap_blocks = div_ceil_u64(bitmap_bytes, bsu) as u32;
    let ext_blocks = div_ceil_u64(ext_node_size as u64, bsu) as u32;
    let cat_blocks = div_ceil_u64(2 * cat_node_size as u64, bsu) as u32;
    let tail_blocks = div_ceil_u64(1024, bsu) as u32;

    let bitmap_start = head_blocks;
    let ext_start = bitmap_start + bitmap_blocks;
    let cat_start = ext_start + ext_blocks;
    let first_free = cat_start + cat_blocks;
    let used_head = first_free;
    if used_head + tail_blocks >= total_blocks {
        return Err(HfsError::BadFormat("volume too small for metadata".into()));
    }

    let now = hfs_now();

    // ── allocation bitmap ───────────────────────────────────────────────
    let mut bitmap = vec![0u8; (bitmap_blocks as u64 * bsu) as usize];
    let bitmap_bits = bitmap.len() as u32 * 8;
    let mut set_bit = |b: u32| {
        bitmap[(b / 8) as usize] |= 0x80 >> (b % 8);
    };
    for b in 0..used_head {
        set_bit(b);
    }
    for b in (total_blocks - tail_blocks)..total_blocks {
        set_bit(b);
    }
    // pad bits past the end of the volume read as in-use
    for b in total_blocks..bitmap_bits {
        set_bit(b);
    }
    dev.write_at(bitmap_start as u64 * bsu, &bitmap)?;

    // ── extents overflow tree: header node only ─────────────────────────
    let ext_total_nodes = (ext_blocks as u64 * bsu / ext_node_size as u64) as u32;
    let ext_header = BTreeHeader {
        tree_depth: 0,
        root_node: 0,
        leaf_records: 0,
        first_leaf_node: 0,
        last_leaf_node: 0,
        node_size: ext_node_size as u16,
        max_key_length: 10,
        total_nodes: ext_total_nodes,
        free_nodes: ext_total_nodes - 1,
        clump_size: btree_clump_size(size, ext_node_size, &EXTENTS_CLUMP_TABLE),
        btree_type: 0,
        key_compare_type: 0,
        attributes: BT_BIG_KEYS,
    };
    let ext_node0 = build_header_node(&ext_header, 1)?;
    dev.write_at(ext_start as u64 * bsu, ext_node0.data())?;

    // ── catalog tree: header node + root leaf ───────────────────────────
    let compare = if params.case_sensitive {
        KeyCompare::Binary
    } else {
        KeyCompare::CaseFold
    };
    let cat_total_nodes = (cat_blocks as u64 * bsu / cat_node_size as u64) as u32;
    let cat_header = BTreeHeader {
        tree_depth: 1,
        root_node: 1,
        leaf_records: 2,
        first_leaf_node: 1,
        last_leaf_node: 1,
        node_size: cat_node_size as u16,
        max_key_length: 516,
        total_nodes: cat_total_nodes,
        free_nodes: cat_total_nodes - 2,
        clump_size: btree_clump_size(size, cat_node_size, &CATALOG_CLUMP_TABLE),
        btree_type: 0,
        key_compare_type: compare.on_disk_type(),
        attributes: BT_BIG_KEYS | BT_VARIABLE_INDEX_KEYS,
    };
    let cat_node0 = build_header_node(&cat_header, 2)?;
    dev.write_at(cat_start as u64 * bsu, cat_node0.data())?;

    let root_folder = FolderRecord {
        flags: 0,
        valence: 0,
        folder_id: CNID_ROOT_FOLDER,
        create_date: now,
        content_mod_date: now,
        attribute_mod_date: now,
        access_date: now,
        backup_date: 0,
        bsd: BsdInfo {
            owner_id: 0,
            group_id: 0,
            admin_flags: 0,
            owner_flags: 0,
            file_mode: 0o040755,
            special: 0,
        },
        user_info: [0; 16],
        finder_info: [0; 16],
        text_encoding: 0,
    };
    let root_key = CatalogKey {
        parent_id: CNID_ROOT_PARENT,
        name: name_units.clone(),
    };
    let thread_key = CatalogKey::thread(CNID_ROOT_FOLDER);
    let thread = CatalogRecord::FolderThread(ThreadRecord {
        parent_id: CNID_ROOT_PARENT,
        name: name_units,
    });

    let mut leaf = Node::new(cat_node_size as usize, NODE_KIND_LEAF, 1);
    leaf.insert_record(
        0,
        &make_record(
            &root_key.encode(),
            &CatalogRecord::Folder(root_folder).encode()?,
        )?,
    )?;
    leaf.insert_record(
        1,
        &make_record(&thread_key.encode(), &thread.encode()?)?,
    )?;
    dev.write_at(cat_start as u64 * bsu + cat_node_size as u64, leaf.data())?;

    // ── volume header ───────────────────────────────────────────────────
    let signature = if params.case_sensitive {
        HFSX_SIGNATURE
    } else {
        HFS_PLUS_SIGNATURE
    };
    let version = if params.case_sensitive {
        HFSX_VERSION
    } else {
        HFS_PLUS_VERSION
    };

    let mut allocation_file = ForkData {
        logical_size: bitmap_blocks as u64 * bsu,
        clump_size: bs,
        total_blocks: bitmap_blocks,
        extents: [ExtentDescriptor::default(); 8],
    };
    allocation_file.extents[0] = ExtentDescriptor {
        start_block: bitmap_start,
        block_count: bitmap_blocks,
    };
    let mut extents_file = ForkData {
        logical_size: ext_blocks as u64 * bsu,
        clump_size: ext_header.clump_size,
        total_blocks: ext_blocks,
        extents: [ExtentDescriptor::default(); 8],
    };
    extents_file.extents[0] = ExtentDescriptor {
        start_block: ext_start,
        block_count: ext_blocks,
    };
    let mut catalog_file = ForkData {
        logical_size: cat_blocks as u64 * bsu,
        clump_size: cat_header.clump_size,
        total_blocks: cat_blocks,
        extents: [ExtentDescriptor::default(); 8],
    };
    catalog_file.extents[0] = ExtentDescriptor {
        start_block: cat_start,
        block_count: cat_blocks,
    };

    let header = VolumeHeader {
        signature,
        version,
        attributes: ATTR_UNMOUNTED,
        last_mounted_version: MOUNT_VERSION,
        journal_info_block: 0,
        create_date: now,
        modify_date: now,
        backup_date: 0,
        checked_date: now,
        file_count: 0,
        folder_count: 0, // the root folder is not counted
        block_size: bs,
        total_blocks,
        free_blocks: total_blocks - used_head - tail_blocks,
        next_allocation: first_free,
        rsrc_clump_size: bs * 16,
        data_clump_size: bs * 16,
        next_catalog_id: CNID_FIRST_USER,
        write_count: 0,
        encodings_bitmap: 1, // MacRoman
        finder_info: [0; 8],
        allocation_file,
        extents_file,
        catalog_file,
        attributes_file: ForkData::default(),
        startup_file: ForkData::default(),
    };

    // boot blocks stay zero; primary header, then the mirror near the end
    dev.write_at(0, &[0u8; VOLUME_HEADER_OFFSET as usize])?;
    let bytes = header.to_bytes()?;
    dev.write_at(VOLUME_HEADER_OFFSET, &bytes)?;
    dev.write_at(
        total_blocks as u64 * bsu - VOLUME_HEADER_OFFSET,
        &bytes,
    )?;
    // keep the very last sector zeroed (reserved)
    dev.write_at(
        total_blocks as u64 * bsu - (VOLUME_HEADER_OFFSET - VOLUME_HEADER_SIZE as u64),
        &vec![0u8; (VOLUME_HEADER_OFFSET as usize) - VOLUME_HEADER_SIZE],
    )?;
    dev.sync()?;

    log::info!(
        "formatted {} ({} blocks of {}, {} free)",
        params.volume_name,
        total_blocks,
        bs,
        header.free_blocks
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn format_writes_sane_header() {
        let mut dev = Cursor::new(vec![0u8; 8 * 1024 * 1024]);
        format(&mut dev, &FormatParams::default()).unwrap();

        let image = dev.into_inner();
        let header = VolumeHeader::parse(&image[1024..1536]).unwrap();
        assert_eq!(header.signature, HFS_PLUS_SIGNATURE);
        assert_eq!(header.block_size, 4096);
        assert_eq!(header.total_blocks, 2048);
        assert!(header.free_blocks > 2000, "metadata must stay small");
        assert_eq!(header.next_catalog_id, CNID_FIRST_USER);
        assert_ne!(header.attributes & ATTR_UNMOUNTED, 0);

        // the mirror matches the primary
        let alt_off = header.total_blocks as usize * 4096 - 1024;
        let alt = VolumeHeader::parse(&image[alt_off..alt_off + 512]).unwrap();
        assert_eq!(alt.to_bytes().unwrap(), header.to_bytes().unwrap());
    }

    #[test]
    fn format_rejects_tiny_volumes() {
        let mut dev = Cursor::new(vec![0u8; 1024 * 1024]);
        assert!(matches!(
            format(&mut dev, &FormatParams::default()),
            Err(HfsError::BadFormat(_))
        ));
    }

    #[test]
    fn clump_sizing_scales() {
        let small = btree_clump_size(100 * 1024 * 1024, 4096, &CATALOG_CLUMP_TABLE);
        assert!(small >= 4 * 4096);
        assert!(small <= 1024 * 1024);
        let big = btree_clump_size(4 * GIB, 8192, &CATALOG_CLUMP_TABLE);
        assert_eq!(big, 16 * 1024 * 1024);
    }
}
