//! Volume-level on-disk structures and in-core volume state.
//!
//! The HFS+ volume header lives at byte 1024 from the start of the volume
//! (sector 2 with 512-byte sectors) with a mirror 1024 bytes before the end.
//! Classic HFS puts a Master Directory Block at the same offset; when it
//! carries an embedded H+ signature the real HFS+ volume starts at
//! `drAlBlSt * 512 + drEmbedExtent.startBlock * drAlBlkSiz`.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::error::{HfsError, Result};

/// Device sector size; allocation-block size is an independent power of two.
pub const SECTOR_SIZE: u64 = 512;

/// Volume header offset from the start of the volume
pub const VOLUME_HEADER_OFFSET: u64 = 1024;

/// Size of the volume header / MDB on disk
pub const VOLUME_HEADER_SIZE: usize = 512;

/// HFS+ signature: "H+" (0x482B)
pub const HFS_PLUS_SIGNATURE: u16 = 0x482B;

/// HFSX signature: "HX" (0x4858) — case-sensitive variant
pub const HFSX_SIGNATURE: u16 = 0x4858;

/// HFS-standard signature: "BD"
pub const HFS_SIGNATURE: u16 = 0x4244;

pub const HFS_PLUS_VERSION: u16 = 4;
pub const HFSX_VERSION: u16 = 5;

/// Value stamped into `lastMountedVersion` by this implementation
pub const MOUNT_VERSION: u32 = 0x31302E30; // "10.0"

/// Volume attribute bits
pub const ATTR_UNMOUNTED: u32 = 1 << 8; // volume was unmounted cleanly
pub const ATTR_SPARED_BLOCKS: u32 = 1 << 9;
pub const ATTR_INCONSISTENT: u32 = 1 << 11; // damage detected at runtime
pub const ATTR_JOURNALED: u32 = 1 << 13;
pub const ATTR_SOFTWARE_LOCK: u32 = 1 << 15;

/// Seconds between 1904-01-01 (HFS epoch) and 1970-01-01 (Unix epoch)
pub const HFS_EPOCH_DELTA: i64 = 2_082_844_800;

/// Current time in HFS representation (seconds since 1904, GMT)
pub fn hfs_now() -> u32 {
    let unix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    unix_to_hfs_time(unix)
}

pub fn unix_to_hfs_time(unix: i64) -> u32 {
    (unix + HFS_EPOCH_DELTA).clamp(0, u32::MAX as i64) as u32
}

pub fn hfs_time_to_unix(hfs: u32) -> i64 {
    hfs as i64 - HFS_EPOCH_DELTA
}

/// An extent descriptor: contiguous range of allocation blocks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

impl ExtentDescriptor {
    pub fn parse<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(ExtentDescriptor {
            start_block: reader.read_u32::<BigEndian>()?,
            block_count: reader.read_u32::<BigEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.start_block)?;
        writer.write_u32::<BigEndian>(self.block_count)?;
        Ok(())
    }
}

/// Fork data: describes a data or resource fork (80 bytes on disk)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForkData {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: [ExtentDescriptor; 8],
}

impl ForkData {
    pub const DISK_SIZE: usize = 80;

    pub fn parse<R: Read>(reader: &mut R) -> Result<Self> {
        let logical_size = reader.read_u64::<BigEndian>()?;
        let clump_size = reader.read_u32::<BigEndian>()?;
        let total_blocks = reader.read_u32::<BigEndian>()?;
        let mut extents = [ExtentDescriptor::default(); 8];
        for extent in &mut extents {
            *extent = ExtentDescriptor::parse(reader)?;
        }
        Ok(ForkData {
            logical_size,
            clump_size,
            total_blocks,
            extents,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u64::<BigEndian>(self.logical_size)?;
        writer.write_u32::<BigEndian>(self.clump_size)?;
        writer.write_u32::<BigEndian>(self.total_blocks)?;
        for extent in &self.extents {
            extent.write_to(writer)?;
        }
        Ok(())
    }

    /// Number of populated inline extent slots
    pub fn extent_count(&self) -> usize {
        self.extents.iter().take_while(|e| e.block_count > 0).count()
    }

    /// Blocks covered by the inline extents alone
    pub fn inline_blocks(&self) -> u32 {
        self.extents.iter().map(|e| e.block_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_blocks == 0
    }
}

/// The HFS+ Volume Header (512 bytes at offset 1024)
#[derive(Debug, Clone)]
pub struct VolumeHeader {
    pub signature: u16,
    pub version: u16,
    pub attributes: u32,
    pub last_mounted_version: u32,
    pub journal_info_block: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    pub checked_date: u32,
    pub file_count: u32,
    pub folder_count: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub next_allocation: u32,
    pub rsrc_clump_size: u32,
    pub data_clump_size: u32,
    pub next_catalog_id: u32,
    pub write_count: u32,
    pub encodings_bitmap: u64,
    pub finder_info: [u32; 8],
    pub allocation_file: ForkData,
    pub extents_file: ForkData,
    pub catalog_file: ForkData,
    pub attributes_file: ForkData,
    pub startup_file: ForkData,
}

impl VolumeHeader {
    /// Parse from a 512-byte buffer taken at the header offset
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < VOLUME_HEADER_SIZE {
            return Err(HfsError::BadFormat("short volume header".into()));
        }
        let mut cursor = Cursor::new(buf);

        let signature = cursor.read_u16::<BigEndian>()?;
        match signature {
            HFS_PLUS_SIGNATURE | HFSX_SIGNATURE => {}
            _ => return Err(HfsError::BadFormat(format!(
                "invalid signature 0x{signature:04X} (expected 0x482B or 0x4858)"
            ))),
        }

        let version = cursor.read_u16::<BigEndian>()?;
        match version {
            HFS_PLUS_VERSION | HFSX_VERSION => {}
            _ => return Err(HfsError::BadFormat(format!("unsupported version {version}"))),
        }

        let attributes = cursor.read_u32::<BigEndian>()?;
        let last_mounted_version = cursor.read_u32::<BigEndian>()?;
        let journal_info_block = cursor.read_u32::<BigEndian>()?;
        let create_date = cursor.read_u32::<BigEndian>()?;
        let modify_date = cursor.read_u32::<BigEndian>()?;
        let backup_date = cursor.read_u32::<BigEndian>()?;
        let checked_date = cursor.read_u32::<BigEndian>()?;
        let file_count = cursor.read_u32::<BigEndian>()?;
        let folder_count = cursor.read_u32::<BigEndian>()?;
        let block_size = cursor.read_u32::<BigEndian>()?;
        let total_blocks = cursor.read_u32::<BigEndian>()?;
        let free_blocks = cursor.read_u32::<BigEndian>()?;
        let next_allocation = cursor.read_u32::<BigEndian>()?;
        let rsrc_clump_size = cursor.read_u32::<BigEndian>()?;
        let data_clump_size = cursor.read_u32::<BigEndian>()?;
        let next_catalog_id = cursor.read_u32::<BigEndian>()?;
        let write_count = cursor.read_u32::<BigEndian>()?;
        let encodings_bitmap = cursor.read_u64::<BigEndian>()?;

        let mut finder_info = [0u32; 8];
        for fi in &mut finder_info {
            *fi = cursor.read_u32::<BigEndian>()?;
        }

        if !block_size.is_power_of_two() || block_size < SECTOR_SIZE as u32 {
            return Err(HfsError::BadFormat(format!(
                "allocation block size {block_size} is not a power of two >= 512"
            )));
        }

        let allocation_file = ForkData::parse(&mut cursor)?;
        let extents_file = ForkData::parse(&mut cursor)?;
        let catalog_file = ForkData::parse(&mut cursor)?;
        let attributes_file = ForkData::parse(&mut cursor)?;
        let startup_file = ForkData::parse(&mut cursor)?;

        Ok(VolumeHeader {
            signature,
            version,
            attributes,
            last_mounted_version,
            journal_info_block,
            create_date,
            modify_date,
            backup_date,
            checked_date,
            file_count,
            folder_count,
            block_size,
            total_blocks,
            free_blocks,
            next_allocation,
            rsrc_clump_size,
            data_clump_size,
            next_catalog_id,
            write_count,
            encodings_bitmap,
            finder_info,
            allocation_file,
            extents_file,
            catalog_file,
            attributes_file,
            startup_file,
        })
    }

    /// Serialize to the 512-byte on-disk form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(VOLUME_HEADER_SIZE);
        buf.write_u16::<BigEndian>(self.signature)?;
        buf.write_u16::<BigEndian>(self.version)?;
        buf.write_u32::<BigEndian>(self.attributes)?;
        buf.write_u32::<BigEndian>(self.last_mounted_version)?;
        buf.write_u32::<BigEndian>(self.journal_info_block)?;
        buf.write_u32::<BigEndian>(self.create_date)?;
        buf.write_u32::<BigEndian>(self.modify_date)?;
        buf.write_u32::<BigEndian>(self.backup_date)?;
        buf.write_u32::<BigEndian>(self.checked_date)?;
        buf.write_u32::<BigEndian>(self.file_count)?;
        buf.write_u32::<BigEndian>(self.folder_count)?;
        buf.write_u32::<BigEndian>(self.block_size)?;
        buf.write_u32::<BigEndian>(self.total_blocks)?;
        buf.write_u32::<BigEndian>(self.free_blocks)?;
        buf.write_u32::<BigEndian>(self.next_allocation)?;
        buf.write_u32::<BigEndian>(self.rsrc_clump_size)?;
        buf.write_u32::<BigEndian>(self.data_clump_size)?;
        buf.write_u32::<BigEndian>(self.next_catalog_id)?;
        buf.write_u32::<BigEndian>(self.write_count)?;
        buf.write_u64::<BigEndian>(self.encodings_bitmap)?;
        for fi in &self.finder_info {
            buf.write_u32::<BigEndian>(*fi)?;
        }
        self.allocation_file.write_to(&mut buf)?;
        self.extents_file.write_to(&mut buf)?;
        self.catalog_file.write_to(&mut buf)?;
        self.attributes_file.write_to(&mut buf)?;
        self.startup_file.write_to(&mut buf)?;
        buf.resize(VOLUME_HEADER_SIZE, 0);
        Ok(buf)
    }

    pub fn is_hfsx(&self) -> bool {
        self.signature == HFSX_SIGNATURE
    }
}

/// The fields of a classic HFS Master Directory Block this driver consumes:
/// enough to identify the volume and locate an embedded HFS+ volume.
#[derive(Debug, Clone)]
pub struct MasterDirectoryBlock {
    pub signature: u16,
    pub create_date: u32,
    pub modify_date: u32,
    pub attributes: u16,
    pub file_count: u16,
    pub total_blocks: u16,
    pub block_size: u32,
    pub alloc_start: u16,
    pub free_blocks: u16,
    pub volume_name: String,
    pub embed_signature: u16,
    pub embed_start_block: u16,
    pub embed_block_count: u16,
}

impl MasterDirectoryBlock {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 130 {
            return Err(HfsError::BadFormat("short master directory block".into()));
        }
        let mut cursor = Cursor::new(buf);
        let signature = cursor.read_u16::<BigEndian>()?;
        if signature != HFS_SIGNATURE {
            return Err(HfsError::BadFormat(format!(
                "invalid MDB signature 0x{signature:04X}"
            )));
        }
        let create_date = cursor.read_u32::<BigEndian>()?;
        let modify_date = cursor.read_u32::<BigEndian>()?;
        let attributes = cursor.read_u16::<BigEndian>()?;
        let file_count = cursor.read_u16::<BigEndian>()?;
        let _vbm_start = cursor.read_u16::<BigEndian>()?;
        let _alloc_ptr = cursor.read_u16::<BigEndian>()?;
        let total_blocks = cursor.read_u16::<BigEndian>()?;
        let block_size = cursor.read_u32::<BigEndian>()?;
        let _clump_size = cursor.read_u32::<BigEndian>()?;
        let alloc_start = cursor.read_u16::<BigEndian>()?;
        let _next_cnid = cursor.read_u32::<BigEndian>()?;
        let free_blocks = cursor.read_u16::<BigEndian>()?;

        let name_len = cursor.read_u8()? as usize;
        let mut name_buf = [0u8; 27];
        cursor.read_exact(&mut name_buf)?;
        let name_len = name_len.min(27);
        let pascal = crate::encodings::Str31::new(&name_buf[..name_len])?;
        let volume_name =
            crate::encodings::hfs_to_utf8(crate::encodings::ENCODING_MACROMAN, &pascal)?;

        // drEmbedSigWord sits at offset 124, drEmbedExtent right after
        let mut cursor = Cursor::new(&buf[124..]);
        let embed_signature = cursor.read_u16::<BigEndian>()?;
        let embed_start_block = cursor.read_u16::<BigEndian>()?;
        let embed_block_count = cursor.read_u16::<BigEndian>()?;

        Ok(MasterDirectoryBlock {
            signature,
            create_date,
            modify_date,
            attributes,
            file_count,
            total_blocks,
            block_size,
            alloc_start,
            free_blocks,
            volume_name,
            embed_signature,
            embed_start_block,
            embed_block_count,
        })
    }

    /// Byte offset of the embedded HFS+ volume, if any.
    pub fn embedded_offset(&self) -> Option<u64> {
        if self.embed_signature != HFS_PLUS_SIGNATURE {
            return None;
        }
        Some(
            self.alloc_start as u64 * SECTOR_SIZE
                + self.embed_start_block as u64 * self.block_size as u64,
        )
    }

    /// Byte length of the embedded HFS+ volume, if any.
    pub fn embedded_size(&self) -> Option<u64> {
        if self.embed_signature != HFS_PLUS_SIGNATURE {
            return None;
        }
        Some(self.embed_block_count as u64 * self.block_size as u64)
    }
}

/// Mount-time options
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub read_only: bool,
    /// Default ownership when the volume does not carry BSD permissions
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mask: Option<u16>,
    /// Default text encoding index for legacy name hints
    pub encoding: u32,
    /// Strip execute bits from files
    pub noxonfiles: bool,
    /// Mount the HFS wrapper itself instead of the embedded HFS+ volume
    pub wrapper: bool,
    /// Ignore a journal even if the volume says it has one
    pub journal_disable: bool,
    /// Candidate names for the hidden hard-link metadata directory.
    /// Empty disables hard-link resolution.
    pub metadata_dir_names: Vec<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            read_only: false,
            uid: None,
            gid: None,
            mask: None,
            encoding: crate::encodings::ENCODING_MACROMAN,
            noxonfiles: false,
            wrapper: false,
            journal_disable: false,
            metadata_dir_names: vec![crate::catalog::HFS_PRIVATE_DIR_NAME.to_string()],
        }
    }
}

/// In-core volume control block: the header's fields plus soft state.
/// Fork records for the catalog/extents/attributes files live with their
/// B-tree objects; the VCB keeps the two forks that have no tree.
#[derive(Debug, Clone)]
pub struct Vcb {
    pub signature: u16,
    pub version: u16,
    pub attributes: u32,
    pub last_mounted_version: u32,
    pub journal_info_block: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    pub checked_date: u32,
    pub file_count: u32,
    pub folder_count: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub next_allocation: u32,
    pub rsrc_clump_size: u32,
    pub data_clump_size: u32,
    pub next_catalog_id: u32,
    pub write_count: u32,
    pub encodings_bitmap: u64,
    pub finder_info: [u32; 8],
    pub allocation_fork: ForkData,
    pub startup_fork: ForkData,

    // soft state
    /// Byte offset of this volume within the device (non-zero for wrappers)
    pub embedded_offset: u64,
    /// Blocks reserved in memory but not yet set in the bitmap
    pub loaned_blocks: u32,
    pub dirty: bool,
    pub damaged: bool,
    pub read_only: bool,
    pub unmounting: bool,
    pub is_hfsx: bool,
    /// Classic HFS volume mounted for identification only
    pub is_standard: bool,
    pub default_encoding: u32,
}

impl Vcb {
    pub fn from_header(header: &VolumeHeader, embedded_offset: u64, opts: &MountOptions) -> Vcb {
        Vcb {
            signature: header.signature,
            version: header.version,
            attributes: header.attributes,
            last_mounted_version: header.last_mounted_version,
            journal_info_block: header.journal_info_block,
            create_date: header.create_date,
            modify_date: header.modify_date,
            backup_date: header.backup_date,
            checked_date: header.checked_date,
            file_count: header.file_count,
            folder_count: header.folder_count,
            block_size: header.block_size,
            total_blocks: header.total_blocks,
            free_blocks: header.free_blocks,
            next_allocation: header.next_allocation,
            rsrc_clump_size: header.rsrc_clump_size,
            data_clump_size: header.data_clump_size,
            next_catalog_id: header.next_catalog_id,
            write_count: header.write_count,
            encodings_bitmap: header.encodings_bitmap,
            finder_info: header.finder_info,
            allocation_fork: header.allocation_file.clone(),
            startup_fork: header.startup_file.clone(),
            embedded_offset,
            loaned_blocks: 0,
            dirty: false,
            damaged: false,
            read_only: opts.read_only,
            unmounting: false,
            is_hfsx: header.is_hfsx(),
            is_standard: false,
            default_encoding: opts.encoding,
        }
    }

    /// Identification-only state for a classic HFS volume.
    pub fn from_mdb(mdb: &MasterDirectoryBlock, opts: &MountOptions) -> Vcb {
        Vcb {
            signature: HFS_SIGNATURE,
            version: 0,
            attributes: mdb.attributes as u32,
            last_mounted_version: 0,
            journal_info_block: 0,
            create_date: mdb.create_date,
            modify_date: mdb.modify_date,
            backup_date: 0,
            checked_date: 0,
            file_count: mdb.file_count as u32,
            folder_count: 0,
            block_size: mdb.block_size,
            total_blocks: mdb.total_blocks as u32,
            free_blocks: mdb.free_blocks as u32,
            next_allocation: 0,
            rsrc_clump_size: 0,
            data_clump_size: 0,
            next_catalog_id: 0,
            write_count: 0,
            encodings_bitmap: 1,
            finder_info: [0; 8],
            allocation_fork: ForkData::default(),
            startup_fork: ForkData::default(),
            embedded_offset: 0,
            loaned_blocks: 0,
            dirty: false,
            damaged: false,
            read_only: true,
            unmounting: false,
            is_hfsx: false,
            is_standard: true,
            default_encoding: opts.encoding,
        }
    }

    /// Rebuild the on-disk header from the VCB plus the tree-owned forks.
    pub fn compose_header(
        &self,
        extents_fork: &ForkData,
        catalog_fork: &ForkData,
        attributes_fork: &ForkData,
    ) -> VolumeHeader {
        VolumeHeader {
            signature: self.signature,
            version: self.version,
            attributes: self.attributes,
            last_mounted_version: self.last_mounted_version,
            journal_info_block: self.journal_info_block,
            create_date: self.create_date,
            modify_date: self.modify_date,
            backup_date: self.backup_date,
            checked_date: self.checked_date,
            file_count: self.file_count,
            folder_count: self.folder_count,
            block_size: self.block_size,
            total_blocks: self.total_blocks,
            free_blocks: self.free_blocks,
            next_allocation: self.next_allocation,
            rsrc_clump_size: self.rsrc_clump_size,
            data_clump_size: self.data_clump_size,
            next_catalog_id: self.next_catalog_id,
            write_count: self.write_count,
            encodings_bitmap: self.encodings_bitmap,
            finder_info: self.finder_info,
            allocation_file: self.allocation_fork.clone(),
            extents_file: extents_fork.clone(),
            catalog_file: catalog_fork.clone(),
            attributes_file: attributes_fork.clone(),
            startup_file: self.startup_fork.clone(),
        }
    }

    /// Device byte offset of an allocation block of this volume
    pub fn block_offset(&self, block: u32) -> u64 {
        self.embedded_offset + block as u64 * self.block_size as u64
    }

    /// Offset of the mirror header near the end of the volume
    pub fn alternate_header_offset(&self) -> u64 {
        self.embedded_offset
            + self.total_blocks as u64 * self.block_size as u64
            - VOLUME_HEADER_OFFSET
    }

    /// Free blocks advertised to callers: loans count as committed.
    pub fn free_blocks_advertised(&self) -> u32 {
        self.free_blocks.saturating_sub(self.loaned_blocks)
    }

    pub fn mark_damaged(&mut self) {
        if !self.damaged {
            log::warn!("volume marked damaged; clean-unmount bit will stay clear");
        }
        self.damaged = true;
        self.attributes |= ATTR_INCONSISTENT;
    }

    /// Fail mutating operations before they start.
    pub fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(HfsError::ReadOnly);
        }
        if self.damaged {
            return Err(HfsError::Damaged);
        }
        if self.unmounting {
            return Err(HfsError::PermissionDenied);
        }
        if self.is_standard {
            return Err(HfsError::Unsupported("HFS-standard volumes are read-only"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> VolumeHeader {
        let mut h = VolumeHeader {
            signature: HFS_PLUS_SIGNATURE,
            version: HFS_PLUS_VERSION,
            attributes: ATTR_UNMOUNTED,
            last_mounted_version: MOUNT_VERSION,
            journal_info_block: 0,
            create_date: 0xD000_0000,
            modify_date: 0xD000_0001,
            backup_date: 0,
            checked_date: 0xD000_0002,
            file_count: 3,
            folder_count: 1,
            block_size: 4096,
            total_blocks: 25600,
            free_blocks: 25590,
            next_allocation: 10,
            rsrc_clump_size: 65536,
            data_clump_size: 65536,
            next_catalog_id: 16,
            write_count: 7,
            encodings_bitmap: 1,
            finder_info: [0; 8],
            allocation_file: ForkData::default(),
            extents_file: ForkData::default(),
            catalog_file: ForkData::default(),
            attributes_file: ForkData::default(),
            startup_file: ForkData::default(),
        };
        h.catalog_file.logical_size = 8192;
        h.catalog_file.total_blocks = 2;
        h.catalog_file.extents[0] = ExtentDescriptor { start_block: 4, block_count: 2 };
        h
    }

    #[test]
    fn header_roundtrip() {
        let header = sample_header();
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), VOLUME_HEADER_SIZE);

        let parsed = VolumeHeader::parse(&bytes).unwrap();
        let bytes2 = parsed.to_bytes().unwrap();
        assert_eq!(bytes, bytes2, "swap to disk then back must be identity");
        assert_eq!(parsed.total_blocks, 25600);
        assert_eq!(parsed.catalog_file.extents[0].start_block, 4);
    }

    #[test]
    fn rejects_bad_signature() {
        let mut bytes = sample_header().to_bytes().unwrap();
        bytes[0] = 0x12;
        bytes[1] = 0x34;
        assert!(matches!(
            VolumeHeader::parse(&bytes),
            Err(HfsError::BadFormat(_))
        ));
    }

    #[test]
    fn rejects_bad_block_size() {
        let mut h = sample_header();
        h.block_size = 3000;
        let bytes = h.to_bytes().unwrap();
        assert!(matches!(
            VolumeHeader::parse(&bytes),
            Err(HfsError::BadFormat(_))
        ));
    }

    #[test]
    fn wrapper_offset_math() {
        // drAlBlSt=100 sectors, embed extent starts at block 2, 8 KB blocks:
        // offset = 100*512 + 2*8192 = 67584
        let mdb = MasterDirectoryBlock {
            signature: HFS_SIGNATURE,
            create_date: 0,
            modify_date: 0,
            attributes: 0,
            file_count: 0,
            total_blocks: 100,
            block_size: 8192,
            alloc_start: 100,
            free_blocks: 10,
            volume_name: "old disk".into(),
            embed_signature: HFS_PLUS_SIGNATURE,
            embed_start_block: 2,
            embed_block_count: 50,
        };
        assert_eq!(mdb.embedded_offset(), Some(67_584));
        assert_eq!(mdb.embedded_size(), Some(50 * 8192));
    }

    #[test]
    fn hfs_dates() {
        assert_eq!(hfs_time_to_unix(2_082_844_800), 0);
        assert_eq!(unix_to_hfs_time(0), 2_082_844_800);
        let now = hfs_now();
        assert!(now > 3_500_000_000, "we live after 2014 in HFS time");
    }
}
