//! The catalog: the name <-> record store layered on a B-tree.
//!
//! Three key shapes share the tree: folder/file records keyed by
//! (parentID, name) and thread records keyed by (cnid, empty name) pointing
//! back at the parent. Hard links are catalog files whose Finder type/creator
//! are "hlnk"/"hfs+" and whose BSD `special` field carries the indirect
//! inode number; the inodes themselves live in a hidden folder under the
//! root.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::block::{BlockCache, BlockDevice};
use crate::btree::{BTree, BTreeIter};
use crate::error::{HfsError, Result};
use crate::unicode;
use crate::volume::{hfs_now, ForkData, Vcb};
use crate::{DirEntry, EntryKind};

/// Well-known Catalog Node IDs
pub const CNID_ROOT_PARENT: u32 = 1;
pub const CNID_ROOT_FOLDER: u32 = 2;
pub const CNID_EXTENTS_FILE: u32 = 3;
pub const CNID_CATALOG_FILE: u32 = 4;
pub const CNID_BAD_BLOCKS_FILE: u32 = 5;
pub const CNID_ALLOCATION_FILE: u32 = 6;
pub const CNID_STARTUP_FILE: u32 = 7;
pub const CNID_ATTRIBUTES_FILE: u32 = 8;
pub const CNID_FIRST_USER: u32 = 16;

/// Catalog record types
pub const RECORD_TYPE_FOLDER: u16 = 0x0001;
pub const RECORD_TYPE_FILE: u16 = 0x0002;
pub const RECORD_TYPE_FOLDER_THREAD: u16 = 0x0003;
pub const RECORD_TYPE_FILE_THREAD: u16 = 0x0004;

/// File record flag: a thread record exists for this file
pub const FILE_FLAG_THREAD_EXISTS: u16 = 0x0002;

pub const FOLDER_RECORD_SIZE: usize = 88;
pub const FILE_RECORD_SIZE: usize = 248;

/// Longest catalog name in UTF-16 units
pub const MAX_NAME_LENGTH: usize = 255;

/// Finder type/creator marking a hard-link file
pub const HARDLINK_TYPE: [u8; 4] = *b"hlnk";
pub const HARDLINK_CREATOR: [u8; 4] = *b"hfs+";

/// Hidden folder under the root that holds hard-link indirect inodes
pub const HFS_PRIVATE_DIR_NAME: &str = "\0\0\0\0HFS+ Private Data";

/// Finder "invisible" flag bit inside folder user info
const FINDER_FLAG_INVISIBLE: u16 = 0x4000;

pub fn inode_name(inode_num: u32) -> String {
    format!("iNode{inode_num}")
}

/// Catalog key: (parentID, decomposed UTF-16 name)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogKey {
    pub parent_id: u32,
    pub name: Vec<u16>,
}

impl CatalogKey {
    pub fn new(parent_id: u32, name: &str) -> Result<CatalogKey> {
        let units = unicode::decompose(&unicode::string_to_utf16(name));
        if units.len() > MAX_NAME_LENGTH {
            return Err(HfsError::NameTooLong);
        }
        Ok(CatalogKey {
            parent_id,
            name: units,
        })
    }

    pub fn thread(cnid: u32) -> CatalogKey {
        CatalogKey {
            parent_id: cnid,
            name: Vec::new(),
        }
    }

    /// Key payload without the u16 key-length prefix
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(6 + self.name.len() * 2);
        buf.extend_from_slice(&self.parent_id.to_be_bytes());
        buf.extend_from_slice(&(self.name.len() as u16).to_be_bytes());
        buf.extend_from_slice(&unicode::u16_to_utf16be(&self.name));
        buf
    }

    pub fn parse(key: &[u8]) -> Result<CatalogKey> {
        if key.len() < 6 {
            return Err(HfsError::BadNode("catalog key too short".into()));
        }
        let parent_id = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
        let name_len = u16::from_be_bytes([key[4], key[5]]) as usize;
        if 6 + name_len * 2 > key.len() {
            return Err(HfsError::BadNode("catalog key name overruns key".into()));
        }
        Ok(CatalogKey {
            parent_id,
            name: unicode::utf16be_to_u16(&key[6..6 + name_len * 2]),
        })
    }

    pub fn name_string(&self) -> String {
        unicode::utf16_to_string(&self.name)
    }
}

/// BSD-style permissions block (16 bytes on disk). `special` is a union:
/// device for device nodes, indirect-inode number for hard links, link
/// count for the indirect inode itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BsdInfo {
    pub owner_id: u32,
    pub group_id: u32,
    pub admin_flags: u8,
    pub owner_flags: u8,
    pub file_mode: u16,
    pub special: u32,
}

impl BsdInfo {
    fn parse<R: Read>(reader: &mut R) -> Result<BsdInfo> {
        Ok(BsdInfo {
            owner_id: reader.read_u32::<BigEndian>()?,
            group_id: reader.read_u32::<BigEndian>()?,
            admin_flags: reader.read_u8()?,
            owner_flags: reader.read_u8()?,
            file_mode: reader.read_u16::<BigEndian>()?,
            special: reader.read_u32::<BigEndian>()?,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.owner_id)?;
        writer.write_u32::<BigEndian>(self.group_id)?;
        writer.write_u8(self.admin_flags)?;
        writer.write_u8(self.owner_flags)?;
        writer.write_u16::<BigEndian>(self.file_mode)?;
        writer.write_u32::<BigEndian>(self.special)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderRecord {
    pub flags: u16,
    pub valence: u32,
    pub folder_id: u32,
    pub create_date: u32,
    pub content_mod_date: u32,
    pub attribute_mod_date: u32,
    pub access_date: u32,
    pub backup_date: u32,
    pub bsd: BsdInfo,
    pub user_info: [u8; 16],
    pub finder_info: [u8; 16],
    pub text_encoding: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub flags: u16,
    pub file_id: u32,
    pub create_date: u32,
    pub content_mod_date: u32,
    pub attribute_mod_date: u32,
    pub access_date: u32,
    pub backup_date: u32,
    pub bsd: BsdInfo,
    pub user_info: [u8; 16],
    pub finder_info: [u8; 16],
    pub text_encoding: u32,
    pub data_fork: ForkData,
    pub resource_fork: ForkData,
}

impl FileRecord {
    pub fn is_hardlink(&self) -> bool {
        self.user_info[0..4] == HARDLINK_TYPE && self.user_info[4..8] == HARDLINK_CREATOR
    }

    /// Indirect-inode number of a hard-link file
    pub fn link_reference(&self) -> u32 {
        self.bsd.special
    }

    pub fn kind(&self) -> EntryKind {
        if self.bsd.file_mode & 0o170000 == 0o120000 {
            EntryKind::Symlink
        } else {
            EntryKind::File
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub parent_id: u32,
    pub name: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogRecord {
    Folder(FolderRecord),
    File(FileRecord),
    FolderThread(ThreadRecord),
    FileThread(ThreadRecord),
}

impl CatalogRecord {
    pub fn parse(payload: &[u8]) -> Result<CatalogRecord> {
        if payload.len() < 2 {
            return Err(HfsError::BadNode("catalog record too short".into()));
        }
        let record_type = u16::from_be_bytes([payload[0], payload[1]]);
        let mut cursor = Cursor::new(payload);
        cursor.set_position(2);

        match record_type {
            RECORD_TYPE_FOLDER => {
                let flags = cursor.read_u16::<BigEndian>()?;
                let valence = cursor.read_u32::<BigEndian>()?;
                let folder_id = cursor.read_u32::<BigEndian>()?;
                let create_date = cursor.read_u32::<BigEndian>()?;
                let content_mod_date = cursor.read_u32::<BigEndian>()?;
                let attribute_mod_date = cursor.read_u32::<BigEndian>()?;
                let access_date = cursor.read_u32::<BigEndian>()?;
                let backup_date = cursor.read_u32::<BigEndian>()?;
                let bsd = BsdInfo::parse(&mut cursor)?;
                let mut user_info = [0u8; 16];
                cursor.read_exact(&mut user_info)?;
                let mut finder_info = [0u8; 16];
                cursor.read_exact(&mut finder_info)?;
                let text_encoding = cursor.read_u32::<BigEndian>()?;
                Ok(CatalogRecord::Folder(FolderRecord {
                    flags,
                    valence,
                    folder_id,
                    create_date,
                    content_mod_date,
                    attribute_mod_date,
                    access_date,
                    backup_date,
                    bsd,
                    user_info,
                    finder_info,
                    text_encoding,
                }))
            }
            RECORD_TYPE_FILE => {
                let flags = cursor.read_u16::<BigEndian>()?;
                let _reserved1 = cursor.read_u32::<BigEndian>()?;
                let file_id = cursor.read_u32::<BigEndian>()?;
                let create_date = cursor.read_u32::<BigEndian>()?;
                let content_mod_date = cursor.read_u32::<BigEndian>()?;
                let attribute_mod_date = cursor.read_u32::<BigEndian>()?;
                let access_date = cursor.read_u32::<BigEndian>()?;
                let backup_date = cursor.read_u32::<BigEndian>()?;
                let bsd = BsdInfo::parse(&mut cursor)?;
                let mut user_info = [0u8; 16];
                cursor.read_exact(&mut user_info)?;
                let mut finder_info = [0u8; 16];
                cursor.read_exact(&mut finder_info)?;
                let text_encoding = cursor.read_u32::<BigEndian>()?;
                let _reserved2 = cursor.read_u32::<BigEndian>()?;
                let data_fork = ForkData::parse(&mut cursor)?;
                let resource_fork = ForkData::parse(&mut cursor)?;
                Ok(CatalogRecord::File(FileRecord {
                    flags,
                    file_id,
                    create_date,
                    content_mod_date,
                    attribute_mod_date,
                    access_date,
                    backup_date,
                    bsd,
                    user_info,
                    finder_info,
                    text_encoding,
                    data_fork,
                    resource_fork,
                }))
            }
            RECORD_TYPE_FOLDER_THREAD | RECORD_TYPE_FILE_THREAD => {
                let _reserved = cursor.read_u16::<BigEndian>()?;
                let parent_id = cursor.read_u32::<BigEndian>()?;
                let name_len = cursor.read_u16::<BigEndian>()? as usize;
                let mut name_buf = vec![0u8; name_len * 2];
                cursor.read_exact(&mut name_buf)?;
                let record = ThreadRecord {
                    parent_id,
                    name: unicode::utf16be_to_u16(&name_buf),
                };
                if record_type == RECORD_TYPE_FOLDER_THREAD {
                    Ok(CatalogRecord::FolderThread(record))
                } else {
                    Ok(CatalogRecord::FileThread(record))
                }
            }
            other => Err(HfsError::BadNode(format!(
                "unknown catalog record type 0x{other:04X}"
            ))),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            CatalogRecord::Folder(f) => {
                buf.write_u16::<BigEndian>(RECORD_TYPE_FOLDER)?;
                buf.write_u16::<BigEndian>(f.flags)?;
                buf.write_u32::<BigEndian>(f.valence)?;
                buf.write_u32::<BigEndian>(f.folder_id)?;
                buf.write_u32::<BigEndian>(f.create_date)?;
                buf.write_u32::<BigEndian>(f.content_mod_date)?;
                buf.write_u32::<BigEndian>(f.attribute_mod_date)?;
                buf.write_u32::<BigEndian>(f.access_date)?;
                buf.write_u32::<BigEndian>(f.backup_date)?;
                f.bsd.write_to(&mut buf)?;
                buf.extend_from_slice(&f.user_info);
                buf.extend_from_slice(&f.finder_info);
                buf.write_u32::<BigEndian>(f.text_encoding)?;
                buf.write_u32::<BigEndian>(0)?; // reserved
                debug_assert_eq!(buf.len(), FOLDER_RECORD_SIZE);
            }
            CatalogRecord::File(f) => {
                buf.write_u16::<BigEndian>(RECORD_TYPE_FILE)?;
                buf.write_u16::<BigEndian>(f.flags)?;
                buf.write_u32::<BigEndian>(0)?; // reserved
                buf.write_u32::<BigEndian>(f.file_id)?;
                buf.write_u32::<BigEndian>(f.create_date)?;
                buf.write_u32::<BigEndian>(f.content_mod_date)?;
                buf.write_u32::<BigEndian>(f.attribute_mod_date)?;
                buf.write_u32::<BigEndian>(f.access_date)?;
                buf.write_u32::<BigEndian>(f.backup_date)?;
                f.bsd.write_to(&mut buf)?;
                buf.extend_from_slice(&f.user_info);
                buf.extend_from_slice(&f.finder_info);
                buf.write_u32::<BigEndian>(f.text_encoding)?;
                buf.write_u32::<BigEndian>(0)?; // reserved
                f.data_fork.write_to(&mut buf)?;
                f.resource_fork.write_to(&mut buf)?;
                debug_assert_eq!(buf.len(), FILE_RECORD_SIZE);
            }
            CatalogRecord::FolderThread(t) | CatalogRecord::FileThread(t) => {
                let record_type = match self {
                    CatalogRecord::FolderThread(_) => RECORD_TYPE_FOLDER_THREAD,
                    _ => RECORD_TYPE_FILE_THREAD,
                };
                buf.write_u16::<BigEndian>(record_type)?;
                buf.write_u16::<BigEndian>(0)?; // reserved
                buf.write_u32::<BigEndian>(t.parent_id)?;
                buf.write_u16::<BigEndian>(t.name.len() as u16)?;
                buf.extend_from_slice(&unicode::u16_to_utf16be(&t.name));
            }
        }
        Ok(buf)
    }
}

// ── directory-traversal hint cache ───────────────────────────────────────

const DIR_HINT_CAPACITY: usize = 16;

/// Small per-folder LRU mapping a readdir offset to a leaf position so a
/// resumed enumeration starts in O(1). Invalidated whenever the folder
/// changes; never persisted.
#[derive(Debug, Default, Clone)]
pub struct DirHints {
    entries: Vec<(u32, BTreeIter)>,
}

impl DirHints {
    pub fn new() -> DirHints {
        DirHints::default()
    }

    pub fn get(&mut self, offset: u32) -> Option<BTreeIter> {
        if let Some(pos) = self.entries.iter().position(|(o, _)| *o == offset) {
            let hit = self.entries.remove(pos);
            let it = hit.1;
            self.entries.insert(0, hit);
            Some(it)
        } else {
            None
        }
    }

    pub fn put(&mut self, offset: u32, it: BTreeIter) {
        self.entries.retain(|(o, _)| *o != offset);
        self.entries.insert(0, (offset, it));
        self.entries.truncate(DIR_HINT_CAPACITY);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ── lookups ──────────────────────────────────────────────────────────────

pub fn lookup<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &Vcb,
    cat: &BTree,
    parent: u32,
    name: &str,
) -> Result<Option<CatalogRecord>> {
    let key = CatalogKey::new(parent, name)?.encode();
    match cat.lookup(dev, vcb, &key)? {
        Some(payload) => Ok(Some(CatalogRecord::parse(&payload)?)),
        None => Ok(None),
    }
}

pub fn lookup_thread<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &Vcb,
    cat: &BTree,
    cnid: u32,
) -> Result<Option<CatalogRecord>> {
    let key = CatalogKey::thread(cnid).encode();
    match cat.lookup(dev, vcb, &key)? {
        Some(payload) => Ok(Some(CatalogRecord::parse(&payload)?)),
        None => Ok(None),
    }
}

/// Reverse lookup: cnid -> (key, record) via the thread record.
pub fn lookup_by_cnid<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &Vcb,
    cat: &BTree,
    cnid: u32,
) -> Result<Option<(CatalogKey, CatalogRecord)>> {
    let thread = match lookup_thread(dev, vcb, cat, cnid)? {
        Some(CatalogRecord::FolderThread(t)) | Some(CatalogRecord::FileThread(t)) => t,
        Some(_) => return Err(HfsError::BadNode("thread key holds non-thread".into())),
        None => return Ok(None),
    };
    let key = CatalogKey {
        parent_id: thread.parent_id,
        name: thread.name,
    };
    match cat.lookup(dev, vcb, &key.encode())? {
        Some(payload) => Ok(Some((key, CatalogRecord::parse(&payload)?))),
        None => Err(HfsError::BadNode(format!(
            "cnid {cnid}: thread points at a missing record"
        ))),
    }
}

/// Resolve a hard link to its indirect inode, searching the candidate
/// hidden directories. Zero candidates (or no match) disables resolution.
pub fn resolve_hardlink<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &Vcb,
    cat: &BTree,
    metadata_dirs: &[String],
    link: &FileRecord,
) -> Result<Option<FileRecord>> {
    if !link.is_hardlink() {
        return Ok(None);
    }
    let name = inode_name(link.link_reference());
    for dir in metadata_dirs {
        if let Some(CatalogRecord::Folder(private)) =
            lookup(dev, vcb, cat, CNID_ROOT_FOLDER, dir)?
        {
            if let Some(CatalogRecord::File(inode)) =
                lookup(dev, vcb, cat, private.folder_id, &name)?
            {
                return Ok(Some(inode));
            }
        }
    }
    Ok(None)
}

// ── mutation ─────────────────────────────────────────────────────────────

/// Next free CNID; monotonically increasing, with a wraparound scan from
/// the first user id when the counter is exhausted.
fn allocate_cnid<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &mut Vcb,
    cat: &BTree,
) -> Result<u32> {
    if vcb.next_catalog_id < u32::MAX {
        let id = vcb.next_catalog_id;
        vcb.next_catalog_id += 1;
        vcb.dirty = true;
        return Ok(id);
    }
    for id in CNID_FIRST_USER..u32::MAX {
        if lookup_thread(dev, vcb, cat, id)?.is_none() {
            return Ok(id);
        }
    }
    Err(HfsError::DiskFull)
}

/// Bump a folder's valence and content-mod date.
fn adjust_valence<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &mut Vcb,
    cat: &mut BTree,
    ext: &mut BTree,
    folder_id: u32,
    delta: i32,
) -> Result<()> {
    let (key, record) = lookup_by_cnid(dev, vcb, cat, folder_id)?
        .ok_or_else(|| HfsError::BadNode(format!("folder {folder_id} has no thread")))?;
    let mut folder = match record {
        CatalogRecord::Folder(f) => f,
        _ => return Err(HfsError::NotADirectory(format!("cnid {folder_id}"))),
    };
    folder.valence = (folder.valence as i64 + delta as i64).max(0) as u32;
    folder.content_mod_date = hfs_now();
    cat.replace(
        dev,
        vcb,
        Some(ext),
        &key.encode(),
        &CatalogRecord::Folder(folder).encode()?,
    )
}

fn require_folder<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &Vcb,
    cat: &BTree,
    cnid: u32,
) -> Result<()> {
    match lookup_thread(dev, vcb, cat, cnid)? {
        Some(CatalogRecord::FolderThread(_)) => Ok(()),
        Some(_) => Err(HfsError::NotADirectory(format!("cnid {cnid}"))),
        None => Err(HfsError::NotFound(format!("cnid {cnid}"))),
    }
}

/// Attributes for newly created items
#[derive(Debug, Clone, Copy)]
pub struct NewItem {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub encoding: u32,
}

/// Insert a fully formed file record plus its thread, updating the parent
/// valence and volume counts. Shared by create and hard-link paths.
fn insert_file<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &mut Vcb,
    cat: &mut BTree,
    ext: &mut BTree,
    parent: u32,
    name: &str,
    record: FileRecord,
) -> Result<()> {
    let key = CatalogKey::new(parent, name)?;
    let cnid = record.file_id;
    cat.insert(
        dev,
        vcb,
        Some(ext),
        &key.encode(),
        &CatalogRecord::File(record).encode()?,
    )?;
    let thread = CatalogRecord::FileThread(ThreadRecord {
        parent_id: parent,
        name: key.name.clone(),
    });
    if let Err(e) = cat.insert(
        dev,
        vcb,
        Some(ext),
        &CatalogKey::thread(cnid).encode(),
        &thread.encode()?,
    ) {
        // roll the half-created entry back out
        let _ = cat.delete(dev, vcb, &key.encode());
        return Err(e);
    }
    adjust_valence(dev, vcb, cat, ext, parent, 1)?;
    vcb.file_count += 1;
    vcb.dirty = true;
    Ok(())
}

/// Create an empty file. Returns the new CNID and its record.
pub fn create_file<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &mut Vcb,
    cat: &mut BTree,
    ext: &mut BTree,
    parent: u32,
    name: &str,
    attrs: &NewItem,
) -> Result<FileRecord> {
    require_folder(dev, vcb, cat, parent)?;
    if lookup(dev, vcb, cat, parent, name)?.is_some() {
        return Err(HfsError::Exists(name.to_string()));
    }
    let cnid = allocate_cnid(dev, vcb, cat)?;
    let now = hfs_now();
    let record = FileRecord {
        flags: FILE_FLAG_THREAD_EXISTS,
        file_id: cnid,
        create_date: now,
        content_mod_date: now,
        attribute_mod_date: now,
        access_date: now,
        backup_date: 0,
        bsd: BsdInfo {
            owner_id: attrs.uid,
            group_id: attrs.gid,
            admin_flags: 0,
            owner_flags: 0,
            file_mode: attrs.mode,
            special: 0,
        },
        user_info: [0; 16],
        finder_info: [0; 16],
        text_encoding: attrs.encoding,
        data_fork: ForkData::default(),
        resource_fork: ForkData::default(),
    };
    insert_file(dev, vcb, cat, ext, parent, name, record.clone())?;
    vcb.encodings_bitmap |= crate::encodings::encoding_bit(attrs.encoding);
    Ok(record)
}

/// Create a folder. Returns the new CNID and its record.
pub fn create_folder<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &mut Vcb,
    cat: &mut BTree,
    ext: &mut BTree,
    parent: u32,
    name: &str,
    attrs: &NewItem,
) -> Result<FolderRecord> {
    require_folder(dev, vcb, cat, parent)?;
    if lookup(dev, vcb, cat, parent, name)?.is_some() {
        return Err(HfsError::Exists(name.to_string()));
    }
    let key = CatalogKey::new(parent, name)?;
    let cnid = allocate_cnid(dev, vcb, cat)?;
    let now = hfs_now();
    let record = FolderRecord {
        flags: 0,
        valence: 0,
        folder_id: cnid,
        create_date: now,
        content_mod_date: now,
        attribute_mod_date: now,
        access_date: now,
        backup_date: 0,
        bsd: BsdInfo {
            owner_id: attrs.uid,
            group_id: attrs.gid,
            admin_flags: 0,
            owner_flags: 0,
            file_mode: attrs.mode,
            special: 0,
        },
        user_info: [0; 16],
        finder_info: [0; 16],
        text_encoding: attrs.encoding,
    };
    cat.insert(
        dev,
        vcb,
        Some(ext),
        &key.encode(),
        &CatalogRecord::Folder(record.clone()).encode()?,
    )?;
    let thread = CatalogRecord::FolderThread(ThreadRecord {
        parent_id: parent,
        name: key.name.clone(),
    });
    if let Err(e) = cat.insert(
        dev,
        vcb,
        Some(ext),
        &CatalogKey::thread(cnid).encode(),
        &thread.encode()?,
    ) {
        let _ = cat.delete(dev, vcb, &key.encode());
        return Err(e);
    }
    adjust_valence(dev, vcb, cat, ext, parent, 1)?;
    vcb.folder_count += 1;
    vcb.encodings_bitmap |= crate::encodings::encoding_bit(attrs.encoding);
    vcb.dirty = true;
    Ok(record)
}

/// Remove a name and its thread. Folders must be empty; the caller has
/// already released any fork storage for files.
pub fn delete<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &mut Vcb,
    cat: &mut BTree,
    ext: &mut BTree,
    parent: u32,
    name: &str,
) -> Result<()> {
    let record = lookup(dev, vcb, cat, parent, name)?
        .ok_or_else(|| HfsError::NotFound(name.to_string()))?;
    let cnid = match &record {
        CatalogRecord::Folder(f) => {
            if f.folder_id == CNID_ROOT_FOLDER {
                return Err(HfsError::PermissionDenied);
            }
            if f.valence > 0 {
                return Err(HfsError::NotEmpty(name.to_string()));
            }
            f.folder_id
        }
        CatalogRecord::File(f) => f.file_id,
        _ => return Err(HfsError::BadNode("thread record under a name key".into())),
    };
    let key = CatalogKey::new(parent, name)?;
    cat.delete(dev, vcb, &key.encode())?;
    if let Err(e) = cat.delete(dev, vcb, &CatalogKey::thread(cnid).encode()) {
        // files always carry threads here; tolerate their absence on
        // foreign volumes
        if !matches!(e, HfsError::NotFound(_)) {
            return Err(e);
        }
    }
    adjust_valence(dev, vcb, cat, ext, parent, -1)?;
    match record {
        CatalogRecord::Folder(_) => vcb.folder_count = vcb.folder_count.saturating_sub(1),
        _ => vcb.file_count = vcb.file_count.saturating_sub(1),
    }
    vcb.dirty = true;
    Ok(())
}

/// Move/rename within the catalog. Collisions are refused; cross-parent
/// moves update both valences.
#[allow(clippy::too_many_arguments)]
pub fn rename<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &mut Vcb,
    cat: &mut BTree,
    ext: &mut BTree,
    src_parent: u32,
    src_name: &str,
    dst_parent: u32,
    dst_name: &str,
) -> Result<()> {
    let record = lookup(dev, vcb, cat, src_parent, src_name)?
        .ok_or_else(|| HfsError::NotFound(src_name.to_string()))?;
    if lookup(dev, vcb, cat, dst_parent, dst_name)?.is_some() {
        return Err(HfsError::Exists(dst_name.to_string()));
    }
    require_folder(dev, vcb, cat, dst_parent)?;

    let cnid = match &record {
        CatalogRecord::Folder(f) => f.folder_id,
        CatalogRecord::File(f) => f.file_id,
        _ => return Err(HfsError::BadNode("thread record under a name key".into())),
    };
    let src_key = CatalogKey::new(src_parent, src_name)?;
    let dst_key = CatalogKey::new(dst_parent, dst_name)?;

    cat.insert(dev, vcb, Some(ext), &dst_key.encode(), &record.encode()?)?;
    cat.delete(dev, vcb, &src_key.encode())?;

    // rewrite the thread to point at the new (parent, name)
    let thread = match &record {
        CatalogRecord::Folder(_) => CatalogRecord::FolderThread(ThreadRecord {
            parent_id: dst_parent,
            name: dst_key.name.clone(),
        }),
        _ => CatalogRecord::FileThread(ThreadRecord {
            parent_id: dst_parent,
            name: dst_key.name.clone(),
        }),
    };
    cat.replace(
        dev,
        vcb,
        Some(ext),
        &CatalogKey::thread(cnid).encode(),
        &thread.encode()?,
    )?;

    if src_parent != dst_parent {
        adjust_valence(dev, vcb, cat, ext, src_parent, -1)?;
        adjust_valence(dev, vcb, cat, ext, dst_parent, 1)?;
    } else {
        // same-parent rename still touches the folder's mod date
        adjust_valence(dev, vcb, cat, ext, src_parent, 0)?;
    }
    vcb.dirty = true;
    Ok(())
}

/// Overwrite an existing record in place (fork sizes, dates, permissions).
pub fn update<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &mut Vcb,
    cat: &mut BTree,
    ext: &mut BTree,
    parent: u32,
    name: &str,
    record: &CatalogRecord,
) -> Result<()> {
    let key = CatalogKey::new(parent, name)?;
    cat.replace(dev, vcb, Some(ext), &key.encode(), &record.encode()?)
}

// ── directory enumeration ────────────────────────────────────────────────

/// Should this entry stay hidden from enumeration? (the hard-link
/// metadata directory under the root)
fn is_private_entry(parent: u32, name: &str, metadata_dirs: &[String]) -> bool {
    parent == CNID_ROOT_FOLDER && metadata_dirs.iter().any(|d| d == name)
}

/// Cursor-based directory enumeration in key order. `start_offset` counts
/// previously emitted entries; the per-folder hint cache makes resumption
/// O(1) when nothing changed in between.
#[allow(clippy::too_many_arguments)]
pub fn get_dirents<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &Vcb,
    cat: &BTree,
    metadata_dirs: &[String],
    parent: u32,
    start_offset: u32,
    max: usize,
    mut hints: Option<&mut DirHints>,
) -> Result<(Vec<DirEntry>, bool)> {
    let mut entries = Vec::new();
    let mut eof = true;

    // resume from a hint when one matches, else descend for (parent, "").
    // A hint is speculative: the record under it must still belong to this
    // directory or the enumeration restarts from the top.
    let mut offset = 0u32;
    let hinted = hints.as_mut().and_then(|h| h.get(start_offset)).and_then(|hinted| {
        let mut probe = hinted;
        match cat.iter_next(dev, vcb, &mut probe) {
            Ok(Some((kbytes, _))) => match CatalogKey::parse(&kbytes) {
                Ok(k) if k.parent_id == parent => Some(hinted),
                _ => None,
            },
            _ => None,
        }
    });
    let mut it = match hinted {
        Some(hinted) => {
            offset = start_offset;
            hinted
        }
        None => cat.iter_seek_ge(dev, vcb, &CatalogKey::thread(parent).encode())?,
    };

    while let Some((kbytes, payload)) = cat.iter_next(dev, vcb, &mut it)? {
        let key = CatalogKey::parse(&kbytes)?;
        if key.parent_id != parent {
            break;
        }
        let record = CatalogRecord::parse(&payload)?;
        let entry = match record {
            CatalogRecord::Folder(f) => DirEntry {
                name: key.name_string(),
                cnid: f.folder_id,
                kind: EntryKind::Directory,
                size: 0,
                create_date: f.create_date,
                modify_date: f.content_mod_date,
            },
            CatalogRecord::File(f) => DirEntry {
                name: key.name_string(),
                cnid: f.file_id,
                kind: f.kind(),
                size: f.data_fork.logical_size,
                create_date: f.create_date,
                modify_date: f.content_mod_date,
            },
            // thread records are positional noise in enumeration
            CatalogRecord::FolderThread(_) | CatalogRecord::FileThread(_) => continue,
        };
        if is_private_entry(parent, &entry.name, metadata_dirs) {
            continue;
        }
        if offset < start_offset {
            offset += 1;
            continue;
        }
        entries.push(entry);
        offset += 1;
        if entries.len() >= max {
            // more may follow: remember where to resume
            eof = false;
            if let Some(h) = hints.as_mut() {
                h.put(offset, it);
            }
            break;
        }
    }

    Ok((entries, eof))
}

// ── hard links ───────────────────────────────────────────────────────────

/// Find or create the hidden metadata directory.
pub fn ensure_private_dir<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &mut Vcb,
    cat: &mut BTree,
    ext: &mut BTree,
    metadata_dirs: &[String],
) -> Result<u32> {
    for name in metadata_dirs {
        if let Some(CatalogRecord::Folder(f)) = lookup(dev, vcb, cat, CNID_ROOT_FOLDER, name)? {
            return Ok(f.folder_id);
        }
    }
    let name = metadata_dirs
        .first()
        .ok_or(HfsError::Unsupported("hard links disabled by mount options"))?;
    let mut record = create_folder(
        dev,
        vcb,
        cat,
        ext,
        CNID_ROOT_FOLDER,
        name,
        &NewItem {
            mode: 0o040755,
            uid: 0,
            gid: 0,
            encoding: vcb.default_encoding,
        },
    )?;
    // keep Finder from showing it
    record.user_info[8..10].copy_from_slice(&FINDER_FLAG_INVISIBLE.to_be_bytes());
    update(
        dev,
        vcb,
        cat,
        ext,
        CNID_ROOT_FOLDER,
        name,
        &CatalogRecord::Folder(record.clone()),
    )?;
    log::info!("created hard-link metadata directory (cnid {})", record.folder_id);
    Ok(record.folder_id)
}

/// Build the catalog record for a new link file pointing at `inode_num`.
fn link_record(cnid: u32, inode_num: u32, template: &FileRecord) -> FileRecord {
    let now = hfs_now();
    let mut user_info = [0u8; 16];
    user_info[0..4].copy_from_slice(&HARDLINK_TYPE);
    user_info[4..8].copy_from_slice(&HARDLINK_CREATOR);
    FileRecord {
        flags: FILE_FLAG_THREAD_EXISTS,
        file_id: cnid,
        create_date: now,
        content_mod_date: now,
        attribute_mod_date: now,
        access_date: now,
        backup_date: 0,
        bsd: BsdInfo {
            owner_id: template.bsd.owner_id,
            group_id: template.bsd.group_id,
            admin_flags: 0,
            owner_flags: 0,
            file_mode: template.bsd.file_mode,
            special: inode_num,
        },
        user_info,
        finder_info: [0; 16],
        text_encoding: template.text_encoding,
        data_fork: ForkData::default(),
        resource_fork: ForkData::default(),
    }
}

/// Create a hard link `link_parent/link_name` to the file at
/// `target_parent/target_name`. On the first link the target is migrated
/// into the metadata directory as an indirect inode and replaced by a link
/// file under its own name.
#[allow(clippy::too_many_arguments)]
pub fn create_link<D: BlockDevice>(
    dev: &mut BlockCache<D>,
    vcb: &mut Vcb,
    cat: &mut BTree,
    ext: &mut BTree,
    metadata_dirs: &[String],
    target_parent: u32,
    target_name: &str,
    link_parent: u32,
    link_name: &str,
) -> Result<()> {
    let record = lookup(dev, vcb, cat, target_parent, target_name)?
        .ok_or_else(|| HfsError::NotFound(target_name.to_string()))?;
    let target = match record {
        CatalogRecord::File(f) => f,
        CatalogRecord::Folder(_) => {
            return Err(HfsError::Unsupported("hard links to directories"))
        }
        _ => return Err(HfsError::BadNode("thread record under a name key".into())),
    };
    if lookup(dev, vcb, cat, link_parent, link_name)?.is_some() {
        return Err(HfsError::Exists(link_name.to_string()));
    }
    let private_dir = ensure_private_dir(dev, vcb, cat, ext, metadata_dirs)?;

    let inode_num;
    if target.is_hardlink() {
        // one more link to an existing inode
        inode_num = target.link_reference();
        let name = inode_name(inode_num);
        let mut inode = match lookup(dev, vcb, cat, private_dir, &name)? {
            Some(CatalogRecord::File(f)) => f,
            _ => return Err(HfsError::BadNode(format!("indirect inode {inode_num} missing"))),
        };
        inode.bsd.special += 1; // link count
        update(
            dev,
            vcb,
            cat,
            ext,
            private_dir,
            &name,
            &CatalogRecord::File(inode),
        )?;
    } else {
        // first link: migrate the target into the metadata directory
        inode_num = target.file_id;
        let iname = inode_name(inode_num);
        rename(
            dev, vcb, cat, ext, target_parent, target_name, private_dir, &iname,
        )?;
        let mut inode = target.clone();
        inode.bsd.special = 2; // the original name plus the new link
        update(
            dev,
            vcb,
            cat,
            ext,
            private_dir,
            &iname,
            &CatalogRecord::File(inode),
        )?;
        // a link file takes the target's old place
        let cnid = allocate_cnid(dev, vcb, cat)?;
        insert_file(
            dev,
            vcb,
            cat,
            ext,
            target_parent,
            target_name,
            link_record(cnid, inode_num, &target),
        )?;
    }

    let cnid = allocate_cnid(dev, vcb, cat)?;
    insert_file(
        dev,
        vcb,
        cat,
        ext,
        link_parent,
        link_name,
        link_record(cnid, inode_num, &target),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_key_roundtrip() {
        let key = CatalogKey::new(2, "Hello Wörld").unwrap();
        let bytes = key.encode();
        let parsed = CatalogKey::parse(&bytes).unwrap();
        assert_eq!(parsed, key);
        // ö is stored decomposed
        assert!(key.name.contains(&0x0308));
    }

    #[test]
    fn folder_record_roundtrip() {
        let rec = CatalogRecord::Folder(FolderRecord {
            flags: 0,
            valence: 3,
            folder_id: 42,
            create_date: 1,
            content_mod_date: 2,
            attribute_mod_date: 3,
            access_date: 4,
            backup_date: 5,
            bsd: BsdInfo {
                owner_id: 501,
                group_id: 20,
                admin_flags: 0,
                owner_flags: 0,
                file_mode: 0o040755,
                special: 0,
            },
            user_info: [0xAA; 16],
            finder_info: [0xBB; 16],
            text_encoding: 0,
        });
        let bytes = rec.encode().unwrap();
        assert_eq!(bytes.len(), FOLDER_RECORD_SIZE);
        assert_eq!(CatalogRecord::parse(&bytes).unwrap(), rec);
    }

    #[test]
    fn file_record_roundtrip() {
        let mut rec = FileRecord {
            flags: FILE_FLAG_THREAD_EXISTS,
            file_id: 77,
            create_date: 10,
            content_mod_date: 20,
            attribute_mod_date: 30,
            access_date: 40,
            backup_date: 0,
            bsd: BsdInfo {
                owner_id: 0,
                group_id: 0,
                admin_flags: 0,
                owner_flags: 0,
                file_mode: 0o100644,
                special: 0,
            },
            user_info: [0; 16],
            finder_info: [0; 16],
            text_encoding: 0,
            data_fork: ForkData::default(),
            resource_fork: ForkData::default(),
        };
        rec.data_fork.logical_size = 1234;
        rec.data_fork.total_blocks = 1;
        rec.data_fork.extents[0] = crate::volume::ExtentDescriptor {
            start_block: 99,
            block_count: 1,
        };
        let wrapped = CatalogRecord::File(rec.clone());
        let bytes = wrapped.encode().unwrap();
        assert_eq!(bytes.len(), FILE_RECORD_SIZE);
        assert_eq!(CatalogRecord::parse(&bytes).unwrap(), wrapped);
        assert!(!rec.is_hardlink());
    }

    #[test]
    fn thread_record_roundtrip() {
        let rec = CatalogRecord::FileThread(ThreadRecord {
            parent_id: 2,
            name: unicode::string_to_utf16("hello"),
        });
        let bytes = rec.encode().unwrap();
        assert_eq!(CatalogRecord::parse(&bytes).unwrap(), rec);
    }

    #[test]
    fn hardlink_detection() {
        let mut user_info = [0u8; 16];
        user_info[0..4].copy_from_slice(&HARDLINK_TYPE);
        user_info[4..8].copy_from_slice(&HARDLINK_CREATOR);
        let rec = FileRecord {
            flags: 0,
            file_id: 20,
            create_date: 0,
            content_mod_date: 0,
            attribute_mod_date: 0,
            access_date: 0,
            backup_date: 0,
            bsd: BsdInfo {
                owner_id: 0,
                group_id: 0,
                admin_flags: 0,
                owner_flags: 0,
                file_mode: 0o100644,
                special: 19,
            },
            user_info,
            finder_info: [0; 16],
            text_encoding: 0,
            data_fork: ForkData::default(),
            resource_fork: ForkData::default(),
        };
        assert!(rec.is_hardlink());
        assert_eq!(rec.link_reference(), 19);
        assert_eq!(inode_name(19), "iNode19");
    }

    #[test]
    fn dir_hints_lru() {
        let mut hints = DirHints::new();
        for i in 0..20u32 {
            hints.put(i, BTreeIter { node: i, index: 0 });
        }
        assert_eq!(hints.entries.len(), DIR_HINT_CAPACITY);
        // oldest entries fell out
        assert!(hints.get(0).is_none());
        assert_eq!(hints.get(19).map(|it| it.node), Some(19));
        hints.clear();
        assert!(hints.get(19).is_none());
    }
}
