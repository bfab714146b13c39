//! Read/write HFS+ / HFSX volume engine.
//!
//! The library owns the on-disk data structures of an HFS+ volume — the
//! volume header, allocation bitmap, extent records, and the B-trees holding
//! the catalog and overflow extents — and exposes a filesystem-shaped API
//! over any `Read + Write + Seek` device:
//!
//! ```no_run
//! use hfsvol::{format, FormatParams, MountOptions, Volume};
//!
//! let mut file = std::fs::OpenOptions::new()
//!     .read(true)
//!     .write(true)
//!     .open("disk.img")?;
//! format(&mut file, &FormatParams::default())?;
//! let mut vol = Volume::mount(file, MountOptions::default())?;
//! vol.create_dir("/Projects")?;
//! let h = vol.create_file("/Projects/notes.txt")?;
//! vol.write(&h, 0, b"hello")?;
//! vol.close(h)?;
//! vol.unmount()?;
//! # Ok::<(), hfsvol::HfsError>(())
//! ```
//!
//! Classic HFS volumes are recognized: a wrapper with an embedded HFS+
//! volume mounts the embedded volume; a bare HFS-standard volume mounts for
//! identification only and refuses catalog operations.
//!
//! The engine is single-owner (`&mut self`); wrap a volume in a `Mutex` to
//! share it between threads.

pub mod bitmap;
pub mod block;
pub mod btnode;
pub mod btree;
pub mod catalog;
pub mod cnode;
pub mod encodings;
pub mod error;
pub mod extents;
pub mod format;
pub mod unicode;
pub mod volume;

pub use block::{BlockCache, BlockDevice, Buf};
pub use error::{HfsError, Result};
pub use format::{format, FormatParams};
pub use volume::{MountOptions, Vcb, VolumeHeader};

use btree::{BTree, KeyCompare, COMPARE_TYPE_BINARY};
use catalog::{
    CatalogRecord, FileRecord, CNID_ROOT_FOLDER, CNID_ROOT_PARENT,
};
use cnode::{Cnode, CnodeCache, FileFork, C_ACCESS, C_CHANGE, C_MODIFIED};
use volume::{
    MasterDirectoryBlock, SECTOR_SIZE, ATTR_JOURNALED, ATTR_UNMOUNTED, HFSX_SIGNATURE,
    HFS_PLUS_SIGNATURE, HFS_SIGNATURE, MOUNT_VERSION, VOLUME_HEADER_OFFSET, VOLUME_HEADER_SIZE,
};

/// Entry kind in the filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// A directory entry returned by enumeration
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// File or folder name
    pub name: String,
    /// Catalog Node ID
    pub cnid: u32,
    /// Entry type
    pub kind: EntryKind,
    /// Data fork logical size (0 for directories)
    pub size: u64,
    /// HFS+ creation date (seconds since 1904-01-01)
    pub create_date: u32,
    /// HFS+ modification date
    pub modify_date: u32,
}

/// HFS+ permissions (BSD-style)
#[derive(Debug, Clone)]
pub struct HfsPermissions {
    pub owner_id: u32,
    pub group_id: u32,
    pub mode: u16,
}

/// Detailed file/directory metadata
#[derive(Debug, Clone)]
pub struct FileStat {
    pub cnid: u32,
    pub kind: EntryKind,
    pub size: u64,
    pub blocks: u32,
    pub link_count: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub permissions: HfsPermissions,
    pub resource_fork_size: u64,
}

/// Handle to an open fork of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle {
    /// Storage-owning id (indirect inode for hard links)
    pub file_id: u32,
    /// The id the file was opened through
    pub cnid: u32,
    pub resource: bool,
}

/// A mounted HFS+/HFSX volume (or an identification-only classic HFS mount)
pub struct Volume<D: BlockDevice> {
    dev: BlockCache<D>,
    vcb: Vcb,
    catalog: Option<BTree>,
    extents: Option<BTree>,
    attributes: Option<BTree>,
    cnodes: CnodeCache,
    opts: MountOptions,
    volume_name: String,
}

impl<D: BlockDevice> Volume<D> {
    // ── mount/unmount lifecycle ─────────────────────────────────────────

    /// Probe and mount a volume.
    pub fn mount(dev: D, opts: MountOptions) -> Result<Volume<D>> {
        encodings::init();
        let mut cache = BlockCache::new(dev);

        let mut probe = vec![0u8; VOLUME_HEADER_SIZE];
        cache.read_direct(VOLUME_HEADER_OFFSET, &mut probe)?;
        let signature = u16::from_be_bytes([probe[0], probe[1]]);

        let mut embedded_offset = 0u64;
        let header = match signature {
            HFS_PLUS_SIGNATURE | HFSX_SIGNATURE => VolumeHeader::parse(&probe)?,
            HFS_SIGNATURE => {
                let mdb = MasterDirectoryBlock::parse(&probe)?;
                match mdb.embedded_offset() {
                    Some(offset) if !opts.wrapper => {
                        if offset % SECTOR_SIZE != 0 {
                            return Err(HfsError::BadFormat(format!(
                                "embedded volume offset {offset} not sector aligned"
                            )));
                        }
                        log::info!("HFS wrapper found; mounting embedded volume at {offset}");
                        embedded_offset = offset;
                        cache.read_direct(offset + VOLUME_HEADER_OFFSET, &mut probe)?;
                        VolumeHeader::parse(&probe)?
                    }
                    _ => return Self::mount_standard(cache, mdb, opts),
                }
            }
            other => {
                return Err(HfsError::BadFormat(format!(
                    "unrecognized volume signature 0x{other:04X}"
                )))
            }
        };

        let mut opts = opts;
        if header.attributes & ATTR_JOURNALED != 0 && !opts.journal_disable {
            log::warn!("volume carries a journal; mounting read-only (no replay)");
            opts.read_only = true;
        }

        let vcb = Vcb::from_header(&header, embedded_offset, &opts);
        let need = embedded_offset + header.total_blocks as u64 * header.block_size as u64;
        if cache.device_size()? < need {
            return Err(HfsError::BadFormat(
                "device smaller than the volume it claims to hold".into(),
            ));
        }
        if vcb.free_blocks > vcb.total_blocks {
            return Err(HfsError::BadFormat("free-block count exceeds volume".into()));
        }

        let extents = BTree::open(
            &mut cache,
            &vcb,
            catalog::CNID_EXTENTS_FILE,
            header.extents_file.clone(),
            KeyCompare::Extents,
        )?;
        let mut cat = BTree::open(
            &mut cache,
            &vcb,
            catalog::CNID_CATALOG_FILE,
            header.catalog_file.clone(),
            KeyCompare::CaseFold,
        )?;
        if cat.header.key_compare_type == COMPARE_TYPE_BINARY {
            cat.compare = KeyCompare::Binary;
        }
        cat.load_overflow(&mut cache, &vcb, &extents)?;

        let attributes = if !header.attributes_file.is_empty() {
            let mut t = BTree::open(
                &mut cache,
                &vcb,
                catalog::CNID_ATTRIBUTES_FILE,
                header.attributes_file.clone(),
                KeyCompare::Binary,
            )?;
            t.load_overflow(&mut cache, &vcb, &extents)?;
            Some(t)
        } else {
            None
        };

        let volume_name = catalog::lookup_by_cnid(&mut cache, &vcb, &cat, CNID_ROOT_FOLDER)?
            .map(|(key, _)| key.name_string())
            .unwrap_or_default();

        let mut vol = Volume {
            dev: cache,
            vcb,
            catalog: Some(cat),
            extents: Some(extents),
            attributes,
            cnodes: CnodeCache::new(),
            opts,
            volume_name,
        };

        if !vol.vcb.read_only {
            // the clean bit stays clear while we are mounted read/write
            vol.vcb.attributes &= !ATTR_UNMOUNTED;
            vol.vcb.last_mounted_version = MOUNT_VERSION;
            vol.vcb.dirty = true;
            vol.write_volume_header()?;
            vol.dev.sync()?;
        }
        log::info!(
            "mounted \"{}\": {} blocks of {} bytes, {} free{}",
            vol.volume_name,
            vol.vcb.total_blocks,
            vol.vcb.block_size,
            vol.vcb.free_blocks,
            if vol.vcb.read_only { " (read-only)" } else { "" },
        );
        Ok(vol)
    }

    /// Identification-only mount of a classic HFS volume (or a wrapper
    /// mounted with the `wrapper` option).
    fn mount_standard(
        cache: BlockCache<D>,
        mdb: MasterDirectoryBlock,
        opts: MountOptions,
    ) -> Result<Volume<D>> {
        log::info!(
            "HFS-standard volume \"{}\" mounted read-only for identification",
            mdb.volume_name
        );
        let vcb = Vcb::from_mdb(&mdb, &opts);
        Ok(Volume {
            dev: cache,
            vcb,
            catalog: None,
            extents: None,
            attributes: None,
            cnodes: CnodeCache::new(),
            opts,
            volume_name: mdb.volume_name,
        })
    }

    /// Flush everything and release the device. Sets the clean-unmount bit
    /// unless the volume was marked damaged.
    pub fn unmount(mut self) -> Result<D> {
        self.vcb.unmounting = true;
        let drained = self.cnodes.drain_all();
        for mut cn in drained {
            if self.catalog.is_some() {
                if cn.deleted {
                    self.finish_deferred_delete(&mut cn)?;
                } else if cn.flags != 0 {
                    self.write_back_cnode(&mut cn)?;
                }
            }
        }
        if self.catalog.is_some() {
            self.flush()?;
            if !self.vcb.read_only {
                if !self.vcb.damaged {
                    self.vcb.attributes |= ATTR_UNMOUNTED;
                }
                self.vcb.dirty = true;
                self.write_volume_header()?;
            }
        }
        self.dev.sync()?;
        log::info!("unmounted \"{}\"", self.volume_name);
        self.dev.into_device()
    }

    /// Write out dirty c-nodes, delayed metadata, and the volume header.
    /// Node writes go first; the header (primary, then mirror) goes last.
    pub fn flush(&mut self) -> Result<()> {
        if self.vcb.is_standard {
            return Ok(());
        }
        for id in self.cnodes.ids() {
            self.flush_cnode(id)?;
        }
        // tree node writes drain before each tree's header record, and the
        // volume header goes out after everything else
        let Volume {
            dev,
            vcb,
            catalog,
            extents,
            attributes,
            ..
        } = self;
        for tree in [catalog.as_mut(), extents.as_mut(), attributes.as_mut()]
            .into_iter()
            .flatten()
        {
            tree.flush(dev, vcb)?;
        }
        self.dev.flush()?;
        if self.vcb.dirty {
            self.write_volume_header()?;
        }
        self.dev.sync()?;
        Ok(())
    }

    fn write_volume_header(&mut self) -> Result<()> {
        let extents_fork = self
            .extents
            .as_ref()
            .map(|t| t.fork.clone())
            .unwrap_or_default();
        let catalog_fork = self
            .catalog
            .as_ref()
            .map(|t| t.fork.clone())
            .unwrap_or_default();
        let attributes_fork = self
            .attributes
            .as_ref()
            .map(|t| t.fork.clone())
            .unwrap_or_default();
        self.vcb.modify_date = volume::hfs_now();
        self.vcb.write_count = self.vcb.write_count.wrapping_add(1);
        let header = self
            .vcb
            .compose_header(&extents_fork, &catalog_fork, &attributes_fork);
        let bytes = header.to_bytes()?;
        // primary strictly before the mirror: a torn write leaves one copy
        self.dev
            .write_direct(self.vcb.embedded_offset + VOLUME_HEADER_OFFSET, &bytes)?;
        self.dev
            .write_direct(self.vcb.alternate_header_offset(), &bytes)?;
        self.vcb.dirty = false;
        Ok(())
    }

    // ── accessors ───────────────────────────────────────────────────────

    pub fn vcb(&self) -> &Vcb {
        &self.vcb
    }

    pub fn volume_name(&self) -> &str {
        &self.volume_name
    }

    pub fn free_blocks(&self) -> u32 {
        self.vcb.free_blocks_advertised()
    }

    pub fn is_damaged(&self) -> bool {
        self.vcb.damaged
    }

    /// Catalog B-tree header (node counts, depth); `None` on HFS-standard.
    pub fn catalog_info(&self) -> Option<&btree::BTreeHeader> {
        self.catalog.as_ref().map(|t| t.get_info())
    }

    /// Extents-overflow B-tree header; `None` on HFS-standard.
    pub fn extents_info(&self) -> Option<&btree::BTreeHeader> {
        self.extents.as_ref().map(|t| t.get_info())
    }

    // ── internals ───────────────────────────────────────────────────────

    fn trees(
        &mut self,
    ) -> Result<(
        &mut BlockCache<D>,
        &mut Vcb,
        &mut BTree,
        &mut BTree,
        &mut CnodeCache,
        &MountOptions,
    )> {
        let Volume {
            dev,
            vcb,
            catalog,
            extents,
            cnodes,
            opts,
            ..
        } = self;
        let cat = catalog
            .as_mut()
            .ok_or(HfsError::Unsupported("catalog operations on an HFS-standard volume"))?;
        let ext = extents
            .as_mut()
            .ok_or(HfsError::Unsupported("catalog operations on an HFS-standard volume"))?;
        Ok((dev, vcb, cat, ext, cnodes, &*opts))
    }

    /// Track damage: metadata I/O or integrity failures poison the volume.
    fn note_error(&mut self, e: HfsError) -> HfsError {
        if e.is_damage() {
            self.vcb.mark_damaged();
        }
        e
    }

    fn split_path(path: &str) -> Vec<&str> {
        path.trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Resolve the parent directory of `path`, returning its CNID and the
    /// final name component.
    fn resolve_parent<'p>(&mut self, path: &'p str) -> Result<(u32, &'p str)> {
        let parts = Self::split_path(path);
        let (leaf, dirs) = parts
            .split_last()
            .ok_or_else(|| HfsError::NotFound("empty path".into()))?;
        let (dev, vcb, cat, _ext, _cn, _opts) = self.trees()?;
        let mut parent = CNID_ROOT_FOLDER;
        for (i, comp) in dirs.iter().enumerate() {
            match catalog::lookup(dev, vcb, cat, parent, comp)? {
                Some(CatalogRecord::Folder(f)) => parent = f.folder_id,
                Some(_) => return Err(HfsError::NotADirectory(parts[..=i].join("/"))),
                None => return Err(HfsError::NotFound(parts[..=i].join("/"))),
            }
        }
        Ok((parent, leaf))
    }

    /// Resolve a path to (parent, name, record). The root resolves through
    /// its thread record.
    fn resolve(&mut self, path: &str) -> Result<(u32, String, CatalogRecord)> {
        if Self::split_path(path).is_empty() {
            let (dev, vcb, cat, _ext, _cn, _opts) = self.trees()?;
            let (key, record) = catalog::lookup_by_cnid(dev, vcb, cat, CNID_ROOT_FOLDER)?
                .ok_or_else(|| HfsError::NotFound("root folder".into()))?;
            return Ok((CNID_ROOT_PARENT, key.name_string(), record));
        }
        let (parent, name) = self.resolve_parent(path)?;
        let name = name.to_string();
        let (dev, vcb, cat, _ext, _cn, _opts) = self.trees()?;
        let record = catalog::lookup(dev, vcb, cat, parent, &name)?
            .ok_or_else(|| HfsError::NotFound(path.to_string()))?;
        Ok((parent, name, record))
    }

    /// Follow one level of hard-link indirection; returns the record whose
    /// forks hold the content plus the owning file id.
    fn resolve_file_content(&mut self, record: FileRecord) -> Result<(u32, FileRecord)> {
        if !record.is_hardlink() {
            let id = record.file_id;
            return Ok((id, record));
        }
        let names = self.opts.metadata_dir_names.clone();
        let (dev, vcb, cat, _ext, _cn, _opts) = self.trees()?;
        match catalog::resolve_hardlink(dev, vcb, cat, &names, &record)? {
            Some(inode) => {
                let id = inode.file_id;
                Ok((id, inode))
            }
            // resolution disabled or inode missing: surface the link itself
            None => {
                let id = record.file_id;
                Ok((id, record))
            }
        }
    }

    // ── metadata operations ─────────────────────────────────────────────

    pub fn exists(&mut self, path: &str) -> Result<bool> {
        match self.resolve(path) {
            Ok(_) => Ok(true),
            Err(HfsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn stat(&mut self, path: &str) -> Result<FileStat> {
        let (_parent, _name, record) = self.resolve(path)?;
        match record {
            CatalogRecord::Folder(f) => Ok(FileStat {
                cnid: f.folder_id,
                kind: EntryKind::Directory,
                size: 0,
                blocks: 0,
                link_count: 2 + f.valence,
                create_date: f.create_date,
                modify_date: f.content_mod_date,
                permissions: self.permissions_of(f.bsd.owner_id, f.bsd.group_id, f.bsd.file_mode, true),
                resource_fork_size: 0,
            }),
            CatalogRecord::File(f) => {
                let link_cnid = f.file_id;
                let was_link = f.is_hardlink();
                let (_, content) = self.resolve_file_content(f)?;
                let link_count = if was_link && content.is_hardlink() {
                    1 // unresolvable link surfaces as a plain file
                } else if was_link {
                    content.bsd.special
                } else {
                    1
                };
                Ok(FileStat {
                    cnid: link_cnid,
                    kind: content.kind(),
                    size: content.data_fork.logical_size,
                    blocks: content.data_fork.total_blocks + content.resource_fork.total_blocks,
                    link_count,
                    create_date: content.create_date,
                    modify_date: content.content_mod_date,
                    permissions: self.permissions_of(
                        content.bsd.owner_id,
                        content.bsd.group_id,
                        content.bsd.file_mode,
                        false,
                    ),
                    resource_fork_size: content.resource_fork.logical_size,
                })
            }
            _ => Err(HfsError::BadNode("thread record under a name key".into())),
        }
    }

    fn permissions_of(&self, uid: u32, gid: u32, mode: u16, is_dir: bool) -> HfsPermissions {
        let mut mode = mode;
        if mode & 0o7777 == 0 {
            // the volume carries no POSIX permissions; apply mount defaults
            let base: u16 = if is_dir { 0o040777 } else { 0o100666 };
            mode = base & !self.opts.mask.unwrap_or(0o022);
        }
        if self.opts.noxonfiles && !is_dir {
            mode &= !0o111;
        }
        HfsPermissions {
            owner_id: self.opts.uid.unwrap_or(uid),
            group_id: self.opts.gid.unwrap_or(gid),
            mode,
        }
    }

    /// List a directory completely.
    pub fn read_dir(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        let (_p, _n, record) = self.resolve(path)?;
        let dir_cnid = match record {
            CatalogRecord::Folder(f) => f.folder_id,
            _ => return Err(HfsError::NotADirectory(path.to_string())),
        };
        let mut entries = Vec::new();
        let mut offset = 0u32;
        loop {
            let (batch, eof) = self.read_dir_chunk(dir_cnid, offset, 128)?;
            offset += batch.len() as u32;
            entries.extend(batch);
            if eof {
                break;
            }
        }
        Ok(entries)
    }

    /// One batch of a cursor-driven enumeration: entries from `offset`,
    /// at most `max`, plus an end-of-directory flag. The catalog lock is
    /// released between batches; a per-folder hint makes resumes O(1).
    pub fn read_dir_chunk(
        &mut self,
        dir_cnid: u32,
        offset: u32,
        max: usize,
    ) -> Result<(Vec<DirEntry>, bool)> {
        let names = self.opts.metadata_dir_names.clone();
        let (dev, vcb, cat, _ext, cnodes, _opts) = self.trees()?;
        // the hint LRU lives on the folder's c-node; fault one in so
        // repeated enumerations of the same folder resume in O(1)
        if cnodes.get(dir_cnid).is_none() {
            if let Some((key, record @ CatalogRecord::Folder(_))) =
                catalog::lookup_by_cnid(dev, vcb, cat, dir_cnid)?
            {
                cnodes.insert(Cnode {
                    cnid: dir_cnid,
                    file_id: dir_cnid,
                    parent_id: key.parent_id,
                    name: key.name_string(),
                    record,
                    flags: 0,
                    link_count: 1,
                    deleted: false,
                    refs: 0,
                    data_fork: None,
                    rsrc_fork: None,
                    dir_hints: catalog::DirHints::new(),
                });
            }
        }
        let hints = cnodes.get(dir_cnid).map(|c| &mut c.dir_hints);
        catalog::get_dirents(dev, vcb, cat, &names, dir_cnid, offset, max, hints)
    }

    pub fn create_dir(&mut self, path: &str) -> Result<u32> {
        self.vcb.check_writable()?;
        let (parent, name) = self.resolve_parent(path)?;
        let name = name.to_string();
        let attrs = self.default_attrs(0o040755);
        let (dev, vcb, cat, ext, cnodes, _opts) = self.trees()?;
        let rec = catalog::create_folder(dev, vcb, cat, ext, parent, &name, &attrs)?;
        cnodes.invalidate_dir_hints(parent);
        Ok(rec.folder_id)
    }

    /// Create an empty file and open its data fork.
    pub fn create_file(&mut self, path: &str) -> Result<FileHandle> {
        self.vcb.check_writable()?;
        let (parent, name) = self.resolve_parent(path)?;
        let name = name.to_string();
        let attrs = self.default_attrs(0o100644);
        let (dev, vcb, cat, ext, cnodes, _opts) = self.trees()?;
        let rec = catalog::create_file(dev, vcb, cat, ext, parent, &name, &attrs)?;
        cnodes.invalidate_dir_hints(parent);
        let cnid = rec.file_id;
        self.open_cnid(cnid, false)
    }

    fn default_attrs(&self, mode: u16) -> catalog::NewItem {
        catalog::NewItem {
            mode,
            uid: self.opts.uid.unwrap_or(0),
            gid: self.opts.gid.unwrap_or(0),
            encoding: self.opts.encoding,
        }
    }

    pub fn remove_dir(&mut self, path: &str) -> Result<()> {
        self.vcb.check_writable()?;
        let (parent, name, record) = self.resolve(path)?;
        let dir_cnid = match &record {
            CatalogRecord::Folder(f) => f.folder_id,
            _ => return Err(HfsError::NotADirectory(path.to_string())),
        };
        let (dev, vcb, cat, ext, cnodes, _opts) = self.trees()?;
        catalog::delete(dev, vcb, cat, ext, parent, &name)?;
        cnodes.invalidate_dir_hints(parent);
        cnodes.remove(dir_cnid);
        Ok(())
    }

    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        self.vcb.check_writable()?;
        let (parent, name, record) = self.resolve(path)?;
        let file = match record {
            CatalogRecord::File(f) => f,
            CatalogRecord::Folder(_) => return Err(HfsError::PermissionDenied),
            _ => return Err(HfsError::BadNode("thread record under a name key".into())),
        };

        if file.is_hardlink() {
            return self.remove_link(parent, &name, file);
        }

        // open handles defer the removal to the last close
        if let Some(cn) = self.cnodes.get(file.file_id) {
            cn.deleted = true;
            return Ok(());
        }

        let r = self.destroy_file(parent, &name, file);
        r.map_err(|e| self.note_error(e))
    }

    /// Free both forks and drop the catalog entry of a plain file.
    fn destroy_file(&mut self, parent: u32, name: &str, mut file: FileRecord) -> Result<()> {
        let (dev, vcb, cat, ext, cnodes, _opts) = self.trees()?;
        extents::truncate_fork(
            dev,
            vcb,
            Some(ext),
            file.file_id,
            extents::FORK_TYPE_DATA,
            &mut file.data_fork,
            None,
            0,
        )?;
        extents::truncate_fork(
            dev,
            vcb,
            Some(ext),
            file.file_id,
            extents::FORK_TYPE_RESOURCE,
            &mut file.resource_fork,
            None,
            0,
        )?;
        // the record still carries fork state until the entry goes away;
        // rewrite it so a crash between the two steps stays consistent
        catalog::update(
            dev,
            vcb,
            cat,
            ext,
            parent,
            name,
            &CatalogRecord::File(file),
        )?;
        catalog::delete(dev, vcb, cat, ext, parent, name)?;
        cnodes.invalidate_dir_hints(parent);
        Ok(())
    }

    /// Remove one hard link; the indirect inode goes away with its last link.
    fn remove_link(&mut self, parent: u32, name: &str, link: FileRecord) -> Result<()> {
        let names = self.opts.metadata_dir_names.clone();
        let inode_num = link.link_reference();
        let (dev, vcb, cat, ext, cnodes, _opts) = self.trees()?;

        catalog::delete(dev, vcb, cat, ext, parent, name)?;
        cnodes.invalidate_dir_hints(parent);

        // locate the indirect inode among the candidate directories
        let iname = catalog::inode_name(inode_num);
        for dir in &names {
            let private = match catalog::lookup(dev, vcb, cat, CNID_ROOT_FOLDER, dir)? {
                Some(CatalogRecord::Folder(f)) => f.folder_id,
                _ => continue,
            };
            let mut inode = match catalog::lookup(dev, vcb, cat, private, &iname)? {
                Some(CatalogRecord::File(f)) => f,
                _ => continue,
            };
            inode.bsd.special = inode.bsd.special.saturating_sub(1);
            if inode.bsd.special == 0 {
                // an open handle on the inode defers destruction to the
                // last close, same as the plain-file path
                if let Some(cn) = cnodes.get(inode_num) {
                    cn.deleted = true;
                    catalog::update(
                        dev,
                        vcb,
                        cat,
                        ext,
                        private,
                        &iname,
                        &CatalogRecord::File(inode),
                    )?;
                    return Ok(());
                }
                let id = inode.file_id;
                extents::truncate_fork(
                    dev,
                    vcb,
                    Some(ext),
                    id,
                    extents::FORK_TYPE_DATA,
                    &mut inode.data_fork,
                    None,
                    0,
                )?;
                extents::truncate_fork(
                    dev,
                    vcb,
                    Some(ext),
                    id,
                    extents::FORK_TYPE_RESOURCE,
                    &mut inode.resource_fork,
                    None,
                    0,
                )?;
                catalog::update(dev, vcb, cat, ext, private, &iname, &CatalogRecord::File(inode))?;
                catalog::delete(dev, vcb, cat, ext, private, &iname)?;
            } else {
                catalog::update(dev, vcb, cat, ext, private, &iname, &CatalogRecord::File(inode))?;
            }
            return Ok(());
        }
        // resolution disabled: the link file was an ordinary (empty) file
        Ok(())
    }

    pub fn rename(&mut self, src: &str, dst: &str) -> Result<()> {
        self.vcb.check_writable()?;
        let (src_parent, src_name) = self.resolve_parent(src)?;
        let src_name = src_name.to_string();
        let (dst_parent, dst_name) = self.resolve_parent(dst)?;
        let dst_name = dst_name.to_string();
        let (dev, vcb, cat, ext, cnodes, _opts) = self.trees()?;
        catalog::rename(
            dev, vcb, cat, ext, src_parent, &src_name, dst_parent, &dst_name,
        )?;
        cnodes.invalidate_dir_hints(src_parent);
        cnodes.invalidate_dir_hints(dst_parent);
        Ok(())
    }

    /// Create a hard link at `new_path` to the file at `existing`.
    pub fn hard_link(&mut self, existing: &str, new_path: &str) -> Result<()> {
        self.vcb.check_writable()?;
        let (target_parent, target_name) = self.resolve_parent(existing)?;
        let target_name = target_name.to_string();
        let (link_parent, link_name) = self.resolve_parent(new_path)?;
        let link_name = link_name.to_string();
        let names = self.opts.metadata_dir_names.clone();
        let (dev, vcb, cat, ext, cnodes, _opts) = self.trees()?;
        catalog::create_link(
            dev,
            vcb,
            cat,
            ext,
            &names,
            target_parent,
            &target_name,
            link_parent,
            &link_name,
        )?;
        cnodes.invalidate_dir_hints(target_parent);
        cnodes.invalidate_dir_hints(link_parent);
        Ok(())
    }

    /// Create a symlink whose data fork holds the target path.
    pub fn symlink(&mut self, path: &str, target: &str) -> Result<()> {
        self.vcb.check_writable()?;
        let (parent, name) = self.resolve_parent(path)?;
        let name = name.to_string();
        let attrs = catalog::NewItem {
            mode: 0o120777,
            uid: self.opts.uid.unwrap_or(0),
            gid: self.opts.gid.unwrap_or(0),
            encoding: self.opts.encoding,
        };
        let (dev, vcb, cat, ext, cnodes, _opts) = self.trees()?;
        let rec = catalog::create_file(dev, vcb, cat, ext, parent, &name, &attrs)?;
        cnodes.invalidate_dir_hints(parent);
        let cnid = rec.file_id;
        let h = self.open_cnid(cnid, false)?;
        self.write(&h, 0, target.as_bytes())?;
        self.close(h)?;
        Ok(())
    }

    pub fn read_link(&mut self, path: &str) -> Result<String> {
        let (_p, _n, record) = self.resolve(path)?;
        let file = match record {
            CatalogRecord::File(f) if f.kind() == EntryKind::Symlink => f,
            CatalogRecord::File(_) => {
                return Err(HfsError::Unsupported("not a symlink"))
            }
            _ => return Err(HfsError::Unsupported("not a symlink")),
        };
        let cnid = file.file_id;
        // serve from the fork's cached target when the file is active
        if let Some(cn) = self.cnodes.get(cnid) {
            if let Some(fork) = &cn.data_fork {
                if let Some(cached) = &fork.symlink_cache {
                    return Ok(String::from_utf8_lossy(cached).into_owned());
                }
            }
        }
        let h = self.open_cnid(cnid, false)?;
        let size = file.data_fork.logical_size as usize;
        let mut buf = vec![0u8; size];
        let n = self.read(&h, 0, &mut buf)?;
        buf.truncate(n);
        if let Some(cn) = self.cnodes.get(h.file_id) {
            if let Some(fork) = cn.data_fork.as_mut() {
                fork.symlink_cache = Some(buf.clone());
            }
        }
        self.close(h)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    // ── file I/O ────────────────────────────────────────────────────────

    /// Open a file by path. Hard links resolve to their indirect inode.
    pub fn open(&mut self, path: &str, resource: bool) -> Result<FileHandle> {
        let (_p, _n, record) = self.resolve(path)?;
        let file = match record {
            CatalogRecord::File(f) => f,
            CatalogRecord::Folder(_) => return Err(HfsError::NotADirectory(path.to_string())),
            _ => return Err(HfsError::BadNode("thread record under a name key".into())),
        };
        let link_cnid = file.file_id;
        let (file_id, content) = self.resolve_file_content(file)?;
        self.open_record(link_cnid, file_id, content, resource)
    }

    fn open_cnid(&mut self, cnid: u32, resource: bool) -> Result<FileHandle> {
        if let Some(cn) = self.cnodes.get(cnid) {
            cn.refs += 1;
            return Ok(FileHandle {
                file_id: cnid,
                cnid,
                resource,
            });
        }
        let (dev, vcb, cat, _ext, _cn, _opts) = self.trees()?;
        let (_, record) = catalog::lookup_by_cnid(dev, vcb, cat, cnid)?
            .ok_or_else(|| HfsError::NotFound(format!("cnid {cnid}")))?;
        let file = match record {
            CatalogRecord::File(f) => f,
            _ => return Err(HfsError::NotADirectory(format!("cnid {cnid}"))),
        };
        self.open_record(cnid, cnid, file, resource)
    }

    fn open_record(
        &mut self,
        cnid: u32,
        file_id: u32,
        content: FileRecord,
        resource: bool,
    ) -> Result<FileHandle> {
        if self.cnodes.get(file_id).is_none() {
            let link_count = if content.is_hardlink() {
                1
            } else if cnid != file_id {
                content.bsd.special.max(1)
            } else {
                1
            };
            let parent_id;
            let name;
            {
                let (dev, vcb, cat, _ext, _cn, _opts) = self.trees()?;
                let (key, _) = catalog::lookup_by_cnid(dev, vcb, cat, file_id)?
                    .ok_or_else(|| HfsError::NotFound(format!("cnid {file_id}")))?;
                parent_id = key.parent_id;
                name = key.name_string();
            }
            let mut cn = Cnode {
                cnid,
                file_id,
                parent_id,
                name,
                record: CatalogRecord::File(content.clone()),
                flags: 0,
                link_count,
                deleted: false,
                refs: 0,
                data_fork: Some(FileFork::new(extents::FORK_TYPE_DATA, content.data_fork.clone())),
                rsrc_fork: Some(FileFork::new(
                    extents::FORK_TYPE_RESOURCE,
                    content.resource_fork.clone(),
                )),
                dir_hints: catalog::DirHints::new(),
            };
            // load overflow extents for the requested fork up front
            {
                let (dev, vcb, _cat, ext, _cns, _opts) = self.trees()?;
                for fork in [cn.data_fork.as_mut(), cn.rsrc_fork.as_mut()].into_iter().flatten() {
                    if !fork.fully_mapped() {
                        fork.extent_cache = extents::load_extent_map(
                            dev,
                            vcb,
                            ext,
                            file_id,
                            fork.fork_type,
                            &fork.fork,
                        )?;
                    }
                }
            }
            self.cnodes.insert(cn);
        } else if let Some(cn) = self.cnodes.get(file_id) {
            cn.refs += 1;
        }
        Ok(FileHandle {
            file_id,
            cnid,
            resource,
        })
    }

    /// Drop a handle; the last close writes back metadata and runs any
    /// deferred removal.
    pub fn close(&mut self, h: FileHandle) -> Result<()> {
        if let Some(mut cn) = self.cnodes.release(h.file_id) {
            if self.catalog.is_some() {
                if cn.deleted {
                    self.finish_deferred_delete(&mut cn)?;
                } else if cn.flags != 0 {
                    self.write_back_cnode(&mut cn)?;
                }
            }
        }
        Ok(())
    }

    /// Read from an open fork. Holes and invalid ranges read as zeros;
    /// the result is clipped to the fork's logical size.
    pub fn read(&mut self, h: &FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let bs = self.vcb.block_size as u64;
        let embedded = self.vcb.embedded_offset;
        let read_only = self.vcb.read_only;
        let cn = self
            .cnodes
            .get(h.file_id)
            .ok_or_else(|| HfsError::NotFound("stale file handle".into()))?;
        let fork = cn.fork_mut(h.resource)?;

        if offset >= fork.fork.logical_size {
            return Ok(0);
        }
        let want = buf.len().min((fork.fork.logical_size - offset) as usize);

        // plan the read while the fork is borrowed; holes and invalid
        // ranges split a block-sized chunk into zero and disk segments
        let segments: Vec<(u64, usize, Option<u64>)> = {
            let mut segs = Vec::new();
            let mut covered = 0usize;
            while covered < want {
                let pos = offset + covered as u64;
                let block = (pos / bs) as u32;
                let within = pos % bs;
                let chunk = ((bs - within) as usize).min(want - covered);
                let chunk_end = pos + chunk as u64;

                let disk_base = extents::map_block(&fork.extent_cache, block)
                    .map(|(phys, _)| embedded + phys as u64 * bs + within);

                let holes = fork.invalid_ranges.overlaps(pos, chunk_end);
                let mut cur = pos;
                for (hs, he) in holes {
                    if cur < hs {
                        segs.push((
                            cur,
                            (hs - cur) as usize,
                            disk_base.map(|d| d + (cur - pos)),
                        ));
                    }
                    segs.push((hs, (he - hs) as usize, None));
                    cur = he;
                }
                if cur < chunk_end {
                    segs.push((
                        cur,
                        (chunk_end - cur) as usize,
                        disk_base.map(|d| d + (cur - pos)),
                    ));
                }
                covered += chunk;
            }
            segs
        };
        if !read_only {
            cn.touch(C_ACCESS);
        }
        for (pos, chunk, src) in segments {
            let at = (pos - offset) as usize;
            match src {
                Some(disk) => {
                    self.dev.read_direct(disk, &mut buf[at..at + chunk])?;
                }
                None => {
                    for b in &mut buf[at..at + chunk] {
                        *b = 0;
                    }
                }
            }
        }
        Ok(want)
    }

    /// Write into an open fork, growing it as needed. Returns bytes
    /// written; a short count means the volume filled up mid-write.
    pub fn write(&mut self, h: &FileHandle, offset: u64, data: &[u8]) -> Result<usize> {
        self.vcb.check_writable()?;
        if data.is_empty() {
            return Ok(0);
        }
        let bs = self.vcb.block_size as u64;
        let end = offset + data.len() as u64;

        // grow allocation first
        let capacity = {
            let (dev, vcb, _cat, ext, cnodes, _opts) = self.trees()?;
            let cn = cnodes
                .get(h.file_id)
                .ok_or_else(|| HfsError::NotFound("stale file handle".into()))?;
            let fork = cn.fork_mut(h.resource)?;
            let capacity = fork.fork.total_blocks as u64 * bs;
            if end > capacity {
                let added = extents::extend_fork(
                    dev,
                    vcb,
                    Some(ext),
                    h.file_id,
                    fork.fork_type,
                    &mut fork.fork,
                    Some(&mut fork.extent_cache),
                    end - capacity,
                    extents::ExtendFlags::default(),
                )?;
                // freshly allocated space has no data yet
                fork.invalid_ranges.add(capacity, capacity + added);
                capacity + added
            } else {
                capacity
            }
        };

        let writable_end = end.min(capacity);
        if writable_end <= offset {
            return Err(HfsError::DiskFull);
        }
        let len = (writable_end - offset) as usize;

        // gather disk positions, then write
        let embedded = self.vcb.embedded_offset;
        let segments: Vec<(u64, usize, u64)> = {
            let cn = self.cnodes.get(h.file_id).unwrap();
            let fork = cn.fork_mut(h.resource)?;
            let mut segs = Vec::new();
            let mut covered = 0usize;
            while covered < len {
                let pos = offset + covered as u64;
                let block = (pos / bs) as u32;
                let within = pos % bs;
                let chunk = ((bs - within) as usize).min(len - covered);
                let (phys, _) = extents::map_block(&fork.extent_cache, block)
                    .ok_or_else(|| HfsError::BadNode("write past mapped extents".into()))?;
                segs.push((pos, chunk, embedded + phys as u64 * bs + within));
                covered += chunk;
            }
            segs
        };
        for &(pos, chunk, disk) in &segments {
            let at = (pos - offset) as usize;
            self.dev.write_direct(disk, &data[at..at + chunk])?;
        }

        // metadata updates
        {
            let cn = self.cnodes.get(h.file_id).unwrap();
            let fork = cn.fork_mut(h.resource)?;
            let old_size = fork.fork.logical_size;
            if offset > old_size {
                // a seek past EOF leaves a hole that reads as zeros
                fork.invalid_ranges.add(old_size, offset);
            }
            fork.invalid_ranges.remove(offset, writable_end);
            fork.fork.logical_size = old_size.max(writable_end);
            fork.symlink_cache = None;
            cn.touch(C_MODIFIED | C_CHANGE);
        }
        self.vcb.dirty = true;
        Ok(len)
    }

    /// Grow or shrink an open fork to exactly `new_size` bytes.
    pub fn set_len(&mut self, h: &FileHandle, new_size: u64) -> Result<()> {
        self.vcb.check_writable()?;
        let bs = self.vcb.block_size as u64;
        let (dev, vcb, _cat, ext, cnodes, _opts) = self.trees()?;
        let cn = cnodes
            .get(h.file_id)
            .ok_or_else(|| HfsError::NotFound("stale file handle".into()))?;
        let fork = cn.fork_mut(h.resource)?;
        let capacity = fork.fork.total_blocks as u64 * bs;

        if new_size > capacity {
            let added = extents::extend_fork(
                dev,
                vcb,
                Some(ext),
                h.file_id,
                fork.fork_type,
                &mut fork.fork,
                Some(&mut fork.extent_cache),
                new_size - capacity,
                extents::ExtendFlags {
                    all_or_nothing: true,
                    ..Default::default()
                },
            )?;
            fork.invalid_ranges.add(capacity, capacity + added);
            fork.fork.logical_size = new_size;
        } else if new_size > fork.fork.logical_size {
            fork.invalid_ranges.add(fork.fork.logical_size, new_size);
            fork.fork.logical_size = new_size;
        } else {
            extents::truncate_fork(
                dev,
                vcb,
                Some(ext),
                h.file_id,
                fork.fork_type,
                &mut fork.fork,
                Some(&mut fork.extent_cache),
                new_size,
            )?;
            fork.invalid_ranges.truncate_to(new_size);
        }
        fork.symlink_cache = None;
        cn.touch(C_MODIFIED | C_CHANGE);
        Ok(())
    }

    /// Current logical size of an open fork (the catalog record lags until
    /// the handle is flushed or closed).
    pub fn handle_size(&mut self, h: &FileHandle) -> Result<u64> {
        let cn = self
            .cnodes
            .get(h.file_id)
            .ok_or_else(|| HfsError::NotFound("stale file handle".into()))?;
        Ok(cn.fork_mut(h.resource)?.fork.logical_size)
    }

    /// Logical-to-physical mapping of one block of an open fork.
    pub fn map_file_block(&mut self, h: &FileHandle, logical: u32) -> Result<Option<(u32, u32)>> {
        let cn = self
            .cnodes
            .get(h.file_id)
            .ok_or_else(|| HfsError::NotFound("stale file handle".into()))?;
        let fork = cn.fork_mut(h.resource)?;
        Ok(extents::map_block(&fork.extent_cache, logical))
    }

    /// Push an open file's metadata and data to disk.
    pub fn fsync(&mut self, h: &FileHandle) -> Result<()> {
        self.flush_cnode(h.file_id)?;
        self.dev.flush()?;
        Ok(())
    }

    /// Write a dirty c-node's catalog record back.
    fn flush_cnode(&mut self, file_id: u32) -> Result<()> {
        let mut scratch = match self.cnodes.get(file_id) {
            Some(cn) if cn.flags != 0 && !cn.deleted => {
                // clone the state needed for the catalog update
                let rec = cn.record.clone();
                let data = cn.data_fork.clone();
                let rsrc = cn.rsrc_fork.clone();
                let flags = cn.flags;
                cn.flags = 0;
                Cnode {
                    cnid: cn.cnid,
                    file_id: cn.file_id,
                    parent_id: cn.parent_id,
                    name: cn.name.clone(),
                    record: rec,
                    flags,
                    link_count: cn.link_count,
                    deleted: false,
                    refs: 0,
                    data_fork: data,
                    rsrc_fork: rsrc,
                    dir_hints: catalog::DirHints::new(),
                }
            }
            _ => return Ok(()),
        };
        self.write_back_cnode(&mut scratch)
    }

    fn write_back_cnode(&mut self, cn: &mut Cnode) -> Result<()> {
        if self.vcb.read_only {
            return Ok(());
        }
        let now = volume::hfs_now();
        if let CatalogRecord::File(rec) = &mut cn.record {
            if let Some(fork) = &cn.data_fork {
                rec.data_fork = fork.fork.clone();
            }
            if let Some(fork) = &cn.rsrc_fork {
                rec.resource_fork = fork.fork.clone();
            }
            if cn.flags & C_MODIFIED != 0 {
                rec.content_mod_date = now;
            }
            if cn.flags & C_CHANGE != 0 {
                rec.attribute_mod_date = now;
            }
            if cn.flags & C_ACCESS != 0 {
                rec.access_date = now;
            }
        }
        let record = cn.record.clone();
        let file_id = cn.file_id;
        let (dev, vcb, cat, ext, _cns, _opts) = self.trees()?;
        let (key, _) = catalog::lookup_by_cnid(dev, vcb, cat, file_id)?
            .ok_or_else(|| HfsError::NotFound(format!("cnid {file_id}")))?;
        cat.replace(dev, vcb, Some(ext), &key.encode(), &record.encode()?)?;
        cn.flags = 0;
        Ok(())
    }

    /// Run the removal a busy file deferred to its last close.
    fn finish_deferred_delete(&mut self, cn: &mut Cnode) -> Result<()> {
        let file_id = cn.file_id;
        let (parent, name, record) = {
            let (dev, vcb, cat, _ext, _cns, _opts) = self.trees()?;
            match catalog::lookup_by_cnid(dev, vcb, cat, file_id)? {
                Some((key, CatalogRecord::File(f))) => {
                    (key.parent_id, key.name_string(), f)
                }
                _ => return Ok(()), // already gone
            }
        };
        let r = self.destroy_file(parent, &name, record);
        r.map_err(|e| self.note_error(e))
    }
}
