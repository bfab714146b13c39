//! In-memory c-nodes: one per active file or directory, keyed by file id.
//!
//! A c-node owns its fork objects; a fork owns its flattened extent cache,
//! its invalid-range (hole) list, and any cached symlink target. Deleted
//! c-nodes stay alive until the last handle drops; the volume then runs the
//! deferred catalog removal.

use std::collections::HashMap;

use crate::catalog::{CatalogRecord, DirHints};
use crate::error::{HfsError, Result};
use crate::volume::{ExtentDescriptor, ForkData};
use crate::EntryKind;

/// c-node dirty bits
pub const C_ACCESS: u8 = 0x01;
pub const C_CHANGE: u8 = 0x02;
pub const C_MODIFIED: u8 = 0x04;
pub const C_UPDATE: u8 = 0x08;

/// Byte ranges of a fork that are allocated but carry no written data yet.
/// Reads inside them see zeros; writes carve them away.
#[derive(Debug, Clone, Default)]
pub struct InvalidRanges {
    /// Sorted, non-overlapping, half-open (start, end) pairs
    ranges: Vec<(u64, u64)>,
}

impl InvalidRanges {
    pub fn new() -> InvalidRanges {
        InvalidRanges::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn add(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        self.ranges.push((start, end));
        self.ranges.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.ranges.len());
        for &(s, e) in &self.ranges {
            match merged.last_mut() {
                Some(last) if s <= last.1 => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.ranges = merged;
    }

    /// Remove [start, end) from the invalid set (a write landed there).
    pub fn remove(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut out: Vec<(u64, u64)> = Vec::with_capacity(self.ranges.len() + 1);
        for &(s, e) in &self.ranges {
            if e <= start || s >= end {
                out.push((s, e));
                continue;
            }
            if s < start {
                out.push((s, start));
            }
            if e > end {
                out.push((end, e));
            }
        }
        self.ranges = out;
    }

    /// Intersections of [start, end) with the invalid set.
    pub fn overlaps(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        self.ranges
            .iter()
            .filter(|&&(s, e)| s < end && e > start)
            .map(|&(s, e)| (s.max(start), e.min(end)))
            .collect()
    }

    /// Drop everything at or past `len` (truncation).
    pub fn truncate_to(&mut self, len: u64) {
        self.remove(len, u64::MAX);
    }
}

/// One fork of an open file
#[derive(Debug, Clone)]
pub struct FileFork {
    pub fork_type: u8,
    pub fork: ForkData,
    /// Flattened extent list (inline + overflow), loaded lazily
    pub extent_cache: Vec<ExtentDescriptor>,
    pub invalid_ranges: InvalidRanges,
    /// Cached symlink target bytes
    pub symlink_cache: Option<Vec<u8>>,
}

impl FileFork {
    pub fn new(fork_type: u8, fork: ForkData) -> FileFork {
        let extent_cache = fork
            .extents
            .iter()
            .copied()
            .take_while(|e| e.block_count > 0)
            .collect();
        FileFork {
            fork_type,
            fork,
            extent_cache,
            invalid_ranges: InvalidRanges::new(),
            symlink_cache: None,
        }
    }

    /// Does the cached extent list cover the whole fork?
    pub fn fully_mapped(&self) -> bool {
        let covered: u32 = self.extent_cache.iter().map(|e| e.block_count).sum();
        covered >= self.fork.total_blocks
    }
}

/// In-memory state for one active file or directory
#[derive(Debug)]
pub struct Cnode {
    /// The catalog node id this object was reached through (the link's id
    /// for hard links)
    pub cnid: u32,
    /// The id owning the storage (indirect inode id for hard links)
    pub file_id: u32,
    pub parent_id: u32,
    pub name: String,
    pub record: CatalogRecord,
    pub flags: u8,
    pub link_count: u32,
    pub deleted: bool,
    pub refs: u32,
    pub data_fork: Option<FileFork>,
    pub rsrc_fork: Option<FileFork>,
    pub dir_hints: DirHints,
}

impl Cnode {
    pub fn kind(&self) -> EntryKind {
        match &self.record {
            CatalogRecord::Folder(_) => EntryKind::Directory,
            CatalogRecord::File(f) => f.kind(),
            _ => EntryKind::File,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.record, CatalogRecord::Folder(_))
    }

    pub fn file_record(&self) -> Result<&crate::catalog::FileRecord> {
        match &self.record {
            CatalogRecord::File(f) => Ok(f),
            _ => Err(HfsError::NotADirectory(format!(
                "cnid {} is not a file",
                self.cnid
            ))),
        }
    }

    pub fn file_record_mut(&mut self) -> Result<&mut crate::catalog::FileRecord> {
        match &mut self.record {
            CatalogRecord::File(f) => Ok(f),
            _ => Err(HfsError::NotADirectory("cnid is not a file".to_string())),
        }
    }

    /// Allocation blocks across both forks
    pub fn blocks(&self) -> u32 {
        let d = self.data_fork.as_ref().map(|f| f.fork.total_blocks).unwrap_or(0);
        let r = self.rsrc_fork.as_ref().map(|f| f.fork.total_blocks).unwrap_or(0);
        d + r
    }

    pub fn fork_mut(&mut self, resource: bool) -> Result<&mut FileFork> {
        let slot = if resource {
            &mut self.rsrc_fork
        } else {
            &mut self.data_fork
        };
        slot.as_mut()
            .ok_or_else(|| HfsError::NotFound("fork not open".to_string()))
    }

    pub fn touch(&mut self, bits: u8) {
        self.flags |= bits;
    }
}

/// The (device, fileID) -> c-node map. There is exactly one c-node per
/// file id at any instant; handles are reference counts on it.
#[derive(Debug, Default)]
pub struct CnodeCache {
    map: HashMap<u32, Cnode>,
}

impl CnodeCache {
    pub fn new() -> CnodeCache {
        CnodeCache::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, file_id: u32) -> bool {
        self.map.contains_key(&file_id)
    }

    pub fn get(&mut self, file_id: u32) -> Option<&mut Cnode> {
        self.map.get_mut(&file_id)
    }

    pub fn ids(&self) -> Vec<u32> {
        self.map.keys().copied().collect()
    }

    /// Insert a freshly loaded c-node with one reference. Racing loaders are
    /// serialized by the volume borrow; an existing entry wins and the
    /// caller's copy is dropped.
    pub fn insert(&mut self, mut cnode: Cnode) -> &mut Cnode {
        let id = cnode.file_id;
        match self.map.entry(id) {
            std::collections::hash_map::Entry::Occupied(e) => {
                let existing = e.into_mut();
                existing.refs += 1;
                existing
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                cnode.refs = 1;
                e.insert(cnode)
            }
        }
    }

    /// Drop one reference. When it was the last, the c-node is removed and
    /// handed back so the volume can flush it or run a deferred delete.
    pub fn release(&mut self, file_id: u32) -> Option<Cnode> {
        let last = {
            let c = self.map.get_mut(&file_id)?;
            c.refs = c.refs.saturating_sub(1);
            c.refs == 0
        };
        if last {
            self.map.remove(&file_id)
        } else {
            None
        }
    }

    /// Drop a c-node outright (its object was removed from the catalog).
    pub fn remove(&mut self, file_id: u32) -> Option<Cnode> {
        self.map.remove(&file_id)
    }

    /// Remove every c-node regardless of reference counts (unmount drain).
    pub fn drain_all(&mut self) -> Vec<Cnode> {
        self.map.drain().map(|(_, c)| c).collect()
    }

    /// Invalidate the directory hints of one folder (it changed).
    pub fn invalidate_dir_hints(&mut self, folder_id: u32) {
        if let Some(c) = self.map.get_mut(&folder_id) {
            c.dir_hints.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_ranges_merge_and_split() {
        let mut r = InvalidRanges::new();
        r.add(100, 200);
        r.add(150, 300);
        r.add(400, 500);
        assert_eq!(r.overlaps(0, 1000), vec![(100, 300), (400, 500)]);

        // write into the middle splits a range
        r.remove(120, 130);
        assert_eq!(
            r.overlaps(0, 1000),
            vec![(100, 120), (130, 300), (400, 500)]
        );

        // truncation drops the tail
        r.truncate_to(250);
        assert_eq!(r.overlaps(0, 1000), vec![(100, 120), (130, 250)]);

        r.remove(0, u64::MAX);
        assert!(r.is_empty());
    }

    #[test]
    fn overlaps_clamps_to_query() {
        let mut r = InvalidRanges::new();
        r.add(0, 4096);
        assert_eq!(r.overlaps(1000, 2000), vec![(1000, 2000)]);
        assert!(r.overlaps(4096, 8192).is_empty());
    }

    #[test]
    fn cache_single_instance_per_id() {
        let mut cache = CnodeCache::new();
        let make = |id: u32| Cnode {
            cnid: id,
            file_id: id,
            parent_id: 2,
            name: format!("f{id}"),
            record: CatalogRecord::FileThread(crate::catalog::ThreadRecord {
                parent_id: 2,
                name: vec![],
            }),
            flags: 0,
            link_count: 1,
            deleted: false,
            refs: 0,
            data_fork: None,
            rsrc_fork: None,
            dir_hints: DirHints::new(),
        };
        cache.insert(make(20));
        cache.insert(make(20)); // second open shares the first instance
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(20).unwrap().refs, 2);

        assert!(cache.release(20).is_none(), "still one handle out");
        let last = cache.release(20);
        assert!(last.is_some(), "last release hands the c-node back");
        assert!(cache.is_empty());
    }
}
