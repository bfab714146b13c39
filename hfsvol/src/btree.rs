//! The B-tree engine shared by the catalog, extents-overflow, and attributes
//! files: ordered variable-length key/record storage with node-granular I/O.
//!
//! A tree manages its own node space inside its fork: node 0 is the header
//! node, whose third record is the first chunk of the node-allocation map;
//! overflow map bits live in chained map nodes. Deletion does no aggressive
//! rebalancing (emptied nodes are unlinked and freed, nothing else), matching
//! the on-disk format's expectations.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::cmp::Ordering;
use std::io::Cursor;

use crate::block::{BlockCache, BlockDevice, Buf};
use crate::btnode::{
    Node, NODE_DESCRIPTOR_SIZE, NODE_KIND_HEADER, NODE_KIND_INDEX, NODE_KIND_LEAF, NODE_KIND_MAP,
};
use crate::error::{HfsError, Result};
use crate::extents::{self, ExtendFlags, FORK_TYPE_DATA};
use crate::unicode;
use crate::volume::{ExtentDescriptor, ForkData, Vcb};

/// BTHeaderRec is 106 bytes inside the header node
pub const HEADER_RECORD_SIZE: usize = 106;

/// Record 1 of the header node: opaque 128-byte user area
pub const USER_RECORD_SIZE: usize = 128;

/// Bytes in the header node not available to the map record
/// (descriptor + header record + user record + 4 offset entries)
pub const HEADER_NODE_OVERHEAD: usize =
    NODE_DESCRIPTOR_SIZE + HEADER_RECORD_SIZE + USER_RECORD_SIZE + 8;

/// Bytes in a map node not available to the map record
pub const MAP_NODE_OVERHEAD: usize = 20;

pub const MAX_TREE_DEPTH: usize = 16;

/// On-disk keyCompareType values (HFSX catalog)
pub const COMPARE_TYPE_CASE_FOLD: u8 = 0xCF;
pub const COMPARE_TYPE_BINARY: u8 = 0xBC;

/// Header attribute bits
pub const BT_BIG_KEYS: u32 = 0x0000_0002;
pub const BT_VARIABLE_INDEX_KEYS: u32 = 0x0000_0004;

/// The B-tree header record (record 0 of node 0)
#[derive(Debug, Clone, Default)]
pub struct BTreeHeader {
    pub tree_depth: u16,
    pub root_node: u32,
    pub leaf_records: u32,
    pub first_leaf_node: u32,
    pub last_leaf_node: u32,
    pub node_size: u16,
    pub max_key_length: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    pub clump_size: u32,
    pub btree_type: u8,
    pub key_compare_type: u8,
    pub attributes: u32,
}

impl BTreeHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_RECORD_SIZE {
            return Err(HfsError::BadNode("short btree header record".into()));
        }
        let mut cursor = Cursor::new(buf);
        let tree_depth = cursor.read_u16::<BigEndian>()?;
        let root_node = cursor.read_u32::<BigEndian>()?;
        let leaf_records = cursor.read_u32::<BigEndian>()?;
        let first_leaf_node = cursor.read_u32::<BigEndian>()?;
        let last_leaf_node = cursor.read_u32::<BigEndian>()?;
        let node_size = cursor.read_u16::<BigEndian>()?;
        let max_key_length = cursor.read_u16::<BigEndian>()?;
        let total_nodes = cursor.read_u32::<BigEndian>()?;
        let free_nodes = cursor.read_u32::<BigEndian>()?;
        let _reserved1 = cursor.read_u16::<BigEndian>()?;
        let clump_size = cursor.read_u32::<BigEndian>()?;
        let btree_type = cursor.read_u8()?;
        let key_compare_type = cursor.read_u8()?;
        let attributes = cursor.read_u32::<BigEndian>()?;

        Ok(BTreeHeader {
            tree_depth,
            root_node,
            leaf_records,
            first_leaf_node,
            last_leaf_node,
            node_size,
            max_key_length,
            total_nodes,
            free_nodes,
            clump_size,
            btree_type,
            key_compare_type,
            attributes,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_RECORD_SIZE);
        buf.write_u16::<BigEndian>(self.tree_depth)?;
        buf.write_u32::<BigEndian>(self.root_node)?;
        buf.write_u32::<BigEndian>(self.leaf_records)?;
        buf.write_u32::<BigEndian>(self.first_leaf_node)?;
        buf.write_u32::<BigEndian>(self.last_leaf_node)?;
        buf.write_u16::<BigEndian>(self.node_size)?;
        buf.write_u16::<BigEndian>(self.max_key_length)?;
        buf.write_u32::<BigEndian>(self.total_nodes)?;
        buf.write_u32::<BigEndian>(self.free_nodes)?;
        buf.write_u16::<BigEndian>(0)?; // reserved
        buf.write_u32::<BigEndian>(self.clump_size)?;
        buf.write_u8(self.btree_type)?;
        buf.write_u8(self.key_compare_type)?;
        buf.write_u32::<BigEndian>(self.attributes)?;
        buf.resize(HEADER_RECORD_SIZE, 0);
        Ok(buf)
    }
}

/// Key ordering a tree was created with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCompare {
    /// Catalog keys, case-insensitive folded names (HFS+)
    CaseFold,
    /// Catalog keys, binary names (HFSX)
    Binary,
    /// Extents-overflow keys: (fileID, forkType, startBlock)
    Extents,
}

impl KeyCompare {
    pub fn on_disk_type(&self) -> u8 {
        match self {
            KeyCompare::CaseFold => COMPARE_TYPE_CASE_FOLD,
            KeyCompare::Binary => COMPARE_TYPE_BINARY,
            KeyCompare::Extents => 0,
        }
    }

    /// Compare two key payloads (without their u16 length prefixes).
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        match self {
            KeyCompare::CaseFold | KeyCompare::Binary => {
                let (pa, na) = parse_catalog_key_parts(a)?;
                let (pb, nb) = parse_catalog_key_parts(b)?;
                match pa.cmp(&pb) {
                    Ordering::Equal => {}
                    ord => return Ok(ord),
                }
                Ok(match self {
                    KeyCompare::CaseFold => unicode::compare_case_insensitive(&na, &nb),
                    _ => unicode::compare_binary(&na, &nb),
                })
            }
            KeyCompare::Extents => {
                let (fa, ta, sa) = parse_extent_key_parts(a)?;
                let (fb, tb, sb) = parse_extent_key_parts(b)?;
                match fa.cmp(&fb) {
                    Ordering::Equal => {}
                    ord => return Ok(ord),
                }
                match ta.cmp(&tb) {
                    Ordering::Equal => {}
                    ord => return Ok(ord),
                }
                Ok(sa.cmp(&sb))
            }
        }
    }
}

fn parse_catalog_key_parts(key: &[u8]) -> Result<(u32, Vec<u16>)> {
    if key.len() < 6 {
        return Err(HfsError::BadNode("catalog key too short".into()));
    }
    let parent = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
    let name_len = u16::from_be_bytes([key[4], key[5]]) as usize;
    if 6 + name_len * 2 > key.len() {
        return Err(HfsError::BadNode("catalog key name overruns key".into()));
    }
    Ok((parent, unicode::utf16be_to_u16(&key[6..6 + name_len * 2])))
}

fn parse_extent_key_parts(key: &[u8]) -> Result<(u32, u8, u32)> {
    if key.len() < 10 {
        return Err(HfsError::BadNode("extent key too short".into()));
    }
    let fork_type = key[0];
    let file_id = u32::from_be_bytes([key[2], key[3], key[4], key[5]]);
    let start = u32::from_be_bytes([key[6], key[7], key[8], key[9]]);
    Ok((file_id, fork_type, start))
}

/// Split a record into (key payload, record payload).
pub fn record_key(rec: &[u8]) -> Result<(&[u8], &[u8])> {
    if rec.len() < 2 {
        return Err(HfsError::BadNode("record too short for key length".into()));
    }
    let key_len = u16::from_be_bytes([rec[0], rec[1]]) as usize;
    let mut data_off = 2 + key_len;
    if data_off > rec.len() {
        return Err(HfsError::BadNode("key overruns record".into()));
    }
    if data_off % 2 != 0 {
        data_off += 1; // records stay 2-byte aligned
    }
    let data_off = data_off.min(rec.len());
    Ok((&rec[2..2 + key_len], &rec[data_off..]))
}

/// Assemble an on-disk record from a key payload and record payload.
pub fn make_record(key: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    if key.len() > u16::MAX as usize {
        return Err(HfsError::BadNode("key too long".into()));
    }
    let mut rec = Vec::with_capacity(2 + key.len() + 1 + payload.len());
    rec.extend_from_slice(&(key.len() as u16).to_be_bytes());
    rec.extend_from_slice(key);
    if rec.len() % 2 != 0 {
        rec.push(0);
    }
    rec.extend_from_slice(payload);
    if rec.len() % 2 != 0 {
        rec.push(0);
    }
    Ok(rec)
}

fn index_child(payload: &[u8]) -> Result<u32> {
    if payload.len() < 4 {
        return Err(HfsError::BadNode("index record missing child pointer".into()));
    }
    Ok(u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]))
}

/// Restartable leaf cursor: (node, record index)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeIter {
    pub node: u32,
    pub index: u16,
}

/// Result of a descent from the root
#[derive(Debug, Clone)]
pub struct Descent {
    /// (index node, followed child record) per level, root first
    pub path: Vec<(u32, u16)>,
    pub found: bool,
    pub leaf: u32,
    pub index: u16,
}

/// A leased node plus the state needed to check it back in
struct NodeLease {
    off: u64,
    dirty: bool,
    node: Node,
}

fn reborrow<'a>(o: &'a mut Option<&mut BTree>) -> Option<&'a mut BTree> {
    o.as_mut().map(|t| &mut **t)
}

/// An open B-tree over a system-file fork.
#[derive(Debug)]
pub struct BTree {
    pub file_id: u32,
    pub fork: ForkData,
    pub header: BTreeHeader,
    pub compare: KeyCompare,
    /// Flattened fork mapping: inline extents then overflow extents
    pub extent_map: Vec<ExtentDescriptor>,
    /// Header or node contents modified since the last volume flush
    pub dirty: bool,
    pub last_sync: u32,
}

impl BTree {
    /// Open a tree from its fork record. The caller loads overflow extents
    /// afterwards when the fork has more than eight (`load_overflow`).
    pub fn open<D: BlockDevice>(
        dev: &mut BlockCache<D>,
        vcb: &Vcb,
        file_id: u32,
        fork: ForkData,
        compare: KeyCompare,
    ) -> Result<BTree> {
        if fork.is_empty() {
            return Err(HfsError::BadFormat(format!(
                "system file {file_id} has an empty fork"
            )));
        }
        let inline: Vec<ExtentDescriptor> = fork
            .extents
            .iter()
            .copied()
            .take_while(|e| e.block_count > 0)
            .collect();

        // Bootstrap: the node size is only known after reading the header
        // record, which always fits in the first 512 bytes of node 0.
        let off0 = extents::map_range(vcb, &inline, 0, 512)?;
        let probe = dev.read(off0, 512)?;
        let kind = probe.data()[8] as i8;
        if kind != NODE_KIND_HEADER {
            let got = probe.data()[8];
            dev.invalidate(probe);
            return Err(HfsError::BadNode(format!(
                "expected header node, got kind {got}"
            )));
        }
        let header = BTreeHeader::parse(
            &probe.data()[NODE_DESCRIPTOR_SIZE..NODE_DESCRIPTOR_SIZE + HEADER_RECORD_SIZE],
        );
        dev.invalidate(probe);
        let header = header?;

        let ns = header.node_size as usize;
        if !ns.is_power_of_two() || !(512..=32768).contains(&ns) {
            return Err(HfsError::BadNode(format!("node size {ns} out of range")));
        }
        if header.total_nodes == 0
            || header.total_nodes as u64 * ns as u64
                > fork.total_blocks as u64 * vcb.block_size as u64
        {
            return Err(HfsError::BadNode("node count exceeds fork".into()));
        }
        if header.root_node >= header.total_nodes
            || header.tree_depth as usize > MAX_TREE_DEPTH
        {
            return Err(HfsError::BadNode("header root/depth invalid".into()));
        }

        Ok(BTree {
            file_id,
            fork,
            header,
            compare,
            extent_map: inline,
            dirty: false,
            last_sync: 0,
        })
    }

    /// Pull overflow extents for this fork out of the extents tree.
    pub fn load_overflow<D: BlockDevice>(
        &mut self,
        dev: &mut BlockCache<D>,
        vcb: &Vcb,
        extents_tree: &BTree,
    ) -> Result<()> {
        self.extent_map = extents::load_extent_map(
            dev,
            vcb,
            extents_tree,
            self.file_id,
            FORK_TYPE_DATA,
            &self.fork,
        )?;
        Ok(())
    }

    pub fn get_info(&self) -> &BTreeHeader {
        &self.header
    }

    pub fn set_last_sync(&mut self, time: u32) {
        self.last_sync = time;
    }

    // ── node I/O ────────────────────────────────────────────────────────

    fn node_disk_offset(&self, vcb: &Vcb, node_num: u32) -> Result<u64> {
        let ns = self.header.node_size as u64;
        extents::map_range(vcb, &self.extent_map, node_num as u64 * ns, ns)
    }

    fn read_node<D: BlockDevice>(
        &self,
        dev: &mut BlockCache<D>,
        vcb: &Vcb,
        num: u32,
    ) -> Result<NodeLease> {
        if num >= self.header.total_nodes {
            return Err(HfsError::BadNode(format!(
                "node {num} beyond total {}",
                self.header.total_nodes
            )));
        }
        let off = self.node_disk_offset(vcb, num)?;
        let buf = dev.read(off, self.header.node_size as usize)?;
        let dirty = buf.is_dirty();
        match Node::from_buf(buf.into_data()) {
            Ok(node) => Ok(NodeLease { off, dirty, node }),
            Err(e) => {
                dev.invalidate_offset(off);
                Err(e)
            }
        }
    }

    fn put<D: BlockDevice>(&self, dev: &mut BlockCache<D>, lease: NodeLease) {
        dev.release(Buf::from_parts(lease.off, lease.node.into_data(), lease.dirty));
    }

    fn put_dirty<D: BlockDevice>(&self, dev: &mut BlockCache<D>, lease: NodeLease) {
        dev.write_delayed(Buf::from_parts(lease.off, lease.node.into_data(), true));
    }

    /// Write a freshly built node image into place (no prior read).
    fn put_new<D: BlockDevice>(
        &self,
        dev: &mut BlockCache<D>,
        vcb: &Vcb,
        num: u32,
        node: &Node,
    ) -> Result<()> {
        let off = self.node_disk_offset(vcb, num)?;
        let mut buf = dev.get(off, self.header.node_size as usize)?;
        buf.data_mut().copy_from_slice(node.data());
        dev.write_delayed(buf);
        Ok(())
    }

    // ── search ──────────────────────────────────────────────────────────

    /// Binary search within one node. Returns (exact, insertion index):
    /// the index of the match, or of the first record with a greater key.
    fn node_search(&self, node: &Node, key: &[u8]) -> Result<(bool, usize)> {
        let n = node.num_records() as usize;
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let rec = node.record(mid)?;
            let (rkey, _) = record_key(rec)?;
            match self.compare.compare(rkey, key)? {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok((true, mid)),
            }
        }
        Ok((false, lo))
    }

    /// Descend from the root to the leaf that covers `key`.
    pub fn descend<D: BlockDevice>(
        &self,
        dev: &mut BlockCache<D>,
        vcb: &Vcb,
        key: &[u8],
    ) -> Result<Descent> {
        let mut path = Vec::new();
        let mut num = self.header.root_node;
        if num == 0 {
            return Ok(Descent {
                path,
                found: false,
                leaf: 0,
                index: 0,
            });
        }
        loop {
            if path.len() > MAX_TREE_DEPTH {
                return Err(HfsError::BadNode("descent exceeds maximum depth".into()));
            }
            let lease = self.read_node(dev, vcb, num)?;
            let step = (|| -> Result<std::result::Result<(bool, u16), u32>> {
                match lease.node.kind() {
                    NODE_KIND_LEAF => {
                        let (found, idx) = self.node_search(&lease.node, key)?;
                        Ok(Ok((found, idx as u16)))
                    }
                    NODE_KIND_INDEX => {
                        if lease.node.num_records() == 0 {
                            return Err(HfsError::BadNode("empty index node".into()));
                        }
                        let (found, ip) = self.node_search(&lease.node, key)?;
                        let child_idx = if found {
                            ip
                        } else {
                            ip.saturating_sub(1)
                        };
                        let rec = lease.node.record(child_idx)?;
                        let (_, payload) = record_key(rec)?;
                        let child = index_child(payload)?;
                        path.push((num, child_idx as u16));
                        Ok(Err(child))
                    }
                    other => Err(HfsError::BadNode(format!(
                        "node kind {other} in descent"
                    ))),
                }
            })();
            self.put(dev, lease);
            match step? {
                Ok((found, idx)) => {
                    return Ok(Descent {
                        path,
                        found,
                        leaf: num,
                        index: idx,
                    })
                }
                Err(child) => num = child,
            }
        }
    }

    /// Exact search: (found, leaf node, record index or insertion point).
    pub fn search<D: BlockDevice>(
        &self,
        dev: &mut BlockCache<D>,
        vcb: &Vcb,
        key: &[u8],
    ) -> Result<(bool, u32, u16)> {
        let d = self.descend(dev, vcb, key)?;
        Ok((d.found, d.leaf, d.index))
    }

    /// Copy out the payload for `key`, if present.
    pub fn lookup<D: BlockDevice>(
        &self,
        dev: &mut BlockCache<D>,
        vcb: &Vcb,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let d = self.descend(dev, vcb, key)?;
        if !d.found {
            return Ok(None);
        }
        let lease = self.read_node(dev, vcb, d.leaf)?;
        let out = lease
            .node
            .record(d.index as usize)
            .and_then(record_key)
            .map(|(_, payload)| payload.to_vec());
        self.put(dev, lease);
        Ok(Some(out?))
    }

    /// Like `lookup`, but a (node, index) hint from a previous search may
    /// short-circuit the descent. A stale hint silently falls back.
    pub fn lookup_with_hint<D: BlockDevice>(
        &self,
        dev: &mut BlockCache<D>,
        vcb: &Vcb,
        key: &[u8],
        hint: Option<BTreeIter>,
    ) -> Result<Option<(Vec<u8>, BTreeIter)>> {
        if let Some(h) = hint {
            if h.node != 0 && h.node < self.header.total_nodes {
                if let Ok(lease) = self.read_node(dev, vcb, h.node) {
                    let mut out = None;
                    if lease.node.kind() == NODE_KIND_LEAF && lease.node.num_records() > 0 {
                        let covers = (|| -> Result<bool> {
                            let first = record_key(lease.node.record(0)?)?.0;
                            let last = record_key(
                                lease.node.record(lease.node.num_records() as usize - 1)?,
                            )?
                            .0;
                            Ok(self.compare.compare(first, key)? != Ordering::Greater
                                && self.compare.compare(last, key)? != Ordering::Less)
                        })()
                        .unwrap_or(false);
                        if covers {
                            if let Ok((true, idx)) = self.node_search(&lease.node, key) {
                                if let Ok(rec) = lease.node.record(idx) {
                                    if let Ok((_, payload)) = record_key(rec) {
                                        out = Some((
                                            payload.to_vec(),
                                            BTreeIter {
                                                node: h.node,
                                                index: idx as u16,
                                            },
                                        ));
                                    }
                                }
                            }
                        }
                    }
                    self.put(dev, lease);
                    if out.is_some() {
                        return Ok(out);
                    }
                }
            }
        }
        let d = self.descend(dev, vcb, key)?;
        if !d.found {
            return Ok(None);
        }
        let lease = self.read_node(dev, vcb, d.leaf)?;
        let out = lease
            .node
            .record(d.index as usize)
            .and_then(record_key)
            .map(|(_, payload)| payload.to_vec());
        self.put(dev, lease);
        Ok(Some((
            out?,
            BTreeIter {
                node: d.leaf,
                index: d.index,
            },
        )))
    }

    /// Greatest record with key <= `key` (used by the extent manager).
    pub fn search_le<D: BlockDevice>(
        &self,
        dev: &mut BlockCache<D>,
        vcb: &Vcb,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.header.root_node == 0 {
            return Ok(None);
        }
        let d = self.descend(dev, vcb, key)?;
        let (node_num, index) = if d.found {
            (d.leaf, d.index as usize)
        } else if d.index > 0 {
            (d.leaf, d.index as usize - 1)
        } else {
            // every key in this leaf is greater; step to the previous leaf
            let lease = self.read_node(dev, vcb, d.leaf)?;
            let prev = lease.node.backward_link();
            self.put(dev, lease);
            if prev == 0 {
                return Ok(None);
            }
            let lease = self.read_node(dev, vcb, prev)?;
            let n = lease.node.num_records();
            self.put(dev, lease);
            if n == 0 {
                return Ok(None);
            }
            (prev, n as usize - 1)
        };
        let lease = self.read_node(dev, vcb, node_num)?;
        let out = lease.node.record(index).and_then(|rec| {
            let (k, p) = record_key(rec)?;
            Ok((k.to_vec(), p.to_vec()))
        });
        self.put(dev, lease);
        Ok(Some(out?))
    }

    // ── iteration ───────────────────────────────────────────────────────

    /// Cursor at the first record in key order.
    pub fn iter_start(&self) -> BTreeIter {
        BTreeIter {
            node: self.header.first_leaf_node,
            index: 0,
        }
    }

    /// Cursor at the first record with key >= `key`.
    pub fn iter_seek_ge<D: BlockDevice>(
        &self,
        dev: &mut BlockCache<D>,
        vcb: &Vcb,
        key: &[u8],
    ) -> Result<BTreeIter> {
        if self.header.root_node == 0 {
            return Ok(BTreeIter { node: 0, index: 0 });
        }
        let d = self.descend(dev, vcb, key)?;
        let lease = self.read_node(dev, vcb, d.leaf)?;
        let n = lease.node.num_records();
        let flink = lease.node.forward_link();
        self.put(dev, lease);
        if (d.index as usize) < n as usize {
            Ok(BTreeIter {
                node: d.leaf,
                index: d.index,
            })
        } else {
            Ok(BTreeIter {
                node: flink,
                index: 0,
            })
        }
    }

    /// Yield the record under the cursor and advance. The engine holds no
    /// state between calls; the client relocks between steps.
    pub fn iter_next<D: BlockDevice>(
        &self,
        dev: &mut BlockCache<D>,
        vcb: &Vcb,
        it: &mut BTreeIter,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            if it.node == 0 {
                return Ok(None);
            }
            let lease = self.read_node(dev, vcb, it.node)?;
            if lease.node.kind() != NODE_KIND_LEAF {
                self.put(dev, lease);
                return Err(HfsError::BadNode("iterator left the leaf chain".into()));
            }
            if (it.index as usize) < lease.node.num_records() as usize {
                let out = lease.node.record(it.index as usize).and_then(|rec| {
                    let (k, p) = record_key(rec)?;
                    Ok((k.to_vec(), p.to_vec()))
                });
                self.put(dev, lease);
                it.index += 1;
                return Ok(Some(out?));
            }
            let next = lease.node.forward_link();
            self.put(dev, lease);
            *it = BTreeIter {
                node: next,
                index: 0,
            };
        }
    }

    // ── mutation ────────────────────────────────────────────────────────

    /// Insert a record; fails with `Exists` on a duplicate key.
    pub fn insert<D: BlockDevice>(
        &mut self,
        dev: &mut BlockCache<D>,
        vcb: &mut Vcb,
        mut overflow: Option<&mut BTree>,
        key: &[u8],
        payload: &[u8],
    ) -> Result<()> {
        let rec = make_record(key, payload)?;
        let ns = self.header.node_size as usize;
        if rec.len() + 2 > ns - NODE_DESCRIPTOR_SIZE - 2 {
            return Err(HfsError::BadNode("record larger than a node".into()));
        }

        if self.header.root_node == 0 {
            let num = self.allocate_node(dev, vcb, reborrow(&mut overflow))?;
            let mut node = Node::new(ns, NODE_KIND_LEAF, 1);
            node.insert_record(0, &rec)?;
            self.put_new(dev, vcb, num, &node)?;
            self.header.root_node = num;
            self.header.first_leaf_node = num;
            self.header.last_leaf_node = num;
            self.header.tree_depth = 1;
            self.header.leaf_records = 1;
            self.dirty = true;
            vcb.dirty = true;
            return self.flush_header(dev, vcb);
        }

        let d = self.descend(dev, vcb, key)?;
        if d.found {
            return Err(HfsError::Exists("duplicate b-tree key".into()));
        }

        let mut level = d.path.len();
        let mut target_num = d.leaf;
        let mut target_idx = d.index as usize;
        let mut insert_rec = rec;

        loop {
            let mut lease = self.read_node(dev, vcb, target_num)?;
            if lease.node.can_fit(insert_rec.len()) {
                match lease.node.insert_record(target_idx, &insert_rec) {
                    Ok(()) => {
                        self.put_dirty(dev, lease);
                        break;
                    }
                    Err(e) => {
                        self.put(dev, lease);
                        return Err(e);
                    }
                }
            }

            // split: distribute records by bytes between this node and a new
            // right sibling, then promote the sibling's first key
            let is_leaf = lease.node.kind() == NODE_KIND_LEAF;
            let height = lease.node.height();
            let kind = lease.node.kind();
            let x_flink = lease.node.forward_link();
            let x_blink = lease.node.backward_link();
            let x_off = lease.off;

            let n = lease.node.num_records() as usize;
            let mut recs: Vec<Vec<u8>> = Vec::with_capacity(n + 1);
            for i in 0..n {
                let r = lease.node.record(i).map(|r| r.to_vec());
                match r {
                    Ok(r) => recs.push(r),
                    Err(e) => {
                        self.put(dev, lease);
                        return Err(e);
                    }
                }
            }
            self.put(dev, lease);
            recs.insert(target_idx, insert_rec.clone());

            let y_num = self.allocate_node(dev, vcb, reborrow(&mut overflow))?;

            let total: usize = recs.iter().map(|r| r.len() + 2).sum();
            let mut split = 0usize;
            let mut acc = 0usize;
            while split < recs.len() && acc + recs[split].len() + 2 <= total / 2 {
                acc += recs[split].len() + 2;
                split += 1;
            }
            let split = split.clamp(1, recs.len() - 1);

            let mut xnode = Node::new(ns, kind, height);
            xnode.set_backward_link(x_blink);
            xnode.set_forward_link(y_num);
            for (i, r) in recs[..split].iter().enumerate() {
                xnode.insert_record(i, r)?;
            }
            let mut ynode = Node::new(ns, kind, height);
            ynode.set_backward_link(target_num);
            ynode.set_forward_link(x_flink);
            for (i, r) in recs[split..].iter().enumerate() {
                ynode.insert_record(i, r)?;
            }

            // rewrite the split node in place and write the new sibling
            let mut xb = dev.read(x_off, ns)?;
            xb.data_mut().copy_from_slice(xnode.data());
            dev.write_delayed(xb);
            self.put_new(dev, vcb, y_num, &ynode)?;

            if x_flink != 0 {
                let mut zl = self.read_node(dev, vcb, x_flink)?;
                zl.node.set_backward_link(y_num);
                self.put_dirty(dev, zl);
            } else if is_leaf {
                self.header.last_leaf_node = y_num;
            }

            let (ykey, _) = record_key(&recs[split])?;
            let promoted = make_record(ykey, &y_num.to_be_bytes())?;

            if level == 0 {
                // the root itself split: grow the tree by one level
                let (xkey, _) = record_key(&recs[0])?;
                let left_rec = make_record(xkey, &target_num.to_be_bytes())?;
                let root_num = self.allocate_node(dev, vcb, reborrow(&mut overflow))?;
                let mut root = Node::new(ns, NODE_KIND_INDEX, height + 1);
                root.insert_record(0, &left_rec)?;
                root.insert_record(1, &promoted)?;
                self.put_new(dev, vcb, root_num, &root)?;
                self.header.root_node = root_num;
                self.header.tree_depth += 1;
                break;
            }

            level -= 1;
            let (pnum, pidx) = d.path[level];
            target_num = pnum;
            target_idx = pidx as usize + 1;
            insert_rec = promoted;
        }

        self.header.leaf_records += 1;
        self.dirty = true;
        vcb.dirty = true;
        self.flush_header(dev, vcb)
    }

    /// Overwrite the payload for an existing key.
    pub fn replace<D: BlockDevice>(
        &mut self,
        dev: &mut BlockCache<D>,
        vcb: &mut Vcb,
        overflow: Option<&mut BTree>,
        key: &[u8],
        payload: &[u8],
    ) -> Result<()> {
        let d = self.descend(dev, vcb, key)?;
        if !d.found {
            return Err(HfsError::NotFound("b-tree key".into()));
        }
        let rec = make_record(key, payload)?;
        let mut lease = self.read_node(dev, vcb, d.leaf)?;
        let old_len = lease.node.record_len(d.index as usize)?;
        let fits = rec.len() <= old_len
            || lease.node.free_space() >= rec.len() - old_len;
        if fits {
            match lease.node.replace_record(d.index as usize, &rec) {
                Ok(()) => {
                    self.put_dirty(dev, lease);
                    self.dirty = true;
                    vcb.dirty = true;
                    return self.flush_header(dev, vcb);
                }
                Err(e) => {
                    self.put(dev, lease);
                    return Err(e);
                }
            }
        }
        self.put(dev, lease);
        // grew past the node: fall back to delete + insert
        self.delete(dev, vcb, key)?;
        self.insert(dev, vcb, overflow, key, payload)
    }

    /// Delete a record; emptied nodes are unlinked and freed, and an index
    /// root left with a single child collapses.
    pub fn delete<D: BlockDevice>(
        &mut self,
        dev: &mut BlockCache<D>,
        vcb: &mut Vcb,
        key: &[u8],
    ) -> Result<()> {
        let d = self.descend(dev, vcb, key)?;
        if !d.found {
            return Err(HfsError::NotFound("b-tree key".into()));
        }

        let mut level = d.path.len();
        let mut target_num = d.leaf;
        let mut target_idx = d.index as usize;

        loop {
            let mut lease = self.read_node(dev, vcb, target_num)?;
            let is_leaf = lease.node.kind() == NODE_KIND_LEAF;
            if let Err(e) = lease.node.remove_record(target_idx) {
                self.put(dev, lease);
                return Err(e);
            }
            let remaining = lease.node.num_records();
            let is_root = target_num == self.header.root_node;

            if remaining > 0 {
                if is_root && !is_leaf && remaining == 1 {
                    // collapse: the surviving child becomes the root
                    let child = (|| -> Result<u32> {
                        let rec = lease.node.record(0)?;
                        let (_, payload) = record_key(rec)?;
                        index_child(payload)
                    })();
                    let off = lease.off;
                    self.put(dev, lease);
                    let child = child?;
                    dev.discard(off);
                    self.free_node(dev, vcb, target_num)?;
                    self.header.root_node = child;
                    self.header.tree_depth = self.header.tree_depth.saturating_sub(1);
                } else {
                    self.put_dirty(dev, lease);
                }
                break;
            }

            // node emptied: unlink from its chain and free it
            let flink = lease.node.forward_link();
            let blink = lease.node.backward_link();
            let off = lease.off;
            self.put(dev, lease);
            dev.discard(off);

            if blink != 0 {
                let mut pl = self.read_node(dev, vcb, blink)?;
                pl.node.set_forward_link(flink);
                self.put_dirty(dev, pl);
            }
            if flink != 0 {
                let mut nl = self.read_node(dev, vcb, flink)?;
                nl.node.set_backward_link(blink);
                self.put_dirty(dev, nl);
            }
            if is_leaf {
                if self.header.first_leaf_node == target_num {
                    self.header.first_leaf_node = flink;
                }
                if self.header.last_leaf_node == target_num {
                    self.header.last_leaf_node = blink;
                }
            }
            self.free_node(dev, vcb, target_num)?;

            if is_root {
                self.header.root_node = 0;
                self.header.tree_depth = 0;
                self.header.first_leaf_node = 0;
                self.header.last_leaf_node = 0;
                break;
            }

            level -= 1;
            let (pnum, pidx) = d.path[level];
            target_num = pnum;
            target_idx = pidx as usize;
        }

        self.header.leaf_records = self.header.leaf_records.saturating_sub(1);
        self.dirty = true;
        vcb.dirty = true;
        self.flush_header(dev, vcb)
    }

    // ── node map ────────────────────────────────────────────────────────

    fn map_record_bounds(node: &Node, map_node: u32) -> Result<(usize, usize)> {
        let rec_idx = if map_node == 0 { 2 } else { 0 };
        if (node.num_records() as usize) <= rec_idx {
            return Err(HfsError::BadNode("map record missing".into()));
        }
        let start = node.offset_entry(rec_idx) as usize;
        let end = node.offset_entry(rec_idx + 1) as usize;
        if start >= end || end > node.size() {
            return Err(HfsError::BadNode("map record bounds invalid".into()));
        }
        Ok((start, end))
    }

    /// Total map bits and the last map node in the chain (0 = header node).
    fn map_capacity<D: BlockDevice>(
        &self,
        dev: &mut BlockCache<D>,
        vcb: &Vcb,
    ) -> Result<(u32, u32)> {
        let mut bits = 0u32;
        let mut map_node = 0u32;
        loop {
            let lease = self.read_node(dev, vcb, map_node)?;
            let r = Self::map_record_bounds(&lease.node, map_node);
            let next = lease.node.forward_link();
            let chunk = match &r {
                Ok((s, e)) => ((e - s) * 8) as u32,
                Err(_) => 0,
            };
            self.put(dev, lease);
            r?;
            bits += chunk;
            if next == 0 {
                return Ok((bits, map_node));
            }
            map_node = next;
        }
    }

    /// Find, claim, and return a free node number, growing the tree if the
    /// map has no free bits left.
    pub fn allocate_node<D: BlockDevice>(
        &mut self,
        dev: &mut BlockCache<D>,
        vcb: &mut Vcb,
        mut overflow: Option<&mut BTree>,
    ) -> Result<u32> {
        for _ in 0..2 {
            let mut base = 0u32;
            let mut map_node = 0u32;
            let mut exhausted = false;
            loop {
                let mut lease = self.read_node(dev, vcb, map_node)?;
                let bounds = Self::map_record_bounds(&lease.node, map_node);
                let (start, end) = match bounds {
                    Ok(b) => b,
                    Err(e) => {
                        self.put(dev, lease);
                        return Err(e);
                    }
                };
                let chunk_bits = ((end - start) * 8) as u32;
                let mut claimed: Option<u32> = None;
                {
                    let data = lease.node.data_mut();
                    'scan: for (bi, pos) in (start..end).enumerate() {
                        if data[pos] != 0xFF {
                            for bit in 0..8u32 {
                                let mask = 0x80u8 >> bit;
                                if data[pos] & mask == 0 {
                                    let num = base + bi as u32 * 8 + bit;
                                    if num < self.header.total_nodes {
                                        data[pos] |= mask;
                                        claimed = Some(num);
                                    } else {
                                        exhausted = true;
                                    }
                                    break 'scan;
                                }
                            }
                        }
                    }
                }
                let next = lease.node.forward_link();
                if let Some(num) = claimed {
                    self.put_dirty(dev, lease);
                    self.header.free_nodes = self.header.free_nodes.saturating_sub(1);
                    self.dirty = true;
                    return Ok(num);
                }
                self.put(dev, lease);
                if exhausted || next == 0 {
                    break;
                }
                base += chunk_bits;
                map_node = next;
            }
            self.extend_tree(dev, vcb, reborrow(&mut overflow))?;
        }
        Err(HfsError::BadNode("node map still full after growth".into()))
    }

    /// Clear a node's map bit.
    pub fn free_node<D: BlockDevice>(
        &mut self,
        dev: &mut BlockCache<D>,
        vcb: &mut Vcb,
        num: u32,
    ) -> Result<()> {
        if num >= self.header.total_nodes {
            return Err(HfsError::BadNode(format!("freeing node {num} beyond map")));
        }
        let mut base = 0u32;
        let mut map_node = 0u32;
        loop {
            let mut lease = self.read_node(dev, vcb, map_node)?;
            let bounds = Self::map_record_bounds(&lease.node, map_node);
            let (start, end) = match bounds {
                Ok(b) => b,
                Err(e) => {
                    self.put(dev, lease);
                    return Err(e);
                }
            };
            let chunk_bits = ((end - start) * 8) as u32;
            if num < base + chunk_bits {
                let rel = (num - base) as usize;
                let pos = start + rel / 8;
                let mask = 0x80u8 >> (rel % 8);
                let data = lease.node.data_mut();
                if data[pos] & mask == 0 {
                    self.put(dev, lease);
                    return Err(HfsError::BadNode(format!("node {num} already free")));
                }
                data[pos] &= !mask;
                self.put_dirty(dev, lease);
                self.header.free_nodes += 1;
                self.dirty = true;
                return Ok(());
            }
            let next = lease.node.forward_link();
            self.put(dev, lease);
            if next == 0 {
                return Err(HfsError::BadNode(format!("node {num} beyond map chain")));
            }
            base += chunk_bits;
            map_node = next;
        }
    }

    /// Grow the underlying fork by one clump and extend the node map over
    /// the new space, chaining new map nodes as needed.
    fn extend_tree<D: BlockDevice>(
        &mut self,
        dev: &mut BlockCache<D>,
        vcb: &mut Vcb,
        overflow: Option<&mut BTree>,
    ) -> Result<()> {
        let ns = self.header.node_size as u32;
        let bs = vcb.block_size;
        let clump = if self.header.clump_size > 0 {
            self.header.clump_size
        } else {
            ns * 8
        };
        let want_bytes = clump.max(ns).max(bs) as u64;
        let flags = ExtendFlags {
            no_clump_round: true,
            run_multiple: (ns / bs).max(1),
            ..ExtendFlags::default()
        };

        let old_total = self.header.total_nodes;
        let added = extents::extend_fork(
            dev,
            vcb,
            overflow,
            self.file_id,
            FORK_TYPE_DATA,
            &mut self.fork,
            Some(&mut self.extent_map),
            want_bytes,
            flags,
        )?;
        if added == 0 {
            return Err(HfsError::DiskFull);
        }
        self.fork.logical_size = self.fork.total_blocks as u64 * bs as u64;

        let new_total =
            (self.fork.total_blocks as u64 * bs as u64 / ns as u64).min(u32::MAX as u64) as u32;
        if new_total <= old_total {
            return Err(HfsError::DiskFull);
        }
        log::debug!(
            "btree file {}: extending {} -> {} nodes",
            self.file_id,
            old_total,
            new_total
        );

        // zero the new node space so map scans and node reads see clean state
        for num in old_total..new_total {
            let ns_usize = ns as usize;
            let off = {
                let fork_off = num as u64 * ns as u64;
                extents::map_range(vcb, &self.extent_map, fork_off, ns as u64)?
            };
            let buf = dev.get(off, ns_usize)?;
            dev.write_delayed(buf);
        }

        self.header.total_nodes = new_total;
        self.header.free_nodes += new_total - old_total;

        let (mut map_bits, mut last_map) = self.map_capacity(dev, vcb)?;
        while map_bits < new_total {
            let map_num = map_bits;
            let map_rec_len = ns as usize - MAP_NODE_OVERHEAD;
            let mut mnode = Node::new(ns as usize, NODE_KIND_MAP, 0);
            mnode.insert_record(0, &vec![0u8; map_rec_len])?;
            {
                // the map node occupies the first bit of its own chunk
                let start = mnode.offset_entry(0) as usize;
                mnode.data_mut()[start] |= 0x80;
            }
            self.put_new(dev, vcb, map_num, &mnode)?;

            let mut pl = self.read_node(dev, vcb, last_map)?;
            pl.node.set_forward_link(map_num);
            self.put_dirty(dev, pl);

            self.header.free_nodes = self.header.free_nodes.saturating_sub(1);
            map_bits += (map_rec_len * 8) as u32;
            last_map = map_num;
        }

        self.dirty = true;
        vcb.dirty = true;
        self.flush_header(dev, vcb)
    }

    /// Force this tree's modified state out: delayed node writes first,
    /// the header record last.
    pub fn flush<D: BlockDevice>(&mut self, dev: &mut BlockCache<D>, vcb: &Vcb) -> Result<()> {
        if self.dirty {
            dev.flush()?;
            self.flush_header(dev, vcb)?;
            dev.flush()?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Write the in-memory header record into node 0 (delayed).
    pub fn flush_header<D: BlockDevice>(
        &mut self,
        dev: &mut BlockCache<D>,
        vcb: &Vcb,
    ) -> Result<()> {
        let bytes = self.header.to_bytes()?;
        let mut lease = self.read_node(dev, vcb, 0)?;
        match lease.node.replace_record(0, &bytes) {
            Ok(()) => {
                self.put_dirty(dev, lease);
                Ok(())
            }
            Err(e) => {
                self.put(dev, lease);
                Err(e)
            }
        }
    }
}

/// Build a complete header node image (used when a tree is first laid down).
/// `used_nodes` marks nodes 0..used_nodes as allocated in the map record.
pub fn build_header_node(header: &BTreeHeader, used_nodes: u32) -> Result<Node> {
    let ns = header.node_size as usize;
    let mut node = Node::new(ns, NODE_KIND_HEADER, 0);
    node.insert_record(0, &header.to_bytes()?)?;
    node.insert_record(1, &[0u8; USER_RECORD_SIZE])?;
    let mut map = vec![0u8; ns - HEADER_NODE_OVERHEAD];
    for n in 0..used_nodes as usize {
        map[n / 8] |= 0x80 >> (n % 8);
    }
    node.insert_record(2, &map)?;
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::MountOptions;
    use std::io::Cursor as IoCursor;

    const BS: u32 = 512;
    const NS: u16 = 512;

    /// Build a standalone tree in a scratch "volume": one fork extent large
    /// enough that no extension is needed.
    fn test_tree(
        total_nodes: u32,
    ) -> (BlockCache<IoCursor<Vec<u8>>>, Vcb, BTree) {
        let dev_bytes = (total_nodes as usize + 8) * NS as usize;
        let mut dev = BlockCache::new(IoCursor::new(vec![0u8; dev_bytes]));

        let mut header = crate::volume::VolumeHeader {
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
            total_blocks: (dev_bytes as u32) / BS,
            free_blocks: 0,
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
        header.catalog_file.total_blocks = total_nodes;
        header.catalog_file.logical_size = total_nodes as u64 * NS as u64;
        header.catalog_file.extents[0] = ExtentDescriptor {
            start_block: 1,
            block_count: total_nodes,
        };
        let vcb = Vcb::from_header(&header, 0, &MountOptions::default());

        let bt_header = BTreeHeader {
            tree_depth: 0,
            root_node: 0,
            leaf_records: 0,
            first_leaf_node: 0,
            last_leaf_node: 0,
            node_size: NS,
            max_key_length: 10,
            total_nodes,
            free_nodes: total_nodes - 1,
            clump_size: BS,
            btree_type: 0,
            key_compare_type: 0,
            attributes: BT_BIG_KEYS,
        };
        let node0 = build_header_node(&bt_header, 1).unwrap();
        let off = vcb.block_offset(1);
        let mut buf = dev.get(off, NS as usize).unwrap();
        buf.data_mut().copy_from_slice(node0.data());
        dev.write(buf).unwrap();

        let tree = BTree::open(&mut dev, &vcb, 4, header.catalog_file.clone(), KeyCompare::Extents)
            .unwrap();
        (dev, vcb, tree)
    }

    fn key_for(file_id: u32, start: u32) -> Vec<u8> {
        let mut k = vec![0u8, 0u8];
        k.extend_from_slice(&file_id.to_be_bytes());
        k.extend_from_slice(&start.to_be_bytes());
        k
    }

    #[test]
    fn insert_lookup_delete_single() {
        let (mut dev, mut vcb, mut tree) = test_tree(64);
        let key = key_for(100, 0);
        tree.insert(&mut dev, &mut vcb, None, &key, &[1, 2, 3, 4]).unwrap();
        assert_eq!(tree.header.leaf_records, 1);
        assert_eq!(tree.header.tree_depth, 1);

        let got = tree.lookup(&mut dev, &vcb, &key).unwrap().unwrap();
        assert_eq!(got, vec![1, 2, 3, 4]);

        assert!(matches!(
            tree.insert(&mut dev, &mut vcb, None, &key, &[9, 9]),
            Err(HfsError::Exists(_))
        ));

        tree.delete(&mut dev, &mut vcb, &key).unwrap();
        assert_eq!(tree.header.leaf_records, 0);
        assert_eq!(tree.header.root_node, 0);
        assert!(tree.lookup(&mut dev, &vcb, &key).unwrap().is_none());
    }

    #[test]
    fn many_inserts_split_and_stay_ordered() {
        let (mut dev, mut vcb, mut tree) = test_tree(256);
        // shuffled insertion order
        let mut ids: Vec<u32> = (0..200).collect();
        for i in 0..ids.len() {
            let j = (i * 7 + 3) % ids.len();
            ids.swap(i, j);
        }
        for &i in &ids {
            let key = key_for(i, 0);
            tree.insert(&mut dev, &mut vcb, None, &key, &i.to_be_bytes())
                .unwrap();
        }
        assert_eq!(tree.header.leaf_records, 200);
        assert!(tree.header.tree_depth >= 2, "200 records must split a 512B node");

        // iteration yields every record in key order
        let mut it = tree.iter_start();
        let mut seen = 0u32;
        let mut prev: Option<Vec<u8>> = None;
        while let Some((k, p)) = tree.iter_next(&mut dev, &vcb, &mut it).unwrap() {
            if let Some(pk) = &prev {
                assert_eq!(
                    tree.compare.compare(pk, &k).unwrap(),
                    Ordering::Less,
                    "keys must be strictly increasing"
                );
            }
            let id = u32::from_be_bytes([k[2], k[3], k[4], k[5]]);
            assert_eq!(p, id.to_be_bytes().to_vec());
            prev = Some(k);
            seen += 1;
        }
        assert_eq!(seen, 200);

        // every record still reachable by exact search
        for i in 0..200u32 {
            let got = tree.lookup(&mut dev, &vcb, &key_for(i, 0)).unwrap();
            assert_eq!(got, Some(i.to_be_bytes().to_vec()), "id {i}");
        }
    }

    #[test]
    fn delete_everything_collapses_tree() {
        let (mut dev, mut vcb, mut tree) = test_tree(256);
        for i in 0..200u32 {
            tree.insert(&mut dev, &mut vcb, None, &key_for(i, 0), &[0, 1])
                .unwrap();
        }
        let free_after_growth = tree.header.free_nodes;
        assert!(tree.header.tree_depth >= 2);
        for i in 0..200u32 {
            tree.delete(&mut dev, &mut vcb, &key_for(i, 0)).unwrap();
        }
        assert_eq!(tree.header.leaf_records, 0);
        assert_eq!(tree.header.root_node, 0);
        assert_eq!(tree.header.tree_depth, 0);
        assert_eq!(tree.header.first_leaf_node, 0);
        assert_eq!(tree.header.last_leaf_node, 0);
        assert!(tree.header.free_nodes > free_after_growth);
    }

    #[test]
    fn map_bits_match_free_count() {
        let (mut dev, mut vcb, mut tree) = test_tree(64);
        for i in 0..50u32 {
            tree.insert(&mut dev, &mut vcb, None, &key_for(i, 0), &[0, 0])
                .unwrap();
        }
        // count zero bits across the map chain
        let (bits, _) = tree.map_capacity(&mut dev, &vcb).unwrap();
        assert!(bits >= tree.header.total_nodes);
        let mut free = 0u32;
        let lease = tree.read_node(&mut dev, &vcb, 0).unwrap();
        let (s, e) = BTree::map_record_bounds(&lease.node, 0).unwrap();
        for (bi, pos) in (s..e).enumerate() {
            for bit in 0..8u32 {
                let num = bi as u32 * 8 + bit;
                if num >= tree.header.total_nodes {
                    break;
                }
                if lease.node.data()[pos] & (0x80 >> bit) == 0 {
                    free += 1;
                }
            }
        }
        tree.put(&mut dev, lease);
        assert_eq!(free, tree.header.free_nodes);
    }

    #[test]
    fn search_le_steps_back() {
        let (mut dev, mut vcb, mut tree) = test_tree(64);
        for i in [10u32, 20, 30] {
            tree.insert(&mut dev, &mut vcb, None, &key_for(100, i), &i.to_be_bytes())
                .unwrap();
        }
        let (k, p) = tree
            .search_le(&mut dev, &vcb, &key_for(100, 25))
            .unwrap()
            .unwrap();
        assert_eq!(k, key_for(100, 20));
        assert_eq!(p, 20u32.to_be_bytes().to_vec());

        // below the first key: nothing <= target
        assert!(tree
            .search_le(&mut dev, &vcb, &key_for(99, 0))
            .unwrap()
            .is_none());
    }

    #[test]
    fn replace_same_size() {
        let (mut dev, mut vcb, mut tree) = test_tree(64);
        let key = key_for(7, 0);
        tree.insert(&mut dev, &mut vcb, None, &key, &[1, 1]).unwrap();
        tree.replace(&mut dev, &mut vcb, None, &key, &[2, 2]).unwrap();
        assert_eq!(tree.lookup(&mut dev, &vcb, &key).unwrap(), Some(vec![2, 2]));
        assert_eq!(tree.header.leaf_records, 1);
    }

    #[test]
    fn header_record_roundtrip() {
        let h = BTreeHeader {
            tree_depth: 2,
            root_node: 5,
            leaf_records: 100,
            first_leaf_node: 3,
            last_leaf_node: 9,
            node_size: 4096,
            max_key_length: 516,
            total_nodes: 64,
            free_nodes: 10,
            clump_size: 32768,
            btree_type: 0,
            key_compare_type: COMPARE_TYPE_CASE_FOLD,
            attributes: BT_BIG_KEYS | BT_VARIABLE_INDEX_KEYS,
        };
        let bytes = h.to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_RECORD_SIZE);
        let h2 = BTreeHeader::parse(&bytes).unwrap();
        assert_eq!(h2.to_bytes().unwrap(), bytes);
        assert_eq!(h2.root_node, 5);
        assert_eq!(h2.key_compare_type, COMPARE_TYPE_CASE_FOLD);
    }
}
