//! Buffered block I/O over a host-provided device.
//!
//! This is the bread/brelse layer the B-tree engine and allocator sit on: a
//! buffer is checked out (leased) for a (offset, size) range, mutated in
//! memory, and checked back in with one of `release`, `write`,
//! `write_delayed`, or `invalidate`. At most one lease per offset exists at a
//! time; a buffer dropped without check-in simply discards its modifications
//! (the cached copy was removed at checkout), which is exactly what error
//! paths want.
//!
//! File content bypasses the cache through `read_direct`/`write_direct`;
//! only metadata (B-tree nodes, bitmap blocks, headers) is cached.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::error::{HfsError, Result};

/// Byte-addressed random-access device the volume lives on.
pub trait BlockDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;
    fn size(&mut self) -> io::Result<u64>;
    fn sync(&mut self) -> io::Result<()>;
}

impl<T: Read + Write + Seek> BlockDevice for T {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(buf)
    }

    fn size(&mut self) -> io::Result<u64> {
        let pos = self.stream_position()?;
        let end = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(pos))?;
        Ok(end)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// A leased metadata buffer.
#[derive(Debug)]
pub struct Buf {
    offset: u64,
    data: Vec<u8>,
    dirty: bool,
}

impl Buf {
    pub(crate) fn from_parts(offset: u64, data: Vec<u8>, dirty: bool) -> Buf {
        Buf { offset, data, dirty }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Mark modified; durability comes from the check-in call.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn into_data(self) -> Vec<u8> {
        self.data
    }
}

struct Cached {
    data: Vec<u8>,
    dirty: bool,
}

/// Write-back cache of metadata buffers keyed by device byte offset.
pub struct BlockCache<D> {
    dev: D,
    cached: HashMap<u64, Cached>,
    leased: std::collections::HashSet<u64>,
    /// Soft cap on resident clean buffers.
    capacity: usize,
}

const DEFAULT_CAPACITY: usize = 2048;

impl<D: BlockDevice> BlockCache<D> {
    pub fn new(dev: D) -> Self {
        BlockCache {
            dev,
            cached: HashMap::new(),
            leased: std::collections::HashSet::new(),
            capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn device_size(&mut self) -> Result<u64> {
        Ok(self.dev.size()?)
    }

    fn checkout(&mut self, offset: u64) -> Result<Option<Cached>> {
        if self.leased.contains(&offset) {
            return Err(HfsError::Busy(format!("buffer at {offset} already leased")));
        }
        self.leased.insert(offset);
        Ok(self.cached.remove(&offset))
    }

    fn checkin(&mut self, buf: Buf) {
        self.leased.remove(&buf.offset);
        if self.cached.len() >= self.capacity {
            // recycle an arbitrary clean buffer; dirty ones stay
            let victim: Option<u64> = self
                .cached
                .iter()
                .find(|(_, c)| !c.dirty)
                .map(|(k, _)| *k);
            if let Some(v) = victim {
                self.cached.remove(&v);
            }
        }
        self.cached.insert(
            buf.offset,
            Cached {
                data: buf.data,
                dirty: buf.dirty,
            },
        );
    }

    /// Fetch a buffer, reading from the device unless cached.
    pub fn read(&mut self, offset: u64, len: usize) -> Result<Buf> {
        match self.checkout(offset)? {
            Some(c) if c.data.len() == len => Ok(Buf::from_parts(offset, c.data, c.dirty)),
            other => {
                // stale size or miss: read fresh
                if let Some(c) = other {
                    debug_assert!(!c.dirty, "dirty buffer with mismatched size");
                }
                let mut data = vec![0u8; len];
                if let Err(e) = self.dev.read_at(offset, &mut data) {
                    self.leased.remove(&offset);
                    return Err(e.into());
                }
                Ok(Buf::from_parts(offset, data, false))
            }
        }
    }

    /// Return a zeroed scratch buffer without touching the device;
    /// the caller will overwrite the contents.
    pub fn get(&mut self, offset: u64, len: usize) -> Result<Buf> {
        self.checkout(offset)?;
        Ok(Buf::from_parts(offset, vec![0u8; len], false))
    }

    /// Drop the lease; delayed-dirty state is preserved until a flush.
    pub fn release(&mut self, buf: Buf) {
        self.checkin(buf);
    }

    /// Mark dirty and queue for the next flush (delayed write), then release.
    pub fn write_delayed(&mut self, mut buf: Buf) {
        buf.dirty = true;
        self.checkin(buf);
    }

    /// Write through to the device now, cache clean, release.
    pub fn write(&mut self, mut buf: Buf) -> Result<()> {
        self.dev.write_at(buf.offset, &buf.data)?;
        buf.dirty = false;
        self.checkin(buf);
        Ok(())
    }

    /// Drop and discard a leased buffer, dirty or not.
    pub fn invalidate(&mut self, buf: Buf) {
        self.leased.remove(&buf.offset);
    }

    /// Discard an unleased cached buffer (e.g. freed node).
    pub fn discard(&mut self, offset: u64) {
        if !self.leased.contains(&offset) {
            self.cached.remove(&offset);
        }
    }

    /// Drop a lease whose buffer was consumed (e.g. failed validation after
    /// checkout) along with any cached copy.
    pub(crate) fn invalidate_offset(&mut self, offset: u64) {
        self.leased.remove(&offset);
        self.cached.remove(&offset);
    }

    /// Write every delayed buffer out. Leased buffers are the caller's
    /// problem; a flush mid-operation is a bug upstream.
    pub fn flush(&mut self) -> Result<()> {
        let mut offsets: Vec<u64> = self
            .cached
            .iter()
            .filter(|(_, c)| c.dirty)
            .map(|(&k, _)| k)
            .collect();
        offsets.sort_unstable();
        for off in offsets {
            if let Some(c) = self.cached.get_mut(&off) {
                self.dev.write_at(off, &c.data)?;
                c.dirty = false;
            }
        }
        Ok(())
    }

    /// Flush delayed writes and ask the device to make them durable.
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.dev.sync()?;
        Ok(())
    }

    /// Uncached read for file content.
    pub fn read_direct(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        Ok(self.dev.read_at(offset, buf)?)
    }

    /// Uncached write for file content.
    pub fn write_direct(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        Ok(self.dev.write_at(offset, buf)?)
    }

    pub fn into_device(mut self) -> Result<D> {
        self.flush()?;
        Ok(self.dev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn cache(bytes: usize) -> BlockCache<Cursor<Vec<u8>>> {
        BlockCache::new(Cursor::new(vec![0u8; bytes]))
    }

    #[test]
    fn read_modify_release_flush() {
        let mut c = cache(4096);
        let mut buf = c.read(512, 512).unwrap();
        buf.data_mut()[0] = 0xAB;
        c.write_delayed(buf);

        // delayed write not yet on device
        let mut probe = [0u8; 1];
        c.read_direct(512, &mut probe).unwrap();
        assert_eq!(probe[0], 0);

        c.flush().unwrap();
        c.read_direct(512, &mut probe).unwrap();
        assert_eq!(probe[0], 0xAB);
    }

    #[test]
    fn double_lease_refused() {
        let mut c = cache(4096);
        let b1 = c.read(0, 512).unwrap();
        assert!(matches!(c.read(0, 512), Err(HfsError::Busy(_))));
        c.release(b1);
        assert!(c.read(0, 512).is_ok());
    }

    #[test]
    fn dropped_buffer_discards_changes() {
        let mut c = cache(4096);
        {
            let mut buf = c.read(0, 512).unwrap();
            buf.data_mut()[0] = 0xFF;
            buf.mark_dirty();
            drop(buf); // no check-in: changes lost, lease stuck until invalidated
        }
        // stale lease is still held; simulate the error-path invalidate
        let stuck = Buf::from_parts(0, Vec::new(), false);
        c.invalidate(stuck);
        let buf = c.read(0, 512).unwrap();
        assert_eq!(buf.data()[0], 0, "dropped modification must not persist");
        c.release(buf);
    }

    #[test]
    fn scratch_get_skips_device_read() {
        let mut c = cache(2048);
        c.write_direct(1024, &[0xEE; 4]).unwrap();
        let buf = c.get(1024, 512).unwrap();
        assert!(buf.data().iter().all(|&b| b == 0));
        c.invalidate(buf);
    }

    #[test]
    fn write_through_is_immediate() {
        let mut c = cache(4096);
        let mut buf = c.read(1024, 512).unwrap();
        buf.data_mut()[10] = 7;
        c.write(buf).unwrap();
        let mut probe = [0u8; 1];
        c.read_direct(1034, &mut probe).unwrap();
        assert_eq!(probe[0], 7);
    }
}
