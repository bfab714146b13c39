//! Whole-volume scenarios: format, mount, namespace and file operations,
//! remount round-trips. Volumes live in memory (`Cursor<Vec<u8>>`), except
//! one test that goes through a real temp file.

use std::cell::RefCell;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use hfsvol::volume::{VolumeHeader, ATTR_UNMOUNTED, VOLUME_HEADER_OFFSET};
use hfsvol::{format, EntryKind, FormatParams, HfsError, MountOptions, Volume};

const MB: u64 = 1024 * 1024;

fn fresh_image(megabytes: u64) -> Cursor<Vec<u8>> {
    let mut dev = Cursor::new(vec![0u8; (megabytes * MB) as usize]);
    format(&mut dev, &FormatParams::default()).unwrap();
    dev
}

/// A device handle that can outlive the volume, for crash simulation.
#[derive(Clone)]
struct SharedDisk(Rc<RefCell<Cursor<Vec<u8>>>>);

impl SharedDisk {
    fn new(megabytes: u64) -> SharedDisk {
        SharedDisk(Rc::new(RefCell::new(Cursor::new(vec![
            0u8;
            (megabytes * MB) as usize
        ]))))
    }

    fn header(&self) -> VolumeHeader {
        let disk = self.0.borrow();
        let image = disk.get_ref();
        let off = VOLUME_HEADER_OFFSET as usize;
        VolumeHeader::parse(&image[off..off + 512]).unwrap()
    }
}

impl Read for SharedDisk {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().read(buf)
    }
}

impl Write for SharedDisk {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.borrow_mut().flush()
    }
}

impl Seek for SharedDisk {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.0.borrow_mut().seek(pos)
    }
}

#[test]
fn format_mount_create_remount() {
    // 100 MB, 4 KB blocks: 25600 allocation blocks, nearly all free
    let mut dev = Cursor::new(vec![0u8; (100 * MB) as usize]);
    format(&mut dev, &FormatParams::default()).unwrap();

    let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();
    assert_eq!(vol.volume_name(), "untitled");
    assert_eq!(vol.vcb().total_blocks, 25600);
    assert!(vol.vcb().free_blocks > 25580, "metadata should use ~10 blocks");

    let h = vol.create_file("/hello").unwrap();
    assert_eq!(vol.write(&h, 0, b"hi\n").unwrap(), 3);
    vol.close(h).unwrap();

    let dev = vol.unmount().unwrap();
    let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();

    let names: Vec<String> = vol
        .read_dir("/")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["hello".to_string()]);

    let st = vol.stat("/hello").unwrap();
    assert_eq!(st.size, 3);
    assert_eq!(st.kind, EntryKind::File);

    let h = vol.open("/hello", false).unwrap();
    let mut buf = [0u8; 16];
    let n = vol.read(&h, 0, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hi\n");
    vol.close(h).unwrap();

    // a second clean cycle still mounts
    let dev = vol.unmount().unwrap();
    let vol = Volume::mount(dev, MountOptions::default()).unwrap();
    assert_eq!(vol.volume_name(), "untitled");
    vol.unmount().unwrap();
}

#[test]
fn btree_split_and_collapse() {
    let dev = fresh_image(64);
    let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();

    assert_eq!(vol.catalog_info().unwrap().tree_depth, 1);

    for i in 0..200 {
        let h = vol.create_file(&format!("/f{i:03}")).unwrap();
        vol.close(h).unwrap();
    }
    let info = vol.catalog_info().unwrap();
    assert!(
        info.tree_depth >= 2,
        "400 records must outgrow one node (depth {})",
        info.tree_depth
    );
    assert_eq!(vol.vcb().file_count, 200);

    // every file still resolvable after the splits
    for i in [0usize, 57, 123, 199] {
        assert!(vol.exists(&format!("/f{i:03}")).unwrap());
    }
    assert_eq!(vol.read_dir("/").unwrap().len(), 200);

    for i in 0..200 {
        vol.remove_file(&format!("/f{i:03}")).unwrap();
    }
    let info = vol.catalog_info().unwrap();
    assert_eq!(info.tree_depth, 1, "emptied tree collapses to a single leaf");
    assert_eq!(vol.vcb().file_count, 0);
    assert!(vol.read_dir("/").unwrap().is_empty());

    vol.unmount().unwrap();
}

#[test]
fn fragmented_files_use_overflow_extents() {
    let dev = fresh_image(100);
    let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();
    let free_at_start = vol.vcb().free_blocks;
    let ext_nodes_at_start = vol.extents_info().unwrap().total_nodes;

    let ha = vol.create_file("/A").unwrap();
    let hb = vol.create_file("/B").unwrap();

    // interleave whole-clump writes so the two files fragment each other
    let chunk = 64 * 1024usize;
    let mut pattern_a = vec![0u8; chunk];
    let mut pattern_b = vec![0u8; chunk];
    for round in 0..20u8 {
        for (i, b) in pattern_a.iter_mut().enumerate() {
            *b = round ^ (i as u8);
        }
        for (i, b) in pattern_b.iter_mut().enumerate() {
            *b = round.wrapping_mul(31) ^ (i as u8).wrapping_add(1);
        }
        let off = round as u64 * chunk as u64;
        assert_eq!(vol.write(&ha, off, &pattern_a).unwrap(), chunk);
        assert_eq!(vol.write(&hb, off, &pattern_b).unwrap(), chunk);
    }

    // both files outgrew their eight inline slots
    let ext_info = vol.extents_info().unwrap();
    assert!(
        ext_info.leaf_records >= 2,
        "overflow records expected, got {}",
        ext_info.leaf_records
    );

    // the mapping reported now matches what we wrote
    let (phys0, contig0) = vol.map_file_block(&ha, 0).unwrap().unwrap();
    assert!(contig0 >= 1);
    let mapped_again = vol.map_file_block(&ha, 0).unwrap().unwrap();
    assert_eq!((phys0, contig0), mapped_again);

    vol.close(ha).unwrap();
    vol.close(hb).unwrap();
    let dev = vol.unmount().unwrap();

    // remount forces the extent maps to reload through the overflow tree
    let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();
    let ha = vol.open("/A", false).unwrap();
    let hb = vol.open("/B", false).unwrap();
    let mut buf = vec![0u8; chunk];
    for round in 0..20u8 {
        let off = round as u64 * chunk as u64;
        assert_eq!(vol.read(&ha, off, &mut buf).unwrap(), chunk);
        assert_eq!(buf[0], round, "file A round {round}");
        assert_eq!(buf[1], round ^ 1);
        assert_eq!(vol.read(&hb, off, &mut buf).unwrap(), chunk);
        assert_eq!(buf[0], round.wrapping_mul(31) ^ 1);
    }
    vol.close(ha).unwrap();
    vol.close(hb).unwrap();

    // dropping both files returns every allocated block; only the space
    // the extents tree itself grew by stays committed
    vol.remove_file("/A").unwrap();
    vol.remove_file("/B").unwrap();
    vol.flush().unwrap();
    let info = vol.extents_info().unwrap();
    let tree_growth_blocks = (info.total_nodes - ext_nodes_at_start) as u64
        * info.node_size as u64
        / vol.vcb().block_size as u64;
    assert_eq!(
        vol.vcb().free_blocks as u64 + tree_growth_blocks,
        free_at_start as u64
    );
    vol.unmount().unwrap();
}

#[test]
fn hard_links_share_one_inode() {
    let dev = fresh_image(16);
    let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();
    let free_before = vol.vcb().free_blocks;

    let h = vol.create_file("/target").unwrap();
    vol.write(&h, 0, b"X").unwrap();
    vol.close(h).unwrap();

    vol.hard_link("/target", "/alias").unwrap();

    assert_eq!(vol.stat("/target").unwrap().link_count, 2);
    assert_eq!(vol.stat("/alias").unwrap().link_count, 2);

    // the private directory stays invisible
    let names: Vec<String> = vol.read_dir("/").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"target".to_string()));
    assert!(names.contains(&"alias".to_string()));

    vol.remove_file("/target").unwrap();
    let st = vol.stat("/alias").unwrap();
    assert_eq!(st.link_count, 1);

    let h = vol.open("/alias", false).unwrap();
    let mut buf = [0u8; 4];
    let n = vol.read(&h, 0, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"X");
    vol.close(h).unwrap();

    // the last link takes the indirect inode and its blocks with it
    vol.remove_file("/alias").unwrap();
    vol.flush().unwrap();
    assert_eq!(vol.vcb().free_blocks, free_before);
    assert!(!vol.exists("/alias").unwrap());

    let dev = vol.unmount().unwrap();
    let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();
    assert!(vol.read_dir("/").unwrap().is_empty());
    vol.unmount().unwrap();
}

#[test]
fn open_inode_survives_last_link_removal() {
    let dev = fresh_image(16);
    let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();
    let free_before = vol.vcb().free_blocks;

    let h = vol.create_file("/target").unwrap();
    vol.write(&h, 0, b"X").unwrap();
    vol.close(h).unwrap();
    vol.hard_link("/target", "/alias").unwrap();

    // hold the indirect inode open through one of the links
    let h = vol.open("/alias", false).unwrap();
    vol.remove_file("/target").unwrap();
    vol.remove_file("/alias").unwrap();
    assert!(!vol.exists("/alias").unwrap());

    // the open handle still reads the content; nothing was freed yet
    let mut buf = [0u8; 4];
    let n = vol.read(&h, 0, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"X");
    assert!(
        vol.vcb().free_blocks < free_before,
        "inode blocks stay committed while a handle is open"
    );

    // the last close runs the deferred removal and returns the blocks
    vol.close(h).unwrap();
    vol.flush().unwrap();
    assert_eq!(vol.vcb().free_blocks, free_before);
    assert!(vol.read_dir("/").unwrap().is_empty());
    vol.unmount().unwrap();
}

#[test]
fn survives_links_across_remount() {
    let dev = fresh_image(16);
    let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();

    let h = vol.create_file("/doc").unwrap();
    vol.write(&h, 0, b"shared bytes").unwrap();
    vol.close(h).unwrap();
    vol.hard_link("/doc", "/copy").unwrap();

    let dev = vol.unmount().unwrap();
    let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();

    assert_eq!(vol.stat("/doc").unwrap().link_count, 2);
    let h = vol.open("/copy", false).unwrap();
    let mut buf = [0u8; 32];
    let n = vol.read(&h, 0, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"shared bytes");
    vol.close(h).unwrap();
    vol.unmount().unwrap();
}

#[test]
fn unclean_shutdown_leaves_dirty_bit() {
    let disk = SharedDisk::new(16);
    format(&mut disk.clone(), &FormatParams::default()).unwrap();
    assert_ne!(
        disk.header().attributes & ATTR_UNMOUNTED,
        0,
        "freshly formatted volume is clean"
    );

    // while mounted read/write, the clean bit reads 0
    let mut vol = Volume::mount(disk.clone(), MountOptions::default()).unwrap();
    assert_eq!(disk.header().attributes & ATTR_UNMOUNTED, 0);
    let h = vol.create_file("/scratch").unwrap();
    vol.write(&h, 0, b"data").unwrap();
    vol.close(h).unwrap();
    vol.flush().unwrap();

    // crash: the volume is dropped without unmounting
    drop(vol);
    assert_eq!(
        disk.header().attributes & ATTR_UNMOUNTED,
        0,
        "a crashed volume reads as dirty"
    );

    // a clean unmount sets the bit again
    let vol = Volume::mount(disk.clone(), MountOptions::default()).unwrap();
    vol.unmount().unwrap();
    assert_ne!(disk.header().attributes & ATTR_UNMOUNTED, 0);
}

#[test]
fn extend_truncate_restores_free_count() {
    let dev = fresh_image(32);
    let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();
    let free_before = vol.vcb().free_blocks;

    let h = vol.create_file("/ballast").unwrap();
    vol.set_len(&h, MB).unwrap();
    assert!(vol.vcb().free_blocks < free_before);
    let st_blocks = {
        vol.fsync(&h).unwrap();
        vol.map_file_block(&h, 0).unwrap()
    };
    assert!(st_blocks.is_some(), "grown fork must map block 0");

    vol.set_len(&h, 0).unwrap();
    vol.close(h).unwrap();
    vol.remove_file("/ballast").unwrap();
    vol.flush().unwrap();
    assert_eq!(vol.vcb().free_blocks, free_before);
    vol.unmount().unwrap();
}

#[test]
fn directories_nest_and_refuse_nonempty_removal() {
    let dev = fresh_image(16);
    let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();

    vol.create_dir("/docs").unwrap();
    vol.create_dir("/docs/old").unwrap();
    let h = vol.create_file("/docs/old/a.txt").unwrap();
    vol.close(h).unwrap();

    assert!(matches!(
        vol.remove_dir("/docs/old"),
        Err(HfsError::NotEmpty(_))
    ));
    assert!(matches!(
        vol.remove_dir("/docs"),
        Err(HfsError::NotEmpty(_))
    ));

    vol.remove_file("/docs/old/a.txt").unwrap();
    vol.remove_dir("/docs/old").unwrap();
    vol.remove_dir("/docs").unwrap();
    assert!(vol.read_dir("/").unwrap().is_empty());
    vol.unmount().unwrap();
}

#[test]
fn rename_moves_between_directories() {
    let dev = fresh_image(16);
    let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();

    vol.create_dir("/src").unwrap();
    vol.create_dir("/dst").unwrap();
    let h = vol.create_file("/src/report").unwrap();
    vol.write(&h, 0, b"quarterly").unwrap();
    vol.close(h).unwrap();

    vol.rename("/src/report", "/dst/report-final").unwrap();
    assert!(!vol.exists("/src/report").unwrap());
    let st = vol.stat("/dst/report-final").unwrap();
    assert_eq!(st.size, 9);

    // the move kept the parent valences straight
    assert!(vol.read_dir("/src").unwrap().is_empty());
    assert_eq!(vol.read_dir("/dst").unwrap().len(), 1);

    // colliding destination refused
    let h = vol.create_file("/src/report").unwrap();
    vol.close(h).unwrap();
    assert!(matches!(
        vol.rename("/src/report", "/dst/report-final"),
        Err(HfsError::Exists(_))
    ));
    vol.unmount().unwrap();
}

#[test]
fn case_insensitive_names_on_hfsplus() {
    let dev = fresh_image(16);
    let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();

    let h = vol.create_file("/ReadMe.txt").unwrap();
    vol.close(h).unwrap();
    // HFS+ folds case: the same name in different case collides
    assert!(matches!(
        vol.create_file("/readme.TXT"),
        Err(HfsError::Exists(_))
    ));
    assert!(vol.exists("/README.TXT").unwrap());
    vol.unmount().unwrap();
}

#[test]
fn case_sensitive_names_on_hfsx() {
    let mut dev = Cursor::new(vec![0u8; (16 * MB) as usize]);
    format(
        &mut dev,
        &FormatParams {
            case_sensitive: true,
            ..FormatParams::default()
        },
    )
    .unwrap();
    let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();
    assert!(vol.vcb().is_hfsx);

    let h = vol.create_file("/ReadMe.txt").unwrap();
    vol.close(h).unwrap();
    let h = vol.create_file("/readme.txt").unwrap();
    vol.close(h).unwrap();
    assert_eq!(vol.read_dir("/").unwrap().len(), 2);
    vol.unmount().unwrap();
}

#[test]
fn unicode_names_round_trip() {
    let dev = fresh_image(16);
    let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();

    let h = vol.create_file("/résumé 日本語.txt").unwrap();
    vol.close(h).unwrap();
    // MacRoman is marked in the encodings bitmap
    assert_ne!(vol.vcb().encodings_bitmap & 1, 0);

    let dev = vol.unmount().unwrap();
    let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();
    assert!(vol.exists("/résumé 日本語.txt").unwrap());
    let names: Vec<String> = vol.read_dir("/").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names.len(), 1);
    // names come back decomposed; compare case-folded forms
    assert!(names[0].contains("日本語"));
    vol.unmount().unwrap();
}

#[test]
fn symlinks_store_and_read_targets() {
    let dev = fresh_image(16);
    let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();

    let h = vol.create_file("/actual").unwrap();
    vol.close(h).unwrap();
    vol.symlink("/pointer", "/actual").unwrap();

    let st = vol.stat("/pointer").unwrap();
    assert_eq!(st.kind, EntryKind::Symlink);
    assert_eq!(vol.read_link("/pointer").unwrap(), "/actual");

    let dev = vol.unmount().unwrap();
    let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();
    assert_eq!(vol.read_link("/pointer").unwrap(), "/actual");
    vol.unmount().unwrap();
}

#[test]
fn read_only_mount_refuses_writes() {
    let dev = fresh_image(16);
    let mut vol = Volume::mount(
        dev,
        MountOptions {
            read_only: true,
            ..MountOptions::default()
        },
    )
    .unwrap();
    assert!(matches!(vol.create_file("/nope"), Err(HfsError::ReadOnly)));
    assert!(matches!(vol.create_dir("/nope"), Err(HfsError::ReadOnly)));
    vol.unmount().unwrap();
}

#[test]
fn sparse_writes_read_zeros_in_holes() {
    let dev = fresh_image(32);
    let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();

    let h = vol.create_file("/sparse").unwrap();
    // write far past the start; the gap becomes an invalid range
    vol.write(&h, 100_000, b"tail").unwrap();
    assert_eq!(vol.handle_size(&h).unwrap(), 100_004);

    let mut buf = vec![0xFFu8; 4096];
    let n = vol.read(&h, 0, &mut buf).unwrap();
    assert_eq!(n, 4096);
    assert!(buf.iter().all(|&b| b == 0), "hole reads as zeros");

    let mut tail = [0u8; 8];
    let n = vol.read(&h, 100_000, &mut tail).unwrap();
    assert_eq!(&tail[..n], b"tail");
    vol.close(h).unwrap();
    vol.unmount().unwrap();
}

#[test]
fn works_on_a_real_file_too() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.as_file().set_len(16 * MB).unwrap();
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(tmp.path())
        .unwrap();
    format(&mut file, &FormatParams::default()).unwrap();

    let mut vol = Volume::mount(file, MountOptions::default()).unwrap();
    let h = vol.create_file("/ondisk").unwrap();
    vol.write(&h, 0, b"persisted").unwrap();
    vol.close(h).unwrap();
    vol.unmount().unwrap();

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(tmp.path())
        .unwrap();
    let mut vol = Volume::mount(file, MountOptions::default()).unwrap();
    assert_eq!(vol.stat("/ondisk").unwrap().size, 9);
    vol.unmount().unwrap();
}
