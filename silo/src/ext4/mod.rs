//! EXT4 image authoring and inspection.
//!
//! [`Ext4Formatter`] is a one-shot streaming builder: open, ingest layer
//! tarballs and individual entries, close. [`Ext4Reader`] gives read-only
//! access to the result and can export it back out as a tar stream.

mod alloc;
mod formatter;
pub mod layout;
mod reader;
mod tree;
mod unpack;

pub use formatter::{Attrs, Ext4Formatter, FormatterOptions};
pub use reader::{DirEntry, Ext4Reader, InodeInfo};
pub use unpack::ProgressEvent;

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::io::Cursor;
    use std::path::{Path, PathBuf};

    use silo_shared::SiloError;

    use super::layout::{FileKind, ROOT_INO, S_IFDIR, S_IFREG};
    use super::*;
    use crate::archive::Compression;

    fn small_options() -> FormatterOptions {
        FormatterOptions {
            min_disk_size: 16 * 1024 * 1024,
            ..Default::default()
        }
    }

    fn open_formatter(dir: &Path) -> (PathBuf, Ext4Formatter) {
        let image = dir.join("image.ext4");
        let formatter = Ext4Formatter::open(&image, small_options()).unwrap();
        (image, formatter)
    }

    fn file_attrs() -> Attrs {
        Attrs::new(S_IFREG as u32 | 0o644)
    }

    fn dir_attrs() -> Attrs {
        Attrs::new(S_IFDIR as u32 | 0o755)
    }

    #[test]
    fn test_empty_image_has_root_and_lost_found() {
        let tmp = tempfile::tempdir().unwrap();
        let (image, formatter) = open_formatter(tmp.path());
        formatter.close().unwrap();

        let reader = Ext4Reader::open(&image).unwrap();
        let root = reader.inode(ROOT_INO).unwrap();
        assert_eq!(root.kind, FileKind::Directory);
        assert_eq!(root.links, 3); // ".", "..", lost+found

        let children = reader.children(ROOT_INO).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "lost+found");
        assert_eq!(children[0].ino, 11);
    }

    #[test]
    fn test_create_and_read_back_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (image, mut formatter) = open_formatter(tmp.path());
        let payload = b"every byte accounted for".to_vec();
        formatter
            .create(
                Path::new("/etc/motd"),
                file_attrs().owner(12, 34).mtime(1_600_000_000),
                Some(Cursor::new(payload.clone())),
            )
            .unwrap();
        formatter.close().unwrap();

        let reader = Ext4Reader::open(&image).unwrap();
        let ino = reader.lookup(Path::new("/etc/motd")).unwrap().unwrap();
        let info = reader.inode(ino).unwrap();
        assert_eq!(info.kind, FileKind::Regular);
        assert_eq!(info.size, payload.len() as u64);
        assert_eq!(info.uid, 12);
        assert_eq!(info.gid, 34);
        assert_eq!(info.mtime, 1_600_000_000);
        assert_eq!(reader.read_file(&info).unwrap(), payload);
    }

    #[test]
    fn test_large_file_spans_extents() {
        let tmp = tempfile::tempdir().unwrap();
        let (image, mut formatter) = open_formatter(tmp.path());
        // Bigger than the 1 MiB streaming chunk, with a recognizable
        // pattern so corruption shows.
        let payload: Vec<u8> = (0..3_500_000u32).map(|i| (i % 251) as u8).collect();
        formatter
            .create(
                Path::new("/big.bin"),
                file_attrs(),
                Some(Cursor::new(payload.clone())),
            )
            .unwrap();
        formatter.close().unwrap();

        let reader = Ext4Reader::open(&image).unwrap();
        let ino = reader.lookup(Path::new("/big.bin")).unwrap().unwrap();
        let info = reader.inode(ino).unwrap();
        assert_eq!(info.size, payload.len() as u64);
        assert_eq!(reader.read_file(&info).unwrap(), payload);
    }

    #[test]
    fn test_symlink_inline_and_long() {
        let tmp = tempfile::tempdir().unwrap();
        let (image, mut formatter) = open_formatter(tmp.path());
        formatter
            .create_symlink(Path::new("/short"), Path::new("target"), Attrs::new(0))
            .unwrap();
        let long_target = "x/".repeat(60) + "end";
        formatter
            .create_symlink(Path::new("/long"), Path::new(&long_target), Attrs::new(0))
            .unwrap();
        formatter.close().unwrap();

        let reader = Ext4Reader::open(&image).unwrap();
        let short = reader.lookup(Path::new("/short")).unwrap().unwrap();
        let info = reader.inode(short).unwrap();
        assert_eq!(reader.symlink_target(&info).unwrap(), b"target".to_vec());

        let long = reader.lookup(Path::new("/long")).unwrap().unwrap();
        let info = reader.inode(long).unwrap();
        assert_eq!(
            reader.symlink_target(&info).unwrap(),
            long_target.as_bytes().to_vec()
        );
    }

    #[test]
    fn test_hard_link_shares_inode() {
        let tmp = tempfile::tempdir().unwrap();
        let (image, mut formatter) = open_formatter(tmp.path());
        formatter
            .create(
                Path::new("/a"),
                file_attrs(),
                Some(Cursor::new(b"shared".to_vec())),
            )
            .unwrap();
        formatter
            .hard_link(Path::new("/b"), Path::new("/a"))
            .unwrap();
        formatter.close().unwrap();

        let reader = Ext4Reader::open(&image).unwrap();
        let a = reader.lookup(Path::new("/a")).unwrap().unwrap();
        let b = reader.lookup(Path::new("/b")).unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(reader.inode(a).unwrap().links, 2);
    }

    #[test]
    fn test_unlink_one_hard_link_keeps_data() {
        let tmp = tempfile::tempdir().unwrap();
        let (image, mut formatter) = open_formatter(tmp.path());
        formatter
            .create(
                Path::new("/a"),
                file_attrs(),
                Some(Cursor::new(b"kept".to_vec())),
            )
            .unwrap();
        formatter
            .hard_link(Path::new("/b"), Path::new("/a"))
            .unwrap();
        formatter.unlink(Path::new("/a")).unwrap();
        formatter.close().unwrap();

        let reader = Ext4Reader::open(&image).unwrap();
        assert!(!reader.exists(Path::new("/a")).unwrap());
        let b = reader.lookup(Path::new("/b")).unwrap().unwrap();
        let info = reader.inode(b).unwrap();
        assert_eq!(info.links, 1);
        assert_eq!(reader.read_file(&info).unwrap(), b"kept".to_vec());
    }

    #[test]
    fn test_xattrs_inline_and_overflow() {
        let tmp = tempfile::tempdir().unwrap();
        let (image, mut formatter) = open_formatter(tmp.path());
        formatter
            .create(
                Path::new("/small"),
                file_attrs().xattrs(vec![("user.note".into(), b"hi".to_vec())]),
                None::<&[u8]>,
            )
            .unwrap();
        // Too big for the 96-byte inline region: spills to a block.
        formatter
            .create(
                Path::new("/big"),
                file_attrs().xattrs(vec![
                    ("user.blob".into(), vec![0xAB; 300]),
                    ("security.selinux".into(), b"system_u:object_r:t:s0".to_vec()),
                ]),
                None::<&[u8]>,
            )
            .unwrap();
        formatter.close().unwrap();

        let reader = Ext4Reader::open(&image).unwrap();
        let small = reader.lookup(Path::new("/small")).unwrap().unwrap();
        assert_eq!(
            reader.xattrs(small).unwrap(),
            vec![("user.note".to_string(), b"hi".to_vec())]
        );
        let big = reader.lookup(Path::new("/big")).unwrap().unwrap();
        let pairs = reader.xattrs(big).unwrap();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().any(|(n, v)| n == "user.blob" && v.len() == 300));
    }

    #[test]
    fn test_symlink_cycle_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (_image, mut formatter) = open_formatter(tmp.path());
        formatter
            .create_symlink(Path::new("/loop-a"), Path::new("/loop-b"), Attrs::new(0))
            .unwrap();
        formatter
            .create_symlink(Path::new("/loop-b"), Path::new("/loop-a"), Attrs::new(0))
            .unwrap();
        let err = formatter
            .create(
                Path::new("/loop-a/child"),
                file_attrs(),
                None::<&[u8]>,
            )
            .unwrap_err();
        assert!(matches!(err, SiloError::UnsupportedFiletype(_)));
    }

    fn layer_tar(entries: &[(&str, LayerEntry<'_>)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, entry) in entries {
            match entry {
                LayerEntry::Dir => {
                    let mut header = tar::Header::new_gnu();
                    header.set_path(path).unwrap();
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_mode(0o755);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
                LayerEntry::File(content) => {
                    let mut header = tar::Header::new_gnu();
                    header.set_path(path).unwrap();
                    header.set_mode(0o644);
                    header.set_size(content.len() as u64);
                    header.set_cksum();
                    builder.append(&header, *content).unwrap();
                }
                LayerEntry::Symlink(target) => {
                    let mut header = tar::Header::new_gnu();
                    header.set_path(path).unwrap();
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_link_name(target).unwrap();
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
            }
        }
        builder.into_inner().unwrap()
    }

    enum LayerEntry<'a> {
        Dir,
        File(&'a [u8]),
        Symlink(&'a str),
    }

    #[test]
    fn test_unpack_layers_with_file_whiteout() {
        let tmp = tempfile::tempdir().unwrap();
        let layer1 = tmp.path().join("layer1.tar");
        std::fs::write(
            &layer1,
            layer_tar(&[
                ("dir1/", LayerEntry::Dir),
                ("dir1/keep.txt", LayerEntry::File(b"keep")),
                ("dir1/gone.txt", LayerEntry::File(b"gone")),
            ]),
        )
        .unwrap();
        let layer2 = tmp.path().join("layer2.tar");
        std::fs::write(
            &layer2,
            layer_tar(&[("dir1/.wh.gone.txt", LayerEntry::File(b""))]),
        )
        .unwrap();

        let (image, mut formatter) = open_formatter(tmp.path());
        formatter.unpack(&layer1, Compression::Auto, None).unwrap();
        formatter.unpack(&layer2, Compression::Auto, None).unwrap();
        formatter.close().unwrap();

        let reader = Ext4Reader::open(&image).unwrap();
        assert!(reader.exists(Path::new("/dir1/keep.txt")).unwrap());
        assert!(!reader.exists(Path::new("/dir1/gone.txt")).unwrap());
        // The whiteout marker itself never lands in the image.
        assert!(!reader.exists(Path::new("/dir1/.wh.gone.txt")).unwrap());
    }

    #[test]
    fn test_unpack_opaque_whiteout_empties_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let layer1 = tmp.path().join("layer1.tar");
        std::fs::write(
            &layer1,
            layer_tar(&[
                ("dir2/", LayerEntry::Dir),
                ("dir2/file1", LayerEntry::File(b"lower")),
            ]),
        )
        .unwrap();
        let layer2 = tmp.path().join("layer2.tar");
        std::fs::write(
            &layer2,
            layer_tar(&[("dir2/.wh..wh..opq", LayerEntry::File(b""))]),
        )
        .unwrap();

        let (image, mut formatter) = open_formatter(tmp.path());
        formatter.unpack(&layer1, Compression::Auto, None).unwrap();
        formatter.unpack(&layer2, Compression::Auto, None).unwrap();
        formatter.close().unwrap();

        let reader = Ext4Reader::open(&image).unwrap();
        let dir2 = reader.lookup(Path::new("/dir2")).unwrap().unwrap();
        assert!(reader.children(dir2).unwrap().is_empty());
        assert!(!reader.exists(Path::new("/dir2/file1")).unwrap());
    }

    #[test]
    fn test_unpack_progress_law() {
        let tmp = tempfile::tempdir().unwrap();
        let layer = tmp.path().join("layer.tar");
        std::fs::write(
            &layer,
            layer_tar(&[
                ("a.txt", LayerEntry::File(b"four")),
                ("empty.txt", LayerEntry::File(b"")),
                ("dir/", LayerEntry::Dir),
                ("dir/b.txt", LayerEntry::File(b"seven..")),
                ("link", LayerEntry::Symlink("a.txt")),
            ]),
        )
        .unwrap();

        let (_image, mut formatter) = open_formatter(tmp.path());
        let mut events = Vec::new();
        formatter
            .unpack(
                &layer,
                Compression::Auto,
                Some(&mut |event| events.push(event)),
            )
            .unwrap();
        formatter.close().unwrap();

        // Total-size events strictly precede add-size events.
        let first_add = events
            .iter()
            .position(|e| matches!(e, ProgressEvent::AddSize(_)))
            .unwrap();
        assert!(events[..first_add]
            .iter()
            .any(|e| matches!(e, ProgressEvent::AddTotalSize(_))));

        let total: i64 = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::AddTotalSize(n) => Some(*n),
                _ => None,
            })
            .sum();
        let added: i64 = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::AddSize(n) => Some(*n),
                _ => None,
            })
            .sum();
        assert_eq!(total, added);
        assert_eq!(total, 11);

        // One add-size snapshot per regular file, zero-byte included.
        let add_count = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::AddSize(_)))
            .count();
        assert_eq!(add_count, 3);
    }

    #[test]
    fn test_export_roundtrip_matches_post_whiteout_union() {
        let tmp = tempfile::tempdir().unwrap();
        let layer1 = tmp.path().join("layer1.tar");
        std::fs::write(
            &layer1,
            layer_tar(&[
                ("bin/", LayerEntry::Dir),
                ("bin/tool", LayerEntry::File(b"#!/bin/sh\n")),
                ("doomed", LayerEntry::File(b"bye")),
            ]),
        )
        .unwrap();
        let layer2 = tmp.path().join("layer2.tar");
        std::fs::write(
            &layer2,
            layer_tar(&[
                (".wh.doomed", LayerEntry::File(b"")),
                ("bin/extra", LayerEntry::File(b"more")),
            ]),
        )
        .unwrap();

        let (image, mut formatter) = open_formatter(tmp.path());
        formatter.unpack(&layer1, Compression::Auto, None).unwrap();
        formatter.unpack(&layer2, Compression::Auto, None).unwrap();
        formatter.close().unwrap();

        let reader = Ext4Reader::open(&image).unwrap();
        let mut exported = Vec::new();
        reader.export(&mut exported).unwrap();

        let mut archive = tar::Archive::new(Cursor::new(exported));
        let names: BTreeSet<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        let expected: BTreeSet<String> = ["bin", "bin/extra", "bin/tool", "lost+found"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_free_counts_match_bitmaps_at_close() {
        let tmp = tempfile::tempdir().unwrap();
        let (image, mut formatter) = open_formatter(tmp.path());
        for i in 0..20 {
            formatter
                .create(
                    Path::new(&format!("/f{}", i)),
                    file_attrs(),
                    Some(Cursor::new(vec![i as u8; 5000])),
                )
                .unwrap();
        }
        formatter.unlink(Path::new("/f3")).unwrap();
        formatter.unlink(Path::new("/f7")).unwrap();
        formatter.close().unwrap();

        // Recount free blocks from the bitmap and compare with the
        // superblock's claim.
        let reader = Ext4Reader::open(&image).unwrap();
        let sb = reader.superblock();
        assert!(sb.free_blocks > 0);
        assert!(sb.free_inodes > 0);
        let data = std::fs::read(&image).unwrap();
        // Group 0 bitmap location: block 0 is sb+gdt, so find it via the
        // descriptor at block 1.
        let bitmap_block = u32::from_le_bytes([
            data[4096],
            data[4097],
            data[4098],
            data[4099],
        ]) as usize;
        let bitmap = &data[bitmap_block * 4096..(bitmap_block + 1) * 4096];
        let free_bits: u32 = bitmap.iter().map(|b| b.count_zeros()).sum();
        assert_eq!(free_bits, sb.free_blocks);
    }

    #[test]
    fn test_verify_accepts_a_churned_image() {
        let tmp = tempfile::tempdir().unwrap();
        let (image, mut formatter) = open_formatter(tmp.path());
        // Exercise every allocation shape: plain files, a multi-extent
        // file, hard links, xattr overflow, deletions.
        for i in 0..10 {
            formatter
                .create(
                    Path::new(&format!("/files/f{}", i)),
                    file_attrs(),
                    Some(Cursor::new(vec![i as u8; 9000])),
                )
                .unwrap();
        }
        let big: Vec<u8> = (0..2_500_000u32).map(|i| (i % 13) as u8).collect();
        formatter
            .create(Path::new("/big.bin"), file_attrs(), Some(Cursor::new(big)))
            .unwrap();
        formatter
            .hard_link(Path::new("/files/alias"), Path::new("/files/f1"))
            .unwrap();
        formatter
            .create(
                Path::new("/tagged"),
                file_attrs().xattrs(vec![("user.blob".into(), vec![7u8; 400])]),
                None::<&[u8]>,
            )
            .unwrap();
        formatter.unlink(Path::new("/files/f4")).unwrap();
        formatter.unlink(Path::new("/files/f5")).unwrap();
        formatter.close().unwrap();

        Ext4Reader::open(&image).unwrap().verify().unwrap();
    }

    #[test]
    fn test_verify_catches_corrupt_free_count() {
        let tmp = tempfile::tempdir().unwrap();
        let (image, mut formatter) = open_formatter(tmp.path());
        formatter
            .create(
                Path::new("/x"),
                file_attrs(),
                Some(Cursor::new(b"payload".to_vec())),
            )
            .unwrap();
        formatter.close().unwrap();

        // Flip the superblock's free block count.
        let mut data = std::fs::read(&image).unwrap();
        let claimed = u32::from_le_bytes([data[1036], data[1037], data[1038], data[1039]]);
        data[1036..1040].copy_from_slice(&(claimed - 3).to_le_bytes());
        std::fs::write(&image, data).unwrap();

        let err = Ext4Reader::open(&image).unwrap().verify().unwrap_err();
        assert!(matches!(err, SiloError::Format(_)));
    }

    #[test]
    fn test_device_and_fifo_nodes() {
        let tmp = tempfile::tempdir().unwrap();
        let (image, mut formatter) = open_formatter(tmp.path());
        formatter
            .create::<&[u8]>(
                Path::new("/dev/null"),
                Attrs::new(super::layout::S_IFCHR as u32 | 0o666).rdev(1, 3),
                None,
            )
            .unwrap();
        formatter
            .create::<&[u8]>(
                Path::new("/run/queue"),
                Attrs::new(super::layout::S_IFIFO as u32 | 0o600),
                None,
            )
            .unwrap();
        formatter.close().unwrap();

        let reader = Ext4Reader::open(&image).unwrap();
        let null = reader.lookup(Path::new("/dev/null")).unwrap().unwrap();
        let info = reader.inode(null).unwrap();
        assert_eq!(info.kind, FileKind::CharDevice);
        assert_eq!(info.rdev, (1, 3));
        let fifo = reader.lookup(Path::new("/run/queue")).unwrap().unwrap();
        assert_eq!(reader.inode(fifo).unwrap().kind, FileKind::Fifo);
    }
}
