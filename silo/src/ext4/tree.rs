//! Host directory ingestion for the EXT4 formatter.
//!
//! Builds image content from an already-materialized rootfs tree, the
//! way mkfs populates from a directory. Hard links are preserved by
//! (device, inode) identity, symlink targets verbatim, and xattrs read
//! from the source filesystem where it exposes them.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use silo_shared::{SiloError, SiloResult};
use tracing::{debug, trace};
use walkdir::WalkDir;

use super::formatter::{Attrs, Ext4Formatter};
use super::layout::{S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFREG, S_IFSOCK};

impl Ext4Formatter {
    /// Recursively add the contents of `source` under `dest` in the
    /// image. `dest` is usually `/`.
    pub fn add_tree(&mut self, source: &Path, dest: &Path) -> SiloResult<()> {
        let mut seen_inodes: HashMap<(u64, u64), PathBuf> = HashMap::new();
        let mut count = 0u64;

        for entry in WalkDir::new(source).follow_links(false).min_depth(1) {
            let entry = entry.map_err(|e| {
                SiloError::Io(format!("failed to walk {}: {}", source.display(), e))
            })?;
            let relative = entry.path().strip_prefix(source).map_err(|_| {
                SiloError::Internal(format!("walk escaped {}", source.display()))
            })?;
            let image_path = dest.join(relative);
            let metadata = entry.path().symlink_metadata().map_err(|e| {
                SiloError::Io(format!("failed to stat {}: {}", entry.path().display(), e))
            })?;

            let attrs = Attrs::new(metadata.mode())
                .owner(metadata.uid(), metadata.gid())
                .mtime(metadata.mtime())
                .xattrs(read_source_xattrs(entry.path()));
            let file_type = metadata.file_type();

            if file_type.is_dir() {
                let attrs = Attrs {
                    mode: S_IFDIR as u32 | (metadata.mode() & 0o7777),
                    ..attrs
                };
                self.create::<&[u8]>(&image_path, attrs, None)?;
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(entry.path()).map_err(|e| {
                    SiloError::Io(format!(
                        "failed to read link {}: {}",
                        entry.path().display(),
                        e
                    ))
                })?;
                self.create_symlink(&image_path, &target, attrs)?;
            } else if file_type.is_file() {
                // A second sighting of the same (dev, ino) is a hard link.
                let identity = (metadata.dev(), metadata.ino());
                if metadata.nlink() > 1 {
                    if let Some(first) = seen_inodes.get(&identity) {
                        trace!(
                            link = %image_path.display(),
                            target = %first.display(),
                            "preserving hard link"
                        );
                        self.hard_link(&image_path, first)?;
                        count += 1;
                        continue;
                    }
                    seen_inodes.insert(identity, image_path.clone());
                }
                let data = File::open(entry.path()).map_err(|e| {
                    SiloError::Io(format!(
                        "failed to read data for {}: {}",
                        entry.path().display(),
                        e
                    ))
                })?;
                let attrs = Attrs {
                    mode: S_IFREG as u32 | (metadata.mode() & 0o7777),
                    ..attrs
                };
                self.create(&image_path, attrs, Some(data))?;
            } else {
                use std::os::unix::fs::FileTypeExt;
                let type_bits = if file_type.is_fifo() {
                    S_IFIFO
                } else if file_type.is_socket() {
                    S_IFSOCK
                } else if file_type.is_char_device() {
                    S_IFCHR
                } else {
                    S_IFBLK
                };
                let rdev = metadata.rdev();
                let attrs = Attrs {
                    mode: type_bits as u32 | (metadata.mode() & 0o7777),
                    ..attrs
                }
                .rdev(((rdev >> 8) & 0xfff) as u32, (rdev & 0xff) as u32);
                self.create::<&[u8]>(&image_path, attrs, None)?;
            }
            count += 1;
        }
        debug!(
            source = %source.display(),
            dest = %dest.display(),
            entries = count,
            "added directory tree"
        );
        Ok(())
    }
}

/// Best-effort xattr snapshot; filesystems without support yield none.
fn read_source_xattrs(path: &Path) -> Vec<(String, Vec<u8>)> {
    let mut pairs = Vec::new();
    let Ok(names) = xattr::list(path) else {
        return pairs;
    };
    for name in names {
        let key = name.to_string_lossy().into_owned();
        if let Ok(Some(value)) = xattr::get(path, &name) {
            pairs.push((key, value));
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::ext4::{Ext4Formatter, Ext4Reader, FormatterOptions};

    fn small_options() -> FormatterOptions {
        FormatterOptions {
            min_disk_size: 16 * 1024 * 1024,
            ..Default::default()
        }
    }

    #[test]
    fn test_add_tree_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("rootfs");
        std::fs::create_dir_all(source.join("bin")).unwrap();
        std::fs::write(source.join("bin/tool"), b"#!/bin/sh\nexit 0\n").unwrap();
        std::fs::write(source.join("notes.txt"), b"hello").unwrap();
        std::os::unix::fs::symlink("bin/tool", source.join("tool-link")).unwrap();
        std::fs::hard_link(source.join("notes.txt"), source.join("notes-hl.txt")).unwrap();

        let image = tmp.path().join("image.ext4");
        let mut formatter = Ext4Formatter::open(&image, small_options()).unwrap();
        formatter.add_tree(&source, Path::new("/")).unwrap();
        formatter.close().unwrap();

        let reader = Ext4Reader::open(&image).unwrap();
        let tool = reader.lookup(Path::new("/bin/tool")).unwrap().unwrap();
        assert_eq!(
            reader.read_file(&reader.inode(tool).unwrap()).unwrap(),
            b"#!/bin/sh\nexit 0\n"
        );

        let link = reader.lookup(Path::new("/tool-link")).unwrap().unwrap();
        let info = reader.inode(link).unwrap();
        assert_eq!(reader.symlink_target(&info).unwrap(), b"bin/tool");

        // Hard links share an inode in the image too.
        let a = reader.lookup(Path::new("/notes.txt")).unwrap().unwrap();
        let b = reader.lookup(Path::new("/notes-hl.txt")).unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(reader.inode(a).unwrap().links, 2);
    }

    #[test]
    fn test_add_tree_under_subdirectory() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("overlay");
        std::fs::create_dir_all(source.join("conf")).unwrap();
        std::fs::write(source.join("conf/app.toml"), b"debug = false\n").unwrap();

        let image = tmp.path().join("image.ext4");
        let mut formatter = Ext4Formatter::open(&image, small_options()).unwrap();
        formatter.add_tree(&source, Path::new("/etc")).unwrap();
        formatter.close().unwrap();

        let reader = Ext4Reader::open(&image).unwrap();
        assert!(reader.exists(Path::new("/etc/conf/app.toml")).unwrap());
    }
}
