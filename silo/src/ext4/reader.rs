//! Read-only inspection and export of formatted EXT4 images.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use silo_shared::{SiloError, SiloResult};
use tracing::debug;

use super::formatter::normalize_components;
use super::layout::{
    decode_rdev, decode_xattrs, get_u16, get_u32, Extent, FileKind, GroupDesc, Superblock,
    BLOCK_SIZE, EXTENT_MAGIC, EXT4_EXTENTS_FL, ROOT_INO, SUPERBLOCK_OFFSET, XATTR_MAGIC,
};

/// Xattr name reserved for inline data; never surfaced to callers.
const SYSTEM_DATA_XATTR: &str = "system.data";

/// Decoded inode metadata.
#[derive(Clone)]
pub struct InodeInfo {
    pub ino: u32,
    pub kind: FileKind,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub links: u16,
    pub mtime: u32,
    pub rdev: (u32, u32),
    flags: u32,
    block: [u8; 60],
    file_acl: u32,
    raw: [u8; 256],
}

impl InodeInfo {
    /// Permission bits without the file type.
    pub fn perm(&self) -> u32 {
        (self.mode & 0o7777) as u32
    }
}

/// One directory entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u32,
}

/// Read-only view over an image produced by the formatter.
pub struct Ext4Reader {
    file: File,
    superblock: Superblock,
    groups: Vec<GroupDesc>,
}

impl Ext4Reader {
    pub fn open(path: &Path) -> SiloResult<Ext4Reader> {
        let file = File::open(path)
            .map_err(|e| SiloError::Io(format!("failed to open {}: {}", path.display(), e)))?;
        let mut sb_bytes = [0u8; 1024];
        file.read_exact_at(&mut sb_bytes, SUPERBLOCK_OFFSET)
            .map_err(|e| SiloError::Io(format!("failed to read superblock: {}", e)))?;
        let superblock = Superblock::decode(&sb_bytes)?;

        let group_count = superblock
            .blocks_count
            .div_ceil(superblock.blocks_per_group);
        let mut gdt = vec![0u8; group_count as usize * 32];
        file.read_exact_at(&mut gdt, BLOCK_SIZE as u64)
            .map_err(|e| SiloError::Io(format!("failed to read group descriptors: {}", e)))?;
        let groups = (0..group_count as usize)
            .map(|i| GroupDesc::decode(&gdt[i * 32..i * 32 + 32]))
            .collect();

        debug!(path = %path.display(), groups = group_count, "opened ext4 image");
        Ok(Ext4Reader {
            file,
            superblock,
            groups,
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// Decode inode `ino`.
    pub fn inode(&self, ino: u32) -> SiloResult<InodeInfo> {
        if ino == 0 || ino > self.superblock.inodes_count {
            return Err(SiloError::InvalidArgument(format!(
                "inode {} out of range",
                ino
            )));
        }
        let index = ino - 1;
        let group = (index / self.superblock.inodes_per_group) as usize;
        let slot = index % self.superblock.inodes_per_group;
        let desc = self
            .groups
            .get(group)
            .ok_or_else(|| SiloError::Format(format!("no group for inode {}", ino)))?;
        let offset = desc.inode_table as u64 * BLOCK_SIZE as u64 + slot as u64 * 256;

        let mut raw = [0u8; 256];
        self.file
            .read_exact_at(&mut raw, offset)
            .map_err(|e| SiloError::Io(format!("failed to read inode {}: {}", ino, e)))?;

        let mode = get_u16(&raw, 0);
        if mode == 0 {
            return Err(SiloError::NotFound(format!("inode {} is not allocated", ino)));
        }
        let kind = FileKind::from_mode(mode)?;
        let mut block = [0u8; 60];
        block.copy_from_slice(&raw[40..100]);
        let rdev = if matches!(kind, FileKind::CharDevice | FileKind::BlockDevice) {
            decode_rdev(get_u32(&raw, 40), get_u32(&raw, 44))
        } else {
            (0, 0)
        };
        Ok(InodeInfo {
            ino,
            kind,
            mode,
            uid: get_u16(&raw, 2) as u32 | ((get_u16(&raw, 120) as u32) << 16),
            gid: get_u16(&raw, 24) as u32 | ((get_u16(&raw, 122) as u32) << 16),
            size: get_u32(&raw, 4) as u64 | ((get_u32(&raw, 108) as u64) << 32),
            links: get_u16(&raw, 26),
            mtime: get_u32(&raw, 16),
            rdev,
            flags: get_u32(&raw, 32),
            block,
            file_acl: get_u32(&raw, 104),
            raw,
        })
    }

    /// The extent list of an inode, leaves resolved.
    fn extents(&self, info: &InodeInfo) -> SiloResult<Vec<Extent>> {
        Ok(self.extent_tree(info)?.0)
    }

    /// Extents plus the block numbers of any index leaves holding them.
    fn extent_tree(&self, info: &InodeInfo) -> SiloResult<(Vec<Extent>, Vec<u32>)> {
        if info.flags & EXT4_EXTENTS_FL == 0 {
            return Ok((Vec::new(), Vec::new()));
        }
        let header = &info.block[..12];
        if get_u16(header, 0) != EXTENT_MAGIC {
            return Err(SiloError::Format(format!(
                "inode {}: bad extent magic",
                info.ino
            )));
        }
        let entries = get_u16(header, 2) as usize;
        let depth = get_u16(header, 6);
        match depth {
            0 => {
                let mut extents = Vec::with_capacity(entries);
                for i in 0..entries {
                    extents.push(Extent::decode(&info.block[12 + i * 12..24 + i * 12]));
                }
                Ok((extents, Vec::new()))
            }
            1 => {
                let mut extents = Vec::new();
                let mut leaves = Vec::with_capacity(entries);
                for i in 0..entries {
                    let leaf_block = get_u32(&info.block, 12 + i * 12 + 4);
                    leaves.push(leaf_block);
                    let mut leaf = vec![0u8; BLOCK_SIZE as usize];
                    self.file
                        .read_exact_at(&mut leaf, leaf_block as u64 * BLOCK_SIZE as u64)
                        .map_err(|e| {
                            SiloError::Io(format!("failed to read extent leaf: {}", e))
                        })?;
                    if get_u16(&leaf, 0) != EXTENT_MAGIC {
                        return Err(SiloError::Format(format!(
                            "inode {}: bad leaf extent magic",
                            info.ino
                        )));
                    }
                    let leaf_entries = get_u16(&leaf, 2) as usize;
                    for j in 0..leaf_entries {
                        extents.push(Extent::decode(&leaf[12 + j * 12..24 + j * 12]));
                    }
                }
                Ok((extents, leaves))
            }
            deeper => Err(SiloError::Format(format!(
                "inode {}: unsupported extent depth {}",
                info.ino, deeper
            ))),
        }
    }

    /// Read a regular file's full contents.
    pub fn read_file(&self, info: &InodeInfo) -> SiloResult<Vec<u8>> {
        let mut data = vec![0u8; info.size as usize];
        for extent in self.extents(info)? {
            let byte_start = extent.logical as u64 * BLOCK_SIZE as u64;
            let byte_len = (extent.len as u64 * BLOCK_SIZE as u64)
                .min(info.size.saturating_sub(byte_start));
            let range = byte_start as usize..(byte_start + byte_len) as usize;
            self.file
                .read_exact_at(
                    &mut data[range],
                    extent.start as u64 * BLOCK_SIZE as u64,
                )
                .map_err(|e| {
                    SiloError::Io(format!(
                        "failed to read data for inode {}: {}",
                        info.ino, e
                    ))
                })?;
        }
        Ok(data)
    }

    /// A symlink's target bytes.
    pub fn symlink_target(&self, info: &InodeInfo) -> SiloResult<Vec<u8>> {
        if info.kind != FileKind::Symlink {
            return Err(SiloError::InvalidArgument(format!(
                "inode {} is not a symlink",
                info.ino
            )));
        }
        if info.flags & EXT4_EXTENTS_FL == 0 {
            Ok(info.block[..info.size as usize].to_vec())
        } else {
            self.read_file(info)
        }
    }

    /// Directory entries of `ino`, `.` and `..` excluded, sorted by name.
    pub fn children(&self, ino: u32) -> SiloResult<Vec<DirEntry>> {
        let info = self.inode(ino)?;
        if info.kind != FileKind::Directory {
            return Err(SiloError::InvalidArgument(format!(
                "inode {} is not a directory",
                ino
            )));
        }
        let data = self.read_file(&info)?;
        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset + 8 <= data.len() {
            let entry_ino = get_u32(&data, offset);
            let rec_len = get_u16(&data, offset + 4) as usize;
            if rec_len < 8 {
                return Err(SiloError::Format(format!(
                    "inode {}: corrupt directory entry",
                    ino
                )));
            }
            let name_len = data[offset + 6] as usize;
            if entry_ino != 0 {
                let name =
                    String::from_utf8_lossy(&data[offset + 8..offset + 8 + name_len])
                        .into_owned();
                if name != "." && name != ".." {
                    entries.push(DirEntry {
                        name,
                        ino: entry_ino,
                    });
                }
            }
            offset += rec_len;
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Resolve a literal path (no symlink traversal) to its inode.
    pub fn lookup(&self, path: &Path) -> SiloResult<Option<u32>> {
        let comps = normalize_components(path);
        let mut current = ROOT_INO;
        for name in &comps {
            let children = match self.children(current) {
                Ok(children) => children,
                Err(SiloError::InvalidArgument(_)) => return Ok(None),
                Err(e) => return Err(e),
            };
            match children.iter().find(|e| e.name == *name) {
                Some(entry) => current = entry.ino,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    pub fn exists(&self, path: &Path) -> SiloResult<bool> {
        Ok(self.lookup(path)?.is_some())
    }

    /// Extended attributes, inline region and overflow block combined.
    /// `system.data` is reserved for inline file data and never surfaced.
    pub fn xattrs(&self, ino: u32) -> SiloResult<Vec<(String, Vec<u8>)>> {
        let info = self.inode(ino)?;
        let mut pairs = Vec::new();
        if get_u32(&info.raw, 160) == XATTR_MAGIC {
            pairs.extend(decode_xattrs(&info.raw[164..256], 0)?);
        }
        if info.file_acl != 0 {
            let mut block = vec![0u8; BLOCK_SIZE as usize];
            self.file
                .read_exact_at(&mut block, info.file_acl as u64 * BLOCK_SIZE as u64)
                .map_err(|e| SiloError::Io(format!("failed to read xattr block: {}", e)))?;
            if get_u32(&block, 0) != XATTR_MAGIC {
                return Err(SiloError::Format(format!(
                    "inode {}: bad xattr block magic",
                    ino
                )));
            }
            pairs.extend(decode_xattrs(&block[32..], 32)?);
        }
        pairs.retain(|(name, _)| name != SYSTEM_DATA_XATTR);
        Ok(pairs)
    }

    /// Export the image as a PAX-format tar stream.
    ///
    /// Deterministic depth-first order; hardlinks detected by inode
    /// reuse, the first path seen becoming the link target.
    pub fn export<W: Write>(&self, out: W) -> SiloResult<()> {
        let mut builder = tar::Builder::new(out);
        let mut seen: HashMap<u32, PathBuf> = HashMap::new();
        self.export_dir(&mut builder, ROOT_INO, Path::new(""), &mut seen)?;
        builder
            .finish()
            .map_err(|e| SiloError::Io(format!("failed to finish tar stream: {}", e)))?;
        Ok(())
    }

    fn export_dir<W: Write>(
        &self,
        builder: &mut tar::Builder<W>,
        dir_ino: u32,
        dir_path: &Path,
        seen: &mut HashMap<u32, PathBuf>,
    ) -> SiloResult<()> {
        for entry in self.children(dir_ino)? {
            let path = dir_path.join(&entry.name);
            let info = self.inode(entry.ino)?;
            self.export_entry(builder, &info, &path, seen)?;
            if info.kind == FileKind::Directory {
                self.export_dir(builder, entry.ino, &path, seen)?;
            }
        }
        Ok(())
    }

    fn export_entry<W: Write>(
        &self,
        builder: &mut tar::Builder<W>,
        info: &InodeInfo,
        path: &Path,
        seen: &mut HashMap<u32, PathBuf>,
    ) -> SiloResult<()> {
        if info.kind == FileKind::Socket {
            // Sockets have no tar representation; skip them the way GNU
            // tar does.
            return Ok(());
        }

        let mut header = tar::Header::new_ustar();
        header.set_mode(info.perm());
        header.set_uid(info.uid as u64);
        header.set_gid(info.gid as u64);
        header.set_mtime(info.mtime as u64);
        header.set_size(0);

        // All PAX records for this entry travel in one extended header.
        let mut pax: Vec<(String, Vec<u8>)> = self
            .xattrs(info.ino)?
            .into_iter()
            .map(|(name, value)| (format!("SCHILY.xattr.{}", name), value))
            .collect();

        // A hardlink is any re-encountered inode; the first path seen is
        // the target.
        let mut hardlink_target = None;
        if info.kind == FileKind::Regular && info.links > 1 {
            match seen.get(&info.ino) {
                Some(first) => hardlink_target = Some(first.clone()),
                None => {
                    seen.insert(info.ino, path.to_path_buf());
                }
            }
        }

        let mut data: Vec<u8> = Vec::new();
        match (&hardlink_target, info.kind) {
            (Some(first), _) => {
                header.set_entry_type(tar::EntryType::Link);
                set_link_target(&mut header, first, &mut pax);
            }
            (None, FileKind::Directory) => {
                header.set_entry_type(tar::EntryType::Directory);
            }
            (None, FileKind::Regular) => {
                header.set_entry_type(tar::EntryType::Regular);
                data = self.read_file(info)?;
                header.set_size(info.size);
            }
            (None, FileKind::Symlink) => {
                header.set_entry_type(tar::EntryType::Symlink);
                let target = self.symlink_target(info)?;
                let target = PathBuf::from(String::from_utf8_lossy(&target).into_owned());
                set_link_target(&mut header, &target, &mut pax);
            }
            (None, FileKind::CharDevice | FileKind::BlockDevice) => {
                header.set_entry_type(if info.kind == FileKind::CharDevice {
                    tar::EntryType::Char
                } else {
                    tar::EntryType::Block
                });
                header
                    .set_device_major(info.rdev.0)
                    .map_err(|e| SiloError::Format(format!("device major: {}", e)))?;
                header
                    .set_device_minor(info.rdev.1)
                    .map_err(|e| SiloError::Format(format!("device minor: {}", e)))?;
            }
            (None, FileKind::Fifo) => {
                header.set_entry_type(tar::EntryType::Fifo);
            }
            (None, FileKind::Socket) => unreachable!(),
        }

        if !pax.is_empty() {
            builder
                .append_pax_extensions(pax.iter().map(|(k, v)| (k.as_str(), v.as_slice())))
                .map_err(|e| SiloError::Io(format!("failed to write pax records: {}", e)))?;
        }
        builder
            .append_data(&mut header, path, data.as_slice())
            .map_err(|e| SiloError::Io(format!("failed to append {}: {}", path.display(), e)))
    }

    /// Consistency check over a closed image:
    ///
    /// - every inode referenced from the directory tree is allocated in
    ///   the inode bitmaps;
    /// - every allocated data/leaf/xattr block belongs to exactly one
    ///   inode and is marked used in the block bitmaps;
    /// - the superblock's free counts match the bitmaps.
    pub fn verify(&self) -> SiloResult<()> {
        let block_bitmaps = self.read_bitmaps(|g| g.block_bitmap)?;
        let inode_bitmaps = self.read_bitmaps(|g| g.inode_bitmap)?;

        // Walk the tree, accumulating block ownership.
        let mut owned: Vec<(u32, u32, u32)> = Vec::new(); // (start, len, ino)
        let mut visited: std::collections::HashSet<u32> = std::collections::HashSet::new();
        let mut stack = vec![ROOT_INO];
        while let Some(ino) = stack.pop() {
            if !visited.insert(ino) {
                continue; // hard link, already accounted
            }
            if !bitmap_bit(&inode_bitmaps, ino - 1, self.superblock.inodes_per_group) {
                return Err(SiloError::Format(format!(
                    "inode {} is reachable but not allocated",
                    ino
                )));
            }
            let info = self.inode(ino)?;
            let (extents, leaves) = self.extent_tree(&info)?;
            for extent in extents {
                owned.push((extent.start, extent.len, ino));
            }
            for leaf in leaves {
                owned.push((leaf, 1, ino));
            }
            if info.file_acl != 0 {
                owned.push((info.file_acl, 1, ino));
            }
            if info.kind == FileKind::Directory {
                for entry in self.children(ino)? {
                    stack.push(entry.ino);
                }
            }
        }

        // No block may appear in two trees, and every owned block must
        // be marked allocated.
        owned.sort_unstable();
        for window in owned.windows(2) {
            let (a_start, a_len, a_ino) = window[0];
            let (b_start, _, b_ino) = window[1];
            if b_start < a_start + a_len {
                return Err(SiloError::Format(format!(
                    "block {} owned by both inode {} and inode {}",
                    b_start, a_ino, b_ino
                )));
            }
        }
        for (start, len, ino) in &owned {
            for block in *start..*start + *len {
                if !bitmap_bit(&block_bitmaps, block, self.superblock.blocks_per_group) {
                    return Err(SiloError::Format(format!(
                        "inode {} references free block {}",
                        ino, block
                    )));
                }
            }
        }

        // Free counts in the superblock are byte-for-byte bitmap truth.
        let free_blocks = (0..self.superblock.blocks_count)
            .filter(|b| !bitmap_bit(&block_bitmaps, *b, self.superblock.blocks_per_group))
            .count() as u32;
        if free_blocks != self.superblock.free_blocks {
            return Err(SiloError::Format(format!(
                "superblock claims {} free blocks, bitmaps hold {}",
                self.superblock.free_blocks, free_blocks
            )));
        }
        let free_inodes = (0..self.superblock.inodes_count)
            .filter(|i| !bitmap_bit(&inode_bitmaps, *i, self.superblock.inodes_per_group))
            .count() as u32;
        if free_inodes != self.superblock.free_inodes {
            return Err(SiloError::Format(format!(
                "superblock claims {} free inodes, bitmaps hold {}",
                self.superblock.free_inodes, free_inodes
            )));
        }
        Ok(())
    }

    /// Concatenated per-group bitmap blocks, in group order.
    fn read_bitmaps(&self, which: impl Fn(&GroupDesc) -> u32) -> SiloResult<Vec<u8>> {
        let mut bits = Vec::with_capacity(self.groups.len() * BLOCK_SIZE as usize);
        for desc in &self.groups {
            let mut block = vec![0u8; BLOCK_SIZE as usize];
            self.file
                .read_exact_at(&mut block, which(desc) as u64 * BLOCK_SIZE as u64)
                .map_err(|e| SiloError::Io(format!("failed to read bitmap: {}", e)))?;
            bits.extend_from_slice(&block);
        }
        Ok(bits)
    }
}

/// Bit for unit `index` within concatenated per-group bitmap blocks.
/// Each group owns a full bitmap block even when it tracks fewer units
/// (inode bitmaps), so indexing goes through the group geometry.
fn bitmap_bit(bitmaps: &[u8], index: u32, units_per_group: u32) -> bool {
    let group = (index / units_per_group) as usize;
    let slot = (index % units_per_group) as usize;
    let bit = group * BLOCK_SIZE as usize * 8 + slot;
    bitmaps[bit / 8] & (1 << (bit % 8)) != 0
}

/// Store a link target, spilling into a PAX `linkpath` record when it
/// exceeds the ustar field.
fn set_link_target(header: &mut tar::Header, target: &Path, pax: &mut Vec<(String, Vec<u8>)>) {
    if header.set_link_name(target).is_err() {
        pax.push((
            "linkpath".to_string(),
            target.as_os_str().as_encoded_bytes().to_vec(),
        ));
    }
}
