//! EXT4 on-disk structures.
//!
//! Little-endian field packing for the superblock, group descriptors,
//! inodes, extent tree nodes, directory entries, and xattr regions. Only
//! the features the formatter emits are modelled: filetype + extents,
//! sparse_super + large_file, 4 KiB blocks, 256-byte inodes, no journal,
//! no metadata checksums.

use silo_shared::{SiloError, SiloResult};

pub const BLOCK_SIZE: u32 = 4096;
pub const LOG_BLOCK_SIZE: u32 = 2;
pub const INODE_SIZE: u32 = 256;
pub const INODES_PER_BLOCK: u32 = BLOCK_SIZE / INODE_SIZE;
/// One bitmap block addresses exactly this many blocks.
pub const BLOCKS_PER_GROUP: u32 = 8 * BLOCK_SIZE;
pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const SUPERBLOCK_MAGIC: u16 = 0xEF53;
pub const ROOT_INO: u32 = 2;
pub const FIRST_INO: u32 = 11;
pub const LOST_FOUND_NAME: &str = "lost+found";

pub const EXTENT_MAGIC: u16 = 0xF30A;
/// Extent entries that fit the inode's 60-byte block area beside a header.
pub const ROOT_EXTENT_SLOTS: usize = 4;
/// Extent entries per 4 KiB leaf or index block.
pub const BLOCK_EXTENT_SLOTS: usize = (BLOCK_SIZE as usize - EXTENT_HEADER_LEN) / EXTENT_ENTRY_LEN;
pub const EXTENT_HEADER_LEN: usize = 12;
pub const EXTENT_ENTRY_LEN: usize = 12;
/// Longest run one initialized extent can describe.
pub const MAX_EXTENT_LEN: u32 = 32768;

pub const XATTR_MAGIC: u32 = 0xEA02_0000;
/// Bytes between the end of the 160-byte inode body and the inode's end.
pub const INLINE_XATTR_SIZE: usize = 96;
pub const GOOD_OLD_INODE_SIZE: u16 = 128;
pub const EXTRA_ISIZE: u16 = 32;

pub const COMPAT_EXT_ATTR: u32 = 0x0008;
pub const INCOMPAT_FILETYPE: u32 = 0x0002;
pub const INCOMPAT_EXTENTS: u32 = 0x0040;
pub const RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;
pub const RO_COMPAT_LARGE_FILE: u32 = 0x0002;

pub const EXT4_EXTENTS_FL: u32 = 0x0008_0000;

/// Longest fast-symlink target: anything shorter than the block area.
pub const MAX_INLINE_SYMLINK: usize = 59;

// i_mode file type bits.
pub const S_IFMT: u16 = 0xF000;
pub const S_IFSOCK: u16 = 0xC000;
pub const S_IFLNK: u16 = 0xA000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFBLK: u16 = 0x6000;
pub const S_IFDIR: u16 = 0x4000;
pub const S_IFCHR: u16 = 0x2000;
pub const S_IFIFO: u16 = 0x1000;

/// Directory entry file-type codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Symlink,
}

impl FileKind {
    pub fn from_mode(mode: u16) -> SiloResult<FileKind> {
        match mode & S_IFMT {
            S_IFREG => Ok(FileKind::Regular),
            S_IFDIR => Ok(FileKind::Directory),
            S_IFCHR => Ok(FileKind::CharDevice),
            S_IFBLK => Ok(FileKind::BlockDevice),
            S_IFIFO => Ok(FileKind::Fifo),
            S_IFSOCK => Ok(FileKind::Socket),
            S_IFLNK => Ok(FileKind::Symlink),
            other => Err(SiloError::UnsupportedFiletype(format!(
                "mode {:#06x}",
                other
            ))),
        }
    }

    pub fn dirent_code(self) -> u8 {
        match self {
            FileKind::Regular => 1,
            FileKind::Directory => 2,
            FileKind::CharDevice => 3,
            FileKind::BlockDevice => 4,
            FileKind::Fifo => 5,
            FileKind::Socket => 6,
            FileKind::Symlink => 7,
        }
    }
}

// Little-endian field helpers.
pub(crate) fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

pub(crate) fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Groups carrying a superblock + GDT backup under sparse_super:
/// 0, 1, and powers of 3, 5, 7.
pub fn group_has_super(group: u32) -> bool {
    if group <= 1 {
        return true;
    }
    for base in [3u32, 5, 7] {
        let mut n = base;
        while n < group {
            n = match n.checked_mul(base) {
                Some(n) => n,
                None => break,
            };
        }
        if n == group {
            return true;
        }
    }
    false
}

/// Filesystem geometry fixed at open time.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    pub block_count: u32,
    pub group_count: u32,
    pub inodes_per_group: u32,
    /// Blocks the group descriptor table occupies.
    pub gdt_blocks: u32,
    /// Blocks one group's inode table occupies.
    pub inode_table_blocks: u32,
}

impl Geometry {
    pub fn new(min_disk_size: u64) -> SiloResult<Geometry> {
        let requested = min_disk_size.div_ceil(BLOCK_SIZE as u64);
        if requested > u32::MAX as u64 {
            return Err(SiloError::InvalidArgument(format!(
                "disk size {} exceeds the 16 TiB limit of 32-bit block numbers",
                min_disk_size
            )));
        }
        // Small images still need room for one group's metadata.
        let mut block_count = (requested as u32).max(2048);

        // A short trailing group must still hold its own bitmaps and
        // inode table; grow the image until the tail fits (converges
        // because the requirement never exceeds a full group).
        loop {
            let group_count = block_count.div_ceil(BLOCKS_PER_GROUP);

            // Scale the inode count with the disk: one inode per four
            // blocks, bounded, rounded to whole inode-table blocks.
            let per_group = (block_count / group_count / 4).clamp(1024, 8192);
            let inodes_per_group = per_group.next_multiple_of(INODES_PER_BLOCK);
            let inode_table_blocks = inodes_per_group * INODE_SIZE / BLOCK_SIZE;
            let gdt_blocks = (group_count * 32).div_ceil(BLOCK_SIZE);

            let last_group = group_count - 1;
            let mut tail_needed = 2 + inode_table_blocks + 64;
            if group_has_super(last_group) {
                tail_needed += 1 + gdt_blocks;
            }
            let tail_blocks = block_count - last_group * BLOCKS_PER_GROUP;
            if tail_blocks < tail_needed {
                block_count = last_group * BLOCKS_PER_GROUP + tail_needed;
                continue;
            }

            return Ok(Geometry {
                block_count,
                group_count,
                inodes_per_group,
                gdt_blocks,
                inode_table_blocks,
            });
        }
    }

    pub fn inode_count(&self) -> u32 {
        self.group_count * self.inodes_per_group
    }

    /// First block of a group.
    pub fn group_start(&self, group: u32) -> u32 {
        group * BLOCKS_PER_GROUP
    }

    /// Blocks in a group (the last one may be short).
    pub fn group_blocks(&self, group: u32) -> u32 {
        let start = self.group_start(group);
        (self.block_count - start).min(BLOCKS_PER_GROUP)
    }

    /// Block number of a group's block bitmap.
    pub fn block_bitmap(&self, group: u32) -> u32 {
        let mut at = self.group_start(group);
        if group_has_super(group) {
            at += 1 + self.gdt_blocks;
        }
        at
    }

    pub fn inode_bitmap(&self, group: u32) -> u32 {
        self.block_bitmap(group) + 1
    }

    pub fn inode_table(&self, group: u32) -> u32 {
        self.inode_bitmap(group) + 1
    }

    /// First block usable for data in a group.
    pub fn first_data_block(&self, group: u32) -> u32 {
        self.inode_table(group) + self.inode_table_blocks
    }

    /// Byte offset of an inode in the image.
    pub fn inode_offset(&self, ino: u32) -> u64 {
        let index = ino - 1;
        let group = index / self.inodes_per_group;
        let slot = index % self.inodes_per_group;
        self.inode_table(group) as u64 * BLOCK_SIZE as u64 + slot as u64 * INODE_SIZE as u64
    }
}

/// The fields of the superblock the formatter maintains.
#[derive(Clone, Debug)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub free_blocks: u32,
    pub free_inodes: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub wtime: u32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
}

impl Superblock {
    /// Serialize into the 1024-byte superblock image.
    ///
    /// `block_group_nr` is 0 for the primary copy and the owning group
    /// number for backups.
    pub fn encode(&self, block_group_nr: u16) -> [u8; 1024] {
        let mut b = [0u8; 1024];
        put_u32(&mut b, 0, self.inodes_count);
        put_u32(&mut b, 4, self.blocks_count);
        // 8: reserved blocks, none.
        put_u32(&mut b, 12, self.free_blocks);
        put_u32(&mut b, 16, self.free_inodes);
        // 20: first data block is 0 with 4 KiB blocks.
        put_u32(&mut b, 24, LOG_BLOCK_SIZE);
        put_u32(&mut b, 28, LOG_BLOCK_SIZE); // log cluster size
        put_u32(&mut b, 32, BLOCKS_PER_GROUP);
        put_u32(&mut b, 36, BLOCKS_PER_GROUP); // clusters per group
        put_u32(&mut b, 40, self.inodes_per_group);
        put_u32(&mut b, 44, self.wtime); // mtime
        put_u32(&mut b, 48, self.wtime);
        put_u16(&mut b, 54, 0xFFFF); // max mount count: unchecked
        put_u16(&mut b, 56, SUPERBLOCK_MAGIC);
        put_u16(&mut b, 58, 1); // state: clean
        put_u16(&mut b, 60, 1); // errors: continue
        put_u32(&mut b, 64, self.wtime); // lastcheck
        put_u32(&mut b, 76, 1); // rev level: dynamic
        put_u32(&mut b, 84, FIRST_INO);
        put_u16(&mut b, 88, INODE_SIZE as u16);
        put_u16(&mut b, 90, block_group_nr);
        put_u32(&mut b, 92, COMPAT_EXT_ATTR);
        put_u32(&mut b, 96, INCOMPAT_FILETYPE | INCOMPAT_EXTENTS);
        put_u32(&mut b, 100, RO_COMPAT_SPARSE_SUPER | RO_COMPAT_LARGE_FILE);
        b[104..120].copy_from_slice(&self.uuid);
        b[120..136].copy_from_slice(&self.volume_name);
        put_u16(&mut b, 348, EXTRA_ISIZE); // min extra isize
        put_u16(&mut b, 350, EXTRA_ISIZE); // want extra isize
        b
    }

    pub fn decode(b: &[u8]) -> SiloResult<Superblock> {
        if b.len() < 1024 {
            return Err(SiloError::Format("superblock truncated".into()));
        }
        if get_u16(b, 56) != SUPERBLOCK_MAGIC {
            return Err(SiloError::Format(format!(
                "bad superblock magic {:#06x}",
                get_u16(b, 56)
            )));
        }
        if get_u32(b, 24) != LOG_BLOCK_SIZE {
            return Err(SiloError::Format(format!(
                "unsupported block size {}",
                1024u32 << get_u32(b, 24)
            )));
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&b[104..120]);
        let mut volume_name = [0u8; 16];
        volume_name.copy_from_slice(&b[120..136]);
        Ok(Superblock {
            inodes_count: get_u32(b, 0),
            blocks_count: get_u32(b, 4),
            free_blocks: get_u32(b, 12),
            free_inodes: get_u32(b, 16),
            blocks_per_group: get_u32(b, 32),
            inodes_per_group: get_u32(b, 40),
            wtime: get_u32(b, 48),
            uuid,
            volume_name,
        })
    }
}

/// One 32-byte group descriptor.
#[derive(Clone, Copy, Debug, Default)]
pub struct GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks: u16,
    pub free_inodes: u16,
    pub used_dirs: u16,
}

impl GroupDesc {
    pub fn encode(&self) -> [u8; 32] {
        let mut b = [0u8; 32];
        put_u32(&mut b, 0, self.block_bitmap);
        put_u32(&mut b, 4, self.inode_bitmap);
        put_u32(&mut b, 8, self.inode_table);
        put_u16(&mut b, 12, self.free_blocks);
        put_u16(&mut b, 14, self.free_inodes);
        put_u16(&mut b, 16, self.used_dirs);
        b
    }

    pub fn decode(b: &[u8]) -> GroupDesc {
        GroupDesc {
            block_bitmap: get_u32(b, 0),
            inode_bitmap: get_u32(b, 4),
            inode_table: get_u32(b, 8),
            free_blocks: get_u16(b, 12),
            free_inodes: get_u16(b, 14),
            used_dirs: get_u16(b, 16),
        }
    }
}

/// A contiguous run of blocks backing a contiguous range of a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    /// Logical block within the file.
    pub logical: u32,
    /// First physical block.
    pub start: u32,
    /// Run length in blocks; at most [`MAX_EXTENT_LEN`].
    pub len: u32,
}

impl Extent {
    pub fn encode(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.logical);
        put_u16(buf, 4, self.len as u16);
        // start_hi stays 0: 32-bit block numbers only.
        put_u32(buf, 8, self.start);
    }

    pub fn decode(buf: &[u8]) -> Extent {
        Extent {
            logical: get_u32(buf, 0),
            len: get_u16(buf, 4) as u32,
            start: get_u32(buf, 8),
        }
    }
}

/// Write an extent-tree node header.
pub fn encode_extent_header(buf: &mut [u8], entries: u16, max: u16, depth: u16) {
    put_u16(buf, 0, EXTENT_MAGIC);
    put_u16(buf, 2, entries);
    put_u16(buf, 4, max);
    put_u16(buf, 6, depth);
    // 8: generation, unused.
}

/// Write an index entry pointing at a lower tree node.
pub fn encode_extent_index(buf: &mut [u8], logical: u32, leaf_block: u32) {
    put_u32(buf, 0, logical);
    put_u32(buf, 4, leaf_block);
    // leaf_hi + unused stay 0.
}

/// Encode a device number the way ext4 stores it in `i_block`.
///
/// Returns `(i_block[0], i_block[1])`: small numbers use the historical
/// encoding in the first word, large ones the huge encoding in the second.
pub fn encode_rdev(major: u32, minor: u32) -> (u32, u32) {
    if major < 256 && minor < 256 {
        ((major << 8) | minor, 0)
    } else {
        (0, (minor & 0xff) | (major << 8) | ((minor & !0xff) << 12))
    }
}

pub fn decode_rdev(word0: u32, word1: u32) -> (u32, u32) {
    if word0 != 0 {
        ((word0 >> 8) & 0xff, word0 & 0xff)
    } else {
        ((word1 >> 8) & 0xfff, (word1 & 0xff) | ((word1 >> 12) & !0xffu32))
    }
}

/// Canonical xattr name prefixes; index 0 means "no prefix".
const XATTR_PREFIXES: [(u8, &str); 6] = [
    (1, "user."),
    (2, "system.posix_acl_access"),
    (3, "system.posix_acl_default"),
    (4, "trusted."),
    (6, "security."),
    (7, "system."),
];

/// Split a full xattr name into its (prefix-index, suffix) pair.
pub fn split_xattr_name(name: &str) -> (u8, &str) {
    // Exact-match prefixes (the ACL names) take priority over "system.".
    for (index, prefix) in XATTR_PREFIXES {
        if !prefix.ends_with('.') {
            if name == prefix {
                return (index, "");
            }
            continue;
        }
        if let Some(suffix) = name.strip_prefix(prefix) {
            return (index, suffix);
        }
    }
    (0, name)
}

/// Rebuild a full xattr name from its stored pair.
pub fn join_xattr_name(index: u8, suffix: &str) -> String {
    for (i, prefix) in XATTR_PREFIXES {
        if i == index {
            if !prefix.ends_with('.') {
                return prefix.to_string();
            }
            return format!("{}{}", prefix, suffix);
        }
    }
    suffix.to_string()
}

/// Size one xattr entry occupies in the entry table (padded to 4 bytes),
/// not counting its value.
pub fn xattr_entry_size(suffix_len: usize) -> usize {
    (16 + suffix_len).next_multiple_of(4)
}

/// Space a set of xattrs needs: entry table + terminator + padded values.
pub fn xattr_region_size(pairs: &[(String, Vec<u8>)]) -> usize {
    let mut total = 4; // terminating zero word
    for (name, value) in pairs {
        let (_, suffix) = split_xattr_name(name);
        total += xattr_entry_size(suffix.len());
        total += value.len().next_multiple_of(4);
    }
    total
}

/// Serialize xattrs into a region. `region` is the full writable area;
/// entries grow from the front, values from the back. Offsets stored in
/// entries are relative to `value_base` (0 for in-inode regions where
/// offsets count from the first entry, 32 for blocks where they count
/// from the block start).
pub fn encode_xattrs(region: &mut [u8], pairs: &[(String, Vec<u8>)], value_base: u16) {
    let mut entry_off = 0usize;
    let mut value_end = region.len();
    for (name, value) in pairs {
        let (index, suffix) = split_xattr_name(name);
        let value_start = value_end - value.len().next_multiple_of(4);
        region[value_start..value_start + value.len()].copy_from_slice(value);

        region[entry_off] = suffix.len() as u8;
        region[entry_off + 1] = index;
        put_u16(region, entry_off + 2, value_start as u16 + value_base);
        // 4: e_value_inum, always 0 (no ea_inode feature).
        put_u32(region, entry_off + 8, value.len() as u32);
        region[entry_off + 16..entry_off + 16 + suffix.len()]
            .copy_from_slice(suffix.as_bytes());
        entry_off += xattr_entry_size(suffix.len());
        value_end = value_start;
    }
    // Terminator: already zeroed.
}

/// Parse xattrs out of a region written by [`encode_xattrs`].
pub fn decode_xattrs(region: &[u8], value_base: u16) -> SiloResult<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::new();
    let mut off = 0usize;
    while off + 16 <= region.len() {
        let name_len = region[off] as usize;
        let index = region[off + 1];
        if name_len == 0 && index == 0 && get_u16(region, off + 2) == 0 {
            break;
        }
        let value_offs = get_u16(region, off + 2) as usize - value_base as usize;
        let value_len = get_u32(region, off + 8) as usize;
        if off + 16 + name_len > region.len() || value_offs + value_len > region.len() {
            return Err(SiloError::Format("xattr entry out of bounds".into()));
        }
        let suffix = std::str::from_utf8(&region[off + 16..off + 16 + name_len])
            .map_err(|_| SiloError::Format("non-utf8 xattr name".into()))?;
        out.push((
            join_xattr_name(index, suffix),
            region[value_offs..value_offs + value_len].to_vec(),
        ));
        off += xattr_entry_size(name_len);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_has_super_sparse() {
        let with_super: Vec<u32> = (0..200).filter(|g| group_has_super(*g)).collect();
        assert_eq!(with_super, vec![0, 1, 3, 5, 7, 9, 25, 27, 49, 81, 125]);
    }

    #[test]
    fn test_superblock_roundtrip() {
        let sb = Superblock {
            inodes_count: 8192,
            blocks_count: 65536,
            free_blocks: 60000,
            free_inodes: 8000,
            blocks_per_group: BLOCKS_PER_GROUP,
            inodes_per_group: 4096,
            wtime: 1_700_000_000,
            uuid: [7u8; 16],
            volume_name: *b"silo\0\0\0\0\0\0\0\0\0\0\0\0",
        };
        let encoded = sb.encode(0);
        assert_eq!(get_u16(&encoded, 56), SUPERBLOCK_MAGIC);
        let back = Superblock::decode(&encoded).unwrap();
        assert_eq!(back.blocks_count, 65536);
        assert_eq!(back.free_blocks, 60000);
        assert_eq!(back.uuid, [7u8; 16]);
    }

    #[test]
    fn test_superblock_rejects_bad_magic() {
        let zeros = [0u8; 1024];
        assert!(Superblock::decode(&zeros).is_err());
    }

    #[test]
    fn test_geometry_small_image() {
        let g = Geometry::new(8 * 1024 * 1024).unwrap();
        assert_eq!(g.block_count, 2048);
        assert_eq!(g.group_count, 1);
        assert_eq!(g.inodes_per_group % INODES_PER_BLOCK, 0);
        // Metadata must leave data blocks free.
        assert!(g.first_data_block(0) < g.block_count);
    }

    #[test]
    fn test_geometry_multi_group() {
        let g = Geometry::new(512 * 1024 * 1024).unwrap();
        assert_eq!(g.block_count, 131072);
        assert_eq!(g.group_count, 4);
        assert_eq!(g.group_blocks(3), 131072 - 3 * BLOCKS_PER_GROUP);
        assert!(g.inode_offset(1) >= g.inode_table(0) as u64 * BLOCK_SIZE as u64);
    }

    #[test]
    fn test_rdev_roundtrip() {
        for (major, minor) in [(1, 3), (10, 200), (259, 7), (4, 1048575)] {
            let (w0, w1) = encode_rdev(major, minor);
            assert_eq!(decode_rdev(w0, w1), (major, minor));
        }
    }

    #[test]
    fn test_xattr_name_split() {
        assert_eq!(split_xattr_name("user.foo"), (1, "foo"));
        assert_eq!(split_xattr_name("security.selinux"), (6, "selinux"));
        assert_eq!(split_xattr_name("system.data"), (7, "data"));
        assert_eq!(
            split_xattr_name("system.posix_acl_access"),
            (2, "")
        );
        assert_eq!(split_xattr_name("oddball"), (0, "oddball"));
        assert_eq!(join_xattr_name(1, "foo"), "user.foo");
        assert_eq!(join_xattr_name(2, ""), "system.posix_acl_access");
    }

    #[test]
    fn test_xattr_region_roundtrip() {
        let pairs = vec![
            ("user.alpha".to_string(), b"one".to_vec()),
            ("security.selinux".to_string(), b"context_t".to_vec()),
        ];
        let size = xattr_region_size(&pairs);
        assert!(size <= INLINE_XATTR_SIZE - 4);
        let mut region = vec![0u8; INLINE_XATTR_SIZE - 4];
        encode_xattrs(&mut region, &pairs, 0);
        let back = decode_xattrs(&region, 0).unwrap();
        assert_eq!(back, pairs);
    }

    #[test]
    fn test_extent_roundtrip() {
        let e = Extent {
            logical: 12,
            start: 99,
            len: 300,
        };
        let mut buf = [0u8; 12];
        e.encode(&mut buf);
        assert_eq!(Extent::decode(&buf), e);
    }
}
