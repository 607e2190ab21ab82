//! Streaming EXT4 image writer.
//!
//! One-shot lifecycle: `open` → any number of create/link/unlink/unpack
//! calls → `close`. File payload blocks stream to disk as they arrive;
//! inodes, directories, bitmaps, group descriptors, and superblocks are
//! kept in memory and laid down at close, which is what lets a single
//! pass over ordered layer tarballs produce a mountable image.

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Component, Path, PathBuf};

use rand::Rng as _;
use silo_shared::{SiloError, SiloResult};
use tracing::debug;

use super::alloc::{BlockAllocator, InodeAllocator};
use super::layout::{
    self, encode_extent_header, encode_extent_index, encode_rdev, group_has_super,
    xattr_region_size, Extent, FileKind, Geometry, GroupDesc, Superblock, BLOCKS_PER_GROUP,
    BLOCK_EXTENT_SLOTS, BLOCK_SIZE, EXT4_EXTENTS_FL, FIRST_INO, INLINE_XATTR_SIZE,
    LOST_FOUND_NAME, MAX_EXTENT_LEN, MAX_INLINE_SYMLINK, ROOT_EXTENT_SLOTS, ROOT_INO,
    SUPERBLOCK_OFFSET, S_IFDIR, S_IFLNK,
};

/// Options accepted by [`Ext4Formatter::open`].
#[derive(Clone, Debug)]
pub struct FormatterOptions {
    /// Only 4096 is supported.
    pub block_size: u32,
    /// The image is at least this many bytes; metadata may round it up.
    pub min_disk_size: u64,
    pub volume_name: String,
}

impl Default for FormatterOptions {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            min_disk_size: 256 * 1024 * 1024,
            volume_name: String::new(),
        }
    }
}

/// File attributes for create operations.
#[derive(Clone, Debug)]
pub struct Attrs {
    /// Full mode including the `S_IF*` type bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    /// Device numbers, required for char/block nodes.
    pub rdev: Option<(u32, u32)>,
    pub xattrs: Vec<(String, Vec<u8>)>,
}

impl Attrs {
    pub fn new(mode: u32) -> Self {
        Self {
            mode,
            uid: 0,
            gid: 0,
            mtime: 0,
            rdev: None,
            xattrs: Vec::new(),
        }
    }

    pub fn owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn mtime(mut self, mtime: i64) -> Self {
        self.mtime = mtime;
        self
    }

    pub fn rdev(mut self, major: u32, minor: u32) -> Self {
        self.rdev = Some((major, minor));
        self
    }

    pub fn xattrs(mut self, xattrs: Vec<(String, Vec<u8>)>) -> Self {
        self.xattrs = xattrs;
        self
    }
}

pub(super) enum Content {
    Dir {
        parent: u32,
        children: BTreeMap<String, u32>,
    },
    File {
        extents: Vec<Extent>,
    },
    Symlink {
        target: Vec<u8>,
        extents: Vec<Extent>,
    },
    /// Char/block device; numbers live in the record.
    Device,
    /// Fifo or socket.
    Bare,
}

pub(super) struct InodeRecord {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    /// Directory-entry references for non-directories.
    pub links: u16,
    pub size: u64,
    pub mtime: u32,
    pub rdev: (u32, u32),
    pub xattrs: Vec<(String, Vec<u8>)>,
    pub content: Content,
}

impl InodeRecord {
    fn is_dir(&self) -> bool {
        matches!(self.content, Content::Dir { .. })
    }

    fn kind(&self) -> SiloResult<FileKind> {
        FileKind::from_mode(self.mode)
    }

    fn extents(&self) -> &[Extent] {
        match &self.content {
            Content::File { extents } => extents,
            Content::Symlink { extents, .. } => extents,
            _ => &[],
        }
    }
}

/// The extent tree's root node as stored in `i_block`.
enum ExtentRoot {
    Leaf(Vec<Extent>),
    Index(Vec<(u32, u32)>),
}

/// Streaming EXT4 image builder. Single-task use only; operations take
/// `&mut self` and the type is not `Sync`.
pub struct Ext4Formatter {
    file: File,
    path: PathBuf,
    geometry: Geometry,
    blocks: BlockAllocator,
    inode_numbers: InodeAllocator,
    inodes: BTreeMap<u32, InodeRecord>,
    /// Directory data extents, built at close (directories keep their
    /// in-memory child maps until the inode table is written).
    dir_extents: BTreeMap<u32, Vec<Extent>>,
    uuid: [u8; 16],
    volume_name: [u8; 16],
}

impl Ext4Formatter {
    /// Create the image file and the empty filesystem skeleton: root
    /// directory at inode 2 and `lost+found` at inode 11.
    pub fn open(path: &Path, options: FormatterOptions) -> SiloResult<Ext4Formatter> {
        if options.block_size != BLOCK_SIZE {
            return Err(SiloError::Unsupported(format!(
                "block size {} (only {} is supported)",
                options.block_size, BLOCK_SIZE
            )));
        }
        let geometry = Geometry::new(options.min_disk_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| SiloError::Io(format!("failed to create {}: {}", path.display(), e)))?;
        file.set_len(geometry.block_count as u64 * BLOCK_SIZE as u64)
            .map_err(|e| SiloError::Io(format!("failed to size {}: {}", path.display(), e)))?;

        let mut blocks = BlockAllocator::new(geometry.block_count);
        for group in 0..geometry.group_count {
            if group_has_super(group) {
                blocks.reserve(geometry.group_start(group), 1 + geometry.gdt_blocks)?;
            }
            blocks.reserve(geometry.block_bitmap(group), 2)?;
            blocks.reserve(geometry.inode_table(group), geometry.inode_table_blocks)?;
        }

        let mut uuid = [0u8; 16];
        rand::rng().fill(&mut uuid[..]);
        // RFC 4122 version/variant bits, as any mkfs stamps.
        uuid[6] = (uuid[6] & 0x0F) | 0x40;
        uuid[8] = (uuid[8] & 0x3F) | 0x80;

        let mut volume_name = [0u8; 16];
        let name_bytes = options.volume_name.as_bytes();
        let n = name_bytes.len().min(15);
        volume_name[..n].copy_from_slice(&name_bytes[..n]);

        let mut formatter = Ext4Formatter {
            file,
            path: path.to_path_buf(),
            geometry,
            blocks,
            inode_numbers: InodeAllocator::new(FIRST_INO + 1, geometry.inode_count()),
            inodes: BTreeMap::new(),
            dir_extents: BTreeMap::new(),
            uuid,
            volume_name,
        };

        let mut root_children = BTreeMap::new();
        root_children.insert(LOST_FOUND_NAME.to_string(), FIRST_INO);
        formatter.inodes.insert(
            ROOT_INO,
            InodeRecord {
                mode: S_IFDIR | 0o755,
                uid: 0,
                gid: 0,
                links: 1,
                size: 0,
                mtime: 0,
                rdev: (0, 0),
                xattrs: Vec::new(),
                content: Content::Dir {
                    parent: ROOT_INO,
                    children: root_children,
                },
            },
        );
        formatter.inodes.insert(
            FIRST_INO,
            InodeRecord {
                mode: S_IFDIR | 0o700,
                uid: 0,
                gid: 0,
                links: 1,
                size: 0,
                mtime: 0,
                rdev: (0, 0),
                xattrs: Vec::new(),
                content: Content::Dir {
                    parent: ROOT_INO,
                    children: BTreeMap::new(),
                },
            },
        );

        debug!(
            path = %path.display(),
            blocks = geometry.block_count,
            groups = geometry.group_count,
            "opened ext4 formatter"
        );
        Ok(formatter)
    }

    pub fn image_path(&self) -> &Path {
        &self.path
    }

    /// Create a file, directory, device, fifo, or socket at `path`.
    /// `data` is consumed only for regular files. An existing entry at
    /// the same path is replaced (last entry wins); an existing directory
    /// replaced by a directory only has its attributes updated.
    pub fn create<R: Read>(
        &mut self,
        path: &Path,
        attrs: Attrs,
        data: Option<R>,
    ) -> SiloResult<()> {
        let kind = FileKind::from_mode(attrs.mode as u16)?;
        if kind == FileKind::Symlink {
            return Err(SiloError::InvalidArgument(
                "use create_symlink for symbolic links".into(),
            ));
        }
        let comps = normalize_components(path);
        if comps.is_empty() {
            // Creating "/" refreshes root attributes.
            if kind != FileKind::Directory {
                return Err(SiloError::InvalidArgument(
                    "root can only be a directory".into(),
                ));
            }
            let root = self.record_mut(ROOT_INO)?;
            root.mode = attrs.mode as u16;
            root.uid = attrs.uid;
            root.gid = attrs.gid;
            root.mtime = attrs.mtime as u32;
            root.xattrs = attrs.xattrs;
            return Ok(());
        }

        self.ensure_parent_dirs(&comps)?;
        let (dir_ino, name) = self.resolve_parent(&comps)?;
        if let Some(existing) = self.child_of(dir_ino, &name)? {
            let existing_is_dir = self.record(existing)?.is_dir();
            if existing_is_dir && kind == FileKind::Directory {
                let rec = self.record_mut(existing)?;
                rec.mode = attrs.mode as u16;
                rec.uid = attrs.uid;
                rec.gid = attrs.gid;
                rec.mtime = attrs.mtime as u32;
                rec.xattrs = attrs.xattrs;
                return Ok(());
            }
            self.remove_entry(dir_ino, &name)?;
        }

        let content = match kind {
            FileKind::Directory => Content::Dir {
                parent: dir_ino,
                children: BTreeMap::new(),
            },
            FileKind::Regular => {
                let (extents, size) = match data {
                    Some(reader) => self.write_stream(reader)?,
                    None => (Vec::new(), 0),
                };
                self.insert_child(dir_ino, &name, attrs, Content::File { extents }, size)?;
                return Ok(());
            }
            FileKind::CharDevice | FileKind::BlockDevice => {
                if attrs.rdev.is_none() {
                    return Err(SiloError::InvalidArgument(format!(
                        "device node {} without device numbers",
                        path.display()
                    )));
                }
                Content::Device
            }
            FileKind::Fifo | FileKind::Socket => Content::Bare,
            FileKind::Symlink => unreachable!(),
        };
        self.insert_child(dir_ino, &name, attrs, content, 0)?;
        Ok(())
    }

    /// Create a symbolic link. The target is stored verbatim; it is not
    /// resolved and may point outside the image.
    pub fn create_symlink(&mut self, path: &Path, target: &Path, attrs: Attrs) -> SiloResult<()> {
        let comps = normalize_components(path);
        if comps.is_empty() {
            return Err(SiloError::InvalidArgument(
                "cannot replace root with a symlink".into(),
            ));
        }
        self.ensure_parent_dirs(&comps)?;
        let (dir_ino, name) = self.resolve_parent(&comps)?;
        if self.child_of(dir_ino, &name)?.is_some() {
            self.remove_entry(dir_ino, &name)?;
        }

        let target_bytes = target.as_os_str().as_encoded_bytes().to_vec();
        let size = target_bytes.len() as u64;
        let content = if target_bytes.len() <= MAX_INLINE_SYMLINK {
            Content::Symlink {
                target: target_bytes,
                extents: Vec::new(),
            }
        } else {
            let mut padded = target_bytes.clone();
            padded.resize(padded.len().next_multiple_of(BLOCK_SIZE as usize), 0);
            let extents = self.write_metadata_blocks(&padded)?;
            Content::Symlink {
                target: target_bytes,
                extents,
            }
        };

        let attrs = Attrs {
            mode: (S_IFLNK | 0o777) as u32,
            ..attrs
        };
        self.insert_child(dir_ino, &name, attrs, content, size)?;
        Ok(())
    }

    /// Create a hard link at `link` to the inode at `target`, bumping its
    /// link count.
    pub fn hard_link(&mut self, link: &Path, target: &Path) -> SiloResult<()> {
        let target_ino = self.lookup(target)?.ok_or_else(|| {
            SiloError::NotFound(format!("hard link target {}", target.display()))
        })?;
        if self.record(target_ino)?.is_dir() {
            return Err(SiloError::InvalidArgument(format!(
                "hard link to directory {}",
                target.display()
            )));
        }

        let comps = normalize_components(link);
        if comps.is_empty() {
            return Err(SiloError::InvalidArgument(
                "cannot hard link over root".into(),
            ));
        }
        self.ensure_parent_dirs(&comps)?;
        let (dir_ino, name) = self.resolve_parent(&comps)?;
        if self.child_of(dir_ino, &name)?.is_some() {
            self.remove_entry(dir_ino, &name)?;
        }
        {
            let rec = self.record_mut(dir_ino)?;
            let Content::Dir { children, .. } = &mut rec.content else {
                return Err(SiloError::Internal("parent is not a directory".into()));
            };
            children.insert(name, target_ino);
        }
        self.record_mut(target_ino)?.links += 1;
        Ok(())
    }

    /// Remove the entry at `path`. Directories are removed recursively.
    pub fn unlink(&mut self, path: &Path) -> SiloResult<()> {
        let comps = normalize_components(path);
        if comps.is_empty() {
            return Err(SiloError::InvalidArgument("cannot unlink root".into()));
        }
        let (dir_ino, name) = self.resolve_parent(&comps)?;
        if self.child_of(dir_ino, &name)?.is_none() {
            return Err(SiloError::NotFound(format!("unlink {}", path.display())));
        }
        self.remove_entry(dir_ino, &name)
    }

    /// Opaque-whiteout semantics: remove everything under `path`, leaving
    /// an empty directory (created if missing, since later entries of the
    /// same layer may repopulate it).
    pub fn clear_directory(&mut self, path: &Path) -> SiloResult<()> {
        let comps = normalize_components(path);
        let dir_ino = if comps.is_empty() {
            ROOT_INO
        } else {
            match self.lookup_components(&comps) {
                Ok(Some(ino)) if self.record(ino)?.is_dir() => ino,
                Ok(Some(_)) => {
                    return Err(SiloError::InvalidArgument(format!(
                        "opaque whiteout target {} is not a directory",
                        path.display()
                    )))
                }
                // Nothing from lower layers: materialize the directory,
                // since later entries of this layer may populate it.
                Ok(None) | Err(SiloError::NotFound(_)) => {
                    self.create::<&[u8]>(path, Attrs::new((S_IFDIR | 0o755) as u32), None)?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        };

        let names: Vec<String> = {
            let rec = self.record(dir_ino)?;
            let Content::Dir { children, .. } = &rec.content else {
                return Err(SiloError::Internal("expected directory".into()));
            };
            children.keys().cloned().collect()
        };
        for name in names {
            // Root keeps its lost+found: it belongs to the image, not the
            // layer stack.
            if dir_ino == ROOT_INO && name == LOST_FOUND_NAME {
                continue;
            }
            self.remove_entry(dir_ino, &name)?;
        }
        Ok(())
    }

    /// Replace-on-overwrite xattr update for an existing path.
    pub fn set_xattrs(&mut self, path: &Path, pairs: Vec<(String, Vec<u8>)>) -> SiloResult<()> {
        let ino = self
            .lookup(path)?
            .ok_or_else(|| SiloError::NotFound(format!("set xattrs on {}", path.display())))?;
        let rec = self.record_mut(ino)?;
        for (name, value) in pairs {
            match rec.xattrs.iter_mut().find(|(n, _)| *n == name) {
                Some(slot) => slot.1 = value,
                None => rec.xattrs.push((name, value)),
            }
        }
        Ok(())
    }

    /// True when `path` resolves to an inode.
    pub fn exists(&self, path: &Path) -> SiloResult<bool> {
        Ok(self.lookup(path)?.is_some())
    }

    /// Create any missing intermediate directories for `comps`. A layer
    /// may replace a file with a directory implicitly (an entry under a
    /// path that used to be a file); the obstacle is removed.
    pub(super) fn ensure_parent_dirs(&mut self, comps: &[String]) -> SiloResult<()> {
        if comps.len() <= 1 {
            return Ok(());
        }
        for depth in 1..comps.len() {
            let prefix = &comps[..depth];
            let obstacle = match self.lookup_components(prefix)? {
                // Symlinks that resolve to a directory stay (usrmerge
                // layouts route entries through /bin -> usr/bin).
                Some(ino) => match &self.record(ino)?.content {
                    Content::Dir { .. } => false,
                    Content::Symlink { .. } => self.walk_dir(prefix).is_err(),
                    _ => true,
                },
                None => true,
            };
            if obstacle {
                let path: PathBuf = prefix.iter().collect();
                self.create::<&[u8]>(&path, Attrs::new((S_IFDIR | 0o755) as u32), None)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Path resolution
    // ------------------------------------------------------------------

    fn record(&self, ino: u32) -> SiloResult<&InodeRecord> {
        self.inodes
            .get(&ino)
            .ok_or_else(|| SiloError::Internal(format!("dangling inode {}", ino)))
    }

    fn record_mut(&mut self, ino: u32) -> SiloResult<&mut InodeRecord> {
        self.inodes
            .get_mut(&ino)
            .ok_or_else(|| SiloError::Internal(format!("dangling inode {}", ino)))
    }

    fn child_of(&self, dir_ino: u32, name: &str) -> SiloResult<Option<u32>> {
        let rec = self.record(dir_ino)?;
        let Content::Dir { children, .. } = &rec.content else {
            return Err(SiloError::Internal("parent is not a directory".into()));
        };
        Ok(children.get(name).copied())
    }

    /// Walk `comps` as a directory path, following symlinks. The visited
    /// set rejects symlink cycles, including the replace-root recursion
    /// attack, with an unsupported-filetype error.
    fn walk_dir(&self, comps: &[String]) -> SiloResult<u32> {
        let mut visited: HashSet<u32> = HashSet::new();
        let mut stack: Vec<String> = comps.iter().rev().cloned().collect();
        let mut current = ROOT_INO;
        while let Some(name) = stack.pop() {
            if name == "." || name.is_empty() {
                continue;
            }
            if name == ".." {
                let rec = self.record(current)?;
                let Content::Dir { parent, .. } = &rec.content else {
                    return Err(SiloError::Internal("walked into a non-directory".into()));
                };
                current = *parent;
                continue;
            }
            let child = self.child_of(current, &name)?.ok_or_else(|| {
                SiloError::NotFound(format!("path component {}", name))
            })?;
            match &self.record(child)?.content {
                Content::Dir { .. } => current = child,
                Content::Symlink { target, .. } => {
                    if !visited.insert(child) {
                        return Err(SiloError::UnsupportedFiletype(format!(
                            "symlink cycle through {}",
                            name
                        )));
                    }
                    let target_path = PathBuf::from(
                        String::from_utf8_lossy(target).into_owned(),
                    );
                    if target_path.is_absolute() {
                        current = ROOT_INO;
                    }
                    for comp in target_path
                        .components()
                        .rev()
                        .filter_map(raw_component)
                    {
                        stack.push(comp);
                    }
                }
                _ => {
                    return Err(SiloError::NotFound(format!(
                        "path component {} is not a directory",
                        name
                    )))
                }
            }
        }
        Ok(current)
    }

    /// Resolve all but the final component; returns the parent directory
    /// inode and the final name.
    fn resolve_parent(&self, comps: &[String]) -> SiloResult<(u32, String)> {
        let (name, parents) = comps
            .split_last()
            .ok_or_else(|| SiloError::InvalidArgument("empty path".into()))?;
        Ok((self.walk_dir(parents)?, name.clone()))
    }

    fn lookup_components(&self, comps: &[String]) -> SiloResult<Option<u32>> {
        if comps.is_empty() {
            return Ok(Some(ROOT_INO));
        }
        let (dir_ino, name) = self.resolve_parent(comps)?;
        self.child_of(dir_ino, &name)
    }

    /// Resolve a path to its inode without following a final symlink.
    /// Returns `Ok(None)` when a component is missing.
    fn lookup(&self, path: &Path) -> SiloResult<Option<u32>> {
        let comps = normalize_components(path);
        match self.lookup_components(&comps) {
            Ok(found) => Ok(found),
            Err(SiloError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Mutation helpers
    // ------------------------------------------------------------------

    fn insert_child(
        &mut self,
        dir_ino: u32,
        name: &str,
        attrs: Attrs,
        content: Content,
        size: u64,
    ) -> SiloResult<u32> {
        let ino = self.inode_numbers.allocate()?;
        let rdev = attrs.rdev.unwrap_or((0, 0));
        self.inodes.insert(
            ino,
            InodeRecord {
                mode: attrs.mode as u16,
                uid: attrs.uid,
                gid: attrs.gid,
                links: 1,
                size,
                mtime: attrs.mtime.clamp(0, u32::MAX as i64) as u32,
                rdev,
                xattrs: attrs.xattrs,
                content,
            },
        );
        let rec = self.record_mut(dir_ino)?;
        let Content::Dir { children, .. } = &mut rec.content else {
            return Err(SiloError::Internal("parent is not a directory".into()));
        };
        children.insert(name.to_string(), ino);
        Ok(ino)
    }

    /// Detach `name` from `dir_ino` and release whatever becomes
    /// unreferenced, recursively for directories.
    fn remove_entry(&mut self, dir_ino: u32, name: &str) -> SiloResult<()> {
        let child = {
            let rec = self.record_mut(dir_ino)?;
            let Content::Dir { children, .. } = &mut rec.content else {
                return Err(SiloError::Internal("parent is not a directory".into()));
            };
            children.remove(name).ok_or_else(|| {
                SiloError::NotFound(format!("no entry named {}", name))
            })?
        };

        let mut queue = vec![child];
        while let Some(ino) = queue.pop() {
            let freeable = match self.inodes.get_mut(&ino) {
                None => continue,
                Some(rec) => {
                    if let Content::Dir { children, .. } = &mut rec.content {
                        queue.extend(std::mem::take(children).into_values());
                        true
                    } else {
                        rec.links = rec.links.saturating_sub(1);
                        rec.links == 0
                    }
                }
            };
            if freeable {
                self.free_inode(ino);
            }
        }
        Ok(())
    }

    fn free_inode(&mut self, ino: u32) {
        if let Some(rec) = self.inodes.remove(&ino) {
            for extent in rec.extents() {
                self.blocks.release(extent.start, extent.len);
            }
            self.inode_numbers.release(ino);
        }
    }

    // ------------------------------------------------------------------
    // Data plumbing
    // ------------------------------------------------------------------

    /// Stream file payload to freshly allocated blocks, growing the
    /// extent list as runs come back from the allocator.
    fn write_stream<R: Read>(&mut self, mut data: R) -> SiloResult<(Vec<Extent>, u64)> {
        const CHUNK: usize = 256 * BLOCK_SIZE as usize; // 1 MiB
        let mut extents: Vec<Extent> = Vec::new();
        let mut size = 0u64;
        let mut logical = 0u32;
        let mut buf = vec![0u8; CHUNK];
        loop {
            let n = read_full(&mut data, &mut buf)
                .map_err(|e| SiloError::Io(format!("failed to read data stream: {}", e)))?;
            if n == 0 {
                break;
            }
            size += n as u64;
            let padded = n.next_multiple_of(BLOCK_SIZE as usize);
            buf[n..padded].fill(0);

            let mut remaining = (padded / BLOCK_SIZE as usize) as u32;
            let mut offset = 0usize;
            while remaining > 0 {
                let (start, len) = self.blocks.allocate(remaining.min(MAX_EXTENT_LEN))?;
                let bytes = len as usize * BLOCK_SIZE as usize;
                self.file
                    .write_at(
                        &buf[offset..offset + bytes],
                        start as u64 * BLOCK_SIZE as u64,
                    )
                    .map_err(|e| SiloError::Io(format!("failed to write image data: {}", e)))?;
                push_extent(&mut extents, logical, start, len);
                logical += len;
                offset += bytes;
                remaining -= len;
            }
            if n < CHUNK {
                break;
            }
        }
        Ok((extents, size))
    }

    /// Write already-materialized metadata bytes (directory blocks, long
    /// symlink targets, extent leaves) to allocated blocks.
    fn write_metadata_blocks(&mut self, data: &[u8]) -> SiloResult<Vec<Extent>> {
        debug_assert_eq!(data.len() % BLOCK_SIZE as usize, 0);
        let mut extents = Vec::new();
        let mut remaining = (data.len() / BLOCK_SIZE as usize) as u32;
        let mut logical = 0u32;
        let mut offset = 0usize;
        while remaining > 0 {
            let (start, len) = self.blocks.allocate(remaining.min(MAX_EXTENT_LEN))?;
            let bytes = len as usize * BLOCK_SIZE as usize;
            self.file
                .write_at(
                    &data[offset..offset + bytes],
                    start as u64 * BLOCK_SIZE as u64,
                )
                .map_err(|e| SiloError::Io(format!("failed to write image metadata: {}", e)))?;
            push_extent(&mut extents, logical, start, len);
            logical += len;
            offset += bytes;
            remaining -= len;
        }
        Ok(extents)
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    /// Finalize directories, inode tables, bitmaps, group descriptors,
    /// and superblocks, then close the image. The formatter cannot be
    /// used again.
    pub fn close(mut self) -> SiloResult<()> {
        // Directory data blocks.
        let dir_inos: Vec<u32> = self
            .inodes
            .iter()
            .filter(|(_, rec)| rec.is_dir())
            .map(|(ino, _)| *ino)
            .collect();
        for ino in &dir_inos {
            let data = self.build_dirent_blocks(*ino)?;
            let extents = self.write_metadata_blocks(&data)?;
            let size = data.len() as u64;
            self.record_mut(*ino)?.size = size;
            self.dir_extents.insert(*ino, extents);
        }

        // Final link counts.
        let mut links: BTreeMap<u32, u16> = BTreeMap::new();
        for (ino, rec) in &self.inodes {
            match &rec.content {
                Content::Dir { children, .. } => {
                    let subdirs = children
                        .values()
                        .filter(|c| self.inodes.get(c).map(|r| r.is_dir()).unwrap_or(false))
                        .count() as u16;
                    links.insert(*ino, 2 + subdirs);
                }
                _ => {
                    links.insert(*ino, rec.links);
                }
            }
        }

        // Extent roots (allocating leaf blocks where trees spill) and
        // xattr overflow blocks.
        let inos: Vec<u32> = self.inodes.keys().copied().collect();
        let mut roots: BTreeMap<u32, (ExtentRoot, u32)> = BTreeMap::new();
        let mut acl_blocks: BTreeMap<u32, u32> = BTreeMap::new();
        for ino in &inos {
            let extents = match self.dir_extents.get(ino) {
                Some(extents) => extents.clone(),
                None => self.record(*ino)?.extents().to_vec(),
            };
            let uses_extents = {
                let rec = self.record(*ino)?;
                matches!(rec.content, Content::Dir { .. } | Content::File { .. })
                    || !extents.is_empty()
            };
            if uses_extents {
                let (root, extra) = self.build_extent_root(&extents)?;
                roots.insert(*ino, (root, extra));
            }

            let xattrs = self.record(*ino)?.xattrs.clone();
            if !xattrs.is_empty() {
                let inline_capacity = INLINE_XATTR_SIZE - 4;
                if xattr_region_size(&xattrs) > inline_capacity {
                    let block = self.blocks.allocate_one()?;
                    let mut buf = vec![0u8; BLOCK_SIZE as usize];
                    layout::put_u32(&mut buf, 0, layout::XATTR_MAGIC);
                    layout::put_u32(&mut buf, 4, 1); // refcount
                    layout::put_u32(&mut buf, 8, 1); // blocks
                    if xattr_region_size(&xattrs) > BLOCK_SIZE as usize - 32 {
                        return Err(SiloError::Unsupported(format!(
                            "xattr set too large for inode {}",
                            ino
                        )));
                    }
                    layout::encode_xattrs(&mut buf[32..], &xattrs, 32);
                    self.file
                        .write_at(&buf, block as u64 * BLOCK_SIZE as u64)
                        .map_err(|e| {
                            SiloError::Io(format!("failed to write xattr block: {}", e))
                        })?;
                    acl_blocks.insert(*ino, block);
                }
            }
        }

        // Inode table.
        for ino in &inos {
            let link_count = links.get(ino).copied().unwrap_or(1);
            let root = roots.get(ino);
            let acl = acl_blocks.get(ino).copied();
            let buf = self.encode_inode(*ino, link_count, root, acl)?;
            self.file
                .write_at(&buf, self.geometry.inode_offset(*ino))
                .map_err(|e| SiloError::Io(format!("failed to write inode table: {}", e)))?;
        }

        // Bitmaps, group descriptors, superblocks.
        self.write_filesystem_metadata()?;

        self.file
            .sync_all()
            .map_err(|e| SiloError::Io(format!("failed to sync image: {}", e)))?;
        debug!(path = %self.path.display(), "closed ext4 image");
        Ok(())
    }

    fn build_extent_root(&mut self, extents: &[Extent]) -> SiloResult<(ExtentRoot, u32)> {
        if extents.len() <= ROOT_EXTENT_SLOTS {
            return Ok((ExtentRoot::Leaf(extents.to_vec()), 0));
        }
        let chunks: Vec<&[Extent]> = extents.chunks(BLOCK_EXTENT_SLOTS).collect();
        if chunks.len() > ROOT_EXTENT_SLOTS {
            return Err(SiloError::Io(
                "file too fragmented for a two-level extent tree".into(),
            ));
        }
        let mut index = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let block = self.blocks.allocate_one()?;
            let mut buf = vec![0u8; BLOCK_SIZE as usize];
            encode_extent_header(
                &mut buf,
                chunk.len() as u16,
                BLOCK_EXTENT_SLOTS as u16,
                0,
            );
            for (i, extent) in chunk.iter().enumerate() {
                extent.encode(&mut buf[12 + i * 12..24 + i * 12]);
            }
            self.file
                .write_at(&buf, block as u64 * BLOCK_SIZE as u64)
                .map_err(|e| SiloError::Io(format!("failed to write extent leaf: {}", e)))?;
            index.push((chunk[0].logical, block));
        }
        let extra = index.len() as u32;
        Ok((ExtentRoot::Index(index), extra))
    }

    fn build_dirent_blocks(&self, ino: u32) -> SiloResult<Vec<u8>> {
        let rec = self.record(ino)?;
        let Content::Dir { parent, children } = &rec.content else {
            return Err(SiloError::Internal("expected directory".into()));
        };

        let mut entries: Vec<(String, u32, u8)> = Vec::with_capacity(children.len() + 2);
        entries.push((".".into(), ino, FileKind::Directory.dirent_code()));
        entries.push(("..".into(), *parent, FileKind::Directory.dirent_code()));
        for (name, child) in children {
            let code = self.record(*child)?.kind()?.dirent_code();
            entries.push((name.clone(), *child, code));
        }

        let block = BLOCK_SIZE as usize;
        let mut data = vec![0u8; block];
        let mut block_start = 0usize;
        let mut cursor = 0usize;
        let mut last_entry: Option<usize> = None;
        for (name, child, code) in entries {
            if name.len() > 255 {
                return Err(SiloError::InvalidArgument(format!(
                    "name too long: {}",
                    name
                )));
            }
            let need = (8 + name.len()).next_multiple_of(4);
            if cursor + need > block_start + block {
                // Seal this block: stretch the previous entry to its end.
                if let Some(at) = last_entry {
                    let rec_len = (block_start + block - at) as u16;
                    layout::put_u16(&mut data, at + 4, rec_len);
                }
                block_start += block;
                cursor = block_start;
                data.resize(block_start + block, 0);
            }
            layout::put_u32(&mut data, cursor, child);
            layout::put_u16(&mut data, cursor + 4, need as u16);
            data[cursor + 6] = name.len() as u8;
            data[cursor + 7] = code;
            data[cursor + 8..cursor + 8 + name.len()].copy_from_slice(name.as_bytes());
            last_entry = Some(cursor);
            cursor += need;
        }
        if let Some(at) = last_entry {
            let rec_len = (block_start + block - at) as u16;
            layout::put_u16(&mut data, at + 4, rec_len);
        }
        Ok(data)
    }

    fn encode_inode(
        &self,
        ino: u32,
        links: u16,
        root: Option<&(ExtentRoot, u32)>,
        acl_block: Option<u32>,
    ) -> SiloResult<[u8; 256]> {
        let rec = self.record(ino)?;
        let mut b = [0u8; 256];
        layout::put_u16(&mut b, 0, rec.mode);
        layout::put_u16(&mut b, 2, rec.uid as u16);
        layout::put_u32(&mut b, 4, rec.size as u32);
        layout::put_u32(&mut b, 8, rec.mtime); // atime
        layout::put_u32(&mut b, 12, rec.mtime); // ctime
        layout::put_u32(&mut b, 16, rec.mtime);
        layout::put_u16(&mut b, 24, rec.gid as u16);
        layout::put_u16(&mut b, 26, links);

        // Sector count: data + extent leaves + xattr block.
        let data_blocks: u32 = match self.dir_extents.get(&ino) {
            Some(extents) => extents.iter().map(|e| e.len).sum(),
            None => rec.extents().iter().map(|e| e.len).sum(),
        };
        let extra_blocks = root.map(|(_, extra)| *extra).unwrap_or(0);
        let acl_blocks = acl_block.map(|_| 1).unwrap_or(0);
        let sectors = (data_blocks + extra_blocks + acl_blocks) as u64
            * (BLOCK_SIZE as u64 / 512);
        layout::put_u32(&mut b, 28, sectors as u32);

        let mut flags = 0u32;
        if root.is_some() {
            flags |= EXT4_EXTENTS_FL;
        }
        layout::put_u32(&mut b, 32, flags);

        // i_block: extent tree root, inline symlink target, or device.
        match (&rec.content, root) {
            (_, Some((ExtentRoot::Leaf(extents), _))) => {
                encode_extent_header(
                    &mut b[40..100],
                    extents.len() as u16,
                    ROOT_EXTENT_SLOTS as u16,
                    0,
                );
                for (i, extent) in extents.iter().enumerate() {
                    extent.encode(&mut b[52 + i * 12..64 + i * 12]);
                }
            }
            (_, Some((ExtentRoot::Index(index), _))) => {
                encode_extent_header(
                    &mut b[40..100],
                    index.len() as u16,
                    ROOT_EXTENT_SLOTS as u16,
                    1,
                );
                for (i, (logical, block)) in index.iter().enumerate() {
                    encode_extent_index(&mut b[52 + i * 12..64 + i * 12], *logical, *block);
                }
            }
            (Content::Symlink { target, .. }, None) => {
                b[40..40 + target.len()].copy_from_slice(target);
            }
            (Content::Device, None) => {
                let (w0, w1) = encode_rdev(rec.rdev.0, rec.rdev.1);
                layout::put_u32(&mut b, 40, w0);
                layout::put_u32(&mut b, 44, w1);
            }
            _ => {}
        }

        if let Some(block) = acl_block {
            layout::put_u32(&mut b, 104, block);
        }
        layout::put_u32(&mut b, 108, (rec.size >> 32) as u32);
        layout::put_u16(&mut b, 120, (rec.uid >> 16) as u16);
        layout::put_u16(&mut b, 122, (rec.gid >> 16) as u16);
        layout::put_u16(&mut b, 128, layout::EXTRA_ISIZE);

        // Inline xattrs when they fit; spilled sets live in the acl block.
        if !rec.xattrs.is_empty() && acl_block.is_none() {
            layout::put_u32(&mut b, 160, layout::XATTR_MAGIC);
            layout::encode_xattrs(&mut b[164..], &rec.xattrs, 0);
        }
        Ok(b)
    }

    fn write_filesystem_metadata(&mut self) -> SiloResult<()> {
        let geometry = self.geometry;
        let expected_free_blocks = self.blocks.free_count();
        // Inodes 1..=10 are reserved (root sits inside that range); live
        // records above 10 consume additional slots.
        let live_above_reserved = self.inodes.keys().filter(|&&i| i > 10).count() as u32;
        let expected_free_inodes = geometry.inode_count() - 10 - live_above_reserved;

        // Per-group inode bitmaps and descriptor counts.
        let mut descriptors = Vec::with_capacity(geometry.group_count as usize);
        let mut free_blocks_total = 0u32;
        let mut free_inodes_total = 0u32;
        for group in 0..geometry.group_count {
            // Block bitmap straight from the allocator.
            let block_bitmap = self.blocks.group_bitmap_block(group);
            self.file
                .write_at(
                    &block_bitmap,
                    geometry.block_bitmap(group) as u64 * BLOCK_SIZE as u64,
                )
                .map_err(|e| SiloError::Io(format!("failed to write block bitmap: {}", e)))?;

            // Inode bitmap: reserved inodes, live records, padding.
            let mut inode_bitmap = [0xFFu8; BLOCK_SIZE as usize];
            let first = group * geometry.inodes_per_group + 1;
            let mut group_free_inodes = 0u32;
            let mut group_dirs = 0u16;
            for slot in 0..geometry.inodes_per_group {
                let ino = first + slot;
                let reserved = ino <= 10;
                let record = self.inodes.get(&ino);
                let used = reserved || record.is_some();
                let byte = (slot / 8) as usize;
                let bit = 1u8 << (slot % 8);
                if used {
                    inode_bitmap[byte] |= bit;
                    if record.map(|r| r.is_dir()).unwrap_or(false) {
                        group_dirs += 1;
                    }
                } else {
                    inode_bitmap[byte] &= !bit;
                    group_free_inodes += 1;
                }
            }
            self.file
                .write_at(
                    &inode_bitmap,
                    geometry.inode_bitmap(group) as u64 * BLOCK_SIZE as u64,
                )
                .map_err(|e| SiloError::Io(format!("failed to write inode bitmap: {}", e)))?;

            let group_free_blocks = self.blocks.group_free_blocks(group);
            free_blocks_total += group_free_blocks;
            free_inodes_total += group_free_inodes;
            descriptors.push(GroupDesc {
                block_bitmap: geometry.block_bitmap(group),
                inode_bitmap: geometry.inode_bitmap(group),
                inode_table: geometry.inode_table(group),
                free_blocks: group_free_blocks as u16,
                free_inodes: group_free_inodes as u16,
                used_dirs: group_dirs,
            });
        }

        // The counters the superblock advertises must equal what the
        // bitmaps actually encode.
        if free_blocks_total != expected_free_blocks {
            return Err(SiloError::Format(format!(
                "free block accounting diverged: bitmap {} vs allocator {}",
                free_blocks_total, expected_free_blocks
            )));
        }
        if free_inodes_total != expected_free_inodes {
            return Err(SiloError::Format(format!(
                "free inode accounting diverged: bitmap {} vs table {}",
                free_inodes_total, expected_free_inodes
            )));
        }

        let mut gdt = vec![0u8; (geometry.gdt_blocks * BLOCK_SIZE) as usize];
        for (i, desc) in descriptors.iter().enumerate() {
            gdt[i * 32..i * 32 + 32].copy_from_slice(&desc.encode());
        }

        let superblock = Superblock {
            inodes_count: geometry.inode_count(),
            blocks_count: geometry.block_count,
            free_blocks: free_blocks_total,
            free_inodes: free_inodes_total,
            blocks_per_group: BLOCKS_PER_GROUP,
            inodes_per_group: geometry.inodes_per_group,
            wtime: now_secs(),
            uuid: self.uuid,
            volume_name: self.volume_name,
        };

        // Primary superblock + GDT, then sparse_super backups.
        self.file
            .write_at(&superblock.encode(0), SUPERBLOCK_OFFSET)
            .map_err(|e| SiloError::Io(format!("failed to write superblock: {}", e)))?;
        self.file
            .write_at(&gdt, BLOCK_SIZE as u64)
            .map_err(|e| SiloError::Io(format!("failed to write group descriptors: {}", e)))?;
        for group in 1..geometry.group_count {
            if !group_has_super(group) {
                continue;
            }
            let base = geometry.group_start(group) as u64 * BLOCK_SIZE as u64;
            self.file
                .write_at(&superblock.encode(group as u16), base)
                .map_err(|e| {
                    SiloError::Io(format!("failed to write backup superblock: {}", e))
                })?;
            self.file
                .write_at(&gdt, base + BLOCK_SIZE as u64)
                .map_err(|e| {
                    SiloError::Io(format!("failed to write backup descriptors: {}", e))
                })?;
        }
        Ok(())
    }
}

fn raw_component(comp: Component<'_>) -> Option<String> {
    match comp {
        Component::Normal(c) => Some(c.to_string_lossy().into_owned()),
        Component::ParentDir => Some("..".to_string()),
        _ => None,
    }
}

/// Lexically normalize a path into components, collapsing `.`, empty
/// segments, and `..` (which never escapes the root).
pub(super) fn normalize_components(path: &Path) -> Vec<String> {
    let mut comps: Vec<String> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                comps.pop();
            }
            Component::Normal(c) => comps.push(c.to_string_lossy().into_owned()),
        }
    }
    comps
}

fn push_extent(extents: &mut Vec<Extent>, logical: u32, start: u32, len: u32) {
    if let Some(last) = extents.last_mut() {
        if last.start + last.len == start
            && last.logical + last.len == logical
            && last.len + len <= MAX_EXTENT_LEN
        {
            last.len += len;
            return;
        }
    }
    extents.push(Extent {
        logical,
        start,
        len,
    });
}

/// Read until `buf` is full or the stream ends; returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn now_secs() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
