//! Path-safe archive extraction.
//!
//! Materializes tar or zip archives under a root directory without ever
//! following a symlink outside it. Parent directories are resolved
//! component-by-component from a root file descriptor with
//! `openat(O_NOFOLLOW | O_DIRECTORY)`; a symlinked intermediate, a `..`
//! escape, or an unsupported member type rejects the member (collected in
//! the returned list) rather than failing the extraction. I/O errors are
//! fatal.

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use filetime::FileTime;
use silo_shared::{SiloError, SiloResult};
use tracing::{debug, trace, warn};

use crate::archive::{sniff, ArchiveFlavor, Compression, LayerSource};

/// Extract `archive` (tar, optionally gzip/zstd compressed, or zip) into
/// `root`, returning the member paths that were rejected.
///
/// An archive with zero entries is an error.
pub fn extract(archive: &Path, root: &Path) -> SiloResult<Vec<PathBuf>> {
    std::fs::create_dir_all(root)
        .map_err(|e| SiloError::Io(format!("failed to create {}: {}", root.display(), e)))?;
    let mut extractor = Extractor::open(root)?;

    let entries = match sniff(archive)? {
        ArchiveFlavor::Zip => extractor.run_zip(archive)?,
        ArchiveFlavor::Tar(compression) => extractor.run_tar(archive, compression)?,
    };
    if entries == 0 {
        return Err(SiloError::InvalidArgument("empty archive".into()));
    }
    debug!(
        archive = %archive.display(),
        root = %root.display(),
        entries,
        rejected = extractor.rejected.len(),
        "extraction complete"
    );
    Ok(extractor.rejected)
}

/// What one archive member is.
enum MemberKind {
    File,
    Directory,
    Symlink(PathBuf),
    /// Devices, fifos, sockets, hardlinks: outside the extraction
    /// contract, always rejected.
    Unsupported(&'static str),
}

struct MemberMeta {
    kind: MemberKind,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: i64,
    xattrs: Vec<(String, Vec<u8>)>,
}

struct Extractor {
    root: OwnedFd,
    rejected: Vec<PathBuf>,
    /// chown only makes sense (and succeeds) as root.
    apply_owner: bool,
}

impl Extractor {
    fn open(root: &Path) -> SiloResult<Extractor> {
        let c_root = to_cstring(root.as_os_str().as_bytes())?;
        let fd = unsafe {
            libc::open(
                c_root.as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(SiloError::Io(format!(
                "failed to open root {}: {}",
                root.display(),
                io::Error::last_os_error()
            )));
        }
        Ok(Extractor {
            root: unsafe { OwnedFd::from_raw_fd(fd) },
            rejected: Vec::new(),
            apply_owner: unsafe { libc::geteuid() } == 0,
        })
    }

    fn run_tar(&mut self, archive: &Path, compression: Compression) -> SiloResult<usize> {
        let source = LayerSource::open(archive, compression)?;
        let mut tar = tar::Archive::new(source.reader()?);
        let mut entries = 0usize;
        for entry in tar
            .entries()
            .map_err(|e| SiloError::Format(format!("tar read error: {}", e)))?
        {
            let mut entry =
                entry.map_err(|e| SiloError::Format(format!("tar read error: {}", e)))?;
            let raw_path = entry
                .path()
                .map_err(|e| SiloError::Format(format!("bad entry path: {}", e)))?
                .into_owned();

            use tar::EntryType;
            let entry_type = entry.header().entry_type();
            let kind = match entry_type {
                EntryType::Regular | EntryType::GNUSparse | EntryType::Continuous => {
                    MemberKind::File
                }
                EntryType::Directory => MemberKind::Directory,
                EntryType::Symlink => {
                    let target = entry
                        .link_name()
                        .map_err(|e| SiloError::Format(format!("bad link name: {}", e)))?
                        .ok_or_else(|| {
                            SiloError::Format(format!(
                                "symlink {} without target",
                                raw_path.display()
                            ))
                        })?
                        .into_owned();
                    MemberKind::Symlink(target)
                }
                EntryType::XGlobalHeader | EntryType::XHeader => continue,
                EntryType::Link => MemberKind::Unsupported("hardlink"),
                EntryType::Char | EntryType::Block => MemberKind::Unsupported("device"),
                EntryType::Fifo => MemberKind::Unsupported("fifo"),
                _ => MemberKind::Unsupported("unknown"),
            };

            let meta = MemberMeta {
                kind,
                mode: entry.header().mode().unwrap_or(0o644),
                uid: entry.header().uid().unwrap_or(0) as u32,
                gid: entry.header().gid().unwrap_or(0) as u32,
                mtime: entry.header().mtime().unwrap_or(0) as i64,
                xattrs: pax_xattrs(&mut entry)?,
            };
            entries += 1;
            self.apply(&raw_path, meta, &mut entry)?;
        }
        Ok(entries)
    }

    fn run_zip(&mut self, archive: &Path) -> SiloResult<usize> {
        let file = File::open(archive)
            .map_err(|e| SiloError::Io(format!("failed to open {}: {}", archive.display(), e)))?;
        let mut zip = zip::ZipArchive::new(file)
            .map_err(|e| SiloError::Format(format!("bad zip archive: {}", e)))?;
        let count = zip.len();
        for index in 0..count {
            let mut member = zip
                .by_index(index)
                .map_err(|e| SiloError::Format(format!("bad zip member: {}", e)))?;
            let raw_path = PathBuf::from(member.name());
            let mode = member.unix_mode().unwrap_or(0o644);
            let kind = if member.is_dir() {
                MemberKind::Directory
            } else if mode & (libc::S_IFMT as u32) == libc::S_IFLNK as u32 {
                let mut target = Vec::new();
                member.read_to_end(&mut target).map_err(|e| {
                    SiloError::Io(format!(
                        "failed to read data for {}: {}",
                        raw_path.display(),
                        e
                    ))
                })?;
                MemberKind::Symlink(PathBuf::from(
                    String::from_utf8_lossy(&target).into_owned(),
                ))
            } else {
                MemberKind::File
            };
            let meta = MemberMeta {
                kind,
                mode: mode & 0o7777,
                uid: 0,
                gid: 0,
                mtime: 0,
                xattrs: Vec::new(),
            };
            self.apply(&raw_path, meta, &mut member)?;
        }
        Ok(count)
    }

    /// Materialize one member. Rejections are recorded, not returned as
    /// errors; only host I/O failures abort.
    fn apply<R: Read>(
        &mut self,
        raw_path: &Path,
        meta: MemberMeta,
        data: &mut R,
    ) -> SiloResult<()> {
        let components: Vec<Component<'_>> = raw_path.components().collect();
        let Some((last, parents)) = components.split_last() else {
            return Ok(()); // "." or empty
        };
        let name = match last {
            Component::Normal(name) => name.to_os_string(),
            // A member resolving to the root itself or ending in "..":
            // nothing safe to create.
            _ => {
                if matches!(last, Component::ParentDir) {
                    self.reject(raw_path, "ends outside root");
                }
                return Ok(());
            }
        };

        // Walk the parent chain from the root fd. `..` pops; popping past
        // the root or crossing a symlink rejects.
        let mut chain: Vec<OwnedFd> = Vec::new();
        for component in parents {
            match component {
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    if chain.pop().is_none() {
                        self.reject(raw_path, "escapes root");
                        return Ok(());
                    }
                }
                Component::Normal(part) => {
                    let parent = chain
                        .last()
                        .map(|fd| fd.as_raw_fd())
                        .unwrap_or_else(|| self.root.as_raw_fd());
                    match open_dir_nofollow(parent, part.as_bytes()) {
                        Ok(fd) => chain.push(fd),
                        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                            // Entries can precede their parent directory.
                            if let Err(e) = mkdir_at(parent, part.as_bytes(), 0o755) {
                                if e.raw_os_error() != Some(libc::EEXIST) {
                                    return Err(io_fatal(raw_path, e));
                                }
                            }
                            match open_dir_nofollow(parent, part.as_bytes()) {
                                Ok(fd) => chain.push(fd),
                                Err(e) if is_traversal(&e) => {
                                    self.reject(raw_path, "symlinked parent");
                                    return Ok(());
                                }
                                Err(e) => return Err(io_fatal(raw_path, e)),
                            }
                        }
                        Err(e) if is_traversal(&e) => {
                            self.reject(raw_path, "symlinked parent");
                            return Ok(());
                        }
                        Err(e) => return Err(io_fatal(raw_path, e)),
                    }
                }
            }
        }
        let parent = chain
            .last()
            .map(|fd| fd.as_raw_fd())
            .unwrap_or_else(|| self.root.as_raw_fd());

        match meta.kind {
            MemberKind::File => self.write_file(parent, &name, raw_path, &meta, data),
            MemberKind::Directory => self.make_dir(parent, &name, raw_path, &meta),
            MemberKind::Symlink(ref target) => {
                self.make_symlink(parent, &name, raw_path, &meta, target)
            }
            MemberKind::Unsupported(what) => {
                self.reject(raw_path, what);
                Ok(())
            }
        }
    }

    fn write_file<R: Read>(
        &mut self,
        parent: RawFd,
        name: &std::ffi::OsStr,
        raw_path: &Path,
        meta: &MemberMeta,
        data: &mut R,
    ) -> SiloResult<()> {
        // Last entry wins: drop whatever sits there first.
        match unlink_at(parent, name.as_bytes(), false) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
            Err(e) if e.raw_os_error() == Some(libc::EISDIR) => {
                // Replacing a populated directory with a file is outside
                // the contract; an empty one goes quietly.
                match unlink_at(parent, name.as_bytes(), true) {
                    Ok(()) => {}
                    Err(_) => {
                        self.reject(raw_path, "directory in the way");
                        return Ok(());
                    }
                }
            }
            Err(e) => return Err(io_fatal(raw_path, e)),
        }

        let fd = match open_create_excl(parent, name.as_bytes(), meta.mode & 0o777) {
            Ok(fd) => fd,
            Err(e) if is_traversal(&e) => {
                self.reject(raw_path, "symlink in the way");
                return Ok(());
            }
            Err(e) => return Err(io_fatal(raw_path, e)),
        };
        let mut file = File::from(fd);
        io::copy(data, &mut file).map_err(|e| {
            SiloError::Io(format!(
                "failed to read data for {}: {}",
                raw_path.display(),
                e
            ))
        })?;

        if self.apply_owner {
            chown_fd(&file, meta.uid, meta.gid).map_err(|e| io_fatal(raw_path, e))?;
        }
        self.apply_file_xattrs(&file, raw_path, &meta.xattrs)?;
        let mtime = FileTime::from_unix_time(meta.mtime, 0);
        if let Err(e) = filetime::set_file_handle_times(&file, Some(mtime), Some(mtime)) {
            trace!(path = %raw_path.display(), "failed to set times: {}", e);
        }
        Ok(())
    }

    fn make_dir(
        &mut self,
        parent: RawFd,
        name: &std::ffi::OsStr,
        raw_path: &Path,
        meta: &MemberMeta,
    ) -> SiloResult<()> {
        if let Err(e) = mkdir_at(parent, name.as_bytes(), meta.mode & 0o777) {
            if e.raw_os_error() != Some(libc::EEXIST) {
                return Err(io_fatal(raw_path, e));
            }
        }
        let fd = match open_dir_nofollow(parent, name.as_bytes()) {
            Ok(fd) => fd,
            Err(e) if is_traversal(&e) => {
                self.reject(raw_path, "symlink in the way");
                return Ok(());
            }
            Err(e) => return Err(io_fatal(raw_path, e)),
        };
        let dir = File::from(fd);
        if unsafe { libc::fchmod(dir.as_raw_fd(), (meta.mode & 0o7777) as libc::mode_t) } != 0 {
            return Err(io_fatal(raw_path, io::Error::last_os_error()));
        }
        if self.apply_owner {
            chown_fd(&dir, meta.uid, meta.gid).map_err(|e| io_fatal(raw_path, e))?;
        }
        self.apply_file_xattrs(&dir, raw_path, &meta.xattrs)?;
        Ok(())
    }

    fn make_symlink(
        &mut self,
        parent: RawFd,
        name: &std::ffi::OsStr,
        raw_path: &Path,
        meta: &MemberMeta,
        target: &Path,
    ) -> SiloResult<()> {
        match unlink_at(parent, name.as_bytes(), false) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
            Err(e) if e.raw_os_error() == Some(libc::EISDIR) => {
                self.reject(raw_path, "directory in the way");
                return Ok(());
            }
            Err(e) => return Err(io_fatal(raw_path, e)),
        }
        // The target is stored verbatim: it may only exist inside the
        // container namespace, so it is never resolved here.
        let c_target = to_cstring(target.as_os_str().as_bytes())?;
        let c_name = to_cstring(name.as_bytes())?;
        let rc = unsafe {
            libc::symlinkat(c_target.as_ptr(), parent, c_name.as_ptr())
        };
        if rc != 0 {
            return Err(io_fatal(raw_path, io::Error::last_os_error()));
        }
        if self.apply_owner {
            let rc = unsafe {
                libc::fchownat(
                    parent,
                    c_name.as_ptr(),
                    meta.uid,
                    meta.gid,
                    libc::AT_SYMLINK_NOFOLLOW,
                )
            };
            if rc != 0 {
                return Err(io_fatal(raw_path, io::Error::last_os_error()));
            }
        }
        Ok(())
    }

    fn apply_file_xattrs(
        &self,
        file: &File,
        raw_path: &Path,
        xattrs: &[(String, Vec<u8>)],
    ) -> SiloResult<()> {
        use xattr::FileExt as _;
        for (key, value) in xattrs {
            // trusted.* needs privilege; security.* only applies as root.
            if key.starts_with("trusted.") || (!self.apply_owner && key.starts_with("security.")) {
                trace!(path = %raw_path.display(), key, "skipping privileged xattr");
                continue;
            }
            match file.set_xattr(key, value) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) => {
                    warn!(path = %raw_path.display(), key, "filesystem rejects xattrs");
                }
                Err(e) => {
                    return Err(SiloError::Io(format!(
                        "failed to set xattr {} on {}: {}",
                        key,
                        raw_path.display(),
                        e
                    )))
                }
            }
        }
        Ok(())
    }

    fn reject(&mut self, raw_path: &Path, reason: &str) {
        debug!(path = %raw_path.display(), reason, "rejected archive member");
        self.rejected.push(raw_path.to_path_buf());
    }
}

/// ELOOP and ENOTDIR both mean a component was not a plain directory.
fn is_traversal(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ELOOP) | Some(libc::ENOTDIR) | Some(libc::EEXIST)
    )
}

fn open_dir_nofollow(parent: RawFd, name: &[u8]) -> io::Result<OwnedFd> {
    let c_name = to_cstring_io(name)?;
    let fd = unsafe {
        libc::openat(
            parent,
            c_name.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_NOFOLLOW | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn open_create_excl(parent: RawFd, name: &[u8], mode: u32) -> io::Result<OwnedFd> {
    let c_name = to_cstring_io(name)?;
    let fd = unsafe {
        libc::openat(
            parent,
            c_name.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            mode as libc::c_uint,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn mkdir_at(parent: RawFd, name: &[u8], mode: u32) -> io::Result<()> {
    let c_name = to_cstring_io(name)?;
    let rc = unsafe { libc::mkdirat(parent, c_name.as_ptr(), mode as libc::mode_t) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn unlink_at(parent: RawFd, name: &[u8], dir: bool) -> io::Result<()> {
    let c_name = to_cstring_io(name)?;
    let flags = if dir { libc::AT_REMOVEDIR } else { 0 };
    let rc = unsafe { libc::unlinkat(parent, c_name.as_ptr(), flags) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn chown_fd(file: &File, uid: u32, gid: u32) -> io::Result<()> {
    let rc = unsafe { libc::fchown(file.as_raw_fd(), uid, gid) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn to_cstring(bytes: &[u8]) -> SiloResult<CString> {
    CString::new(bytes)
        .map_err(|_| SiloError::InvalidArgument("path contains interior NUL".into()))
}

fn to_cstring_io(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interior NUL in name"))
}

fn io_fatal(path: &Path, e: io::Error) -> SiloError {
    SiloError::Io(format!("{}: {}", path.display(), e))
}

fn pax_xattrs<R: Read>(entry: &mut tar::Entry<'_, R>) -> SiloResult<Vec<(String, Vec<u8>)>> {
    let mut xattrs = Vec::new();
    if let Ok(Some(extensions)) = entry.pax_extensions() {
        for ext in extensions.flatten() {
            if let Ok(key) = ext.key() {
                if let Some(name) = key.strip_prefix("SCHILY.xattr.") {
                    xattrs.push((name.to_string(), ext.value_bytes().to_vec()));
                }
            }
        }
    }
    Ok(xattrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    enum TestEntry<'a> {
        Dir(&'a str),
        File(&'a str, &'a [u8]),
        Symlink(&'a str, &'a str),
        Fifo(&'a str),
        Hardlink(&'a str, &'a str),
    }

    /// Writes `path` straight into the header's name field, bypassing
    /// `Header::set_path`'s `..`-rejection so tests can construct archives
    /// with traversal entries to exercise `extract`'s own rejection of them.
    fn set_path_raw(header: &mut tar::Header, path: &str) {
        let name = &mut header.as_old_mut().name;
        for b in name.iter_mut() {
            *b = 0;
        }
        let bytes = path.as_bytes();
        name[..bytes.len()].copy_from_slice(bytes);
    }

    fn build_tar(entries: &[TestEntry<'_>]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for entry in entries {
            match entry {
                TestEntry::Dir(path) => {
                    let mut header = tar::Header::new_gnu();
                    set_path_raw(&mut header, path);
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_mode(0o755);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
                TestEntry::File(path, content) => {
                    let mut header = tar::Header::new_gnu();
                    set_path_raw(&mut header, path);
                    header.set_mode(0o644);
                    header.set_size(content.len() as u64);
                    header.set_cksum();
                    builder.append(&header, *content).unwrap();
                }
                TestEntry::Symlink(path, target) => {
                    let mut header = tar::Header::new_gnu();
                    set_path_raw(&mut header, path);
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_link_name(target).unwrap();
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
                TestEntry::Fifo(path) => {
                    let mut header = tar::Header::new_gnu();
                    set_path_raw(&mut header, path);
                    header.set_entry_type(tar::EntryType::Fifo);
                    header.set_mode(0o644);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
                TestEntry::Hardlink(path, target) => {
                    let mut header = tar::Header::new_gnu();
                    set_path_raw(&mut header, path);
                    header.set_entry_type(tar::EntryType::Link);
                    header.set_link_name(target).unwrap();
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
            }
        }
        builder.into_inner().unwrap()
    }

    fn write_tar(dir: &Path, entries: &[TestEntry<'_>]) -> PathBuf {
        let path = dir.join("archive.tar");
        std::fs::write(&path, build_tar(entries)).unwrap();
        path
    }

    #[test]
    fn test_extracts_files_dirs_and_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let tar = write_tar(
            tmp.path(),
            &[
                TestEntry::Dir("app"),
                TestEntry::File("app/config.toml", b"key = 1\n"),
                TestEntry::Symlink("app/link", "config.toml"),
            ],
        );
        let root = tmp.path().join("root");
        let rejected = extract(&tar, &root).unwrap();
        assert!(rejected.is_empty());
        assert_eq!(
            std::fs::read(root.join("app/config.toml")).unwrap(),
            b"key = 1\n"
        );
        let link = root.join("app/link");
        assert!(link.is_symlink());
        assert_eq!(
            std::fs::read_link(&link).unwrap(),
            PathBuf::from("config.toml")
        );
    }

    #[test]
    fn test_rejects_parent_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let tar = write_tar(
            tmp.path(),
            &[
                TestEntry::File("ok.txt", b"fine"),
                TestEntry::File("../etc/passwd", b"root::0:0::/:/bin/sh\n"),
            ],
        );
        let root = tmp.path().join("root");
        let rejected = extract(&tar, &root).unwrap();
        assert_eq!(rejected, vec![PathBuf::from("../etc/passwd")]);
        assert!(root.join("ok.txt").exists());
        assert!(!tmp.path().join("etc/passwd").exists());
    }

    #[test]
    fn test_rejects_write_through_symlinked_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tmp.path().join("outside");
        std::fs::create_dir(&outside).unwrap();
        let tar = write_tar(
            tmp.path(),
            &[
                TestEntry::Symlink("evil", outside.to_str().unwrap()),
                TestEntry::File("evil/hack.txt", b"gotcha"),
            ],
        );
        let root = tmp.path().join("root");
        let rejected = extract(&tar, &root).unwrap();
        assert_eq!(rejected, vec![PathBuf::from("evil/hack.txt")]);
        // The symlink itself is fine; nothing crossed it.
        assert!(root.join("evil").is_symlink());
        assert!(!outside.join("hack.txt").exists());
    }

    #[test]
    fn test_last_entry_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let tar = write_tar(
            tmp.path(),
            &[
                TestEntry::File("f.txt", b"first"),
                TestEntry::File("f.txt", b"second"),
            ],
        );
        let root = tmp.path().join("root");
        let rejected = extract(&tar, &root).unwrap();
        assert!(rejected.is_empty());
        assert_eq!(std::fs::read(root.join("f.txt")).unwrap(), b"second");
    }

    #[test]
    fn test_symlink_target_never_resolved() {
        let tmp = tempfile::tempdir().unwrap();
        // Target exists only inside a container namespace.
        let tar = write_tar(
            tmp.path(),
            &[TestEntry::Symlink("sh", "/usr/bin/dash")],
        );
        let root = tmp.path().join("root");
        let rejected = extract(&tar, &root).unwrap();
        assert!(rejected.is_empty());
        assert_eq!(
            std::fs::read_link(root.join("sh")).unwrap(),
            PathBuf::from("/usr/bin/dash")
        );
    }

    #[test]
    fn test_unsupported_types_rejected_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let tar = write_tar(
            tmp.path(),
            &[
                TestEntry::File("keep.txt", b"data"),
                TestEntry::Fifo("pipe"),
                TestEntry::Hardlink("hl", "keep.txt"),
            ],
        );
        let root = tmp.path().join("root");
        let rejected = extract(&tar, &root).unwrap();
        assert_eq!(
            rejected,
            vec![PathBuf::from("pipe"), PathBuf::from("hl")]
        );
        assert!(root.join("keep.txt").exists());
    }

    #[test]
    fn test_empty_archive_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let tar = write_tar(tmp.path(), &[]);
        let root = tmp.path().join("root");
        let err = extract(&tar, &root).unwrap_err();
        assert!(err.to_string().contains("empty archive"));
    }

    #[test]
    fn test_entry_before_parent_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let tar = write_tar(
            tmp.path(),
            &[TestEntry::File("deep/nested/file.txt", b"x")],
        );
        let root = tmp.path().join("root");
        let rejected = extract(&tar, &root).unwrap();
        assert!(rejected.is_empty());
        assert!(root.join("deep/nested/file.txt").exists());
    }

    #[test]
    fn test_zip_extraction() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("assets.zip");
        {
            let file = File::create(&zip_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default()
                .unix_permissions(0o644);
            writer.add_directory("assets/", options).unwrap();
            writer.start_file("assets/logo.txt", options).unwrap();
            writer.write_all(b"logo bytes").unwrap();
            writer.finish().unwrap();
        }
        let root = tmp.path().join("root");
        let rejected = extract(&zip_path, &root).unwrap();
        assert!(rejected.is_empty());
        assert_eq!(
            std::fs::read(root.join("assets/logo.txt")).unwrap(),
            b"logo bytes"
        );
    }
}
