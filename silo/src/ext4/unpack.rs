//! OCI layer ingestion for the EXT4 formatter.
//!
//! Two passes over each tarball: the first totals regular-file payload
//! bytes for progress reporting, the second applies entries in order,
//! honouring overlay whiteouts. Whiteout markers act on the image being
//! built and are never emitted into it.

use std::path::{Path, PathBuf};

use silo_shared::{SiloError, SiloResult};
use tar::{Archive, Entry, EntryType};
use tracing::{debug, trace};

use crate::archive::{Compression, LayerSource};

use super::formatter::{normalize_components, Attrs, Ext4Formatter};
use super::layout::{S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFREG};

/// Opaque-directory whiteout marker.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
/// File whiteout prefix.
const WHITEOUT_PREFIX: &str = ".wh.";

/// Progress events emitted while unpacking a layer.
///
/// All `AddTotalSize` events precede any `AddSize`; summed, the two are
/// equal once the layer is fully applied. One `AddSize` fires per regular
/// file, zero-byte files included.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    AddTotalSize(i64),
    AddSize(i64),
    AddItems(i64),
}

impl Ext4Formatter {
    /// Ingest one OCI layer tarball.
    pub fn unpack(
        &mut self,
        source: &Path,
        compression: Compression,
        mut progress: Option<&mut dyn FnMut(ProgressEvent)>,
    ) -> SiloResult<()> {
        let layer = LayerSource::open(source, compression)?;

        // First pass: total regular payload size, reported before any
        // add-size event.
        let mut total = 0i64;
        {
            let mut archive = Archive::new(layer.reader()?);
            for entry in archive.entries().map_err(tar_err)? {
                let entry = entry.map_err(tar_err)?;
                if is_regular(entry.header().entry_type()) {
                    total += entry.size() as i64;
                }
            }
        }
        if let Some(handler) = progress.as_deref_mut() {
            handler(ProgressEvent::AddTotalSize(total));
        }

        // Second pass: apply.
        let mut archive = Archive::new(layer.reader()?);
        for entry in archive.entries().map_err(tar_err)? {
            let entry = entry.map_err(tar_err)?;
            self.apply_entry(entry, &mut progress)?;
        }
        debug!(layer = %source.display(), total_bytes = total, "unpacked layer");
        Ok(())
    }

    fn apply_entry<R: std::io::Read>(
        &mut self,
        mut entry: Entry<'_, R>,
        progress: &mut Option<&mut dyn FnMut(ProgressEvent)>,
    ) -> SiloResult<()> {
        let raw_path = entry
            .path()
            .map_err(|e| SiloError::Format(format!("bad entry path: {}", e)))?
            .into_owned();
        let comps = normalize_components(&raw_path);
        if comps.is_empty() {
            trace!("skipping root entry");
            return Ok(());
        }

        let entry_type = entry.header().entry_type();
        match entry_type {
            EntryType::XGlobalHeader | EntryType::XHeader => return Ok(()),
            _ => {}
        }

        let name = comps.last().cloned().unwrap_or_default();
        let size = entry.size() as i64;

        // Whiteouts: markers from the layer, applied to the image.
        if entry_type == EntryType::Regular && name == OPAQUE_WHITEOUT {
            let parent: PathBuf = comps[..comps.len() - 1].iter().collect();
            self.clear_directory(&parent)?;
            emit(progress, ProgressEvent::AddSize(size));
            emit(progress, ProgressEvent::AddItems(1));
            return Ok(());
        }
        if entry_type == EntryType::Regular {
            if let Some(victim) = name.strip_prefix(WHITEOUT_PREFIX) {
                let mut target = comps[..comps.len() - 1].to_vec();
                target.push(victim.to_string());
                let target: PathBuf = target.iter().collect();
                match self.unlink(&target) {
                    Ok(()) | Err(SiloError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                trace!(target = %target.display(), "applied file whiteout");
                emit(progress, ProgressEvent::AddSize(size));
                emit(progress, ProgressEvent::AddItems(1));
                return Ok(());
            }
        }

        let full: PathBuf = comps.iter().collect();

        let mode = entry.header().mode().unwrap_or(0o755) & 0o7777;
        let uid = entry.header().uid().unwrap_or(0) as u32;
        let gid = entry.header().gid().unwrap_or(0) as u32;
        let mtime = entry.header().mtime().unwrap_or(0) as i64;
        let xattrs = read_pax_xattrs(&mut entry)?;
        let attrs = Attrs::new(mode)
            .owner(uid, gid)
            .mtime(mtime)
            .xattrs(xattrs);

        match entry_type {
            EntryType::Directory => {
                let attrs = Attrs {
                    mode: S_IFDIR as u32 | mode,
                    ..attrs
                };
                self.create::<&[u8]>(&full, attrs, None)?;
            }
            EntryType::Regular | EntryType::GNUSparse | EntryType::Continuous => {
                let attrs = Attrs {
                    mode: S_IFREG as u32 | mode,
                    ..attrs
                };
                self.create(&full, attrs, Some(&mut entry))?;
                emit(progress, ProgressEvent::AddSize(size));
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| SiloError::Format(format!("bad link name: {}", e)))?
                    .ok_or_else(|| {
                        SiloError::Format(format!("symlink {} without target", full.display()))
                    })?
                    .into_owned();
                self.create_symlink(&full, &target, attrs)?;
            }
            EntryType::Link => {
                let target = entry
                    .link_name()
                    .map_err(|e| SiloError::Format(format!("bad link name: {}", e)))?
                    .ok_or_else(|| {
                        SiloError::Format(format!("hardlink {} without target", full.display()))
                    })?
                    .into_owned();
                self.hard_link(&full, &target)?;
            }
            EntryType::Char | EntryType::Block => {
                let major = entry
                    .header()
                    .device_major()
                    .ok()
                    .flatten()
                    .unwrap_or(0);
                let minor = entry
                    .header()
                    .device_minor()
                    .ok()
                    .flatten()
                    .unwrap_or(0);
                let type_bits = if entry_type == EntryType::Char {
                    S_IFCHR
                } else {
                    S_IFBLK
                };
                let attrs = Attrs {
                    mode: type_bits as u32 | mode,
                    ..attrs
                }
                .rdev(major, minor);
                self.create::<&[u8]>(&full, attrs, None)?;
            }
            EntryType::Fifo => {
                let attrs = Attrs {
                    mode: S_IFIFO as u32 | mode,
                    ..attrs
                };
                self.create::<&[u8]>(&full, attrs, None)?;
            }
            other => {
                return Err(SiloError::Format(format!(
                    "unhandled tar entry type {:?} for {}",
                    other,
                    raw_path.display()
                )));
            }
        }
        emit(progress, ProgressEvent::AddItems(1));
        Ok(())
    }
}

fn is_regular(entry_type: EntryType) -> bool {
    matches!(
        entry_type,
        EntryType::Regular | EntryType::GNUSparse | EntryType::Continuous
    )
}

fn emit(progress: &mut Option<&mut dyn FnMut(ProgressEvent)>, event: ProgressEvent) {
    if let Some(handler) = progress.as_deref_mut() {
        handler(event);
    }
}

fn read_pax_xattrs<R: std::io::Read>(entry: &mut Entry<'_, R>) -> SiloResult<Vec<(String, Vec<u8>)>> {
    let mut xattrs = Vec::new();
    let extensions = match entry.pax_extensions() {
        Ok(Some(exts)) => exts,
        Ok(None) => return Ok(xattrs),
        Err(e) => return Err(SiloError::Format(format!("pax parse error: {}", e))),
    };
    for ext in extensions {
        let ext = ext.map_err(|e| SiloError::Format(format!("pax entry error: {}", e)))?;
        let key = match ext.key() {
            Ok(k) => k,
            Err(e) => {
                trace!("skipping undecodable pax key: {}", e);
                continue;
            }
        };
        if let Some(name) = key.strip_prefix("SCHILY.xattr.") {
            xattrs.push((name.to_string(), ext.value_bytes().to_vec()));
        }
    }
    Ok(xattrs)
}

fn tar_err(e: std::io::Error) -> SiloError {
    SiloError::Format(format!("tar read error: {}", e))
}
