//! Mount provisioning inside the guest.
//!
//! Privileged agents perform the mounts the host staged: virtio-fs
//! shares by tag, block devices in attach order, and the overlay that
//! puts a writable layer over a read-only image. Read-only rootfs
//! mounts are first mounted writable and remounted read-only later,
//! after `/etc/hosts` and `/etc/resolv.conf` land.
//!
//! Embedded (unprivileged) agents cannot mount; a virtio-fs "mount"
//! resolves to the host directory backing the share and everything else
//! is skipped.

use std::collections::HashMap;
use std::path::PathBuf;

use silo_shared::config::Mount;
use silo_shared::{SiloError, SiloResult};
use tracing::{debug, trace};

use crate::AgentOptions;

/// Results of provisioning: destination → effective path, plus the
/// destinations still owing a read-only remount.
#[derive(Default)]
pub(crate) struct MountTable {
    effective: HashMap<String, PathBuf>,
    pending_read_only: Vec<String>,
}

impl MountTable {
    /// The usable path for a staged destination (identity for real
    /// mounts, the share root when embedded).
    pub fn resolve(&self, destination: &std::path::Path) -> Option<PathBuf> {
        self.effective
            .get(&destination.display().to_string())
            .cloned()
    }

    /// Fold another table (a later `MountShare`) into this one.
    pub fn merge(&mut self, other: MountTable) {
        self.effective.extend(other.effective);
        self.pending_read_only.extend(other.pending_read_only);
    }

    /// Remount a destination read-only if it was staged that way.
    /// Consumes the obligation.
    pub fn seal_read_only(&mut self, destination: &std::path::Path, privileged: bool) {
        let key = destination.display().to_string();
        let Some(index) = self.pending_read_only.iter().position(|d| *d == key) else {
            return;
        };
        self.pending_read_only.remove(index);
        if privileged {
            remount_read_only(&key);
        }
    }
}

/// Perform (or, embedded, resolve) the staged mounts in order.
pub(crate) fn provision(mounts: &[Mount], options: &AgentOptions) -> SiloResult<MountTable> {
    let mut table = MountTable::default();
    let mut block_index = 0usize;
    for mount in mounts {
        let wants_ro = mount.options.iter().any(|o| o == "ro");
        let effective = if options.privileged {
            perform_mount(mount, &mut block_index)?;
            PathBuf::from(&mount.destination)
        } else {
            match mount.fs_type.as_str() {
                "virtiofs" => match options.share_roots.get(&mount.source) {
                    Some(root) => root.clone(),
                    None => {
                        return Err(SiloError::NotFound(format!(
                            "no share backing tag {}",
                            mount.source
                        )))
                    }
                },
                other => {
                    trace!(fs_type = other, dest = %mount.destination, "skipping mount (embedded)");
                    continue;
                }
            }
        };
        if wants_ro {
            table.pending_read_only.push(mount.destination.clone());
        }
        table
            .effective
            .insert(mount.destination.clone(), effective);
    }
    Ok(table)
}

#[cfg(target_os = "linux")]
fn perform_mount(mount: &Mount, block_index: &mut usize) -> SiloResult<()> {
    use nix::mount::MsFlags;

    std::fs::create_dir_all(&mount.destination).map_err(|e| {
        SiloError::Io(format!("failed to create {}: {}", mount.destination, e))
    })?;

    let (source, fs_type, data) = match mount.fs_type.as_str() {
        "virtiofs" => (mount.source.clone(), "virtiofs".to_string(), String::new()),
        "overlay" => (
            "overlay".to_string(),
            "overlay".to_string(),
            mount.options.join(","),
        ),
        // Block devices surface in attach order: the nth staged block
        // mount is /dev/vd{a+n}.
        fs => {
            let device = format!("/dev/vd{}", (b'a' + *block_index as u8) as char);
            *block_index += 1;
            (device, fs.to_string(), String::new())
        }
    };

    debug!(source = %source, dest = %mount.destination, fs = %fs_type, "mounting");
    nix::mount::mount(
        Some(source.as_str()),
        mount.destination.as_str(),
        Some(fs_type.as_str()),
        MsFlags::empty(),
        if data.is_empty() {
            None
        } else {
            Some(data.as_str())
        },
    )
    .map_err(|e| {
        SiloError::Io(format!(
            "failed to mount {} at {}: {}",
            source, mount.destination, e
        ))
    })
}

#[cfg(not(target_os = "linux"))]
fn perform_mount(_mount: &Mount, _block_index: &mut usize) -> SiloResult<()> {
    Err(SiloError::Unsupported(
        "mount provisioning requires linux".into(),
    ))
}

#[cfg(target_os = "linux")]
fn remount_read_only(destination: &str) {
    use nix::mount::MsFlags;
    if let Err(e) = nix::mount::mount(
        None::<&str>,
        destination,
        None::<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
        None::<&str>,
    ) {
        tracing::warn!(dest = destination, "read-only remount failed: {}", e);
    }
}

#[cfg(not(target_os = "linux"))]
fn remount_read_only(_destination: &str) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_resolves_share_tags() {
        let tmp = tempfile::tempdir().unwrap();
        let options = AgentOptions {
            privileged: false,
            share_roots: [("rootfs".to_string(), tmp.path().to_path_buf())]
                .into_iter()
                .collect(),
            init_binary: None,
        };
        let mounts = vec![Mount {
            fs_type: "virtiofs".into(),
            source: "rootfs".into(),
            destination: "/run/silo/c1/rootfs".into(),
            options: vec!["ro".into()],
        }];
        let table = provision(&mounts, &options).unwrap();
        assert_eq!(
            table.resolve(std::path::Path::new("/run/silo/c1/rootfs")),
            Some(tmp.path().to_path_buf())
        );
    }

    #[test]
    fn test_embedded_unknown_tag_fails() {
        let options = AgentOptions::default();
        let mounts = vec![Mount {
            fs_type: "virtiofs".into(),
            source: "mystery".into(),
            destination: "/run/silo/c1/rootfs".into(),
            options: vec![],
        }];
        assert!(provision(&mounts, &options).is_err());
    }

    #[test]
    fn test_embedded_skips_block_mounts() {
        let options = AgentOptions::default();
        let mounts = vec![Mount {
            fs_type: "ext4".into(),
            source: "writable".into(),
            destination: "/run/silo/c1/writable".into(),
            options: vec![],
        }];
        let table = provision(&mounts, &options).unwrap();
        assert!(table
            .resolve(std::path::Path::new("/run/silo/c1/writable"))
            .is_none());
    }
}
