//! On-disk layout of a container manager root.
//!
//! ```text
//! <manager-root>/<container-id>/
//! ├── rootfs/           # extracted or block-mounted root filesystem
//! ├── writable.ext4     # optional per-container writable layer image
//! ├── config.json       # serialised container configuration
//! └── state.json        # last known lifecycle state
//! ```
//!
//! Lives in silo-shared so host tooling and tests agree on the paths.

use std::path::{Path, PathBuf};

/// File and directory names inside a container directory.
pub mod names {
    pub const ROOTFS: &str = "rootfs";
    pub const WRITABLE_LAYER: &str = "writable.ext4";
    pub const CONFIG: &str = "config.json";
    pub const STATE: &str = "state.json";
}

/// Per-container directory layout under a manager root.
#[derive(Clone, Debug)]
pub struct ContainerLayout {
    root: PathBuf,
}

impl ContainerLayout {
    pub fn new(manager_root: &Path, container_id: &str) -> Self {
        Self {
            root: manager_root.join(container_id),
        }
    }

    /// The container's directory: `<manager-root>/<container-id>`.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rootfs_dir(&self) -> PathBuf {
        self.root.join(names::ROOTFS)
    }

    pub fn writable_layer(&self) -> PathBuf {
        self.root.join(names::WRITABLE_LAYER)
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(names::CONFIG)
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join(names::STATE)
    }

    /// Create the directory skeleton.
    pub fn prepare(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.rootfs_dir())
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }
}
