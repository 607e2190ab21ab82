//! Host-wide container registry.
//!
//! Owns a root directory with one subdirectory per container id holding
//! the rootfs artifacts, an optional writable layer image, and the
//! persisted configuration and lifecycle state. The manager hands out
//! controllers and guarantees at most one active controller per id.

mod lock;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use silo_shared::config::Interface;
use silo_shared::layout::ContainerLayout;
use silo_shared::{ContainerConfig, RootFs, SiloError, SiloResult};
use tracing::{debug, info};

use crate::archive::Compression;
use crate::container::Container;
use crate::ext4::{Ext4Formatter, FormatterOptions};
use crate::vmm::VirtualMachineProvider;

pub use lock::ManagerLock;

/// Where a container's root filesystem comes from.
#[derive(Clone, Debug)]
pub enum ImageSource {
    /// Ordered OCI layer tarballs, formatted into an EXT4 block image.
    Layers(Vec<PathBuf>),
    /// An existing host directory, shared into the guest.
    Directory(PathBuf),
}

/// Per-create options.
#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    /// Materialize a writable EXT4 layer of this many bytes.
    pub writable_layer_size: Option<u64>,
    /// Minimum size of a rootfs image built from layers.
    pub rootfs_size: Option<u64>,
}

/// Grants containers network interfaces. Without one, guests get
/// loopback only.
pub trait NetworkService: Send + Sync {
    fn allocate(&self, container_id: &str) -> SiloResult<Interface>;
    fn release(&self, container_id: &str) -> SiloResult<()>;
}

/// Last known lifecycle state, persisted as `state.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedState {
    pub status: String,
    pub updated_at: u64,
}

/// Everything `config.json` holds: enough to rebuild the controller
/// after a manager restart.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub rootfs: RootFs,
    pub writable_layer: bool,
    pub config: ContainerConfig,
}

/// Registry of containers on one host.
pub struct ContainerManager {
    root: PathBuf,
    provider: Arc<dyn VirtualMachineProvider>,
    network: Option<Arc<dyn NetworkService>>,
    active: Mutex<HashMap<String, Arc<Container>>>,
    _lock: ManagerLock,
}

impl ContainerManager {
    pub fn new(
        root: impl Into<PathBuf>,
        provider: Arc<dyn VirtualMachineProvider>,
    ) -> SiloResult<ContainerManager> {
        let root = root.into();
        let lock = ManagerLock::acquire(&root)?;
        Ok(ContainerManager {
            root,
            provider,
            network: None,
            active: Mutex::new(HashMap::new()),
            _lock: lock,
        })
    }

    /// Attach a network service; subsequent creates get an interface.
    pub fn with_network(mut self, network: Arc<dyn NetworkService>) -> ContainerManager {
        self.network = Some(network);
        self
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Materialize a container directory and return its controller.
    ///
    /// A second create for an id with an active controller is refused;
    /// use [`get`](Self::get) to share the existing one.
    pub async fn create(
        &self,
        id: &str,
        image: ImageSource,
        options: CreateOptions,
        configure: impl FnOnce(&mut ContainerConfig),
    ) -> SiloResult<Arc<Container>> {
        if id.is_empty() {
            return Err(SiloError::InvalidArgument("empty container id".into()));
        }
        {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.contains_key(id) {
                return Err(SiloError::InvalidState(format!(
                    "container {} already has an active controller",
                    id
                )));
            }
        }

        if let ImageSource::Directory(dir) = &image {
            if !dir.is_dir() {
                return Err(SiloError::NotFound(format!(
                    "rootfs directory {}",
                    dir.display()
                )));
            }
        }

        let layout = ContainerLayout::new(&self.root, id);
        layout
            .prepare()
            .map_err(|e| SiloError::Io(format!("failed to prepare {}: {}", id, e)))?;

        let rootfs = match &image {
            ImageSource::Layers(layers) => {
                if layers.is_empty() {
                    return Err(SiloError::InvalidArgument("image has no layers".into()));
                }
                let image_path = layout.rootfs_dir().join("image.ext4");
                let build_path = image_path.clone();
                let build_layers = layers.clone();
                let min_disk_size = options.rootfs_size.unwrap_or(256 * 1024 * 1024);
                let volume_name: String = id.chars().take(15).collect();
                // Formatter work is blocking file I/O; keep it off the
                // cooperative scheduler.
                tokio::task::spawn_blocking(move || {
                    let mut formatter = Ext4Formatter::open(
                        &build_path,
                        FormatterOptions {
                            min_disk_size,
                            volume_name,
                            ..Default::default()
                        },
                    )?;
                    for layer in &build_layers {
                        formatter.unpack(layer, Compression::Auto, None)?;
                    }
                    formatter.close()
                })
                .await
                .map_err(|e| SiloError::Internal(format!("formatter task failed: {}", e)))??;
                RootFs::block(image_path.display().to_string(), vec!["ro".into()])
            }
            ImageSource::Directory(dir) => RootFs::share(dir.display().to_string(), vec![]),
        };

        let interface = match &self.network {
            Some(network) => Some(network.allocate(id)?),
            None => None,
        };

        let mut container = Container::new(id, rootfs.clone(), Arc::clone(&self.provider), |config| {
            configure(config);
            if let Some(interface) = interface {
                config.interfaces.push(interface);
            }
        })?;

        if let Some(size) = options.writable_layer_size {
            let path = layout.writable_layer();
            let build_path = path.clone();
            tokio::task::spawn_blocking(move || {
                let formatter = Ext4Formatter::open(
                    &build_path,
                    FormatterOptions {
                        min_disk_size: size,
                        volume_name: "writable".into(),
                        ..Default::default()
                    },
                )?;
                formatter.close()
            })
            .await
            .map_err(|e| SiloError::Internal(format!("formatter task failed: {}", e)))??;
            container.set_writable_layer(path);
        }

        let record = ContainerRecord {
            rootfs,
            writable_layer: options.writable_layer_size.is_some(),
            config: container.config().clone(),
        };
        std::fs::write(layout.config_file(), serde_json::to_vec_pretty(&record)?)
            .map_err(|e| SiloError::Io(format!("failed to write config.json: {}", e)))?;
        self.write_state(&layout, "created")?;

        let container = Arc::new(container);
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), Arc::clone(&container));
        info!(container = id, root = %layout.root().display(), "registered container");
        Ok(container)
    }

    /// Rebuild a controller for a container directory persisted by an
    /// earlier manager instance.
    pub fn restore(&self, id: &str) -> SiloResult<Arc<Container>> {
        {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.contains_key(id) {
                return Err(SiloError::InvalidState(format!(
                    "container {} already has an active controller",
                    id
                )));
            }
        }
        let layout = ContainerLayout::new(&self.root, id);
        let bytes = std::fs::read(layout.config_file()).map_err(|e| {
            SiloError::NotFound(format!("no persisted container {}: {}", id, e))
        })?;
        let record: ContainerRecord = serde_json::from_slice(&bytes)?;

        let mut container = Container::with_config(
            id,
            record.rootfs,
            Arc::clone(&self.provider),
            record.config,
        )?;
        if record.writable_layer && layout.writable_layer().is_file() {
            container.set_writable_layer(layout.writable_layer());
        }

        let container = Arc::new(container);
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), Arc::clone(&container));
        info!(container = id, "restored container");
        Ok(container)
    }

    /// The persisted lifecycle state, when the container exists on disk.
    pub fn persisted_state(&self, id: &str) -> SiloResult<Option<PersistedState>> {
        let layout = ContainerLayout::new(&self.root, id);
        match std::fs::read(layout.state_file()) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SiloError::Io(format!("failed to read state.json: {}", e))),
        }
    }

    fn write_state(&self, layout: &ContainerLayout, status: &str) -> SiloResult<()> {
        let state = PersistedState {
            status: status.to_string(),
            updated_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        std::fs::write(layout.state_file(), serde_json::to_vec_pretty(&state)?)
            .map_err(|e| SiloError::Io(format!("failed to write state.json: {}", e)))
    }

    /// The active controller for `id`, when there is one.
    pub fn get(&self, id: &str) -> Option<Arc<Container>> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Container ids present on disk, sorted.
    pub fn list(&self) -> SiloResult<Vec<String>> {
        let mut ids = Vec::new();
        let entries = std::fs::read_dir(&self.root)
            .map_err(|e| SiloError::Io(format!("failed to read {}: {}", self.root.display(), e)))?;
        for entry in entries {
            let entry = entry.map_err(|e| SiloError::Io(e.to_string()))?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Stop (if active) and remove a container and its on-disk state.
    /// Idempotent: deleting an unknown id succeeds.
    pub async fn delete(&self, id: &str) -> SiloResult<()> {
        let container = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        if let Some(container) = container {
            container.stop().await?;
        }
        if let Some(network) = &self.network {
            let _ = network.release(id);
        }
        let layout = ContainerLayout::new(&self.root, id);
        if layout.exists() {
            std::fs::remove_dir_all(layout.root()).map_err(|e| {
                SiloError::Io(format!("failed to remove {}: {}", layout.root().display(), e))
            })?;
        }
        debug!(container = id, "deleted container");
        Ok(())
    }
}
