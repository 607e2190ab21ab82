//! Single-container controller.
//!
//! Drives one VM through the container lifecycle: request the VM from
//! the hypervisor, attach rootfs and mounts, bootstrap the in-guest
//! agent, then supervise the primary process and any exec children.
//! Every state-mutating transition runs under the controller's async
//! lock. Process waits and execs stay outside it so they can run
//! concurrently.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use silo_shared::config::Mount;
use silo_shared::constants::{guest, ports};
use silo_shared::{
    AgentRequest, AgentResponse, BootstrapConfig, ContainerConfig, ExitStatus, ProcessSpec,
    RootFs, ScopeSpec, SiloError, SiloResult,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{AgentChannel, ProcessIo};
use crate::process::{Process, ProcessCore, ProcessHandle};
use crate::sync::AsyncLock;
use crate::vmm::{BootLog, VirtualMachine, VirtualMachineProvider, VmMount, VmMountKind, VmSpec};
use silo_shared::protocol::{StatisticsCategory, StatisticsReport};

struct Live {
    vm: Arc<dyn VirtualMachine>,
    channel: AgentChannel,
    primary: Option<ProcessHandle>,
}

/// A single container backed by its own VM.
pub struct Container {
    id: String,
    rootfs: RootFs,
    writable_layer: Option<PathBuf>,
    config: ContainerConfig,
    provider: Arc<dyn VirtualMachineProvider>,
    lock: AsyncLock,
    live: Mutex<Option<Live>>,
    boot_log: Mutex<Option<BootLog>>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container").field("id", &self.id).finish()
    }
}

impl Container {
    /// Build a controller. `configure` runs over a default
    /// [`ContainerConfig`]; the result is validated once, here.
    pub fn new(
        id: impl Into<String>,
        rootfs: RootFs,
        provider: Arc<dyn VirtualMachineProvider>,
        configure: impl FnOnce(&mut ContainerConfig),
    ) -> SiloResult<Container> {
        let mut config = ContainerConfig::default();
        configure(&mut config);
        Container::with_config(id, rootfs, provider, config)
    }

    /// Build a controller from an already-assembled configuration, e.g.
    /// one reloaded from a manager's `config.json`.
    pub fn with_config(
        id: impl Into<String>,
        rootfs: RootFs,
        provider: Arc<dyn VirtualMachineProvider>,
        config: ContainerConfig,
    ) -> SiloResult<Container> {
        let id = id.into();
        if id.is_empty() {
            return Err(SiloError::InvalidArgument("empty container id".into()));
        }
        config.validate().map_err(SiloError::InvalidArgument)?;
        Ok(Container {
            id,
            rootfs,
            writable_layer: None,
            config,
            provider,
            lock: AsyncLock::new(),
            live: Mutex::new(None),
            boot_log: Mutex::new(None),
        })
    }

    /// Layer an EXT4 writable image over the rootfs; the guest composes
    /// the overlay.
    pub fn set_writable_layer(&mut self, image: impl Into<PathBuf>) {
        self.writable_layer = Some(image.into());
    }

    /// Sink for the VM serial console during the next `create`.
    pub fn set_boot_log(&self, sink: BootLog) {
        *self.boot_log.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    fn live_refs(&self) -> SiloResult<(Arc<dyn VirtualMachine>, AgentChannel)> {
        let live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        match live.as_ref() {
            Some(live) => Ok((Arc::clone(&live.vm), live.channel.clone())),
            None => Err(SiloError::InvalidState(format!(
                "container {} is not created",
                self.id
            ))),
        }
    }

    fn primary(&self) -> SiloResult<ProcessHandle> {
        let live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        live.as_ref()
            .and_then(|live| live.primary.clone())
            .ok_or_else(|| {
                SiloError::InvalidState(format!("container {} is not created", self.id))
            })
    }

    /// Boot the VM, bootstrap the agent, and create (but not start) the
    /// primary process with the given stdio endpoints.
    pub async fn create(&self, io: ProcessIo) -> SiloResult<()> {
        self.lock
            .with_lock(|| async move {
                if self
                    .live
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .is_some()
                {
                    return Err(SiloError::InvalidState(format!(
                        "container {} is already created",
                        self.id
                    )));
                }
                match self.create_locked(io).await {
                    Ok(live) => {
                        *self.live.lock().unwrap_or_else(|e| e.into_inner()) = Some(live);
                        info!(container = %self.id, "created container");
                        Ok(())
                    }
                    Err(e) => {
                        warn!(container = %self.id, error = %e, "create failed");
                        Err(e)
                    }
                }
            })
            .await
    }

    async fn create_locked(&self, io: ProcessIo) -> SiloResult<Live> {
        let spec = self.vm_spec();
        let boot_log = self
            .boot_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let vm: Arc<dyn VirtualMachine> =
            Arc::from(self.provider.start_vm(spec, boot_log).await?);

        let result = async {
            let channel = connect_agent(vm.as_ref()).await?;
            let bootstrap = self.bootstrap_config();
            channel
                .call_ok(AgentRequest::Bootstrap(Box::new(bootstrap)))
                .await?;

            let primary = ProcessCore::create(
                channel.clone(),
                vm.as_ref(),
                &self.id,
                &format!("{}-init", self.id),
                self.config.process.clone(),
                io,
            )
            .await?;

            Ok(Live {
                vm: Arc::clone(&vm),
                channel,
                primary: Some(ProcessHandle::Primary(primary)),
            })
        }
        .await;

        match result {
            Ok(live) => Ok(live),
            Err(e) => {
                // A failed create must leave nothing running.
                let _ = vm.release().await;
                Err(e)
            }
        }
    }

    fn vm_spec(&self) -> VmSpec {
        let mut mounts = vec![VmMount {
            kind: mount_kind(&self.rootfs.fs_type),
            host_path: PathBuf::from(&self.rootfs.source),
            tag: "rootfs".into(),
            read_only: self.rootfs.is_read_only(),
        }];
        if let Some(image) = &self.writable_layer {
            mounts.push(VmMount {
                kind: VmMountKind::BlockDevice,
                host_path: image.clone(),
                tag: "writable".into(),
                read_only: false,
            });
        }
        for (index, mount) in self.config.mounts.iter().enumerate() {
            mounts.push(VmMount {
                kind: mount_kind(&mount.fs_type),
                host_path: PathBuf::from(&mount.source),
                tag: format!("share-{}", index),
                read_only: mount.options.iter().any(|o| o == "ro"),
            });
        }
        VmSpec {
            cpus: self.config.cpus,
            memory_bytes: self.config.memory_bytes,
            mounts,
            interfaces: self.config.interfaces.clone(),
            sockets: self.config.sockets.clone(),
            nested_virtualization: self.config.virtualization,
        }
    }

    fn bootstrap_config(&self) -> BootstrapConfig {
        let runtime_dir = PathBuf::from(guest::RUNTIME_DIR).join(&self.id);
        let rootfs_dest = runtime_dir.join("rootfs");

        // With a writable layer the image mounts as the overlay lower
        // and the merged view lands at the rootfs path.
        let image_dest = if self.writable_layer.is_some() {
            runtime_dir.join("lower")
        } else {
            rootfs_dest.clone()
        };
        let mut mounts = vec![Mount {
            fs_type: self.rootfs.fs_type.clone(),
            source: "rootfs".into(),
            destination: image_dest.display().to_string(),
            options: self.rootfs.options.clone(),
        }];
        if self.writable_layer.is_some() {
            let upper = runtime_dir.join("writable");
            mounts.push(Mount {
                fs_type: "ext4".into(),
                source: "writable".into(),
                destination: upper.display().to_string(),
                options: vec![],
            });
            mounts.push(Mount {
                fs_type: "overlay".into(),
                source: "overlay".into(),
                destination: rootfs_dest.display().to_string(),
                options: vec![
                    format!("lowerdir={}", image_dest.display()),
                    format!("upperdir={}/upper", upper.display()),
                    format!("workdir={}/work", upper.display()),
                ],
            });
        }
        for (index, mount) in self.config.mounts.iter().enumerate() {
            mounts.push(Mount {
                fs_type: mount.fs_type.clone(),
                source: format!("share-{}", index),
                destination: mount.destination.clone(),
                options: mount.options.clone(),
            });
        }

        BootstrapConfig {
            container_id: self.id.clone(),
            hostname: Some(self.config.hostname_or_default().to_string()),
            dns: self.config.dns.clone(),
            hosts: self.config.hosts.clone(),
            mounts,
            rootfs_read_only: self.rootfs.is_read_only(),
            scope: ScopeSpec {
                rootfs: Some(rootfs_dest),
                chroot: true,
                new_pid_namespace: !self.config.share_process_namespace,
                cpus: Some(self.config.cpus),
                memory_bytes: Some(self.config.memory_bytes),
                use_init: self.config.use_init,
                dns: None,
                hosts: None,
            },
        }
    }

    /// Start the primary process.
    pub async fn start(&self) -> SiloResult<()> {
        self.lock
            .with_lock(|| async move { self.primary()?.start().await })
            .await
    }

    /// Wait for the primary process; does not hold the controller lock.
    pub async fn wait(&self, timeout: Option<Duration>) -> SiloResult<ExitStatus> {
        self.primary()?.wait(timeout).await
    }

    /// Signal the primary process.
    pub async fn signal(&self, signal: i32) -> SiloResult<()> {
        self.primary()?.signal(signal).await
    }

    /// Run an additional process in the container. The handle comes back
    /// already started; callers wait on and delete it.
    pub async fn exec(&self, spec: ProcessSpec, io: ProcessIo) -> SiloResult<ProcessHandle> {
        let (vm, channel) = self.live_refs()?;
        let process_id = Uuid::new_v4().to_string();
        let core =
            ProcessCore::create(channel, vm.as_ref(), &self.id, &process_id, spec, io).await?;
        let handle = ProcessHandle::Exec(core);
        handle.start().await?;
        Ok(handle)
    }

    /// Stop the container: delete the primary, shut the agent down, and
    /// release the VM. Idempotent; the controller can `create` again
    /// afterwards with the same id.
    pub async fn stop(&self) -> SiloResult<()> {
        self.lock
            .with_lock(|| async move {
                let live = self.live.lock().unwrap_or_else(|e| e.into_inner()).take();
                let Some(live) = live else {
                    return Ok(());
                };
                if let Some(primary) = &live.primary {
                    if let Err(e) = primary.delete().await {
                        debug!(container = %self.id, "primary delete during stop: {}", e);
                    }
                }
                live.channel.close().await;
                live.vm.release().await?;
                info!(container = %self.id, "stopped container");
                Ok(())
            })
            .await
    }

    /// Guest statistics for this container.
    pub async fn statistics(
        &self,
        categories: Vec<StatisticsCategory>,
    ) -> SiloResult<StatisticsReport> {
        let (_, channel) = self.live_refs()?;
        match channel
            .call(AgentRequest::Statistics {
                container_id: self.id.clone(),
                categories,
            })
            .await?
        {
            AgentResponse::Statistics(report) => Ok(*report),
            other => Err(SiloError::Internal(format!(
                "unexpected agent response: {:?}",
                other
            ))),
        }
    }

    /// Copy a host file into the guest.
    pub async fn copy_in(&self, host_path: &Path, guest_path: &Path) -> SiloResult<()> {
        let (_, channel) = self.live_refs()?;
        channel.copy_in(host_path, guest_path).await
    }

    /// Copy a guest file out to the host.
    pub async fn copy_out(&self, guest_path: &Path, host_path: &Path) -> SiloResult<()> {
        let (_, channel) = self.live_refs()?;
        channel.copy_out(guest_path, host_path).await
    }
}

fn mount_kind(fs_type: &str) -> VmMountKind {
    match fs_type {
        "virtiofs" => VmMountKind::SharedDirectory,
        "file" => VmMountKind::SingleFile,
        _ => VmMountKind::BlockDevice,
    }
}

/// Dial the agent's well-known port, retrying while the guest boots.
pub(crate) async fn connect_agent(vm: &dyn VirtualMachine) -> SiloResult<AgentChannel> {
    let mut delay = Duration::from_millis(20);
    let mut last_error = None;
    for _ in 0..30 {
        match vm.open_vsock(ports::AGENT).await {
            Ok(stream) => return Ok(AgentChannel::new(stream)),
            Err(e) => {
                last_error = Some(e);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(1));
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| SiloError::Internal("agent connect retries exhausted".into())))
}
