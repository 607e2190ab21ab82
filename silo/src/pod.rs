//! Pod controller: many containers, one VM.
//!
//! Containers are staged with `add_container`, then `create` boots the
//! VM once and provisions each container's isolation scope: its own
//! mount namespace, its own PID namespace unless the pod shares one, and
//! cgroup ceilings bounded by the pod's. Operations on different
//! containers run concurrently; each member has its own lock, there is
//! no pod-wide lock around process work.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use silo_shared::config::Mount;
use silo_shared::constants::guest;
use silo_shared::{
    AgentRequest, BootstrapConfig, ContainerConfig, ExitStatus, ProcessSpec, RootFs, ScopeSpec,
    SiloError, SiloResult,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::agent::{AgentChannel, ProcessIo};
use crate::container::connect_agent;
use crate::process::{Process, ProcessCore, ProcessHandle};
use crate::sync::AsyncLock;
use crate::vmm::{BootLog, VirtualMachine, VirtualMachineProvider, VmMount, VmMountKind, VmSpec};

struct PodLive {
    vm: Arc<dyn VirtualMachine>,
    channel: AgentChannel,
}

struct Member {
    rootfs: RootFs,
    config: ContainerConfig,
    lock: AsyncLock,
    primary: Mutex<Option<ProcessHandle>>,
}

/// A group of containers sharing one VM.
pub struct Pod {
    id: String,
    config: ContainerConfig,
    provider: Arc<dyn VirtualMachineProvider>,
    lock: AsyncLock,
    live: Mutex<Option<PodLive>>,
    members: Mutex<BTreeMap<String, Arc<Member>>>,
    boot_log: Mutex<Option<BootLog>>,
}

impl Pod {
    /// `configure` sets pod-level resources (`cpus`, `memory_bytes`),
    /// defaults (`hostname`, `dns`, `hosts`) and
    /// `share_process_namespace`.
    pub fn new(
        id: impl Into<String>,
        provider: Arc<dyn VirtualMachineProvider>,
        configure: impl FnOnce(&mut ContainerConfig),
    ) -> SiloResult<Pod> {
        let id = id.into();
        if id.is_empty() {
            return Err(SiloError::InvalidArgument("empty pod id".into()));
        }
        let mut config = ContainerConfig::default();
        configure(&mut config);
        config.validate().map_err(SiloError::InvalidArgument)?;
        Ok(Pod {
            id,
            config,
            provider,
            lock: AsyncLock::new(),
            live: Mutex::new(None),
            members: Mutex::new(BTreeMap::new()),
            boot_log: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_boot_log(&self, sink: BootLog) {
        *self.boot_log.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    /// Stage a container. Must happen before `create`; per-container
    /// resource bounds may not exceed the pod's.
    pub fn add_container(
        &self,
        id: impl Into<String>,
        rootfs: RootFs,
        configure: impl FnOnce(&mut ContainerConfig),
    ) -> SiloResult<()> {
        let id = id.into();
        if id.is_empty() {
            return Err(SiloError::InvalidArgument("empty container id".into()));
        }
        if self.live.lock().unwrap_or_else(|e| e.into_inner()).is_some() {
            return Err(SiloError::InvalidState(
                "containers must be staged before the pod is created".into(),
            ));
        }

        let mut config = self.config.clone();
        // Pod-level values are defaults; a container-level closure
        // replaces them wholesale.
        config.process = ProcessSpec::default();
        configure(&mut config);
        config.validate().map_err(SiloError::InvalidArgument)?;
        if config.cpus > self.config.cpus {
            return Err(SiloError::InvalidArgument(format!(
                "container {} cpus {} exceed pod limit {}",
                id, config.cpus, self.config.cpus
            )));
        }
        if config.memory_bytes > self.config.memory_bytes {
            return Err(SiloError::InvalidArgument(format!(
                "container {} memory {} exceeds pod limit {}",
                id, config.memory_bytes, self.config.memory_bytes
            )));
        }

        let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        if members.contains_key(&id) {
            return Err(SiloError::InvalidArgument(format!(
                "container {} already staged",
                id
            )));
        }
        members.insert(
            id,
            Arc::new(Member {
                rootfs,
                config,
                lock: AsyncLock::new(),
                primary: Mutex::new(None),
            }),
        );
        Ok(())
    }

    /// Ids of the staged containers.
    pub fn list_containers(&self) -> Vec<String> {
        self.members
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn member(&self, id: &str) -> SiloResult<Arc<Member>> {
        self.members
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| SiloError::NotFound(format!("container {} in pod {}", id, self.id)))
    }

    fn live_refs(&self) -> SiloResult<(Arc<dyn VirtualMachine>, AgentChannel)> {
        let live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        match live.as_ref() {
            Some(live) => Ok((Arc::clone(&live.vm), live.channel.clone())),
            None => Err(SiloError::InvalidState(format!(
                "pod {} is not created",
                self.id
            ))),
        }
    }

    /// Boot the shared VM and provision every staged container's scope.
    pub async fn create(&self) -> SiloResult<()> {
        self.lock
            .with_lock(|| async move {
                if self.live.lock().unwrap_or_else(|e| e.into_inner()).is_some() {
                    return Err(SiloError::InvalidState(format!(
                        "pod {} is already created",
                        self.id
                    )));
                }
                let members: Vec<(String, Arc<Member>)> = {
                    let members = self.members.lock().unwrap_or_else(|e| e.into_inner());
                    members
                        .iter()
                        .map(|(id, member)| (id.clone(), Arc::clone(member)))
                        .collect()
                };
                if members.is_empty() {
                    return Err(SiloError::InvalidArgument(format!(
                        "pod {} has no containers",
                        self.id
                    )));
                }

                let spec = self.vm_spec(&members);
                let boot_log = self
                    .boot_log
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take();
                let vm: Arc<dyn VirtualMachine> =
                    Arc::from(self.provider.start_vm(spec, boot_log).await?);

                let outcome = async {
                    let channel = connect_agent(vm.as_ref()).await?;
                    channel
                        .call_ok(AgentRequest::Bootstrap(Box::new(
                            self.bootstrap_config(&members),
                        )))
                        .await?;
                    for (id, member) in &members {
                        channel
                            .call_ok(AgentRequest::CreateScope {
                                container_id: id.clone(),
                                scope: self.scope_for(id, member),
                            })
                            .await?;
                    }
                    Ok(channel)
                }
                .await;

                match outcome {
                    Ok(channel) => {
                        *self.live.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some(PodLive { vm, channel });
                        info!(pod = %self.id, containers = members.len(), "created pod");
                        Ok(())
                    }
                    Err(e) => {
                        let _ = vm.release().await;
                        Err(e)
                    }
                }
            })
            .await
    }

    fn vm_spec(&self, members: &[(String, Arc<Member>)]) -> VmSpec {
        let mut mounts = Vec::new();
        for (id, member) in members {
            mounts.push(VmMount {
                kind: match member.rootfs.fs_type.as_str() {
                    "virtiofs" => VmMountKind::SharedDirectory,
                    _ => VmMountKind::BlockDevice,
                },
                host_path: PathBuf::from(&member.rootfs.source),
                tag: format!("rootfs-{}", id),
                read_only: member.rootfs.is_read_only(),
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

    fn bootstrap_config(&self, members: &[(String, Arc<Member>)]) -> BootstrapConfig {
        let mut mounts = Vec::new();
        for (id, member) in members {
            mounts.push(Mount {
                fs_type: member.rootfs.fs_type.clone(),
                source: format!("rootfs-{}", id),
                destination: rootfs_dest(id).display().to_string(),
                options: member.rootfs.options.clone(),
            });
        }
        BootstrapConfig {
            container_id: self.id.clone(),
            hostname: Some(self.config.hostname_or_default().to_string()),
            dns: self.config.dns.clone(),
            hosts: self.config.hosts.clone(),
            mounts,
            rootfs_read_only: false,
            // The pod itself owns no container scope.
            scope: ScopeSpec::default(),
        }
    }

    fn scope_for(&self, id: &str, member: &Member) -> ScopeSpec {
        ScopeSpec {
            rootfs: Some(rootfs_dest(id)),
            chroot: true,
            new_pid_namespace: !self.config.share_process_namespace,
            cpus: Some(member.config.cpus),
            memory_bytes: Some(member.config.memory_bytes),
            use_init: member.config.use_init,
            dns: member.config.dns.clone(),
            hosts: member.config.hosts.clone(),
        }
    }

    /// Create and start a container's primary process.
    pub async fn start_container(&self, id: &str, io: ProcessIo) -> SiloResult<()> {
        let locked = self.member(id)?;
        let member = Arc::clone(&locked);
        let (vm, channel) = self.live_refs()?;
        locked
            .lock
            .with_lock(|| async move {
                if member
                    .primary
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .is_some()
                {
                    return Err(SiloError::InvalidState(format!(
                        "container {} is already running",
                        id
                    )));
                }
                let core = ProcessCore::create(
                    channel.clone(),
                    vm.as_ref(),
                    id,
                    &format!("{}-init", id),
                    member.config.process.clone(),
                    io,
                )
                .await?;
                let handle = ProcessHandle::Pod(core);
                handle.start().await?;
                *member.primary.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                debug!(pod = %self.id, container = id, "started container");
                Ok(())
            })
            .await
    }

    fn member_primary(&self, id: &str) -> SiloResult<ProcessHandle> {
        let member = self.member(id)?;
        let primary = member.primary.lock().unwrap_or_else(|e| e.into_inner());
        primary.clone().ok_or_else(|| {
            SiloError::InvalidState(format!("container {} has no running process", id))
        })
    }

    /// Wait for a container's primary process.
    pub async fn wait_container(
        &self,
        id: &str,
        timeout: Option<Duration>,
    ) -> SiloResult<ExitStatus> {
        self.member_primary(id)?.wait(timeout).await
    }

    /// Signal a container's primary process.
    pub async fn kill_container(&self, id: &str, signal: i32) -> SiloResult<()> {
        self.member_primary(id)?.signal(signal).await
    }

    /// Stop one container, leaving its scope provisioned for a restart.
    pub async fn stop_container(&self, id: &str) -> SiloResult<()> {
        let locked = self.member(id)?;
        let member = Arc::clone(&locked);
        locked
            .lock
            .with_lock(|| async move {
                let handle = member
                    .primary
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take();
                match handle {
                    Some(handle) => handle.delete().await,
                    None => Ok(()),
                }
            })
            .await
    }

    /// Run an extra process inside one container.
    pub async fn exec_in_container(
        &self,
        id: &str,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> SiloResult<ProcessHandle> {
        let _member = self.member(id)?;
        let (vm, channel) = self.live_refs()?;
        let process_id = Uuid::new_v4().to_string();
        let core = ProcessCore::create(channel, vm.as_ref(), id, &process_id, spec, io).await?;
        let handle = ProcessHandle::Pod(core);
        handle.start().await?;
        Ok(handle)
    }

    /// Stop every container and release the VM. Idempotent.
    pub async fn stop(&self) -> SiloResult<()> {
        let members: Vec<String> = self.list_containers();
        for id in &members {
            let _ = self.stop_container(id).await;
        }
        self.lock
            .with_lock(|| async move {
                let live = self.live.lock().unwrap_or_else(|e| e.into_inner()).take();
                let Some(live) = live else {
                    return Ok(());
                };
                live.channel.close().await;
                live.vm.release().await?;
                info!(pod = %self.id, "stopped pod");
                Ok(())
            })
            .await
    }
}

fn rootfs_dest(container_id: &str) -> PathBuf {
    PathBuf::from(guest::RUNTIME_DIR)
        .join(container_id)
        .join("rootfs")
}
