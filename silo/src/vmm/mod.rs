//! The hypervisor seam.
//!
//! silo consumes a hypervisor as a capability: something that can start a
//! VM with a set of resources and attachments, open vsock connections
//! into it, and tear it down. No backend ships with the library; hosts
//! inject an implementation (and tests inject a loopback one).

use std::path::PathBuf;

use async_trait::async_trait;
use silo_shared::config::{Interface, UnixSocket};
use silo_shared::{IoStream, SiloResult};

/// Sink receiving the VM's serial console during boot.
pub type BootLog = Box<dyn tokio::io::AsyncWrite + Send + Unpin>;

/// How an attachment is surfaced to the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmMountKind {
    /// A host file attached as a virtio block device.
    BlockDevice,
    /// A host directory shared via virtio-fs.
    SharedDirectory,
    /// A single host file shared read-through.
    SingleFile,
}

/// One attachment handed to the hypervisor at boot.
#[derive(Clone, Debug)]
pub struct VmMount {
    pub kind: VmMountKind,
    pub host_path: PathBuf,
    /// Share tag or device label the guest addresses the attachment by.
    pub tag: String,
    pub read_only: bool,
}

/// Everything a backend needs to bring up one VM.
#[derive(Clone, Debug)]
pub struct VmSpec {
    pub cpus: u32,
    pub memory_bytes: u64,
    pub mounts: Vec<VmMount>,
    pub interfaces: Vec<Interface>,
    pub sockets: Vec<UnixSocket>,
    pub nested_virtualization: bool,
}

impl Default for VmSpec {
    fn default() -> Self {
        Self {
            cpus: 2,
            memory_bytes: 512 * 1024 * 1024,
            mounts: Vec::new(),
            interfaces: Vec::new(),
            sockets: Vec::new(),
            nested_virtualization: false,
        }
    }
}

/// A running VM.
#[async_trait]
pub trait VirtualMachine: Send + Sync {
    /// Open a vsock connection to `port` inside the guest.
    async fn open_vsock(&self, port: u32) -> SiloResult<IoStream>;

    /// Tear the VM down. Idempotent.
    async fn release(&self) -> SiloResult<()>;
}

/// A hypervisor backend.
#[async_trait]
pub trait VirtualMachineProvider: Send + Sync {
    /// Boot a VM. `boot_log` receives the serial console when given.
    async fn start_vm(
        &self,
        spec: VmSpec,
        boot_log: Option<BootLog>,
    ) -> SiloResult<Box<dyn VirtualMachine>>;
}
