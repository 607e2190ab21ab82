//! silo - OCI Linux workloads in lightweight per-container VMs.
//!
//! Each container (or pod of containers) runs in its own virtual
//! machine. The hypervisor is an injected capability ([`vmm`]); silo
//! supplies everything around it: rootfs authoring ([`ext4`], a
//! streaming EXT4 formatter over OCI layer tarballs), path-safe archive
//! extraction ([`extract`]), the host side of the in-guest agent
//! protocol ([`agent`]), per-process supervision ([`process`]), and the
//! container, pod, and manager surfaces.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # async fn demo(provider: Arc<dyn silo::vmm::VirtualMachineProvider>) -> silo::SiloResult<()> {
//! let manager = silo::ContainerManager::new("/var/lib/silo", provider)?;
//! let container = manager
//!     .create(
//!         "web",
//!         silo::ImageSource::Layers(vec!["layer0.tar.gz".into()]),
//!         silo::CreateOptions::default(),
//!         |config| {
//!             config.process.arguments = vec!["/usr/bin/httpd".into()];
//!             config.cpus = 2;
//!         },
//!     )
//!     .await?;
//! container.create(silo::ProcessIo::null()).await?;
//! container.start().await?;
//! let status = container.wait(None).await?;
//! container.stop().await?;
//! # let _ = status;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod archive;
pub mod container;
pub mod ext4;
pub mod extract;
pub mod manager;
pub mod pod;
pub mod process;
pub mod sync;
pub mod vmm;

pub use agent::{AgentChannel, InputSource, OutputSink, ProcessIo};
pub use archive::Compression;
pub use container::Container;
pub use ext4::{Attrs, Ext4Formatter, Ext4Reader, FormatterOptions, ProgressEvent};
pub use extract::extract;
pub use manager::{ContainerManager, CreateOptions, ImageSource, NetworkService};
pub use pod::Pod;
pub use process::{Process, ProcessHandle, ProcessState};
pub use sync::AsyncLock;

pub use silo_shared::protocol::{StatisticsCategory, StatisticsReport};
pub use silo_shared::{
    ContainerConfig, Dns, ExitStatus, Hosts, ProcessSpec, ProcessUser, RootFs, SiloError,
    SiloResult,
};
