//! silo-shared - types common to the host runtime and the guest agent.
//!
//! This crate holds the error type, configuration shapes, the agent wire
//! protocol, and on-disk layout helpers. Both `silo` (host) and
//! `silo-guest` depend on it; nothing here may pull in host-only or
//! guest-only machinery.

pub mod config;
pub mod constants;
pub mod errors;
pub mod layout;
pub mod protocol;

pub use config::{
    ContainerConfig, Dns, HostEntry, Hosts, Interface, Mount, ProcessSpec, ProcessUser, Rlimit,
    RootFs, UnixSocket,
};
pub use errors::{SiloError, SiloResult};
pub use protocol::{
    AgentRequest, AgentResponse, BootstrapConfig, Envelope, ExitStatus, IoStream, ScopeSpec,
    StdioPorts, StdioRequest,
};
