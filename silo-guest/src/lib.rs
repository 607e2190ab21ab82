//! silo-guest - the in-guest agent.
//!
//! Serves the silo agent protocol over vsock inside a VM, supervising
//! container processes, mounts, scopes, and statistics. The crate is
//! also a library so hosts and tests can embed the same agent loop over
//! in-memory transports ([`memory::MemoryNetwork`]), which is how the
//! runtime's hermetic lifecycle tests run.

use std::collections::HashMap;
use std::path::PathBuf;

pub mod executor;
pub mod init;
pub mod memory;
pub mod mounts;
pub mod netif;
pub mod registry;
pub mod scope;
pub mod server;
pub mod stats;

pub use server::{AgentServer, GuestListener, GuestNetwork};

/// How the agent is allowed to touch the system it runs on.
#[derive(Clone, Debug, Default)]
pub struct AgentOptions {
    /// True inside a real guest: mounts, hostname, cgroups, chroot, and
    /// ownership changes are performed. False when embedded in a host
    /// process (tests, development), where the agent only manages
    /// processes and files.
    pub privileged: bool,
    /// Embedded mode only: resolves a virtio-fs share tag to the host
    /// directory backing it, standing in for a mount.
    pub share_roots: HashMap<String, PathBuf>,
    /// Binary exec'd as the init shim when a scope asks for one;
    /// defaults to the running executable.
    pub init_binary: Option<PathBuf>,
}
