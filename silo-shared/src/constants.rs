//! Constants shared between host and guest.
//!
//! These must be identical on both sides of the host-guest boundary.

/// Vsock ports.
pub mod ports {
    /// Well-known vsock port the guest agent serves RPC on.
    pub const AGENT: u32 = 1024;

    /// First port the agent hands out for per-process stdio streams.
    pub const STDIO_BASE: u32 = 2000;
}

/// Container defaults.
pub mod container {
    /// Hostname used when the configuration does not set one.
    pub const DEFAULT_HOSTNAME: &str = "silo";

    /// PATH used to resolve executables when the process env has none.
    pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
}

/// Guest-side filesystem layout.
pub mod guest {
    /// Base directory for per-container runtime state inside the VM.
    pub const RUNTIME_DIR: &str = "/run/silo";
}

/// Agent protocol limits.
pub mod protocol {
    /// Maximum frame length accepted on the RPC channel.
    pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

    /// Chunk size for copy-in/copy-out payload frames.
    pub const COPY_CHUNK: usize = 512 * 1024;
}
