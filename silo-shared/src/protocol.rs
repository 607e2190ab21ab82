//! Agent wire protocol.
//!
//! Requests and responses travel as u32-length-prefixed JSON frames over a
//! single vsock connection per VM. Frames carry a host-assigned request id
//! so long-blocking calls (`WaitProcess`) multiplex with short ones on the
//! same channel. Binary payloads inside frames (copy-in/copy-out chunks)
//! are base64 fields; bulk stdio never rides this channel, it gets
//! dedicated per-process vsock streams whose ports the agent allocates.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::config::{Dns, Hosts, Interface, Mount, ProcessSpec};
use crate::constants::protocol::MAX_FRAME_LEN;
use crate::errors::SiloError;

/// Object-safe bidirectional byte stream, the shape of a vsock
/// connection as both sides see it.
pub trait AsyncIo: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> AsyncIo for T {}

/// A boxed vsock (or vsock-shaped) connection.
pub type IoStream = Box<dyn AsyncIo>;

/// Build the length-delimited codec both sides frame with.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_type::<u32>()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// One frame on the RPC channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Host-assigned correlation id; echoed back on the response.
    pub id: u64,
    pub body: T,
}

/// Per-container isolation scope, provisioned before its processes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScopeSpec {
    /// Guest path the container's root filesystem is mounted at. `None`
    /// means processes run in the agent's own filesystem view.
    #[serde(default)]
    pub rootfs: Option<PathBuf>,
    /// Enter `rootfs` (chroot) before exec.
    #[serde(default)]
    pub chroot: bool,
    /// Give the container its own PID namespace. Pods with a shared PID
    /// namespace leave this off for every member.
    #[serde(default)]
    pub new_pid_namespace: bool,
    /// Cgroup ceilings for this container inside the VM.
    #[serde(default)]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub memory_bytes: Option<u64>,
    /// Wrap the scope's processes in the init shim.
    #[serde(default)]
    pub use_init: bool,
    /// Per-container `/etc/resolv.conf`; falls back to the bootstrap
    /// default when absent (replace, never merge).
    #[serde(default)]
    pub dns: Option<Dns>,
    /// Per-container `/etc/hosts`; same fallback rule.
    #[serde(default)]
    pub hosts: Option<Hosts>,
}

/// Everything the agent sets up when a VM comes online.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub container_id: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub dns: Option<Dns>,
    #[serde(default)]
    pub hosts: Option<Hosts>,
    /// Mounts performed in order before anything else; the rootfs mount
    /// (destination `/`, or the scope rootfs path) comes first so
    /// `/etc/resolv.conf` and `/etc/hosts` land before a read-only remount.
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Remount the rootfs read-only after the etc files are written.
    #[serde(default)]
    pub rootfs_read_only: bool,
    pub scope: ScopeSpec,
}

/// Statistics categories a host may request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticsCategory {
    Process,
    Memory,
    MemoryEvents,
    Network,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProcessStats {
    pub running: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub usage_bytes: u64,
    pub limit_bytes: Option<u64>,
}

/// Counters from the cgroup `memory.events` file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemoryEvents {
    pub low: u64,
    pub high: u64,
    pub max: u64,
    pub oom: u64,
    pub oom_kill: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetworkStats {
    pub interface: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatisticsReport {
    #[serde(default)]
    pub process: Option<ProcessStats>,
    #[serde(default)]
    pub memory: Option<MemoryStats>,
    #[serde(default)]
    pub memory_events: Option<MemoryEvents>,
    #[serde(default)]
    pub network: Vec<NetworkStats>,
}

/// How a process invocation ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    /// Normal exit with a code.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(i32),
}

impl ExitStatus {
    /// Unix-convention exit code: `rc` for normal exits, `128 + signum`
    /// for signal deaths.
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Exited(rc) => *rc,
            ExitStatus::Signaled(signum) => 128 + signum,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }
}

/// Which stdio streams the host will connect for a process. The agent
/// allocates ports only for these; the rest wire to the null device.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct StdioRequest {
    #[serde(default)]
    pub stdin: bool,
    #[serde(default)]
    pub stdout: bool,
    #[serde(default)]
    pub stderr: bool,
}

/// Stdio stream ports allocated by the agent for one process.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct StdioPorts {
    #[serde(default)]
    pub stdin: Option<u32>,
    #[serde(default)]
    pub stdout: Option<u32>,
    #[serde(default)]
    pub stderr: Option<u32>,
    /// Set instead of the three pipes when the process has a terminal.
    #[serde(default)]
    pub console: Option<u32>,
}

/// Host → guest calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AgentRequest {
    /// First call on a fresh VM; provisions the primary container scope.
    Bootstrap(Box<BootstrapConfig>),
    /// Provision an additional container scope (pods).
    CreateScope {
        container_id: String,
        scope: ScopeSpec,
    },
    DeleteScope {
        container_id: String,
    },
    CreateProcess {
        container_id: String,
        process_id: String,
        spec: Box<ProcessSpec>,
        stdio: StdioRequest,
    },
    StartProcess {
        process_id: String,
    },
    WaitProcess {
        process_id: String,
    },
    SignalProcess {
        process_id: String,
        signal: i32,
    },
    DeleteProcess {
        process_id: String,
    },
    Statistics {
        container_id: String,
        categories: Vec<StatisticsCategory>,
    },
    CopyInBegin {
        path: PathBuf,
        mode: u32,
    },
    CopyInChunk {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    CopyInEnd,
    CopyOutBegin {
        path: PathBuf,
    },
    CopyOutChunk,
    MountShare(Mount),
    ConfigureInterface(Interface),
    /// Graceful teardown; the agent stops accepting work.
    Shutdown,
}

/// Guest → host replies.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AgentResponse {
    Ok,
    /// Reply to `CreateProcess`.
    Created { stdio: StdioPorts },
    /// Reply to `WaitProcess`.
    Exited { status: ExitStatus },
    Statistics(Box<StatisticsReport>),
    /// Reply to `CopyOutBegin`.
    CopySize { size: u64 },
    /// Reply to `CopyOutChunk`.
    Data {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        eof: bool,
    },
    Error { kind: String, message: String },
}

impl AgentResponse {
    pub fn error(e: &SiloError) -> Self {
        AgentResponse::Error {
            kind: e.kind().to_string(),
            message: e.message().to_string(),
        }
    }

    /// Convert an error reply back into the error it carried.
    pub fn into_result(self) -> Result<AgentResponse, SiloError> {
        match self {
            AgentResponse::Error { kind, message } => {
                Err(SiloError::from_kind(&kind, message))
            }
            other => Ok(other),
        }
    }
}

/// Binary payloads inside JSON frames.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let req = Envelope {
            id: 7,
            body: AgentRequest::SignalProcess {
                process_id: "init".into(),
                signal: 15,
            },
        };
        let bytes = serde_json::to_vec(&req).unwrap();
        let back: Envelope<AgentRequest> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.id, 7);
        match back.body {
            AgentRequest::SignalProcess { process_id, signal } => {
                assert_eq!(process_id, "init");
                assert_eq!(signal, 15);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_copy_chunk_base64() {
        let resp = AgentResponse::Data {
            data: vec![0, 159, 146, 150],
            eof: true,
        };
        let text = serde_json::to_string(&resp).unwrap();
        assert!(text.contains("AJ+Slg=="));
        let back: AgentResponse = serde_json::from_str(&text).unwrap();
        match back {
            AgentResponse::Data { data, eof } => {
                assert_eq!(data, vec![0, 159, 146, 150]);
                assert!(eof);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_exit_status_codes() {
        assert_eq!(ExitStatus::Exited(42).code(), 42);
        assert_eq!(ExitStatus::Signaled(9).code(), 137);
        assert!(ExitStatus::Exited(0).success());
        assert!(!ExitStatus::Signaled(15).success());
    }

    #[test]
    fn test_error_response_roundtrip() {
        let original = SiloError::NotFound("process p1".into());
        let resp = AgentResponse::error(&original);
        let err = resp.into_result().unwrap_err();
        assert!(matches!(err, SiloError::NotFound(_)));
        assert!(err.to_string().contains("process p1"));
    }
}
