#![allow(dead_code)] // each test binary uses a different slice of this

//! Loopback VM provider for hermetic tests.
//!
//! Satisfies the hypervisor seam with in-memory duplex streams and the
//! real silo-guest agent loop running embedded (unprivileged), so the
//! whole protocol stack gets exercised without a hypervisor or guest
//! kernel. virtio-fs shares resolve to their backing host directories.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use silo::vmm::{BootLog, VirtualMachine, VirtualMachineProvider, VmMountKind, VmSpec};
use silo::SiloResult;
use silo_guest::memory::MemoryNetwork;
use silo_guest::{AgentOptions, AgentServer};
use silo_shared::IoStream;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

pub struct LoopbackProvider;

#[async_trait]
impl VirtualMachineProvider for LoopbackProvider {
    async fn start_vm(
        &self,
        spec: VmSpec,
        boot_log: Option<BootLog>,
    ) -> SiloResult<Box<dyn VirtualMachine>> {
        let network = MemoryNetwork::new();
        let share_roots = spec
            .mounts
            .iter()
            .filter(|mount| mount.kind == VmMountKind::SharedDirectory)
            .map(|mount| (mount.tag.clone(), mount.host_path.clone()))
            .collect();

        let server = AgentServer::new(
            AgentOptions {
                privileged: false,
                share_roots,
                init_binary: None,
            },
            Arc::new(network.clone()),
        );
        let agent = tokio::spawn(async move {
            let _ = server.serve().await;
        });

        if let Some(mut log) = boot_log {
            let _ = log.write_all(b"silo loopback vm: boot complete\n").await;
            let _ = log.flush().await;
        }

        Ok(Box::new(LoopbackVm {
            network,
            agent: Mutex::new(Some(agent)),
        }))
    }
}

struct LoopbackVm {
    network: MemoryNetwork,
    agent: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl VirtualMachine for LoopbackVm {
    async fn open_vsock(&self, port: u32) -> SiloResult<IoStream> {
        self.network.connect(port).await
    }

    async fn release(&self) -> SiloResult<()> {
        if let Some(agent) = self.agent.lock().unwrap_or_else(|e| e.into_inner()).take() {
            agent.abort();
        }
        Ok(())
    }
}

/// An output sink whose contents tests can read back.
pub struct CapturedOutput {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedOutput {
    pub fn new() -> (CapturedOutput, silo::OutputSink) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Box::new(SinkHalf {
            buffer: Arc::clone(&buffer),
        });
        (CapturedOutput { buffer }, sink)
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

struct SinkHalf {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl tokio::io::AsyncWrite for SinkHalf {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        data: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(data);
        std::task::Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}
