//! Per-process supervision on the host side.
//!
//! A process moves created → running → exited → deleted, with `delete`
//! accepted (and idempotent) from any state. Exit status flows through a
//! watch channel so every concurrent waiter observes the same value, and
//! a dead VM resolves every outstanding wait with a synthetic SIGKILL
//! termination.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use silo_shared::{
    AgentRequest, AgentResponse, ExitStatus, ProcessSpec, SiloError, SiloResult, StdioRequest,
};
use tokio::sync::watch;
use tracing::debug;

use crate::agent::{AgentChannel, ProcessIo, StdioPump, StdioStreams};
use crate::vmm::VirtualMachine;

/// Lifecycle phase of a process handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Running,
    Exited,
    Deleted,
}

/// Shared behaviour of every process variant.
#[async_trait]
pub trait Process: Send + Sync {
    fn id(&self) -> &str;
    fn state(&self) -> ProcessState;
    async fn start(&self) -> SiloResult<()>;
    async fn wait(&self, timeout: Option<Duration>) -> SiloResult<ExitStatus>;
    async fn signal(&self, signal: i32) -> SiloResult<()>;
    async fn delete(&self) -> SiloResult<()>;
}

struct ProcessInner {
    container_id: String,
    process_id: String,
    channel: AgentChannel,
    state: Mutex<ProcessState>,
    exit: watch::Sender<Option<ExitStatus>>,
    pump: Mutex<Option<StdioPump>>,
}

/// The concrete supervisor shared by all handle variants.
#[derive(Clone)]
pub struct ProcessCore {
    inner: Arc<ProcessInner>,
}

impl ProcessCore {
    /// Create the process inside the guest: the agent allocates an id and
    /// stdio ports; the host connects the streams and wires the caller's
    /// sinks. The guest does not exec yet.
    pub(crate) async fn create(
        channel: AgentChannel,
        vm: &dyn VirtualMachine,
        container_id: &str,
        process_id: &str,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> SiloResult<ProcessCore> {
        let stdio_request = StdioRequest {
            stdin: io.stdin.is_some(),
            stdout: io.stdout.is_some(),
            stderr: io.stderr.is_some(),
        };
        let response = channel
            .call(AgentRequest::CreateProcess {
                container_id: container_id.to_string(),
                process_id: process_id.to_string(),
                spec: Box::new(spec),
                stdio: stdio_request,
            })
            .await?;
        let ports = match response {
            AgentResponse::Created { stdio } => stdio,
            other => {
                return Err(SiloError::Internal(format!(
                    "unexpected agent response: {:?}",
                    other
                )))
            }
        };

        let mut streams = StdioStreams::default();
        if let Some(port) = ports.console {
            streams.console = Some(vm.open_vsock(port).await?);
        } else {
            if let Some(port) = ports.stdin {
                streams.stdin = Some(vm.open_vsock(port).await?);
            }
            if let Some(port) = ports.stdout {
                streams.stdout = Some(vm.open_vsock(port).await?);
            }
            if let Some(port) = ports.stderr {
                streams.stderr = Some(vm.open_vsock(port).await?);
            }
        }
        let pump = StdioPump::spawn(io, streams);

        let (exit, _) = watch::channel(None);
        debug!(container = container_id, process = process_id, "created process");
        Ok(ProcessCore {
            inner: Arc::new(ProcessInner {
                container_id: container_id.to_string(),
                process_id: process_id.to_string(),
                channel,
                state: Mutex::new(ProcessState::Created),
                exit,
                pump: Mutex::new(Some(pump)),
            }),
        })
    }

    fn set_state(&self, state: ProcessState) {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn current_state(&self) -> ProcessState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.inner.process_id
    }

    pub fn container_id(&self) -> &str {
        &self.inner.container_id
    }

    pub fn state(&self) -> ProcessState {
        self.current_state()
    }

    /// Instruct the guest to fork and exec.
    pub async fn start(&self) -> SiloResult<()> {
        match self.current_state() {
            ProcessState::Created => {}
            other => {
                return Err(SiloError::InvalidState(format!(
                    "cannot start process {} in state {:?}",
                    self.id(),
                    other
                )))
            }
        }
        self.inner
            .channel
            .call_ok(AgentRequest::StartProcess {
                process_id: self.inner.process_id.clone(),
            })
            .await?;
        self.set_state(ProcessState::Running);
        Ok(())
    }

    /// Wait for exit. Callable concurrently; every waiter sees the same
    /// status. A timeout expires with an error and leaves the process
    /// running; cancellation does too.
    pub async fn wait(&self, timeout: Option<Duration>) -> SiloResult<ExitStatus> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.wait_inner())
                .await
                .map_err(|_| {
                    SiloError::Internal(format!(
                        "wait for process {} timed out after {:?}",
                        self.id(),
                        limit
                    ))
                })?,
            None => self.wait_inner().await,
        }
    }

    async fn wait_inner(&self) -> SiloResult<ExitStatus> {
        if let Some(status) = *self.inner.exit.subscribe().borrow() {
            return Ok(status);
        }
        if self.current_state() == ProcessState::Deleted {
            return Err(SiloError::InvalidState(format!(
                "process {} was deleted",
                self.id()
            )));
        }

        let mut closed = self.inner.channel.closed();
        let call = self.inner.channel.call(AgentRequest::WaitProcess {
            process_id: self.inner.process_id.clone(),
        });
        tokio::select! {
            response = call => {
                let status = match response {
                    Ok(AgentResponse::Exited { status }) => status,
                    Ok(other) => {
                        return Err(SiloError::Internal(format!(
                            "unexpected agent response: {:?}",
                            other
                        )))
                    }
                    // Channel death while waiting: the VM is gone and so
                    // is the process.
                    Err(SiloError::Agent(_)) if self.inner.channel.is_closed() => {
                        ExitStatus::Signaled(libc::SIGKILL)
                    }
                    Err(e) => return Err(e),
                };
                self.record_exit(status);
                Ok(status)
            }
            _ = closed.wait_for(|dead| *dead) => {
                let status = ExitStatus::Signaled(libc::SIGKILL);
                self.record_exit(status);
                Ok(status)
            }
        }
    }

    fn record_exit(&self, status: ExitStatus) {
        self.inner.exit.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(status);
                true
            } else {
                false
            }
        });
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == ProcessState::Running || *state == ProcessState::Created {
            *state = ProcessState::Exited;
        }
    }

    /// Deliver `signal` to the process (pid 1 of its scope when the init
    /// shim wraps it; the shim forwards).
    pub async fn signal(&self, signal: i32) -> SiloResult<()> {
        match self.current_state() {
            ProcessState::Deleted => Err(SiloError::InvalidState(format!(
                "process {} was deleted",
                self.id()
            ))),
            _ => {
                self.inner
                    .channel
                    .call_ok(AgentRequest::SignalProcess {
                        process_id: self.inner.process_id.clone(),
                        signal,
                    })
                    .await
            }
        }
    }

    /// Free guest-side state. Idempotent; callable from any state.
    pub async fn delete(&self) -> SiloResult<()> {
        if self.current_state() == ProcessState::Deleted {
            return Ok(());
        }
        // A dead channel means the VM (and the process) are already gone.
        if !self.inner.channel.is_closed() {
            self.inner
                .channel
                .call_ok(AgentRequest::DeleteProcess {
                    process_id: self.inner.process_id.clone(),
                })
                .await?;
        }
        // Bind before awaiting: an `if let` would pin the mutex guard
        // across the await.
        let pump = self
            .inner
            .pump
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(pump) = pump {
            pump.finish().await;
        }
        self.set_state(ProcessState::Deleted);
        debug!(process = self.id(), "deleted process");
        Ok(())
    }
}

/// A process handle: the container's primary process, an exec child, or
/// a process inside a pod member. Variants share their supervisor core;
/// the tag records provenance for callers and diagnostics.
#[derive(Clone)]
pub enum ProcessHandle {
    Primary(ProcessCore),
    Exec(ProcessCore),
    Pod(ProcessCore),
}

impl ProcessHandle {
    pub fn core(&self) -> &ProcessCore {
        match self {
            ProcessHandle::Primary(core)
            | ProcessHandle::Exec(core)
            | ProcessHandle::Pod(core) => core,
        }
    }
}

#[async_trait]
impl Process for ProcessHandle {
    fn id(&self) -> &str {
        self.core().id()
    }

    fn state(&self) -> ProcessState {
        self.core().state()
    }

    async fn start(&self) -> SiloResult<()> {
        self.core().start().await
    }

    async fn wait(&self, timeout: Option<Duration>) -> SiloResult<ExitStatus> {
        self.core().wait(timeout).await
    }

    async fn signal(&self, signal: i32) -> SiloResult<()> {
        self.core().signal(signal).await
    }

    async fn delete(&self) -> SiloResult<()> {
        self.core().delete().await
    }
}
