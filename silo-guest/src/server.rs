//! Agent accept/dispatch loop.
//!
//! One listener on the well-known agent port; every connection gets a
//! framed request loop. Blocking calls (`WaitProcess`) are answered
//! from spawned tasks so a wait never stalls the channel; multi-frame
//! copy sequences are handled inline, which preserves their ordering
//! (the host serializes them on its side too).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use silo_shared::constants::{ports, protocol::COPY_CHUNK};
use silo_shared::protocol::{frame_codec, StdioPorts, StdioRequest};
use silo_shared::{
    AgentRequest, AgentResponse, BootstrapConfig, Envelope, IoStream, SiloError, SiloResult,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};

use crate::executor;
use crate::mounts::{self, MountTable};
use crate::registry::{GuestProcess, PendingStdio, ProcState, ProcessRegistry};
use crate::scope::{ScopeDefaults, ScopeSet};
use crate::stats;
use crate::AgentOptions;

/// Something that can accept vsock-shaped connections on a port.
#[async_trait]
pub trait GuestNetwork: Send + Sync + 'static {
    async fn listen(&self, port: u32) -> SiloResult<Box<dyn GuestListener>>;
}

#[async_trait]
pub trait GuestListener: Send {
    async fn accept(&mut self) -> SiloResult<IoStream>;
}

pub(crate) struct AgentState {
    pub options: AgentOptions,
    pub network: Arc<dyn GuestNetwork>,
    pub registry: ProcessRegistry,
    pub scopes: ScopeSet,
    pub mounts: std::sync::Mutex<MountTable>,
    next_stdio_port: AtomicU32,
    shutdown: watch::Sender<bool>,
}

/// The in-guest agent.
pub struct AgentServer {
    state: Arc<AgentState>,
}

impl AgentServer {
    pub fn new(options: AgentOptions, network: Arc<dyn GuestNetwork>) -> AgentServer {
        let (shutdown, _) = watch::channel(false);
        AgentServer {
            state: Arc::new(AgentState {
                options,
                network,
                registry: ProcessRegistry::default(),
                scopes: ScopeSet::default(),
                mounts: std::sync::Mutex::new(MountTable::default()),
                next_stdio_port: AtomicU32::new(ports::STDIO_BASE),
                shutdown,
            }),
        }
    }

    /// Accept and serve connections until a `Shutdown` request arrives.
    pub async fn serve(&self) -> SiloResult<()> {
        let mut listener = self.state.network.listen(ports::AGENT).await?;
        let mut shutdown = self.state.shutdown.subscribe();
        info!(port = ports::AGENT, "agent serving");
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        let state = Arc::clone(&self.state);
                        tokio::spawn(handle_connection(state, stream));
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        break;
                    }
                },
            }
        }
        info!("agent stopped");
        Ok(())
    }
}

/// In-flight file transfer on one connection.
#[derive(Default)]
struct Transfers {
    copy_in: Option<tokio::fs::File>,
    copy_out: Option<tokio::fs::File>,
}

async fn handle_connection(state: Arc<AgentState>, stream: IoStream) {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut requests = FramedRead::new(read_half, frame_codec());
    let responses = Arc::new(Mutex::new(FramedWrite::new(write_half, frame_codec())));
    let mut transfers = Transfers::default();

    while let Some(frame) = requests.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("request read failed: {}", e);
                break;
            }
        };
        let envelope: Envelope<AgentRequest> = match serde_json::from_slice(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("undecodable request frame: {}", e);
                break;
            }
        };
        let id = envelope.id;
        trace!(id, "request");

        match envelope.body {
            // Long-blocking: answered out of line.
            AgentRequest::WaitProcess { process_id } => {
                let state = Arc::clone(&state);
                let responses = Arc::clone(&responses);
                tokio::spawn(async move {
                    let response = match state.registry.get(&process_id) {
                        Ok(process) => match process.wait().await {
                            Ok(status) => AgentResponse::Exited { status },
                            Err(e) => AgentResponse::error(&e),
                        },
                        Err(e) => AgentResponse::error(&e),
                    };
                    write_response(&responses, id, response).await;
                });
            }
            AgentRequest::Shutdown => {
                write_response(&responses, id, AgentResponse::Ok).await;
                let _ = state.shutdown.send(true);
                break;
            }
            body => {
                let response = dispatch(&state, body, &mut transfers)
                    .await
                    .unwrap_or_else(|e| AgentResponse::error(&e));
                write_response(&responses, id, response).await;
            }
        }
    }
    debug!("connection closed");
}

async fn write_response(
    responses: &Arc<Mutex<FramedWrite<tokio::io::WriteHalf<IoStream>, tokio_util::codec::LengthDelimitedCodec>>>,
    id: u64,
    body: AgentResponse,
) {
    let frame = match serde_json::to_vec(&Envelope { id, body }) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("unencodable response: {}", e);
            return;
        }
    };
    if let Err(e) = responses.lock().await.send(Bytes::from(frame)).await {
        warn!("response write failed: {}", e);
    }
}

async fn dispatch(
    state: &Arc<AgentState>,
    request: AgentRequest,
    transfers: &mut Transfers,
) -> SiloResult<AgentResponse> {
    match request {
        AgentRequest::Bootstrap(config) => bootstrap(state, *config).await,
        AgentRequest::CreateScope {
            container_id,
            scope,
        } => {
            let rootfs = resolve_scope_rootfs(state, scope.rootfs.as_deref());
            state
                .scopes
                .provision(&container_id, scope, rootfs, state.options.privileged)?;
            seal_scope_rootfs(state, &container_id);
            Ok(AgentResponse::Ok)
        }
        AgentRequest::DeleteScope { container_id } => {
            state.scopes.remove(&container_id);
            Ok(AgentResponse::Ok)
        }
        AgentRequest::CreateProcess {
            container_id,
            process_id,
            spec,
            stdio,
        } => {
            // The scope must exist before its processes.
            state.scopes.get(&container_id)?;
            let (ports, pending, acceptors) =
                open_stdio(state, stdio, spec.terminal).await?;
            let process =
                GuestProcess::new(container_id, process_id, *spec, ports, pending);
            for task in acceptors {
                process.track(task);
            }
            state.registry.insert(Arc::clone(&process))?;
            Ok(AgentResponse::Created {
                stdio: process.ports,
            })
        }
        AgentRequest::StartProcess { process_id } => {
            let process = state.registry.get(&process_id)?;
            match process.state() {
                ProcState::Created => {
                    let scope = state.scopes.get(&process.container_id)?;
                    executor::launch(&process, &scope, &state.options).await?;
                    Ok(AgentResponse::Ok)
                }
                // A host may retry a start it lost track of.
                ProcState::Running { .. } => Ok(AgentResponse::Ok),
                ProcState::Exited(_) => Err(SiloError::InvalidState(format!(
                    "process {} already exited",
                    process_id
                ))),
            }
        }
        AgentRequest::WaitProcess { .. } => {
            Err(SiloError::Internal("wait must be dispatched async".into()))
        }
        AgentRequest::SignalProcess { process_id, signal } => {
            let process = state.registry.get(&process_id)?;
            match process.state() {
                ProcState::Running { pid } => {
                    let rc = unsafe { libc::kill(pid, signal) };
                    if rc != 0 {
                        let err = std::io::Error::last_os_error();
                        if err.raw_os_error() != Some(libc::ESRCH) {
                            return Err(SiloError::Internal(format!(
                                "failed to signal {}: {}",
                                process_id, err
                            )));
                        }
                    }
                    Ok(AgentResponse::Ok)
                }
                // Already gone: delivering to a corpse is a no-op.
                ProcState::Exited(_) => Ok(AgentResponse::Ok),
                ProcState::Created => Err(SiloError::InvalidState(format!(
                    "process {} is not started",
                    process_id
                ))),
            }
        }
        AgentRequest::DeleteProcess { process_id } => {
            let Some(process) = state.registry.remove(&process_id) else {
                return Ok(AgentResponse::Ok); // idempotent
            };
            if let ProcState::Running { pid } = process.state() {
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
                let mut rx = process.exit.subscribe();
                let _ = tokio::time::timeout(
                    std::time::Duration::from_secs(2),
                    rx.wait_for(|slot| slot.is_some()),
                )
                .await;
            }
            process.finish_tasks().await;
            debug!(process = %process.id, "deleted process");
            Ok(AgentResponse::Ok)
        }
        AgentRequest::Statistics {
            container_id,
            categories,
        } => Ok(AgentResponse::Statistics(Box::new(stats::collect(
            state,
            &container_id,
            &categories,
        )))),
        AgentRequest::CopyInBegin { path, mode } => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    SiloError::Io(format!("failed to create {}: {}", parent.display(), e))
                })?;
            }
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(mode)
                .open(&path)
                .await
                .map_err(|e| {
                    SiloError::Io(format!("failed to create {}: {}", path.display(), e))
                })?;
            transfers.copy_in = Some(file);
            Ok(AgentResponse::Ok)
        }
        AgentRequest::CopyInChunk { data } => {
            let file = transfers.copy_in.as_mut().ok_or_else(|| {
                SiloError::InvalidState("no copy-in transfer active".into())
            })?;
            file.write_all(&data)
                .await
                .map_err(|e| SiloError::Io(format!("copy-in write failed: {}", e)))?;
            Ok(AgentResponse::Ok)
        }
        AgentRequest::CopyInEnd => {
            let mut file = transfers.copy_in.take().ok_or_else(|| {
                SiloError::InvalidState("no copy-in transfer active".into())
            })?;
            file.flush()
                .await
                .map_err(|e| SiloError::Io(format!("copy-in flush failed: {}", e)))?;
            Ok(AgentResponse::Ok)
        }
        AgentRequest::CopyOutBegin { path } => {
            let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
                SiloError::Io(format!(
                    "failed to read data for {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let size = file
                .metadata()
                .await
                .map_err(|e| SiloError::Io(e.to_string()))?
                .len();
            file.rewind()
                .await
                .map_err(|e| SiloError::Io(e.to_string()))?;
            transfers.copy_out = Some(file);
            Ok(AgentResponse::CopySize { size })
        }
        AgentRequest::CopyOutChunk => {
            let file = transfers.copy_out.as_mut().ok_or_else(|| {
                SiloError::InvalidState("no copy-out transfer active".into())
            })?;
            let mut buf = vec![0u8; COPY_CHUNK];
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| SiloError::Io(format!("copy-out read failed: {}", e)))?;
            buf.truncate(n);
            let eof = n == 0;
            if eof {
                transfers.copy_out = None;
            }
            Ok(AgentResponse::Data { data: buf, eof })
        }
        AgentRequest::MountShare(mount) => {
            let table = mounts::provision(std::slice::from_ref(&mount), &state.options)?;
            state
                .mounts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .merge(table);
            Ok(AgentResponse::Ok)
        }
        AgentRequest::ConfigureInterface(interface) => {
            crate::netif::configure(&interface, state.options.privileged).await?;
            Ok(AgentResponse::Ok)
        }
        // Handled by the connection loop before dispatch.
        AgentRequest::Shutdown => Ok(AgentResponse::Ok),
    }
}

async fn bootstrap(
    state: &Arc<AgentState>,
    config: BootstrapConfig,
) -> SiloResult<AgentResponse> {
    info!(container = %config.container_id, "bootstrap");

    if state.options.privileged {
        set_hostname(config.hostname.as_deref());
    }

    let table = mounts::provision(&config.mounts, &state.options)?;
    state
        .mounts
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .merge(table);

    state.scopes.set_defaults(ScopeDefaults {
        hostname: config.hostname.clone(),
        dns: config.dns.clone(),
        hosts: config.hosts.clone(),
    });

    // A rootfs-bearing scope belongs to the primary container; pods
    // bootstrap without one and provision scopes per member.
    if config.scope.rootfs.is_some() {
        let rootfs = resolve_scope_rootfs(state, config.scope.rootfs.as_deref());
        state.scopes.provision(
            &config.container_id,
            config.scope,
            rootfs,
            state.options.privileged,
        )?;
        seal_scope_rootfs(state, &config.container_id);
    }
    Ok(AgentResponse::Ok)
}

/// Effective rootfs path for a scope: the mount table's resolution when
/// the destination was staged, the literal path otherwise.
fn resolve_scope_rootfs(
    state: &Arc<AgentState>,
    rootfs: Option<&std::path::Path>,
) -> Option<PathBuf> {
    let rootfs = rootfs?;
    let table = state.mounts.lock().unwrap_or_else(|e| e.into_inner());
    Some(table.resolve(rootfs).unwrap_or_else(|| rootfs.to_path_buf()))
}

/// Apply a deferred read-only remount now that the scope's etc files
/// are in place.
fn seal_scope_rootfs(state: &Arc<AgentState>, container_id: &str) {
    let Ok(scope) = state.scopes.get(container_id) else {
        return;
    };
    let Some(dest) = scope.spec.rootfs.as_ref() else {
        return;
    };
    state
        .mounts
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .seal_read_only(dest, state.options.privileged);
}

#[cfg(target_os = "linux")]
fn set_hostname(hostname: Option<&str>) {
    if let Some(hostname) = hostname {
        if let Err(e) = nix::unistd::sethostname(hostname) {
            warn!(hostname, "sethostname failed: {}", e);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_hostname(_hostname: Option<&str>) {}

/// Allocate stdio ports and listeners for one process.
async fn open_stdio(
    state: &Arc<AgentState>,
    request: StdioRequest,
    terminal: bool,
) -> SiloResult<(StdioPorts, PendingStdio, Vec<JoinHandle<()>>)> {
    let mut ports = StdioPorts::default();
    let mut pending = PendingStdio::default();
    let mut acceptors = Vec::new();

    let mut open_one = |slot: &mut Option<u32>| -> u32 {
        let port = state.next_stdio_port.fetch_add(1, Ordering::Relaxed);
        *slot = Some(port);
        port
    };

    if terminal {
        let port = open_one(&mut ports.console);
        let (task, rx) = accept_one(state, port).await?;
        pending.console = Some(rx);
        acceptors.push(task);
        return Ok((ports, pending, acceptors));
    }

    if request.stdin {
        let port = open_one(&mut ports.stdin);
        let (task, rx) = accept_one(state, port).await?;
        pending.stdin = Some(rx);
        acceptors.push(task);
    }
    if request.stdout {
        let port = open_one(&mut ports.stdout);
        let (task, rx) = accept_one(state, port).await?;
        pending.stdout = Some(rx);
        acceptors.push(task);
    }
    if request.stderr {
        let port = open_one(&mut ports.stderr);
        let (task, rx) = accept_one(state, port).await?;
        pending.stderr = Some(rx);
        acceptors.push(task);
    }
    Ok((ports, pending, acceptors))
}

/// Listen on `port` and hand the first accepted stream through a
/// oneshot.
async fn accept_one(
    state: &Arc<AgentState>,
    port: u32,
) -> SiloResult<(JoinHandle<()>, oneshot::Receiver<IoStream>)> {
    let mut listener = state.network.listen(port).await?;
    let (tx, rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        match listener.accept().await {
            Ok(stream) => {
                let _ = tx.send(stream);
            }
            Err(e) => trace!(port, "stdio accept ended: {}", e),
        }
    });
    Ok((task, rx))
}
