//! Host side of the guest agent RPC channel.
//!
//! One vsock connection per VM carries every request/response, frames
//! multiplexed by a host-assigned id so a blocking `WaitProcess` never
//! stalls a concurrent `SignalProcess`. Both halves of the connection
//! live in dedicated tasks that hold them until explicit teardown: the
//! stream cannot be dropped between handshake and first RPC.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use silo_shared::constants::protocol::COPY_CHUNK;
use silo_shared::protocol::frame_codec;
use silo_shared::{AgentRequest, AgentResponse, Envelope, IoStream, SiloError, SiloResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use crate::sync::AsyncLock;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<AgentResponse>>>>;

/// Shared handle to one VM's agent connection.
#[derive(Clone)]
pub struct AgentChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    outbound: mpsc::Sender<Bytes>,
    pending: Pending,
    next_id: AtomicU64,
    /// Flips to true when the connection dies (VM crash or teardown).
    closed: watch::Sender<bool>,
    /// Serializes multi-frame sequences (copy-in/copy-out).
    transfer_lock: AsyncLock,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AgentChannel {
    /// Wrap an established vsock connection.
    pub fn new(stream: IoStream) -> AgentChannel {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut framed_read = FramedRead::new(read_half, frame_codec());
        let mut framed_write = FramedWrite::new(write_half, frame_codec());

        let (outbound, mut outbound_rx) = mpsc::channel::<Bytes>(64);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (closed_tx, _) = watch::channel(false);

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = framed_write.send(frame).await {
                    warn!("agent channel write failed: {}", e);
                    break;
                }
            }
            // Writer half kept alive until here; dropping it now is the
            // explicit teardown point.
        });

        let reader_pending = Arc::clone(&pending);
        let reader_closed = closed_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = framed_read.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("agent channel read failed: {}", e);
                        break;
                    }
                };
                let envelope: Envelope<AgentResponse> = match serde_json::from_slice(&frame) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("agent sent an undecodable frame: {}", e);
                        break;
                    }
                };
                let waiter = reader_pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&envelope.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(envelope.body);
                    }
                    None => trace!(id = envelope.id, "response for an abandoned request"),
                }
            }
            // Connection gone: every outstanding and future call fails.
            let _ = reader_closed.send(true);
            let drained: Vec<_> = reader_pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain()
                .collect();
            debug!(outstanding = drained.len(), "agent channel closed");
        });

        AgentChannel {
            inner: Arc::new(ChannelInner {
                outbound,
                pending,
                next_id: AtomicU64::new(1),
                closed: closed_tx,
                transfer_lock: AsyncLock::new(),
                reader: Mutex::new(Some(reader)),
                writer: Mutex::new(Some(writer)),
            }),
        }
    }

    /// True once the connection is gone.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.subscribe().borrow()
    }

    /// A receiver that observes connection death.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    /// Issue one request and await its response. Concurrent calls
    /// interleave freely; responses route by id.
    pub async fn call(&self, request: AgentRequest) -> SiloResult<AgentResponse> {
        if self.is_closed() {
            return Err(SiloError::Agent("agent connection is closed".into()));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let frame = serde_json::to_vec(&Envelope { id, body: request })?;
        if self.inner.outbound.send(Bytes::from(frame)).await.is_err() {
            self.inner
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            return Err(SiloError::Agent("agent connection is closed".into()));
        }

        let mut closed = self.closed();
        tokio::select! {
            response = rx => match response {
                Ok(response) => response.into_result(),
                Err(_) => Err(SiloError::Agent("agent connection lost".into())),
            },
            _ = closed.wait_for(|dead| *dead) => {
                Err(SiloError::Agent("agent connection lost".into()))
            }
        }
    }

    /// Issue a request whose only success shape is `Ok`.
    pub async fn call_ok(&self, request: AgentRequest) -> SiloResult<()> {
        match self.call(request).await? {
            AgentResponse::Ok => Ok(()),
            other => Err(SiloError::Internal(format!(
                "unexpected agent response: {:?}",
                other
            ))),
        }
    }

    /// Stream a host file into the guest, chunked over the channel.
    /// Size and content are preserved exactly.
    pub async fn copy_in(&self, host_path: &Path, guest_path: &Path) -> SiloResult<()> {
        let _guard = self.inner.transfer_lock.lock().await;
        let mut file = tokio::fs::File::open(host_path).await.map_err(|e| {
            SiloError::Io(format!("failed to open {}: {}", host_path.display(), e))
        })?;
        let mode = file
            .metadata()
            .await
            .map(|m| {
                use std::os::unix::fs::PermissionsExt;
                m.permissions().mode() & 0o7777
            })
            .unwrap_or(0o644);

        self.call_ok(AgentRequest::CopyInBegin {
            path: guest_path.to_path_buf(),
            mode,
        })
        .await?;
        let mut buf = vec![0u8; COPY_CHUNK];
        loop {
            let n = file.read(&mut buf).await.map_err(|e| {
                SiloError::Io(format!(
                    "failed to read data for {}: {}",
                    host_path.display(),
                    e
                ))
            })?;
            if n == 0 {
                break;
            }
            self.call_ok(AgentRequest::CopyInChunk {
                data: buf[..n].to_vec(),
            })
            .await?;
        }
        self.call_ok(AgentRequest::CopyInEnd).await
    }

    /// Stream a guest file out to a host path.
    pub async fn copy_out(&self, guest_path: &Path, host_path: &Path) -> SiloResult<()> {
        let _guard = self.inner.transfer_lock.lock().await;
        let expected = match self
            .call(AgentRequest::CopyOutBegin {
                path: guest_path.to_path_buf(),
            })
            .await?
        {
            AgentResponse::CopySize { size } => size,
            other => {
                return Err(SiloError::Internal(format!(
                    "unexpected agent response: {:?}",
                    other
                )))
            }
        };

        let mut file = tokio::fs::File::create(host_path).await.map_err(|e| {
            SiloError::Io(format!("failed to create {}: {}", host_path.display(), e))
        })?;
        let mut written = 0u64;
        loop {
            match self.call(AgentRequest::CopyOutChunk).await? {
                AgentResponse::Data { data, eof } => {
                    written += data.len() as u64;
                    file.write_all(&data).await.map_err(|e| {
                        SiloError::Io(format!(
                            "failed to write {}: {}",
                            host_path.display(),
                            e
                        ))
                    })?;
                    if eof {
                        break;
                    }
                }
                other => {
                    return Err(SiloError::Internal(format!(
                        "unexpected agent response: {:?}",
                        other
                    )))
                }
            }
        }
        file.flush().await.map_err(|e| SiloError::Io(e.to_string()))?;
        if written != expected {
            return Err(SiloError::Io(format!(
                "short copy from {}: {} of {} bytes",
                guest_path.display(),
                written,
                expected
            )));
        }
        Ok(())
    }

    /// Explicit teardown: best-effort shutdown call, then drop both
    /// connection halves.
    pub async fn close(&self) {
        let _ = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            self.call_ok(AgentRequest::Shutdown),
        )
        .await;
        let _ = self.inner.closed.send(true);
        if let Some(task) = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        if let Some(task) = self
            .inner
            .writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        // Last handle gone: stop the tasks holding the connection halves.
        if let Some(task) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        if let Some(task) = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}
