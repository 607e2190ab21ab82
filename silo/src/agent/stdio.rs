//! Stdio plumbing between user sinks and per-process vsock streams.
//!
//! Each process owns exclusive stdio streams; pumps are plain streaming
//! copies with a fixed buffer, so a slow reader back-pressures the vsock
//! stream instead of ballooning memory.

use silo_shared::IoStream;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tracing::trace;

/// Push-shaped byte sink a caller supplies for stdout/stderr.
pub type OutputSink = Box<dyn tokio::io::AsyncWrite + Send + Unpin>;

/// Pull-shaped byte source a caller supplies for stdin.
pub type InputSource = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// User-supplied stdio endpoints for one process.
#[derive(Default)]
pub struct ProcessIo {
    pub stdin: Option<InputSource>,
    pub stdout: Option<OutputSink>,
    pub stderr: Option<OutputSink>,
}

impl ProcessIo {
    pub fn null() -> ProcessIo {
        ProcessIo::default()
    }
}

/// Agent-side streams for one process, opened by the host against the
/// ports returned from `CreateProcess`.
#[derive(Default)]
pub struct StdioStreams {
    pub stdin: Option<IoStream>,
    pub stdout: Option<IoStream>,
    pub stderr: Option<IoStream>,
    /// Replaces the three pipes for terminal processes.
    pub console: Option<IoStream>,
}

/// Background forwarding tasks for one process's stdio.
pub(crate) struct StdioPump {
    /// Host → guest; may block forever on a quiet user source.
    inbound: Vec<JoinHandle<()>>,
    /// Guest → host; end when the guest closes the stream.
    outbound: Vec<JoinHandle<()>>,
}

impl StdioPump {
    /// Wire user endpoints to agent streams.
    pub(crate) fn spawn(io: ProcessIo, streams: StdioStreams) -> StdioPump {
        let mut inbound = Vec::new();
        let mut outbound = Vec::new();

        if let Some(console) = streams.console {
            let (read, write) = tokio::io::split(console);
            if let Some(stdin) = io.stdin {
                inbound.push(spawn_inbound(stdin, write));
            }
            if let Some(stdout) = io.stdout {
                outbound.push(spawn_outbound(read, stdout));
            }
        } else {
            if let (Some(stdin), Some(stream)) = (io.stdin, streams.stdin) {
                let (_, write) = tokio::io::split(stream);
                inbound.push(spawn_inbound(stdin, write));
            }
            if let (Some(stdout), Some(stream)) = (io.stdout, streams.stdout) {
                let (read, _) = tokio::io::split(stream);
                outbound.push(spawn_outbound(read, stdout));
            }
            if let (Some(stderr), Some(stream)) = (io.stderr, streams.stderr) {
                let (read, _) = tokio::io::split(stream);
                outbound.push(spawn_outbound(read, stderr));
            }
        }
        StdioPump { inbound, outbound }
    }

    /// Drain guest → host pumps (they finish at stream EOF once the
    /// process is gone), then cut the host → guest side.
    pub(crate) async fn finish(mut self) {
        for task in self.outbound.drain(..) {
            let _ = task.await;
        }
        for task in self.inbound.drain(..) {
            task.abort();
        }
    }

    pub(crate) fn abort(&mut self) {
        for task in self.inbound.drain(..).chain(self.outbound.drain(..)) {
            task.abort();
        }
    }
}

impl Drop for StdioPump {
    fn drop(&mut self) {
        self.abort();
    }
}

fn spawn_inbound(
    mut source: InputSource,
    mut sink: WriteHalf<IoStream>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::io::copy(&mut source, &mut sink).await {
            Ok(n) => trace!(bytes = n, "stdin pump finished"),
            Err(e) => trace!("stdin pump ended: {}", e),
        }
        // EOF on the user source closes the guest-side stdin.
        let _ = sink.shutdown().await;
    })
}

fn spawn_outbound(mut source: ReadHalf<IoStream>, mut sink: OutputSink) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::io::copy(&mut source, &mut sink).await {
            Ok(n) => trace!(bytes = n, "output pump finished"),
            Err(e) => trace!("output pump ended: {}", e),
        }
        let _ = sink.flush().await;
    })
}
