//! In-memory vsock-shaped network for embedding the agent.
//!
//! Ports map to mpsc channels of duplex streams. A loopback VM provider
//! listens with the agent on one side and connects from the host side;
//! the byte-stream semantics match a vsock connection closely enough
//! that the whole protocol stack runs unchanged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use silo_shared::{IoStream, SiloError, SiloResult};
use tokio::sync::mpsc;

use crate::server::{GuestListener, GuestNetwork};

/// Buffer size of each in-memory connection.
const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Default)]
struct Ports {
    bound: HashMap<u32, mpsc::Sender<IoStream>>,
}

/// An in-process "vsock" with host and guest ends.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    ports: Arc<Mutex<Ports>>,
}

impl MemoryNetwork {
    pub fn new() -> MemoryNetwork {
        MemoryNetwork::default()
    }

    /// Host-side connect to a bound port.
    pub async fn connect(&self, port: u32) -> SiloResult<IoStream> {
        let sender = {
            let ports = self.ports.lock().unwrap_or_else(|e| e.into_inner());
            ports.bound.get(&port).cloned()
        };
        let Some(sender) = sender else {
            return Err(SiloError::NotFound(format!("no listener on port {}", port)));
        };
        let (host_end, guest_end) = tokio::io::duplex(PIPE_CAPACITY);
        sender
            .send(Box::new(guest_end))
            .await
            .map_err(|_| SiloError::NotFound(format!("listener on port {} is gone", port)))?;
        Ok(Box::new(host_end))
    }
}

#[async_trait]
impl GuestNetwork for MemoryNetwork {
    async fn listen(&self, port: u32) -> SiloResult<Box<dyn GuestListener>> {
        let (tx, rx) = mpsc::channel(16);
        let mut ports = self.ports.lock().unwrap_or_else(|e| e.into_inner());
        if ports.bound.insert(port, tx).is_some() {
            return Err(SiloError::InvalidState(format!(
                "port {} already bound",
                port
            )));
        }
        Ok(Box::new(MemoryListener { rx }))
    }
}

struct MemoryListener {
    rx: mpsc::Receiver<IoStream>,
}

#[async_trait]
impl GuestListener for MemoryListener {
    async fn accept(&mut self) -> SiloResult<IoStream> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| SiloError::Internal("memory network torn down".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let network = MemoryNetwork::new();
        let mut listener = network.listen(1024).await.unwrap();

        let accept = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(b"pong").await.unwrap();
            buf
        });

        let mut stream = network.connect(1024).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();

        assert_eq!(&accept.await.unwrap(), b"ping");
        assert_eq!(&reply, b"pong");
    }

    #[tokio::test]
    async fn test_connect_unbound_port_fails() {
        let network = MemoryNetwork::new();
        assert!(network.connect(9).await.is_err());
    }
}
