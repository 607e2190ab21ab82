//! The silo guest agent binary.
//!
//! Default mode serves the agent protocol over vsock from inside a VM.
//! `init-shim` mode is the tiny per-container init that reaps zombies
//! and forwards signals to the workload.

use clap::{Parser, Subcommand};
use silo_guest::{AgentOptions, AgentServer};
use silo_shared::SiloResult;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "silo-guest", about = "silo in-guest agent")]
struct Cli {
    #[command(subcommand)]
    command: Option<Mode>,
}

#[derive(Subcommand)]
enum Mode {
    /// Reap zombies and forward signals around a workload (pid 1 duty).
    InitShim {
        /// The workload command line.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Mode::InitShim { command }) => {
            let code = silo_guest::init::run(command).await;
            std::process::exit(code);
        }
        None => {
            if let Err(e) = serve().await {
                tracing::error!("agent failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}

#[cfg(target_os = "linux")]
async fn serve() -> SiloResult<()> {
    use std::sync::Arc;
    let options = AgentOptions {
        privileged: true,
        ..Default::default()
    };
    let server = AgentServer::new(options, Arc::new(vsock::VsockNetwork));
    server.serve().await
}

#[cfg(not(target_os = "linux"))]
async fn serve() -> SiloResult<()> {
    Err(silo_shared::SiloError::Unsupported(
        "the vsock agent only runs on linux guests".into(),
    ))
}

#[cfg(target_os = "linux")]
mod vsock {
    use async_trait::async_trait;
    use silo_guest::{GuestListener, GuestNetwork};
    use silo_shared::{IoStream, SiloError, SiloResult};
    use tokio_vsock::{VsockAddr, VsockListener, VMADDR_CID_ANY};

    /// Real vsock transport for in-VM deployments.
    pub struct VsockNetwork;

    #[async_trait]
    impl GuestNetwork for VsockNetwork {
        async fn listen(&self, port: u32) -> SiloResult<Box<dyn GuestListener>> {
            let listener = VsockListener::bind(VsockAddr::new(VMADDR_CID_ANY, port))
                .map_err(|e| SiloError::Io(format!("vsock bind {} failed: {}", port, e)))?;
            Ok(Box::new(Listener { listener }))
        }
    }

    struct Listener {
        listener: VsockListener,
    }

    #[async_trait]
    impl GuestListener for Listener {
        async fn accept(&mut self) -> SiloResult<IoStream> {
            let (stream, _addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| SiloError::Io(format!("vsock accept failed: {}", e)))?;
            Ok(Box::new(stream))
        }
    }
}
