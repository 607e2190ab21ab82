//! Host-side surface of the guest agent protocol.

mod client;
mod stdio;

pub use client::AgentChannel;
pub use stdio::{InputSource, OutputSink, ProcessIo, StdioStreams};

pub(crate) use stdio::StdioPump;
