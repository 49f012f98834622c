//! Networking primitives for meshsub
//!
//! This crate provides:
//! - The [`Transport`] seam the pub/sub node talks through
//! - Length-prefixed message framing
//! - An in-process [`MemoryNetwork`] for tests and single-process clusters
//! - A TCP transport for daemons

pub mod framing;
pub mod memory;
pub mod peer;
pub mod tcp;
pub mod transport;

pub use framing::{Frame, FrameCodec, FrameError, FrameType};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use peer::{Hello, KnownPeer, PeerInfo};
pub use tcp::TcpTransport;
pub use transport::{Transport, TransportError, TransportEvent};
