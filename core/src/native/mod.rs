//! Native Engine Seam
//!
//! The reliable-UDP engine is an external collaborator reached through a
//! narrow session/event API. Peer handles never leave the worker thread; the
//! rest of the crate only sees `ConnectionId`s.

pub mod loopback;
pub mod udp;

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use loopback::{LoopbackBackend, LoopbackControl, LoopbackSend};
pub use udp::{UdpBackend, UdpSession};

/// Engine-owned token identifying a peer inside the native layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle(pub u64);

/// Per-send delivery flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendFlags(u8);

impl SendFlags {
    pub const NONE: SendFlags = SendFlags(0);
    pub const RELIABLE: SendFlags = SendFlags(0x01);
    pub const UNSEQUENCED: SendFlags = SendFlags(0x02);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        SendFlags(bits & 0x03)
    }

    pub fn is_reliable(self) -> bool {
        self.0 & Self::RELIABLE.0 != 0
    }

    pub fn is_unsequenced(self) -> bool {
        self.0 & Self::UNSEQUENCED.0 != 0
    }
}

/// Parameters for creating a native session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// Local bind address; `None` for an outbound-only (client) session
    pub bind: Option<SocketAddr>,
    pub max_peers: usize,
    pub channel_count: usize,
}

/// Event produced by a native session. Receive payloads stay owned by the
/// engine until handed back through [`NativeSession::release`].
#[derive(Debug)]
pub enum NativeEvent<P> {
    Connect { peer: PeerHandle, addr: SocketAddr },
    Disconnect { peer: PeerHandle },
    Timeout { peer: PeerHandle },
    Receive {
        peer: PeerHandle,
        channel: u8,
        packet: P,
    },
}

#[derive(Error, Debug)]
pub enum NativeError {
    #[error("Failed to bind: {0}")]
    Bind(#[source] std::io::Error),
    #[error("Failed to connect to {0}")]
    Connect(SocketAddr),
    #[error("Unknown peer {0:?}")]
    UnknownPeer(PeerHandle),
    #[error("Peer limit of {0} reached")]
    PeerLimit(usize),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Session creation failed: {0}")]
    Create(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Factory for native sessions. Shared with the worker thread, which creates
/// and owns the session for the whole run.
pub trait NativeBackend: Send + Sync + 'static {
    type Session: NativeSession;

    fn create_session(&self, params: &SessionParams) -> Result<Self::Session, NativeError>;
}

/// A live native session; used from the worker thread only
pub trait NativeSession {
    /// Engine-owned receive payload
    type Packet: AsRef<[u8]>;

    /// Start connecting to a remote host. Completion is reported as a
    /// `Connect` event.
    fn connect(&mut self, addr: SocketAddr) -> Result<PeerHandle, NativeError>;

    /// Return an already-queued event without waiting
    fn poll_pending(&mut self) -> Option<NativeEvent<Self::Packet>>;

    /// Wait up to `timeout` for the next event
    fn service(&mut self, timeout: Duration) -> Option<NativeEvent<Self::Packet>>;

    fn send(
        &mut self,
        peer: PeerHandle,
        channel: u8,
        data: &[u8],
        flags: SendFlags,
    ) -> Result<(), NativeError>;

    fn disconnect(&mut self, peer: PeerHandle);

    /// Hand a receive payload back to the engine
    fn release(&mut self, packet: Self::Packet);

    /// Tear the session down, releasing every native resource
    fn destroy(self);
}
