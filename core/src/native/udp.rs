//! UDP Backend
//!
//! Best-effort datagram engine over a single UDP socket. It provides the
//! session/event shape the worker expects: a Connect/Accept handshake,
//! keep-alives, idle timeouts, and stale-packet filtering for sequenced
//! channels. There is no retransmission; hosts that need real reliability
//! plug in a reliable engine behind the same traits.
//!
//! Frame layout:
//! Flags (1) | Session ID (8) | Sequence (8) | Channel (1) | Payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};
use thiserror::Error;

use super::{
    NativeBackend, NativeError, NativeEvent, NativeSession, PeerHandle, SendFlags, SessionParams,
};

/// Largest datagram we accept off the wire
const MAX_DATAGRAM: usize = 65_535;

/// Datagrams read per `service` call after the first one
const MAX_BATCH: usize = 256;

/// Frame kinds (low nibble of the flags byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Connect = 0x00,
    Accept = 0x01,
    Data = 0x02,
    KeepAlive = 0x04,
    Close = 0x05,
}

impl FrameKind {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte & 0x0F {
            0x00 => Some(FrameKind::Connect),
            0x01 => Some(FrameKind::Accept),
            0x02 => Some(FrameKind::Data),
            0x04 => Some(FrameKind::KeepAlive),
            0x05 => Some(FrameKind::Close),
            _ => None,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame data incomplete")]
    Incomplete,
    #[error("Invalid frame kind: {0:#x}")]
    InvalidKind(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub flags: SendFlags,
    pub session: u64,
    pub sequence: u64,
    pub channel: u8,
    pub payload: Bytes,
}

impl Frame {
    pub const HEADER_SIZE: usize = 1 + 8 + 8 + 1;

    fn control(kind: FrameKind, session: u64) -> Self {
        Frame {
            kind,
            flags: SendFlags::NONE,
            session,
            sequence: 0,
            channel: 0,
            payload: Bytes::new(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(Self::HEADER_SIZE + self.payload.len());
        buf.put_u8(self.kind as u8 | (self.flags.bits() << 4));
        buf.put_u64_le(self.session);
        buf.put_u64_le(self.sequence);
        buf.put_u8(self.channel);
        buf.put_slice(&self.payload);
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.remaining() < Self::HEADER_SIZE {
            return Err(FrameError::Incomplete);
        }
        let flags = buf.get_u8();
        let kind = FrameKind::from_u8(flags).ok_or(FrameError::InvalidKind(flags))?;
        let session = buf.get_u64_le();
        let sequence = buf.get_u64_le();
        let channel = buf.get_u8();
        Ok(Frame {
            kind,
            flags: SendFlags::from_bits(flags >> 4),
            session,
            sequence,
            channel,
            payload: buf,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Connecting,
    Connected,
}

#[derive(Debug)]
struct UdpPeer {
    addr: SocketAddr,
    state: PeerState,
    next_seq: u64,
    /// Highest sequence seen per channel, for stale filtering
    last_seq: Vec<Option<u64>>,
    last_activity: Instant,
    last_sent: Instant,
}

impl UdpPeer {
    fn new(addr: SocketAddr, state: PeerState, channels: usize) -> Self {
        let now = Instant::now();
        UdpPeer {
            addr,
            state,
            next_seq: 0,
            last_seq: vec![None; channels],
            last_activity: now,
            last_sent: now,
        }
    }

    fn alloc_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Returns false for a sequenced packet older than one already seen
    fn accept_sequence(&mut self, channel: usize, seq: u64, flags: SendFlags) -> bool {
        if flags.is_unsequenced() {
            return true;
        }
        let Some(slot) = self.last_seq.get_mut(channel) else {
            return false;
        };
        match *slot {
            Some(last) if seq <= last => false,
            _ => {
                *slot = Some(seq);
                true
            }
        }
    }
}

/// Factory for UDP sessions
#[derive(Debug, Clone)]
pub struct UdpBackend {
    pub keepalive: Duration,
    pub timeout: Duration,
}

impl Default for UdpBackend {
    fn default() -> Self {
        UdpBackend {
            keepalive: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        }
    }
}

fn bind_with_reuse(addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

impl NativeBackend for UdpBackend {
    type Session = UdpSession;

    fn create_session(&self, params: &SessionParams) -> Result<UdpSession, NativeError> {
        let addr = params
            .bind
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let socket = bind_with_reuse(addr).map_err(NativeError::Bind)?;
        tracing::debug!("UDP session bound to {:?}", socket.local_addr());

        Ok(UdpSession {
            socket,
            max_peers: params.max_peers,
            channel_count: params.channel_count,
            peers: HashMap::new(),
            pending: VecDeque::new(),
            recv_buf: vec![0u8; MAX_DATAGRAM],
            keepalive: self.keepalive,
            timeout: self.timeout,
            blocking_lost: false,
        })
    }
}

/// Live UDP session. Peer handles are the random session ids carried in every
/// frame.
#[derive(Debug)]
pub struct UdpSession {
    socket: UdpSocket,
    max_peers: usize,
    channel_count: usize,
    peers: HashMap<PeerHandle, UdpPeer>,
    pending: VecDeque<NativeEvent<Bytes>>,
    recv_buf: Vec<u8>,
    keepalive: Duration,
    timeout: Duration,
    /// Socket could not be put back into blocking mode after a batch read
    blocking_lost: bool,
}

impl UdpSession {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn send_frame(&self, frame: &Frame, to: SocketAddr) -> io::Result<()> {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        self.socket.send_to(&buf, to)?;
        Ok(())
    }

    fn send_control(&self, kind: FrameKind, session: u64, to: SocketAddr) {
        if let Err(e) = self.send_frame(&Frame::control(kind, session), to) {
            tracing::debug!("Failed to send {:?} to {}: {}", kind, to, e);
        }
    }

    /// Timeouts, handshake retries and keep-alives
    fn maintain(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut due = Vec::new();

        for (&handle, peer) in self.peers.iter_mut() {
            if now.duration_since(peer.last_activity) > self.timeout {
                expired.push(handle);
            } else if now.duration_since(peer.last_sent) >= self.keepalive {
                let kind = match peer.state {
                    PeerState::Connecting => FrameKind::Connect,
                    PeerState::Connected => FrameKind::KeepAlive,
                };
                peer.last_sent = now;
                due.push((kind, handle, peer.addr));
            }
        }

        for (kind, handle, addr) in due {
            self.send_control(kind, handle.0, addr);
        }
        for handle in expired {
            if let Some(peer) = self.peers.remove(&handle) {
                tracing::debug!("Peer {} timed out", peer.addr);
                self.pending.push_back(NativeEvent::Timeout { peer: handle });
            }
        }
    }

    fn recv_one(&mut self) -> io::Result<()> {
        let (len, from) = self.socket.recv_from(&mut self.recv_buf)?;
        let data = Bytes::copy_from_slice(&self.recv_buf[..len]);
        match Frame::decode(data) {
            Ok(frame) => self.handle_frame(frame, from),
            Err(e) => tracing::trace!("Dropping malformed datagram from {}: {}", from, e),
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame, from: SocketAddr) {
        let handle = PeerHandle(frame.session);

        if frame.kind == FrameKind::Connect {
            match self.peers.get(&handle) {
                Some(peer) if peer.addr == from => {
                    self.send_control(FrameKind::Accept, frame.session, from);
                }
                Some(_) => tracing::debug!("Session id collision from {}", from),
                None if self.peers.len() >= self.max_peers => {
                    tracing::debug!("Refusing {}: peer limit reached", from);
                    self.send_control(FrameKind::Close, frame.session, from);
                }
                None => {
                    self.peers.insert(
                        handle,
                        UdpPeer::new(from, PeerState::Connected, self.channel_count),
                    );
                    self.send_control(FrameKind::Accept, frame.session, from);
                    self.pending.push_back(NativeEvent::Connect {
                        peer: handle,
                        addr: from,
                    });
                }
            }
            return;
        }

        let Some(peer) = self.peers.get_mut(&handle).filter(|p| p.addr == from) else {
            if frame.kind == FrameKind::Data {
                self.send_control(FrameKind::Close, frame.session, from);
            }
            return;
        };
        peer.last_activity = Instant::now();

        match frame.kind {
            FrameKind::Accept => {
                if peer.state == PeerState::Connecting {
                    peer.state = PeerState::Connected;
                    self.pending.push_back(NativeEvent::Connect {
                        peer: handle,
                        addr: from,
                    });
                }
            }
            FrameKind::Data => {
                if peer.state != PeerState::Connected {
                    return;
                }
                let channel = frame.channel as usize;
                if !peer.accept_sequence(channel, frame.sequence, frame.flags) {
                    tracing::trace!("Discarding stale packet {} on channel {}", frame.sequence, channel);
                    return;
                }
                self.pending.push_back(NativeEvent::Receive {
                    peer: handle,
                    channel: frame.channel,
                    packet: frame.payload,
                });
            }
            FrameKind::Close => {
                self.peers.remove(&handle);
                self.pending.push_back(NativeEvent::Disconnect { peer: handle });
            }
            FrameKind::KeepAlive | FrameKind::Connect => {}
        }
    }
}

impl NativeSession for UdpSession {
    type Packet = Bytes;

    fn connect(&mut self, addr: SocketAddr) -> Result<PeerHandle, NativeError> {
        if self.peers.len() >= self.max_peers {
            return Err(NativeError::PeerLimit(self.max_peers));
        }
        let mut session: u64 = rand::random();
        while session == 0 || self.peers.contains_key(&PeerHandle(session)) {
            session = rand::random();
        }
        let handle = PeerHandle(session);

        self.send_frame(&Frame::control(FrameKind::Connect, session), addr)
            .map_err(|_| NativeError::Connect(addr))?;
        self.peers.insert(
            handle,
            UdpPeer::new(addr, PeerState::Connecting, self.channel_count),
        );
        Ok(handle)
    }

    fn poll_pending(&mut self) -> Option<NativeEvent<Bytes>> {
        self.pending.pop_front()
    }

    fn service(&mut self, timeout: Duration) -> Option<NativeEvent<Bytes>> {
        self.maintain();
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }

        // A zero read timeout means "block forever" for std sockets.
        let wait = timeout.max(Duration::from_millis(1));
        if self.blocking_lost && self.socket.set_nonblocking(false).is_ok() {
            tracing::info!("Blocking mode restored, batch reads enabled");
            self.blocking_lost = false;
        }
        if let Err(e) = self.socket.set_read_timeout(Some(wait)) {
            tracing::warn!("Failed to set read timeout: {}", e);
            return None;
        }
        match self.recv_one() {
            Ok(()) => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                if self.blocking_lost {
                    // Nonblocking socket ignores the read timeout; wait it out here.
                    std::thread::sleep(wait);
                }
                return None;
            }
            Err(e) => {
                tracing::debug!("Recv error: {}", e);
                return self.pending.pop_front();
            }
        }

        if !self.blocking_lost && self.socket.set_nonblocking(true).is_ok() {
            for _ in 0..MAX_BATCH {
                if self.recv_one().is_err() {
                    break;
                }
            }
            if let Err(e) = self.socket.set_nonblocking(false) {
                tracing::warn!("Failed to restore blocking mode, batch reads disabled: {}", e);
                self.blocking_lost = true;
            }
        }
        self.pending.pop_front()
    }

    fn send(
        &mut self,
        peer: PeerHandle,
        channel: u8,
        data: &[u8],
        flags: SendFlags,
    ) -> Result<(), NativeError> {
        if channel as usize >= self.channel_count {
            return Err(NativeError::Send(format!("invalid channel {}", channel)));
        }
        let state = self
            .peers
            .get_mut(&peer)
            .filter(|p| p.state == PeerState::Connected)
            .ok_or(NativeError::UnknownPeer(peer))?;
        let sequence = state.alloc_seq();
        state.last_sent = Instant::now();
        let addr = state.addr;

        let frame = Frame {
            kind: FrameKind::Data,
            flags,
            session: peer.0,
            sequence,
            channel,
            payload: Bytes::copy_from_slice(data),
        };
        self.send_frame(&frame, addr)?;
        Ok(())
    }

    fn disconnect(&mut self, peer: PeerHandle) {
        if let Some(state) = self.peers.remove(&peer) {
            self.send_control(FrameKind::Close, peer.0, state.addr);
            self.pending.push_back(NativeEvent::Disconnect { peer });
        }
    }

    fn release(&mut self, _packet: Bytes) {}

    fn destroy(self) {
        for (handle, peer) in &self.peers {
            self.send_control(FrameKind::Close, handle.0, peer.addr);
        }
        tracing::debug!("UDP session destroyed");
    }
}
