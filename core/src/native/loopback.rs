//! Loopback Backend
//!
//! In-memory native engine. A [`LoopbackControl`] plays the role of the
//! network: it injects events the worker will observe and records every call
//! the worker makes into the engine.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{
    NativeBackend, NativeError, NativeEvent, NativeSession, PeerHandle, SendFlags, SessionParams,
};

/// First handle handed out by `connect`, well away from test-chosen handles
const FIRST_CONNECT_HANDLE: u64 = 1000;

/// A send observed by the loopback engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackSend {
    pub peer: PeerHandle,
    pub channel: u8,
    pub data: Vec<u8>,
    pub flags: SendFlags,
}

#[derive(Debug, Default)]
struct LoopbackState {
    events: VecDeque<NativeEvent<Vec<u8>>>,
    sent: Vec<LoopbackSend>,
    disconnected: Vec<PeerHandle>,
    connect_requests: Vec<SocketAddr>,
    released: usize,
    sessions_created: usize,
    sessions_destroyed: usize,
    last_params: Option<SessionParams>,
    fail_create: Option<String>,
    fail_sends_to: HashSet<PeerHandle>,
    echo: bool,
    hold_connects: bool,
    next_handle: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<LoopbackState>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, event: NativeEvent<Vec<u8>>) {
        self.lock().events.push_back(event);
        self.ready.notify_all();
    }
}

/// Backend handed to the transport facade
#[derive(Debug)]
pub struct LoopbackBackend {
    shared: Arc<Shared>,
}

impl LoopbackBackend {
    pub fn new() -> (Self, LoopbackControl) {
        let shared = Arc::new(Shared::default());
        shared.lock().next_handle = FIRST_CONNECT_HANDLE;
        (
            LoopbackBackend {
                shared: shared.clone(),
            },
            LoopbackControl { shared },
        )
    }
}

impl NativeBackend for LoopbackBackend {
    type Session = LoopbackSession;

    fn create_session(&self, params: &SessionParams) -> Result<LoopbackSession, NativeError> {
        let mut state = self.shared.lock();
        state.last_params = Some(params.clone());
        if let Some(reason) = state.fail_create.take() {
            return Err(NativeError::Create(reason));
        }
        state.sessions_created += 1;
        Ok(LoopbackSession {
            shared: self.shared.clone(),
        })
    }
}

/// Session driven by the worker thread
#[derive(Debug)]
pub struct LoopbackSession {
    shared: Arc<Shared>,
}

impl NativeSession for LoopbackSession {
    type Packet = Vec<u8>;

    fn connect(&mut self, addr: SocketAddr) -> Result<PeerHandle, NativeError> {
        let peer = {
            let mut state = self.shared.lock();
            state.connect_requests.push(addr);
            let peer = PeerHandle(state.next_handle);
            state.next_handle += 1;
            peer
        };
        // The simulated remote accepts immediately unless told to stay silent.
        if !self.shared.lock().hold_connects {
            self.shared.push(NativeEvent::Connect { peer, addr });
        }
        Ok(peer)
    }

    fn poll_pending(&mut self) -> Option<NativeEvent<Vec<u8>>> {
        self.shared.lock().events.pop_front()
    }

    fn service(&mut self, timeout: Duration) -> Option<NativeEvent<Vec<u8>>> {
        let mut state = self.shared.lock();
        if state.events.is_empty() {
            state = self
                .shared
                .ready
                .wait_timeout(state, timeout)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        state.events.pop_front()
    }

    fn send(
        &mut self,
        peer: PeerHandle,
        channel: u8,
        data: &[u8],
        flags: SendFlags,
    ) -> Result<(), NativeError> {
        let mut state = self.shared.lock();
        if state.fail_sends_to.contains(&peer) {
            return Err(NativeError::Send(format!("peer {:?} unreachable", peer)));
        }
        state.sent.push(LoopbackSend {
            peer,
            channel,
            data: data.to_vec(),
            flags,
        });
        if state.echo {
            state.events.push_back(NativeEvent::Receive {
                peer,
                channel,
                packet: data.to_vec(),
            });
            self.shared.ready.notify_all();
        }
        Ok(())
    }

    fn disconnect(&mut self, peer: PeerHandle) {
        self.shared.lock().disconnected.push(peer);
        self.shared.push(NativeEvent::Disconnect { peer });
    }

    fn release(&mut self, _packet: Vec<u8>) {
        self.shared.lock().released += 1;
    }

    fn destroy(self) {
        let mut state = self.shared.lock();
        state.sessions_destroyed += 1;
        state.events.clear();
    }
}

/// Test/host side of the loopback engine
#[derive(Debug, Clone)]
pub struct LoopbackControl {
    shared: Arc<Shared>,
}

impl LoopbackControl {
    pub fn inject(&self, event: NativeEvent<Vec<u8>>) {
        self.shared.push(event);
    }

    pub fn inject_connect(&self, peer: u64, addr: SocketAddr) {
        self.inject(NativeEvent::Connect {
            peer: PeerHandle(peer),
            addr,
        });
    }

    pub fn inject_disconnect(&self, peer: u64) {
        self.inject(NativeEvent::Disconnect {
            peer: PeerHandle(peer),
        });
    }

    pub fn inject_timeout(&self, peer: u64) {
        self.inject(NativeEvent::Timeout {
            peer: PeerHandle(peer),
        });
    }

    pub fn inject_receive(&self, peer: u64, channel: u8, data: &[u8]) {
        self.inject(NativeEvent::Receive {
            peer: PeerHandle(peer),
            channel,
            packet: data.to_vec(),
        });
    }

    /// Inject several events atomically so they land in one poll pass
    pub fn inject_batch(&self, events: Vec<NativeEvent<Vec<u8>>>) {
        self.shared.lock().events.extend(events);
        self.shared.ready.notify_all();
    }

    /// Reflect every send back to the sender as a receive
    pub fn set_echo(&self, echo: bool) {
        self.shared.lock().echo = echo;
    }

    /// Leave outgoing connects unanswered, as an unreachable server would
    pub fn hold_connects(&self, hold: bool) {
        self.shared.lock().hold_connects = hold;
    }

    pub fn fail_next_create(&self, reason: &str) {
        self.shared.lock().fail_create = Some(reason.to_string());
    }

    pub fn fail_sends_to(&self, peer: u64) {
        self.shared.lock().fail_sends_to.insert(PeerHandle(peer));
    }

    pub fn sent(&self) -> Vec<LoopbackSend> {
        self.shared.lock().sent.clone()
    }

    pub fn disconnected(&self) -> Vec<PeerHandle> {
        self.shared.lock().disconnected.clone()
    }

    pub fn connect_requests(&self) -> Vec<SocketAddr> {
        self.shared.lock().connect_requests.clone()
    }

    pub fn released(&self) -> usize {
        self.shared.lock().released
    }

    pub fn sessions_created(&self) -> usize {
        self.shared.lock().sessions_created
    }

    pub fn sessions_destroyed(&self) -> usize {
        self.shared.lock().sessions_destroyed
    }

    pub fn last_params(&self) -> Option<SessionParams> {
        self.shared.lock().last_params.clone()
    }
}
