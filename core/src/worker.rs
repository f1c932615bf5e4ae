//! Transport Worker
//!
//! One background thread per active role. The worker owns the native session
//! and the connection registry, and talks to the facade exclusively through
//! the queue fabric.
//!
//! State machine: `Idle -> Starting -> Running -> Stopping -> Stopped`, with
//! `Starting -> Stopped` when the session cannot be created.
//!
//! Each iteration while running:
//! 1. flush the Outgoing queue into the native engine
//! 2. apply pending commands (kick, stats, stop)
//! 3. service the native engine for one bounded wait and translate its events

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::channel::ChannelPolicy;
use crate::config::TransportConfig;
use crate::native::{NativeBackend, NativeEvent, NativeSession, PeerHandle, SessionParams};
use crate::pool::{BufferPool, PoolStats};
use crate::queue::{Command, ConnectionEvent, IncomingData, PushError, WorkerEnds};
use crate::registry::{ConnectionId, ConnectionRegistry, RegisterRefused};

/// Which side of the connection this worker drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Listen on `bind` and accept up to `max_connections` peers
    Server { bind: SocketAddr },
    /// Connect to a single remote server
    Client { remote: SocketAddr },
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Server { .. } => "server",
            Role::Client { .. } => "client",
        }
    }
}

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Starting,
            2 => WorkerState::Running,
            3 => WorkerState::Stopping,
            4 => WorkerState::Stopped,
            _ => WorkerState::Idle,
        }
    }
}

/// Worker state readable from any thread
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: WorkerState) -> Self {
        StateCell(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        StateCell::new(WorkerState::Idle)
    }
}

/// Counters reported in response to a stats request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub connections: usize,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub send_failures: u64,
    pub oversized_dropped: u64,
    pub unknown_peer_kicks: u64,
    pub incoming_dropped: u64,
    pub pool: PoolStats,
}

/// Per-run settings derived from `TransportConfig`
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub policy: ChannelPolicy,
    pub max_packet_size: usize,
    pub poll_wait: Duration,
    pub max_connections: usize,
    pub max_events_per_poll: usize,
    pub max_outgoing_per_pass: usize,
}

impl WorkerSettings {
    pub fn from_config(config: &TransportConfig, policy: ChannelPolicy) -> Self {
        WorkerSettings {
            policy,
            max_packet_size: config.max_packet_size,
            poll_wait: config.poll_wait(),
            max_connections: config.max_connections,
            max_events_per_poll: config.max_events_per_poll,
            max_outgoing_per_pass: config.outgoing_capacity,
        }
    }
}

/// Everything the worker thread takes ownership of
#[derive(Debug)]
pub struct WorkerContext {
    pub role: Role,
    pub settings: WorkerSettings,
    pub pool: BufferPool,
    pub queues: WorkerEnds,
    pub shutdown: Arc<AtomicBool>,
    pub state: Arc<StateCell>,
}

/// Thread entry point: start, run until told to stop, tear down.
pub fn run_worker<B: NativeBackend>(backend: Arc<B>, ctx: WorkerContext) {
    let span = tracing::info_span!("worker", role = ctx.role.name());
    let _enter = span.enter();

    if let Some(mut worker) = TransportWorker::start(backend.as_ref(), ctx) {
        worker.run();
        worker.shutdown();
    }
}

pub struct TransportWorker<S: NativeSession> {
    role: Role,
    settings: WorkerSettings,
    session: S,
    registry: ConnectionRegistry,
    pool: BufferPool,
    queues: WorkerEnds,
    shutdown: Arc<AtomicBool>,
    state: Arc<StateCell>,
    stats: WorkerStats,
    /// Client handshake still in flight
    connecting: Option<PeerHandle>,
}

impl<S: NativeSession> TransportWorker<S> {
    /// Create the native session. On failure the facade gets a `StartFailed`
    /// notice and the state ends at `Stopped`.
    pub fn start<B>(backend: &B, ctx: WorkerContext) -> Option<Self>
    where
        B: NativeBackend<Session = S>,
    {
        ctx.state.store(WorkerState::Starting);

        let params = match ctx.role {
            Role::Server { bind } => SessionParams {
                bind: Some(bind),
                max_peers: ctx.settings.max_connections,
                channel_count: ctx.settings.policy.len(),
            },
            Role::Client { .. } => SessionParams {
                bind: None,
                max_peers: 1,
                channel_count: ctx.settings.policy.len(),
            },
        };

        let fail = |ctx: WorkerContext, reason: String| {
            tracing::error!("Start failed: {}", reason);
            ctx.queues.push_event(ConnectionEvent::StartFailed(reason));
            ctx.queues.push_event(ConnectionEvent::Stopped);
            ctx.state.store(WorkerState::Stopped);
        };

        let mut session = match backend.create_session(&params) {
            Ok(session) => session,
            Err(e) => {
                fail(ctx, e.to_string());
                return None;
            }
        };

        let mut connecting = None;
        if let Role::Client { remote } = ctx.role {
            match session.connect(remote) {
                Ok(handle) => connecting = Some(handle),
                Err(e) => {
                    session.destroy();
                    fail(ctx, e.to_string());
                    return None;
                }
            }
            tracing::info!("Connecting to {}", remote);
        }

        let registry = ConnectionRegistry::new(params.max_peers);
        ctx.state.store(WorkerState::Running);
        tracing::info!("Worker running with {} channels", params.channel_count);

        Some(TransportWorker {
            role: ctx.role,
            settings: ctx.settings,
            session,
            registry,
            pool: ctx.pool,
            queues: ctx.queues,
            shutdown: ctx.shutdown,
            state: ctx.state,
            stats: WorkerStats::default(),
            connecting,
        })
    }

    pub fn run(&mut self) {
        while !self.shutdown.load(Ordering::Acquire) {
            if !self.step() {
                break;
            }
        }
    }

    /// One loop iteration. Returns false when a stop was requested.
    pub fn step(&mut self) -> bool {
        self.flush_outgoing();
        if !self.apply_commands() {
            return false;
        }
        self.poll_native();
        true
    }

    /// Final flush, disconnect everyone, destroy the session.
    pub fn shutdown(mut self) {
        self.state.store(WorkerState::Stopping);
        tracing::info!("Worker stopping");

        self.flush_outgoing();
        for record in self.registry.drain() {
            tracing::debug!("Disconnecting {} ({})", record.id, record.addr);
            self.session.disconnect(record.handle);
            self.queues
                .push_event(ConnectionEvent::Disconnected { id: record.id });
        }
        // Anything still queued natively is released before teardown.
        while let Some(event) = self.session.poll_pending() {
            if let NativeEvent::Receive { packet, .. } = event {
                self.session.release(packet);
            }
        }
        self.session.destroy();

        self.queues.push_event(ConnectionEvent::Stopped);
        self.state.store(WorkerState::Stopped);
        tracing::info!("Worker stopped");
    }

    fn flush_outgoing(&mut self) {
        for _ in 0..self.settings.max_outgoing_per_pass {
            let Some(item) = self.queues.pop_outgoing() else {
                break;
            };

            let Some(handle) = self.registry.resolve(item.id) else {
                tracing::trace!("Dropping send to departed connection {}", item.id);
                continue;
            };
            let mode = match self.settings.policy.lookup(item.channel) {
                Ok(mode) => mode,
                Err(e) => {
                    tracing::warn!("Dropping send to {}: {}", item.id, e);
                    continue;
                }
            };

            match self
                .session
                .send(handle, item.channel, &item.buffer, mode.flags())
            {
                Ok(()) => {
                    self.stats.packets_sent += 1;
                    self.stats.bytes_sent += item.buffer.len() as u64;
                }
                Err(e) => {
                    self.stats.send_failures += 1;
                    tracing::warn!("Send to {} failed: {}", item.id, e);
                }
            }
        }
    }

    fn apply_commands(&mut self) -> bool {
        loop {
            match self.queues.pop_command() {
                Ok(Some(Command::Kick(id))) => self.kick(id),
                Ok(Some(Command::Stats)) => {
                    let stats = self.snapshot();
                    self.queues.push_event(ConnectionEvent::Stats(stats));
                }
                Ok(Some(Command::Stop)) => return false,
                Ok(None) => return true,
                Err(_) => {
                    tracing::debug!("Facade dropped its queues, stopping");
                    return false;
                }
            }
        }
    }

    fn kick(&mut self, id: ConnectionId) {
        let Some(handle) = self.registry.resolve(id) else {
            tracing::debug!("Kick for unknown connection {}", id);
            return;
        };
        self.registry.on_disconnect(handle);
        self.session.disconnect(handle);
        tracing::info!("Kicked {}", id);
        self.queues.push_event(ConnectionEvent::Disconnected { id });
    }

    fn poll_native(&mut self) {
        let mut next = match self.session.poll_pending() {
            Some(event) => Some(event),
            None => self.session.service(self.settings.poll_wait),
        };

        let mut handled = 0;
        while let Some(event) = next {
            self.handle_event(event);
            handled += 1;
            if handled >= self.settings.max_events_per_poll {
                break;
            }
            next = self.session.poll_pending();
        }
    }

    fn handle_event(&mut self, event: NativeEvent<S::Packet>) {
        match event {
            NativeEvent::Connect { peer, addr } => self.on_connect(peer, addr),
            NativeEvent::Disconnect { peer } | NativeEvent::Timeout { peer } => {
                if let Some(id) = self.registry.on_disconnect(peer) {
                    tracing::info!("Connection {} closed", id);
                    self.queues.push_event(ConnectionEvent::Disconnected { id });
                } else if self.connecting == Some(peer) {
                    self.connect_failed();
                } else {
                    tracing::debug!("Close for unregistered peer {:?} ignored", peer);
                }
            }
            NativeEvent::Receive {
                peer,
                channel,
                packet,
            } => self.on_receive(peer, channel, packet),
        }
    }

    fn connect_failed(&mut self) {
        self.connecting = None;
        if let Role::Client { remote } = self.role {
            tracing::warn!("Handshake with {} failed, no connection", remote);
            self.queues
                .push_event(ConnectionEvent::ConnectFailed { addr: remote });
        }
    }

    fn on_connect(&mut self, peer: PeerHandle, addr: SocketAddr) {
        if self.connecting == Some(peer) {
            self.connecting = None;
        }
        match self.registry.on_connect(peer, addr) {
            Ok(id) => {
                tracing::info!("Connection {} from {}", id, addr);
                self.queues.push_event(ConnectionEvent::Connected { id, addr });
            }
            Err(RegisterRefused::Duplicate(id)) => {
                tracing::warn!("Duplicate connect for {} ignored", id);
            }
            Err(RegisterRefused::Full) => {
                tracing::warn!("Refusing {}: connection limit reached", addr);
                self.session.disconnect(peer);
            }
        }
    }

    fn on_receive(&mut self, peer: PeerHandle, channel: u8, packet: S::Packet) {
        let Some(id) = self.registry.lookup_handle(peer) else {
            tracing::warn!("Data from unregistered peer {:?}, kicking", peer);
            self.session.release(packet);
            self.session.disconnect(peer);
            self.stats.unknown_peer_kicks += 1;
            return;
        };

        let len = packet.as_ref().len();
        if len > self.settings.max_packet_size {
            tracing::warn!(
                "Dropping {} byte packet from {} (max {})",
                len,
                id,
                self.settings.max_packet_size
            );
            self.session.release(packet);
            self.stats.oversized_dropped += 1;
            return;
        }
        if let Err(e) = self.settings.policy.lookup(channel) {
            tracing::warn!("Dropping packet from {}: {}", id, e);
            self.session.release(packet);
            return;
        }

        let buffer = self.pool.copy_from(packet.as_ref());
        self.session.release(packet);

        match self.queues.push_data(IncomingData {
            id,
            channel,
            buffer,
        }) {
            Ok(()) => {
                self.stats.packets_received += 1;
                self.stats.bytes_received += len as u64;
                tracing::trace!("Received {} bytes from {} on channel {}", len, id, channel);
            }
            Err(PushError::Full) => {
                self.stats.incoming_dropped += 1;
                tracing::warn!("Incoming queue full, dropping packet from {}", id);
            }
            Err(PushError::Closed) => {
                tracing::debug!("Facade gone, dropping packet from {}", id);
            }
        }
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            connections: self.registry.len(),
            pool: self.pool.stats(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{LoopbackBackend, LoopbackControl, SendFlags};
    use crate::pool::PooledBuffer;
    use crate::queue::{fabric, FacadeEnds, Outgoing};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    struct Harness {
        worker: Option<TransportWorker<crate::native::loopback::LoopbackSession>>,
        facade: FacadeEnds,
        control: LoopbackControl,
        pool: BufferPool,
        state: Arc<StateCell>,
    }

    fn harness_with(role: Role, config: TransportConfig) -> Harness {
        let (backend, control) = LoopbackBackend::new();
        harness_on(backend, control, role, config)
    }

    fn harness_on(
        backend: LoopbackBackend,
        control: LoopbackControl,
        role: Role,
        config: TransportConfig,
    ) -> Harness {
        let pool = config.build_pool();
        let (facade, queues) = fabric(config.outgoing_capacity, config.incoming_capacity);
        let state = Arc::new(StateCell::default());
        let ctx = WorkerContext {
            role,
            settings: WorkerSettings::from_config(&config, config.channel_policy().unwrap()),
            pool: pool.clone(),
            queues,
            shutdown: Arc::new(AtomicBool::new(false)),
            state: state.clone(),
        };
        let worker = TransportWorker::start(&backend, ctx);
        Harness {
            worker,
            facade,
            control,
            pool,
            state,
        }
    }

    fn server() -> Harness {
        harness_with(
            Role::Server { bind: addr(7000) },
            TransportConfig {
                max_packet_size: 8,
                ..TransportConfig::default()
            },
        )
    }

    impl Harness {
        fn step(&mut self) -> bool {
            self.worker.as_mut().unwrap().step()
        }

        fn send(&self, id: u64, channel: u8, data: &[u8]) {
            self.facade
                .push_outgoing(Outgoing {
                    id: ConnectionId(id),
                    channel,
                    buffer: self.pool.copy_from(data),
                })
                .unwrap();
        }

        fn events(&mut self) -> Vec<ConnectionEvent> {
            std::iter::from_fn(|| self.facade.pop_event()).collect()
        }

        fn data(&mut self) -> Vec<(u64, u8, PooledBuffer)> {
            std::iter::from_fn(|| self.facade.pop_data())
                .map(|d| (d.id.0, d.channel, d.buffer))
                .collect()
        }
    }

    #[test]
    fn test_start_failure_reported() {
        let (backend, control) = LoopbackBackend::new();
        control.fail_next_create("address in use");
        let config = TransportConfig::default();
        let (mut facade, queues) = fabric(4, 4);
        let state = Arc::new(StateCell::default());
        let ctx = WorkerContext {
            role: Role::Server { bind: addr(1) },
            settings: WorkerSettings::from_config(&config, config.channel_policy().unwrap()),
            pool: config.build_pool(),
            queues,
            shutdown: Arc::new(AtomicBool::new(false)),
            state: state.clone(),
        };

        assert!(TransportWorker::start(&backend, ctx).is_none());
        assert_eq!(state.load(), WorkerState::Stopped);
        assert!(matches!(
            facade.pop_event(),
            Some(ConnectionEvent::StartFailed(reason)) if reason.contains("address in use")
        ));
        assert_eq!(facade.pop_event(), Some(ConnectionEvent::Stopped));
    }

    #[test]
    fn test_session_params_per_role() {
        let h = server();
        assert_eq!(h.state.load(), WorkerState::Running);
        assert_eq!(
            h.control.last_params(),
            Some(SessionParams {
                bind: Some(addr(7000)),
                max_peers: 64,
                channel_count: 2,
            })
        );

        let mut client = harness_with(
            Role::Client { remote: addr(9000) },
            TransportConfig::default(),
        );
        assert_eq!(client.control.last_params().unwrap().max_peers, 1);
        assert_eq!(client.control.connect_requests(), vec![addr(9000)]);
        client.step();
        assert_eq!(
            client.events(),
            vec![ConnectionEvent::Connected {
                id: ConnectionId(1),
                addr: addr(9000)
            }]
        );
    }

    #[test]
    fn test_client_handshake_timeout_reported() {
        let (backend, control) = LoopbackBackend::new();
        control.hold_connects(true);
        let mut h = harness_on(
            backend,
            control,
            Role::Client { remote: addr(9000) },
            TransportConfig::default(),
        );
        h.step();
        assert!(h.events().is_empty());

        // The handle the session handed out for the pending connect
        h.control.inject_timeout(1000);
        h.step();
        assert_eq!(
            h.events(),
            vec![ConnectionEvent::ConnectFailed { addr: addr(9000) }]
        );

        // Reported once; later closes for the same handle are ignored
        h.control.inject_disconnect(1000);
        h.step();
        assert!(h.events().is_empty());
        assert_eq!(h.state.load(), WorkerState::Running);
    }

    #[test]
    fn test_server_ignores_close_for_unknown_peer() {
        let mut h = server();
        h.control.inject_timeout(1000);
        h.step();
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_connects_in_one_pass_get_ordered_ids() {
        let mut h = server();
        h.control.inject_batch(vec![
            NativeEvent::Connect {
                peer: PeerHandle(501),
                addr: addr(1),
            },
            NativeEvent::Connect {
                peer: PeerHandle(502),
                addr: addr(2),
            },
        ]);
        h.step();
        assert_eq!(
            h.events(),
            vec![
                ConnectionEvent::Connected {
                    id: ConnectionId(1),
                    addr: addr(1)
                },
                ConnectionEvent::Connected {
                    id: ConnectionId(2),
                    addr: addr(2)
                },
            ]
        );
    }

    #[test]
    fn test_outgoing_resolved_and_sent() {
        let mut h = server();
        h.control.inject_connect(42, addr(1));
        h.step();
        h.events();

        h.send(1, 1, &[1, 2, 3]);
        h.send(7, 0, &[9]); // unknown id, dropped silently
        h.step();

        let sent = h.control.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].peer, PeerHandle(42));
        assert_eq!(sent[0].channel, 1);
        assert_eq!(sent[0].data, vec![1, 2, 3]);
        assert_eq!(sent[0].flags, SendFlags::NONE);
        assert_eq!(h.pool.stats().outstanding, 0);
    }

    #[test]
    fn test_send_failure_dropped_not_retried() {
        let mut h = server();
        h.control.inject_connect(42, addr(1));
        h.step();
        h.control.fail_sends_to(42);

        h.send(1, 0, &[1]);
        h.step();
        h.step();
        assert!(h.control.sent().is_empty());

        h.facade.push_command(Command::Stats);
        h.step();
        let stats = h
            .events()
            .into_iter()
            .find_map(|e| match e {
                ConnectionEvent::Stats(s) => Some(s),
                _ => None,
            })
            .unwrap();
        assert_eq!(stats.send_failures, 1);
        assert_eq!(stats.connections, 1);
    }

    #[test]
    fn test_receive_copies_and_releases() {
        let mut h = server();
        h.control.inject_connect(42, addr(1));
        h.control.inject_receive(42, 0, &[5, 6, 7]);
        h.step();

        let data = h.data();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].0, 1);
        assert_eq!(data[0].1, 0);
        assert_eq!(&data[0].2[..], &[5, 6, 7]);
        assert_eq!(h.control.released(), 1);
        drop(data);
        assert_eq!(h.pool.stats().outstanding, 0);
    }

    #[test]
    fn test_max_packet_size_boundary() {
        let mut h = server();
        h.control.inject_connect(42, addr(1));
        h.control.inject_receive(42, 0, &[0; 8]);
        h.control.inject_receive(42, 0, &[0; 9]);
        h.step();

        let data = h.data();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].2.len(), 8);
        // Both native packets were released
        assert_eq!(h.control.released(), 2);
        assert_eq!(h.pool.stats().rents, 1);
    }

    #[test]
    fn test_unknown_peer_data_kicks() {
        let mut h = server();
        h.control.inject_receive(77, 0, &[1]);
        h.step();

        assert!(h.data().is_empty());
        assert_eq!(h.control.disconnected(), vec![PeerHandle(77)]);
        assert_eq!(h.control.released(), 1);
        // Worker keeps running
        assert!(h.step());
        assert_eq!(h.state.load(), WorkerState::Running);
    }

    #[test]
    fn test_disconnect_and_timeout_handled_alike() {
        let mut h = server();
        h.control.inject_connect(1, addr(1));
        h.control.inject_connect(2, addr(2));
        h.control.inject_disconnect(1);
        h.control.inject_timeout(2);
        // Already gone: ignored
        h.control.inject_disconnect(1);
        h.step();

        let events = h.events();
        assert_eq!(
            &events[2..],
            &[
                ConnectionEvent::Disconnected { id: ConnectionId(1) },
                ConnectionEvent::Disconnected { id: ConnectionId(2) },
            ]
        );
    }

    #[test]
    fn test_kick_retires_immediately() {
        let mut h = server();
        h.control.inject_connect(9, addr(1));
        h.step();
        h.events();

        h.facade.push_command(Command::Kick(ConnectionId(1)));
        h.step();
        // The native disconnect that follows the kick is absorbed
        h.step();

        assert_eq!(
            h.events(),
            vec![ConnectionEvent::Disconnected { id: ConnectionId(1) }]
        );
        assert_eq!(h.control.disconnected(), vec![PeerHandle(9)]);
    }

    #[test]
    fn test_connection_limit_refuses() {
        let mut h = harness_with(
            Role::Server { bind: addr(7000) },
            TransportConfig {
                max_connections: 1,
                ..TransportConfig::default()
            },
        );
        h.control.inject_connect(1, addr(1));
        h.control.inject_connect(2, addr(2));
        h.step();

        assert_eq!(h.events().len(), 1);
        assert_eq!(h.control.disconnected(), vec![PeerHandle(2)]);
    }

    #[test]
    fn test_incoming_full_drops_and_returns_buffer() {
        let mut h = harness_with(
            Role::Server { bind: addr(7000) },
            TransportConfig {
                incoming_capacity: 1,
                ..TransportConfig::default()
            },
        );
        h.control.inject_connect(1, addr(1));
        h.control.inject_receive(1, 0, &[1]);
        h.control.inject_receive(1, 0, &[2]);
        h.step();

        assert_eq!(h.pool.stats().outstanding, 1);
        let data = h.data();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].2[0], 1);
    }

    #[test]
    fn test_stop_command_and_shutdown() {
        let mut h = server();
        h.control.inject_connect(1, addr(1));
        h.control.inject_connect(2, addr(2));
        h.step();
        h.events();

        h.facade.push_command(Command::Stop);
        assert!(!h.step());

        h.worker.take().unwrap().shutdown();
        assert_eq!(h.state.load(), WorkerState::Stopped);
        assert_eq!(h.control.sessions_destroyed(), 1);
        assert_eq!(
            h.events(),
            vec![
                ConnectionEvent::Disconnected { id: ConnectionId(1) },
                ConnectionEvent::Disconnected { id: ConnectionId(2) },
                ConnectionEvent::Stopped,
            ]
        );
    }

    #[test]
    fn test_shutdown_flushes_outgoing() {
        let mut h = server();
        h.control.inject_connect(1, addr(1));
        h.step();

        h.send(1, 0, b"bye");
        h.worker.take().unwrap().shutdown();
        let sent = h.control.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data, b"bye");
    }
}
