//! Transport Facade
//!
//! Runs on the application tick. Never blocks on the network: sends are
//! copied into pooled buffers and queued, and `tick` drains whatever the
//! worker produced since the last call.
//!
//! Each run keeps its own queues and live-connection set. A stopped run stays
//! in `retired` until its final notices have been dispatched, so restarting
//! before the next tick loses nothing and ids of different runs never mix.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::channel::ChannelPolicy;
use crate::config::TransportConfig;
use crate::error::{SendRejected, TransportError};
use crate::native::NativeBackend;
use crate::pool::BufferPool;
use crate::queue::{fabric, Command, ConnectionEvent, FacadeEnds, Outgoing};
use crate::registry::ConnectionId;
use crate::worker::{
    run_worker, Role, StateCell, WorkerContext, WorkerSettings, WorkerState, WorkerStats,
};

/// Host callbacks, invoked from `tick` on the application thread
pub trait TransportHandler {
    fn on_connected(&mut self, _id: ConnectionId, _addr: SocketAddr) {}
    fn on_disconnected(&mut self, _id: ConnectionId) {}
    /// `data` is only valid for the duration of the call
    fn on_data(&mut self, _id: ConnectionId, _channel: u8, _data: &[u8]) {}
    fn on_start_failed(&mut self, _reason: &str) {}
    /// A client's handshake with `addr` never completed
    fn on_connect_failed(&mut self, _addr: SocketAddr) {}
    fn on_stats(&mut self, _stats: &WorkerStats) {}
}

/// Facade ends of one run plus the connections the host has been told about
struct Mailbox {
    queues: FacadeEnds,
    live: HashMap<ConnectionId, SocketAddr>,
}

impl Mailbox {
    fn new(queues: FacadeEnds) -> Self {
        Mailbox {
            queues,
            live: HashMap::new(),
        }
    }

    /// Drain connection events, then data
    fn dispatch<H: TransportHandler>(&mut self, handler: &mut H) -> usize {
        let mut dispatched = self.dispatch_events(handler);
        while let Some(item) = self.queues.pop_data() {
            // Dropping `item` returns its buffer, whatever the handler did.
            if !self.live.contains_key(&item.id) {
                // Its Connected notice may have landed after the event drain.
                dispatched += self.dispatch_events(handler);
                if !self.live.contains_key(&item.id) {
                    tracing::trace!("Dropping data for closed connection {}", item.id);
                    continue;
                }
            }
            handler.on_data(item.id, item.channel, &item.buffer);
            dispatched += 1;
        }
        dispatched
    }

    fn dispatch_events<H: TransportHandler>(&mut self, handler: &mut H) -> usize {
        let mut dispatched = 0;
        while let Some(event) = self.queues.pop_event() {
            match event {
                ConnectionEvent::Connected { id, addr } => {
                    self.live.insert(id, addr);
                    handler.on_connected(id, addr);
                }
                ConnectionEvent::Disconnected { id } => {
                    if self.live.remove(&id).is_none() {
                        continue;
                    }
                    handler.on_disconnected(id);
                }
                ConnectionEvent::StartFailed(reason) => handler.on_start_failed(&reason),
                ConnectionEvent::ConnectFailed { addr } => handler.on_connect_failed(addr),
                ConnectionEvent::Stats(stats) => handler.on_stats(&stats),
                ConnectionEvent::Stopped => {
                    tracing::debug!("Worker reported stop");
                    continue;
                }
            }
            dispatched += 1;
        }
        dispatched
    }
}

struct ActiveRun {
    role: Role,
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    mailbox: Mailbox,
    policy: ChannelPolicy,
}

/// A stopped run whose notices have not all been dispatched yet
struct RetiredRun {
    mailbox: Mailbox,
    /// Set when the worker was detached after a stop timeout
    detached: Option<JoinHandle<()>>,
}

pub struct Transport<B: NativeBackend> {
    backend: Arc<B>,
    config: TransportConfig,
    pool: BufferPool,
    state: Arc<StateCell>,
    run: Option<ActiveRun>,
    retired: VecDeque<RetiredRun>,
}

impl<B: NativeBackend> Transport<B> {
    pub fn new(backend: B, config: TransportConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let pool = config.build_pool();
        Ok(Transport {
            backend: Arc::new(backend),
            config,
            pool,
            state: Arc::new(StateCell::default()),
            run: None,
            retired: VecDeque::new(),
        })
    }

    /// Spawn the worker for `role`. Session creation happens on the worker
    /// thread; if it fails, `on_start_failed` fires on a later tick.
    pub fn start(&mut self, role: Role) -> Result<(), TransportError> {
        if let Some(active) = self.role() {
            if self.state.load() != WorkerState::Stopped {
                tracing::warn!("Start requested while {} is active", active.name());
                return Err(TransportError::AlreadyRunning);
            }
            // Previous run already ended on its own (failed start).
            self.stop();
        }

        let policy = self.config.channel_policy()?;
        let (queues, worker_queues) =
            fabric(self.config.outgoing_capacity, self.config.incoming_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let state = Arc::new(StateCell::default());

        let ctx = WorkerContext {
            role,
            settings: WorkerSettings::from_config(&self.config, policy.clone()),
            pool: self.pool.clone(),
            queues: worker_queues,
            shutdown: shutdown.clone(),
            state: state.clone(),
        };
        let backend = self.backend.clone();
        let thread = thread::Builder::new()
            .name(format!("netpump-{}", role.name()))
            .spawn(move || run_worker(backend, ctx))
            .map_err(TransportError::Spawn)?;

        tracing::info!("Started {} worker", role.name());
        self.state = state;
        self.run = Some(ActiveRun {
            role,
            thread: Some(thread),
            shutdown,
            mailbox: Mailbox::new(queues),
            policy,
        });
        Ok(())
    }

    /// Cooperative stop with a bounded join. Safe to call repeatedly or
    /// before `start`; the state is `Stopped` afterwards.
    pub fn stop(&mut self) {
        let Some(mut run) = self.run.take() else {
            self.state.store(WorkerState::Stopped);
            return;
        };

        run.shutdown.store(true, Ordering::Release);
        run.mailbox.queues.push_command(Command::Stop);

        let mut detached = None;
        if let Some(thread) = run.thread.take() {
            let deadline = Instant::now() + self.config.stop_timeout();
            while !thread.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            if thread.is_finished() {
                if thread.join().is_err() {
                    tracing::error!("{} worker panicked", run.role.name());
                }
            } else {
                // Never killed: native cleanup must run to completion.
                tracing::error!(
                    "{} worker did not stop within {:?}, detaching",
                    run.role.name(),
                    self.config.stop_timeout()
                );
                self.state = Arc::new(StateCell::default());
                detached = Some(thread);
            }
        }

        self.state.store(WorkerState::Stopped);
        self.retired.push_back(RetiredRun {
            mailbox: run.mailbox,
            detached,
        });
        tracing::info!("Stopped {} worker", run.role.name());
    }

    /// Dispatch the final notices of stopped runs, oldest first, then drain
    /// the active run. Returns the number of callbacks made.
    pub fn tick<H: TransportHandler>(&mut self, handler: &mut H) -> usize {
        let mut dispatched = 0;
        let mut drained = 0;
        for retired in self.retired.iter_mut() {
            // Checked first so notices pushed just before exit are still seen.
            let finished = retired.detached.as_ref().map_or(true, |t| t.is_finished());
            dispatched += retired.mailbox.dispatch(handler);
            if finished {
                retired.detached = None;
                drained += 1;
            }
        }
        if drained > 0 {
            self.retired.retain(|r| r.detached.is_some());
        }

        if let Some(run) = &mut self.run {
            dispatched += run.mailbox.dispatch(handler);
        }
        dispatched
    }

    /// Queue `data` for `id` on `channel`. Never blocks.
    pub fn send(&self, id: ConnectionId, channel: u8, data: &[u8]) -> Result<(), SendRejected> {
        let run = self.run.as_ref().ok_or(SendRejected::NotRunning)?;
        if self.state.load() != WorkerState::Running {
            return Err(SendRejected::NotRunning);
        }
        run.policy
            .lookup(channel)
            .map_err(|e| SendRejected::ChannelOutOfRange {
                channel: e.channel,
                count: e.count,
            })?;
        if data.len() > self.config.max_packet_size {
            return Err(SendRejected::PayloadTooLarge {
                len: data.len(),
                max: self.config.max_packet_size,
            });
        }
        if !run.mailbox.live.contains_key(&id) {
            return Err(SendRejected::UnknownConnection(id));
        }

        run.mailbox.queues.push_outgoing(Outgoing {
            id,
            channel,
            buffer: self.pool.copy_from(data),
        })
    }

    /// Ask the worker to drop a connection; `on_disconnected` follows.
    pub fn kick(&self, id: ConnectionId) -> Result<(), TransportError> {
        self.command(Command::Kick(id))
    }

    /// Ask the worker for a `WorkerStats` snapshot, delivered via `on_stats`.
    pub fn request_stats(&self) -> Result<(), TransportError> {
        self.command(Command::Stats)
    }

    fn command(&self, command: Command) -> Result<(), TransportError> {
        let run = self.run.as_ref().ok_or(TransportError::NotRunning)?;
        if run.mailbox.queues.push_command(command) {
            Ok(())
        } else {
            Err(TransportError::NotRunning)
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state.load()
    }

    pub fn role(&self) -> Option<Role> {
        self.run.as_ref().map(|r| r.role)
    }

    /// Remote address of a connection of the active run
    pub fn remote_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.run
            .as_ref()
            .and_then(|r| r.mailbox.live.get(&id).copied())
    }

    pub fn connection_count(&self) -> usize {
        self.run.as_ref().map_or(0, |r| r.mailbox.live.len())
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }
}

impl<B: NativeBackend> Drop for Transport<B> {
    fn drop(&mut self) {
        self.stop();
    }
}
