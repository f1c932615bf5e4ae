//! Cross-Thread Queue Fabric
//!
//! Four FIFOs between the facade (application thread) and the worker:
//!
//! ```text
//! facade --Outgoing (bounded)------------> worker
//! facade --Commands (unbounded)----------> worker
//! facade <--ConnectionEvents (unbounded)-- worker
//! facade <--IncomingData (bounded)-------- worker
//! ```
//!
//! Only the non-blocking halves of `tokio::sync::mpsc` are used, so no async
//! runtime is involved and neither side ever suspends on a queue. Within one
//! pass the facade drains ConnectionEvents before IncomingData.

use std::net::SocketAddr;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

use crate::error::SendRejected;
use crate::pool::PooledBuffer;
use crate::registry::ConnectionId;
use crate::worker::WorkerStats;

/// Payload on its way to the native engine
#[derive(Debug)]
pub struct Outgoing {
    pub id: ConnectionId,
    pub channel: u8,
    pub buffer: PooledBuffer,
}

/// Control requests for the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Kick(ConnectionId),
    Stats,
    Stop,
}

/// Lifecycle notices from the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { id: ConnectionId, addr: SocketAddr },
    Disconnected { id: ConnectionId },
    StartFailed(String),
    /// Client handshake gave up before the server answered
    ConnectFailed { addr: SocketAddr },
    Stats(WorkerStats),
    Stopped,
}

/// Payload received from a peer
#[derive(Debug)]
pub struct IncomingData {
    pub id: ConnectionId,
    pub channel: u8,
    pub buffer: PooledBuffer,
}

/// The facade dropped its end of the command queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

/// Why the worker could not hand a payload over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    Full,
    Closed,
}

/// Build a fresh fabric for one worker run
pub fn fabric(outgoing_capacity: usize, incoming_capacity: usize) -> (FacadeEnds, WorkerEnds) {
    let (outgoing_tx, outgoing_rx) = mpsc::channel(outgoing_capacity);
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (data_tx, data_rx) = mpsc::channel(incoming_capacity);

    (
        FacadeEnds {
            outgoing: outgoing_tx,
            commands: commands_tx,
            events: events_rx,
            data: data_rx,
        },
        WorkerEnds {
            outgoing: outgoing_rx,
            commands: commands_rx,
            events: events_tx,
            data: data_tx,
        },
    )
}

/// Facade side of the fabric
#[derive(Debug)]
pub struct FacadeEnds {
    outgoing: mpsc::Sender<Outgoing>,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    data: mpsc::Receiver<IncomingData>,
}

impl FacadeEnds {
    pub fn push_outgoing(&self, item: Outgoing) -> Result<(), SendRejected> {
        // A rejected item is dropped here and its buffer goes back to the pool.
        self.outgoing.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => SendRejected::QueueFull,
            TrySendError::Closed(_) => SendRejected::NotRunning,
        })
    }

    /// Returns false once the worker has gone away
    pub fn push_command(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn pop_event(&mut self) -> Option<ConnectionEvent> {
        self.events.try_recv().ok()
    }

    pub fn pop_data(&mut self) -> Option<IncomingData> {
        self.data.try_recv().ok()
    }
}

/// Worker side of the fabric
#[derive(Debug)]
pub struct WorkerEnds {
    outgoing: mpsc::Receiver<Outgoing>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    data: mpsc::Sender<IncomingData>,
}

impl WorkerEnds {
    pub fn pop_outgoing(&mut self) -> Option<Outgoing> {
        self.outgoing.try_recv().ok()
    }

    pub fn pop_command(&mut self) -> Result<Option<Command>, Disconnected> {
        match self.commands.try_recv() {
            Ok(command) => Ok(Some(command)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Disconnected),
        }
    }

    pub fn push_event(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Facade gone, dropping connection event");
        }
    }

    pub fn push_data(&self, item: IncomingData) -> Result<(), PushError> {
        self.data.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => PushError::Full,
            TrySendError::Closed(_) => PushError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;

    #[test]
    fn test_fifo_per_queue() {
        let pool = BufferPool::default();
        let (mut facade, mut worker) = fabric(8, 8);

        for i in 0..3u8 {
            facade
                .push_outgoing(Outgoing {
                    id: ConnectionId(1),
                    channel: 0,
                    buffer: pool.copy_from(&[i]),
                })
                .unwrap();
            worker
                .push_data(IncomingData {
                    id: ConnectionId(1),
                    channel: 1,
                    buffer: pool.copy_from(&[i]),
                })
                .unwrap();
        }

        for i in 0..3u8 {
            assert_eq!(worker.pop_outgoing().unwrap().buffer[0], i);
            assert_eq!(facade.pop_data().unwrap().buffer[0], i);
        }
        assert!(worker.pop_outgoing().is_none());
        assert!(facade.pop_data().is_none());
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_bounded_queues_reject_when_full() {
        let pool = BufferPool::default();
        let (facade, worker) = fabric(1, 1);

        let item = || Outgoing {
            id: ConnectionId(1),
            channel: 0,
            buffer: pool.rent(4),
        };
        facade.push_outgoing(item()).unwrap();
        assert_eq!(facade.push_outgoing(item()), Err(SendRejected::QueueFull));

        let data = || IncomingData {
            id: ConnectionId(1),
            channel: 0,
            buffer: pool.rent(4),
        };
        worker.push_data(data()).unwrap();
        assert_eq!(worker.push_data(data()), Err(PushError::Full));

        // Rejected items already returned their buffers
        assert_eq!(pool.stats().outstanding, 2);
    }

    #[test]
    fn test_closed_sides_detected() {
        let (mut facade, mut worker) = fabric(4, 4);
        assert!(facade.push_command(Command::Stats));
        assert_eq!(worker.pop_command(), Ok(Some(Command::Stats)));
        assert_eq!(worker.pop_command(), Ok(None));

        worker.push_event(ConnectionEvent::Stopped);
        assert_eq!(facade.pop_event(), Some(ConnectionEvent::Stopped));

        drop(facade);
        assert_eq!(worker.pop_command(), Err(Disconnected));
        assert_eq!(
            worker.push_data(IncomingData {
                id: ConnectionId(1),
                channel: 0,
                buffer: BufferPool::default().rent(1),
            }),
            Err(PushError::Closed)
        );
    }

    #[test]
    fn test_send_after_worker_gone() {
        let pool = BufferPool::default();
        let (facade, worker) = fabric(4, 4);
        drop(worker);
        assert_eq!(
            facade.push_outgoing(Outgoing {
                id: ConnectionId(1),
                channel: 0,
                buffer: pool.rent(1),
            }),
            Err(SendRejected::NotRunning)
        );
        assert!(!facade.push_command(Command::Stop));
    }
}
