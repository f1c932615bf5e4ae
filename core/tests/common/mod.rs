#![allow(dead_code)]

use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use netpump_core::native::NativeBackend;
use netpump_core::{ConnectionId, Transport, TransportHandler, WorkerStats};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Connected(ConnectionId, SocketAddr),
    Disconnected(ConnectionId),
    Data(ConnectionId, u8, Vec<u8>),
    StartFailed(String),
    ConnectFailed(SocketAddr),
    Stats(WorkerStats),
}

#[derive(Debug, Default)]
pub struct Recorder {
    pub seen: Vec<Seen>,
}

impl Recorder {
    pub fn connected(&self) -> Vec<ConnectionId> {
        self.seen
            .iter()
            .filter_map(|s| match s {
                Seen::Connected(id, _) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn data(&self) -> Vec<(ConnectionId, u8, Vec<u8>)> {
        self.seen
            .iter()
            .filter_map(|s| match s {
                Seen::Data(id, ch, bytes) => Some((*id, *ch, bytes.clone())),
                _ => None,
            })
            .collect()
    }
}

impl TransportHandler for Recorder {
    fn on_connected(&mut self, id: ConnectionId, addr: SocketAddr) {
        self.seen.push(Seen::Connected(id, addr));
    }

    fn on_disconnected(&mut self, id: ConnectionId) {
        self.seen.push(Seen::Disconnected(id));
    }

    fn on_data(&mut self, id: ConnectionId, channel: u8, data: &[u8]) {
        self.seen.push(Seen::Data(id, channel, data.to_vec()));
    }

    fn on_start_failed(&mut self, reason: &str) {
        self.seen.push(Seen::StartFailed(reason.to_string()));
    }

    fn on_connect_failed(&mut self, addr: SocketAddr) {
        self.seen.push(Seen::ConnectFailed(addr));
    }

    fn on_stats(&mut self, stats: &WorkerStats) {
        self.seen.push(Seen::Stats(stats.clone()));
    }
}

/// Tick until `pred` holds, failing after roughly two seconds
pub fn tick_until<B, F>(transport: &mut Transport<B>, recorder: &mut Recorder, mut pred: F)
where
    B: NativeBackend,
    F: FnMut(&Recorder) -> bool,
{
    let mut tries = 0;
    loop {
        transport.tick(recorder);
        if pred(recorder) {
            return;
        }
        thread::sleep(Duration::from_millis(10));
        tries += 1;
        if tries > 200 {
            panic!("Timeout waiting for condition. Seen: {:?}", recorder.seen);
        }
    }
}

/// Poll a condition outside the tick loop
pub fn wait_for<F: FnMut() -> bool>(mut pred: F) {
    let mut tries = 0;
    while !pred() {
        thread::sleep(Duration::from_millis(10));
        tries += 1;
        if tries > 200 {
            panic!("Timeout waiting for condition");
        }
    }
}

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}
