//! NetPump Core Library
//! Threaded packet pump between a single-threaded game loop and a
//! reliable-UDP engine running on a background worker

pub mod channel;
pub mod config;
pub mod error;
pub mod facade;
pub mod ffi;
pub mod native;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod worker;

pub use channel::{ChannelMode, ChannelPolicy};
pub use config::TransportConfig;
pub use error::{ConfigError, PoolError, SendRejected, TransportError};
pub use facade::{Transport, TransportHandler};
pub use pool::{BufferPool, PoolStats, PooledBuffer};
pub use registry::ConnectionId;
pub use worker::{Role, WorkerState, WorkerStats};

/// Initialize the core library (logging)
pub fn init() {
    init_with_level(tracing::Level::INFO);
}

/// Initialize logging with an explicit maximum level
pub fn init_with_level(level: tracing::Level) {
    // Hosts may call init from several entry points; "already set" is a no-op.
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(level)
            .with_thread_names(true)
            .finish(),
    );

    tracing::info!("NetPump Core Initialized (logger ready)");
}
