//! FFI Module - C-ABI exports for host engines
//!
//! Lets a game loop written in C#, C++ or similar drive the transport: create
//! a handle, start a role, call `netpump_tick` once per frame with a table of
//! callbacks, and send through `netpump_send`.
#![allow(clippy::not_unsafe_ptr_arg_deref)]

use std::ffi::{c_void, CStr, CString};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::raw::c_char;
use std::ptr;

use crate::config::TransportConfig;
use crate::facade::{Transport, TransportHandler};
use crate::native::UdpBackend;
use crate::registry::ConnectionId;
use crate::worker::Role;

/// Opaque handle to a transport instance
pub struct NetPumpHandle {
    transport: Transport<UdpBackend>,
}

/// Callback table passed to `netpump_tick`. Unset entries are skipped.
#[repr(C)]
pub struct NetPumpCallbacks {
    pub user_data: *mut c_void,
    pub on_connected: Option<extern "C" fn(*mut c_void, u64)>,
    pub on_disconnected: Option<extern "C" fn(*mut c_void, u64)>,
    /// Payload pointer is only valid during the call
    pub on_data: Option<extern "C" fn(*mut c_void, u64, u8, *const u8, usize)>,
    pub on_start_failed: Option<extern "C" fn(*mut c_void, *const c_char)>,
}

struct FfiHandler<'a> {
    callbacks: &'a NetPumpCallbacks,
}

impl TransportHandler for FfiHandler<'_> {
    fn on_connected(&mut self, id: ConnectionId, _addr: SocketAddr) {
        if let Some(cb) = self.callbacks.on_connected {
            cb(self.callbacks.user_data, id.0);
        }
    }

    fn on_disconnected(&mut self, id: ConnectionId) {
        if let Some(cb) = self.callbacks.on_disconnected {
            cb(self.callbacks.user_data, id.0);
        }
    }

    fn on_data(&mut self, id: ConnectionId, channel: u8, data: &[u8]) {
        if let Some(cb) = self.callbacks.on_data {
            cb(self.callbacks.user_data, id.0, channel, data.as_ptr(), data.len());
        }
    }

    fn on_start_failed(&mut self, reason: &str) {
        if let Some(cb) = self.callbacks.on_start_failed {
            let reason = CString::new(reason.replace('\0', " ")).unwrap_or_default();
            cb(self.callbacks.user_data, reason.as_ptr());
        }
    }
}

/// Create a transport. `config_json` may be null for defaults.
/// Returns null on invalid configuration; free with `netpump_destroy`.
#[no_mangle]
pub extern "C" fn netpump_create(config_json: *const c_char) -> *mut NetPumpHandle {
    let config = if config_json.is_null() {
        TransportConfig::default()
    } else {
        let json = unsafe { CStr::from_ptr(config_json) }.to_string_lossy();
        match TransportConfig::from_json(&json) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Invalid transport config: {}", e);
                return ptr::null_mut();
            }
        }
    };

    match Transport::new(UdpBackend::default(), config) {
        Ok(transport) => Box::into_raw(Box::new(NetPumpHandle { transport })),
        Err(e) => {
            tracing::error!("Failed to create transport: {}", e);
            ptr::null_mut()
        }
    }
}

/// Stop and free a transport handle
#[no_mangle]
pub extern "C" fn netpump_destroy(handle: *mut NetPumpHandle) {
    if !handle.is_null() {
        unsafe {
            let _ = Box::from_raw(handle);
        }
    }
}

/// Start a server on `port` (all interfaces). Returns 0 on success, -1 on error.
#[no_mangle]
pub extern "C" fn netpump_start_server(handle: *mut NetPumpHandle, port: u16) -> i32 {
    if handle.is_null() {
        return -1;
    }
    let handle = unsafe { &mut *handle };
    let bind = SocketAddr::from(([0, 0, 0, 0], port));
    match handle.transport.start(Role::Server { bind }) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("Failed to start server: {}", e);
            -1
        }
    }
}

/// Start a client connecting to `host:port`. Returns 0 on success, -1 on error.
#[no_mangle]
pub extern "C" fn netpump_start_client(
    handle: *mut NetPumpHandle,
    host: *const c_char,
    port: u16,
) -> i32 {
    if handle.is_null() || host.is_null() {
        return -1;
    }
    let handle = unsafe { &mut *handle };
    let host = unsafe { CStr::from_ptr(host) }.to_string_lossy();

    let remote = match (&*host, port).to_socket_addrs() {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr,
            None => return -1,
        },
        Err(e) => {
            tracing::error!("Failed to resolve {}: {}", host, e);
            return -1;
        }
    };

    match handle.transport.start(Role::Client { remote }) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("Failed to start client: {}", e);
            -1
        }
    }
}

/// Stop the running role. Safe to call at any time.
#[no_mangle]
pub extern "C" fn netpump_stop(handle: *mut NetPumpHandle) {
    if handle.is_null() {
        return;
    }
    let handle = unsafe { &mut *handle };
    handle.transport.stop();
}

/// Dispatch pending events. Returns the number of callbacks made, -1 on error.
#[no_mangle]
pub extern "C" fn netpump_tick(
    handle: *mut NetPumpHandle,
    callbacks: *const NetPumpCallbacks,
) -> i32 {
    if handle.is_null() || callbacks.is_null() {
        return -1;
    }
    let handle = unsafe { &mut *handle };
    let callbacks = unsafe { &*callbacks };
    let dispatched = handle.transport.tick(&mut FfiHandler { callbacks });
    i32::try_from(dispatched).unwrap_or(i32::MAX)
}

/// Queue a payload. Returns 0 when accepted, -1 when rejected locally.
#[no_mangle]
pub extern "C" fn netpump_send(
    handle: *const NetPumpHandle,
    connection: u64,
    channel: u8,
    data: *const u8,
    len: usize,
) -> i32 {
    if handle.is_null() || (data.is_null() && len > 0) {
        return -1;
    }
    let handle = unsafe { &*handle };
    let payload = if len == 0 {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(data, len) }
    };

    match handle
        .transport
        .send(ConnectionId(connection), channel, payload)
    {
        Ok(()) => 0,
        Err(e) => {
            tracing::debug!("Send rejected: {}", e);
            -1
        }
    }
}

/// Disconnect a peer. Returns 0 on success, -1 when not running.
#[no_mangle]
pub extern "C" fn netpump_kick(handle: *const NetPumpHandle, connection: u64) -> i32 {
    if handle.is_null() {
        return -1;
    }
    let handle = unsafe { &*handle };
    match handle.transport.kick(ConnectionId(connection)) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Current worker state (0 idle, 1 starting, 2 running, 3 stopping, 4 stopped),
/// -1 for a null handle.
#[no_mangle]
pub extern "C" fn netpump_state(handle: *const NetPumpHandle) -> i32 {
    if handle.is_null() {
        return -1;
    }
    let handle = unsafe { &*handle };
    handle.transport.state() as i32
}
