//! C ABI for linking nowchat-core as a static library from C/C++ firmware hosts.
//! The host supplies a send callback; its radio receive callback feeds a receiver handle.

use std::ffi::{c_void, CStr};
use std::os::raw::{c_char, c_int};
use std::slice;

use crate::engine::ProtocolEngine;
use crate::events::UiEvent;
use crate::inbound::{InboundQueue, ReceiveHandle, DEFAULT_INBOUND_CAPACITY};
use crate::link::{LinkAddress, RadioLink};
use crate::protocol::PROTOCOL_VERSION;
use crate::security::SecurityManager;

/// Host transmit hook: `(ctx, address[6], frame, len) -> 0 on success`.
pub type SendCallback = extern "C" fn(*mut c_void, *const u8, *const u8, usize) -> c_int;

/// Link that forwards every frame to the host callback.
pub struct CallbackLink {
    send: SendCallback,
    ctx: *mut c_void,
}

impl RadioLink for CallbackLink {
    fn send(&mut self, address: &LinkAddress, frame: &[u8]) -> bool {
        (self.send)(self.ctx, address.as_bytes().as_ptr(), frame.as_ptr(), frame.len()) == 0
    }
}

struct FfiEngine {
    engine: ProtocolEngine<CallbackLink, Vec<UiEvent>>,
    queue: Option<InboundQueue>,
}

fn read_address(mac6: *const u8) -> Option<LinkAddress> {
    if mac6.is_null() {
        return None;
    }
    let mut bytes = [0u8; 6];
    unsafe {
        bytes.copy_from_slice(slice::from_raw_parts(mac6, 6));
    }
    Some(LinkAddress(bytes))
}

fn read_str<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(s) }.to_str().ok()
}

/// Returns the wire protocol version. Also keeps the staticlib exporting at least one symbol.
#[no_mangle]
pub extern "C" fn nowchat_core_version() -> u8 {
    PROTOCOL_VERSION
}

/// Create an engine for the radio with address `mac6`. Returns opaque handle or null.
#[no_mangle]
pub extern "C" fn nowchat_engine_create(
    mac6: *const u8,
    send: Option<SendCallback>,
    ctx: *mut c_void,
) -> *mut c_void {
    let (Some(address), Some(send)) = (read_address(mac6), send) else {
        return std::ptr::null_mut();
    };
    let engine = ProtocolEngine::new(
        SecurityManager::for_link_address(&address),
        CallbackLink { send, ctx },
        Vec::new(),
    );
    let h = FfiEngine {
        engine,
        queue: None,
    };
    Box::into_raw(Box::new(h)) as *mut c_void
}

/// Destroy engine. No-op if h is null. Receivers created from it stop queueing.
#[no_mangle]
pub extern "C" fn nowchat_engine_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut FfiEngine) };
}

/// Join a network by password. Returns 0 on success, -1 on error.
#[no_mangle]
pub extern "C" fn nowchat_engine_join_network(h: *mut c_void, password: *const c_char) -> c_int {
    let Some(password) = read_str(password) else {
        return -1;
    };
    if h.is_null() {
        return -1;
    }
    let f = unsafe { &mut *(h as *mut FfiEngine) };
    match f.engine.security_mut().join_network(password) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

#[no_mangle]
pub extern "C" fn nowchat_engine_set_display_name(h: *mut c_void, name: *const c_char) -> c_int {
    let Some(name) = read_str(name) else {
        return -1;
    };
    if h.is_null() {
        return -1;
    }
    let f = unsafe { &mut *(h as *mut FfiEngine) };
    f.engine.security_mut().set_display_name(name);
    0
}

/// Create the receive handle for the driver callback. Replaces any earlier receiver's
/// queue. `capacity` 0 picks the default. Returns opaque handle or null.
#[no_mangle]
pub extern "C" fn nowchat_receiver_create(h: *mut c_void, capacity: usize) -> *mut c_void {
    if h.is_null() {
        return std::ptr::null_mut();
    }
    let f = unsafe { &mut *(h as *mut FfiEngine) };
    let capacity = if capacity == 0 {
        DEFAULT_INBOUND_CAPACITY
    } else {
        capacity
    };
    let (handle, queue) = f.engine.receive_channel(capacity);
    f.queue = Some(queue);
    Box::into_raw(Box::new(handle)) as *mut c_void
}

#[no_mangle]
pub extern "C" fn nowchat_receiver_destroy(r: *mut c_void) {
    if r.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(r as *mut ReceiveHandle) };
}

/// Driver-context receive hook. Never blocks. `rssi` 0 means unknown.
/// Returns 1 if queued, 0 if dropped, -1 on bad arguments.
#[no_mangle]
pub extern "C" fn nowchat_receiver_on_receive(
    r: *mut c_void,
    mac6: *const u8,
    rssi: c_int,
    bytes: *const u8,
    len: usize,
) -> c_int {
    let Some(from) = read_address(mac6) else {
        return -1;
    };
    if r.is_null() || bytes.is_null() {
        return -1;
    }
    let handle = unsafe { &*(r as *const ReceiveHandle) };
    let data = unsafe { slice::from_raw_parts(bytes, len) };
    let rssi = (rssi != 0).then_some(rssi);
    c_int::from(handle.on_receive(from, rssi, data))
}

/// Dispatch queued frames and run periodic work. Returns frames dispatched, or -1.
#[no_mangle]
pub extern "C" fn nowchat_engine_poll(h: *mut c_void, now_ms: u64) -> c_int {
    if h.is_null() {
        return -1;
    }
    let f = unsafe { &mut *(h as *mut FfiEngine) };
    let n = match f.queue.as_mut() {
        Some(queue) => f.engine.drain(queue, now_ms),
        None => 0,
    };
    f.engine.poll(now_ms);
    n as c_int
}

/// Broadcast a NUL-terminated UTF-8 line. Returns 0 on success, -1 on failure.
#[no_mangle]
pub extern "C" fn nowchat_engine_send_broadcast(
    h: *mut c_void,
    text: *const c_char,
    channel: u8,
    now_ms: u64,
) -> c_int {
    let Some(text) = read_str(text) else {
        return -1;
    };
    if h.is_null() {
        return -1;
    }
    let f = unsafe { &mut *(h as *mut FfiEngine) };
    match f.engine.send_broadcast(text, channel, now_ms) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

#[no_mangle]
pub extern "C" fn nowchat_engine_send_presence(h: *mut c_void, now_ms: u64) -> c_int {
    if h.is_null() {
        return -1;
    }
    let f = unsafe { &mut *(h as *mut FfiEngine) };
    match f.engine.send_presence(now_ms) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Answer the last knock: `allow` non-zero admits, zero turns away. Returns 0 on
/// success, -1 when nobody is knocking or the response could not be sent.
#[no_mangle]
pub extern "C" fn nowchat_engine_answer_knock(h: *mut c_void, allow: c_int, now_ms: u64) -> c_int {
    if h.is_null() {
        return -1;
    }
    let f = unsafe { &mut *(h as *mut FfiEngine) };
    let result = if allow != 0 {
        f.engine.allow_knock(now_ms)
    } else {
        f.engine.deny_knock(now_ms)
    };
    match result {
        Ok(_) => 0,
        Err(_) => -1,
    }
}

/// Number of UI notifications since the last call; clears them.
#[no_mangle]
pub extern "C" fn nowchat_engine_take_events(h: *mut c_void) -> c_int {
    if h.is_null() {
        return -1;
    }
    let f = unsafe { &mut *(h as *mut FfiEngine) };
    let n = f.engine.events().len();
    f.engine.events_mut().clear();
    n as c_int
}

#[no_mangle]
pub extern "C" fn nowchat_engine_message_count(h: *mut c_void) -> c_int {
    if h.is_null() {
        return -1;
    }
    let f = unsafe { &*(h as *const FfiEngine) };
    f.engine.display().len() as c_int
}

/// Copy display message `index` (oldest first) as `name: text`, NUL-terminated.
/// Returns bytes written excluding the NUL, or -1 if out of range or the buffer is too small.
#[no_mangle]
pub extern "C" fn nowchat_engine_message_text(
    h: *mut c_void,
    index: usize,
    out_buf: *mut u8,
    out_len: usize,
) -> c_int {
    if h.is_null() || out_buf.is_null() {
        return -1;
    }
    let f = unsafe { &*(h as *const FfiEngine) };
    let Some(msg) = f.engine.display().get(index) else {
        return -1;
    };
    let line = format!("{}: {}", msg.sender_name, msg.content);
    if line.len() + 1 > out_len {
        return -1;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(line.as_ptr(), line.len());
        *out_buf.add(line.len()) = 0;
    }
    line.len() as c_int
}
