//! `CommandSource` / `HostReply` over the nginx host ABI.
//!
//! # Design
//! The host owns three symbols: a blocking poll that yields opaque task
//! pointers, an accessor for a task's request bytes, and the respond call
//! that consumes the task. Task pointers travel through the core as plain
//! `u64` values inside `TaskHandle`; the host keeps them valid until their
//! single respond. Reply buffers are `libc::malloc`-owned because the host
//! frees them with `free`.

use std::ffi::{c_char, c_int, c_void};
use std::ptr;

use courier_core::{CommandSource, HostReply, TaskHandle};

#[cfg(not(test))]
unsafe extern "C" {
    fn ngx_http_lua_ffi_task_poll(tq: *mut c_void) -> *mut c_void;
    fn ngx_http_lua_ffi_get_req(task: *mut c_void, len: *mut c_int) -> *mut c_char;
    fn ngx_http_lua_ffi_respond(task: *mut c_void, rc: c_int, rsp: *mut c_char, len: c_int);
}

// Link-time stand-ins so the unit-test binary resolves; the real symbols
// come from the embedding host process.
#[cfg(test)]
unsafe fn ngx_http_lua_ffi_task_poll(_tq: *mut c_void) -> *mut c_void {
    ptr::null_mut()
}

#[cfg(test)]
unsafe fn ngx_http_lua_ffi_get_req(_task: *mut c_void, len: *mut c_int) -> *mut c_char {
    unsafe { *len = 0 };
    ptr::null_mut()
}

#[cfg(test)]
unsafe fn ngx_http_lua_ffi_respond(_task: *mut c_void, _rc: c_int, rsp: *mut c_char, _len: c_int) {
    if !rsp.is_null() {
        unsafe { libc::free(rsp as *mut c_void) };
    }
}

/// The host's task queue; polled from the dispatch thread only.
pub(crate) struct TaskQueue {
    queue: *mut c_void,
}

// The queue pointer is only ever used from the dispatch thread; the host
// guarantees the queue outlives the library.
unsafe impl Send for TaskQueue {}

impl TaskQueue {
    pub(crate) fn new(queue: *mut c_void) -> Self {
        TaskQueue { queue }
    }
}

impl CommandSource for TaskQueue {
    fn next(&mut self) -> Option<(TaskHandle, Vec<u8>)> {
        let task = unsafe { ngx_http_lua_ffi_task_poll(self.queue) };
        if task.is_null() {
            return None;
        }
        let mut len: c_int = 0;
        let req = unsafe { ngx_http_lua_ffi_get_req(task, &mut len) };
        let raw = if req.is_null() || len <= 0 {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(req as *const u8, len as usize) }.to_vec()
        };
        Some((TaskHandle(task as usize as u64), raw))
    }
}

/// Replies delivered straight through the host's respond symbol.
pub(crate) struct NginxHost;

impl HostReply for NginxHost {
    fn reply(&self, task: TaskHandle, rc: i32, payload: Option<Vec<u8>>) {
        let task = task.0 as usize as *mut c_void;
        match payload {
            Some(bytes) if !bytes.is_empty() => unsafe {
                let buf = libc::malloc(bytes.len()) as *mut c_char;
                if buf.is_null() {
                    ngx_http_lua_ffi_respond(task, rc, ptr::null_mut(), 0);
                    return;
                }
                ptr::copy_nonoverlapping(bytes.as_ptr(), buf as *mut u8, bytes.len());
                ngx_http_lua_ffi_respond(task, rc, buf, bytes.len() as c_int);
            },
            _ => unsafe { ngx_http_lua_ffi_respond(task, rc, ptr::null_mut(), 0) },
        }
    }
}
