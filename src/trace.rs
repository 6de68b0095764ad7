//! Individual-mode trace output.
//!
//! Records are buffered write-behind in the monitoring context and flushed
//! with plain `write(2)` when the buffer fills, at teardown, and after an
//! abort marker. A failed write is logged and dropped; monitoring continues
//! and readers tolerate the shortfall.

use core::ffi::CStr;

use fpspy_trace::TraceRecord;

use crate::context::{MonitoringContext, TRACE_BUFLEN};

unsafe extern "C" {
    static program_invocation_short_name: *mut libc::c_char;
}

/// Short name of the running program, as the dynamic linker saw it.
pub fn progname() -> &'static str {
    unsafe {
        let p = program_invocation_short_name;
        if p.is_null() {
            "unknown"
        } else {
            CStr::from_ptr(p).to_str().unwrap_or("unknown")
        }
    }
}

fn open_output(name: &str) -> Option<libc::c_int> {
    let cname = std::ffi::CString::new(name).ok()?;
    let fd = unsafe {
        libc::open(cname.as_ptr(), libc::O_CREAT | libc::O_WRONLY, 0o666 as libc::c_uint)
    };
    (fd >= 0).then_some(fd)
}

/// Creates `__<prog>.<unix-secs>.<tid>.<kind>.fpemon` in the current
/// directory.
pub fn open_monitor_file(tid: libc::pid_t, kind: &str) -> Option<libc::c_int> {
    let secs = unsafe { libc::time(core::ptr::null_mut()) };
    let name = format!("__{}.{}.{}.{}.fpemon", progname(), secs, tid, kind);
    let fd = open_output(&name);
    if fd.is_none() {
        error!("cannot open monitoring output file {name}");
    }
    fd
}

/// Writes the whole buffer, riding out short writes and EINTR.
pub fn write_all(fd: libc::c_int, mut buf: &[u8]) -> Result<(), ()> {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            let errno = unsafe { *libc::__errno_location() };
            if errno == libc::EINTR {
                continue;
            }
            return Err(());
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

/// Drains the context's record buffer to its trace file.
pub fn flush(mc: &mut MonitoringContext) {
    if mc.buffered == 0 {
        return;
    }
    if mc.fd >= 0 {
        let bytes: &[u8] = bytemuck::cast_slice(&mc.buf[..mc.buffered]);
        if write_all(mc.fd, bytes).is_err() {
            error!("failed to write trace records");
        }
    }
    mc.buffered = 0;
}

/// Queues one record, flushing write-behind when the buffer fills.
pub fn push_record(mc: &mut MonitoringContext, record: TraceRecord) {
    mc.buf[mc.buffered] = record;
    mc.buffered += 1;
    if mc.buffered == TRACE_BUFLEN {
        flush(mc);
    }
}
