//! Kernel short-circuit registration.
//!
//! An optional helper module exposes a character device through which a
//! process can register entry points for FP-trap and break-trap delivery,
//! skipping the general signal path. FPSpy only speaks the registration
//! contract; when the device is absent it falls back to signals silently.

use core::ffi::{c_int, c_void};

/// Entry points share the `SA_SIGINFO` handler shape so the kernel path and
/// the signal path feed the same state machine.
pub(crate) type TrapEntry = extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void);

const DEVICE: &core::ffi::CStr = c"/dev/fpspy";

/// `_IOW('f', 1, struct fpspy_shortcircuit)`; must match the helper module.
const FPSPY_IOCTL_SHORTCIRCUIT: libc::c_ulong = 0x4010_6601;

#[repr(C)]
struct ShortcircuitArgs {
    fpe_entry: u64,
    brk_entry: u64,
}

/// Registers the two entry points. `false` means no helper module; the
/// caller stays on signal delivery.
pub(crate) fn try_register(fpe: TrapEntry, brk: TrapEntry) -> bool {
    let fd = unsafe { libc::open(DEVICE.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        debug!("no kernel short-circuit device; staying on signal delivery");
        return false;
    }

    let args = ShortcircuitArgs {
        fpe_entry: fpe as usize as u64,
        brk_entry: brk as usize as u64,
    };
    let rc = unsafe { libc::ioctl(fd, FPSPY_IOCTL_SHORTCIRCUIT, &args) };
    unsafe { libc::close(fd) };

    if rc != 0 {
        error!("kernel short-circuit registration failed");
        return false;
    }
    info!("kernel short-circuit engaged");
    true
}
