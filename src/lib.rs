//! FPSpy: a preload library that watches IEEE-754 floating-point exception
//! behavior in unmodified programs.
//!
//! Injected via `LD_PRELOAD`, FPSpy installs itself at load time and runs
//! entirely in-process. In **aggregate** mode it reads the sticky exception
//! flags at the end of the run and writes a one-line summary per thread. In
//! **individual** mode it unmasks FP exceptions and records one
//! [`fpspy_trace::TraceRecord`] per trapping instruction, using a
//! debugger-style bounce: trap on the exception, mask, re-execute under
//! single-step, re-unmask on the following instruction.
//!
//! All configuration is through `FPSPY_*` environment variables; see
//! [`config`]. If the target starts managing its own FP environment or FP
//! signals, FPSpy disengages for good and stays out of the way.

#[macro_use]
extern crate log;

use core::sync::atomic::{AtomicBool, Ordering};

mod abort;
mod aggregate;
pub mod config;
mod context;
mod kernel;
mod logger;
mod sampler;
mod shims;
mod trace;
mod trap;

/// One-way flags: `INITED` flips when the constructor completes, `ABORTED`
/// when FPSpy disengages. Everything else process-wide lives in
/// [`config::Config`] and is read-only after load.
pub(crate) static INITED: AtomicBool = AtomicBool::new(false);
pub(crate) static ABORTED: AtomicBool = AtomicBool::new(false);

/// Load-time initialization. Also reachable from [`abort`] when something
/// trips before the constructor has run.
pub(crate) fn init() {
    logger::init();

    if INITED.load(Ordering::Acquire) {
        error!("already inited!");
        return;
    }

    let cfg = config::get();
    logger::set_debug_level(cfg.debug_level);
    info!("init");

    if trap::bringup().is_err() {
        error!("cannot bring up framework");
        return;
    }

    INITED.store(true, Ordering::Release);
    debug!("done with setup");
}

/// Unload-time teardown: emit the aggregate line or flush and close every
/// remaining trace.
pub(crate) fn deinit() {
    debug!("deinit");
    if INITED.load(Ordering::Acquire) {
        let tid = unsafe { libc::gettid() };
        match config::get().mode {
            config::Mode::Aggregate => aggregate::emit_for_thread(tid),
            config::Mode::Individual => {
                let _ = trap::teardown_monitoring_context(tid);
                trap::close_all_contexts();
                fpspy_arch::process_deinit();
            }
        }
    }
    INITED.store(false, Ordering::Release);
    debug!("done");
}

// Constructor/destructor wiring for the preload build. Tests link the rlib
// and must not start monitoring themselves.
#[cfg(not(test))]
mod ctor {
    extern "C" fn fpspy_init() {
        crate::init();
    }

    extern "C" fn fpspy_deinit() {
        crate::deinit();
    }

    #[used]
    #[unsafe(link_section = ".init_array")]
    static INIT: extern "C" fn() = fpspy_init;

    #[used]
    #[unsafe(link_section = ".fini_array")]
    static DEINIT: extern "C" fn() = fpspy_deinit;
}
