//! Function interception layer.
//!
//! The preload library exports `fork`, the pthread entry points, the signal
//! installers, and the whole C floating-point environment API. Every
//! interposer forwards to the real implementation, resolved lazily through
//! `dlsym(RTLD_NEXT)` so a call that arrives before the constructor has run
//! still lands correctly. FP-environment use by the target means the target
//! owns its FP state; those interposers disengage monitoring before
//! forwarding.
//!
//! These exports exist only in the preload build: in unit tests they would
//! shadow libc for the test harness itself.

#![cfg_attr(test, allow(dead_code, unused_imports))]

use core::ffi::{CStr, c_int, c_void};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::ABORTED;
use crate::config::{self, Mode};

/// Original implementation of an interposed symbol.
pub(crate) struct OrigFn {
    name: &'static CStr,
    ptr: AtomicUsize,
}

impl OrigFn {
    const fn new(name: &'static CStr) -> Self {
        Self {
            name,
            ptr: AtomicUsize::new(0),
        }
    }

    fn resolve(&self) -> usize {
        let p = self.ptr.load(Ordering::Relaxed);
        if p != 0 {
            return p;
        }
        let p = unsafe { libc::dlsym(libc::RTLD_NEXT, self.name.as_ptr()) } as usize;
        if p == 0 {
            debug!("failed to set up shim for {:?}", self.name);
        } else {
            self.ptr.store(p, Ordering::Relaxed);
        }
        p
    }
}

static FORK: OrigFn = OrigFn::new(c"fork");
static PTHREAD_CREATE: OrigFn = OrigFn::new(c"pthread_create");
static PTHREAD_EXIT: OrigFn = OrigFn::new(c"pthread_exit");
static SIGNAL: OrigFn = OrigFn::new(c"signal");
static SIGACTION: OrigFn = OrigFn::new(c"sigaction");
static FECLEAREXCEPT: OrigFn = OrigFn::new(c"feclearexcept");
static FEENABLEEXCEPT: OrigFn = OrigFn::new(c"feenableexcept");
static FEDISABLEEXCEPT: OrigFn = OrigFn::new(c"fedisableexcept");
static FEGETEXCEPT: OrigFn = OrigFn::new(c"fegetexcept");
static FEGETEXCEPTFLAG: OrigFn = OrigFn::new(c"fegetexceptflag");
static FERAISEEXCEPT: OrigFn = OrigFn::new(c"feraiseexcept");
static FESETEXCEPTFLAG: OrigFn = OrigFn::new(c"fesetexceptflag");
static FETESTEXCEPT: OrigFn = OrigFn::new(c"fetestexcept");
static FEGETROUND: OrigFn = OrigFn::new(c"fegetround");
static FESETROUND: OrigFn = OrigFn::new(c"fesetround");
static FEGETENV: OrigFn = OrigFn::new(c"fegetenv");
static FEHOLDEXCEPT: OrigFn = OrigFn::new(c"feholdexcept");
static FESETENV: OrigFn = OrigFn::new(c"fesetenv");
static FEUPDATEENV: OrigFn = OrigFn::new(c"feupdateenv");

/// Calls through an [`OrigFn`], returning zero when the symbol could not be
/// resolved.
macro_rules! forward {
    ($name:ident, $sym:ident, ($($arg:ident: $ty:ty),*) -> $ret:ty) => {
        pub(crate) fn $name($($arg: $ty),*) -> $ret {
            let p = $sym.resolve();
            if p == 0 {
                error!(concat!("cannot call original ", stringify!($name), "; returning zero"));
                return Default::default();
            }
            let f: unsafe extern "C" fn($($ty),*) -> $ret = unsafe { core::mem::transmute(p) };
            unsafe { f($($arg),*) }
        }
    };
}

forward!(orig_fork, FORK, () -> c_int);
forward!(orig_signal, SIGNAL, (sig: c_int, handler: libc::sighandler_t) -> libc::sighandler_t);
forward!(orig_sigaction, SIGACTION,
    (sig: c_int, act: *const libc::sigaction, old: *mut libc::sigaction) -> c_int);
forward!(orig_feclearexcept, FECLEAREXCEPT, (excepts: c_int) -> c_int);
forward!(orig_feenableexcept, FEENABLEEXCEPT, (excepts: c_int) -> c_int);
forward!(orig_fedisableexcept, FEDISABLEEXCEPT, (excepts: c_int) -> c_int);
forward!(orig_fegetexcept, FEGETEXCEPT, () -> c_int);
forward!(orig_fegetexceptflag, FEGETEXCEPTFLAG, (flagp: *mut c_void, excepts: c_int) -> c_int);
forward!(orig_feraiseexcept, FERAISEEXCEPT, (excepts: c_int) -> c_int);
forward!(orig_fesetexceptflag, FESETEXCEPTFLAG, (flagp: *const c_void, excepts: c_int) -> c_int);
forward!(orig_fetestexcept, FETESTEXCEPT, (excepts: c_int) -> c_int);
forward!(orig_fegetround, FEGETROUND, () -> c_int);
forward!(orig_fesetround, FESETROUND, (mode: c_int) -> c_int);
forward!(orig_fegetenv, FEGETENV, (envp: *mut c_void) -> c_int);
forward!(orig_feholdexcept, FEHOLDEXCEPT, (envp: *mut c_void) -> c_int);
forward!(orig_fesetenv, FESETENV, (envp: *const c_void) -> c_int);
forward!(orig_feupdateenv, FEUPDATEENV, (envp: *const c_void) -> c_int);

#[cfg_attr(test, allow(dead_code))]
fn orig_pthread_create(
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start: StartFn,
    arg: *mut c_void,
) -> c_int {
    let p = PTHREAD_CREATE.resolve();
    if p == 0 {
        error!("cannot call original pthread_create; returning zero");
        return 0;
    }
    let f: unsafe extern "C" fn(
        *mut libc::pthread_t,
        *const libc::pthread_attr_t,
        StartFn,
        *mut c_void,
    ) -> c_int = unsafe { core::mem::transmute(p) };
    unsafe { f(thread, attr, start, arg) }
}

/// Resolves every shim eagerly so a stripped or static target fails at
/// startup instead of mid-run.
pub(crate) fn setup() -> Result<(), ()> {
    let mut all = vec![
        &FORK,
        &SIGNAL,
        &SIGACTION,
        &FECLEAREXCEPT,
        &FEENABLEEXCEPT,
        &FEDISABLEEXCEPT,
        &FEGETEXCEPT,
        &FEGETEXCEPTFLAG,
        &FERAISEEXCEPT,
        &FESETEXCEPTFLAG,
        &FETESTEXCEPT,
        &FEGETROUND,
        &FESETROUND,
        &FEGETENV,
        &FEHOLDEXCEPT,
        &FESETENV,
        &FEUPDATEENV,
    ];
    if !config::get().disable_pthreads {
        all.push(&PTHREAD_CREATE);
        all.push(&PTHREAD_EXIT);
    }
    if all.iter().all(|f| f.resolve() != 0) {
        Ok(())
    } else {
        Err(())
    }
}

pub(crate) type StartFn = unsafe extern "C" fn(*mut c_void) -> *mut c_void;

#[cfg_attr(test, allow(dead_code))]
struct TrampArg {
    start: StartFn,
    arg: *mut c_void,
}

/// Runs on the new thread before the target's start routine: allocate the
/// monitoring context, self-kick the INIT transition, then hand over.
/// Catches a plain return and routes it through the intercepted
/// `pthread_exit` so teardown always runs.
#[cfg(not(test))]
unsafe extern "C" fn trampoline(p: *mut c_void) -> *mut c_void {
    let TrampArg { start, arg } = *unsafe { Box::from_raw(p as *mut TrampArg) };
    let tid = unsafe { libc::gettid() };
    let cfg = config::get();

    debug!("setting up thread {tid}");
    orig_feclearexcept(fpspy_arch::fe_bits(cfg.except_list));

    if cfg.mode == Mode::Individual && !ABORTED.load(Ordering::Acquire) {
        if crate::trap::bringup_monitoring_context(tid).is_err() {
            error!("failed to start up monitoring context on thread creation");
        } else {
            crate::trap::kick_self();
        }
        debug!("done with setup on thread creation");
    }

    debug!("leaving trampoline");
    let ret = unsafe { start(arg) };
    exports::pthread_exit(ret)
}

#[cfg(not(test))]
mod exports {
    use super::*;
    use crate::abort::abort_operation;

    #[unsafe(no_mangle)]
    pub extern "C" fn fork() -> c_int {
        debug!("fork");

        let rc = orig_fork();
        if rc != 0 || ABORTED.load(Ordering::Acquire) {
            // Parent, failure, or nothing left to monitor.
            return rc;
        }

        // Child: sticky state is not inherited as far as FPSpy is concerned,
        // and individual mode needs its own context and trace file.
        let cfg = config::get();
        orig_feclearexcept(fpspy_arch::fe_bits(cfg.except_list));
        if cfg.mode == Mode::Individual {
            let tid = unsafe { libc::gettid() };
            if crate::trap::bringup_monitoring_context(tid).is_err() {
                error!("failed to start up monitoring context at fork");
            } else {
                // Handlers were inherited; the kick drives INIT→AWAIT_FPE.
                crate::trap::kick_self();
            }
        }
        debug!("done with setup on fork");
        rc
    }

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn pthread_create(
        thread: *mut libc::pthread_t,
        attr: *const libc::pthread_attr_t,
        start: StartFn,
        arg: *mut c_void,
    ) -> c_int {
        debug!("pthread_create");

        if ABORTED.load(Ordering::Acquire) || config::get().disable_pthreads {
            return orig_pthread_create(thread, attr, start, arg);
        }

        let tramp = Box::into_raw(Box::new(TrampArg { start, arg }));
        let rc = orig_pthread_create(thread, attr, trampoline, tramp as *mut c_void);
        if rc != 0 {
            // The thread never ran; reclaim its argument.
            drop(unsafe { Box::from_raw(tramp) });
        }
        debug!("pthread_create done");
        rc
    }

    #[unsafe(no_mangle)]
    pub extern "C" fn pthread_exit(ret: *mut c_void) -> ! {
        debug!("pthread_exit({ret:p})");

        // Runs even after abort: an abort record still wants flushing.
        let tid = unsafe { libc::gettid() };
        match config::get().mode {
            Mode::Individual => {
                let _ = crate::trap::teardown_monitoring_context(tid);
            }
            Mode::Aggregate => crate::aggregate::emit_for_thread(tid),
        }

        let p = PTHREAD_EXIT.resolve();
        if p != 0 {
            let f: unsafe extern "C" fn(*mut c_void) -> ! = unsafe { core::mem::transmute(p) };
            unsafe { f(ret) }
        }
        error!("cannot call original pthread_exit");
        unsafe { libc::abort() }
    }

    #[unsafe(no_mangle)]
    pub extern "C" fn signal(sig: c_int, handler: libc::sighandler_t) -> libc::sighandler_t {
        debug!("signal({sig},{handler:#x})");
        if is_our_signal(sig) {
            if !config::get().aggressive {
                abort_operation("target is using signal with SIGFPE or SIGTRAP");
            } else {
                debug!("not overriding FP signals because we are in aggressive mode");
                return 0;
            }
        }
        orig_signal(sig, handler)
    }

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn sigaction(
        sig: c_int,
        act: *const libc::sigaction,
        old: *mut libc::sigaction,
    ) -> c_int {
        debug!("sigaction({sig},{act:p},{old:p})");
        if is_our_signal(sig) {
            if !config::get().aggressive {
                abort_operation("target is using sigaction with SIGFPE, SIGTRAP, or the sampler alarm");
            } else {
                debug!("not overriding FP signals because we are in aggressive mode");
                return 0;
            }
        }
        orig_sigaction(sig, act, old)
    }

    /// The FP-trap, break-trap and sampler-alarm signals belong to FPSpy in
    /// individual mode until abort.
    fn is_our_signal(sig: c_int) -> bool {
        let cfg = config::get();
        if cfg.mode != Mode::Individual || ABORTED.load(Ordering::Acquire) {
            return false;
        }
        sig == libc::SIGFPE
            || sig == libc::SIGTRAP
            || (cfg.poisson.is_some() && sig == cfg.timer.alarm_signal())
    }

    macro_rules! fenv_export {
        ($name:ident, ($($arg:ident: $ty:ty),*), $orig:ident) => {
            #[unsafe(no_mangle)]
            pub extern "C" fn $name($($arg: $ty),*) -> c_int {
                debug!(concat!(stringify!($name), " called by target"));
                abort_operation(concat!("target is using ", stringify!($name)));
                $orig($($arg),*)
            }
        };
    }

    fenv_export!(feclearexcept, (excepts: c_int), orig_feclearexcept);
    fenv_export!(feenableexcept, (excepts: c_int), orig_feenableexcept);
    fenv_export!(fedisableexcept, (excepts: c_int), orig_fedisableexcept);
    fenv_export!(fegetexcept, (), orig_fegetexcept);
    fenv_export!(fegetexceptflag, (flagp: *mut c_void, excepts: c_int), orig_fegetexceptflag);
    fenv_export!(feraiseexcept, (excepts: c_int), orig_feraiseexcept);
    fenv_export!(fesetexceptflag, (flagp: *const c_void, excepts: c_int), orig_fesetexceptflag);
    fenv_export!(fetestexcept, (excepts: c_int), orig_fetestexcept);
    fenv_export!(fegetround, (), orig_fegetround);
    fenv_export!(fesetround, (mode: c_int), orig_fesetround);
    fenv_export!(fegetenv, (envp: *mut c_void), orig_fegetenv);
    fenv_export!(feholdexcept, (envp: *mut c_void), orig_feholdexcept);
    fenv_export!(fesetenv, (envp: *const c_void), orig_fesetenv);
    fenv_export!(feupdateenv, (envp: *const c_void), orig_feupdateenv);
}
