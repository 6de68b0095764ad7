//! The per-thread trap state machine and process lifecycle.
//!
//! Individual mode runs each thread through a strict alternation: an FP trap
//! records the event, masks exceptions and arms a single-step; the following
//! break-trap disarms it, re-unmasks and goes back to waiting. The faulting
//! instruction re-executes between the two with exceptions masked, so the
//! target computes exactly what it would have computed unobserved.
//!
//! Signal masks keep the FP-trap, break-trap and sampler-alarm handlers from
//! nesting destructively on one thread; the sampler's `delayed_processing`
//! flag covers the alarm that slips in between.

use core::cell::UnsafeCell;
use core::ffi::{c_int, c_void};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use fpspy_arch::RoundConfig;
use fpspy_trace::{MAX_INSTR_SIZE, TraceRecord};

use crate::abort::abort_operation;
use crate::config::{self, Mode};
use crate::context::{self, State};
use crate::{kernel, sampler, shims, trace};

/// Previous dispositions of the signals FPSpy owns, for the abort protocol
/// and the interrupt chain. Written once during single-threaded init.
struct SavedAction(UnsafeCell<libc::sigaction>);

unsafe impl Sync for SavedAction {}

impl SavedAction {
    const fn new() -> Self {
        Self(UnsafeCell::new(unsafe {
            core::mem::MaybeUninit::zeroed().assume_init()
        }))
    }

    fn get(&self) -> *mut libc::sigaction {
        self.0.get()
    }
}

static OLD_FPE: SavedAction = SavedAction::new();
static OLD_TRAP: SavedAction = SavedAction::new();
static OLD_INT: SavedAction = SavedAction::new();
static OLD_ALRM: SavedAction = SavedAction::new();

/// Forced-rounding state: `ORIG_ROUND` is snapshotted at thread INIT,
/// `OUR_ROUND` comes from `FPSPY_FORCE_ROUNDING`, and nothing is applied
/// unless `CONTROL_ROUNDING` is set.
static CONTROL_ROUNDING: AtomicBool = AtomicBool::new(false);
static ORIG_ROUND: AtomicU32 = AtomicU32::new(0);
static OUR_ROUND: AtomicU32 = AtomicU32::new(0);

unsafe fn apply_our_round(uc: *mut libc::ucontext_t) {
    if CONTROL_ROUNDING.load(Ordering::Relaxed) {
        let cfg = RoundConfig::from_bits(OUR_ROUND.load(Ordering::Relaxed));
        unsafe { fpspy_arch::set_round_config(uc, cfg) };
    }
}

unsafe fn apply_orig_round(uc: *mut libc::ucontext_t) {
    if CONTROL_ROUNDING.load(Ordering::Relaxed) {
        let cfg = RoundConfig::from_bits(ORIG_ROUND.load(Ordering::Relaxed));
        unsafe { fpspy_arch::set_round_config(uc, cfg) };
    }
}

/// Returns a saved context to the target's own terms: flags clear, traps
/// masked, original rounding, single-step disarmed.
unsafe fn restore_ctx_disengaged(uc: *mut libc::ucontext_t, scratch: &mut u64) {
    unsafe {
        fpspy_arch::clear_fp_exceptions(uc);
        fpspy_arch::mask_fp_traps(uc);
        apply_orig_round(uc);
        fpspy_arch::reset_trap(uc, scratch);
    }
}

/// Sends the calling thread a break-trap to drive its next state
/// transition.
pub(crate) fn kick_self() {
    unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            libc::getpid(),
            libc::gettid(),
            libc::SIGTRAP,
        );
    }
}

pub(crate) extern "C" fn fpe_handler(_sig: c_int, si: *mut libc::siginfo_t, uc: *mut c_void) {
    let uc = uc as *mut libc::ucontext_t;
    let tid = unsafe { libc::gettid() };
    let cfg = config::get();

    unsafe {
        debug!(
            "FPE signo {:#x} errno {:#x} code {:#x} rip {:#x}",
            (*si).si_signo,
            (*si).si_errno,
            (*si).si_code,
            fpspy_arch::ip(uc)
        );
    }

    let Some(mc) = context::find(tid) else {
        let mut scratch = 0u64;
        unsafe { restore_ctx_disengaged(uc, &mut scratch) };
        abort_operation("cannot find monitoring context during FP trap");
        return;
    };
    let mc = unsafe { &mut *mc };

    if cfg.crash_on_trap {
        error!("crashing on FP trap as configured");
        unsafe { libc::abort() };
    }

    if mc.count % cfg.sample_period == 0 {
        let mut instruction = [0u8; MAX_INSTR_SIZE];
        unsafe { fpspy_arch::instr_bytes(uc, &mut instruction) };
        let record = TraceRecord {
            time: fpspy_arch::cycle_count() - mc.start_time,
            rip: unsafe { fpspy_arch::ip(uc) },
            rsp: unsafe { fpspy_arch::sp(uc) },
            code: unsafe { (*si).si_code },
            mxcsr: unsafe { fpspy_arch::fp_csr(uc) }.bits() as u32,
            instruction,
            pad: 0,
        };
        trace::push_record(mc, record);
    }

    if mc.state == State::AwaitFpe {
        // Mask so the re-executed instruction completes silently, then trap
        // on the one after it.
        unsafe {
            fpspy_arch::clear_fp_exceptions(uc);
            fpspy_arch::mask_fp_traps(uc);
            apply_our_round(uc);
            fpspy_arch::set_trap(uc, &mut mc.trap_state);
        }
        mc.state = State::AwaitTrap;
    } else {
        unsafe { restore_ctx_disengaged(uc, &mut mc.trap_state) };
        abort_operation("surprise state during FP trap");
    }
    debug!("FPE done");
}

pub(crate) extern "C" fn brk_handler(_sig: c_int, si: *mut libc::siginfo_t, uc: *mut c_void) {
    let uc = uc as *mut libc::ucontext_t;
    let tid = unsafe { libc::gettid() };
    let cfg = config::get();

    unsafe {
        debug!(
            "TRAP signo {:#x} errno {:#x} code {:#x}",
            (*si).si_signo,
            (*si).si_errno,
            (*si).si_code
        );
    }

    let Some(mc) = context::find(tid) else {
        let mut scratch = 0u64;
        unsafe { restore_ctx_disengaged(uc, &mut scratch) };
        // This may end badly.
        abort_operation("cannot find monitoring context during break trap");
        return;
    };
    let mc = unsafe { &mut *mc };

    match mc.state {
        State::Abort => {
            unsafe { restore_ctx_disengaged(uc, &mut mc.trap_state) };
            debug!("FP and trap context restored on abort");
        }
        State::Init => {
            ORIG_ROUND.store(unsafe { fpspy_arch::round_config(uc) }.bits(), Ordering::Relaxed);
            if unsafe { fpspy_arch::thread_init(uc) }.is_err() {
                error!("arch thread init failed");
            }
            unsafe {
                fpspy_arch::clear_fp_exceptions(uc);
                fpspy_arch::unmask_fp_traps(uc);
                apply_our_round(uc);
                fpspy_arch::reset_trap(uc, &mut mc.trap_state);
            }
            mc.state = State::AwaitFpe;
            debug!("FP-CSR state initialized");
        }
        State::AwaitTrap => {
            mc.count += 1;
            unsafe {
                fpspy_arch::clear_fp_exceptions(uc);
                if cfg.maxcount != -1 && mc.count >= cfg.maxcount as u64 {
                    // Recorded enough; quiesce this thread for good.
                    fpspy_arch::mask_fp_traps(uc);
                    apply_orig_round(uc);
                } else {
                    fpspy_arch::unmask_fp_traps(uc);
                    apply_our_round(uc);
                }
                fpspy_arch::reset_trap(uc, &mut mc.trap_state);
            }
            mc.state = State::AwaitFpe;
            if mc.sampler.delayed_processing {
                debug!("delayed sampler handling");
                unsafe { sampler::update_sampler(&mut mc.sampler, uc, &mut mc.trap_state) };
            }
        }
        State::AwaitFpe => {
            unsafe { restore_ctx_disengaged(uc, &mut mc.trap_state) };
            mc.aborting_in_trap = true;
            abort_operation("surprise state during break trap");
        }
    }
    debug!("TRAP done");
}

extern "C" fn alrm_handler(_sig: c_int, _si: *mut libc::siginfo_t, uc: *mut c_void) {
    let uc = uc as *mut libc::ucontext_t;
    let tid = unsafe { libc::gettid() };
    debug!("timeout for {tid}");

    let Some(mc) = context::find(tid) else {
        error!("could not find monitoring context for {tid}");
        return;
    };
    let mc = unsafe { &mut *mc };

    if mc.state != State::AwaitFpe {
        // Mid-instruction; defer the flip to the next break-trap.
        debug!("delaying sampler processing because we are in the middle of an instruction");
        mc.sampler.delayed_processing = true;
    } else {
        unsafe { sampler::update_sampler(&mut mc.sampler, uc, &mut mc.trap_state) };
    }
}

extern "C" fn int_handler(sig: c_int, si: *mut libc::siginfo_t, uc: *mut c_void) {
    debug!("handling interrupt");

    let old = unsafe { *OLD_INT.get() };
    if old.sa_sigaction > libc::SIG_IGN {
        // Flush everything, then chain to the target's handler.
        crate::deinit();
        unsafe {
            if old.sa_flags & libc::SA_SIGINFO != 0 {
                let f: extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) =
                    core::mem::transmute(old.sa_sigaction);
                f(sig, si, uc);
            } else {
                let f: extern "C" fn(c_int) = core::mem::transmute(old.sa_sigaction);
                f(sig);
            }
        }
    } else {
        // Exit; the destructor flushes on the way out.
        unsafe { libc::exit(-1) };
    }
}

pub(crate) fn restore_fpe_action() {
    shims::orig_sigaction(libc::SIGFPE, OLD_FPE.get(), ptr::null_mut());
}

pub(crate) fn restore_brk_action() {
    shims::orig_sigaction(libc::SIGTRAP, OLD_TRAP.get(), ptr::null_mut());
}

fn install(
    sig: c_int,
    handler: extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void),
    mask: &[c_int],
    old: *mut libc::sigaction,
) {
    let mut sa: libc::sigaction = unsafe { core::mem::zeroed() };
    sa.sa_sigaction = handler as usize;
    sa.sa_flags = libc::SA_SIGINFO;
    unsafe {
        libc::sigemptyset(&mut sa.sa_mask);
        for &s in mask {
            libc::sigaddset(&mut sa.sa_mask, s);
        }
    }
    if shims::orig_sigaction(sig, &sa, old) != 0 {
        error!("failed to install handler for signal {sig}");
    }
}

/// Creates and starts the calling thread's monitoring context: slot, trace
/// file, sampler. The caller follows up with [`kick_self`] (or waits for an
/// external kick) to drive INIT→AWAIT_FPE.
pub(crate) fn bringup_monitoring_context(tid: libc::pid_t) -> Result<(), ()> {
    let Some(mc) = context::alloc(tid) else {
        error!("cannot allocate monitoring context");
        return Err(());
    };
    let mc = unsafe { &mut *mc };

    let Some(fd) = trace::open_monitor_file(tid, "individual") else {
        context::release(tid);
        return Err(());
    };
    mc.fd = fd;
    mc.start_time = fpspy_arch::cycle_count();
    mc.state = State::Init;

    sampler::init_sampler(&mut mc.sampler);
    Ok(())
}

/// Flushes and closes a thread's trace and frees its slot.
pub(crate) fn teardown_monitoring_context(tid: libc::pid_t) -> Result<(), ()> {
    let Some(mc) = context::find(tid) else {
        error!("cannot find monitoring context for {tid}");
        return Err(());
    };
    let mc = unsafe { &mut *mc };

    trace::flush(mc);
    if mc.fd >= 0 {
        unsafe { libc::close(mc.fd) };
        mc.fd = -1;
    }
    fpspy_arch::thread_deinit();
    context::release(tid);
    debug!("tore down monitoring context for {tid}");
    Ok(())
}

/// Flushes and closes every remaining live trace. Process-teardown path,
/// after the owning threads are done.
pub(crate) fn close_all_contexts() {
    context::for_each_live(|tid, mc| {
        let mc = unsafe { &mut *mc };
        trace::flush(mc);
        if mc.fd >= 0 {
            unsafe { libc::close(mc.fd) };
            mc.fd = -1;
        }
        debug!("closed trace for {tid}");
    });
}

/// Process-level startup: shims, arch bringup, trap-mask configuration, the
/// main thread's context, signal handlers, and the initial self-kick.
pub(crate) fn bringup() -> Result<(), ()> {
    let cfg = config::get();

    if shims::setup().is_err() {
        error!("cannot set up shims");
        return Err(());
    }

    shims::orig_feclearexcept(fpspy_arch::fe_bits(cfg.except_list));

    if cfg.mode != Mode::Individual {
        return Ok(());
    }

    if !fpspy_arch::supports_fp_traps() {
        error!("this machine cannot deliver FP traps; individual mode unavailable");
        return Err(());
    }

    if fpspy_arch::process_init().is_err() {
        error!("arch process init failed");
        return Err(());
    }

    fpspy_arch::clear_trap_mask();
    for exc in [
        fpspy_arch::FpExcept::INVALID,
        fpspy_arch::FpExcept::DENORM,
        fpspy_arch::FpExcept::DIVZERO,
        fpspy_arch::FpExcept::OVERFLOW,
        fpspy_arch::FpExcept::UNDERFLOW,
        fpspy_arch::FpExcept::INEXACT,
    ] {
        if !cfg.except_list.contains(exc) {
            fpspy_arch::set_trap_mask(exc);
        }
    }

    if let Some((mode, dazftz)) = cfg.force_rounding {
        OUR_ROUND.store(
            fpspy_arch::encode_round_config(mode, dazftz).bits(),
            Ordering::Relaxed,
        );
        CONTROL_ROUNDING.store(true, Ordering::Relaxed);
        debug!("configuring rounding control to {:#010x}", OUR_ROUND.load(Ordering::Relaxed));
    }

    let tid = unsafe { libc::gettid() };
    if bringup_monitoring_context(tid).is_err() {
        error!("failed to start up monitoring context at startup");
        return Err(());
    }

    let timers = cfg.poisson.is_some();
    let alarm_sig = cfg.timer.alarm_signal();

    let mut mask = vec![libc::SIGINT, libc::SIGTRAP];
    if timers {
        mask.push(alarm_sig);
    }
    install(libc::SIGFPE, fpe_handler, &mask, OLD_FPE.get());

    mask.push(libc::SIGFPE);
    install(libc::SIGTRAP, brk_handler, &mask, OLD_TRAP.get());

    let mut mask = vec![libc::SIGTRAP];
    if timers {
        mask.push(alarm_sig);
    }
    install(libc::SIGINT, int_handler, &mask, OLD_INT.get());

    if timers {
        debug!("setting up timer interrupt handler");
        install(alarm_sig, alrm_handler, &[libc::SIGINT], OLD_ALRM.get());
    }

    if cfg.kernel {
        kernel::try_register(fpe_handler, brk_handler);
    }

    shims::orig_feenableexcept(fpspy_arch::fe_bits(cfg.except_list));

    if cfg.kickstart {
        debug!("kickstart: waiting for an external break-trap to begin");
    } else {
        kick_self();
    }

    Ok(())
}
