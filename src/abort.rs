//! The disengagement protocol.
//!
//! Invoked when the target starts manipulating FP state itself, when a
//! handler sees a state it cannot explain, or when a handler cannot find its
//! monitoring context. Disengagement is one-way: traps are masked at the
//! hardware, the previous signal dispositions come back, every live trace
//! gets an abort marker, and the `ABORTED` flag stops all further activity.

use core::sync::atomic::Ordering;

use fpspy_trace::TraceRecord;

use crate::config::{self, Mode};
use crate::{ABORTED, INITED, context, shims, trace, trap};

pub(crate) fn abort_operation(reason: &str) {
    if !INITED.load(Ordering::Acquire) {
        // Abort can arrive before the constructor finished (another
        // library's constructor touching fenv, say).
        debug!("initializing before aborting");
        crate::init();
        debug!("done initializing");
    }

    if ABORTED.load(Ordering::Acquire) {
        return;
    }

    let all = fpspy_arch::fe_bits(fpspy_arch::FpExcept::all());
    shims::orig_fedisableexcept(all);
    shims::orig_feclearexcept(all);
    trap::restore_fpe_action();

    if config::get().mode == Mode::Individual {
        let tid = unsafe { libc::gettid() };
        let mc = context::find(tid);

        match mc {
            None => error!("cannot find monitoring context to write abort record"),
            Some(mc) => {
                let mc = unsafe { &mut *mc };
                mc.state = context::State::Abort;
                let elapsed = fpspy_arch::cycle_count() - mc.start_time;
                trace::push_record(mc, TraceRecord::abort_marker(elapsed));
                trace::flush(mc);
            }
        }

        // The saved-context FP and trap bits still need restoring. A
        // break-trap on ourselves lets the handler do it, unless abort was
        // called from inside that very handler and the restore is already
        // underway.
        let aborting_in_trap = mc.is_some_and(|mc| unsafe { (*mc).aborting_in_trap });
        if !aborting_in_trap {
            trap::kick_self();
        }
    }

    trap::restore_brk_action();

    ABORTED.store(true, Ordering::Release);
    debug!("aborted operation because {reason}");
}
