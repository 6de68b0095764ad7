//! Poisson duty-cycle sampler.
//!
//! Alternates each thread between ON (traps unmasked) and OFF (traps masked)
//! intervals with exponentially distributed durations, yielding a
//! PASTA-unbiased time-average view of the target's FP-event rate. Each
//! context carries its own linear-congruential generator so FPSpy never
//! touches the target's RNG state, and every FP operation here runs under
//! the local FP-CSR bracket so the target's flags stay untouched.

use libc::{itimerval, timeval};

use crate::config;

/// Interval caps, so a long exponential tail cannot park the sampler.
pub const MAX_US_ON: u64 = 10_000;
pub const MAX_US_OFF: u64 = 1_000_000;

const LCG_A: u64 = 0x5deece66d;
const LCG_C: u64 = 0xb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Off,
    On,
}

pub struct SamplerState {
    pub phase: Phase,
    /// An alarm landed while the trap machine was mid-instruction; the next
    /// break-trap performs the deferred update.
    pub delayed_processing: bool,
    xi: u64,
    pub on_mean_us: u64,
    pub off_mean_us: u64,
}

impl SamplerState {
    pub const fn new() -> Self {
        Self {
            phase: Phase::On,
            delayed_processing: false,
            xi: 0,
            on_mean_us: 0,
            off_mean_us: 0,
        }
    }

    pub fn seed(&mut self, seed: u64) {
        self.xi = seed;
    }

    /// Advances the LCG over the full 64-bit space.
    fn pump(&mut self) -> u64 {
        self.xi = self.xi.wrapping_mul(LCG_A).wrapping_add(LCG_C);
        self.xi
    }
}

/// Draws an Exp(1/mean_us) interval in microseconds.
///
/// The FP math runs under the local FP-CSR so it can neither trap nor leak
/// flags into the target's visible state.
pub fn next_exp(s: &mut SamplerState, mean_us: u64) -> u64 {
    let old = fpspy_arch::config_fp_csr_for_local();

    let r = s.pump() & !1u64; // keep u strictly below 1.0
    let u = r as f64 / u64::MAX as f64;
    let v = -(1.0 - u).ln() * mean_us as f64;
    let ret = if v >= u64::MAX as f64 { u64::MAX } else { v as u64 };

    unsafe { fpspy_arch::write_fp_csr(old) };
    ret
}

/// A zero interval would disarm the timer, and an unbounded one would park
/// the sampler; clamp to [1, cap].
pub fn clamp_interval(us: u64, cap: u64) -> u64 {
    us.clamp(1, cap)
}

fn arm_timer(us: u64) {
    let it = itimerval {
        it_interval: timeval { tv_sec: 0, tv_usec: 0 },
        it_value: timeval {
            tv_sec: (us / 1_000_000) as _,
            tv_usec: (us % 1_000_000) as _,
        },
    };
    let which = config::get().timer.itimer_which();
    if unsafe { libc::setitimer(which, &it, core::ptr::null_mut()) } != 0 {
        error!("failed to arm interval timer");
    }
}

/// Seeds and starts a thread's sampler. Without `FPSPY_POISSON` the sampler
/// sits permanently ON and no timer runs.
pub fn init_sampler(s: &mut SamplerState) {
    let cfg = config::get();

    s.seed(cfg.seed.unwrap_or_else(fpspy_arch::cycle_count));
    s.phase = Phase::On;
    s.delayed_processing = false;

    let Some((on_mean_us, off_mean_us)) = cfg.poisson else {
        debug!("sampler without timing");
        return;
    };
    s.on_mean_us = on_mean_us;
    s.off_mean_us = off_mean_us;

    let n = clamp_interval(next_exp(s, on_mean_us), MAX_US_ON);
    arm_timer(n);
    debug!("timer initialized for {n} us");
}

/// Flips the sampler phase in the saved context and schedules the next flip.
///
/// Only legal in AWAIT_FPE: the alarm handler defers to the next break-trap
/// otherwise. ON→OFF masks traps, OFF→ON unmasks; flags are cleared and any
/// single-step armed state is cleared either way.
///
/// # Safety
///
/// `uc` must be the live signal context of the current thread, and
/// `trap_state` the context's single-step scratch cell.
pub unsafe fn update_sampler(s: &mut SamplerState, uc: *mut libc::ucontext_t, trap_state: &mut u64) {
    unsafe {
        fpspy_arch::clear_fp_exceptions(uc);
        match s.phase {
            Phase::On => {
                debug!("switching from on to off");
                fpspy_arch::mask_fp_traps(uc);
            }
            Phase::Off => {
                debug!("switching from off to on");
                fpspy_arch::unmask_fp_traps(uc);
            }
        }
        fpspy_arch::reset_trap(uc, trap_state);
    }

    // Draw the duration of the phase being entered.
    let n = match s.phase {
        Phase::On => clamp_interval(next_exp(s, s.off_mean_us), MAX_US_OFF),
        Phase::Off => clamp_interval(next_exp(s, s.on_mean_us), MAX_US_ON),
    };

    s.phase = match s.phase {
        Phase::On => Phase::Off,
        Phase::Off => Phase::On,
    };

    if s.delayed_processing {
        debug!("completed delayed processing");
        s.delayed_processing = false;
    }

    arm_timer(n);
    debug!(
        "timer reinitialized for {n} us, state {}",
        if s.phase == Phase::On { "ON" } else { "off" }
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lcg_is_deterministic_for_a_fixed_seed() {
        let mut a = SamplerState::new();
        let mut b = SamplerState::new();
        a.seed(12345);
        b.seed(12345);
        for _ in 0..100 {
            assert_eq!(a.pump(), b.pump());
        }
        b.seed(54321);
        assert_ne!(a.pump(), b.pump());
    }

    #[test]
    fn next_exp_preserves_the_machine_fp_csr() {
        let before = fpspy_arch::read_fp_csr();
        let mut s = SamplerState::new();
        s.seed(7);
        for _ in 0..1000 {
            let _ = next_exp(&mut s, 1000);
        }
        assert_eq!(fpspy_arch::read_fp_csr(), before);
    }

    #[test]
    fn draws_average_near_the_mean() {
        let mut s = SamplerState::new();
        s.seed(99);
        let mean = 1000u64;
        let n = 20_000;
        let total: u64 = (0..n).map(|_| next_exp(&mut s, mean)).sum();
        let avg = total / n;
        assert!((800..1200).contains(&avg), "average {avg} too far from {mean}");
    }

    #[test]
    fn clamped_draws_stay_in_range() {
        let mut s = SamplerState::new();
        s.seed(1);
        for _ in 0..10_000 {
            let on = clamp_interval(next_exp(&mut s, 5_000), MAX_US_ON);
            assert!((1..=MAX_US_ON).contains(&on));
            let off = clamp_interval(next_exp(&mut s, 500_000), MAX_US_OFF);
            assert!((1..=MAX_US_OFF).contains(&off));
        }
    }
}
