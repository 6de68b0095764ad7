mod context;

pub mod asm;

use core::ffi::c_int;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::{DazFtzMode, FpExcept, RoundConfig, RoundMode};

pub use self::asm::{config_fp_csr_for_local, cycle_count, read_fp_csr, write_fp_csr};
pub use self::context::*;

/// FCSR sticky flags: NX, UF, OF, DZ, NV in bits 0..=4. The trap-enable CSR
/// (0x880) mirrors the same bit positions; it exists only on instrumented
/// builds (`riscv-fp-traps` feature).
const FFLAGS_ALL: u32 = 0x1f;

/// FCSR/enable value for FP code run by FPSpy itself: nothing enabled, no
/// flags, round-to-nearest.
pub(crate) const FP_CSR_OURS: u64 = 0;

/// frm occupies bits 5..=7. There is no DAZ/FTZ equivalent.
const FCSR_ROUND: u32 = 0xe0;

static TRAP_ENABLE_BASE: AtomicU32 = AtomicU32::new(FFLAGS_ALL);

pub(crate) const FE_EXCEPT_TABLE: &[(FpExcept, c_int)] = &[
    (FpExcept::INEXACT, 0x01),
    (FpExcept::UNDERFLOW, 0x02),
    (FpExcept::OVERFLOW, 0x04),
    (FpExcept::DIVZERO, 0x08),
    (FpExcept::INVALID, 0x10),
    // DENORM: a subnormal result is indistinguishable from a zero one.
];

const fn fflags_bit(which: FpExcept) -> u32 {
    let b = which.bits();
    if b == FpExcept::INEXACT.bits() {
        0x01
    } else if b == FpExcept::UNDERFLOW.bits() {
        0x02
    } else if b == FpExcept::OVERFLOW.bits() {
        0x04
    } else if b == FpExcept::DIVZERO.bits() {
        0x08
    } else if b == FpExcept::INVALID.bits() {
        0x10
    } else {
        // No denormal flag on riscv.
        0
    }
}

/// Re-enables hardware trap delivery for every reportable exception class.
pub fn clear_trap_mask() {
    TRAP_ENABLE_BASE.store(FFLAGS_ALL, Ordering::Relaxed);
}

/// Removes `which` from the set of exceptions delivered as traps.
pub fn set_trap_mask(which: FpExcept) {
    TRAP_ENABLE_BASE.fetch_and(!fflags_bit(which), Ordering::Relaxed);
}

/// Restores `which` to the set of exceptions delivered as traps.
pub fn reset_trap_mask(which: FpExcept) {
    TRAP_ENABLE_BASE.fetch_or(fflags_bit(which), Ordering::Relaxed);
}

pub(crate) fn enable_mask() -> u32 {
    TRAP_ENABLE_BASE.load(Ordering::Relaxed)
}

pub(crate) fn flag_mask() -> u32 {
    enable_mask()
}

/// Stock riscv delivers no FP traps at all; the trap-enable CSR is an
/// extension present only on instrumented builds.
pub fn supports_fp_traps() -> bool {
    cfg!(feature = "riscv-fp-traps")
}

/// riscv cannot report denormals through any CSR.
pub fn have_special_fp_csr_exception(_which: FpExcept) -> bool {
    false
}

/// Builds the native frm encoding. riscv has neither DAZ nor FTZ; asking for
/// them is reported and dropped.
pub fn encode_round_config(mode: RoundMode, dazftz: DazFtzMode) -> RoundConfig {
    let frm: u32 = match mode {
        RoundMode::Nearest => 0,
        RoundMode::Zero => 1,
        RoundMode::Negative => 2,
        RoundMode::Positive => 3,
        RoundMode::NearestMaxMag => 4,
        RoundMode::Dynamic => 7,
    };
    if !matches!(dazftz, DazFtzMode::Off) {
        error!("riscv has no DAZ or FTZ behavior; ignoring");
    }
    RoundConfig::from_bits(frm << 5)
}

/// Rounding direction stored in a [`RoundConfig`].
pub fn round_mode(config: RoundConfig) -> RoundMode {
    match (config.bits() >> 5) & 0x7 {
        1 => RoundMode::Zero,
        2 => RoundMode::Negative,
        3 => RoundMode::Positive,
        4 => RoundMode::NearestMaxMag,
        7 => RoundMode::Dynamic,
        _ => RoundMode::Nearest,
    }
}

/// DAZ/FTZ setting stored in a [`RoundConfig`]; always `Off` on riscv.
pub fn daz_ftz_mode(_config: RoundConfig) -> DazFtzMode {
    DazFtzMode::Off
}

pub(crate) const ROUND_DAZ_FTZ_MASK: u32 = FCSR_ROUND;

/// Single-stepping is done by breakpoint patching, so executable pages must
/// be writable before monitoring starts.
pub fn process_init() -> Result<(), i32> {
    debug!("riscv64 process init");
    crate::patch::make_exec_regions_writable()
}

pub fn process_deinit() {
    debug!("riscv64 process deinit");
}

/// Per-thread setup, called with the thread's first saved break-trap context.
///
/// # Safety
///
/// `uc` must point to a live `ucontext_t` delivered to a signal handler on
/// the current thread.
pub unsafe fn thread_init(uc: *mut libc::ucontext_t) -> Result<(), i32> {
    let _ = uc;
    debug!("riscv64 thread init");
    Ok(())
}

pub fn thread_deinit() {
    debug!("riscv64 thread deinit");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_config_encodes_frm_bits() {
        assert_eq!(encode_round_config(RoundMode::Zero, DazFtzMode::Off).bits(), 1 << 5);
        let cfg = encode_round_config(RoundMode::Dynamic, DazFtzMode::Off);
        assert_eq!(round_mode(cfg), RoundMode::Dynamic);
    }

    #[test]
    fn trap_mask_tracks_per_exception_bits() {
        clear_trap_mask();
        set_trap_mask(FpExcept::INEXACT);
        assert_eq!(enable_mask(), 0x1e);
        reset_trap_mask(FpExcept::INEXACT);
        assert_eq!(enable_mask(), FFLAGS_ALL);
    }
}
