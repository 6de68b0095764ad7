mod context;

pub mod asm;

use core::ffi::c_int;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::{DazFtzMode, FpCsr, FpExcept, RoundConfig, RoundMode};

pub use self::asm::{config_fp_csr_for_local, cycle_count, read_fp_csr, write_fp_csr};
pub use self::context::*;

/// FPCR trap-enable bits: IOE..IXE in bits 8..=12, IDE in bit 15. The
/// matching FPSR sticky flags sit exactly eight bits lower (IOC..IXC in
/// 0..=4, IDC in 7).
const FPCR_ENABLE_ALL: u32 = 0x9f00;
const ENABLE_TO_FLAG_SHIFT: u32 = 8;

/// FPCR/FPSR value for FP code run by FPSpy itself: nothing enabled, no
/// flags, round-to-nearest, FZ off.
pub(crate) const FP_CSR_OURS: u64 = 0;

/// RMode (bits 22..=23) plus FZ (bit 24); aarch64 has no DAZ.
const FPCR_ROUND_FTZ: u32 = 0x01c0_0000;

static TRAP_ENABLE_BASE: AtomicU32 = AtomicU32::new(FPCR_ENABLE_ALL);

pub(crate) const FE_EXCEPT_TABLE: &[(FpExcept, c_int)] = &[
    (FpExcept::INVALID, 1),
    (FpExcept::DIVZERO, 2),
    (FpExcept::OVERFLOW, 4),
    (FpExcept::UNDERFLOW, 8),
    (FpExcept::INEXACT, 16),
    // DENORM: FPSR.IDC, not exposed through fenv.
];

const fn fpcr_enable_bit(which: FpExcept) -> u32 {
    let b = which.bits();
    if b == FpExcept::INVALID.bits() {
        1 << 8
    } else if b == FpExcept::DIVZERO.bits() {
        1 << 9
    } else if b == FpExcept::OVERFLOW.bits() {
        1 << 10
    } else if b == FpExcept::UNDERFLOW.bits() {
        1 << 11
    } else if b == FpExcept::INEXACT.bits() {
        1 << 12
    } else if b == FpExcept::DENORM.bits() {
        1 << 15
    } else {
        0
    }
}

/// Re-enables hardware trap delivery for all six exception classes.
pub fn clear_trap_mask() {
    TRAP_ENABLE_BASE.store(FPCR_ENABLE_ALL, Ordering::Relaxed);
}

/// Removes `which` from the set of exceptions delivered as traps.
pub fn set_trap_mask(which: FpExcept) {
    TRAP_ENABLE_BASE.fetch_and(!fpcr_enable_bit(which), Ordering::Relaxed);
}

/// Restores `which` to the set of exceptions delivered as traps.
pub fn reset_trap_mask(which: FpExcept) {
    TRAP_ENABLE_BASE.fetch_or(fpcr_enable_bit(which), Ordering::Relaxed);
}

pub(crate) fn enable_mask() -> u32 {
    TRAP_ENABLE_BASE.load(Ordering::Relaxed)
}

pub(crate) fn flag_mask() -> u32 {
    enable_mask() >> ENABLE_TO_FLAG_SHIFT
}

/// FPCR trap enables are an optional architecture feature: probe by setting
/// the enable bits and reading back whether any stuck.
pub fn supports_fp_traps() -> bool {
    let old = read_fp_csr();
    unsafe { write_fp_csr(FpCsr::from_bits((FPCR_ENABLE_ALL as u64) << 32)) };
    let probed = read_fp_csr();
    unsafe { write_fp_csr(old) };
    (probed.bits() >> 32) as u32 & FPCR_ENABLE_ALL != 0
}

/// Denormal detection is FPSR.IDC (bit 7), absent from the fenv API.
pub fn have_special_fp_csr_exception(which: FpExcept) -> bool {
    which == FpExcept::DENORM && read_fp_csr().bits() & 0x80 != 0
}

/// Builds the native rounding/FTZ encoding. aarch64 has no DAZ; asking for
/// it degrades to plain FTZ (or nothing) with an error.
pub fn encode_round_config(mode: RoundMode, dazftz: DazFtzMode) -> RoundConfig {
    let mut bits = match mode {
        RoundMode::Positive => 1 << 22,
        RoundMode::Negative => 2 << 22,
        RoundMode::Zero => 3 << 22,
        _ => 0,
    };
    if matches!(dazftz, DazFtzMode::Daz | DazFtzMode::DazFtz) {
        error!("aarch64 has no DAZ; ignoring");
    }
    if matches!(dazftz, DazFtzMode::Ftz | DazFtzMode::DazFtz) {
        bits |= 1 << 24;
    }
    RoundConfig::from_bits(bits)
}

/// Rounding direction stored in a [`RoundConfig`].
pub fn round_mode(config: RoundConfig) -> RoundMode {
    match (config.bits() >> 22) & 0x3 {
        1 => RoundMode::Positive,
        2 => RoundMode::Negative,
        3 => RoundMode::Zero,
        _ => RoundMode::Nearest,
    }
}

/// DAZ/FTZ setting stored in a [`RoundConfig`].
pub fn daz_ftz_mode(config: RoundConfig) -> DazFtzMode {
    if config.bits() & (1 << 24) != 0 {
        DazFtzMode::Ftz
    } else {
        DazFtzMode::Off
    }
}

pub(crate) const ROUND_DAZ_FTZ_MASK: u32 = FPCR_ROUND_FTZ;

/// Single-stepping is done by breakpoint patching, so executable pages must
/// be writable before monitoring starts.
pub fn process_init() -> Result<(), i32> {
    debug!("aarch64 process init");
    crate::patch::make_exec_regions_writable()
}

pub fn process_deinit() {
    debug!("aarch64 process deinit");
}

/// Per-thread setup, called with the thread's first saved break-trap context.
///
/// # Safety
///
/// `uc` must point to a live `ucontext_t` delivered to a signal handler on
/// the current thread.
pub unsafe fn thread_init(uc: *mut libc::ucontext_t) -> Result<(), i32> {
    let _ = uc;
    debug!("aarch64 thread init");
    Ok(())
}

pub fn thread_deinit() {
    debug!("aarch64 thread deinit");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_config_encodes_native_fpcr_bits() {
        let cfg = encode_round_config(RoundMode::Zero, DazFtzMode::Ftz);
        assert_eq!(cfg.bits(), (3 << 22) | (1 << 24));
        assert_eq!(round_mode(cfg), RoundMode::Zero);
        assert_eq!(daz_ftz_mode(cfg), DazFtzMode::Ftz);
    }

    #[test]
    fn trap_mask_tracks_per_exception_bits() {
        clear_trap_mask();
        assert_eq!(enable_mask(), FPCR_ENABLE_ALL);
        set_trap_mask(FpExcept::DENORM);
        assert_eq!(enable_mask(), 0x1f00);
        reset_trap_mask(FpExcept::DENORM);
        assert_eq!(enable_mask(), FPCR_ENABLE_ALL);
    }
}
