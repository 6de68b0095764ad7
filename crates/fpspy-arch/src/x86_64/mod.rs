mod context;

pub mod asm;

use core::ffi::c_int;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::{DazFtzMode, FpExcept, RoundConfig, RoundMode};

pub use self::asm::{config_fp_csr_for_local, cycle_count, read_fp_csr, write_fp_csr};
pub use self::context::*;

/// MXCSR exception-flag bits (IE, DE, ZE, OE, UE, PE) occupy bits 0..=5; the
/// corresponding mask bits are the same pattern shifted left by 7.
const MXCSR_FLAG_SHIFT: u32 = 0;
const MXCSR_MASK_SHIFT: u32 = 7;

/// MXCSR value for FP code run by FPSpy itself: all exceptions masked, flags
/// clear, round-to-nearest, DAZ/FTZ off.
pub(crate) const MXCSR_OURS: u32 = 0x1f80;

/// Rounding control (bits 13..=14), DAZ (bit 6), FTZ (bit 15).
const MXCSR_ROUND_DAZ_FTZ: u32 = 0xe040;

/// Which of the six exception classes get hardware trap delivery, as MXCSR
/// base bits. Written during startup configuration, read by every handler.
static TRAP_ENABLE_BASE: AtomicU32 = AtomicU32::new(0x3f);

pub(crate) const FE_EXCEPT_TABLE: &[(FpExcept, c_int)] = &[
    (FpExcept::INVALID, 0x01),
    (FpExcept::DIVZERO, 0x04),
    (FpExcept::OVERFLOW, 0x08),
    (FpExcept::UNDERFLOW, 0x10),
    (FpExcept::INEXACT, 0x20),
    // DENORM: MXCSR bit 1, not exposed through fenv.
];

/// [`FpExcept`] deliberately mirrors the MXCSR flag order (IE, DE, ZE, OE,
/// UE, PE), so the base-bit mapping is the identity.
const fn mxcsr_base_bit(which: FpExcept) -> u32 {
    which.bits() & 0x3f
}

/// Re-enables hardware trap delivery for all six exception classes.
pub fn clear_trap_mask() {
    TRAP_ENABLE_BASE.store(0x3f, Ordering::Relaxed);
}

/// Removes `which` from the set of exceptions delivered as traps.
pub fn set_trap_mask(which: FpExcept) {
    TRAP_ENABLE_BASE.fetch_and(!mxcsr_base_bit(which), Ordering::Relaxed);
}

/// Restores `which` to the set of exceptions delivered as traps.
pub fn reset_trap_mask(which: FpExcept) {
    TRAP_ENABLE_BASE.fetch_or(mxcsr_base_bit(which), Ordering::Relaxed);
}

pub(crate) fn flag_mask() -> u32 {
    TRAP_ENABLE_BASE.load(Ordering::Relaxed) << MXCSR_FLAG_SHIFT
}

pub(crate) fn unmask_mask() -> u32 {
    TRAP_ENABLE_BASE.load(Ordering::Relaxed) << MXCSR_MASK_SHIFT
}

/// SSE delivers `#XM` for unmasked exceptions on every x86-64.
pub fn supports_fp_traps() -> bool {
    true
}

/// Denormal detection is in MXCSR (DE, bit 1) but absent from the fenv API,
/// so aggregate mode probes it here.
pub fn have_special_fp_csr_exception(which: FpExcept) -> bool {
    which == FpExcept::DENORM && read_fp_csr().bits() & 0x2 != 0
}

/// Builds the native rounding/DAZ/FTZ encoding from the portable description.
pub fn encode_round_config(mode: RoundMode, dazftz: DazFtzMode) -> RoundConfig {
    let mut bits = match mode {
        RoundMode::Negative => 0x2000,
        RoundMode::Positive => 0x4000,
        RoundMode::Zero => 0x6000,
        _ => 0,
    };
    if matches!(dazftz, DazFtzMode::Daz | DazFtzMode::DazFtz) {
        bits |= 0x0040;
    }
    if matches!(dazftz, DazFtzMode::Ftz | DazFtzMode::DazFtz) {
        bits |= 0x8000;
    }
    RoundConfig::from_bits(bits)
}

/// Rounding direction stored in a [`RoundConfig`].
pub fn round_mode(config: RoundConfig) -> RoundMode {
    match config.bits() & 0x6000 {
        0x2000 => RoundMode::Negative,
        0x4000 => RoundMode::Positive,
        0x6000 => RoundMode::Zero,
        _ => RoundMode::Nearest,
    }
}

/// DAZ/FTZ setting stored in a [`RoundConfig`].
pub fn daz_ftz_mode(config: RoundConfig) -> DazFtzMode {
    match (config.bits() & 0x0040 != 0, config.bits() & 0x8000 != 0) {
        (false, false) => DazFtzMode::Off,
        (false, true) => DazFtzMode::Ftz,
        (true, false) => DazFtzMode::Daz,
        (true, true) => DazFtzMode::DazFtz,
    }
}

pub(crate) const ROUND_DAZ_FTZ_MASK: u32 = MXCSR_ROUND_DAZ_FTZ;

/// One-time per-process setup. Nothing to do here: single-stepping uses the
/// RFLAGS trap flag, so no pages need to become writable.
pub fn process_init() -> Result<(), i32> {
    debug!("x86_64 process init");
    Ok(())
}

pub fn process_deinit() {
    debug!("x86_64 process deinit");
}

/// Per-thread setup, called with the thread's first saved break-trap context.
///
/// # Safety
///
/// `uc` must point to a live `ucontext_t` delivered to a signal handler on
/// the current thread.
pub unsafe fn thread_init(uc: *mut libc::ucontext_t) -> Result<(), i32> {
    let _ = uc;
    debug!("x86_64 thread init");
    Ok(())
}

pub fn thread_deinit() {
    debug!("x86_64 thread deinit");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_config_encodes_native_mxcsr_bits() {
        assert_eq!(encode_round_config(RoundMode::Nearest, DazFtzMode::Off).bits(), 0);
        assert_eq!(encode_round_config(RoundMode::Zero, DazFtzMode::Off).bits(), 0x6000);
        let cfg = encode_round_config(RoundMode::Positive, DazFtzMode::DazFtz);
        assert_eq!(cfg.bits(), 0x4000 | 0x0040 | 0x8000);
        assert_eq!(round_mode(cfg), RoundMode::Positive);
        assert_eq!(daz_ftz_mode(cfg), DazFtzMode::DazFtz);
    }

    #[test]
    fn trap_mask_tracks_per_exception_bits() {
        clear_trap_mask();
        assert_eq!(unmask_mask(), 0x3f << 7);
        set_trap_mask(FpExcept::INEXACT);
        assert_eq!(flag_mask(), 0x1f);
        reset_trap_mask(FpExcept::INEXACT);
        assert_eq!(flag_mask(), 0x3f);
    }
}
