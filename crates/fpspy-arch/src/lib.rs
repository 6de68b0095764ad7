//! FP control/status register and trap abstractions for the architectures
//! FPSpy runs on.
//!
//! The monitoring core is architecture-agnostic: everything it needs from the
//! CPU goes through this crate. Each supported architecture provides the same
//! flat function surface (selected by `cfg_if` below):
//!
//! - live FP-CSR access ([`read_fp_csr`], [`write_fp_csr`],
//!   [`config_fp_csr_for_local`]) and the cycle counter;
//! - a process-wide trap-delivery mask over the six IEEE-754 exception
//!   classes ([`set_trap_mask`], [`reset_trap_mask`], [`clear_trap_mask`]);
//! - accessors for the FP and trap state saved in a signal context
//!   (`clear_fp_exceptions`, `mask_fp_traps`, `set_trap`, ...);
//! - rounding/DAZ/FTZ encoding behind the opaque [`RoundConfig`];
//! - per-process and per-thread lifecycle hooks.
//!
//! Single-step semantics differ per architecture: x86-64 toggles the trap
//! flag in the saved RFLAGS, while aarch64 and riscv64 patch a breakpoint
//! instruction over the word following the faulting instruction. The patch
//! variants stash the displaced instruction in the caller-owned scratch word
//! passed to [`set_trap`]/[`reset_trap`]; callers must pair the two calls on
//! the same scratch cell.

#[macro_use]
extern crate log;

use core::ffi::c_int;

use bitflags::bitflags;

bitflags! {
    /// The six IEEE-754 exception classes FPSpy can observe.
    ///
    /// `DENORM` is not part of the standard C floating-point environment; on
    /// architectures whose FP-CSR cannot report it,
    /// [`have_special_fp_csr_exception`] returns `false` for it and it never
    /// reaches trace or aggregate output.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FpExcept: u32 {
        const INVALID = 1 << 0;
        const DENORM = 1 << 1;
        const DIVZERO = 1 << 2;
        const OVERFLOW = 1 << 3;
        const UNDERFLOW = 1 << 4;
        const INEXACT = 1 << 5;
    }
}

/// IEEE-754 rounding direction.
///
/// `NearestMaxMag` and `Dynamic` exist only on riscv64; encoding either on
/// another architecture falls back to `Nearest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundMode {
    Nearest,
    Negative,
    Positive,
    Zero,
    NearestMaxMag,
    Dynamic,
}

/// Denormals-are-zero / flush-to-zero handling.
///
/// Not every architecture supports both bits: aarch64 has FTZ but no DAZ,
/// riscv64 has neither. Unsupported bits are dropped on encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DazFtzMode {
    Off,
    Ftz,
    Daz,
    DazFtz,
}

/// Snapshot of the architecture's FP control/status register(s).
///
/// Opaque to the core; only this crate interprets the bits. On x86-64 this is
/// MXCSR, on aarch64 `FPCR:FPSR` packed into one word, on riscv64 the
/// trap-enable CSR and FCSR packed likewise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpCsr(u64);

impl FpCsr {
    /// Raw register bits, for logging and trace records.
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub(crate) const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

/// Rounding + DAZ/FTZ configuration in the architecture's native encoding.
///
/// Obtained from [`round_config`]/[`machine_round_config`] or built with
/// [`encode_round_config`]; applied with [`set_round_config`]. The core
/// treats it as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoundConfig(u32);

impl RoundConfig {
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Rebuilds a config previously obtained through [`Self::bits`]. The
    /// encoding stays architecture-private; this only exists so callers can
    /// stash a config in atomic storage.
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }
}

/// Longest instruction FPSpy will copy into a trace record. x86-64 sets the
/// bound; fixed-width architectures zero-pad.
pub const MAX_INSTR_BYTES: usize = 15;

#[cfg(any(target_arch = "aarch64", target_arch = "riscv64"))]
mod patch;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use self::x86_64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use self::aarch64::*;
    } else if #[cfg(target_arch = "riscv64")] {
        mod riscv;
        pub use self::riscv::*;
    }
}

/// Translates an [`FpExcept`] set into the C floating-point environment
/// bitmask (`FE_*`) used when calling the target's fenv routines.
///
/// `DENORM` has no fenv encoding anywhere and contributes nothing.
pub fn fe_bits(set: FpExcept) -> c_int {
    let mut bits = 0;
    for (exc, fe) in FE_EXCEPT_TABLE {
        if set.contains(*exc) {
            bits |= *fe;
        }
    }
    bits
}
