//! Accessors for the FP and trap state saved in a signal context.
//!
//! All functions here take the raw `ucontext_t` handed to a signal handler.
//! Rewriting it changes what the kernel restores on handler return, which is
//! exactly how the monitoring core flips exception masks and single-stepping
//! under the target's feet.

use libc::{REG_EFL, REG_RIP, REG_RSP, ucontext_t};

use crate::{FpCsr, RoundConfig};

/// RFLAGS trap flag; arms a `#DB` on the next instruction.
const RFLAGS_TF: i64 = 0x100;

unsafe fn mxcsr_ptr(uc: *mut ucontext_t) -> Option<*mut u32> {
    let fpregs = unsafe { (*uc).uc_mcontext.fpregs };
    if fpregs.is_null() {
        error!("signal context carries no FP state");
        None
    } else {
        Some(unsafe { &raw mut (*fpregs).mxcsr })
    }
}

/// Clears the sticky exception flags tracked by the current trap mask.
///
/// # Safety
///
/// `uc` must point to a live `ucontext_t` delivered to a signal handler.
pub unsafe fn clear_fp_exceptions(uc: *mut ucontext_t) {
    if let Some(mxcsr) = unsafe { mxcsr_ptr(uc) } {
        unsafe { *mxcsr &= !super::flag_mask() };
    }
}

/// Masks trap delivery for the tracked exceptions in the saved context.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn mask_fp_traps(uc: *mut ucontext_t) {
    if let Some(mxcsr) = unsafe { mxcsr_ptr(uc) } {
        unsafe { *mxcsr |= super::unmask_mask() };
    }
}

/// Unmasks trap delivery for the tracked exceptions in the saved context.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn unmask_fp_traps(uc: *mut ucontext_t) {
    if let Some(mxcsr) = unsafe { mxcsr_ptr(uc) } {
        unsafe { *mxcsr &= !super::unmask_mask() };
    }
}

/// Arms a single-step trap on the instruction following the one in `uc`.
///
/// x86-64 has a hardware single-step flag, so the scratch word is unused and
/// no code patching happens.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn set_trap(uc: *mut ucontext_t, _state: &mut u64) {
    unsafe { (*uc).uc_mcontext.gregs[REG_EFL as usize] |= RFLAGS_TF };
}

/// Disarms the single-step trap in the saved context.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn reset_trap(uc: *mut ucontext_t, _state: &mut u64) {
    unsafe { (*uc).uc_mcontext.gregs[REG_EFL as usize] &= !RFLAGS_TF };
}

/// Rounding/DAZ/FTZ bits of the saved context.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn round_config(uc: *mut ucontext_t) -> RoundConfig {
    match unsafe { mxcsr_ptr(uc) } {
        Some(mxcsr) => RoundConfig::from_bits(unsafe { *mxcsr } & super::ROUND_DAZ_FTZ_MASK),
        None => RoundConfig::default(),
    }
}

/// Applies `config` to the rounding/DAZ/FTZ bits of the saved context.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn set_round_config(uc: *mut ucontext_t, config: RoundConfig) {
    if let Some(mxcsr) = unsafe { mxcsr_ptr(uc) } {
        unsafe {
            *mxcsr &= !super::ROUND_DAZ_FTZ_MASK;
            *mxcsr |= config.bits() & super::ROUND_DAZ_FTZ_MASK;
        }
    }
}

/// Rounding/DAZ/FTZ bits of the live MXCSR.
pub fn machine_round_config() -> RoundConfig {
    RoundConfig::from_bits(super::read_fp_csr().bits() as u32 & super::ROUND_DAZ_FTZ_MASK)
}

/// Faulting instruction pointer.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn ip(uc: *const ucontext_t) -> u64 {
    unsafe { (*uc).uc_mcontext.gregs[REG_RIP as usize] as u64 }
}

/// Stack pointer at the fault.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn sp(uc: *const ucontext_t) -> u64 {
    unsafe { (*uc).uc_mcontext.gregs[REG_RSP as usize] as u64 }
}

/// FP-CSR snapshot from the saved context.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn fp_csr(uc: *const ucontext_t) -> FpCsr {
    let fpregs = unsafe { (*uc).uc_mcontext.fpregs };
    if fpregs.is_null() {
        FpCsr::from_bits(0)
    } else {
        FpCsr::from_bits(unsafe { (*fpregs).mxcsr } as u64)
    }
}

/// General-purpose condition/status register (RFLAGS) from the saved context.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn gp_csr(uc: *const ucontext_t) -> u64 {
    unsafe { (*uc).uc_mcontext.gregs[REG_EFL as usize] as u64 }
}

/// Copies up to `dest.len()` bytes of the faulting instruction. x86-64
/// instructions are at most 15 bytes and have no alignment, so the copy is
/// bounded by the buffer alone.
///
/// # Safety
///
/// See [`clear_fp_exceptions`]; additionally the faulting IP must map at
/// least `dest.len()` readable bytes, which holds for any IP the CPU just
/// fetched an instruction from.
pub unsafe fn instr_bytes(uc: *const ucontext_t, dest: &mut [u8]) -> usize {
    let n = dest.len().min(crate::MAX_INSTR_BYTES);
    unsafe {
        core::ptr::copy_nonoverlapping(ip(uc) as *const u8, dest.as_mut_ptr(), n);
    }
    n
}
