//! Accessors for the FP and trap state saved in a signal context.
//!
//! The saved FP state is the D-extension block of the `__fpregs` union (the
//! riscv64gc baseline). The trap-enable CSR is not part of the kernel's
//! saved context, so masking and unmasking write the live CSR directly; that
//! is equivalent here because the handler runs on the thread whose context
//! is being edited.

use libc::ucontext_t;

use crate::patch::{SCRATCH_EMPTY, SCRATCH_STASHED, decode_scratch, encode_scratch};
use crate::{FpCsr, RoundConfig};

const REG_PC: usize = 0;
const REG_SP: usize = 2;

/// Two `c.ebreak` (0x9002) in a row, filling one 4-byte slot.
const BRK_INSTR: u32 = 0x9002_9002;
const INSTR_LEN: usize = 4;

unsafe fn fcsr_ptr(uc: *mut ucontext_t) -> *mut u32 {
    unsafe { &raw mut (*uc).uc_mcontext.__fpregs.__d.__fcsr }
}

/// Clears the sticky exception flags tracked by the current trap mask.
///
/// # Safety
///
/// `uc` must point to a live `ucontext_t` delivered to a signal handler.
pub unsafe fn clear_fp_exceptions(uc: *mut ucontext_t) {
    unsafe { *fcsr_ptr(uc) &= !super::flag_mask() };
}

/// Masks trap delivery for the tracked exceptions.
///
/// # Safety
///
/// See [`clear_fp_exceptions`]; must run on the thread whose context is
/// being edited (the enable CSR is live state).
pub unsafe fn mask_fp_traps(uc: *mut ucontext_t) {
    let _ = uc;
    unsafe {
        let enables = super::asm::trap_enables();
        super::asm::set_trap_enables(enables & !(super::enable_mask() as u64));
    }
}

/// Unmasks trap delivery for the tracked exceptions.
///
/// # Safety
///
/// See [`mask_fp_traps`].
pub unsafe fn unmask_fp_traps(uc: *mut ucontext_t) {
    let _ = uc;
    unsafe {
        let enables = super::asm::trap_enables();
        super::asm::set_trap_enables(enables | super::enable_mask() as u64);
    }
}

/// Arms a break-trap on the instruction after the one in `uc` by patching an
/// `ebreak` pair over it. Assumes 4-byte instructions; compressed code would
/// need the encoding length decoded first.
///
/// # Safety
///
/// See [`clear_fp_exceptions`]; the code page must have been made writable
/// by `process_init`.
pub unsafe fn set_trap(uc: *mut ucontext_t, state: &mut u64) {
    let target = (unsafe { (*uc).uc_mcontext.__gregs[REG_PC] } as usize + INSTR_LEN) as *mut u32;
    unsafe {
        *state = encode_scratch(*target, SCRATCH_STASHED);
        *target = BRK_INSTR;
        super::asm::sync_icache();
    }
    debug!("breakpoint inserted at {target:p} (scratch {:#018x})", *state);
}

/// Restores the instruction displaced by [`set_trap`] at the current PC. A
/// scratch cell that was never armed is left alone, which covers the
/// self-kick break-trap that starts each thread.
///
/// # Safety
///
/// See [`set_trap`].
pub unsafe fn reset_trap(uc: *mut ucontext_t, state: &mut u64) {
    let target = unsafe { (*uc).uc_mcontext.__gregs[REG_PC] } as *mut u32;
    let (instr, tag) = decode_scratch(*state);
    match tag {
        SCRATCH_EMPTY => debug!("no stashed instruction; skipping restore"),
        SCRATCH_STASHED => {
            unsafe {
                *target = instr;
                super::asm::sync_icache();
            }
            *state = 0;
            debug!("restored instruction {instr:#010x} at {target:p}");
        }
        _ => error!("surprise scratch tag {tag:#x} in reset_trap"),
    }
}

/// Rounding (frm) bits of the saved context.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn round_config(uc: *mut ucontext_t) -> RoundConfig {
    RoundConfig::from_bits(unsafe { *fcsr_ptr(uc) } & super::ROUND_DAZ_FTZ_MASK)
}

/// Applies `config` to the rounding bits of the saved context.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn set_round_config(uc: *mut ucontext_t, config: RoundConfig) {
    unsafe {
        *fcsr_ptr(uc) &= !super::ROUND_DAZ_FTZ_MASK;
        *fcsr_ptr(uc) |= config.bits() & super::ROUND_DAZ_FTZ_MASK;
    }
}

/// Rounding bits of the live FCSR.
pub fn machine_round_config() -> RoundConfig {
    RoundConfig::from_bits(super::read_fp_csr().bits() as u32 & super::ROUND_DAZ_FTZ_MASK)
}

/// Faulting instruction pointer.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn ip(uc: *const ucontext_t) -> u64 {
    unsafe { (*uc).uc_mcontext.__gregs[REG_PC] as u64 }
}

/// Stack pointer at the fault.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn sp(uc: *const ucontext_t) -> u64 {
    unsafe { (*uc).uc_mcontext.__gregs[REG_SP] as u64 }
}

/// Packed `enables:FCSR` snapshot; FCSR from the saved context, enables from
/// the live CSR.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn fp_csr(uc: *const ucontext_t) -> FpCsr {
    let fcsr = unsafe { *fcsr_ptr(uc as *mut ucontext_t) } as u64;
    FpCsr::from_bits((super::asm::trap_enables() << 32) | fcsr)
}

/// riscv has no general-purpose condition/status register.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn gp_csr(uc: *const ucontext_t) -> u64 {
    let _ = uc;
    0
}

/// Copies the 4-byte faulting instruction; the destination tail is left for
/// the caller to zero-pad.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn instr_bytes(uc: *const ucontext_t, dest: &mut [u8]) -> usize {
    let n = dest.len().min(INSTR_LEN);
    unsafe {
        core::ptr::copy_nonoverlapping(ip(uc) as *const u8, dest.as_mut_ptr(), n);
    }
    n
}
