//! Accessors for the FP and trap state saved in a signal context.
//!
//! Linux stores aarch64 FP state as a chain of tagged records inside the
//! `__reserved` area of `mcontext_t`; the FPSIMD record carries FPSR/FPCR.
//! libc keeps `__reserved` private, so the chain is located by address
//! arithmetic from the last public field.

use libc::ucontext_t;

use crate::patch::{SCRATCH_EMPTY, SCRATCH_STASHED, decode_scratch, encode_scratch};
use crate::{FpCsr, RoundConfig};

const FPSIMD_MAGIC: u32 = 0x46508001;
const RESERVED_LEN: usize = 4096;

/// `brk #23`
const BRK_INSTR: u32 = 0xd42002e0;
const INSTR_LEN: usize = 4;

#[repr(C)]
struct CtxHeader {
    magic: u32,
    size: u32,
}

#[repr(C)]
struct FpsimdContext {
    head: CtxHeader,
    fpsr: u32,
    fpcr: u32,
    vregs: [[u64; 2]; 32],
}

static_assertions::const_assert_eq!(size_of::<FpsimdContext>(), 528);

unsafe fn fpsimd_ptr(uc: *mut ucontext_t) -> Option<*mut FpsimdContext> {
    // __reserved starts 16-byte aligned directly after pstate.
    let after = unsafe { (&raw mut (*uc).uc_mcontext.pstate).add(1) } as usize;
    let start = (after + 15) & !15;
    let mut p = start;
    while p + size_of::<CtxHeader>() <= start + RESERVED_LEN {
        let head = p as *mut CtxHeader;
        match unsafe { (*head).magic } {
            0 => break,
            FPSIMD_MAGIC => return Some(p as *mut FpsimdContext),
            _ => {
                let size = unsafe { (*head).size } as usize;
                if size == 0 {
                    break;
                }
                p += size;
            }
        }
    }
    error!("signal context carries no FPSIMD record");
    None
}

/// Clears the sticky exception flags tracked by the current trap mask.
///
/// # Safety
///
/// `uc` must point to a live `ucontext_t` delivered to a signal handler.
pub unsafe fn clear_fp_exceptions(uc: *mut ucontext_t) {
    if let Some(fp) = unsafe { fpsimd_ptr(uc) } {
        unsafe { (*fp).fpsr &= !super::flag_mask() };
    }
}

/// Masks trap delivery for the tracked exceptions in the saved context.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn mask_fp_traps(uc: *mut ucontext_t) {
    if let Some(fp) = unsafe { fpsimd_ptr(uc) } {
        unsafe { (*fp).fpcr &= !super::enable_mask() };
    }
}

/// Unmasks trap delivery for the tracked exceptions in the saved context.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn unmask_fp_traps(uc: *mut ucontext_t) {
    if let Some(fp) = unsafe { fpsimd_ptr(uc) } {
        unsafe { (*fp).fpcr |= super::enable_mask() };
    }
}

/// Arms a break-trap on the instruction after the one in `uc` by patching a
/// `brk` over it. The displaced word goes into the scratch cell, which must
/// be handed back to [`reset_trap`] unchanged.
///
/// # Safety
///
/// See [`clear_fp_exceptions`]; the code page must have been made writable
/// by `process_init`.
pub unsafe fn set_trap(uc: *mut ucontext_t, state: &mut u64) {
    let target = (unsafe { (*uc).uc_mcontext.pc } as usize + INSTR_LEN) as *mut u32;
    unsafe {
        *state = encode_scratch(*target, SCRATCH_STASHED);
        *target = BRK_INSTR;
        super::asm::sync_icache(target);
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
    let target = unsafe { (*uc).uc_mcontext.pc } as *mut u32;
    let (instr, tag) = decode_scratch(*state);
    match tag {
        SCRATCH_EMPTY => debug!("no stashed instruction; skipping restore"),
        SCRATCH_STASHED => {
            unsafe {
                *target = instr;
                super::asm::sync_icache(target);
            }
            *state = 0;
            debug!("restored instruction {instr:#010x} at {target:p}");
        }
        _ => error!("surprise scratch tag {tag:#x} in reset_trap"),
    }
}

/// Rounding/FTZ bits of the saved context.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn round_config(uc: *mut ucontext_t) -> RoundConfig {
    match unsafe { fpsimd_ptr(uc) } {
        Some(fp) => RoundConfig::from_bits(unsafe { (*fp).fpcr } & super::ROUND_DAZ_FTZ_MASK),
        None => RoundConfig::default(),
    }
}

/// Applies `config` to the rounding/FTZ bits of the saved context.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn set_round_config(uc: *mut ucontext_t, config: RoundConfig) {
    if let Some(fp) = unsafe { fpsimd_ptr(uc) } {
        unsafe {
            (*fp).fpcr &= !super::ROUND_DAZ_FTZ_MASK;
            (*fp).fpcr |= config.bits() & super::ROUND_DAZ_FTZ_MASK;
        }
    }
}

/// Rounding/FTZ bits of the live FPCR.
pub fn machine_round_config() -> RoundConfig {
    RoundConfig::from_bits((super::read_fp_csr().bits() >> 32) as u32 & super::ROUND_DAZ_FTZ_MASK)
}

/// Faulting instruction pointer.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn ip(uc: *const ucontext_t) -> u64 {
    unsafe { (*uc).uc_mcontext.pc }
}

/// Stack pointer at the fault.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn sp(uc: *const ucontext_t) -> u64 {
    unsafe { (*uc).uc_mcontext.sp }
}

/// Packed `FPCR:FPSR` snapshot from the saved context.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn fp_csr(uc: *const ucontext_t) -> FpCsr {
    match unsafe { fpsimd_ptr(uc as *mut ucontext_t) } {
        Some(fp) => unsafe {
            FpCsr::from_bits((((*fp).fpcr as u64) << 32) | (*fp).fpsr as u64)
        },
        None => FpCsr::from_bits(0),
    }
}

/// PSTATE from the saved context.
///
/// # Safety
///
/// See [`clear_fp_exceptions`].
pub unsafe fn gp_csr(uc: *const ucontext_t) -> u64 {
    unsafe { (*uc).uc_mcontext.pstate }
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
