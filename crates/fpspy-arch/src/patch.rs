//! Support for architectures that single-step by patching a breakpoint over
//! the next instruction.
//!
//! The displaced instruction travels in the caller's scratch word between
//! `set_trap` and the matching `reset_trap`: the instruction in the high half
//! and a tag in the low half so a stale or never-armed scratch is detected
//! instead of being written over live code.

use std::fs::File;
use std::io::{BufRead, BufReader};

/// Scratch tags. `EMPTY` is what a zero-initialized context carries before
/// the first arm; `reset_trap` treats it as "nothing to restore", which is
/// exactly the state during the initial self-kick break-trap.
pub(crate) const SCRATCH_EMPTY: u32 = 0;
pub(crate) const SCRATCH_STASHED: u32 = 2;

pub(crate) fn encode_scratch(instr: u32, tag: u32) -> u64 {
    ((instr as u64) << 32) | tag as u64
}

pub(crate) fn decode_scratch(state: u64) -> (u32, u32) {
    ((state >> 32) as u32, state as u32)
}

/// Relaxes every executable mapping of the process to rwx so breakpoint
/// patching can write code pages.
///
/// Runs once at process init, before monitoring starts. Code loaded later
/// (dlopen) is not covered.
pub(crate) fn make_exec_regions_writable() -> Result<(), i32> {
    debug!("making executable regions writable for breakpoint insertion");

    let maps = File::open("/proc/self/maps").map_err(|_| {
        error!("cannot open /proc/self/maps");
        -1
    })?;

    for line in BufReader::new(maps).lines() {
        let Ok(line) = line else { break };
        let Some((range, rest)) = line.split_once(' ') else {
            continue;
        };
        let perms = rest.as_bytes();
        if perms.len() < 4 || perms[0] != b'r' || perms[1] == b'w' || perms[2] != b'x' {
            continue;
        }
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (
            usize::from_str_radix(start, 16),
            usize::from_str_radix(end, 16),
        ) else {
            debug!("unparseable map line: {line}");
            continue;
        };
        debug!("mprotecting {start:#x}-{end:#x} rwx");
        let rc = unsafe {
            libc::mprotect(
                start as *mut libc::c_void,
                end - start,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            // vsyscall and friends refuse; monitoring can still work if the
            // target never faults there.
            debug!("mprotect failed for {start:#x}-{end:#x}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_roundtrip_keeps_instruction_and_tag() {
        let state = encode_scratch(0xd42002e0, SCRATCH_STASHED);
        assert_eq!(decode_scratch(state), (0xd42002e0, SCRATCH_STASHED));
        assert_eq!(decode_scratch(0), (0, SCRATCH_EMPTY));
    }
}
