//! Trace record layout and reader for FPSpy individual-mode monitor files.
//!
//! An individual-mode file (`__<prog>.<secs>.<tid>.individual.fpemon`) is a
//! contiguous sequence of fixed-size [`TraceRecord`]s, one per observed FP
//! trap, possibly ending in an abort marker. A monitored process that dies
//! mid-write can leave a truncated final record; [`Trace`] drops it rather
//! than failing.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use bytemuck::{Pod, Zeroable};

/// Longest x86-64 instruction; shorter architectures zero-pad.
pub const MAX_INSTR_SIZE: usize = 15;

/// On-disk size of one record.
pub const RECORD_SIZE: usize = 48;

/// One observed FP trap, as written to the per-thread trace file.
///
/// Little-endian, packed. An abort marker is a record with every byte 0xFF
/// except `time`, which holds the cycles elapsed at disengagement; it is
/// recognized by `code == -1`.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TraceRecord {
    /// Cycles since the thread's monitoring context was created.
    pub time: u64,
    /// Code location of the faulting instruction.
    pub rip: u64,
    /// Stack pointer at the fault.
    pub rsp: u64,
    /// Architectural FPE sub-cause, as delivered in `siginfo.si_code`.
    pub code: i32,
    /// Native FP-CSR snapshot at the fault.
    pub mxcsr: u32,
    /// Leading bytes of the faulting instruction.
    pub instruction: [u8; MAX_INSTR_SIZE],
    pub pad: u8,
}

static_assertions::const_assert_eq!(size_of::<TraceRecord>(), RECORD_SIZE);

impl TraceRecord {
    /// Builds an abort marker carrying the elapsed cycle count.
    pub fn abort_marker(time: u64) -> Self {
        let mut r: TraceRecord = bytemuck::cast([0xffu8; RECORD_SIZE]);
        r.time = time;
        r
    }

    /// Whether this record is the abort marker.
    pub fn is_abort(&self) -> bool {
        self.code == -1
    }

    /// Raw on-disk bytes of this record.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Mnemonic for an FPE sub-cause code, in the kernel's numbering.
pub fn code_mnemonic(code: i32) -> &'static str {
    match code {
        1 => "FPE_INTDIV",
        2 => "FPE_INTOVF",
        3 => "FPE_FLTDIV",
        4 => "FPE_FLTOVF",
        5 => "FPE_FLTUND",
        6 => "FPE_FLTRES",
        7 => "FPE_FLTINV",
        8 => "FPE_FLTSUB",
        -1 => "***ABORT!!",
        _ => "***UNKNOWN",
    }
}

/// An individual-mode trace file loaded into memory.
pub struct Trace {
    records: Vec<TraceRecord>,
    truncated: bool,
}

impl Trace {
    /// Loads `path`, dropping a truncated final record if present.
    pub fn attach<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut buf = Vec::new();
        File::open(path)?.read_to_end(&mut buf)?;

        let whole = buf.len() / RECORD_SIZE;
        let records = buf[..whole * RECORD_SIZE]
            .chunks_exact(RECORD_SIZE)
            .map(bytemuck::pod_read_unaligned)
            .collect();

        Ok(Self {
            records,
            truncated: buf.len() % RECORD_SIZE != 0,
        })
    }

    /// The whole records of the trace, in file order.
    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    /// Whether the file ended mid-record.
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_marker_is_all_ones_except_time() {
        let r = TraceRecord::abort_marker(1234);
        assert!(r.is_abort());
        assert_eq!({ r.time }, 1234);
        assert_eq!({ r.mxcsr }, u32::MAX);
        assert_eq!({ r.instruction }, [0xff; MAX_INSTR_SIZE]);
    }

    #[test]
    fn mnemonics_cover_kernel_codes() {
        assert_eq!(code_mnemonic(3), "FPE_FLTDIV");
        assert_eq!(code_mnemonic(-1), "***ABORT!!");
        assert_eq!(code_mnemonic(99), "***UNKNOWN");
    }
}
