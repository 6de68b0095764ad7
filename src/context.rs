//! Per-thread monitoring contexts.
//!
//! A fixed table of slots keyed by OS thread id. Handlers look their slot up
//! by tid on every signal, so the table must be walkable without taking a
//! lock: the tid field of each slot is atomic and a nonzero tid means the
//! payload belongs to that thread alone. The spinlock only serializes
//! allocation and release, and is never held across a syscall.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI32, Ordering};

use fpspy_trace::TraceRecord;
use spin::Mutex as SpinMutex;

use crate::sampler::SamplerState;

/// Most threads a process can have monitored at once; later threads run
/// unmonitored.
pub const MAX_CONTEXTS: usize = 1024;

static_assertions::const_assert!(MAX_CONTEXTS >= 1024);

/// Records buffered per thread before a flush to the trace file.
pub const TRACE_BUFLEN: usize = 64;

/// The per-thread trap machine state (spec'd path: INIT → AWAIT_FPE →
/// AWAIT_TRAP → AWAIT_FPE → … → ABORT).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    AwaitFpe,
    AwaitTrap,
    Abort,
}

pub struct MonitoringContext {
    pub state: State,
    /// Abort was entered from inside the break-trap handler, so the abort
    /// protocol must not re-kick: the handler restoring the context is the
    /// one that called it.
    pub aborting_in_trap: bool,
    /// Cycle counter at context creation.
    pub start_time: u64,
    /// Per-thread trace file; -1 until opened.
    pub fd: libc::c_int,
    /// FP traps observed (recorded or not).
    pub count: u64,
    /// Scratch cell for the arch layer's single-step arm/disarm pair.
    pub trap_state: u64,
    pub sampler: SamplerState,
    pub buffered: usize,
    pub buf: [TraceRecord; TRACE_BUFLEN],
}

impl MonitoringContext {
    const fn new() -> Self {
        Self {
            state: State::Init,
            aborting_in_trap: false,
            start_time: 0,
            fd: -1,
            count: 0,
            trap_state: 0,
            sampler: SamplerState::new(),
            buffered: 0,
            buf: unsafe { core::mem::MaybeUninit::zeroed().assume_init() },
        }
    }
}

struct Slot {
    /// 0 = free. At most one slot carries any given nonzero tid.
    tid: AtomicI32,
    mc: UnsafeCell<MonitoringContext>,
}

// Payload access is confined to the owning thread (or to teardown after the
// owner is gone); the atomic tid is the hand-off point.
unsafe impl Sync for Slot {}

impl Slot {
    const fn new() -> Self {
        Self {
            tid: AtomicI32::new(0),
            mc: UnsafeCell::new(MonitoringContext::new()),
        }
    }
}

static TABLE: [Slot; MAX_CONTEXTS] = [const { Slot::new() }; MAX_CONTEXTS];
static ALLOC_LOCK: SpinMutex<()> = SpinMutex::new(());

/// Finds the context owned by `tid`. Lock-free; safe to call from handlers.
pub fn find(tid: libc::pid_t) -> Option<*mut MonitoringContext> {
    TABLE
        .iter()
        .find(|slot| slot.tid.load(Ordering::Acquire) == tid)
        .map(|slot| slot.mc.get())
}

/// Claims a free slot for `tid` and resets its payload. `None` when the
/// table is full, which callers treat as that thread running unmonitored
/// (INDIVIDUAL mode escalates to abort).
pub fn alloc(tid: libc::pid_t) -> Option<*mut MonitoringContext> {
    let _guard = ALLOC_LOCK.lock();
    let slot = TABLE.iter().find(|slot| slot.tid.load(Ordering::Relaxed) == 0)?;
    unsafe { *slot.mc.get() = MonitoringContext::new() };
    slot.tid.store(tid, Ordering::Release);
    Some(slot.mc.get())
}

/// Releases `tid`'s slot, if any.
pub fn release(tid: libc::pid_t) {
    let _guard = ALLOC_LOCK.lock();
    for slot in &TABLE {
        if slot.tid.load(Ordering::Relaxed) == tid {
            slot.tid.store(0, Ordering::Release);
        }
    }
}

/// Walks every live context. Used at process teardown, after the threads
/// themselves are done mutating their slots.
pub fn for_each_live(mut f: impl FnMut(libc::pid_t, *mut MonitoringContext)) {
    for slot in &TABLE {
        let tid = slot.tid.load(Ordering::Acquire);
        if tid != 0 {
            f(tid, slot.mc.get());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests share the process-wide table; use tids no real thread will hold.
    const BASE: libc::pid_t = 0x40000000;

    #[test]
    fn alloc_find_release_roundtrip() {
        assert!(find(BASE).is_none());
        let mc = alloc(BASE).unwrap();
        unsafe {
            (*mc).count = 7;
        }
        assert_eq!(find(BASE), Some(mc));
        release(BASE);
        assert!(find(BASE).is_none());
        // A fresh claim resets the payload.
        let mc = alloc(BASE).unwrap();
        assert_eq!(unsafe { (*mc).count }, 0);
        assert_eq!(unsafe { (*mc).state }, State::Init);
        release(BASE);
    }

    #[test]
    fn distinct_tids_get_distinct_slots() {
        let a = alloc(BASE + 1).unwrap();
        let b = alloc(BASE + 2).unwrap();
        assert_ne!(a, b);
        assert_eq!(find(BASE + 1), Some(a));
        assert_eq!(find(BASE + 2), Some(b));
        release(BASE + 1);
        release(BASE + 2);
    }
}
