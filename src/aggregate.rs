//! Aggregate-mode output.
//!
//! Aggregate mode never traps: it just reads the sticky flags the target
//! accumulated and writes one ASCII line per thread at thread exit and at
//! process teardown. Denormal detection cannot go through the fenv API, so
//! it comes from the arch layer's special-exception probe.

use fpspy_arch::FpExcept;

use crate::{ABORTED, shims, trace};
use core::sync::atomic::Ordering;

/// Fixed token order for the aggregate line.
const TOKENS: &[(FpExcept, &str)] = &[
    (FpExcept::DIVZERO, "FE_DIVBYZERO"),
    (FpExcept::INEXACT, "FE_INEXACT"),
    (FpExcept::INVALID, "FE_INVALID"),
    (FpExcept::OVERFLOW, "FE_OVERFLOW"),
    (FpExcept::UNDERFLOW, "FE_UNDERFLOW"),
    (FpExcept::DENORM, "FE_DENORM"),
];

/// Renders an observed-exception set as the aggregate file line, newline
/// included.
fn stringify(observed: FpExcept) -> String {
    let mut line = String::new();
    for (exc, token) in TOKENS {
        if observed.contains(*exc) {
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(token);
        }
    }
    if line.is_empty() {
        line.push_str("NO_EXCEPTIONS_RECORDED");
    }
    line.push('\n');
    line
}

/// Reads the sticky flags currently visible to this thread.
fn observed_exceptions() -> FpExcept {
    let mut observed = FpExcept::empty();
    for (exc, _) in TOKENS {
        if *exc == FpExcept::DENORM {
            if fpspy_arch::have_special_fp_csr_exception(FpExcept::DENORM) {
                observed |= FpExcept::DENORM;
            }
        } else if shims::orig_fetestexcept(fpspy_arch::fe_bits(*exc)) != 0 {
            observed |= *exc;
        }
    }
    observed
}

/// Writes `__<prog>.<secs>.<tid>.aggregate.fpemon` for the calling thread.
pub(crate) fn emit_for_thread(tid: libc::pid_t) {
    debug!("dumping aggregate exceptions");

    let Some(fd) = trace::open_monitor_file(tid, "aggregate") else {
        return;
    };

    let line = if ABORTED.load(Ordering::Acquire) {
        "ABORTED\n".to_string()
    } else {
        stringify(observed_exceptions())
    };

    if trace::write_all(fd, line.as_bytes()).is_err() {
        error!("failed to write all of monitoring output");
    }
    debug!("aggregate exception string: {}", line.trim_end());
    unsafe { libc::close(fd) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_come_out_in_fixed_order() {
        let line = stringify(FpExcept::OVERFLOW | FpExcept::DIVZERO | FpExcept::INVALID);
        assert_eq!(line, "FE_DIVBYZERO FE_INVALID FE_OVERFLOW\n");
    }

    #[test]
    fn no_flags_says_so() {
        assert_eq!(stringify(FpExcept::empty()), "NO_EXCEPTIONS_RECORDED\n");
    }

    #[test]
    fn denorm_is_last() {
        let line = stringify(FpExcept::DENORM | FpExcept::INEXACT);
        assert_eq!(line, "FE_INEXACT FE_DENORM\n");
    }
}
