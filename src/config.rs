//! Startup configuration.
//!
//! Everything is driven by `FPSPY_*` environment variables, parsed once at
//! load time into a process-wide [`Config`] that is read-only afterwards.
//! A malformed value is a configuration error and kills the process before
//! monitoring starts.

use fpspy_arch::{DazFtzMode, FpExcept, RoundMode};
use spin::Once;

/// What gets recorded: end-of-run sticky flags, or one record per trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Aggregate,
    Individual,
}

/// Which interval-timer clock drives the Poisson sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Real,
    Virtual,
    Prof,
}

impl TimerKind {
    pub fn itimer_which(self) -> libc::c_int {
        match self {
            TimerKind::Real => libc::ITIMER_REAL,
            TimerKind::Virtual => libc::ITIMER_VIRTUAL,
            TimerKind::Prof => libc::ITIMER_PROF,
        }
    }

    /// The signal the chosen clock delivers on expiry.
    pub fn alarm_signal(self) -> libc::c_int {
        match self {
            TimerKind::Real => libc::SIGALRM,
            TimerKind::Virtual => libc::SIGVTALRM,
            TimerKind::Prof => libc::SIGPROF,
        }
    }
}

pub struct Config {
    pub mode: Mode,
    /// Per-thread cap on observed events; -1 is unlimited.
    pub maxcount: i64,
    /// Record every k-th event.
    pub sample_period: u64,
    /// Keep FP signals away from the target instead of aborting.
    pub aggressive: bool,
    pub disable_pthreads: bool,
    /// `(on_mean_us, off_mean_us)` when Poisson sampling is enabled.
    pub poisson: Option<(u64, u64)>,
    pub timer: TimerKind,
    /// LCG seed; `None` seeds each thread from the cycle counter.
    pub seed: Option<u64>,
    /// Exception classes to monitor.
    pub except_list: FpExcept,
    pub force_rounding: Option<(RoundMode, DazFtzMode)>,
    /// Wait for an external break-trap instead of self-kicking.
    pub kickstart: bool,
    /// Die on the first FP trap (for core-dump harvesting).
    pub crash_on_trap: bool,
    pub debug_level: u8,
    /// Try the kernel short-circuit for trap delivery.
    pub kernel: bool,
}

static CONFIG: Once<Config> = Once::new();

/// The process-wide configuration, parsed from the environment on first
/// use. Interposed calls can arrive from other libraries' constructors
/// before FPSpy's own runs, so there is no separate load step to race with.
pub fn get() -> &'static Config {
    CONFIG.call_once(Config::from_env)
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// First character y/Y means yes, everything else means no.
fn is_yes(val: &str) -> bool {
    val.as_bytes().first().is_some_and(|c| c.eq_ignore_ascii_case(&b'y'))
}

fn die(what: &str, val: &str) -> ! {
    error!("{what} is given, but \"{val}\" does not make sense");
    unsafe { libc::abort() }
}

impl Config {
    fn from_env() -> Self {
        let mode = match env("FPSPY_MODE") {
            Some(v) => parse_mode(&v).unwrap_or_else(|| die("FPSPY_MODE", &v)),
            None => Mode::Aggregate,
        };
        let maxcount = match env("FPSPY_MAXCOUNT") {
            Some(v) => v.trim().parse().unwrap_or_else(|_| die("FPSPY_MAXCOUNT", &v)),
            None => -1,
        };
        let sample_period = match env("FPSPY_SAMPLE") {
            Some(v) => match v.trim().parse() {
                Ok(k) if k > 0 => k,
                _ => die("FPSPY_SAMPLE", &v),
            },
            None => 1,
        };
        let poisson = match env("FPSPY_POISSON") {
            Some(v) => Some(parse_poisson(&v).unwrap_or_else(|| die("FPSPY_POISSON", &v))),
            None => None,
        };
        let timer = match env("FPSPY_TIMER") {
            Some(v) => parse_timer(&v).unwrap_or_else(|| die("FPSPY_TIMER", &v)),
            None => TimerKind::Real,
        };
        let seed = match env("FPSPY_SEED") {
            Some(v) => parse_seed(&v).unwrap_or_else(|| die("FPSPY_SEED", &v)),
            None => None,
        };
        let except_list = match env("FPSPY_EXCEPT_LIST") {
            Some(v) if mode == Mode::Individual => parse_except_list(&v),
            Some(_) => {
                debug!("ignoring exception list for aggregate mode");
                FpExcept::all()
            }
            None => FpExcept::all(),
        };
        let force_rounding = match env("FPSPY_FORCE_ROUNDING") {
            Some(v) => Some(parse_rounding(&v).unwrap_or_else(|| die("FPSPY_FORCE_ROUNDING", &v))),
            None => None,
        };
        let debug_level = match env("FPSPY_DEBUG_LEVEL") {
            Some(v) => v.trim().parse().unwrap_or_else(|_| die("FPSPY_DEBUG_LEVEL", &v)),
            None => 2,
        };

        Config {
            mode,
            maxcount,
            sample_period,
            aggressive: env("FPSPY_AGGRESSIVE").is_some_and(|v| is_yes(&v)),
            disable_pthreads: env("FPSPY_DISABLE_PTHREADS").is_some_and(|v| is_yes(&v))
                || env("DISABLE_PTHREADS").is_some_and(|v| is_yes(&v)),
            poisson,
            timer,
            seed,
            except_list,
            force_rounding,
            kickstart: env("FPSPY_KICKSTART").is_some_and(|v| is_yes(&v)),
            crash_on_trap: env("FPSPY_ABORT").is_some_and(|v| is_yes(&v)),
            debug_level,
            kernel: env("FPSPY_KERNEL").is_some_and(|v| is_yes(&v)),
        }
    }
}

fn parse_mode(val: &str) -> Option<Mode> {
    if val.eq_ignore_ascii_case("individual") {
        Some(Mode::Individual)
    } else if val.eq_ignore_ascii_case("aggregate") {
        Some(Mode::Aggregate)
    } else {
        None
    }
}

fn parse_timer(val: &str) -> Option<TimerKind> {
    if val.eq_ignore_ascii_case("real") {
        Some(TimerKind::Real)
    } else if val.eq_ignore_ascii_case("virtual") {
        Some(TimerKind::Virtual)
    } else if val.eq_ignore_ascii_case("prof") {
        Some(TimerKind::Prof)
    } else {
        None
    }
}

/// "ON_us:OFF_us", both decimal.
fn parse_poisson(val: &str) -> Option<(u64, u64)> {
    let (on, off) = val.split_once(':')?;
    Some((on.trim().parse().ok()?, off.trim().parse().ok()?))
}

/// -1 selects per-thread seeding from the cycle counter.
fn parse_seed(val: &str) -> Option<Option<u64>> {
    let t = val.trim();
    if t == "-1" {
        Some(None)
    } else {
        t.parse().ok().map(Some)
    }
}

/// Substring-matched subset of inv/den/div/over/under/prec.
fn parse_except_list(val: &str) -> FpExcept {
    let lower = val.to_ascii_lowercase();
    let mut set = FpExcept::empty();
    for (pat, exc) in [
        ("inv", FpExcept::INVALID),
        ("den", FpExcept::DENORM),
        ("div", FpExcept::DIVZERO),
        ("over", FpExcept::OVERFLOW),
        ("under", FpExcept::UNDERFLOW),
        ("prec", FpExcept::INEXACT),
    ] {
        if lower.contains(pat) {
            debug!("tracking {exc:?}");
            set |= exc;
        }
    }
    set
}

/// Rounding direction pos/neg/zer/nea plus optional daz and/or ftz.
fn parse_rounding(val: &str) -> Option<(RoundMode, DazFtzMode)> {
    let lower = val.to_ascii_lowercase();
    let mode = if lower.contains("pos") {
        RoundMode::Positive
    } else if lower.contains("neg") {
        RoundMode::Negative
    } else if lower.contains("zer") {
        RoundMode::Zero
    } else if lower.contains("nea") {
        RoundMode::Nearest
    } else {
        return None;
    };
    let dazftz = match (lower.contains("daz"), lower.contains("ftz")) {
        (false, false) => DazFtzMode::Off,
        (false, true) => DazFtzMode::Ftz,
        (true, false) => DazFtzMode::Daz,
        (true, true) => DazFtzMode::DazFtz,
    };
    Some((mode, dazftz))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_and_timer_parse_case_insensitively() {
        assert_eq!(parse_mode("Individual"), Some(Mode::Individual));
        assert_eq!(parse_mode("AGGREGATE"), Some(Mode::Aggregate));
        assert_eq!(parse_mode("both"), None);
        assert_eq!(parse_timer("Virtual"), Some(TimerKind::Virtual));
        assert_eq!(parse_timer("cpu"), None);
    }

    #[test]
    fn poisson_takes_on_and_off_means() {
        assert_eq!(parse_poisson("1000:9000"), Some((1000, 9000)));
        assert_eq!(parse_poisson("1000"), None);
        assert_eq!(parse_poisson("a:b"), None);
    }

    #[test]
    fn seed_minus_one_means_cycle_counter() {
        assert_eq!(parse_seed("-1"), Some(None));
        assert_eq!(parse_seed("42"), Some(Some(42)));
        assert_eq!(parse_seed("x"), None);
    }

    #[test]
    fn except_list_is_substring_matched() {
        assert_eq!(parse_except_list("div"), FpExcept::DIVZERO);
        assert_eq!(
            parse_except_list("inv,over"),
            FpExcept::INVALID | FpExcept::OVERFLOW
        );
        assert_eq!(parse_except_list("none of these"), FpExcept::empty());
    }

    #[test]
    fn rounding_parses_direction_and_dazftz() {
        assert_eq!(parse_rounding("pos"), Some((RoundMode::Positive, DazFtzMode::Off)));
        assert_eq!(
            parse_rounding("zer daz ftz"),
            Some((RoundMode::Zero, DazFtzMode::DazFtz))
        );
        assert_eq!(parse_rounding("updown"), None);
        assert_eq!(is_yes("Yes"), true);
        assert_eq!(is_yes("no"), false);
    }
}
