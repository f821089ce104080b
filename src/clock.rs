use std::time::{SystemTime, UNIX_EPOCH};

/// A source of record timestamps for the log.
///
/// The engine stamps every append from this trait and clamps the value
/// against the previously assigned timestamp, so implementations do not
/// have to be monotonic themselves — a wall clock stepped backwards by
/// NTP cannot make log timestamps regress. Tests substitute a manual
/// implementation to drive virtual time.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current time in nanoseconds since the UNIX epoch.
    fn now(&self) -> i64;
}

/// Wall-clock time source used by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX),
            // Host clock set before 1970. Zero keeps the engine's
            // non-decreasing clamp in charge instead of panicking.
            Err(_) => 0,
        }
    }
}
