//! Clock interface and implementations for testability.
//!
//! Grounded on moonfire-nvr's `base::clock`, ported from the `time`/libc
//! `Timespec` pair to `jiff::Timestamp`, and from `Duration` to
//! `jiff::Span`.

use jiff::{Span, Timestamp};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Abstract interface to the system clocks, so pipeline timing (rotation,
/// flush intervals, reconnect backoff) can be driven deterministically in
/// tests.
pub trait Clocks: Send + Sync + 'static {
    /// The current wall-clock time.
    fn realtime(&self) -> Timestamp;

    /// Causes the current thread to sleep for the given span (or, in test
    /// clocks, simply advances the simulated clock).
    fn sleep(&self, how_long: Span);
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks;

impl Clocks for RealClocks {
    fn realtime(&self) -> Timestamp {
        Timestamp::now()
    }

    fn sleep(&self, how_long: Span) {
        match how_long.total(jiff::Unit::Second) {
            Ok(secs) if secs > 0.0 => std::thread::sleep(std::time::Duration::from_secs_f64(secs)),
            Ok(_) => {}
            Err(err) => warn!(%err, "invalid sleep duration {:?}", how_long),
        }
    }
}

/// Logs a warning if the guarded span of work takes suspiciously long.
pub struct TimerGuard<'a, C: Clocks + ?Sized, F: FnOnce() -> String> {
    clocks: &'a C,
    label_f: Option<F>,
    start: Timestamp,
}

impl<'a, C: Clocks + ?Sized, F: FnOnce() -> String> TimerGuard<'a, C, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.realtime(),
        }
    }
}

impl<'a, C: Clocks + ?Sized, F: FnOnce() -> String> Drop for TimerGuard<'a, C, F> {
    fn drop(&mut self) {
        let elapsed = self.clocks.realtime().since(self.start);
        if let Ok(elapsed) = elapsed {
            if elapsed.get_seconds() >= 1 {
                if let Some(label_f) = self.label_f.take() {
                    warn!("{} took {:?}!", label_f(), elapsed);
                }
            }
        }
    }
}

/// Simulated clock for deterministic tests: `sleep` advances a counter
/// rather than actually blocking the thread.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<Mutex<Timestamp>>);

impl SimulatedClocks {
    pub fn new(start: Timestamp) -> Self {
        SimulatedClocks(Arc::new(Mutex::new(start)))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> Timestamp {
        *self.0.lock().unwrap()
    }

    fn sleep(&self, how_long: Span) {
        let mut t = self.0.lock().unwrap();
        *t = t.checked_add(how_long).expect("simulated clock overflow");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_advances_on_sleep() {
        let start: Timestamp = "2024-01-01T00:00:00Z".parse().unwrap();
        let clocks = SimulatedClocks::new(start);
        assert_eq!(clocks.realtime(), start);
        clocks.sleep(Span::new().seconds(5));
        assert_eq!(
            clocks.realtime().since(start).unwrap().get_seconds(),
            5
        );
    }
}
