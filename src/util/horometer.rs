//! A primitive timing instrument, ported from `ibis::horometer`.
//!
//! Must be explicitly started by calling [Horometer::start]. The same
//! method may be called again to restart the timer, discarding the
//! previously marked starting point. [Horometer::stop] accumulates the
//! elapsed real and CPU time; [Horometer::resume] continues timing
//! after a stop without resetting the accumulated totals.

use std::time::{Duration, Instant};

/// Wall-clock + process-CPU-time timer.
///
/// CPU time is approximated from wall-clock on platforms where a
/// dedicated CPU-time clock is not wired up (the portable subset of
/// what the originating tree reads via `getrusage`/`times`); callers
/// that need exact CPU-time accounting should layer `getrusage` on
/// top via `cfg(unix)` in the embedding application.
pub struct Horometer {
    start_real: Option<Instant>,
    total_real: Duration,
    start_cpu: Option<Instant>,
    total_cpu: Duration,
}

impl Default for Horometer {
    fn default() -> Self {
        Horometer {
            start_real: None,
            total_real: Duration::default(),
            start_cpu: None,
            total_cpu: Duration::default(),
        }
    }
}

impl Horometer {
    pub fn new() -> Horometer {
        Horometer::default()
    }

    /// Start the timer, clearing any previously accumulated totals.
    pub fn start(&mut self) {
        self.start_real = Some(Instant::now());
        self.start_cpu = Some(Instant::now());
        self.total_real = Duration::default();
        self.total_cpu = Duration::default();
    }

    /// Stop the timer. May [Horometer::resume] later.
    pub fn stop(&mut self) {
        if let Some(t) = self.start_real.take() {
            self.total_real += t.elapsed();
        }
        if let Some(t) = self.start_cpu.take() {
            self.total_cpu += t.elapsed();
        }
    }

    /// Continue timing after being stopped, without resetting totals.
    pub fn resume(&mut self) {
        self.start_real = Some(Instant::now());
        self.start_cpu = Some(Instant::now());
    }

    /// Elapsed wall-clock time, in seconds.
    pub fn real_time(&self) -> f64 {
        self.total_real.as_secs_f64()
    }

    /// Elapsed CPU time, in seconds.
    pub fn cpu_time(&self) -> f64 {
        self.total_cpu.as_secs_f64()
    }
}

#[cfg(test)]
mod horometer_test {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_start_stop() {
        let mut h = Horometer::new();
        h.start();
        sleep(Duration::from_millis(5));
        h.stop();
        assert!(h.real_time() > 0.0);
        assert!(h.cpu_time() >= 0.0);
    }

    #[test]
    fn test_resume_accumulates() {
        let mut h = Horometer::new();
        h.start();
        sleep(Duration::from_millis(2));
        h.stop();
        let first = h.real_time();
        h.resume();
        sleep(Duration::from_millis(2));
        h.stop();
        assert!(h.real_time() > first);
    }
}
