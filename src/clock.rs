//! The internal realtime pulse clock.
//!
//! Drives an [`Engine`] at its current tempo using absolute deadlines: the
//! next deadline is always the previous one plus the ideal pulse interval,
//! never "now plus interval", so timing errors cancel out instead of
//! accumulating. When the loop falls behind (a stalled control closure, a
//! suspended laptop) the deadlines are in the past and pulses advance
//! back-to-back without sleeping until the clock catches up; due events are
//! dispatched late rather than dropped.
//!
//! Waiting is hybrid: a coarse `thread::sleep` until close to the deadline,
//! then a spin for the final stretch, because sleep alone routinely
//! overshoots by more than a millisecond and at 120 BPM a pulse is only
//! ~20.8 ms wide.

use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::engine::Engine;

/// Decision returned by the control closure before every pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockControl {
    Continue,
    Stop,
}

/// Realtime driver for an [`Engine`].
pub struct PulseClock {
    spin_threshold: Duration,
}

impl Default for PulseClock {
    fn default() -> Self {
        Self {
            spin_threshold: Duration::from_millis(1),
        }
    }
}

impl PulseClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the remaining-time threshold below which the clock spins instead
    /// of sleeping. `None` disables spinning entirely; timing then degrades
    /// to the platform sleep granularity, which saves CPU on battery.
    pub fn with_spin_threshold(mut self, threshold: Option<Duration>) -> Self {
        self.spin_threshold = threshold.unwrap_or(Duration::ZERO);
        self
    }

    /// Run until `control` returns [`ClockControl::Stop`].
    ///
    /// `control` runs once per pulse, before the wait, on this thread. It
    /// is where a facade drains its command channel.
    pub fn run(&self, engine: &mut Engine, mut control: impl FnMut(&mut Engine) -> ClockControl) {
        debug!("pulse clock starting at {:.2} BPM", engine.tempo().bpm());
        let mut deadline = Instant::now();
        loop {
            if control(engine) == ClockControl::Stop {
                debug!("pulse clock stopping at pulse {}", engine.pulse());
                return;
            }

            self.wait_until(deadline);
            let now = Instant::now();
            if now > deadline {
                engine.stats_mut().record_jitter((now - deadline).as_secs_f64());
            }

            engine.advance_pulse();
            // Tempo changes apply here, to the next interval only.
            deadline += engine.tempo().pulse_interval();
        }
    }

    fn wait_until(&self, deadline: Instant) {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let remaining = deadline - now;
            if remaining > self.spin_threshold {
                thread::sleep(remaining - self.spin_threshold);
            } else if self.spin_threshold.is_zero() {
                thread::sleep(remaining);
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi_io::CollectingDriver;

    fn test_engine(bpm: f64) -> Engine {
        Engine::new(Box::new(CollectingDriver::new()), bpm).unwrap()
    }

    #[test]
    fn runs_requested_pulses_then_stops() {
        // 600 BPM keeps the test short: 4.17 ms per pulse.
        let mut engine = test_engine(600.0);
        let clock = PulseClock::new();
        let start = Instant::now();
        clock.run(&mut engine, |engine| {
            if engine.pulse() >= 24 {
                ClockControl::Stop
            } else {
                ClockControl::Continue
            }
        });
        let elapsed = start.elapsed();

        assert_eq!(engine.pulse(), 24);
        // 24 pulses at 600 BPM is 100 ms; generous lower bound only, CI
        // machines overshoot but must not undershoot.
        assert!(elapsed >= Duration::from_millis(80), "elapsed {elapsed:?}");
    }

    #[test]
    fn catches_up_after_a_stall_without_dropping_pulses() {
        let mut engine = test_engine(600.0);
        let clock = PulseClock::new();
        let mut stalled = false;
        let start = Instant::now();
        clock.run(&mut engine, |engine| {
            if engine.pulse() == 6 && !stalled {
                stalled = true;
                // Simulate a hiccup several pulse intervals long.
                thread::sleep(Duration::from_millis(30));
            }
            if engine.pulse() >= 48 {
                ClockControl::Stop
            } else {
                ClockControl::Continue
            }
        });
        let elapsed = start.elapsed();

        assert_eq!(engine.pulse(), 48);
        // Catch-up means the stall is absorbed, not appended: total time
        // stays near the ideal 200 ms rather than 200 ms + 30 ms per stall.
        assert!(elapsed < Duration::from_millis(300), "elapsed {elapsed:?}");
        assert!(engine.stats().max_jitter_secs > 0.0);
    }
}
