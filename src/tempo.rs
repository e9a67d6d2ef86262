//! Tempo state and gradual tempo ramps.

use std::time::Duration;

use crate::constants::PPQN;
use crate::easing::{self, EasingFn};
use crate::error::SchedulerError;

/// The current effective tempo.
///
/// Changes take effect when the clock computes its next pulse deadline,
/// never retroactively.
#[derive(Debug, Clone, Copy)]
pub struct TempoState {
    bpm: f64,
}

impl TempoState {
    pub fn new(bpm: f64) -> Result<Self, SchedulerError> {
        if bpm <= 0.0 || !bpm.is_finite() {
            return Err(SchedulerError::InvalidTempo(bpm));
        }
        Ok(Self { bpm })
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn set_bpm(&mut self, bpm: f64) -> Result<(), SchedulerError> {
        if bpm <= 0.0 || !bpm.is_finite() {
            return Err(SchedulerError::InvalidTempo(bpm));
        }
        self.bpm = bpm;
        Ok(())
    }

    pub fn seconds_per_beat(&self) -> f64 {
        60.0 / self.bpm
    }

    pub fn seconds_per_pulse(&self) -> f64 {
        self.seconds_per_beat() / PPQN as f64
    }

    /// Ideal interval between pulses at the current tempo.
    pub fn pulse_interval(&self) -> Duration {
        Duration::from_secs_f64(self.seconds_per_pulse())
    }
}

/// An in-flight tempo transition.
///
/// Interpolates from a start to a target tempo over a pulse span with a
/// pluggable easing curve. Progress past the span yields exactly the target
/// and the ramp reports itself finished so the engine can discard it.
pub struct TempoRamp {
    start_bpm: f64,
    target_bpm: f64,
    span_pulses: u64,
    elapsed_pulses: u64,
    easing: EasingFn,
}

impl TempoRamp {
    pub fn new(
        start_bpm: f64,
        target_bpm: f64,
        span_pulses: u64,
        easing: EasingFn,
    ) -> Result<Self, SchedulerError> {
        if target_bpm <= 0.0 || !target_bpm.is_finite() {
            return Err(SchedulerError::InvalidTempo(target_bpm));
        }
        if span_pulses == 0 {
            return Err(SchedulerError::InvalidRampSpan);
        }
        Ok(Self {
            start_bpm,
            target_bpm,
            span_pulses,
            elapsed_pulses: 0,
            easing,
        })
    }

    /// Linear ramp.
    pub fn linear(
        start_bpm: f64,
        target_bpm: f64,
        span_pulses: u64,
    ) -> Result<Self, SchedulerError> {
        Self::new(start_bpm, target_bpm, span_pulses, easing::linear)
    }

    pub fn target_bpm(&self) -> f64 {
        self.target_bpm
    }

    /// Advance by one pulse and return the tempo effective for the next
    /// pulse interval.
    pub fn advance(&mut self) -> f64 {
        self.elapsed_pulses = (self.elapsed_pulses + 1).min(self.span_pulses);
        self.current_bpm()
    }

    /// Tempo at the current elapsed position.
    pub fn current_bpm(&self) -> f64 {
        if self.elapsed_pulses >= self.span_pulses {
            return self.target_bpm;
        }
        let progress = self.elapsed_pulses as f64 / self.span_pulses as f64;
        let eased = (self.easing)(progress);
        self.start_bpm + (self.target_bpm - self.start_bpm) * eased
    }

    pub fn is_finished(&self) -> bool {
        self.elapsed_pulses >= self.span_pulses
    }
}
