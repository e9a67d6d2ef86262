//! Error types for the scheduling engine.
//!
//! Scheduling mistakes are rejected at schedule time with a
//! [`SchedulerError`]. Soft failures — a pattern's regeneration hook or a
//! scheduled callback returning an error — are boxed at the boundary,
//! logged, and absorbed: they never terminate the pulse loop.

use thiserror::Error;

/// Errors rejected at schedule time. Never silently clamped.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The reschedule lookahead is outside `(0, length]`.
    #[error("reschedule lookahead {lookahead} must be within (0, {length}]")]
    InvalidLookahead { lookahead: f64, length: f64 },

    /// The cycle length does not span at least one pulse.
    #[error("cycle length {0} beats is shorter than one pulse")]
    InvalidLength(f64),

    /// A tempo value outside the usable range.
    #[error("tempo must be positive, got {0} BPM")]
    InvalidTempo(f64),

    /// A tempo ramp with a zero pulse span.
    #[error("tempo ramp span must be at least one pulse")]
    InvalidRampSpan,

    /// The engine run thread is gone; the command could not be delivered.
    #[error("sequencer is not running")]
    NotRunning,
}

/// Boxed error returned by regeneration hooks and scheduled callbacks.
///
/// Any non-success outcome is treated as "produce nothing for this cycle":
/// the scheduler logs it and substitutes silence, preserving the cycle
/// counter so subsequent cycles are unaffected.
pub type RegenError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed error returned by an output driver or an event listener.
pub type DriverError = Box<dyn std::error::Error + Send + Sync>;
