//! Pulse-based timing constants.
//!
//! The engine uses 24 pulses per quarter note (PPQN = 24) as its internal
//! time base, matching the standard MIDI clock resolution so the internal
//! counter and an external MIDI clock advance in lockstep.

/// Pulses per quarter note. Fixed at the MIDI clock rate.
pub const PPQN: u64 = 24;

/// Beats per bar. 4/4 time is assumed throughout the engine.
pub const BEATS_PER_BAR: u64 = 4;

/// Pulses per bar at 4/4.
pub const PULSES_PER_BAR: u64 = PPQN * BEATS_PER_BAR;

// Pulse counts for standard note durations.

pub const THIRTYSECOND_NOTE: u64 = 3;
pub const SIXTEENTH_NOTE: u64 = 6;
pub const EIGHTH_NOTE: u64 = 12;
pub const QUARTER_NOTE: u64 = 24;
pub const HALF_NOTE: u64 = 48;
pub const WHOLE_NOTE: u64 = 96;
