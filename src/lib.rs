//! Pulse-accurate generative MIDI sequencing.
//!
//! The engine runs a 24 PPQN pulse clock and schedules patterns that
//! regenerate themselves shortly before every repeat, so procedural music
//! can evolve while it plays without ever missing a cycle boundary. It can
//! drive hardware from its internal clock, follow an external MIDI clock,
//! or render offline for tests and export.
//!
//! Typical use goes through [`sequencer::Sequencer`], which owns the
//! realtime thread; [`engine::Engine`] is the deterministic core underneath
//! it.

pub mod clock;
pub mod config;
pub mod constants;
pub mod easing;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod event_queue;
pub mod events;
pub mod follower;
pub mod midi_io;
pub mod pattern;
pub mod render;
pub mod sequencer;
pub mod tempo;

pub use config::Config;
pub use engine::{CallbackContext, CallbackId, Engine, PatternId};
pub use error::SchedulerError;
pub use events::MidiMessage;
pub use pattern::{shared, GridPattern, Pattern, SharedPattern};
pub use sequencer::Sequencer;
