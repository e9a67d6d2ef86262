//! The pattern capability consumed by the scheduler.
//!
//! A pattern is a repeating content generator: a MIDI channel, a cycle
//! length in beats, a reschedule lookahead, and a step map from relative
//! pulse to the notes and control events that fire there. Content DSLs
//! (step grids, Euclidean generators, notation parsers) live outside the
//! engine; they plug in by implementing [`Pattern`]. [`GridPattern`] is the
//! minimal concrete implementation used by the demos and tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::RegenError;

/// A single note within a step: pitch, velocity, and duration in pulses.
/// The channel comes from the owning pattern at expansion time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub pitch: u8,
    pub velocity: u8,
    pub duration: u64,
}

/// A non-note event within a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    ControlChange { control: u8, value: u8 },
    PitchBend { value: i16 },
    ProgramChange { program: u8 },
    Aftertouch { note: u8, value: u8 },
    ChannelPressure { value: u8 },
}

/// Everything that fires at one relative pulse position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Step {
    pub notes: Vec<Note>,
    pub controls: Vec<ControlEvent>,
}

/// Relative pulse position → step contents.
pub type StepMap = BTreeMap<u64, Step>;

/// A repeating content generator that can be scheduled.
///
/// The scheduler re-reads `length_beats` and `reschedule_lookahead_beats`
/// at every reschedule, so a hook may change them for the *next* cycle; the
/// in-flight cycle keeps the length it was committed with.
pub trait Pattern: Send {
    /// MIDI channel all of this pattern's events are sent on.
    fn channel(&self) -> u8;

    /// Cycle length in beats. May be fractional.
    fn length_beats(&self) -> f64;

    /// How many beats before the cycle boundary the next cycle's content is
    /// regenerated and queued. Must satisfy `0 < lookahead <= length`.
    fn reschedule_lookahead_beats(&self) -> f64;

    /// Snapshot of the current step map.
    fn steps(&self) -> StepMap;

    /// Hook invoked once per cycle, just before the next cycle is expanded.
    ///
    /// `cycle` is the index of the upcoming cycle (the first regeneration
    /// receives 1). An `Err` means the next cycle plays silence; it is
    /// logged and never propagated into the clock loop.
    fn on_reschedule(&mut self, cycle: u64) -> Result<(), RegenError> {
        let _ = cycle;
        Ok(())
    }
}

/// A pattern handle the scheduler and its regeneration workers can share.
///
/// The creating layer may keep a clone for live edits; the scheduler locks
/// it only while reading the step map or running the reschedule hook.
pub type SharedPattern = Arc<Mutex<dyn Pattern>>;

/// Wrap a pattern for scheduling.
pub fn shared<P: Pattern + 'static>(pattern: P) -> SharedPattern {
    Arc::new(Mutex::new(pattern))
}

/// Closure invoked on each reschedule of a [`GridPattern`]. Receives the
/// pattern (with its steps already cleared) and the upcoming cycle index.
pub type RebuildFn = Box<dyn FnMut(&mut GridPattern, u64) -> Result<(), RegenError> + Send>;

/// A plain step-grid pattern.
///
/// Static by default: whatever was added keeps repeating. With
/// [`set_rebuild`](Self::set_rebuild) the steps are cleared and rebuilt by
/// the closure before every cycle, which is how procedural variation and
/// live edits become audible on the next loop.
pub struct GridPattern {
    channel: u8,
    length_beats: f64,
    lookahead_beats: f64,
    steps: StepMap,
    rebuild: Option<RebuildFn>,
}

impl GridPattern {
    /// New empty pattern on `channel`: 4 beats long, 1 beat of lookahead.
    pub fn new(channel: u8) -> Self {
        Self {
            channel,
            length_beats: 4.0,
            lookahead_beats: 1.0,
            steps: StepMap::new(),
            rebuild: None,
        }
    }

    pub fn with_length(mut self, beats: f64) -> Self {
        self.length_beats = beats;
        self
    }

    pub fn with_lookahead(mut self, beats: f64) -> Self {
        self.lookahead_beats = beats;
        self
    }

    /// Change the cycle length. Takes effect at the next reschedule.
    pub fn set_length(&mut self, beats: f64) {
        self.length_beats = beats;
    }

    /// Change the reschedule lookahead. Takes effect at the next reschedule.
    pub fn set_lookahead(&mut self, beats: f64) {
        self.lookahead_beats = beats;
    }

    /// Install a rebuild closure run before every cycle.
    pub fn set_rebuild(
        &mut self,
        rebuild: impl FnMut(&mut GridPattern, u64) -> Result<(), RegenError> + Send + 'static,
    ) {
        self.rebuild = Some(Box::new(rebuild));
    }

    /// Builder form of [`set_rebuild`](Self::set_rebuild).
    pub fn with_rebuild(
        mut self,
        rebuild: impl FnMut(&mut GridPattern, u64) -> Result<(), RegenError> + Send + 'static,
    ) -> Self {
        self.set_rebuild(rebuild);
        self
    }

    /// Add a note at a relative pulse position.
    pub fn add_note(&mut self, position: u64, pitch: u8, velocity: u8, duration: u64) {
        self.steps.entry(position).or_default().notes.push(Note {
            pitch,
            velocity,
            duration,
        });
    }

    /// Add a control event at a relative pulse position.
    pub fn add_control(&mut self, position: u64, control: ControlEvent) {
        self.steps.entry(position).or_default().controls.push(control);
    }

    /// Add a hit sequence: one slot every `step_pulses`, a note wherever the
    /// slot is true. Velocities cycle if shorter than the sequence.
    pub fn add_sequence(
        &mut self,
        hits: &[bool],
        step_pulses: u64,
        pitch: u8,
        velocities: &[u8],
        duration: u64,
    ) {
        for (i, hit) in hits.iter().enumerate() {
            if *hit {
                let velocity = velocities[i % velocities.len().max(1)];
                self.add_note(i as u64 * step_pulses, pitch, velocity, duration);
            }
        }
    }

    /// Remove all steps.
    pub fn clear(&mut self) {
        self.steps.clear();
    }
}

impl Pattern for GridPattern {
    fn channel(&self) -> u8 {
        self.channel
    }

    fn length_beats(&self) -> f64 {
        self.length_beats
    }

    fn reschedule_lookahead_beats(&self) -> f64 {
        self.lookahead_beats
    }

    fn steps(&self) -> StepMap {
        self.steps.clone()
    }

    fn on_reschedule(&mut self, cycle: u64) -> Result<(), RegenError> {
        // Take the closure out so it can borrow the pattern mutably.
        if let Some(mut rebuild) = self.rebuild.take() {
            self.steps.clear();
            let result = rebuild(self, cycle);
            self.rebuild = Some(rebuild);
            result
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SIXTEENTH_NOTE;

    #[test]
    fn add_note_groups_by_position() {
        let mut p = GridPattern::new(0);
        p.add_note(0, 60, 100, 6);
        p.add_note(0, 64, 100, 6);
        p.add_note(12, 67, 90, 6);

        let steps = p.steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[&0].notes.len(), 2);
        assert_eq!(steps[&12].notes[0].pitch, 67);
    }

    #[test]
    fn add_sequence_places_hits() {
        let mut p = GridPattern::new(9);
        p.add_sequence(
            &[true, false, true, false],
            SIXTEENTH_NOTE,
            36,
            &[110, 90],
            3,
        );

        let steps = p.steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[&0].notes[0].velocity, 110);
        assert_eq!(steps[&12].notes[0].velocity, 110); // index 2 wraps to 110
    }

    #[test]
    fn rebuild_clears_and_refills() {
        let mut p = GridPattern::new(0).with_rebuild(|p, cycle| {
            p.add_note(0, 60 + cycle as u8, 100, 6);
            Ok(())
        });
        p.add_note(0, 50, 100, 6);

        p.on_reschedule(1).unwrap();
        let steps = p.steps();
        assert_eq!(steps[&0].notes.len(), 1);
        assert_eq!(steps[&0].notes[0].pitch, 61);

        p.on_reschedule(2).unwrap();
        assert_eq!(p.steps()[&0].notes[0].pitch, 62);
    }

    #[test]
    fn rebuild_error_surfaces() {
        let mut p = GridPattern::new(0).with_rebuild(|_, _| Err("generator exploded".into()));
        assert!(p.on_reschedule(1).is_err());
        // The closure survives a failure and runs again next cycle.
        assert!(p.on_reschedule(2).is_err());
    }
}
