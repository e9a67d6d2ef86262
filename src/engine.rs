//! The scheduling engine: one logical tick driving event dispatch,
//! callback firing, and pattern regeneration.
//!
//! [`Engine`] owns the event queue, the scheduled patterns and callbacks,
//! and the tempo state. It has no notion of wall-clock time; pulses are
//! driven from outside, by the realtime [`PulseClock`](crate::clock::PulseClock),
//! the external [`ClockFollower`](crate::follower::ClockFollower), or a test
//! calling [`advance_pulse`](Engine::advance_pulse) directly.
//!
//! Pattern regeneration runs on short-lived worker threads so a slow or
//! blocking reschedule hook stalls only that pattern's next cycle, never
//! the clock. Results come back over a channel and are integrated at the
//! next pulse boundary; the reschedule lookahead is exactly the margin that
//! makes this safe.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::constants::{PPQN, PULSES_PER_BAR};
use crate::easing::EasingFn;
use crate::emitter::{EngineEvent, EventEmitter};
use crate::error::{RegenError, SchedulerError};
use crate::event_queue::EventQueue;
use crate::events::MidiMessage;
use crate::midi_io::OutputDriver;
use crate::pattern::{ControlEvent, SharedPattern, StepMap};
use crate::tempo::{TempoRamp, TempoState};

/// Identity of a scheduled pattern, used for unscheduling and in
/// observability events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PatternId(pub(crate) u64);

/// Identity of a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackId(pub(crate) u64);

/// Context handed to context-aware callbacks.
#[derive(Debug, Clone, Copy)]
pub struct CallbackContext {
    /// The pulse at which the callback fired.
    pub pulse: u64,
    /// How many times this callback has fired before, starting at 0.
    pub cycle: u64,
}

/// A scheduled action. The kind is chosen at registration time: either the
/// callback wants no context, or it receives a [`CallbackContext`].
pub enum CallbackFn {
    ContextFree(Box<dyn FnMut() -> Result<(), RegenError> + Send>),
    ContextAware(Box<dyn FnMut(CallbackContext) -> Result<(), RegenError> + Send>),
}

struct ScheduledPattern {
    pattern: SharedPattern,
    cycle_start_pulse: u64,
    /// Length committed when this cycle was expanded. The in-flight cycle
    /// keeps it even if the hook changes the pattern's length.
    length_pulses: u64,
    lookahead_pulses: u64,
    next_reschedule_pulse: u64,
    cycle: u64,
    regenerating: bool,
}

struct ScheduledCallback {
    callback: CallbackFn,
    interval_pulses: u64,
    next_fire_pulse: u64,
    repeating: bool,
    cycle: u64,
}

/// What a regeneration worker sends back: the next cycle, fully expanded.
struct RegenOutcome {
    id: PatternId,
    cycle: u64,
    start_pulse: u64,
    events: Vec<(u64, MidiMessage)>,
    length_pulses: u64,
    lookahead_pulses: u64,
}

/// Counters exposed for observability: pulses elapsed, late dispatches,
/// failed sends, and clock jitter extremes.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimingStats {
    pub pulses: u64,
    pub late_events: u64,
    pub send_failures: u64,
    pub last_jitter_secs: f64,
    pub max_jitter_secs: f64,
}

impl TimingStats {
    pub(crate) fn record_jitter(&mut self, secs: f64) {
        self.last_jitter_secs = secs;
        if secs > self.max_jitter_secs {
            self.max_jitter_secs = secs;
        }
    }
}

/// The scheduling engine. See the module docs for the ownership model.
pub struct Engine {
    driver: Box<dyn OutputDriver>,
    tempo: TempoState,
    ramp: Option<TempoRamp>,
    externally_clocked: bool,
    clock_output: bool,

    queue: EventQueue,
    patterns: HashMap<PatternId, ScheduledPattern>,
    reschedule_heap: BinaryHeap<Reverse<(u64, u64, PatternId)>>,
    callbacks: HashMap<CallbackId, ScheduledCallback>,
    callback_heap: BinaryHeap<Reverse<(u64, u64, CallbackId)>>,
    heap_seq: u64,
    next_pattern_id: u64,
    next_callback_id: u64,

    pulse_count: u64,
    current_bar: Option<u64>,
    current_beat: Option<u64>,
    active_notes: HashSet<(u8, u8)>,

    emitter: EventEmitter,
    stats: TimingStats,

    regen_tx: Sender<RegenOutcome>,
    regen_rx: Receiver<RegenOutcome>,
    pending_regens: usize,
}

impl Engine {
    pub fn new(driver: Box<dyn OutputDriver>, initial_bpm: f64) -> Result<Self, SchedulerError> {
        let (regen_tx, regen_rx) = channel::unbounded();
        Ok(Self {
            driver,
            tempo: TempoState::new(initial_bpm)?,
            ramp: None,
            externally_clocked: false,
            clock_output: false,
            queue: EventQueue::new(),
            patterns: HashMap::new(),
            reschedule_heap: BinaryHeap::new(),
            callbacks: HashMap::new(),
            callback_heap: BinaryHeap::new(),
            heap_seq: 0,
            next_pattern_id: 0,
            next_callback_id: 0,
            pulse_count: 0,
            current_bar: None,
            current_beat: None,
            active_notes: HashSet::new(),
            emitter: EventEmitter::new(),
            stats: TimingStats::default(),
            regen_tx,
            regen_rx,
            pending_regens: 0,
        })
    }

    /// The observability emitter: register listeners or take a channel
    /// subscription.
    pub fn emitter_mut(&mut self) -> &mut EventEmitter {
        &mut self.emitter
    }

    pub fn tempo(&self) -> TempoState {
        self.tempo
    }

    pub fn pulse(&self) -> u64 {
        self.pulse_count
    }

    pub fn stats(&self) -> TimingStats {
        self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut TimingStats {
        &mut self.stats
    }

    /// When true, a MIDI clock tick (0xF8) is sent on every pulse so
    /// connected hardware can sync to this engine's tempo.
    pub fn set_clock_output(&mut self, enabled: bool) {
        self.clock_output = enabled;
    }

    /// Marks the tempo as derived from an external clock. While set,
    /// [`set_bpm`](Self::set_bpm) and [`set_target_bpm`](Self::set_target_bpm)
    /// are logged no-ops.
    pub fn set_externally_clocked(&mut self, enabled: bool) {
        self.externally_clocked = enabled;
    }

    /// Instantly change the tempo, cancelling any in-flight ramp. Takes
    /// effect at the next pulse boundary.
    pub fn set_bpm(&mut self, bpm: f64) -> Result<(), SchedulerError> {
        if self.externally_clocked {
            info!("tempo is slaved to the external clock; set_bpm ignored");
            return Ok(());
        }
        self.ramp = None;
        self.tempo.set_bpm(bpm)?;
        info!("tempo set to {bpm:.2} BPM");
        self.emitter.emit(EngineEvent::TempoChanged(bpm));
        Ok(())
    }

    /// Smoothly ramp to a new tempo over a pulse span.
    pub fn set_target_bpm(
        &mut self,
        target_bpm: f64,
        span_pulses: u64,
        easing: EasingFn,
    ) -> Result<(), SchedulerError> {
        if self.externally_clocked {
            info!("tempo is slaved to the external clock; set_target_bpm ignored");
            return Ok(());
        }
        let start = self.tempo.bpm();
        self.ramp = Some(TempoRamp::new(start, target_bpm, span_pulses, easing)?);
        info!("tempo ramp: {start:.2} -> {target_bpm:.2} BPM over {span_pulses} pulses");
        Ok(())
    }

    /// Adopt a tempo estimated from an external clock. Bypasses the
    /// external-clock guard; used by the clock follower.
    pub(crate) fn apply_external_bpm(&mut self, bpm: f64) {
        let rounded = bpm.round();
        if rounded > 0.0 && rounded != self.tempo.bpm() {
            // Estimated tempo is advisory; the pulse advance itself is
            // driven tick-by-tick, so rounding is safe.
            if self.tempo.set_bpm(rounded).is_ok() {
                self.emitter.emit(EngineEvent::TempoChanged(rounded));
            }
        }
    }

    /// Expand one cycle of a pattern into the queue, without registering it
    /// for rescheduling.
    pub fn schedule_pattern_once(
        &mut self,
        pattern: &SharedPattern,
        start_pulse: u64,
    ) -> Result<(), SchedulerError> {
        let guard = lock_pattern(pattern);
        // Validated so a one-shot and a repeating schedule reject the same
        // inputs, even though no reschedule point is recorded.
        schedule_timing(guard.length_beats(), guard.reschedule_lookahead_beats())?;
        let events = expand_steps(guard.channel(), &guard.steps(), start_pulse);
        drop(guard);
        for (pulse, message) in events {
            self.queue.push(pulse, message, None);
        }
        Ok(())
    }

    /// Schedule a pattern to repeat, regenerating before every cycle.
    ///
    /// Fails with [`SchedulerError::InvalidLookahead`] (scheduling nothing)
    /// unless `0 < lookahead <= length`.
    pub fn schedule_pattern_repeating(
        &mut self,
        pattern: SharedPattern,
        start_pulse: u64,
    ) -> Result<PatternId, SchedulerError> {
        let (channel, length_pulses, lookahead_pulses, steps) = {
            let guard = lock_pattern(&pattern);
            let (length, lookahead) =
                schedule_timing(guard.length_beats(), guard.reschedule_lookahead_beats())?;
            (guard.channel(), length, lookahead, guard.steps())
        };

        let id = PatternId(self.next_pattern_id);
        self.next_pattern_id += 1;

        for (pulse, message) in expand_steps(channel, &steps, start_pulse) {
            self.queue.push(pulse, message, Some(id));
        }

        let next_reschedule_pulse = start_pulse + length_pulses - lookahead_pulses;
        self.patterns.insert(
            id,
            ScheduledPattern {
                pattern,
                cycle_start_pulse: start_pulse,
                length_pulses,
                lookahead_pulses,
                next_reschedule_pulse,
                cycle: 0,
                regenerating: false,
            },
        );
        self.push_reschedule_entry(next_reschedule_pulse, id);
        debug!(
            "scheduled pattern {id:?} at pulse {start_pulse} ({length_pulses} pulses/cycle), queue size {}",
            self.queue.len()
        );
        Ok(id)
    }

    /// Remove a pattern: its pending events, its reschedule entry, and any
    /// in-flight regeneration result.
    pub fn unschedule(&mut self, id: PatternId) -> bool {
        let removed = self.patterns.remove(&id).is_some();
        if removed {
            self.queue.remove_source(id);
            debug!("unscheduled pattern {id:?}");
        }
        removed
    }

    /// Schedule a repeating context-free callback.
    ///
    /// The first fire is backshifted to `interval - lookahead` pulses so a
    /// freshly scheduled action behaves as if it had already been running,
    /// firing near the start instead of waiting out a full interval.
    pub fn schedule_callback_repeating(
        &mut self,
        interval_pulses: u64,
        lookahead_pulses: u64,
        callback: impl FnMut() -> Result<(), RegenError> + Send + 'static,
    ) -> Result<CallbackId, SchedulerError> {
        self.insert_repeating(
            CallbackFn::ContextFree(Box::new(callback)),
            interval_pulses,
            lookahead_pulses,
        )
    }

    /// Schedule a repeating callback that receives a [`CallbackContext`].
    pub fn schedule_callback_repeating_with_context(
        &mut self,
        interval_pulses: u64,
        lookahead_pulses: u64,
        callback: impl FnMut(CallbackContext) -> Result<(), RegenError> + Send + 'static,
    ) -> Result<CallbackId, SchedulerError> {
        self.insert_repeating(
            CallbackFn::ContextAware(Box::new(callback)),
            interval_pulses,
            lookahead_pulses,
        )
    }

    fn insert_repeating(
        &mut self,
        callback: CallbackFn,
        interval_pulses: u64,
        lookahead_pulses: u64,
    ) -> Result<CallbackId, SchedulerError> {
        if interval_pulses == 0 {
            return Err(SchedulerError::InvalidLength(0.0));
        }
        if lookahead_pulses == 0 || lookahead_pulses > interval_pulses {
            return Err(SchedulerError::InvalidLookahead {
                lookahead: lookahead_pulses as f64 / PPQN as f64,
                length: interval_pulses as f64 / PPQN as f64,
            });
        }
        let id = CallbackId(self.next_callback_id);
        self.next_callback_id += 1;
        let first_fire = interval_pulses - lookahead_pulses;
        self.callbacks.insert(
            id,
            ScheduledCallback {
                callback,
                interval_pulses,
                next_fire_pulse: first_fire,
                repeating: true,
                cycle: 0,
            },
        );
        self.push_callback_entry(first_fire, id);
        Ok(id)
    }

    /// Schedule a callback that fires exactly once at `at_pulse` and then
    /// removes itself.
    pub fn schedule_callback_once(
        &mut self,
        at_pulse: u64,
        callback: impl FnMut() -> Result<(), RegenError> + Send + 'static,
    ) -> CallbackId {
        let id = CallbackId(self.next_callback_id);
        self.next_callback_id += 1;
        self.callbacks.insert(
            id,
            ScheduledCallback {
                callback: CallbackFn::ContextFree(Box::new(callback)),
                interval_pulses: 0,
                next_fire_pulse: at_pulse,
                repeating: false,
                cycle: 0,
            },
        );
        self.push_callback_entry(at_pulse, id);
        id
    }

    /// Remove a scheduled callback.
    pub fn unschedule_callback(&mut self, id: CallbackId) -> bool {
        self.callbacks.remove(&id).is_some()
    }

    /// True when nothing remains to play: no pending events, sounding
    /// notes, scheduled patterns or callbacks, or in-flight regenerations.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
            && self.active_notes.is_empty()
            && self.patterns.is_empty()
            && self.callbacks.is_empty()
            && self.pending_regens == 0
    }

    /// Process one pulse: integrate finished regenerations, step the tempo
    /// ramp, fire due callbacks, trigger due reschedules, dispatch due
    /// events, then increment the counter.
    pub fn advance_pulse(&mut self) {
        let pulse = self.pulse_count;

        self.drain_regenerations();
        self.check_bar_beat(pulse);
        self.step_tempo_ramp();
        if self.clock_output {
            self.send(&MidiMessage::Clock);
        }
        self.fire_due_callbacks(pulse);
        self.trigger_due_reschedules(pulse);
        self.dispatch_due_events(pulse);

        self.stats.pulses += 1;
        self.pulse_count = pulse + 1;
    }

    /// Block until every in-flight regeneration has been integrated.
    ///
    /// Used on shutdown-with-drain and by tests that need the next cycle's
    /// events to be observable. A hook that blocks forever blocks this too.
    pub fn sync_regenerations(&mut self) {
        while self.pending_regens > 0 {
            match self.regen_rx.recv() {
                Ok(outcome) => self.integrate(outcome),
                Err(_) => break,
            }
        }
    }

    /// Reset the pulse counter and bar/beat state to the top of the
    /// transport. Schedule records are untouched.
    pub fn reset_transport(&mut self) {
        self.pulse_count = 0;
        self.current_bar = None;
        self.current_beat = None;
    }

    /// Silence everything: note-offs for every tracked active note, then
    /// All Notes Off (CC 123) and All Sound Off (CC 120) on all 16
    /// channels, then the driver's own panic.
    pub fn panic(&mut self) {
        info!("panic: sending all notes off");
        let notes: Vec<(u8, u8)> = self.active_notes.drain().collect();
        for (channel, note) in notes {
            self.send(&MidiMessage::NoteOff { channel, note });
        }
        for channel in 0..16 {
            self.send(&MidiMessage::ControlChange {
                channel,
                control: 123,
                value: 0,
            });
            self.send(&MidiMessage::ControlChange {
                channel,
                control: 120,
                value: 0,
            });
        }
        if let Err(e) = self.driver.panic() {
            error!("driver panic failed (device may be disconnected): {e}");
        }
    }

    /// Stop-time flush: cancel any ramp, silence the output, and drop
    /// pending queue events. Pattern and callback records stay so a later
    /// start resumes the same schedule.
    pub fn stop_flush(&mut self) {
        self.ramp = None;
        self.panic();
        self.queue.clear();
    }

    /// Release the output port. Called once when the owning thread exits.
    pub fn close_driver(&mut self) {
        if let Err(e) = self.driver.close() {
            warn!("driver close failed: {e}");
        }
    }

    /// Send a system realtime transport message directly to the driver,
    /// bypassing the queue.
    pub(crate) fn send_transport(&mut self, message: MidiMessage) {
        debug_assert!(message.is_realtime());
        self.send(&message);
    }

    pub(crate) fn emit(&mut self, event: EngineEvent) {
        self.emitter.emit(event);
    }

    fn push_reschedule_entry(&mut self, at_pulse: u64, id: PatternId) {
        let seq = self.heap_seq;
        self.heap_seq += 1;
        self.reschedule_heap.push(Reverse((at_pulse, seq, id)));
    }

    fn push_callback_entry(&mut self, at_pulse: u64, id: CallbackId) {
        let seq = self.heap_seq;
        self.heap_seq += 1;
        self.callback_heap.push(Reverse((at_pulse, seq, id)));
    }

    fn check_bar_beat(&mut self, pulse: u64) {
        let bar = pulse / PULSES_PER_BAR;
        if self.current_bar.map_or(true, |current| bar > current) {
            self.current_bar = Some(bar);
            self.emitter.emit(EngineEvent::Bar(bar));
        }
        let beat = (pulse % PULSES_PER_BAR) / PPQN;
        if self.current_beat != Some(beat) {
            self.current_beat = Some(beat);
            self.emitter.emit(EngineEvent::Beat(beat));
        }
    }

    fn step_tempo_ramp(&mut self) {
        let Some(ramp) = self.ramp.as_mut() else {
            return;
        };
        let bpm = ramp.advance();
        if ramp.is_finished() {
            let target = ramp.target_bpm();
            self.ramp = None;
            if self.tempo.set_bpm(target).is_ok() {
                info!("tempo ramp complete at {target:.2} BPM");
                self.emitter.emit(EngineEvent::TempoChanged(target));
            }
        } else if self.tempo.set_bpm(bpm).is_err() {
            // A custom easing curve escaped [0, 1] far enough to produce a
            // nonsense tempo; abandon the ramp at its target.
            let target = ramp.target_bpm();
            warn!("easing produced non-positive tempo; snapping to {target:.2} BPM");
            self.ramp = None;
            let _ = self.tempo.set_bpm(target);
            self.emitter.emit(EngineEvent::TempoChanged(target));
        }
    }

    // Callbacks fire before pattern rebuilds at the same pulse, so shared
    // state (e.g. harmonic advancement) is updated before patterns read it.
    fn fire_due_callbacks(&mut self, pulse: u64) {
        loop {
            let id = match self.callback_heap.peek() {
                Some(Reverse((fire, _, id))) if *fire <= pulse => *id,
                _ => break,
            };
            self.callback_heap.pop();
            let Some(mut scheduled) = self.callbacks.remove(&id) else {
                // Stale heap entry for an unscheduled callback.
                continue;
            };

            let context = CallbackContext {
                pulse,
                cycle: scheduled.cycle,
            };
            let result = match &mut scheduled.callback {
                CallbackFn::ContextFree(f) => f(),
                CallbackFn::ContextAware(f) => f(context),
            };
            if let Err(e) = result {
                error!("scheduled callback {id:?} failed: {e}");
            }

            if scheduled.repeating {
                scheduled.cycle += 1;
                scheduled.next_fire_pulse += scheduled.interval_pulses;
                let fire = scheduled.next_fire_pulse;
                self.callbacks.insert(id, scheduled);
                self.push_callback_entry(fire, id);
            }
        }
    }

    fn trigger_due_reschedules(&mut self, pulse: u64) {
        loop {
            let id = match self.reschedule_heap.peek() {
                Some(Reverse((at, _, id))) if *at <= pulse => *id,
                _ => break,
            };
            self.reschedule_heap.pop();
            let Some(scheduled) = self.patterns.get_mut(&id) else {
                continue;
            };
            if scheduled.regenerating {
                continue;
            }
            scheduled.regenerating = true;
            let pattern = Arc::clone(&scheduled.pattern);
            let cycle = scheduled.cycle + 1;
            // The current cycle finishes at its committed length even if
            // the hook changes the pattern's length for the next one.
            let next_start = scheduled.cycle_start_pulse + scheduled.length_pulses;
            let prev_length = scheduled.length_pulses;
            let prev_lookahead = scheduled.lookahead_pulses;

            // Notification precedes the hook, which precedes expansion.
            self.emitter.emit(EngineEvent::Reschedule { pulse, pattern: id });
            self.spawn_regeneration(id, pattern, cycle, next_start, prev_length, prev_lookahead);
        }
    }

    fn spawn_regeneration(
        &mut self,
        id: PatternId,
        pattern: SharedPattern,
        cycle: u64,
        start_pulse: u64,
        prev_length: u64,
        prev_lookahead: u64,
    ) {
        let tx = self.regen_tx.clone();
        self.pending_regens += 1;
        thread::spawn(move || {
            let outcome = regenerate(id, &pattern, cycle, start_pulse, prev_length, prev_lookahead);
            // The engine may have shut down; nothing to do then.
            let _ = tx.send(outcome);
        });
    }

    fn drain_regenerations(&mut self) {
        while let Ok(outcome) = self.regen_rx.try_recv() {
            self.integrate(outcome);
        }
    }

    fn integrate(&mut self, outcome: RegenOutcome) {
        self.pending_regens = self.pending_regens.saturating_sub(1);
        let id = outcome.id;
        let Some(scheduled) = self.patterns.get_mut(&id) else {
            debug!("dropping regeneration result for unscheduled pattern {id:?}");
            return;
        };
        scheduled.cycle_start_pulse = outcome.start_pulse;
        scheduled.length_pulses = outcome.length_pulses;
        scheduled.lookahead_pulses = outcome.lookahead_pulses;
        scheduled.cycle = outcome.cycle;
        scheduled.next_reschedule_pulse =
            outcome.start_pulse + outcome.length_pulses - outcome.lookahead_pulses;
        scheduled.regenerating = false;
        let next = scheduled.next_reschedule_pulse;

        for (pulse, message) in outcome.events {
            self.queue.push(pulse, message, Some(id));
        }
        self.push_reschedule_entry(next, id);
    }

    fn dispatch_due_events(&mut self, pulse: u64) {
        for event in self.queue.pop_due(pulse) {
            if event.pulse < pulse {
                self.stats.late_events += 1;
                let behind = pulse - event.pulse;
                if behind >= PPQN {
                    warn!("dispatching event {behind} pulses late");
                }
            }
            match &event.message {
                MidiMessage::NoteOn {
                    channel,
                    note,
                    velocity,
                } if *velocity > 0 => {
                    self.active_notes.insert((*channel, *note));
                }
                MidiMessage::NoteOn { channel, note, .. }
                | MidiMessage::NoteOff { channel, note } => {
                    self.active_notes.remove(&(*channel, *note));
                }
                _ => {}
            }
            self.send(&event.message);
        }
    }

    fn send(&mut self, message: &MidiMessage) {
        if let Err(e) = self.driver.send(message) {
            self.stats.send_failures += 1;
            error!("MIDI send failed (device may be disconnected): {e}");
        }
    }
}

fn lock_pattern(
    pattern: &SharedPattern,
) -> std::sync::MutexGuard<'_, dyn crate::pattern::Pattern + 'static> {
    match pattern.lock() {
        Ok(guard) => guard,
        // A previous hook panicked mid-rebuild; the step map is still
        // structurally valid, so keep going.
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Runs on a regeneration worker thread: invoke the hook, re-read the
/// pattern's timing, and expand the next cycle.
fn regenerate(
    id: PatternId,
    pattern: &SharedPattern,
    cycle: u64,
    start_pulse: u64,
    prev_length: u64,
    prev_lookahead: u64,
) -> RegenOutcome {
    let mut guard = lock_pattern(pattern);
    let hook_result = guard.on_reschedule(cycle);
    let timing = schedule_timing(guard.length_beats(), guard.reschedule_lookahead_beats());

    match (hook_result, timing) {
        (Ok(()), Ok((length_pulses, lookahead_pulses))) => RegenOutcome {
            id,
            cycle,
            start_pulse,
            events: expand_steps(guard.channel(), &guard.steps(), start_pulse),
            length_pulses,
            lookahead_pulses,
        },
        (Err(e), Ok((length_pulses, lookahead_pulses))) => {
            error!("pattern {id:?} regeneration failed; cycle {cycle} plays silence: {e}");
            RegenOutcome {
                id,
                cycle,
                start_pulse,
                events: Vec::new(),
                length_pulses,
                lookahead_pulses,
            }
        }
        (_, Err(e)) => {
            error!("pattern {id:?} timing is invalid after reschedule; keeping previous cycle length: {e}");
            RegenOutcome {
                id,
                cycle,
                start_pulse,
                events: Vec::new(),
                length_pulses: prev_length,
                lookahead_pulses: prev_lookahead,
            }
        }
    }
}

/// Convert a cycle length and reschedule lookahead from beats to pulses,
/// enforcing `0 < lookahead <= length` and at least one pulse of each.
fn schedule_timing(length_beats: f64, lookahead_beats: f64) -> Result<(u64, u64), SchedulerError> {
    if length_beats.is_nan() || length_beats <= 0.0 {
        return Err(SchedulerError::InvalidLength(length_beats));
    }
    if lookahead_beats.is_nan() || lookahead_beats <= 0.0 || lookahead_beats > length_beats {
        return Err(SchedulerError::InvalidLookahead {
            lookahead: lookahead_beats,
            length: length_beats,
        });
    }

    let length_pulses = (length_beats * PPQN as f64).round() as u64;
    let lookahead_pulses = (lookahead_beats * PPQN as f64).round() as u64;
    if length_pulses == 0 {
        return Err(SchedulerError::InvalidLength(length_beats));
    }
    if lookahead_pulses == 0 || lookahead_pulses > length_pulses {
        return Err(SchedulerError::InvalidLookahead {
            lookahead: lookahead_beats,
            length: length_beats,
        });
    }
    Ok((length_pulses, lookahead_pulses))
}

/// Expand a step map into absolute-pulse messages: a note-on plus its
/// matching note-off at `on_pulse + duration`, and any control events.
fn expand_steps(channel: u8, steps: &StepMap, start_pulse: u64) -> Vec<(u64, MidiMessage)> {
    let mut events = Vec::new();
    for (position, step) in steps {
        let pulse = start_pulse + position;
        for note in &step.notes {
            events.push((
                pulse,
                MidiMessage::NoteOn {
                    channel,
                    note: note.pitch,
                    velocity: note.velocity,
                },
            ));
            events.push((
                pulse + note.duration,
                MidiMessage::NoteOff {
                    channel,
                    note: note.pitch,
                },
            ));
        }
        for control in &step.controls {
            let message = match control {
                ControlEvent::ControlChange { control, value } => MidiMessage::ControlChange {
                    channel,
                    control: *control,
                    value: *value,
                },
                ControlEvent::PitchBend { value } => MidiMessage::PitchBend {
                    channel,
                    value: *value,
                },
                ControlEvent::ProgramChange { program } => MidiMessage::ProgramChange {
                    channel,
                    program: *program,
                },
                ControlEvent::Aftertouch { note, value } => MidiMessage::Aftertouch {
                    channel,
                    note: *note,
                    value: *value,
                },
                ControlEvent::ChannelPressure { value } => MidiMessage::ChannelPressure {
                    channel,
                    value: *value,
                },
            };
            events.push((pulse, message));
        }
    }
    events
}
