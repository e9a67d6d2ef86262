//! Following an external MIDI clock.
//!
//! In slave mode the engine advances one pulse per received clock tick
//! (0xF8) instead of sleeping on its own deadlines; Start, Stop, and
//! Continue drive a small state machine. Tempo is estimated from tick
//! arrival times purely for observability and display, since the ticks
//! themselves carry the timing.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use crate::clock::ClockControl;
use crate::constants::PPQN;
use crate::emitter::EngineEvent;
use crate::engine::Engine;

/// A transport-relevant message from the external clock source, as
/// delivered by the input driver.
#[derive(Debug, Clone, Copy)]
pub enum TransportMessage {
    /// A clock tick, stamped with its arrival time.
    Tick(Instant),
    Start,
    Stop,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerState {
    /// Waiting for Start or Continue. Clock ticks are discarded.
    Idle,
    /// Advancing one pulse per tick.
    Running,
}

/// Rolling tempo estimate from clock tick arrival times.
///
/// Keeps the last 48 timestamps and averages the most recent 24 intervals,
/// enough to smooth per-tick jitter while still tracking a tempo change
/// within about a beat.
#[derive(Debug, Default)]
pub struct BpmEstimator {
    timestamps: VecDeque<Instant>,
}

const ESTIMATOR_WINDOW: usize = 48;
const AVERAGE_INTERVALS: usize = 24;

impl BpmEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tick arrival; returns the current estimate once enough
    /// ticks have been seen.
    pub fn record(&mut self, at: Instant) -> Option<f64> {
        self.timestamps.push_back(at);
        if self.timestamps.len() > ESTIMATOR_WINDOW {
            self.timestamps.pop_front();
        }
        self.estimate()
    }

    pub fn estimate(&self) -> Option<f64> {
        let len = self.timestamps.len();
        if len < AVERAGE_INTERVALS + 1 {
            return None;
        }
        let newest = self.timestamps[len - 1];
        let oldest = self.timestamps[len - 1 - AVERAGE_INTERVALS];
        let seconds = newest.duration_since(oldest).as_secs_f64() / AVERAGE_INTERVALS as f64;
        if seconds <= 0.0 {
            return None;
        }
        Some(60.0 / (seconds * PPQN as f64))
    }

    /// Forget everything, e.g. after a transport restart.
    pub fn reset(&mut self) {
        self.timestamps.clear();
    }
}

/// Drives an [`Engine`] from a stream of [`TransportMessage`]s.
pub struct ClockFollower {
    rx: Receiver<TransportMessage>,
    state: FollowerState,
    estimator: BpmEstimator,
}

impl ClockFollower {
    pub fn new(rx: Receiver<TransportMessage>) -> Self {
        Self {
            rx,
            state: FollowerState::Idle,
            estimator: BpmEstimator::new(),
        }
    }

    pub fn state(&self) -> FollowerState {
        self.state
    }

    /// Run until `control` returns [`ClockControl::Stop`] or the input
    /// driver goes away. While running, local tempo changes on the engine
    /// are disabled.
    pub fn run(&mut self, engine: &mut Engine, mut control: impl FnMut(&mut Engine) -> ClockControl) {
        engine.set_externally_clocked(true);
        debug!("clock follower waiting for external transport");
        loop {
            if control(engine) == ClockControl::Stop {
                break;
            }
            match self.rx.recv_timeout(Duration::from_millis(10)) {
                Ok(message) => self.handle(engine, message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("external clock source disconnected");
                    break;
                }
            }
        }
        engine.set_externally_clocked(false);
    }

    fn handle(&mut self, engine: &mut Engine, message: TransportMessage) {
        match message {
            TransportMessage::Start => {
                // Start means "from the top" whether or not we were running.
                info!("external clock: start");
                engine.reset_transport();
                self.estimator.reset();
                self.state = FollowerState::Running;
                engine.emit(EngineEvent::Start);
            }
            TransportMessage::Continue => {
                if self.state == FollowerState::Idle {
                    info!("external clock: continue at pulse {}", engine.pulse());
                    self.state = FollowerState::Running;
                    engine.emit(EngineEvent::Start);
                }
            }
            TransportMessage::Stop => {
                if self.state == FollowerState::Running {
                    info!("external clock: stop");
                    self.state = FollowerState::Idle;
                    // The next tick after a resume arrives a silent gap
                    // later; an interval spanning that gap is not tempo.
                    self.estimator.reset();
                    engine.stop_flush();
                    engine.emit(EngineEvent::Stop);
                }
            }
            TransportMessage::Tick(at) => {
                if self.state == FollowerState::Idle {
                    return;
                }
                if let Some(bpm) = self.estimator.record(at) {
                    engine.apply_external_bpm(bpm);
                }
                engine.advance_pulse();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;

    use crate::midi_io::CollectingDriver;

    fn test_engine() -> Engine {
        Engine::new(Box::new(CollectingDriver::new()), 100.0).unwrap()
    }

    fn follower() -> ClockFollower {
        let (_tx, rx) = channel::unbounded();
        ClockFollower::new(rx)
    }

    /// Synthetic tick times at an exact BPM.
    fn ticks_at(bpm: f64, count: usize) -> Vec<Instant> {
        let interval = Duration::from_secs_f64(60.0 / (bpm * PPQN as f64));
        let base = Instant::now();
        (0..count).map(|i| base + interval * i as u32).collect()
    }

    #[test]
    fn estimator_converges_on_steady_clock() {
        let mut estimator = BpmEstimator::new();
        let mut last = None;
        for at in ticks_at(120.0, 48) {
            last = estimator.record(at);
        }
        let bpm = last.expect("48 ticks is enough for an estimate");
        assert!((bpm - 120.0).abs() < 1.0, "estimated {bpm}");
    }

    #[test]
    fn estimator_needs_a_full_averaging_window() {
        let mut estimator = BpmEstimator::new();
        for at in ticks_at(120.0, AVERAGE_INTERVALS) {
            assert!(estimator.record(at).is_none());
        }
    }

    #[test]
    fn idle_ticks_are_discarded() {
        let mut engine = test_engine();
        let mut f = follower();

        f.handle(&mut engine, TransportMessage::Tick(Instant::now()));
        f.handle(&mut engine, TransportMessage::Tick(Instant::now()));
        assert_eq!(engine.pulse(), 0);
        assert_eq!(f.state(), FollowerState::Idle);
    }

    #[test]
    fn start_runs_and_ticks_advance() {
        let mut engine = test_engine();
        let mut f = follower();

        f.handle(&mut engine, TransportMessage::Start);
        assert_eq!(f.state(), FollowerState::Running);
        for _ in 0..5 {
            f.handle(&mut engine, TransportMessage::Tick(Instant::now()));
        }
        assert_eq!(engine.pulse(), 5);
    }

    #[test]
    fn stop_goes_idle_and_start_resets_the_transport() {
        let mut engine = test_engine();
        let mut f = follower();

        f.handle(&mut engine, TransportMessage::Start);
        for _ in 0..10 {
            f.handle(&mut engine, TransportMessage::Tick(Instant::now()));
        }
        f.handle(&mut engine, TransportMessage::Stop);
        assert_eq!(f.state(), FollowerState::Idle);
        f.handle(&mut engine, TransportMessage::Tick(Instant::now()));
        assert_eq!(engine.pulse(), 10);

        // Continue resumes in place; start rewinds.
        f.handle(&mut engine, TransportMessage::Continue);
        f.handle(&mut engine, TransportMessage::Tick(Instant::now()));
        assert_eq!(engine.pulse(), 11);
        f.handle(&mut engine, TransportMessage::Start);
        assert_eq!(engine.pulse(), 0);
    }

    #[test]
    fn estimate_does_not_span_a_stop_gap() {
        let mut engine = test_engine();
        let mut f = follower();

        f.handle(&mut engine, TransportMessage::Start);
        for at in ticks_at(120.0, 30) {
            f.handle(&mut engine, TransportMessage::Tick(at));
        }
        assert_eq!(engine.tempo().bpm(), 120.0);

        f.handle(&mut engine, TransportMessage::Stop);
        f.handle(&mut engine, TransportMessage::Continue);
        assert_eq!(f.state(), FollowerState::Running);

        // Resume at the same rate after a two-second silence. The window
        // starts over, so no estimate (and no tempo change) can include
        // an interval that spans the gap.
        let interval = Duration::from_secs_f64(60.0 / (120.0 * PPQN as f64));
        let resume = Instant::now() + Duration::from_secs(2);
        for i in 0..AVERAGE_INTERVALS as u32 {
            f.handle(&mut engine, TransportMessage::Tick(resume + interval * i));
        }
        assert_eq!(engine.tempo().bpm(), 120.0);
    }

    #[test]
    fn local_tempo_changes_ignored_while_following() {
        let mut engine = test_engine();
        engine.set_externally_clocked(true);
        engine.set_bpm(140.0).unwrap();
        assert_eq!(engine.tempo().bpm(), 100.0);
    }
}
