//! The thread-owning facade around the engine.
//!
//! [`Sequencer`] spawns one thread that owns the [`Engine`] and its clock;
//! callers talk to it over a command channel that the clock loop drains
//! once per pulse. Commands that need an answer carry a one-shot reply
//! channel and block the caller until the loop services them, which also
//! means every mutation lands on a pulse boundary.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{info, warn};

use crate::clock::{ClockControl, PulseClock};
use crate::config::Config;
use crate::easing::EasingFn;
use crate::emitter::EngineEvent;
use crate::engine::{CallbackFn, CallbackId, Engine, PatternId, TimingStats};
use crate::error::{RegenError, SchedulerError};
use crate::events::MidiMessage;
use crate::follower::{ClockFollower, TransportMessage};
use crate::midi_io::OutputDriver;
use crate::pattern::SharedPattern;

enum Command {
    Play,
    Stop,
    Shutdown,
    SetBpm(f64),
    RampBpm {
        target_bpm: f64,
        span_pulses: u64,
        easing: EasingFn,
    },
    Schedule {
        pattern: SharedPattern,
        start_pulse: Option<u64>,
        reply: Sender<Result<PatternId, SchedulerError>>,
    },
    Unschedule(PatternId),
    ScheduleCallback {
        interval_pulses: u64,
        lookahead_pulses: u64,
        callback: CallbackFn,
        reply: Sender<Result<CallbackId, SchedulerError>>,
    },
    ScheduleCallbackOnce {
        at_pulse: u64,
        callback: Box<dyn FnMut() -> Result<(), RegenError> + Send>,
        reply: Sender<CallbackId>,
    },
    UnscheduleCallback(CallbackId),
    Panic,
    Sync(Sender<()>),
    Subscribe(Sender<Receiver<EngineEvent>>),
    Stats(Sender<TimingStats>),
}

enum ClockMode {
    Internal { clock: PulseClock, auto_stop: bool },
    External { transport: Receiver<TransportMessage> },
}

/// Handle to a running sequencer thread. Dropping it shuts the thread
/// down after a final flush.
pub struct Sequencer {
    tx: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl Sequencer {
    /// Run on the internal clock.
    pub fn internal(driver: Box<dyn OutputDriver>, config: &Config) -> Result<Self, SchedulerError> {
        let spin = if config.clock.spin_wait {
            Some(Duration::from_millis(1))
        } else {
            None
        };
        let mode = ClockMode::Internal {
            clock: PulseClock::new().with_spin_threshold(spin),
            auto_stop: config.transport.auto_stop,
        };
        Self::spawn(driver, config, mode)
    }

    /// Follow an external clock delivered on `transport`, typically from
    /// [`MidirTransportInput`](crate::midi_io::MidirTransportInput).
    pub fn external(
        driver: Box<dyn OutputDriver>,
        config: &Config,
        transport: Receiver<TransportMessage>,
    ) -> Result<Self, SchedulerError> {
        Self::spawn(driver, config, ClockMode::External { transport })
    }

    fn spawn(
        driver: Box<dyn OutputDriver>,
        config: &Config,
        mode: ClockMode,
    ) -> Result<Self, SchedulerError> {
        let mut engine = Engine::new(driver, config.bpm)?;
        engine.set_clock_output(config.output.clock_output);
        let clock_output = config.output.clock_output;

        let (tx, rx) = channel::unbounded();
        let thread = thread::Builder::new()
            .name("sequencer".to_string())
            .spawn(move || run_thread(engine, mode, rx, clock_output))
            .map_err(|_| SchedulerError::NotRunning)?;

        Ok(Self {
            tx,
            thread: Some(thread),
        })
    }

    /// Start (or resume) playback. A no-op while following an external
    /// clock, whose transport is authoritative.
    pub fn play(&self) {
        self.send(Command::Play);
    }

    /// Stop playback: silence the output and flush pending events, keeping
    /// the schedule for a later [`play`](Self::play).
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    pub fn set_bpm(&self, bpm: f64) {
        self.send(Command::SetBpm(bpm));
    }

    /// Ramp the tempo over `span_pulses` with the given easing curve.
    pub fn ramp_bpm(&self, target_bpm: f64, span_pulses: u64, easing: EasingFn) {
        self.send(Command::RampBpm {
            target_bpm,
            span_pulses,
            easing,
        });
    }

    /// Schedule a repeating pattern starting at the current pulse.
    pub fn schedule(&self, pattern: SharedPattern) -> Result<PatternId, SchedulerError> {
        self.request(|reply| Command::Schedule {
            pattern,
            start_pulse: None,
            reply,
        })?
    }

    /// Schedule a repeating pattern starting at an absolute pulse.
    pub fn schedule_at(
        &self,
        pattern: SharedPattern,
        start_pulse: u64,
    ) -> Result<PatternId, SchedulerError> {
        self.request(|reply| Command::Schedule {
            pattern,
            start_pulse: Some(start_pulse),
            reply,
        })?
    }

    pub fn unschedule(&self, id: PatternId) {
        self.send(Command::Unschedule(id));
    }

    /// Schedule a repeating callback; see
    /// [`Engine::schedule_callback_repeating`] for the backshift rule.
    pub fn schedule_callback(
        &self,
        interval_pulses: u64,
        lookahead_pulses: u64,
        callback: impl FnMut() -> Result<(), RegenError> + Send + 'static,
    ) -> Result<CallbackId, SchedulerError> {
        self.request(|reply| Command::ScheduleCallback {
            interval_pulses,
            lookahead_pulses,
            callback: CallbackFn::ContextFree(Box::new(callback)),
            reply,
        })?
    }

    /// Context-aware variant of [`schedule_callback`](Self::schedule_callback).
    pub fn schedule_callback_with_context(
        &self,
        interval_pulses: u64,
        lookahead_pulses: u64,
        callback: impl FnMut(crate::engine::CallbackContext) -> Result<(), RegenError> + Send + 'static,
    ) -> Result<CallbackId, SchedulerError> {
        self.request(|reply| Command::ScheduleCallback {
            interval_pulses,
            lookahead_pulses,
            callback: CallbackFn::ContextAware(Box::new(callback)),
            reply,
        })?
    }

    pub fn schedule_callback_once(
        &self,
        at_pulse: u64,
        callback: impl FnMut() -> Result<(), RegenError> + Send + 'static,
    ) -> Result<CallbackId, SchedulerError> {
        self.request(|reply| Command::ScheduleCallbackOnce {
            at_pulse,
            callback: Box::new(callback),
            reply,
        })
    }

    pub fn unschedule_callback(&self, id: CallbackId) {
        self.send(Command::UnscheduleCallback(id));
    }

    /// Immediate all-notes-off without stopping the transport.
    pub fn panic(&self) {
        self.send(Command::Panic);
    }

    /// Block until the loop has processed all prior commands and every
    /// in-flight pattern regeneration has been integrated.
    pub fn sync(&self) -> Result<(), SchedulerError> {
        self.request(Command::Sync)
    }

    /// Open a channel receiving every engine event.
    pub fn subscribe(&self) -> Result<Receiver<EngineEvent>, SchedulerError> {
        self.request(Command::Subscribe)
    }

    pub fn stats(&self) -> Result<TimingStats, SchedulerError> {
        self.request(Command::Stats)
    }

    /// Stop the thread and wait for it to flush and exit.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            warn!("sequencer thread is gone; command dropped");
        }
    }

    fn request<T>(
        &self,
        build: impl FnOnce(Sender<T>) -> Command,
    ) -> Result<T, SchedulerError> {
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.tx
            .send(build(reply_tx))
            .map_err(|_| SchedulerError::NotRunning)?;
        reply_rx.recv().map_err(|_| SchedulerError::NotRunning)
    }
}

impl Drop for Sequencer {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown_inner();
        }
    }
}

fn run_thread(mut engine: Engine, mode: ClockMode, rx: Receiver<Command>, clock_output: bool) {
    match mode {
        ClockMode::Internal { clock, auto_stop } => {
            internal_loop(&mut engine, &clock, &rx, auto_stop, clock_output)
        }
        ClockMode::External { transport } => {
            let mut follower = ClockFollower::new(transport);
            let mut shutdown = false;
            follower.run(&mut engine, |engine| {
                drain_commands(engine, &rx, &mut true, &mut shutdown, true);
                if shutdown {
                    ClockControl::Stop
                } else {
                    ClockControl::Continue
                }
            });
            engine.stop_flush();
        }
    }
    engine.sync_regenerations();
    engine.close_driver();
    info!("sequencer thread exiting");
}

fn internal_loop(
    engine: &mut Engine,
    clock: &PulseClock,
    rx: &Receiver<Command>,
    auto_stop: bool,
    clock_output: bool,
) {
    let mut playing = false;
    let mut shutdown = false;
    let mut has_played = false;

    while !shutdown {
        if playing {
            engine.emit(EngineEvent::Start);
            if clock_output {
                // Downstream followers distinguish a fresh start from a
                // resume.
                let message = if has_played {
                    MidiMessage::Continue
                } else {
                    MidiMessage::Start
                };
                engine.send_transport(message);
            }
            has_played = true;

            clock.run(engine, |engine| {
                drain_commands(engine, rx, &mut playing, &mut shutdown, false);
                if shutdown || !playing {
                    return ClockControl::Stop;
                }
                if auto_stop && engine.is_idle() {
                    info!("nothing left to play; stopping");
                    playing = false;
                    return ClockControl::Stop;
                }
                ClockControl::Continue
            });

            if clock_output {
                engine.send_transport(MidiMessage::Stop);
            }
            engine.stop_flush();
            engine.emit(EngineEvent::Stop);
        } else {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(command) => apply(engine, command, &mut playing, &mut shutdown, false),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}

fn drain_commands(
    engine: &mut Engine,
    rx: &Receiver<Command>,
    playing: &mut bool,
    shutdown: &mut bool,
    external: bool,
) {
    while let Ok(command) = rx.try_recv() {
        apply(engine, command, playing, shutdown, external);
    }
}

fn apply(
    engine: &mut Engine,
    command: Command,
    playing: &mut bool,
    shutdown: &mut bool,
    external: bool,
) {
    match command {
        Command::Play => {
            if external {
                warn!("play ignored; transport is driven by the external clock");
            } else {
                *playing = true;
            }
        }
        Command::Stop => {
            if external {
                warn!("stop ignored; transport is driven by the external clock");
            } else {
                *playing = false;
            }
        }
        Command::Shutdown => *shutdown = true,
        Command::SetBpm(bpm) => {
            if let Err(e) = engine.set_bpm(bpm) {
                warn!("rejected tempo change: {e}");
            }
        }
        Command::RampBpm {
            target_bpm,
            span_pulses,
            easing,
        } => {
            if let Err(e) = engine.set_target_bpm(target_bpm, span_pulses, easing) {
                warn!("rejected tempo ramp: {e}");
            }
        }
        Command::Schedule {
            pattern,
            start_pulse,
            reply,
        } => {
            let start = start_pulse.unwrap_or_else(|| engine.pulse());
            let _ = reply.send(engine.schedule_pattern_repeating(pattern, start));
        }
        Command::Unschedule(id) => {
            engine.unschedule(id);
        }
        Command::ScheduleCallback {
            interval_pulses,
            lookahead_pulses,
            callback,
            reply,
        } => {
            let result = match callback {
                CallbackFn::ContextFree(f) => {
                    engine.schedule_callback_repeating(interval_pulses, lookahead_pulses, f)
                }
                CallbackFn::ContextAware(f) => engine.schedule_callback_repeating_with_context(
                    interval_pulses,
                    lookahead_pulses,
                    f,
                ),
            };
            let _ = reply.send(result);
        }
        Command::ScheduleCallbackOnce {
            at_pulse,
            callback,
            reply,
        } => {
            let _ = reply.send(engine.schedule_callback_once(at_pulse, callback));
        }
        Command::UnscheduleCallback(id) => {
            engine.unschedule_callback(id);
        }
        Command::Panic => engine.panic(),
        Command::Sync(reply) => {
            engine.sync_regenerations();
            let _ = reply.send(());
        }
        Command::Subscribe(reply) => {
            let _ = reply.send(engine.emitter_mut().subscribe());
        }
        Command::Stats(reply) => {
            let _ = reply.send(engine.stats());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi_io::CollectingDriver;
    use crate::pattern::{shared, GridPattern};

    fn fast_config() -> Config {
        let mut config = Config::default();
        // Keep wall-clock time per pulse short in tests.
        config.bpm = 960.0;
        config
    }

    #[test]
    fn schedule_before_play_then_hear_notes() {
        let driver = CollectingDriver::new();
        let sequencer = Sequencer::internal(Box::new(driver.clone()), &fast_config()).unwrap();

        let pattern = shared({
            let mut p = GridPattern::new(0).with_length(1.0).with_lookahead(0.5);
            p.add_note(0, 60, 100, 6);
            p
        });
        sequencer.schedule(pattern).unwrap();
        sequencer.play();

        // 1 beat at 960 BPM is 62.5 ms; wait long enough for a few cycles.
        thread::sleep(Duration::from_millis(300));
        sequencer.stop();
        sequencer.sync().unwrap();

        let ons = driver
            .sent()
            .iter()
            .filter(|m| matches!(m, MidiMessage::NoteOn { note: 60, .. }))
            .count();
        assert!(ons >= 2, "expected repeated cycles, saw {ons} note-ons");
        sequencer.shutdown();
    }

    #[test]
    fn subscribe_sees_start_and_stop() {
        let driver = CollectingDriver::new();
        let sequencer = Sequencer::internal(Box::new(driver), &fast_config()).unwrap();
        let events = sequencer.subscribe().unwrap();

        sequencer.play();
        thread::sleep(Duration::from_millis(50));
        sequencer.stop();
        thread::sleep(Duration::from_millis(50));
        sequencer.shutdown();

        let seen: Vec<EngineEvent> = events.try_iter().collect();
        assert!(seen.contains(&EngineEvent::Start));
        assert!(seen.contains(&EngineEvent::Stop));
    }

    #[test]
    fn stats_replies_while_stopped() {
        let driver = CollectingDriver::new();
        let sequencer = Sequencer::internal(Box::new(driver), &fast_config()).unwrap();
        let stats = sequencer.stats().unwrap();
        assert_eq!(stats.pulses, 0);
        sequencer.shutdown();
    }
}
