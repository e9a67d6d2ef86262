//! Observability events and their emitter.
//!
//! The engine announces bar and beat boundaries, pattern reschedules, and
//! tempo changes through an [`EventEmitter`]. Listeners are synchronous and
//! fallible — a failing listener is logged and never propagated into the
//! clock loop. Asynchronous consumers (displays, network bridges) take a
//! channel subscription instead and drain it on their own thread.

use std::collections::HashMap;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::warn;

use crate::engine::PatternId;
use crate::error::DriverError;

/// A named engine event.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Playback started.
    Start,
    /// Playback stopped.
    Stop,
    /// A new bar began (bar index, from 0).
    Bar(u64),
    /// A new beat began (beat index within the bar, 0..4).
    Beat(u64),
    /// A pattern is about to regenerate for its next cycle.
    Reschedule { pulse: u64, pattern: PatternId },
    /// The effective tempo changed.
    TempoChanged(f64),
}

/// The event families a listener can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Start,
    Stop,
    Bar,
    Beat,
    Reschedule,
    TempoChanged,
}

impl EngineEvent {
    pub fn topic(&self) -> Topic {
        match self {
            EngineEvent::Start => Topic::Start,
            EngineEvent::Stop => Topic::Stop,
            EngineEvent::Bar(_) => Topic::Bar,
            EngineEvent::Beat(_) => Topic::Beat,
            EngineEvent::Reschedule { .. } => Topic::Reschedule,
            EngineEvent::TempoChanged(_) => Topic::TempoChanged,
        }
    }
}

type Listener = Box<dyn FnMut(&EngineEvent) -> Result<(), DriverError> + Send>;

/// Registry of listeners and channel subscribers.
#[derive(Default)]
pub struct EventEmitter {
    listeners: HashMap<Topic, Vec<Listener>>,
    subscribers: Vec<Sender<EngineEvent>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous listener for one topic.
    pub fn on(
        &mut self,
        topic: Topic,
        listener: impl FnMut(&EngineEvent) -> Result<(), DriverError> + Send + 'static,
    ) {
        self.listeners
            .entry(topic)
            .or_default()
            .push(Box::new(listener));
    }

    /// Open a channel that receives every event. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&mut self) -> Receiver<EngineEvent> {
        let (tx, rx) = channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Deliver an event to topic listeners and all subscribers.
    pub fn emit(&mut self, event: EngineEvent) {
        if let Some(listeners) = self.listeners.get_mut(&event.topic()) {
            for listener in listeners.iter_mut() {
                if let Err(e) = listener(&event) {
                    warn!("event listener failed for {:?}: {e}", event.topic());
                }
            }
        }
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
