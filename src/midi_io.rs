//! MIDI device I/O.
//!
//! The engine talks to an [`OutputDriver`], not to midir directly, so tests
//! and offline rendering can swap in a [`CollectingDriver`]. The real
//! implementations wrap midir: [`MidirOutput`] for sending, and
//! [`MidirTransportInput`] for bridging an external clock's realtime
//! messages onto a channel the follower drains.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam::channel::Sender;
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use tracing::info;

use crate::error::DriverError;
use crate::events::MidiMessage;
use crate::follower::TransportMessage;

const CLIENT_NAME: &str = "ostinato";

/// Where dispatched MIDI bytes go.
pub trait OutputDriver: Send {
    fn send(&mut self, message: &MidiMessage) -> Result<(), DriverError>;

    /// Driver-specific silencing, called after the engine's own panic
    /// messages. Most drivers need nothing extra.
    fn panic(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    /// Release the port. Called once when the owning thread exits; sends
    /// after close are an error.
    fn close(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn name(&self) -> &str;
}

/// A real MIDI output port.
pub struct MidirOutput {
    connection: Option<MidiOutputConnection>,
    port_name: String,
}

impl MidirOutput {
    /// Names of the available output ports.
    pub fn list_ports() -> Result<Vec<String>, DriverError> {
        let output = MidiOutput::new(CLIENT_NAME).map_err(|e| format!("MIDI init failed: {e}"))?;
        Ok(output
            .ports()
            .iter()
            .map(|p| {
                output
                    .port_name(p)
                    .unwrap_or_else(|_| "<unknown>".to_string())
            })
            .collect())
    }

    /// Connect to the first port whose name contains `port_hint`
    /// (case-insensitive), or to the first available port when no hint is
    /// given.
    pub fn connect(port_hint: Option<&str>) -> Result<Self, DriverError> {
        let output = MidiOutput::new(CLIENT_NAME).map_err(|e| format!("MIDI init failed: {e}"))?;
        let ports = output.ports();
        if ports.is_empty() {
            return Err("no MIDI output ports available".into());
        }
        let port = match port_hint {
            Some(hint) => {
                let needle = hint.to_lowercase();
                ports
                    .iter()
                    .find(|p| {
                        output
                            .port_name(p)
                            .map(|name| name.to_lowercase().contains(&needle))
                            .unwrap_or(false)
                    })
                    .ok_or_else(|| format!("no MIDI output port matching '{hint}'"))?
            }
            None => &ports[0],
        };
        let port_name = output
            .port_name(port)
            .map_err(|e| format!("port name lookup failed: {e}"))?;
        info!("connecting MIDI output to '{port_name}'");
        let connection = output
            .connect(port, "ostinato-out")
            .map_err(|e| format!("failed to connect to '{port_name}': {e}"))?;
        Ok(Self {
            connection: Some(connection),
            port_name,
        })
    }
}

impl OutputDriver for MidirOutput {
    fn send(&mut self, message: &MidiMessage) -> Result<(), DriverError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| format!("'{}' is closed", self.port_name))?;
        connection
            .send(&message.to_bytes())
            .map_err(|e| format!("send to '{}' failed: {e}", self.port_name))?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if let Some(connection) = self.connection.take() {
            info!("closing MIDI output '{}'", self.port_name);
            connection.close();
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.port_name
    }
}

#[derive(Default)]
struct Collected {
    sent: Vec<MidiMessage>,
    panicked: bool,
}

/// An [`OutputDriver`] that records instead of sending.
///
/// Cloneable so a test can keep one handle while the engine owns the other.
/// Also backs offline rendering, where the recorded messages are the
/// product.
#[derive(Clone, Default)]
pub struct CollectingDriver {
    inner: Arc<Mutex<Collected>>,
}

impl CollectingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far, in dispatch order.
    pub fn sent(&self) -> Vec<MidiMessage> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().sent.clear();
    }

    pub fn panicked(&self) -> bool {
        self.inner.lock().unwrap().panicked
    }
}

impl OutputDriver for CollectingDriver {
    fn send(&mut self, message: &MidiMessage) -> Result<(), DriverError> {
        self.inner.lock().unwrap().sent.push(message.clone());
        Ok(())
    }

    fn panic(&mut self) -> Result<(), DriverError> {
        self.inner.lock().unwrap().panicked = true;
        Ok(())
    }

    fn name(&self) -> &str {
        "collector"
    }
}

/// A MIDI input port filtered down to transport and clock messages.
///
/// The midir callback runs on the driver's thread; it timestamps clock
/// ticks on arrival and forwards them over the channel, so the follower
/// estimates tempo from arrival times rather than processing times.
pub struct MidirTransportInput {
    // Held only to keep the port open; closing happens on drop.
    _connection: MidiInputConnection<()>,
    port_name: String,
}

impl MidirTransportInput {
    /// Names of the available input ports.
    pub fn list_ports() -> Result<Vec<String>, DriverError> {
        let input = MidiInput::new(CLIENT_NAME).map_err(|e| format!("MIDI init failed: {e}"))?;
        Ok(input
            .ports()
            .iter()
            .map(|p| input.port_name(p).unwrap_or_else(|_| "<unknown>".to_string()))
            .collect())
    }

    /// Connect to an input port (same hint matching as
    /// [`MidirOutput::connect`]) and forward transport messages to `tx`.
    pub fn connect(
        port_hint: Option<&str>,
        tx: Sender<TransportMessage>,
    ) -> Result<Self, DriverError> {
        let mut input = MidiInput::new(CLIENT_NAME).map_err(|e| format!("MIDI init failed: {e}"))?;
        // Keep timing messages; clock ticks are the whole point here.
        input.ignore(Ignore::SysexAndActiveSense);

        let ports = input.ports();
        if ports.is_empty() {
            return Err("no MIDI input ports available".into());
        }
        let port = match port_hint {
            Some(hint) => {
                let needle = hint.to_lowercase();
                ports
                    .iter()
                    .find(|p| {
                        input
                            .port_name(p)
                            .map(|name| name.to_lowercase().contains(&needle))
                            .unwrap_or(false)
                    })
                    .ok_or_else(|| format!("no MIDI input port matching '{hint}'"))?
            }
            None => &ports[0],
        };
        let port_name = input
            .port_name(port)
            .map_err(|e| format!("port name lookup failed: {e}"))?;
        info!("following external clock on '{port_name}'");

        let connection = input
            .connect(
                port,
                "ostinato-in",
                move |_timestamp, bytes, _| {
                    let Some(&status) = bytes.first() else {
                        return;
                    };
                    let message = match status {
                        0xF8 => TransportMessage::Tick(Instant::now()),
                        0xFA => TransportMessage::Start,
                        0xFB => TransportMessage::Continue,
                        0xFC => TransportMessage::Stop,
                        _ => return,
                    };
                    // The follower may already be gone during shutdown.
                    let _ = tx.send(message);
                },
                (),
            )
            .map_err(|e| format!("failed to connect to '{port_name}': {e}"))?;

        Ok(Self {
            _connection: connection,
            port_name,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}
