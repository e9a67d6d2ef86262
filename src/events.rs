//! MIDI messages and their wire encoding.
//!
//! Every hardware-bound event the engine schedules or dispatches is a
//! [`MidiMessage`]. The queue orders same-pulse messages by
//! [`dispatch_priority`](MidiMessage::dispatch_priority) so that note-offs
//! always reach the device before note-ons landing on the same pulse — the
//! retrigger case where the order is audible.

/// A single MIDI message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOn {
        channel: u8,
        note: u8,
        velocity: u8,
    },
    NoteOff {
        channel: u8,
        note: u8,
    },
    ControlChange {
        channel: u8,
        control: u8,
        value: u8,
    },
    /// Pitch bend, signed offset from centre in `-8192..=8191`.
    PitchBend {
        channel: u8,
        value: i16,
    },
    ProgramChange {
        channel: u8,
        program: u8,
    },
    /// Polyphonic key pressure.
    Aftertouch {
        channel: u8,
        note: u8,
        value: u8,
    },
    /// Channel-wide pressure.
    ChannelPressure {
        channel: u8,
        value: u8,
    },
    /// Raw system-exclusive payload, without the framing bytes.
    SysEx {
        data: Vec<u8>,
    },
    // System realtime, used for MIDI clock output.
    Clock,
    Start,
    Stop,
    Continue,
}

impl MidiMessage {
    /// Convert to raw MIDI bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => {
                vec![0x90 | (channel & 0x0F), *note & 0x7F, *velocity & 0x7F]
            }
            MidiMessage::NoteOff { channel, note } => {
                vec![0x80 | (channel & 0x0F), *note & 0x7F, 0]
            }
            MidiMessage::ControlChange {
                channel,
                control,
                value,
            } => {
                vec![0xB0 | (channel & 0x0F), *control & 0x7F, *value & 0x7F]
            }
            MidiMessage::PitchBend { channel, value } => {
                let value = (*value as i32 + 8192).clamp(0, 16383) as u16;
                vec![
                    0xE0 | (channel & 0x0F),
                    (value & 0x7F) as u8,
                    ((value >> 7) & 0x7F) as u8,
                ]
            }
            MidiMessage::ProgramChange { channel, program } => {
                vec![0xC0 | (channel & 0x0F), *program & 0x7F]
            }
            MidiMessage::Aftertouch {
                channel,
                note,
                value,
            } => {
                vec![0xA0 | (channel & 0x0F), *note & 0x7F, *value & 0x7F]
            }
            MidiMessage::ChannelPressure { channel, value } => {
                vec![0xD0 | (channel & 0x0F), *value & 0x7F]
            }
            MidiMessage::SysEx { data } => {
                let mut bytes = vec![0xF0];
                bytes.extend_from_slice(data);
                bytes.push(0xF7);
                bytes
            }
            MidiMessage::Clock => vec![0xF8],
            MidiMessage::Start => vec![0xFA],
            MidiMessage::Continue => vec![0xFB],
            MidiMessage::Stop => vec![0xFC],
        }
    }

    /// Tie-break rank for same-pulse queue ordering.
    ///
    /// Note-offs dispatch first, note-ons last, everything else in between,
    /// so a note retriggered on its own end pulse is released before it is
    /// struck again.
    pub fn dispatch_priority(&self) -> u8 {
        match self {
            MidiMessage::NoteOff { .. } => 0,
            MidiMessage::NoteOn { .. } => 2,
            _ => 1,
        }
    }

    /// True for the single-byte system realtime messages.
    pub fn is_realtime(&self) -> bool {
        matches!(
            self,
            MidiMessage::Clock | MidiMessage::Start | MidiMessage::Stop | MidiMessage::Continue
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_on_encoding() {
        let msg = MidiMessage::NoteOn {
            channel: 9,
            note: 36,
            velocity: 100,
        };
        assert_eq!(msg.to_bytes(), vec![0x99, 36, 100]);
    }

    #[test]
    fn note_off_encoding() {
        let msg = MidiMessage::NoteOff {
            channel: 0,
            note: 60,
        };
        assert_eq!(msg.to_bytes(), vec![0x80, 60, 0]);
    }

    #[test]
    fn pitch_bend_centre_and_extremes() {
        let centre = MidiMessage::PitchBend {
            channel: 0,
            value: 0,
        };
        assert_eq!(centre.to_bytes(), vec![0xE0, 0x00, 0x40]);

        let max = MidiMessage::PitchBend {
            channel: 0,
            value: 8191,
        };
        assert_eq!(max.to_bytes(), vec![0xE0, 0x7F, 0x7F]);

        let min = MidiMessage::PitchBend {
            channel: 0,
            value: -8192,
        };
        assert_eq!(min.to_bytes(), vec![0xE0, 0x00, 0x00]);
    }

    #[test]
    fn pressure_encodings() {
        let poly = MidiMessage::Aftertouch {
            channel: 2,
            note: 60,
            value: 80,
        };
        assert_eq!(poly.to_bytes(), vec![0xA2, 60, 80]);

        let channel = MidiMessage::ChannelPressure {
            channel: 2,
            value: 80,
        };
        assert_eq!(channel.to_bytes(), vec![0xD2, 80]);
    }

    #[test]
    fn sysex_is_framed() {
        let msg = MidiMessage::SysEx {
            data: vec![0x7E, 0x09, 0x01],
        };
        assert_eq!(msg.to_bytes(), vec![0xF0, 0x7E, 0x09, 0x01, 0xF7]);
    }

    #[test]
    fn realtime_encoding() {
        assert_eq!(MidiMessage::Clock.to_bytes(), vec![0xF8]);
        assert_eq!(MidiMessage::Start.to_bytes(), vec![0xFA]);
        assert_eq!(MidiMessage::Continue.to_bytes(), vec![0xFB]);
        assert_eq!(MidiMessage::Stop.to_bytes(), vec![0xFC]);
    }

    #[test]
    fn offs_rank_before_ons() {
        let off = MidiMessage::NoteOff {
            channel: 0,
            note: 60,
        };
        let on = MidiMessage::NoteOn {
            channel: 0,
            note: 60,
            velocity: 90,
        };
        let cc = MidiMessage::ControlChange {
            channel: 0,
            control: 74,
            value: 64,
        };
        assert!(off.dispatch_priority() < cc.dispatch_priority());
        assert!(cc.dispatch_priority() < on.dispatch_priority());
    }
}
