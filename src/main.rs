//! ostinato CLI - play generative patterns on a MIDI device.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;

use ostinato::config::ClockSource;
use ostinato::constants::{EIGHTH_NOTE, PULSES_PER_BAR, SIXTEENTH_NOTE};
use ostinato::easing;
use ostinato::emitter::EngineEvent;
use ostinato::midi_io::{MidirOutput, MidirTransportInput};
use ostinato::pattern::{shared, GridPattern, SharedPattern};
use ostinato::sequencer::Sequencer;
use ostinato::Config;

#[derive(Parser)]
#[command(name = "ostinato")]
#[command(about = "Generative MIDI sequencer", long_about = None)]
struct Cli {
    /// Config file (TOML); command-line flags override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List MIDI ports and exit
    List,

    /// Play the built-in demo patterns
    Play {
        /// MIDI output device name (partial match)
        #[arg(short, long)]
        device: Option<String>,

        /// Tempo in BPM
        #[arg(short, long)]
        tempo: Option<f64>,

        /// Bars to play before stopping
        #[arg(short, long, default_value = "8")]
        bars: u64,

        /// Follow an external MIDI clock instead of the internal clock
        #[arg(long)]
        external: bool,

        /// Input device for the external clock (partial match)
        #[arg(long)]
        input_device: Option<String>,

        /// Send MIDI clock to the output
        #[arg(long)]
        clock_out: bool,

        /// Ramp to this tempo over the first four bars
        #[arg(long)]
        ramp_to: Option<f64>,
    },

    /// Write a default config file
    Init {
        #[arg(default_value = "ostinato.toml")]
        path: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::List => {
            println!("MIDI output ports:");
            for name in MidirOutput::list_ports()? {
                println!("  {name}");
            }
            println!("MIDI input ports:");
            for name in MidirTransportInput::list_ports()? {
                println!("  {name}");
            }
        }

        Commands::Init { path } => {
            Config::default().save(&path)?;
            println!("wrote {}", path.display());
        }

        Commands::Play {
            device,
            tempo,
            bars,
            external,
            input_device,
            clock_out,
            ramp_to,
        } => {
            if let Some(tempo) = tempo {
                config.bpm = tempo;
            }
            if device.is_some() {
                config.output.port = device;
            }
            if clock_out {
                config.output.clock_output = true;
            }
            if external {
                config.clock.source = ClockSource::External;
            }
            if input_device.is_some() {
                config.clock.input_port = input_device;
            }

            play(&config, bars, ramp_to)?;
        }
    }
    Ok(())
}

fn play(config: &Config, bars: u64, ramp_to: Option<f64>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let driver = MidirOutput::connect(config.output.port.as_deref())?;

    // Keep the input connection alive for the whole run in external mode.
    let mut _input = None;
    let sequencer = match config.clock.source {
        ClockSource::Internal => Sequencer::internal(Box::new(driver), config)?,
        ClockSource::External => {
            let (tx, rx) = crossbeam::channel::unbounded();
            _input = Some(MidirTransportInput::connect(
                config.clock.input_port.as_deref(),
                tx,
            )?);
            Sequencer::external(Box::new(driver), config, rx)?
        }
    };

    let events = sequencer.subscribe()?;
    for pattern in demo_patterns() {
        sequencer.schedule(pattern)?;
    }
    if let Some(target) = ramp_to {
        sequencer.ramp_bpm(target, 4 * PULSES_PER_BAR, easing::ease_in_out);
    }

    match config.clock.source {
        ClockSource::Internal => {
            info!("playing {bars} bars at {:.1} BPM", config.bpm);
            sequencer.play();
        }
        ClockSource::External => {
            info!("waiting for external clock start; playing {bars} bars");
        }
    }

    loop {
        match events.recv_timeout(Duration::from_secs(1)) {
            Ok(EngineEvent::Bar(bar)) => {
                info!("bar {bar}");
                if bar >= bars {
                    break;
                }
            }
            Ok(EngineEvent::TempoChanged(bpm)) => info!("tempo now {bpm:.1} BPM"),
            Ok(_) => {}
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    sequencer.stop();
    sequencer.shutdown();
    Ok(())
}

/// A small demo: a fixed drum groove plus a bass line that rewrites itself
/// every two beats.
fn demo_patterns() -> Vec<SharedPattern> {
    let mut drums = GridPattern::new(9).with_length(4.0).with_lookahead(1.0);
    let kick = [
        true, false, false, false, false, false, true, false, false, false, false, false, false,
        false, false, false,
    ];
    let hat = [
        false, false, true, false, false, false, true, false, false, false, true, false, false,
        false, true, true,
    ];
    drums.add_sequence(&kick, SIXTEENTH_NOTE, 36, &[112], 3);
    drums.add_sequence(&hat, SIXTEENTH_NOTE, 42, &[70, 55], 2);

    let bass = GridPattern::new(0)
        .with_length(2.0)
        .with_lookahead(0.5)
        .with_rebuild(|p, _cycle| {
            use rand::Rng;
            const SCALE: [u8; 5] = [36, 39, 41, 43, 46];
            let mut rng = rand::thread_rng();
            for slot in 0..4u64 {
                if rng.gen_bool(0.7) {
                    let pitch = SCALE[rng.gen_range(0..SCALE.len())];
                    let velocity = rng.gen_range(70..110);
                    p.add_note(slot * EIGHTH_NOTE, pitch, velocity, EIGHTH_NOTE - 2);
                }
            }
            Ok(())
        });

    vec![shared(drums), shared(bass)]
}
