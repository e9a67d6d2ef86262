use criterion::{black_box, criterion_group, criterion_main, Criterion};

use ostinato::engine::Engine;
use ostinato::event_queue::EventQueue;
use ostinato::events::MidiMessage;
use ostinato::midi_io::CollectingDriver;
use ostinato::pattern::{shared, GridPattern};

fn bench_event_queue(c: &mut Criterion) {
    c.bench_function("queue push/pop 1k events", |b| {
        b.iter(|| {
            let mut queue = EventQueue::new();
            for i in 0..1000u64 {
                queue.push(
                    i % 96,
                    MidiMessage::NoteOn {
                        channel: 0,
                        note: (i % 128) as u8,
                        velocity: 100,
                    },
                    None,
                );
            }
            black_box(queue.pop_due(96).len())
        })
    });
}

fn bench_advance(c: &mut Criterion) {
    c.bench_function("advance one bar, four dense patterns", |b| {
        b.iter(|| {
            let mut engine = Engine::new(Box::new(CollectingDriver::new()), 120.0).unwrap();
            for channel in 0..4 {
                let mut pattern = GridPattern::new(channel).with_length(4.0).with_lookahead(1.0);
                for step in 0..16u64 {
                    pattern.add_note(step * 6, 36 + channel, 100, 5);
                }
                engine.schedule_pattern_repeating(shared(pattern), 0).unwrap();
            }
            for _ in 0..96 {
                engine.advance_pulse();
            }
            engine.sync_regenerations();
            black_box(engine.pulse())
        })
    });
}

criterion_group!(benches, bench_event_queue, bench_advance);
criterion_main!(benches);
