//! Offline end-to-end demo: synthesize a tone sweep, stretch it to 80%
//! tempo, and drive playback against a software sink while printing
//! progress. Run with `cargo run --example offline_stretch`.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use stretchkit_engine::{
    BufferSink, EngineEvent, EnginePhase, SharedBufferSink, SourceBuffer, StretchEngine, Tunables,
};
use stretchkit_foundation::ManualAudioClock;

fn tone_sweep(seconds: f64, sample_rate: u32) -> SourceBuffer {
    let len = (seconds * sample_rate as f64) as usize;
    let mut phase = 0.0f64;
    let samples = (0..len)
        .map(|n| {
            let t = n as f64 / len as f64;
            let freq = 220.0 + 660.0 * t;
            phase += 2.0 * std::f64::consts::PI * freq / sample_rate as f64;
            (0.4 * phase.sin()) as f32
        })
        .collect();
    SourceBuffer::new(vec![samples], sample_rate).expect("valid source")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let sample_rate = 22_050;
    let source = tone_sweep(30.0, sample_rate);
    let duration = source.duration_sec();

    let clock = Arc::new(ManualAudioClock::new());
    let sink: SharedBufferSink = Arc::new(Mutex::new(BufferSink::new(clock.clone())));

    let engine = StretchEngine::builder(source)
        .with_tempo(0.8)
        .with_tunables(Tunables {
            chunk_duration_sec: 4.0,
            ..Tunables::default()
        })
        .with_audio_clock(clock.clone())
        .with_sink(Box::new(sink.clone()))
        .build()?;

    engine.subscribe(|event| match event {
        EngineEvent::Buffering { reason } => println!("buffering ({:?})", reason),
        EngineEvent::Buffered { stall_ms } => println!("resumed after {}ms stall", stall_ms),
        EngineEvent::ChunkReady { index } => println!("chunk {} ready", index),
        EngineEvent::Complete => println!("conversion complete"),
        EngineEvent::Ended => println!("playback ended"),
        EngineEvent::Error { message, .. } => eprintln!("engine error: {}", message),
        _ => {}
    });

    engine.start();

    // Advance the audio clock in slices until playback runs off the end,
    // printing the position map as it goes.
    let mut last_report = -1.0f64;
    while engine.phase() != EnginePhase::Ended {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if engine.phase() == EnginePhase::Playing {
            clock.advance(0.25);
        }
        let position = engine.get_current_position();
        if position - last_report >= 5.0 {
            last_report = position;
            let status = engine.get_status();
            println!(
                "position {:6.2}s / {:.0}s  tempo {:.2}  buffer {:?} ({:.1}s ahead)  eta {:.0}ms",
                position,
                duration,
                status.playback.tempo,
                status.buffer.health,
                status.buffer.ahead_seconds,
                engine.estimated_remaining_ms(),
            );
        }
    }

    let metrics = engine.metrics();
    println!(
        "done: {} conversions, {} evictions, {} underruns",
        metrics.conversions_completed, metrics.evictions, metrics.underruns
    );
    engine.dispose();
    engine.join().await;
    Ok(())
}
