mod common;

use common::{build_engine, sine_source, test_tunables, wait_until};
use std::time::Duration;

use stretchkit_engine::{EnginePhase, SourceBuffer, StretchEngine};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_length_source_ends_on_start() {
    let source = SourceBuffer::new(vec![Vec::new()], 8_000).unwrap();
    let rig = build_engine(source, test_tunables());
    rig.engine.start();

    assert!(
        wait_until(
            || rig.engine.phase() == EnginePhase::Ended,
            Duration::from_secs(2)
        )
        .await
    );
    let status = rig.engine.get_status();
    assert_eq!(status.conversion.total, 0);
    assert_eq!(status.conversion.converting, 0);

    rig.engine.dispose();
    rig.engine.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn construction_rejects_invalid_inputs() {
    assert!(SourceBuffer::new(Vec::new(), 8_000).is_err());
    assert!(SourceBuffer::new(vec![vec![0.0; 16], vec![0.0; 15]], 8_000).is_err());
    assert!(SourceBuffer::new(vec![vec![0.0; 16]], 0).is_err());

    let bad_tempo = StretchEngine::builder(sine_source(1.0))
        .with_tempo(0.0)
        .build();
    assert!(bad_tempo.is_err());

    let nan_tempo = StretchEngine::builder(sine_source(1.0))
        .with_tempo(f32::NAN)
        .build();
    assert!(nan_tempo.is_err());

    let no_workers = StretchEngine::builder(sine_source(1.0))
        .with_worker_pool_size(0)
        .build();
    assert!(no_workers.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn excessive_offset_is_clamped_to_the_duration() {
    let rig = {
        let clock = std::sync::Arc::new(stretchkit_foundation::ManualAudioClock::new());
        let engine = StretchEngine::builder(sine_source(2.0))
            .with_tunables(test_tunables())
            .with_audio_clock(clock)
            .with_offset(99.0)
            .build()
            .expect("offset clamps instead of failing");
        engine
    };
    // Before start the reported position is the (clamped) start offset.
    assert!(
        wait_until(
            || (rig.get_current_position() - 2.0).abs() < 1e-9,
            Duration::from_secs(2)
        )
        .await
    );
    rig.dispose();
    rig.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispose_is_idempotent_and_queries_keep_answering() {
    let rig = build_engine(sine_source(2.0), test_tunables());
    rig.engine.start();
    assert!(
        wait_until(
            || rig.engine.phase() == EnginePhase::Playing,
            Duration::from_secs(5)
        )
        .await
    );

    rig.engine.dispose();
    rig.engine.dispose();
    rig.engine.join().await;
    assert!(rig.engine.is_disposed());

    // Post-dispose operations are silent no-ops; queries return the last
    // observed state.
    let phase_before = rig.engine.phase();
    rig.engine.seek(1.0);
    rig.engine.set_tempo(2.0);
    rig.engine.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rig.engine.phase(), phase_before);

    let status = rig.engine.get_status();
    assert_eq!(status.playback.duration, 2.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_and_resume_round_trip() {
    let rig = build_engine(sine_source(4.0), test_tunables());
    rig.engine.start();
    assert!(
        wait_until(
            || rig.engine.phase() == EnginePhase::Playing,
            Duration::from_secs(5)
        )
        .await
    );

    rig.clock.advance(0.15);
    rig.engine.pause();
    assert!(
        wait_until(
            || rig.engine.phase() == EnginePhase::Paused,
            Duration::from_secs(2)
        )
        .await
    );
    let paused_at = rig.engine.get_current_position();
    assert!((paused_at - 0.15).abs() < 0.02);

    // The clock marches on; a paused engine does not.
    rig.clock.advance(3.0);
    assert!((rig.engine.get_current_position() - paused_at).abs() < 1e-9);

    rig.engine.resume();
    assert!(
        wait_until(
            || rig.engine.phase() == EnginePhase::Playing,
            Duration::from_secs(2)
        )
        .await
    );
    assert!((rig.engine.get_current_position() - paused_at).abs() < 0.02);

    rig.engine.dispose();
    rig.engine.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshot_exposes_the_active_window() {
    let rig = build_engine(sine_source(4.0), test_tunables());
    rig.engine.start();
    assert!(
        wait_until(
            || rig.engine.phase() == EnginePhase::Playing,
            Duration::from_secs(5)
        )
        .await
    );

    let snapshot = rig.engine.get_snapshot();
    assert_eq!(snapshot.total_chunks, 8);
    assert_eq!(snapshot.current_chunk_index, 0);
    assert_eq!(snapshot.active_window_start, 0);
    assert_eq!(snapshot.active_window_end, 7); // window wider than the source
    assert_eq!(snapshot.chunk_states.len(), 8);
    assert!(!snapshot.buffering);
    assert!(snapshot.conversion_progress > 0.0);

    rig.engine.dispose();
    rig.engine.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loop_flag_is_accepted_but_never_emits() {
    let rig = build_engine(sine_source(2.0), test_tunables());
    rig.engine.start();
    rig.engine.set_loop(true);
    rig.engine.set_loop(false);
    rig.engine.set_loop(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rig
        .events
        .lock()
        .iter()
        .all(|e| e.kind() != stretchkit_engine::EventKind::Loop));

    rig.engine.dispose();
    rig.engine.join().await;
}
