use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use super::{EncoderSession, SessionOutput, SessionOutputReceiver};
use crate::{
    config::{BitrateMode, CodecConfig, DEFAULT_QUANTIZER, RateControl},
    error::ExportError,
    frame::{Frame, PixelFormat},
    synthetic::SyntheticProbe,
};

fn config() -> CodecConfig {
    CodecConfig {
        width: 32,
        height: 16,
        frame_rate: 30.0,
        bitrate: 500_000,
        ..Default::default()
    }
}

fn frame(timestamp: i64) -> Frame {
    Frame::new(vec![3u8; 32 * 16 * 4], 32, 16, PixelFormat::Rgba, timestamp)
}

fn session(probe: &SyntheticProbe) -> (EncoderSession, SessionOutputReceiver) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (EncoderSession::new(probe.factory(), tx), rx)
}

/// Feeds worker outputs back into the session until the flush marker shows up.
async fn pump_until_flushed(
    session: &mut EncoderSession,
    rx: &mut SessionOutputReceiver,
    ticket: u64,
) -> Vec<SessionOutput> {
    let mut others = Vec::new();
    while let Some(output) = rx.recv().await {
        match output {
            SessionOutput::Chunk { output, .. } => session.chunk_received(output).unwrap(),
            SessionOutput::Flushed { ticket: t, .. } if t == ticket => break,
            other => others.push(other),
        }
    }
    others
}

#[tokio::test]
async fn test_encode_before_configure() {
    let probe = SyntheticProbe::new();
    let (mut session, _rx) = session(&probe);
    let released = Arc::new(AtomicBool::new(false));
    let flag = released.clone();

    let err = session
        .encode(frame(0).on_release(move || flag.store(true, Ordering::SeqCst)), None)
        .unwrap_err();
    assert!(matches!(err, ExportError::Sequence(_)));
    assert!(released.load(Ordering::SeqCst));
    assert!(matches!(session.flush(0), Err(ExportError::Sequence(_))));
}

#[tokio::test]
async fn test_configure_twice() {
    let probe = SyntheticProbe::new();
    let (mut session, _rx) = session(&probe);
    session.configure(config()).unwrap();
    assert!(matches!(
        session.configure(config()),
        Err(ExportError::Config(_))
    ));
    assert_eq!(session.config(), Some(&config()));
}

#[tokio::test]
async fn test_configure_validates() {
    let probe = SyntheticProbe::new();
    let (mut session, _rx) = session(&probe);
    let bad = CodecConfig {
        frame_rate: -1.0,
        ..config()
    };
    assert!(matches!(session.configure(bad), Err(ExportError::Config(_))));
    assert!(!session.is_configured());
}

#[tokio::test]
async fn test_flush_delivers_every_chunk_in_order() {
    let probe = SyntheticProbe::new();
    let (mut session, mut rx) = session(&probe);
    session.configure(config()).unwrap();

    for i in 0..5 {
        session.encode(frame(i * 33_333), None).unwrap();
    }
    session.flush(7).unwrap();
    let others = pump_until_flushed(&mut session, &mut rx, 7).await;
    assert!(others.is_empty());

    let output = session.output();
    assert_eq!(output.chunks.len(), 5);
    assert_eq!(
        output.chunks.iter().map(|c| c.timestamp).collect::<Vec<_>>(),
        vec![0, 33_333, 66_666, 99_999, 133_332]
    );
    assert_eq!(
        output.buffer.len(),
        output.chunks.iter().map(|c| c.size).sum::<usize>()
    );
    assert!(output.descriptor.is_some());
    assert_eq!(probe.resets(), 1);
}

#[tokio::test]
async fn test_quantizer_path() {
    let probe = SyntheticProbe::new();
    let (mut session, mut rx) = session(&probe);
    session
        .configure(CodecConfig {
            bitrate_mode: BitrateMode::Quantizer,
            ..config()
        })
        .unwrap();

    session.encode(frame(0), Some(DEFAULT_QUANTIZER)).unwrap();
    session.encode(frame(1), None).unwrap();
    session.flush(1).unwrap();
    pump_until_flushed(&mut session, &mut rx, 1).await;

    assert_eq!(
        probe.controls(),
        vec![
            RateControl::Quantizer(DEFAULT_QUANTIZER),
            RateControl::Quantizer(DEFAULT_QUANTIZER)
        ]
    );
}

#[tokio::test]
async fn test_constant_mode_ignores_hint() {
    let probe = SyntheticProbe::new();
    let (mut session, mut rx) = session(&probe);
    session.configure(config()).unwrap();

    session.encode(frame(0), Some(35)).unwrap();
    session.flush(1).unwrap();
    pump_until_flushed(&mut session, &mut rx, 1).await;

    assert_eq!(probe.controls(), vec![RateControl::Bitrate(500_000)]);
}

#[tokio::test]
async fn test_rejected_frame_is_reported_and_session_continues() {
    let probe = SyntheticProbe::new().reject_frame(1);
    let (mut session, mut rx) = session(&probe);
    session.configure(config()).unwrap();

    for i in 0..3 {
        session.encode(frame(i), None).unwrap();
    }
    session.flush(1).unwrap();
    let others = pump_until_flushed(&mut session, &mut rx, 1).await;

    assert_eq!(others.len(), 1);
    assert!(matches!(
        &others[0],
        SessionOutput::Dropped {
            error: ExportError::Encode(_),
            retired: 1
        }
    ));
    let timestamps: Vec<_> = session.store().metadata().iter().map(|m| m.timestamp).collect();
    assert_eq!(timestamps, vec![0, 2]);
}

#[tokio::test]
async fn test_fatal_backend_error_stops_worker() {
    let probe = SyntheticProbe::new().fail_at(0);
    let (mut session, mut rx) = session(&probe);
    session.configure(config()).unwrap();
    session.encode(frame(0), None).unwrap();

    match rx.recv().await {
        Some(SessionOutput::Dead { error }) => {
            assert!(matches!(error, ExportError::SessionDead(_)))
        }
        other => panic!("expected dead worker, got {:?}", other),
    }
}

#[tokio::test]
async fn test_size_mismatch_is_validation_error() {
    let probe = SyntheticProbe::new();
    let (mut session, _rx) = session(&probe);
    let mut chunk = crate::chunk::EncodedChunk::new(vec![1, 2], 0, 0, true);
    chunk.size = 3;
    let err = session
        .chunk_received(crate::backend::BackendOutput {
            chunk,
            descriptor: None,
        })
        .unwrap_err();
    assert!(matches!(err, ExportError::Validation(_)));
}
