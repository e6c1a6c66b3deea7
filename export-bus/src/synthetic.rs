//! Deterministic encoder backend.
//!
//! Produces avcc-framed pseudo H.264 chunks without touching FFmpeg, so the
//! session machinery can run anywhere. Every decision the backend takes is
//! recorded in a shared [`SyntheticProbe`], which can also inject failures.

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    avcc,
    backend::{BackendFactory, BackendOutput, EncoderBackend},
    chunk::EncodedChunk,
    config::{CodecConfig, RateControl},
    error::{ExportError, Result},
    frame::FrameInput,
};

#[derive(Debug)]
struct ProbeState {
    controls: Vec<RateControl>,
    frames_sent: u64,
    resets: usize,
    reject: HashSet<u64>,
    fail_at: Option<u64>,
    latency: Option<Duration>,
    emit_descriptor: bool,
}

/// Shared view into every synthetic backend built from the same factory.
#[derive(Debug, Clone)]
pub struct SyntheticProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl Default for SyntheticProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticProbe {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ProbeState {
                controls: Vec::new(),
                frames_sent: 0,
                resets: 0,
                reject: HashSet::new(),
                fail_at: None,
                latency: None,
                emit_descriptor: true,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rejects the frame with the given submission index (0-based).
    pub fn reject_frame(self, index: u64) -> Self {
        self.lock().reject.insert(index);
        self
    }

    /// The encoder becomes unusable when the frame with this index arrives.
    pub fn fail_at(self, index: u64) -> Self {
        self.lock().fail_at = Some(index);
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = Some(latency);
        self
    }

    pub fn without_descriptor(self) -> Self {
        self.lock().emit_descriptor = false;
        self
    }

    /// Control path used for each frame, in submission order.
    pub fn controls(&self) -> Vec<RateControl> {
        self.lock().controls.clone()
    }

    pub fn frames_sent(&self) -> u64 {
        self.lock().frames_sent
    }

    pub fn resets(&self) -> usize {
        self.lock().resets
    }

    pub fn factory(&self) -> BackendFactory {
        let probe = self.clone();
        Arc::new(move |config: &CodecConfig| {
            Ok(Box::new(SyntheticBackend::new(config, probe.clone())) as Box<dyn EncoderBackend>)
        })
    }
}

pub struct SyntheticBackend {
    config: CodecConfig,
    probe: SyntheticProbe,
    // frames since the last reset, drives key frame placement
    frame_index: u64,
    pending: VecDeque<BackendOutput>,
    descriptor_sent: bool,
    dead: bool,
}

impl SyntheticBackend {
    pub fn new(config: &CodecConfig, probe: SyntheticProbe) -> Self {
        Self {
            config: config.clone(),
            probe,
            frame_index: 0,
            pending: VecDeque::new(),
            descriptor_sent: false,
            dead: false,
        }
    }

    fn descriptor(&self) -> Result<Bytes> {
        let (w, h) = (self.config.width as u16, self.config.height as u16);
        let sps = [
            0x67,
            0x64,
            0x00,
            0x1F,
            (w >> 8) as u8,
            w as u8,
            (h >> 8) as u8,
            h as u8,
        ];
        let pps = [0x68, 0xEE, 0x3C, 0x80];
        avcc::decoder_config_record(&[&sps], &[&pps])
    }

    fn target_size(&self, frame: &FrameInput, control: RateControl, is_key: bool) -> usize {
        let raw = frame.data.len().max(1);
        let size = match control {
            RateControl::Bitrate(bps) => {
                let per_frame = (bps as f64 / self.config.frame_rate / 8.0) as usize;
                per_frame.clamp(1, raw)
            }
            // every 6 quantizer steps halve the size
            RateControl::Quantizer(qp) => (raw >> (qp / 6).min(16)).max(1),
        };
        if is_key { size.saturating_mul(2).min(raw) } else { size }
    }

    fn encode_payload(&self, frame: &FrameInput, size: usize, is_key: bool) -> Bytes {
        let nal_header = if is_key { 0x65 } else { 0x41 };
        let mut out = BytesMut::with_capacity(avcc::LENGTH_SIZE + 1 + size);
        out.put_u32(size as u32 + 1);
        out.put_u8(nal_header);
        for i in 0..size {
            let byte = frame.data.get(i % frame.data.len().max(1)).copied().unwrap_or(0);
            out.put_u8(byte ^ (i as u8) ^ (frame.timestamp as u8));
        }
        out.freeze()
    }
}

impl EncoderBackend for SyntheticBackend {
    fn send_frame(&mut self, frame: &FrameInput, control: RateControl) -> Result<()> {
        if self.dead {
            return Err(ExportError::SessionDead(
                "synthetic encoder is closed".to_string(),
            ));
        }

        let (index, latency, rejected, fail, emit_descriptor) = {
            let mut state = self.probe.lock();
            let index = state.frames_sent;
            state.frames_sent += 1;
            state.controls.push(control);
            (
                index,
                state.latency,
                state.reject.contains(&index),
                state.fail_at == Some(index),
                state.emit_descriptor,
            )
        };

        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }
        if fail {
            self.dead = true;
            self.pending.clear();
            return Err(ExportError::SessionDead(format!(
                "synthetic encoder failed at frame {}",
                index
            )));
        }
        if rejected {
            return Err(ExportError::Encode(format!("frame {} rejected", index)));
        }
        if frame.data.len() != frame.expected_size() {
            return Err(ExportError::Encode(format!(
                "frame carries {} bytes, {}x{} {:?} needs {}",
                frame.data.len(),
                frame.width,
                frame.height,
                frame.format,
                frame.expected_size()
            )));
        }

        let is_key = self.frame_index % self.config.keyframe_interval as u64 == 0;
        let size = self.target_size(frame, control, is_key);
        let data = self.encode_payload(frame, size, is_key);
        let duration = frame
            .duration
            .unwrap_or_else(|| self.config.frame_duration_us());
        let descriptor = if emit_descriptor && !self.descriptor_sent {
            self.descriptor_sent = true;
            Some(self.descriptor()?)
        } else {
            None
        };

        self.pending.push_back(BackendOutput {
            chunk: EncodedChunk::new(data, frame.timestamp, duration, is_key),
            descriptor,
        });
        self.frame_index += 1;
        Ok(())
    }

    fn receive_chunk(&mut self) -> Result<Option<BackendOutput>> {
        Ok(self.pending.pop_front())
    }

    fn send_eof(&mut self) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        if self.dead {
            return Err(ExportError::SessionDead(
                "synthetic encoder is closed".to_string(),
            ));
        }
        self.frame_index = 0;
        self.probe.lock().resets += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::BitrateMode, frame::PixelFormat};

    fn input(timestamp: i64) -> FrameInput {
        FrameInput {
            data: Bytes::from(vec![7u8; 64 * 48 * 4]),
            width: 64,
            height: 48,
            format: PixelFormat::Rgba,
            timestamp,
            duration: None,
        }
    }

    fn config() -> CodecConfig {
        CodecConfig {
            width: 64,
            height: 48,
            frame_rate: 30.0,
            bitrate: 500_000,
            keyframe_interval: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_key_frames_and_descriptor() {
        let probe = SyntheticProbe::new();
        let mut backend = SyntheticBackend::new(&config(), probe.clone());
        for i in 0..4 {
            backend
                .send_frame(&input(i * 33_333), RateControl::Bitrate(500_000))
                .unwrap();
        }

        let outputs: Vec<_> = std::iter::from_fn(|| backend.receive_chunk().unwrap()).collect();
        assert_eq!(outputs.len(), 4);
        assert_eq!(
            outputs.iter().map(|o| o.chunk.is_key).collect::<Vec<_>>(),
            vec![true, false, false, true]
        );
        assert!(outputs[0].descriptor.is_some());
        assert!(outputs[1..].iter().all(|o| o.descriptor.is_none()));
        assert_eq!(outputs[2].chunk.duration, 33_333);

        // avcc framing: the length prefix covers the rest of the chunk
        let data = &outputs[1].chunk.data;
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        assert_eq!(len + avcc::LENGTH_SIZE, data.len());
    }

    #[test]
    fn test_quantizer_shrinks_output() {
        let probe = SyntheticProbe::new();
        let quantizer = CodecConfig {
            bitrate_mode: BitrateMode::Quantizer,
            keyframe_interval: 100,
            ..config()
        };
        let mut backend = SyntheticBackend::new(&quantizer, probe.clone());
        backend.send_frame(&input(0), RateControl::Quantizer(20)).unwrap();
        backend.send_frame(&input(1), RateControl::Quantizer(20)).unwrap();
        backend.send_frame(&input(2), RateControl::Quantizer(40)).unwrap();
        let _key = backend.receive_chunk().unwrap().unwrap();
        let low = backend.receive_chunk().unwrap().unwrap();
        let high = backend.receive_chunk().unwrap().unwrap();
        assert!(high.chunk.size < low.chunk.size);
        assert_eq!(
            probe.controls(),
            vec![
                RateControl::Quantizer(20),
                RateControl::Quantizer(20),
                RateControl::Quantizer(40)
            ]
        );
    }

    #[test]
    fn test_injected_failures() {
        let probe = SyntheticProbe::new().reject_frame(1).fail_at(2);
        let mut backend = SyntheticBackend::new(&config(), probe.clone());
        let control = RateControl::Bitrate(500_000);

        assert!(backend.send_frame(&input(0), control).is_ok());
        assert!(matches!(
            backend.send_frame(&input(1), control),
            Err(ExportError::Encode(_))
        ));
        assert!(matches!(
            backend.send_frame(&input(2), control),
            Err(ExportError::SessionDead(_))
        ));
        assert!(matches!(backend.reset(), Err(ExportError::SessionDead(_))));
        assert_eq!(probe.frames_sent(), 3);
    }

    #[test]
    fn test_rejects_short_frame() {
        let mut backend = SyntheticBackend::new(&config(), SyntheticProbe::new());
        let mut frame = input(0);
        frame.data = Bytes::from_static(&[1, 2, 3]);
        assert!(matches!(
            backend.send_frame(&frame, RateControl::Bitrate(1)),
            Err(ExportError::Encode(_))
        ));
    }
}
