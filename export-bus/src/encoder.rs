use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, Sender},
    time::Duration,
};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{BackendFactory, BackendOutput, EncoderBackend},
    config::{CodecConfig, RateControl},
    error::{ExportError, Result},
    frame::{Frame, FrameInput},
    output::ExportOutput,
    store::ChunkStore,
};

pub(crate) enum EncodeJob {
    Frame {
        input: FrameInput,
        control: RateControl,
    },
    Flush {
        ticket: u64,
    },
}

/// Everything the worker reports, in the order it happened. `retired` is the
/// number of submitted frames the event completes or discards.
#[derive(Debug)]
pub enum SessionOutput {
    Chunk {
        output: BackendOutput,
        retired: usize,
    },
    Dropped {
        error: ExportError,
        retired: usize,
    },
    Flushed {
        ticket: u64,
        retired: usize,
    },
    Dead {
        error: ExportError,
    },
}

pub type SessionOutputSender = tokio::sync::mpsc::UnboundedSender<SessionOutput>;
pub type SessionOutputReceiver = tokio::sync::mpsc::UnboundedReceiver<SessionOutput>;

struct EncoderWorker {
    jobs: Sender<EncodeJob>,
    cancel: CancellationToken,
}

/// Frozen configuration, the encoder worker and everything it produced.
pub struct EncoderSession {
    factory: BackendFactory,
    outputs: SessionOutputSender,
    config: Option<CodecConfig>,
    worker: Option<EncoderWorker>,
    store: ChunkStore,
    descriptor: Option<Bytes>,
}

impl EncoderSession {
    pub fn new(factory: BackendFactory, outputs: SessionOutputSender) -> Self {
        Self {
            factory,
            outputs,
            config: None,
            worker: None,
            store: ChunkStore::new(),
            descriptor: None,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    pub fn config(&self) -> Option<&CodecConfig> {
        self.config.as_ref()
    }

    /// Opens the backend and starts the worker. Must run inside a tokio
    /// runtime.
    pub fn configure(&mut self, config: CodecConfig) -> Result<()> {
        if self.config.is_some() {
            return Err(ExportError::Config("encoder already configured".to_string()));
        }
        config.validate()?;
        let backend = (self.factory)(&config).map_err(|e| match e {
            ExportError::Config(msg) => ExportError::Config(msg),
            other => ExportError::Config(other.to_string()),
        })?;

        let (tx, rx) = std::sync::mpsc::channel();
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let outputs = self.outputs.clone();
        tokio::task::spawn_blocking(move || Self::encoder_loop(backend, worker_cancel, rx, outputs));

        log::info!(
            "encoder session configured: {} {}x{} @ {} fps, {} bps, {:?}",
            config.codec,
            config.width,
            config.height,
            config.frame_rate,
            config.bitrate,
            config.bitrate_mode
        );
        self.config = Some(config);
        self.worker = Some(EncoderWorker { jobs: tx, cancel });
        Ok(())
    }

    /// Schedules one frame. Returns as soon as the frame is queued; the
    /// frame itself is released before returning, whatever happens to it.
    pub fn encode(&mut self, frame: Frame, quality_hint: Option<u8>) -> Result<()> {
        let (config, worker) = match (self.config.as_ref(), self.worker.as_ref()) {
            (Some(config), Some(worker)) => (config, worker),
            _ => {
                return Err(ExportError::Sequence(
                    "encode before configure".to_string(),
                ));
            }
        };
        let job = EncodeJob::Frame {
            input: frame.to_input(),
            control: config.rate_control(quality_hint),
        };
        let sent = worker.jobs.send(job);
        drop(frame);
        sent.map_err(|_| ExportError::SessionDead("encoder worker stopped".to_string()))
    }

    /// Queues a drain marker. `SessionOutput::Flushed` with the same ticket
    /// follows every chunk of the frames encoded before it.
    pub fn flush(&mut self, ticket: u64) -> Result<()> {
        let worker = self
            .worker
            .as_ref()
            .ok_or(ExportError::Sequence("flush before configure".to_string()))?;
        worker
            .jobs
            .send(EncodeJob::Flush { ticket })
            .map_err(|_| ExportError::SessionDead("encoder worker stopped".to_string()))
    }

    /// Chunk-received callback.
    pub fn chunk_received(&mut self, output: BackendOutput) -> Result<()> {
        self.store.append(output.chunk)?;
        if self.descriptor.is_none() {
            if let Some(descriptor) = output.descriptor {
                log::info!("decoder descriptor captured: {} bytes", descriptor.len());
                self.descriptor = Some(descriptor);
            }
        }
        Ok(())
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn descriptor(&self) -> Option<&Bytes> {
        self.descriptor.as_ref()
    }

    pub fn output(&self) -> ExportOutput {
        let (buffer, chunks) = self.store.materialize();
        ExportOutput {
            buffer,
            chunks,
            descriptor: self.descriptor.clone(),
        }
    }

    pub fn reset_store(&mut self) {
        self.store.reset();
    }

    pub fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.cancel.cancel();
        }
    }

    fn encoder_loop(
        mut backend: Box<dyn EncoderBackend>,
        cancel: CancellationToken,
        rx: Receiver<EncodeJob>,
        out: SessionOutputSender,
    ) {
        log::info!("encoder worker started");
        // frames accepted by the backend and not yet retired
        let mut in_flight: usize = 0;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let job = match rx.recv_timeout(Duration::from_millis(10)) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let result = match job {
                EncodeJob::Frame { input, control } => {
                    match backend.send_frame(&input, control) {
                        Ok(()) => {
                            in_flight += 1;
                            Self::drain(backend.as_mut(), &mut in_flight, &out)
                        }
                        Err(error) if error.is_recoverable() => {
                            log::warn!("frame at {} dropped: {}", input.timestamp, error);
                            let _ = out.send(SessionOutput::Dropped { error, retired: 1 });
                            Ok(())
                        }
                        Err(error) => Err(error),
                    }
                }
                EncodeJob::Flush { ticket } => {
                    Self::flush_backend(backend.as_mut(), ticket, &mut in_flight, &out)
                }
            };

            if let Err(error) = result {
                let error = match error {
                    ExportError::SessionDead(msg) => ExportError::SessionDead(msg),
                    other => ExportError::SessionDead(other.to_string()),
                };
                log::error!("encoder worker failed: {}", error);
                let _ = out.send(SessionOutput::Dead { error });
                break;
            }
        }
        log::info!("encoder worker finished");
    }

    fn drain(
        backend: &mut dyn EncoderBackend,
        in_flight: &mut usize,
        out: &SessionOutputSender,
    ) -> Result<()> {
        while let Some(output) = backend.receive_chunk()? {
            let retired = if *in_flight > 0 {
                *in_flight -= 1;
                1
            } else {
                0
            };
            let _ = out.send(SessionOutput::Chunk { output, retired });
        }
        Ok(())
    }

    fn flush_backend(
        backend: &mut dyn EncoderBackend,
        ticket: u64,
        in_flight: &mut usize,
        out: &SessionOutputSender,
    ) -> Result<()> {
        backend.send_eof()?;
        Self::drain(backend, in_flight, out)?;
        // frames the encoder swallowed without output
        let retired = std::mem::take(in_flight);
        if retired > 0 {
            log::warn!("flush discarded {} frames without output", retired);
        }
        backend.reset()?;
        let _ = out.send(SessionOutput::Flushed { ticket, retired });
        Ok(())
    }
}

impl Drop for EncoderSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[path = "encoder_test.rs"]
mod encoder_test;
