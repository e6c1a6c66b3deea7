use std::collections::VecDeque;

use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::BackendFactory,
    backpressure::{DepthMonitor, DepthWatcher},
    chunk::EncodedChunk,
    config::{BitrateMode, ConfigureRequest, DEFAULT_QUANTIZER},
    encoder::{EncoderSession, SessionOutput, SessionOutputReceiver},
    error::{ExportError, Result},
    ffmpeg::FfmpegBackend,
    frame::Frame,
    output::ExportOutput,
};

/// Asynchronous notifications, delivered caller-ward.
#[derive(Debug, Clone)]
pub enum ExportEvent {
    /// A completed chunk; only emitted when the session was configured with
    /// `want_chunk_stream`.
    Chunk(EncodedChunk),
    /// Pending-work depth changed.
    DepthChanged { pending: usize },
    /// The encoder reported a failure.
    Error { message: String },
}

pub type ExportEventReceiver = broadcast::Receiver<ExportEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Configured,
    Flushing,
    Dead(String),
}

/// Protocol handler of one export session.
///
/// Commands are processed one at a time by a background task, which also
/// receives the encoder worker's output; callers only see async methods,
/// the event stream and the depth watcher.
pub struct ExportBus {
    id: String,
    cancel: CancellationToken,
    tx: mpsc::Sender<BusCommand>,
    events: broadcast::Sender<ExportEvent>,
    depth: DepthWatcher,
}

impl ExportBus {
    pub fn new(id: &str, factory: BackendFactory) -> Self {
        let id = id.to_string();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1024);
        const EVENT_CHAN_CAP: usize = 1024;
        let (events, _) = broadcast::channel(EVENT_CHAN_CAP);

        let (outputs_tx, outputs_rx) = mpsc::unbounded_channel();
        let monitor = DepthMonitor::new(events.clone());
        let depth = monitor.watcher();
        let state = BusState {
            id: id.clone(),
            phase: Phase::Uninitialized,
            session: EncoderSession::new(factory, outputs_tx),
            want_chunk_stream: false,
            pending_outputs: VecDeque::new(),
            next_ticket: 0,
            depth: monitor,
            events: events.clone(),
        };

        let cancel_clone = cancel.clone();
        tokio::spawn(async move { Self::inner_loop(cancel_clone, rx, outputs_rx, state).await });
        Self {
            id,
            cancel,
            tx,
            events,
            depth,
        }
    }

    /// Session backed by libavcodec.
    pub fn ffmpeg(id: &str) -> Self {
        Self::new(id, FfmpegBackend::factory())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn inner_loop(
        cancel: CancellationToken,
        mut rx: mpsc::Receiver<BusCommand>,
        mut outputs: SessionOutputReceiver,
        mut state: BusState,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                },
                Some(cmd) = rx.recv() => {
                    Self::inner_command_handler(&mut state, cmd);
                },
                Some(output) = outputs.recv() => {
                    Self::inner_output_handler(&mut state, output);
                },
            }
        }
        state.session.close();
        log::info!("export bus {} stopped", state.id);
    }

    fn inner_command_handler(state: &mut BusState, cmd: BusCommand) {
        match cmd {
            BusCommand::Configure { request, result } => {
                let _ = result.send(Self::configure_internal(state, request));
            }
            BusCommand::Encode { frame, result } => {
                let _ = result.send(Self::encode_internal(state, frame));
            }
            BusCommand::RequestOutput { result } => match Self::request_output_internal(state) {
                Ok(ticket) => state.pending_outputs.push_back((ticket, result)),
                Err(e) => {
                    let _ = result.send(Err(e));
                }
            },
            BusCommand::Reset { result } => {
                let _ = result.send(Self::reset_internal(state));
            }
            BusCommand::GetPhase { result } => {
                let _ = result.send(state.phase.clone());
            }
        }
    }

    fn configure_internal(state: &mut BusState, request: ConfigureRequest) -> Result<()> {
        match &state.phase {
            Phase::Uninitialized => {}
            Phase::Dead(reason) => return Err(ExportError::SessionDead(reason.clone())),
            _ => {
                return Err(ExportError::Config(
                    "session already configured".to_string(),
                ));
            }
        }

        if let Err(e) = state.session.configure(request.to_codec_config()) {
            log::error!("export bus {} configure failed: {}", state.id, e);
            state.phase = Phase::Dead(e.to_string());
            return Err(e);
        }
        state.want_chunk_stream = request.want_chunk_stream;
        state.phase = Phase::Configured;
        Ok(())
    }

    fn encode_internal(state: &mut BusState, frame: Frame) -> Result<()> {
        match &state.phase {
            Phase::Configured | Phase::Flushing => {}
            Phase::Uninitialized => {
                return Err(ExportError::Sequence(
                    "encode before configure".to_string(),
                ));
            }
            Phase::Dead(reason) => return Err(ExportError::SessionDead(reason.clone())),
        }

        let hint = match state.session.config().map(|c| c.bitrate_mode) {
            Some(BitrateMode::Quantizer) => Some(DEFAULT_QUANTIZER),
            _ => None,
        };
        if let Err(e) = state.session.encode(frame, hint) {
            if matches!(e, ExportError::SessionDead(_)) {
                Self::kill(state, e.clone());
            }
            return Err(e);
        }
        state.depth.submit();
        Ok(())
    }

    fn request_output_internal(state: &mut BusState) -> Result<u64> {
        match &state.phase {
            Phase::Configured | Phase::Flushing => {}
            Phase::Uninitialized => {
                return Err(ExportError::Sequence(
                    "request-output before configure".to_string(),
                ));
            }
            Phase::Dead(reason) => return Err(ExportError::SessionDead(reason.clone())),
        }

        let ticket = state.next_ticket;
        if let Err(e) = state.session.flush(ticket) {
            if matches!(e, ExportError::SessionDead(_)) {
                Self::kill(state, e.clone());
            }
            return Err(e);
        }
        state.next_ticket += 1;
        state.phase = Phase::Flushing;
        log::debug!("export bus {} flushing, ticket {}", state.id, ticket);
        Ok(ticket)
    }

    fn reset_internal(state: &mut BusState) -> Result<()> {
        match &state.phase {
            Phase::Configured => {
                state.session.reset_store();
                Ok(())
            }
            Phase::Uninitialized => Err(ExportError::Sequence(
                "reset before configure".to_string(),
            )),
            Phase::Flushing => Err(ExportError::Sequence(
                "reset while flushing".to_string(),
            )),
            Phase::Dead(reason) => Err(ExportError::SessionDead(reason.clone())),
        }
    }

    fn inner_output_handler(state: &mut BusState, output: SessionOutput) {
        if matches!(state.phase, Phase::Dead(_)) {
            return;
        }
        match output {
            SessionOutput::Chunk { output, retired } => {
                let chunk = state.want_chunk_stream.then(|| output.chunk.clone());
                if let Err(e) = state.session.chunk_received(output) {
                    Self::kill(state, e);
                    return;
                }
                if let Some(chunk) = chunk {
                    let _ = state.events.send(ExportEvent::Chunk(chunk));
                }
                state.depth.retire(retired);
            }
            SessionOutput::Dropped { error, retired } => {
                log::warn!("export bus {} dropped a frame: {}", state.id, error);
                let _ = state.events.send(ExportEvent::Error {
                    message: error.to_string(),
                });
                state.depth.retire(retired);
            }
            SessionOutput::Flushed { ticket, retired } => {
                state.depth.retire(retired);
                match state.pending_outputs.pop_front() {
                    Some((expected, result)) => {
                        if expected != ticket {
                            log::warn!(
                                "export bus {} flush ticket {} answered by {}",
                                state.id,
                                expected,
                                ticket
                            );
                        }
                        let output = state.session.output();
                        log::info!(
                            "export bus {} output: {} chunks, {} bytes",
                            state.id,
                            output.chunks.len(),
                            output.total_bytes()
                        );
                        let _ = result.send(Ok(output));
                    }
                    None => log::warn!("export bus {} unexpected flush {}", state.id, ticket),
                }
                if state.pending_outputs.is_empty() {
                    state.phase = Phase::Configured;
                }
            }
            SessionOutput::Dead { error } => Self::kill(state, error),
        }
    }

    /// Moves the session to its terminal state and fails everyone waiting.
    fn kill(state: &mut BusState, error: ExportError) {
        log::error!("export bus {} is dead: {}", state.id, error);
        let reason = error.to_string();
        let _ = state.events.send(ExportEvent::Error {
            message: reason.clone(),
        });
        state.phase = Phase::Dead(reason.clone());
        state.session.close();
        state.depth.clear();
        for (_, result) in state.pending_outputs.drain(..) {
            let _ = result.send(Err(ExportError::SessionDead(reason.clone())));
        }
    }

    async fn call<T>(
        &self,
        cmd: impl FnOnce(oneshot::Sender<Result<T>>) -> BusCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(cmd(tx))
            .await
            .map_err(|_| ExportError::SessionDead("export bus stopped".to_string()))?;
        rx.await
            .map_err(|_| ExportError::SessionDead("export bus stopped".to_string()))?
    }

    pub async fn configure(&self, request: ConfigureRequest) -> Result<()> {
        self.call(|result| BusCommand::Configure { request, result })
            .await
    }

    /// Submits one frame. Resolves once the frame is queued, not encoded.
    pub async fn encode(&self, frame: Frame) -> Result<()> {
        self.call(|result| BusCommand::Encode { frame, result }).await
    }

    /// Flushes the encoder and returns everything accumulated so far.
    pub async fn request_output(&self) -> Result<ExportOutput> {
        self.call(|result| BusCommand::RequestOutput { result })
            .await
    }

    /// Clears the accumulated chunks. The decoder descriptor is kept.
    pub async fn reset(&self) -> Result<()> {
        self.call(|result| BusCommand::Reset { result }).await
    }

    pub async fn phase(&self) -> Result<Phase> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(BusCommand::GetPhase { result: tx })
            .await
            .map_err(|_| ExportError::SessionDead("export bus stopped".to_string()))?;
        rx.await
            .map_err(|_| ExportError::SessionDead("export bus stopped".to_string()))
    }

    pub fn subscribe(&self) -> ExportEventReceiver {
        self.events.subscribe()
    }

    /// Same events as [`ExportBus::subscribe`], skipping whatever a lagging
    /// reader missed.
    pub fn event_stream(&self) -> impl Stream<Item = ExportEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| async move {
            match event {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    log::warn!("export event stream lagged by {} events", n);
                    None
                }
            }
        })
    }

    pub fn depth(&self) -> DepthWatcher {
        self.depth.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ExportBus {
    fn drop(&mut self) {
        self.stop();
    }
}

struct BusState {
    id: String,
    phase: Phase,
    session: EncoderSession,
    want_chunk_stream: bool,
    pending_outputs: VecDeque<(u64, oneshot::Sender<Result<ExportOutput>>)>,
    next_ticket: u64,
    depth: DepthMonitor,
    events: broadcast::Sender<ExportEvent>,
}

pub enum BusCommand {
    Configure {
        request: ConfigureRequest,
        result: oneshot::Sender<Result<()>>,
    },
    Encode {
        frame: Frame,
        result: oneshot::Sender<Result<()>>,
    },
    RequestOutput {
        result: oneshot::Sender<Result<ExportOutput>>,
    },
    Reset {
        result: oneshot::Sender<Result<()>>,
    },
    GetPhase {
        result: oneshot::Sender<Phase>,
    },
}

#[cfg(test)]
#[path = "bus_test.rs"]
mod bus_test;
