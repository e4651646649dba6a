//! Microphone capture pipeline.
//!
//! A [`CaptureDevice`] pushes raw float frames into a channel. The
//! [`CapturePipeline`] drains that channel while listening, taps each frame
//! into the level analyser, encodes it and sends it as one `media` message.

mod wav;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::base::ClientResult;
use super::codec::{CodecError, encode_capture_frame};
use super::listeners::{EventKind, Listeners};
use super::outbound::OutboundChannel;
use super::stats::{SpectrumAnalyser, StatsMonitor};

pub use wav::WavFileCapture;

/// Channel capacity between a device and the pipeline.
pub const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Frame size delivered by audio worklets.
pub const DEFAULT_FRAME_SIZE: usize = 128;

/// Receiving end of a device's frames.
pub type FrameSender = mpsc::Sender<Vec<f32>>;

/// Input capability producing mono float frames in `[-1, 1]`.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Native sample rate of the frames.
    fn sample_rate(&self) -> u32;

    /// Acquire the device and deliver frames into `frames` until stopped.
    ///
    /// Returns `ClientError::PermissionDenied` when access is refused.
    async fn start(&self, frames: FrameSender) -> ClientResult<()>;

    /// Release the device. Safe to call when not started.
    async fn stop(&self);
}

#[derive(Default)]
struct CaptureState {
    listening: bool,
    cancel: Option<CancellationToken>,
    forwarder: Option<JoinHandle<()>>,
}

/// Owns the live microphone stream of one client.
pub struct CapturePipeline {
    device: Arc<dyn CaptureDevice>,
    outbound: OutboundChannel,
    listeners: Arc<Listeners>,
    stats: Arc<StatsMonitor>,
    target_rate: u32,
    state: Mutex<CaptureState>,
    starting: AtomicBool,
}

impl CapturePipeline {
    pub fn new(
        device: Arc<dyn CaptureDevice>,
        outbound: OutboundChannel,
        listeners: Arc<Listeners>,
        stats: Arc<StatsMonitor>,
        target_rate: u32,
    ) -> Self {
        Self {
            device,
            outbound,
            listeners,
            stats,
            target_rate,
            state: Mutex::new(CaptureState::default()),
            starting: AtomicBool::new(false),
        }
    }

    pub fn is_listening(&self) -> bool {
        self.state.lock().listening
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Start streaming the device. No-op if already listening or starting.
    pub async fn start(&self) -> ClientResult<()> {
        if self.is_listening() {
            tracing::debug!("Already listening");
            return Ok(());
        }
        if self.starting.swap(true, Ordering::SeqCst) {
            tracing::debug!("Microphone start already in progress");
            return Ok(());
        }

        let result = self.start_device().await;
        self.starting.store(false, Ordering::SeqCst);
        result
    }

    async fn start_device(&self) -> ClientResult<()> {
        let source_rate = self.device.sample_rate();
        if source_rate < self.target_rate {
            return Err(CodecError::UpsamplingNotSupported {
                source_rate,
                target_rate: self.target_rate,
            }
            .into());
        }

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        if let Err(e) = self.device.start(tx).await {
            tracing::error!("Failed to start microphone: {}", e);
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let forwarder = tokio::spawn(forward_frames(
            rx,
            cancel.clone(),
            self.outbound.clone(),
            self.stats.analyser().clone(),
            source_rate,
            self.target_rate,
        ));

        {
            let mut state = self.state.lock();
            state.listening = true;
            state.cancel = Some(cancel);
            state.forwarder = Some(forwarder);
        }

        self.stats.set_listening(true);
        tracing::info!(
            "Started listening ({}Hz -> {}Hz)",
            source_rate,
            self.target_rate
        );
        self.listeners.emit(EventKind::ListeningStart).await;
        Ok(())
    }

    /// Release the device and stop sending. No-op if not listening.
    pub async fn stop(&self) {
        let cancel = {
            let mut state = self.state.lock();
            if !state.listening {
                return;
            }
            state.listening = false;
            state.forwarder.take();
            state.cancel.take()
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.device.stop().await;
        self.stats.analyser().clear_capture();
        self.stats.set_listening(false);

        tracing::info!("Stopped listening");
        self.listeners.emit(EventKind::ListeningStop).await;
    }
}

impl std::fmt::Debug for CapturePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturePipeline")
            .field("target_rate", &self.target_rate)
            .field("listening", &self.is_listening())
            .finish()
    }
}

async fn forward_frames(
    mut frames: mpsc::Receiver<Vec<f32>>,
    cancel: CancellationToken,
    outbound: OutboundChannel,
    analyser: Arc<SpectrumAnalyser>,
    source_rate: u32,
    target_rate: u32,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            frame = frames.recv() => {
                let Some(frame) = frame else {
                    tracing::debug!("Capture device closed its frame channel");
                    break;
                };
                analyser.push_capture(&frame);

                match encode_capture_frame(&frame, source_rate, target_rate) {
                    Ok(payload) => {
                        tracing::debug!("Sending capture frame: {} base64 chars", payload.len());
                        if let Err(e) = outbound.send_media(payload).await {
                            tracing::debug!("Dropping capture frame: {}", e);
                        }
                    }
                    Err(e) => tracing::warn!("Failed to encode capture frame: {}", e),
                }
            }
        }
    }
}
