use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{CaptureDevice, DEFAULT_FRAME_SIZE, FrameSender};
use crate::core::base::{ClientError, ClientResult};

/// Capture device that replays a WAV file as a microphone.
///
/// Channels are averaged to mono. Frames are delivered at the pace they would
/// arrive from real hardware.
#[derive(Debug)]
pub struct WavFileCapture {
    samples: Arc<[f32]>,
    sample_rate: u32,
    frame_size: usize,
    running: Mutex<Option<CancellationToken>>,
}

impl WavFileCapture {
    /// Decode `path` fully. Unreadable files map to `PermissionDenied`, the
    /// fault a refused microphone produces.
    pub fn open(path: impl AsRef<Path>) -> ClientResult<Self> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path).map_err(|e| {
            ClientError::PermissionDenied(format!("Cannot open {}: {e}", path.display()))
        })?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(|e| ClientError::DeviceError(e.to_string()))?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()
                    .map_err(|e| ClientError::DeviceError(e.to_string()))?
            }
        };

        let samples: Vec<f32> = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();

        tracing::info!(
            "Loaded {} ({} samples at {}Hz, {} channels)",
            path.display(),
            samples.len(),
            spec.sample_rate,
            channels
        );
        Ok(Self::from_samples(samples, spec.sample_rate))
    }

    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            frame_size: DEFAULT_FRAME_SIZE,
            running: Mutex::new(None),
        }
    }

    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size.max(1);
        self
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

#[async_trait]
impl CaptureDevice for WavFileCapture {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn start(&self, frames: FrameSender) -> ClientResult<()> {
        if self.sample_rate == 0 {
            return Err(ClientError::DeviceError("WAV sample rate is zero".to_string()));
        }

        let cancel = CancellationToken::new();
        if let Some(previous) = self.running.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let samples = self.samples.clone();
        let frame_size = self.frame_size;
        let period = Duration::from_secs_f64(frame_size as f64 / self.sample_rate as f64);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            for chunk in samples.chunks(frame_size) {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if frames.send(chunk.to_vec()).await.is_err() {
                    return;
                }
            }
            tracing::debug!("WAV capture reached end of file");
        });

        Ok(())
    }

    async fn stop(&self) {
        if let Some(cancel) = self.running.lock().take() {
            cancel.cancel();
        }
    }
}
