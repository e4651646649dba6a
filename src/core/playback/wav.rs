use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{OutputClock, PlaybackSink, ScheduledBuffer};
use crate::core::base::{ClientError, ClientResult};

#[derive(Debug, Clone)]
struct RecordedBuffer {
    buffer: ScheduledBuffer,
    stopped_at: Option<f64>,
}

/// Sink that records scheduled buffers and renders them to a mono 16-bit WAV.
///
/// Buffers are placed at their scheduled start offsets. A stopped buffer is
/// truncated at the clock time of the stop.
#[derive(Debug)]
pub struct WavFileSink {
    path: PathBuf,
    sample_rate: u32,
    clock: OutputClock,
    buffers: Mutex<BTreeMap<u64, RecordedBuffer>>,
}

impl WavFileSink {
    pub fn new(path: impl AsRef<Path>, sample_rate: u32) -> ClientResult<Self> {
        if sample_rate == 0 {
            return Err(ClientError::InvalidConfiguration(
                "Output sample rate must be positive".to_string(),
            ));
        }
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            sample_rate,
            clock: OutputClock::new(),
            buffers: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of buffers scheduled so far.
    pub fn scheduled_count(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Mix every recorded buffer into one timeline starting at clock zero.
    pub fn render(&self) -> Vec<f32> {
        let buffers = self.buffers.lock();
        let rate = self.sample_rate as f64;

        let end = buffers
            .values()
            .map(|r| {
                let end = r.buffer.end_time();
                r.stopped_at.map_or(end, |s| s.min(end))
            })
            .fold(0.0f64, f64::max);
        let mut timeline = vec![0.0f32; (end * rate).round() as usize];

        for recorded in buffers.values() {
            let buffer = &recorded.buffer;
            if buffer.sample_rate == 0 || buffer.samples.is_empty() {
                continue;
            }
            let stop = recorded
                .stopped_at
                .map_or(buffer.end_time(), |s| s.min(buffer.end_time()));
            let first = (buffer.start_time * rate).round() as usize;
            let last = ((stop * rate).round() as usize).min(timeline.len());
            // Nearest-neighbour resampling when buffer and file rates differ
            let step = buffer.sample_rate as f64 / rate;
            for (offset, slot) in timeline[first.min(last)..last].iter_mut().enumerate() {
                let index = (offset as f64 * step) as usize;
                if let Some(&sample) = buffer.samples.get(index) {
                    *slot += sample;
                }
            }
        }

        timeline
    }

    /// Write the rendered timeline to the configured path.
    pub fn finish(&self) -> ClientResult<()> {
        let timeline = self.render();
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut writer = hound::WavWriter::create(&self.path, spec)
            .map_err(|e| ClientError::DeviceError(format!("Failed to create {}: {e}", self.path.display())))?;
        for sample in timeline {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            writer
                .write_sample(value)
                .map_err(|e| ClientError::DeviceError(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| ClientError::DeviceError(e.to_string()))?;

        tracing::info!("Wrote playback recording to {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl PlaybackSink for WavFileSink {
    fn current_time(&self) -> f64 {
        self.clock.now()
    }

    fn schedule(&self, buffer: ScheduledBuffer) -> ClientResult<()> {
        self.buffers.lock().insert(
            buffer.id,
            RecordedBuffer {
                buffer,
                stopped_at: None,
            },
        );
        Ok(())
    }

    fn stop(&self, id: u64) {
        let now = self.clock.now();
        if let Some(recorded) = self.buffers.lock().get_mut(&id) {
            recorded.stopped_at.get_or_insert(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn buffer(id: u64, value: f32, len: usize, start_time: f64) -> ScheduledBuffer {
        ScheduledBuffer {
            id,
            samples: Arc::from(vec![value; len]),
            sample_rate: 8000,
            start_time,
        }
    }

    #[test]
    fn test_render_places_buffers_at_offsets() {
        let sink = WavFileSink::new("unused.wav", 8000).unwrap();
        sink.schedule(buffer(1, 0.5, 800, 0.0)).unwrap();
        sink.schedule(buffer(2, -0.25, 800, 0.2)).unwrap();

        let timeline = sink.render();
        assert_eq!(timeline.len(), 2400);
        assert_eq!(timeline[0], 0.5);
        assert_eq!(timeline[799], 0.5);
        assert_eq!(timeline[800], 0.0);
        assert_eq!(timeline[1600], -0.25);
        assert_eq!(sink.scheduled_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_truncates_buffer() {
        let sink = WavFileSink::new("unused.wav", 8000).unwrap();
        sink.schedule(buffer(1, 0.5, 8000, 0.0)).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        sink.stop(1);
        sink.stop(99);

        let timeline = sink.render();
        assert_eq!(timeline.len(), 2000);
    }

    #[test]
    fn test_finish_writes_wav() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.wav");
        let sink = WavFileSink::new(&path, 8000).unwrap();
        sink.schedule(buffer(1, 0.5, 80, 0.0)).unwrap();
        sink.finish().unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 8000);
        assert_eq!(reader.spec().channels, 1);
        let samples: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 80);
        assert_eq!(samples[0], 16384);
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert!(WavFileSink::new("x.wav", 0).is_err());
    }
}
