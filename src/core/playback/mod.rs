//! Playback side of the streaming core.
//!
//! A [`PlaybackSink`] exposes an output clock and accepts buffers scheduled at
//! absolute clock times. The [`PlaybackScheduler`] keeps sinks fed gaplessly
//! from the inbound queue.

mod scheduler;
mod wav;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::base::ClientResult;

pub use scheduler::{PlaybackScheduler, SchedulerConfig};
pub use wav::WavFileSink;

/// Audio buffer placed on the output clock.
#[derive(Debug, Clone)]
pub struct ScheduledBuffer {
    /// Scheduler-assigned id, unique per sink
    pub id: u64,
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
    /// Start time on the output clock, in seconds
    pub start_time: f64,
}

impl ScheduledBuffer {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration_secs()
    }
}

/// Output capability with a monotonic clock.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Current output clock time in seconds.
    fn current_time(&self) -> f64;

    /// Resume a suspended clock. Sinks that never suspend keep the default.
    async fn resume(&self) -> ClientResult<()> {
        Ok(())
    }

    /// Start `buffer` exactly at its start time.
    fn schedule(&self, buffer: ScheduledBuffer) -> ClientResult<()>;

    /// Stop a scheduled buffer immediately. Unknown ids are ignored.
    fn stop(&self, id: u64);
}

/// Monotonic clock anchored at creation, driven by tokio time.
#[derive(Debug, Clone, Copy)]
pub struct OutputClock {
    origin: Instant,
}

impl OutputClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Real time remaining until clock time `at`.
    pub fn until(&self, at: f64) -> Duration {
        Duration::from_secs_f64((at - self.now()).max(0.0))
    }
}

impl Default for OutputClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Sink that advances its clock and discards audio.
#[derive(Debug, Default)]
pub struct NullSink {
    clock: OutputClock,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlaybackSink for NullSink {
    fn current_time(&self) -> f64 {
        self.clock.now()
    }

    fn schedule(&self, buffer: ScheduledBuffer) -> ClientResult<()> {
        tracing::trace!(
            "Discarding buffer {} ({:.3}s at {:.3})",
            buffer.id,
            buffer.duration_secs(),
            buffer.start_time
        );
        Ok(())
    }

    fn stop(&self, _id: u64) {}
}
