//! Audio level analysis and speech/silence telemetry.
//!
//! [`SpectrumAnalyser`] behaves like a 256-point browser analyser node tapped by
//! both the microphone and scheduled playback. [`StatsMonitor`] samples it on a
//! fixed interval while either side is active and emits [`AudioStats`].

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::base::AudioStats;
use super::listeners::Listeners;
use super::playback::PlaybackSink;

/// Analysis window length in samples.
pub const FFT_SIZE: usize = 256;

/// Number of magnitude bins produced per analysis.
pub const FREQUENCY_BIN_COUNT: usize = FFT_SIZE / 2;

/// Weight of the previous frame when smoothing magnitudes.
pub const SMOOTHING_TIME_CONSTANT: f64 = 0.8;

/// Level mapped to byte 0.
pub const MIN_DECIBELS: f64 = -100.0;

/// Level mapped to byte 255.
pub const MAX_DECIBELS: f64 = -30.0;

/// Default sampling cadence.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_millis(100);

/// Default normalized level above which the signal counts as speech.
pub const DEFAULT_SPEAKING_THRESHOLD: f32 = 0.1;

/// Playback segments older than this are pruned.
const PLAYBACK_RETENTION_SECS: f64 = 1.0;

struct PlaybackSegment {
    start_time: f64,
    sample_rate: u32,
    samples: Arc<[f32]>,
}

impl PlaybackSegment {
    fn end_time(&self) -> f64 {
        self.start_time + self.samples.len() as f64 / self.sample_rate.max(1) as f64
    }
}

struct AnalyserState {
    capture: VecDeque<f32>,
    playback: Vec<PlaybackSegment>,
    smoothed: Vec<f64>,
}

/// Frequency-domain level analyser shared by capture and playback.
pub struct SpectrumAnalyser {
    clock: Arc<dyn PlaybackSink>,
    window: Vec<f64>,
    cos_table: Vec<f64>,
    sin_table: Vec<f64>,
    state: Mutex<AnalyserState>,
}

impl SpectrumAnalyser {
    /// Create an analyser reading time from the output clock of `clock`.
    pub fn new(clock: Arc<dyn PlaybackSink>) -> Self {
        // Blackman window, alpha = 0.16
        let window = (0..FFT_SIZE)
            .map(|n| {
                let x = 2.0 * PI * n as f64 / FFT_SIZE as f64;
                0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
            })
            .collect();
        let cos_table = (0..FFT_SIZE)
            .map(|n| (2.0 * PI * n as f64 / FFT_SIZE as f64).cos())
            .collect();
        let sin_table = (0..FFT_SIZE)
            .map(|n| (2.0 * PI * n as f64 / FFT_SIZE as f64).sin())
            .collect();

        Self {
            clock,
            window,
            cos_table,
            sin_table,
            state: Mutex::new(AnalyserState {
                capture: VecDeque::with_capacity(FFT_SIZE),
                playback: Vec::new(),
                smoothed: vec![0.0; FREQUENCY_BIN_COUNT],
            }),
        }
    }

    /// Feed a microphone frame.
    pub fn push_capture(&self, frame: &[f32]) {
        let mut state = self.state.lock();
        let skip = frame.len().saturating_sub(FFT_SIZE);
        for &sample in &frame[skip..] {
            if state.capture.len() == FFT_SIZE {
                state.capture.pop_front();
            }
            state.capture.push_back(sample);
        }
    }

    /// Forget microphone input.
    pub fn clear_capture(&self) {
        self.state.lock().capture.clear();
    }

    /// Register a playback buffer scheduled at `start_time` on the output clock.
    pub fn push_playback(&self, start_time: f64, samples: Arc<[f32]>, sample_rate: u32) {
        let now = self.clock.current_time();
        let mut state = self.state.lock();
        state
            .playback
            .retain(|s| s.end_time() + PLAYBACK_RETENTION_SECS >= now);
        state.playback.push(PlaybackSegment {
            start_time,
            sample_rate,
            samples,
        });
    }

    /// Forget all scheduled playback, e.g. after a flush.
    pub fn clear_playback(&self) {
        self.state.lock().playback.clear();
    }

    /// Reset input, playback and smoothing history.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.capture.clear();
        state.playback.clear();
        state.smoothed.iter_mut().for_each(|v| *v = 0.0);
    }

    fn time_domain(&self, state: &AnalyserState, now: f64) -> Vec<f64> {
        let mut frame = vec![0.0f64; FFT_SIZE];

        let offset = FFT_SIZE - state.capture.len();
        for (i, &sample) in state.capture.iter().enumerate() {
            frame[offset + i] = sample as f64;
        }

        for segment in &state.playback {
            if segment.start_time > now || segment.end_time() + FFT_SIZE as f64 / segment.sample_rate.max(1) as f64 <= now {
                continue;
            }
            // Index of the sample being played right now
            let cursor = ((now - segment.start_time) * segment.sample_rate as f64).floor() as i64;
            for (j, slot) in frame.iter_mut().enumerate() {
                let index = cursor - FFT_SIZE as i64 + j as i64;
                if index >= 0 && (index as usize) < segment.samples.len() {
                    *slot += segment.samples[index as usize] as f64;
                }
            }
        }

        frame
    }

    /// Current spectrum as bytes, one per frequency bin.
    ///
    /// Each call advances the smoothing state, matching a browser analyser.
    pub fn byte_frequency_data(&self) -> Vec<u8> {
        let now = self.clock.current_time();
        let mut state = self.state.lock();
        let frame = self.time_domain(&state, now);

        let windowed: Vec<f64> = frame
            .iter()
            .zip(&self.window)
            .map(|(s, w)| s * w)
            .collect();

        let range = MAX_DECIBELS - MIN_DECIBELS;
        let mut bytes = Vec::with_capacity(FREQUENCY_BIN_COUNT);
        for k in 0..FREQUENCY_BIN_COUNT {
            let mut re = 0.0;
            let mut im = 0.0;
            for (n, &x) in windowed.iter().enumerate() {
                let idx = (k * n) % FFT_SIZE;
                re += x * self.cos_table[idx];
                im -= x * self.sin_table[idx];
            }
            let magnitude = (re * re + im * im).sqrt() / FFT_SIZE as f64;

            let previous = state.smoothed[k];
            let mut smoothed =
                SMOOTHING_TIME_CONSTANT * previous + (1.0 - SMOOTHING_TIME_CONSTANT) * magnitude;
            if !smoothed.is_finite() {
                smoothed = 0.0;
            }
            state.smoothed[k] = smoothed;

            let byte = if smoothed > 0.0 {
                let db = 20.0 * smoothed.log10();
                (255.0 / range * (db - MIN_DECIBELS)).floor().clamp(0.0, 255.0) as u8
            } else {
                0
            };
            bytes.push(byte);
        }

        bytes
    }

    /// Mean bin value normalized to `[0, 1]`.
    pub fn level(&self) -> f32 {
        let bytes = self.byte_frequency_data();
        let sum: u32 = bytes.iter().map(|&b| b as u32).sum();
        sum as f32 / bytes.len() as f32 / 255.0
    }
}

impl std::fmt::Debug for SpectrumAnalyser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SpectrumAnalyser")
            .field("capture_samples", &state.capture.len())
            .field("playback_segments", &state.playback.len())
            .finish()
    }
}

/// Periodic level sampler.
///
/// Runs while capture or playback is active and stops once both are idle.
pub struct StatsMonitor {
    listeners: Arc<Listeners>,
    analyser: Arc<SpectrumAnalyser>,
    interval: Duration,
    threshold: f32,
    listening: AtomicBool,
    playing: AtomicBool,
    speaking: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StatsMonitor {
    pub fn new(
        listeners: Arc<Listeners>,
        analyser: Arc<SpectrumAnalyser>,
        interval: Duration,
        threshold: f32,
    ) -> Arc<Self> {
        Arc::new(Self {
            listeners,
            analyser,
            interval,
            threshold,
            listening: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            speaking: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    pub fn analyser(&self) -> &Arc<SpectrumAnalyser> {
        &self.analyser
    }

    pub fn set_listening(self: &Arc<Self>, listening: bool) {
        self.listening.store(listening, Ordering::SeqCst);
        self.refresh();
    }

    pub fn set_playing(self: &Arc<Self>, playing: bool) {
        self.playing.store(playing, Ordering::SeqCst);
        self.refresh();
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Take one sample without emitting it.
    pub fn sample(&self) -> AudioStats {
        let level = self.analyser.level();
        let is_speaking = level > self.threshold;
        if self.speaking.swap(is_speaking, Ordering::SeqCst) != is_speaking {
            tracing::debug!("Speech detection changed: speaking={}", is_speaking);
        }
        AudioStats {
            level,
            is_speaking,
            is_playback: Some(self.playing.load(Ordering::SeqCst)),
        }
    }

    fn refresh(self: &Arc<Self>) {
        let active = self.listening.load(Ordering::SeqCst) || self.playing.load(Ordering::SeqCst);
        let mut task = self.task.lock();

        if active {
            if task.as_ref().is_some_and(|t| !t.is_finished()) {
                return;
            }
            let monitor = Arc::downgrade(self);
            let period = self.interval;
            *task = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    let Some(monitor) = monitor.upgrade() else {
                        break;
                    };
                    let stats = monitor.sample();
                    monitor.listeners.emit_audio_stats(stats).await;
                }
            }));
            tracing::debug!("Audio stats monitoring started");
        } else if let Some(handle) = task.take() {
            handle.abort();
            self.speaking.store(false, Ordering::SeqCst);
            tracing::debug!("Audio stats monitoring stopped");
        }
    }
}

impl Drop for StatsMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for StatsMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsMonitor")
            .field("interval", &self.interval)
            .field("threshold", &self.threshold)
            .field("listening", &self.listening.load(Ordering::SeqCst))
            .field("playing", &self.playing.load(Ordering::SeqCst))
            .finish()
    }
}
