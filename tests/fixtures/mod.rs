//! Test Fixtures Module
//!
//! Programmatically generated audio, a recording playback sink and a capture
//! device that counts start/stop calls.

// Allow dead code in test fixtures - not every suite uses every helper
#![allow(dead_code)]

use std::collections::HashMap;
use std::f32::consts::PI;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use voicelink::core::codec::encode_pcm16_payload;
use voicelink::{
    AgentEndpoint, AgentLookup, CaptureDevice, ClientError, ClientResult, ErrorCallback,
    FrameSender, LookupRequest, OutputClock, PlaybackSink, ScheduledBuffer, StatusCallback,
};

/// Nominal rate of inbound agent audio
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Generate silence (zeros)
pub fn generate_silence(duration_samples: usize) -> Vec<i16> {
    vec![0i16; duration_samples]
}

/// Generate a sine wave tone as float samples
pub fn generate_sine(frequency: f32, sample_rate: u32, duration_samples: usize, amplitude: f32) -> Vec<f32> {
    (0..duration_samples)
        .map(|i| amplitude * (2.0 * PI * frequency * i as f32 / sample_rate as f32).sin())
        .collect()
}

/// Inbound `media` frame carrying PCM16 samples
pub fn media_frame(samples: &[i16]) -> Value {
    json!({
        "event": "media",
        "media": { "payload": encode_pcm16_payload(samples) }
    })
}

/// `media` frame with `ms` milliseconds of silence at the output rate
pub fn silence_frame(ms: u32) -> Value {
    media_frame(&generate_silence((OUTPUT_SAMPLE_RATE * ms / 1000) as usize))
}

pub fn mark_frame(name: &str) -> Value {
    json!({ "event": "mark", "mark": { "name": name } })
}

pub fn clear_frame() -> Value {
    json!({ "event": "clear" })
}

pub fn redirect_frame(agent_id: &str, environment: Option<&str>) -> Value {
    json!({
        "event": "control",
        "name": "redirect",
        "data": { "agentId": agent_id, "environment": environment }
    })
}

/// Status callback counting its invocations
pub fn counter() -> (Arc<AtomicUsize>, StatusCallback) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let callback: StatusCallback = Arc::new(move || {
        let c = c.clone();
        Box::pin(async move {
            c.fetch_add(1, Ordering::SeqCst);
        })
    });
    (count, callback)
}

/// Error callback recording every message
pub fn error_recorder() -> (Arc<Mutex<Vec<String>>>, ErrorCallback) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let e = errors.clone();
    let callback: ErrorCallback = Arc::new(move |message: String| {
        let e = e.clone();
        Box::pin(async move {
            e.lock().push(message);
        })
    });
    (errors, callback)
}

/// Lookup resolving a fixed set of agents; any other agent fails
#[derive(Default)]
pub struct StaticLookup {
    urls: HashMap<String, String>,
    calls: Mutex<Vec<String>>,
}

impl StaticLookup {
    pub fn new(urls: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            urls: urls
                .iter()
                .map(|(agent, url)| (agent.to_string(), url.to_string()))
                .collect(),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Agent ids looked up so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl AgentLookup for StaticLookup {
    async fn resolve(&self, request: &LookupRequest) -> ClientResult<AgentEndpoint> {
        self.calls.lock().push(request.agent_id.clone());
        match self.urls.get(&request.agent_id) {
            Some(url) => Ok(AgentEndpoint {
                url: url.clone(),
                parameters: HashMap::new(),
            }),
            None => Err(ClientError::LookupFailed(format!(
                "Unknown agent {}",
                request.agent_id
            ))),
        }
    }
}

/// Playback sink recording every scheduled buffer
#[derive(Default)]
pub struct RecordingSink {
    clock: OutputClock,
    scheduled: Mutex<Vec<ScheduledBuffer>>,
    stopped: Mutex<Vec<u64>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scheduled(&self) -> Vec<ScheduledBuffer> {
        self.scheduled.lock().clone()
    }

    pub fn stopped(&self) -> Vec<u64> {
        self.stopped.lock().clone()
    }
}

#[async_trait]
impl PlaybackSink for RecordingSink {
    fn current_time(&self) -> f64 {
        self.clock.now()
    }

    fn schedule(&self, buffer: ScheduledBuffer) -> ClientResult<()> {
        self.scheduled.lock().push(buffer);
        Ok(())
    }

    fn stop(&self, id: u64) {
        self.stopped.lock().push(id);
    }
}

/// Capture device that delivers a fixed set of frames on start
pub struct ScriptedDevice {
    sample_rate: u32,
    frames: Vec<Vec<f32>>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl ScriptedDevice {
    pub fn new(sample_rate: u32, frames: Vec<Vec<f32>>) -> Arc<Self> {
        Arc::new(Self {
            sample_rate,
            frames,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }

    /// Device at 48kHz delivering `count` frames of a 440Hz tone
    pub fn tone(count: usize) -> Arc<Self> {
        let frame = generate_sine(440.0, 48000, 384, 0.5);
        Self::new(48000, vec![frame; count])
    }
}

#[async_trait]
impl CaptureDevice for ScriptedDevice {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn start(&self, frames: FrameSender) -> ClientResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        for frame in &self.frames {
            // Nothing drains the channel until start returns
            if frames.try_send(frame.clone()).is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}
