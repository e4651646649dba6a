pub mod base;
pub mod capture;
pub mod client;
pub mod codec;
pub mod handler;
pub mod listeners;
pub mod lookup;
pub mod messages;
pub mod outbound;
pub mod playback;
pub mod stats;

// Re-export commonly used types for convenience
pub use base::{
    AudioStats, AudioStatsCallback, ClientError, ClientResult, ConnectionState, DebugMessage,
    DebugMessageCallback, ErrorCallback, Mark, QueuedAudioItem, Session, StatusCallback,
};

pub use capture::{CaptureDevice, CapturePipeline, FrameSender, WavFileCapture};

pub use client::{VoiceClient, VoiceClientBuilder, handshake_parameters};

pub use codec::{
    CodecError, CodecResult, decode_pcm16_payload, downsample_buffer, encode_capture_frame,
    mulaw_decode, mulaw_encode,
};

pub use listeners::{EventKind, Listeners};

pub use lookup::{AgentEndpoint, AgentLookup, HttpAgentLookup, LookupRequest};

pub use messages::{ClientMessage, ServerEvent};

pub use playback::{
    NullSink, OutputClock, PlaybackScheduler, PlaybackSink, ScheduledBuffer, SchedulerConfig,
    WavFileSink,
};

pub use stats::{SpectrumAnalyser, StatsMonitor};
