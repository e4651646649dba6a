//! Base types shared by every part of the streaming core.
//!
//! This module defines the error taxonomy, the connection state machine, the
//! session data model and the callback types used by the observer interface.
//!
//! # Audio Format
//!
//! - Outbound: µ-law, 8-bit, mono, at the configured input rate (16kHz default)
//! - Inbound: PCM 16-bit signed little-endian, mono, at a fixed rate (24kHz default)

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::codec::CodecError;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while driving a voice session.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket could not be opened
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// WebSocket error on a live connection
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Agent endpoint lookup failed
    #[error("Agent lookup failed: {0}")]
    LookupFailed(String),

    /// Microphone access was refused
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Audio device failure other than a permission fault
    #[error("Audio device error: {0}")]
    DeviceError(String),

    /// Codec failure
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Malformed inbound frame
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

// =============================================================================
// Connection State
// =============================================================================

/// Connection state of the session socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No socket
    #[default]
    Disconnected,
    /// Endpoint resolution or socket open in progress
    Connecting,
    /// Socket open and handshake sent
    Connected,
}

impl ConnectionState {
    /// Whether a socket is open or being opened.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}

// =============================================================================
// Session Data Model
// =============================================================================

/// Identifiers and routing for one connect attempt.
///
/// A new `Session` with fresh UUIDs is created on every connect. Only the
/// agent target can change afterwards, and only through a redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub call_id: Uuid,
    pub stream_id: Uuid,
    pub agent_id: String,
    pub environment: Option<String>,
    pub custom_parameters: HashMap<String, String>,
}

impl Session {
    pub fn new(
        agent_id: impl Into<String>,
        environment: Option<String>,
        custom_parameters: HashMap<String, String>,
    ) -> Self {
        Self {
            call_id: Uuid::new_v4(),
            stream_id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            environment,
            custom_parameters,
        }
    }
}

/// Opaque timing checkpoint the peer expects echoed back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mark {
    pub name: String,
}

impl Mark {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// One entry of the playback queue.
///
/// An item with no samples and a mark is a pure timing signal.
#[derive(Debug, Clone)]
pub struct QueuedAudioItem {
    /// Samples in `[-1, 1]`
    pub samples: Arc<[f32]>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    pub mark: Option<Mark>,
}

impl QueuedAudioItem {
    pub fn audio(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            mark: None,
        }
    }

    pub fn mark(mark: Mark, sample_rate: u32) -> Self {
        Self {
            samples: Arc::from(Vec::new()),
            sample_rate,
            mark: Some(mark),
        }
    }

    /// True for a mark-only item.
    pub fn is_mark(&self) -> bool {
        self.mark.is_some() && self.samples.is_empty()
    }

    /// Playback duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Level telemetry emitted on every stats tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioStats {
    /// Normalized level in `[0, 1]`
    pub level: f32,
    pub is_speaking: bool,
    /// True when playback was active during the tick
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_playback: Option<bool>,
}

/// Debug trace forwarded by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugMessage {
    #[serde(rename = "type", default)]
    pub message_type: String,
    #[serde(default)]
    pub turn: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

// =============================================================================
// Callback Types
// =============================================================================

/// Callback type for state transitions that carry no payload.
pub type StatusCallback = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for connection errors.
pub type ErrorCallback =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for audio level telemetry.
pub type AudioStatsCallback =
    Arc<dyn Fn(AudioStats) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for debug history updates. Receives the full accumulated list.
pub type DebugMessageCallback =
    Arc<dyn Fn(Vec<DebugMessage>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;
