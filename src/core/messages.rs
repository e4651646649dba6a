//! Agent socket message types.
//!
//! All frames are JSON text. The client opens every session with a `start`
//! handshake and then exchanges `event`-tagged messages.
//!
//! # Protocol Overview
//!
//! Client messages (sent to agent):
//! - start - Session handshake with identifiers and parameters
//! - media - One µ-law capture frame, base64-encoded
//! - mark - Acknowledgment that playback reached a mark
//! - text - Free text input
//!
//! Server events (received from agent):
//! - media - Base64 PCM16 speech audio
//! - clear - Flush queued audio, acknowledging pending marks
//! - mark - Timing checkpoint to acknowledge in playback order
//! - debug - Debug trace
//! - control - Control signal (`redirect`)

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::base::{ClientError, ClientResult, DebugMessage, Mark};

/// Control message name for the redirect sub-protocol.
pub const CONTROL_REDIRECT: &str = "redirect";

// =============================================================================
// Client Messages
// =============================================================================

/// Handshake payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    pub stream_sid: String,
    pub call_sid: String,
    pub custom_parameters: HashMap<String, String>,
}

/// Media payload shared by both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPayload {
    /// Base64 audio bytes
    #[serde(default)]
    pub payload: String,
}

/// Client events carrying an `event` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ClientEvent {
    /// Capture frame
    #[serde(rename_all = "camelCase")]
    Media {
        stream_sid: String,
        media: MediaPayload,
    },

    /// Mark acknowledgment
    #[serde(rename_all = "camelCase")]
    Mark { stream_sid: String, mark: Mark },

    /// Text input
    Text { text: String },
}

/// Any frame the client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientMessage {
    /// Session handshake
    Start { start: StartPayload },
    /// Tagged event
    Event(ClientEvent),
}

impl ClientMessage {
    pub fn start(
        stream_sid: impl Into<String>,
        call_sid: impl Into<String>,
        custom_parameters: HashMap<String, String>,
    ) -> Self {
        ClientMessage::Start {
            start: StartPayload {
                stream_sid: stream_sid.into(),
                call_sid: call_sid.into(),
                custom_parameters,
            },
        }
    }

    pub fn media(stream_sid: impl Into<String>, payload: String) -> Self {
        ClientMessage::Event(ClientEvent::Media {
            stream_sid: stream_sid.into(),
            media: MediaPayload { payload },
        })
    }

    pub fn mark(stream_sid: impl Into<String>, mark: Mark) -> Self {
        ClientMessage::Event(ClientEvent::Mark {
            stream_sid: stream_sid.into(),
            mark,
        })
    }

    pub fn text(text: impl Into<String>) -> Self {
        ClientMessage::Event(ClientEvent::Text { text: text.into() })
    }
}

// =============================================================================
// Server Events
// =============================================================================

/// Payload of a `redirect` control message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectData {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub redirect_id: Option<String>,
}

/// Events received from the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ServerEvent {
    /// Speech audio; frames without a payload are ignored
    Media {
        #[serde(default)]
        media: Option<MediaPayload>,
    },

    /// Flush queued audio
    Clear,

    /// Timing checkpoint
    Mark { mark: Mark },

    /// Debug trace
    Debug(DebugMessage),

    /// Control signal
    Control {
        #[serde(default)]
        name: String,
        #[serde(default)]
        data: serde_json::Value,
    },

    /// Unrecognized event
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Parse one inbound text frame.
    pub fn parse(text: &str) -> ClientResult<Self> {
        serde_json::from_str(text).map_err(|e| ClientError::ProtocolError(format!("{e} - {text}")))
    }

    /// Non-empty media payload, if any.
    pub fn media_payload(&self) -> Option<&str> {
        match self {
            ServerEvent::Media { media: Some(media) } if !media.payload.is_empty() => {
                Some(media.payload.as_str())
            }
            _ => None,
        }
    }

    /// Parse the redirect payload of a `control` event.
    pub fn redirect_data(&self) -> Option<RedirectData> {
        match self {
            ServerEvent::Control { name, data } if name == CONTROL_REDIRECT => {
                Some(serde_json::from_value(data.clone()).unwrap_or_default())
            }
            _ => None,
        }
    }
}
