//! Observer registry for session events.
//!
//! Each named event kind has one optional callback slot. Registration replaces
//! the previous callback. Emission clones the callback out of its slot before
//! awaiting, so no lock is held while user code runs.

use parking_lot::RwLock;

use super::base::{
    AudioStats, AudioStatsCallback, DebugMessage, DebugMessageCallback, ErrorCallback,
    StatusCallback,
};

/// Event kinds a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    Close,
    Error,
    ListeningStart,
    ListeningStop,
    PlaybackStart,
    PlaybackStop,
    AudioStats,
    DebugMessages,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Open => "open",
            EventKind::Close => "close",
            EventKind::Error => "error",
            EventKind::ListeningStart => "listening_start",
            EventKind::ListeningStop => "listening_stop",
            EventKind::PlaybackStart => "playback_start",
            EventKind::PlaybackStop => "playback_stop",
            EventKind::AudioStats => "audio_stats",
            EventKind::DebugMessages => "debug_messages",
        }
    }
}

/// Callback slots for every [`EventKind`].
#[derive(Default)]
pub struct Listeners {
    open: RwLock<Option<StatusCallback>>,
    close: RwLock<Option<StatusCallback>>,
    error: RwLock<Option<ErrorCallback>>,
    listening_start: RwLock<Option<StatusCallback>>,
    listening_stop: RwLock<Option<StatusCallback>>,
    playback_start: RwLock<Option<StatusCallback>>,
    playback_stop: RwLock<Option<StatusCallback>>,
    audio_stats: RwLock<Option<AudioStatsCallback>>,
    debug_messages: RwLock<Option<DebugMessageCallback>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    fn status_slot(&self, kind: EventKind) -> Option<&RwLock<Option<StatusCallback>>> {
        match kind {
            EventKind::Open => Some(&self.open),
            EventKind::Close => Some(&self.close),
            EventKind::ListeningStart => Some(&self.listening_start),
            EventKind::ListeningStop => Some(&self.listening_stop),
            EventKind::PlaybackStart => Some(&self.playback_start),
            EventKind::PlaybackStop => Some(&self.playback_stop),
            EventKind::Error | EventKind::AudioStats | EventKind::DebugMessages => None,
        }
    }

    /// Register a callback for a payload-free event kind.
    ///
    /// Returns false if `kind` carries a payload and needs a typed setter.
    pub fn set_status(&self, kind: EventKind, callback: StatusCallback) -> bool {
        match self.status_slot(kind) {
            Some(slot) => {
                *slot.write() = Some(callback);
                true
            }
            None => false,
        }
    }

    pub fn set_error(&self, callback: ErrorCallback) {
        *self.error.write() = Some(callback);
    }

    pub fn set_audio_stats(&self, callback: AudioStatsCallback) {
        *self.audio_stats.write() = Some(callback);
    }

    pub fn set_debug_messages(&self, callback: DebugMessageCallback) {
        *self.debug_messages.write() = Some(callback);
    }

    /// Remove the callback for `kind`.
    pub fn clear(&self, kind: EventKind) {
        match kind {
            EventKind::Error => *self.error.write() = None,
            EventKind::AudioStats => *self.audio_stats.write() = None,
            EventKind::DebugMessages => *self.debug_messages.write() = None,
            other => {
                if let Some(slot) = self.status_slot(other) {
                    *slot.write() = None;
                }
            }
        }
    }

    /// Fire a payload-free event.
    pub async fn emit(&self, kind: EventKind) {
        let callback = self.status_slot(kind).and_then(|slot| slot.read().clone());
        tracing::trace!("Emitting {} event", kind.as_str());
        if let Some(cb) = callback {
            cb().await;
        }
    }

    pub async fn emit_error(&self, message: String) {
        let callback = self.error.read().clone();
        if let Some(cb) = callback {
            cb(message).await;
        }
    }

    pub async fn emit_audio_stats(&self, stats: AudioStats) {
        let callback = self.audio_stats.read().clone();
        if let Some(cb) = callback {
            cb(stats).await;
        }
    }

    pub async fn emit_debug_messages(&self, messages: Vec<DebugMessage>) {
        let callback = self.debug_messages.read().clone();
        if let Some(cb) = callback {
            cb(messages).await;
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("open", &self.open.read().is_some())
            .field("close", &self.close.read().is_some())
            .field("error", &self.error.read().is_some())
            .field("audio_stats", &self.audio_stats.read().is_some())
            .field("debug_messages", &self.debug_messages.read().is_some())
            .finish_non_exhaustive()
    }
}
