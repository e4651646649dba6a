//! Send side of the live agent socket.
//!
//! The connection task owns the WebSocket sink and drains an mpsc channel.
//! Every component that emits frames holds an [`OutboundChannel`] clone and
//! pushes [`ClientMessage`]s into whichever channel is currently attached.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::base::{ClientError, ClientResult, Mark};
use super::messages::ClientMessage;

/// Channel capacity for WebSocket message sending.
pub const WS_CHANNEL_CAPACITY: usize = 256;

struct Link {
    generation: u64,
    stream_sid: String,
    tx: mpsc::Sender<ClientMessage>,
}

/// Cloneable handle onto the current connection's send queue.
#[derive(Clone, Default)]
pub struct OutboundChannel {
    link: Arc<RwLock<Option<Link>>>,
}

impl OutboundChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route subsequent sends to `tx`, replacing any previous connection.
    pub fn attach(&self, generation: u64, stream_sid: impl Into<String>, tx: mpsc::Sender<ClientMessage>) {
        *self.link.write() = Some(Link {
            generation,
            stream_sid: stream_sid.into(),
            tx,
        });
    }

    /// Drop the current connection.
    pub fn detach(&self) {
        *self.link.write() = None;
    }

    /// Drop the connection only if it still belongs to `generation`.
    pub fn detach_generation(&self, generation: u64) -> bool {
        let mut link = self.link.write();
        if link.as_ref().is_some_and(|l| l.generation == generation) {
            *link = None;
            true
        } else {
            false
        }
    }

    pub fn is_open(&self) -> bool {
        self.link.read().as_ref().is_some_and(|l| !l.tx.is_closed())
    }

    pub fn stream_sid(&self) -> Option<String> {
        self.link.read().as_ref().map(|l| l.stream_sid.clone())
    }

    /// Queue a frame on the live connection.
    pub async fn send(&self, message: ClientMessage) -> ClientResult<()> {
        let tx = match self.link.read().as_ref() {
            Some(link) => link.tx.clone(),
            None => return Err(ClientError::NotConnected),
        };

        tx.send(message)
            .await
            .map_err(|e| ClientError::WebSocketError(e.to_string()))
    }

    /// Queue a capture frame tagged with the current stream id.
    pub async fn send_media(&self, payload: String) -> ClientResult<()> {
        let stream_sid = self.stream_sid().ok_or(ClientError::NotConnected)?;
        self.send(ClientMessage::media(stream_sid, payload)).await
    }

    /// Queue a mark acknowledgment tagged with the current stream id.
    pub async fn send_mark(&self, mark: Mark) -> ClientResult<()> {
        let stream_sid = self.stream_sid().ok_or(ClientError::NotConnected)?;
        tracing::debug!("Sending mark acknowledgment: {}", mark.name);
        self.send(ClientMessage::mark(stream_sid, mark)).await
    }
}

impl std::fmt::Debug for OutboundChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let link = self.link.read();
        f.debug_struct("OutboundChannel")
            .field("generation", &link.as_ref().map(|l| l.generation))
            .field("stream_sid", &link.as_ref().map(|l| l.stream_sid.clone()))
            .finish()
    }
}
