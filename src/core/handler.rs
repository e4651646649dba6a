//! Inbound message dispatch.
//!
//! Audio, clear and mark events go to the playback scheduler. Debug traces are
//! accumulated and republished in full. A `redirect` control message is
//! checked against the idempotence rules here; executing it is up to the
//! connection manager, which owns the socket.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use super::base::{ConnectionState, DebugMessage, QueuedAudioItem};
use super::codec::decode_pcm16_payload;
use super::listeners::Listeners;
use super::messages::{RedirectData, ServerEvent};
use super::playback::PlaybackScheduler;

/// Destination the session is currently bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentTarget {
    pub agent_id: String,
    pub environment: Option<String>,
    pub state: ConnectionState,
}

impl CurrentTarget {
    fn key(&self) -> (String, String) {
        (
            self.agent_id.clone(),
            self.environment.clone().unwrap_or_default(),
        )
    }
}

/// Accepted redirect the connection manager must carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectRequest {
    pub agent_id: String,
    pub environment: Option<String>,
}

#[derive(Debug, Default)]
struct RedirectGuard {
    last_applied: Option<(String, String)>,
    seen_ids: HashSet<String>,
}

/// Control-message handler for one client.
pub struct ControlHandler {
    scheduler: PlaybackScheduler,
    listeners: Arc<Listeners>,
    output_sample_rate: u32,
    debug_history: Mutex<Vec<DebugMessage>>,
    redirects: Mutex<RedirectGuard>,
}

impl ControlHandler {
    pub fn new(scheduler: PlaybackScheduler, listeners: Arc<Listeners>, output_sample_rate: u32) -> Self {
        Self {
            scheduler,
            listeners,
            output_sample_rate,
            debug_history: Mutex::new(Vec::new()),
            redirects: Mutex::new(RedirectGuard::default()),
        }
    }

    /// Snapshot of the debug history.
    pub fn debug_messages(&self) -> Vec<DebugMessage> {
        self.debug_history.lock().clone()
    }

    /// Discard the debug history and publish the empty list.
    pub async fn reset_debug_messages(&self) {
        self.debug_history.lock().clear();
        self.listeners.emit_debug_messages(Vec::new()).await;
    }

    /// Forget applied redirect keys and seen redirect ids.
    pub fn reset_redirects(&self) {
        *self.redirects.lock() = RedirectGuard::default();
    }

    /// Parse and dispatch one text frame. Malformed frames are dropped.
    pub async fn handle_text(&self, text: &str, target: &CurrentTarget) -> Option<RedirectRequest> {
        match ServerEvent::parse(text) {
            Ok(event) => self.handle_event(event, target).await,
            Err(e) => {
                tracing::warn!("Dropping server event: {}", e);
                None
            }
        }
    }

    pub async fn handle_event(&self, event: ServerEvent, target: &CurrentTarget) -> Option<RedirectRequest> {
        match &event {
            ServerEvent::Media { .. } => {
                let payload = event.media_payload()?;
                match decode_pcm16_payload(payload) {
                    Ok(samples) => {
                        tracing::debug!("Received {} playback samples", samples.len());
                        self.scheduler
                            .enqueue(QueuedAudioItem::audio(samples, self.output_sample_rate))
                            .await;
                    }
                    Err(e) => tracing::warn!("Dropping media frame: {}", e),
                }
                None
            }
            ServerEvent::Clear => {
                tracing::info!("Received clear message");
                self.scheduler.clear().await;
                None
            }
            ServerEvent::Mark { mark } => {
                tracing::info!("Received mark event: {}", mark.name);
                self.scheduler
                    .enqueue(QueuedAudioItem::mark(mark.clone(), self.output_sample_rate))
                    .await;
                None
            }
            ServerEvent::Debug(message) => {
                tracing::info!("Received debug message: {} ({})", message.name, message.message_type);
                let history = {
                    let mut history = self.debug_history.lock();
                    history.push(message.clone());
                    history.clone()
                };
                self.listeners.emit_debug_messages(history).await;
                None
            }
            ServerEvent::Control { name, .. } => match event.redirect_data() {
                Some(data) => self.evaluate_redirect(data, target),
                None => {
                    tracing::info!("Ignoring control message: {}", name);
                    None
                }
            },
            ServerEvent::Unknown => {
                tracing::debug!("Ignoring unknown server event");
                None
            }
        }
    }

    fn evaluate_redirect(&self, data: RedirectData, target: &CurrentTarget) -> Option<RedirectRequest> {
        let Some(agent_id) = data.agent_id.filter(|id| !id.is_empty()) else {
            tracing::warn!("Ignoring redirect without agentId");
            return None;
        };
        let environment = data
            .environment
            .filter(|env| !env.is_empty())
            .or_else(|| target.environment.clone());
        let key = (agent_id.clone(), environment.clone().unwrap_or_default());

        let mut guard = self.redirects.lock();

        if let Some(redirect_id) = data.redirect_id {
            if !guard.seen_ids.insert(redirect_id.clone()) {
                tracing::debug!("Skipping already seen redirect {}", redirect_id);
                return None;
            }
        }

        if target.state.is_active() && target.key() == key {
            tracing::debug!("Skipping redirect to current target {}", agent_id);
            return None;
        }

        if guard.last_applied.as_ref() == Some(&key) {
            tracing::debug!("Skipping repeated redirect to {}", agent_id);
            return None;
        }

        guard.last_applied = Some(key);
        tracing::info!(
            "Redirecting to agent {} (environment: {})",
            agent_id,
            environment.as_deref().unwrap_or("")
        );
        Some(RedirectRequest {
            agent_id,
            environment,
        })
    }
}

impl std::fmt::Debug for ControlHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlHandler")
            .field("output_sample_rate", &self.output_sample_rate)
            .field("debug_messages", &self.debug_history.lock().len())
            .field("redirects", &*self.redirects.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::encode_pcm16_payload;
    use crate::core::outbound::OutboundChannel;
    use crate::core::playback::{NullSink, SchedulerConfig};
    use crate::core::stats::{
        DEFAULT_SPEAKING_THRESHOLD, DEFAULT_STATS_INTERVAL, SpectrumAnalyser, StatsMonitor,
    };

    fn handler() -> (ControlHandler, PlaybackScheduler, Arc<Listeners>) {
        let sink = Arc::new(NullSink::new());
        let listeners = Arc::new(Listeners::new());
        let stats = StatsMonitor::new(
            listeners.clone(),
            Arc::new(SpectrumAnalyser::new(sink.clone())),
            DEFAULT_STATS_INTERVAL,
            DEFAULT_SPEAKING_THRESHOLD,
        );
        let scheduler = PlaybackScheduler::new(
            sink,
            OutboundChannel::new(),
            listeners.clone(),
            stats,
            SchedulerConfig::default(),
        );
        (
            ControlHandler::new(scheduler.clone(), listeners.clone(), 24000),
            scheduler,
            listeners,
        )
    }

    fn target(agent: &str, state: ConnectionState) -> CurrentTarget {
        CurrentTarget {
            agent_id: agent.to_string(),
            environment: None,
            state,
        }
    }

    fn redirect(agent: &str, env: Option<&str>, id: Option<&str>) -> String {
        serde_json::json!({
            "event": "control",
            "name": "redirect",
            "data": { "agentId": agent, "environment": env, "redirectId": id }
        })
        .to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_is_queued_at_output_rate() {
        let (handler, scheduler, _) = handler();
        let payload = encode_pcm16_payload(&vec![0i16; 2400]);
        let text = format!(r#"{{"event":"media","media":{{"payload":"{payload}"}}}}"#);
        let target = target("a", ConnectionState::Connected);

        assert!(handler.handle_text(&text, &target).await.is_none());
        assert_eq!(scheduler.queued_len(), 1);
        assert!((scheduler.buffered_secs() - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let (handler, scheduler, _) = handler();
        let target = target("a", ConnectionState::Connected);

        assert!(handler.handle_text("not json", &target).await.is_none());
        assert!(
            handler
                .handle_text(r#"{"event":"media","media":{"payload":"%%%"}}"#, &target)
                .await
                .is_none()
        );
        assert!(handler.handle_text(r#"{"event":"media"}"#, &target).await.is_none());
        assert_eq!(scheduler.queued_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_is_queued_in_order() {
        let (handler, scheduler, _) = handler();
        let target = target("a", ConnectionState::Connected);
        let payload = encode_pcm16_payload(&vec![0i16; 2400]);
        handler
            .handle_text(&format!(r#"{{"event":"media","media":{{"payload":"{payload}"}}}}"#), &target)
            .await;
        handler
            .handle_text(r#"{"event":"mark","mark":{"name":"m1"}}"#, &target)
            .await;
        assert_eq!(scheduler.queued_len(), 2);

        handler.handle_text(r#"{"event":"clear"}"#, &target).await;
        assert_eq!(scheduler.queued_len(), 0);
    }

    #[tokio::test]
    async fn test_debug_history_accumulates() {
        let (handler, _, listeners) = handler();
        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = published.clone();
        listeners.set_debug_messages(Arc::new(move |messages: Vec<DebugMessage>| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().push(messages.len());
            })
        }));
        let target = target("a", ConnectionState::Connected);

        for turn in 0..3 {
            let text = format!(r#"{{"event":"debug","type":"t","turn":{turn},"name":"n","data":{{}}}}"#);
            handler.handle_text(&text, &target).await;
        }
        assert_eq!(*published.lock(), vec![1, 2, 3]);
        assert_eq!(handler.debug_messages()[2].turn, 2);

        handler.reset_debug_messages().await;
        assert!(handler.debug_messages().is_empty());
        assert_eq!(published.lock().last(), Some(&0));
    }

    #[tokio::test]
    async fn test_identical_redirects_apply_once() {
        let (handler, _, _) = handler();
        let current = target("a", ConnectionState::Connected);

        let first = handler.handle_text(&redirect("b", None, None), &current).await;
        assert_eq!(
            first,
            Some(RedirectRequest {
                agent_id: "b".to_string(),
                environment: None
            })
        );

        let connecting = target("b", ConnectionState::Connecting);
        assert!(handler.handle_text(&redirect("b", None, None), &connecting).await.is_none());
        // Still the last applied key even once the socket is gone
        let closed = target("b", ConnectionState::Disconnected);
        assert!(handler.handle_text(&redirect("b", None, None), &closed).await.is_none());
    }

    #[tokio::test]
    async fn test_redirect_to_current_target_is_skipped() {
        let (handler, _, _) = handler();
        let current = target("a", ConnectionState::Connected);
        assert!(handler.handle_text(&redirect("a", None, None), &current).await.is_none());
        let current = target("a", ConnectionState::Disconnected);
        assert!(handler.handle_text(&redirect("a", None, None), &current).await.is_some());
    }

    #[tokio::test]
    async fn test_redirect_ids_are_deduplicated() {
        let (handler, _, _) = handler();
        let current = target("a", ConnectionState::Connected);

        assert!(handler.handle_text(&redirect("b", None, Some("r1")), &current).await.is_some());
        let back = target("b", ConnectionState::Connected);
        assert!(handler.handle_text(&redirect("a", None, Some("r1")), &back).await.is_none());
        assert!(handler.handle_text(&redirect("a", None, Some("r2")), &back).await.is_some());
    }

    #[tokio::test]
    async fn test_redirect_environment_defaults_to_current() {
        let (handler, _, _) = handler();
        let current = CurrentTarget {
            agent_id: "a".to_string(),
            environment: Some("staging".to_string()),
            state: ConnectionState::Connected,
        };
        let request = handler.handle_text(&redirect("b", None, None), &current).await.unwrap();
        assert_eq!(request.environment.as_deref(), Some("staging"));

        let request = handler
            .handle_text(&redirect("c", Some("prod"), None), &current)
            .await
            .unwrap();
        assert_eq!(request.environment.as_deref(), Some("prod"));
    }

    #[tokio::test]
    async fn test_invalid_redirects_are_ignored() {
        let (handler, _, _) = handler();
        let current = target("a", ConnectionState::Connected);
        assert!(handler.handle_text(&redirect("", None, None), &current).await.is_none());
        assert!(
            handler
                .handle_text(r#"{"event":"control","name":"redirect"}"#, &current)
                .await
                .is_none()
        );
        assert!(
            handler
                .handle_text(r#"{"event":"control","name":"pause","data":{"agentId":"b"}}"#, &current)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_reset_redirects_allows_reapply() {
        let (handler, _, _) = handler();
        let current = target("a", ConnectionState::Disconnected);
        assert!(handler.handle_text(&redirect("b", None, Some("r")), &current).await.is_some());
        handler.reset_redirects();
        assert!(handler.handle_text(&redirect("b", None, Some("r")), &current).await.is_some());
    }
}
