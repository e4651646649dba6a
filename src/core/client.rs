//! Connection manager.
//!
//! [`VoiceClient`] owns the agent socket and composes capture, playback,
//! stats and control handling into one session. Each connect attempt gets a
//! generation number; socket tasks and reconnects that belong to an older
//! generation exit without touching client state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::base::{
    AudioStatsCallback, ClientError, ClientResult, ConnectionState, DebugMessage,
    DebugMessageCallback, ErrorCallback, Session, StatusCallback,
};
use super::capture::{CaptureDevice, CapturePipeline};
use super::handler::{ControlHandler, CurrentTarget, RedirectRequest};
use super::listeners::{EventKind, Listeners};
use super::lookup::{AgentEndpoint, AgentLookup, HttpAgentLookup, INPUT_TYPE_MIC, LookupRequest};
use super::messages::ClientMessage;
use super::outbound::{OutboundChannel, WS_CHANNEL_CAPACITY};
use super::playback::{NullSink, PlaybackScheduler, PlaybackSink};
use super::stats::{SpectrumAnalyser, StatsMonitor};
use crate::config::ClientConfig;
use crate::utils::validate_socket_url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handshake parameters: caller parameters, then lookup parameters, then the
/// fields the agent relies on.
pub fn handshake_parameters(
    config: &ClientConfig,
    endpoint: &AgentEndpoint,
) -> HashMap<String, String> {
    let mut parameters = config.custom_parameters.clone();
    parameters.extend(endpoint.parameters.clone());
    parameters.insert("agentId".to_string(), config.agent_id.clone());
    parameters.insert(
        "environment".to_string(),
        config.environment.clone().unwrap_or_default(),
    );
    parameters.insert("inputType".to_string(), INPUT_TYPE_MIC.to_string());
    parameters.insert("tracing".to_string(), config.tracing_enabled.to_string());
    parameters
}

struct Connection {
    generation: u64,
    cancel: CancellationToken,
}

struct ClientInner {
    config: RwLock<ClientConfig>,
    /// Target to restore on disconnect after a redirect
    original_target: Mutex<Option<(String, Option<String>)>>,
    state: RwLock<ConnectionState>,
    session: RwLock<Option<Session>>,
    generation: AtomicU64,
    connection: Mutex<Option<Connection>>,
    outbound: OutboundChannel,
    listeners: Arc<Listeners>,
    sink: Arc<dyn PlaybackSink>,
    lookup: Arc<dyn AgentLookup>,
    stats: Arc<StatsMonitor>,
    scheduler: PlaybackScheduler,
    capture: CapturePipeline,
    handler: ControlHandler,
}

impl ClientInner {
    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn current_target(&self) -> CurrentTarget {
        let config = self.config.read();
        CurrentTarget {
            agent_id: config.agent_id.clone(),
            environment: config.environment.clone(),
            state: self.state(),
        }
    }

    /// Cancel the socket task and detach the send channel.
    fn cancel_connection(&self) {
        if let Some(connection) = self.connection.lock().take() {
            tracing::debug!("Closing connection generation {}", connection.generation);
            connection.cancel.cancel();
        }
        self.outbound.detach();
    }

    /// Invalidate the current attempt and close its socket.
    ///
    /// Returns whether a socket was open or opening.
    fn close_connection(&self) -> bool {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel_connection();
        let mut state = self.state.write();
        let was_active = state.is_active();
        *state = ConnectionState::Disconnected;
        was_active
    }

    fn connect_internal(self: &Arc<Self>) -> BoxFuture<'_, ClientResult<()>> {
        async move {
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            self.cancel_connection();
            *self.state.write() = ConnectionState::Connecting;

            let config = self.config.read().clone();
            let session = Session::new(
                config.agent_id.clone(),
                config.environment.clone(),
                config.custom_parameters.clone(),
            );
            *self.session.write() = Some(session.clone());
            self.handler.reset_debug_messages().await;

            match self.open_socket(generation, &config, &session).await {
                Ok(()) => {
                    tracing::info!(
                        "Connected to agent {} (call {})",
                        session.agent_id,
                        session.call_id
                    );
                    self.listeners.emit(EventKind::Open).await;
                    Ok(())
                }
                Err(e) => {
                    if self.generation.load(Ordering::SeqCst) == generation {
                        *self.state.write() = ConnectionState::Disconnected;
                    }
                    tracing::error!("Failed to connect: {}", e);
                    Err(e)
                }
            }
        }
        .boxed()
    }

    async fn resolve_endpoint(&self, config: &ClientConfig) -> ClientResult<AgentEndpoint> {
        if let Some(url) = &config.server_url {
            return Ok(AgentEndpoint {
                url: url.clone(),
                parameters: HashMap::new(),
            });
        }

        self.lookup
            .resolve(&LookupRequest {
                agent_id: config.agent_id.clone(),
                environment: config.environment.clone(),
                custom_parameters: config.custom_parameters.clone(),
                experimental: config.experimental,
            })
            .await
    }

    async fn open_socket(
        self: &Arc<Self>,
        generation: u64,
        config: &ClientConfig,
        session: &Session,
    ) -> ClientResult<()> {
        let endpoint = self.resolve_endpoint(config).await?;
        let url = validate_socket_url(&endpoint.url).map_err(|e| {
            ClientError::ConnectionFailed(format!("Invalid socket URL {}: {e}", endpoint.url))
        })?;

        tracing::info!("Connecting to {}", url);
        let (ws_stream, _response) = tokio::time::timeout(
            config.connect_timeout(),
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| ClientError::Timeout(format!("Connecting to {url}")))?
        .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;

        let (mut ws_sink, ws_stream) = ws_stream.split();

        let stream_sid = session.stream_id.to_string();
        let handshake = ClientMessage::start(
            stream_sid.clone(),
            session.call_id.to_string(),
            handshake_parameters(config, &endpoint),
        );
        let json = serde_json::to_string(&handshake)
            .map_err(|e| ClientError::SerializationError(e.to_string()))?;
        ws_sink
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| ClientError::WebSocketError(format!("Failed to send handshake: {e}")))?;
        tracing::debug!("Handshake sent for stream {}", stream_sid);

        let (tx, rx) = mpsc::channel::<ClientMessage>(WS_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();
        let cancel = CancellationToken::new();
        tokio::spawn(run_socket(ws_sink, ws_stream, rx, inbound_tx, cancel.clone()));
        tokio::spawn(dispatch_inbound(
            Arc::downgrade(self),
            generation,
            inbound_rx,
            cancel.clone(),
        ));

        let mut connection = self.connection.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            cancel.cancel();
            return Err(ClientError::ConnectionFailed(
                "Connection attempt was superseded".to_string(),
            ));
        }
        *connection = Some(Connection { generation, cancel });
        self.outbound.attach(generation, stream_sid, tx);
        *self.state.write() = ConnectionState::Connected;
        Ok(())
    }

    async fn handle_inbound(self: &Arc<Self>, generation: u64, text: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let target = self.current_target();
        if let Some(request) = self.handler.handle_text(text, &target).await {
            self.redirect(request).await;
        }
    }

    async fn redirect(self: &Arc<Self>, request: RedirectRequest) {
        self.capture.stop().await;
        self.scheduler.flush().await;
        let was_active = self.close_connection();
        let generation = self.generation.load(Ordering::SeqCst);

        {
            let mut config = self.config.write();
            let mut original = self.original_target.lock();
            if original.is_none() {
                *original = Some((config.agent_id.clone(), config.environment.clone()));
            }
            config.agent_id = request.agent_id;
            config.environment = request.environment;
        }

        if was_active {
            self.listeners.emit(EventKind::Close).await;
        }

        let inner = self.clone();
        tokio::spawn(async move {
            if inner.generation.load(Ordering::SeqCst) != generation {
                tracing::debug!("Redirect reconnect cancelled");
                return;
            }
            if let Err(e) = inner.connect_internal().await {
                tracing::error!("Reconnect after redirect failed: {}", e);
                return;
            }
            if let Err(e) = inner.start_listening().await {
                tracing::error!("Failed to resume listening after redirect: {}", e);
            }
        });
    }

    /// Socket closed by the peer or failed.
    async fn handle_remote_close(&self, generation: u64, error: Option<String>) {
        let current = {
            let mut connection = self.connection.lock();
            if connection.as_ref().map(|c| c.generation) == Some(generation) {
                connection.take();
                true
            } else {
                false
            }
        };
        if !current {
            return;
        }

        self.outbound.detach_generation(generation);
        *self.state.write() = ConnectionState::Disconnected;
        tracing::info!("Agent socket closed");

        if let Some(message) = error {
            self.listeners.emit_error(message).await;
        }
        self.listeners.emit(EventKind::Close).await;
        self.capture.stop().await;
    }

    async fn start_listening(&self) -> ClientResult<()> {
        if self.state() != ConnectionState::Connected {
            tracing::debug!("Not connected, ignoring start listening");
            return Ok(());
        }
        self.sink.resume().await?;
        self.capture.start().await
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            connection.cancel.cancel();
        }
    }
}

/// Events forwarded from the socket task to the dispatch task.
enum Inbound {
    Text(String),
    /// Peer closed the socket, with the failure message if it broke.
    Closed(Option<String>),
}

/// Owns the socket. Inbound frames are forwarded without waiting on their
/// handling so the outbound channel is always drained.
async fn run_socket(
    mut ws_sink: SplitSink<WsStream, Message>,
    mut ws_stream: SplitStream<WsStream>,
    mut rx: mpsc::Receiver<ClientMessage>,
    inbound: mpsc::UnboundedSender<Inbound>,
    cancel: CancellationToken,
) {
    let mut failure: Option<String> = None;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                if let Err(e) = ws_sink.send(Message::Close(None)).await {
                    tracing::debug!("Failed to send close frame: {}", e);
                }
                return;
            }

            Some(message) = rx.recv() => {
                let json = match serde_json::to_string(&message) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };

                if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    failure = Some(format!("Failed to send WebSocket message: {e}"));
                    break;
                }
            }

            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if inbound.send(Inbound::Text(text.as_str().to_owned())).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                            tracing::error!("Failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!("WebSocket closed by agent: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        failure = Some(format!("WebSocket error: {e}"));
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    if !cancel.is_cancelled() {
        let _ = inbound.send(Inbound::Closed(failure));
    }
}

/// Runs the control handler and user callbacks for one connection, in frame
/// order. The close notice is queued behind every frame received before it.
async fn dispatch_inbound(
    inner: Weak<ClientInner>,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = inbound.recv() => event,
        };
        let Some(event) = event else {
            return;
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            Inbound::Text(text) => inner.handle_inbound(generation, &text).await,
            Inbound::Closed(failure) => {
                inner.handle_remote_close(generation, failure).await;
                return;
            }
        }
    }
}

/// Builder for [`VoiceClient`].
pub struct VoiceClientBuilder {
    config: ClientConfig,
    capture: Option<Arc<dyn CaptureDevice>>,
    sink: Option<Arc<dyn PlaybackSink>>,
    lookup: Option<Arc<dyn AgentLookup>>,
}

impl VoiceClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            capture: None,
            sink: None,
            lookup: None,
        }
    }

    /// Microphone source. Required.
    pub fn capture_device(mut self, device: Arc<dyn CaptureDevice>) -> Self {
        self.capture = Some(device);
        self
    }

    /// Output device. Defaults to a [`NullSink`].
    pub fn playback_sink(mut self, sink: Arc<dyn PlaybackSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Endpoint resolver. Defaults to [`HttpAgentLookup`] against `api_url`.
    pub fn lookup(mut self, lookup: Arc<dyn AgentLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn build(self) -> ClientResult<VoiceClient> {
        let config = self.config;
        config.validate()?;

        let device = self.capture.ok_or_else(|| {
            ClientError::InvalidConfiguration("a capture device is required".to_string())
        })?;
        let sink: Arc<dyn PlaybackSink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(NullSink::new()),
        };
        let lookup: Arc<dyn AgentLookup> = match self.lookup {
            Some(lookup) => lookup,
            None => Arc::new(HttpAgentLookup::with_timeout(
                config.api_url.clone(),
                config.connect_timeout(),
            )?),
        };

        let listeners = Arc::new(Listeners::new());
        let outbound = OutboundChannel::new();
        let stats = StatsMonitor::new(
            listeners.clone(),
            Arc::new(SpectrumAnalyser::new(sink.clone())),
            config.stats_interval(),
            config.audio.speaking_threshold,
        );
        let scheduler = PlaybackScheduler::new(
            sink.clone(),
            outbound.clone(),
            listeners.clone(),
            stats.clone(),
            config.scheduler_config(),
        );
        let capture = CapturePipeline::new(
            device,
            outbound.clone(),
            listeners.clone(),
            stats.clone(),
            config.audio.input_sample_rate,
        );
        let handler = ControlHandler::new(
            scheduler.clone(),
            listeners.clone(),
            config.audio.output_sample_rate,
        );

        Ok(VoiceClient {
            inner: Arc::new(ClientInner {
                config: RwLock::new(config),
                original_target: Mutex::new(None),
                state: RwLock::new(ConnectionState::Disconnected),
                session: RwLock::new(None),
                generation: AtomicU64::new(0),
                connection: Mutex::new(None),
                outbound,
                listeners,
                sink,
                lookup,
                stats,
                scheduler,
                capture,
                handler,
            }),
        })
    }
}

/// Real-time voice session with a remote agent.
///
/// # Example
/// ```rust,no_run
/// use std::sync::Arc;
/// use voicelink::config::ClientConfig;
/// use voicelink::core::{VoiceClient, WavFileCapture};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let device = Arc::new(WavFileCapture::open("question.wav")?);
/// let client = VoiceClient::builder(ClientConfig::new("agent-123"))
///     .capture_device(device)
///     .build()?;
///
/// client.on_open(Arc::new(|| Box::pin(async { println!("connected") })));
/// client.connect().await?;
/// client.start_listening().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct VoiceClient {
    inner: Arc<ClientInner>,
}

impl VoiceClient {
    pub fn builder(config: ClientConfig) -> VoiceClientBuilder {
        VoiceClientBuilder::new(config)
    }

    pub fn new(config: ClientConfig, device: Arc<dyn CaptureDevice>) -> ClientResult<Self> {
        Self::builder(config).capture_device(device).build()
    }

    /// Open a new session. No-op if a socket is already open or opening.
    pub async fn connect(&self) -> ClientResult<()> {
        {
            let mut state = self.inner.state.write();
            if state.is_active() {
                tracing::debug!("Already {}, ignoring connect", *state);
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }
        self.inner.handler.reset_redirects();
        self.inner.connect_internal().await
    }

    /// Stop capture, drop queued playback and close the socket.
    ///
    /// A redirected session returns to its original target.
    pub async fn disconnect(&self) {
        self.inner.capture.stop().await;
        self.inner.scheduler.flush().await;
        let was_active = self.inner.close_connection();

        if let Some((agent_id, environment)) = self.inner.original_target.lock().take() {
            let mut config = self.inner.config.write();
            tracing::info!("Restoring original agent {}", agent_id);
            config.agent_id = agent_id;
            config.environment = environment;
        }

        if was_active {
            tracing::info!("Disconnected");
            self.inner.listeners.emit(EventKind::Close).await;
        }
    }

    /// Start streaming the microphone. No-op unless connected.
    pub async fn start_listening(&self) -> ClientResult<()> {
        self.inner.start_listening().await
    }

    /// Stop streaming the microphone. No-op if not listening.
    pub async fn stop_listening(&self) {
        self.inner.capture.stop().await;
    }

    pub async fn send_text_event(&self, text: impl Into<String>) -> ClientResult<()> {
        self.inner.outbound.send(ClientMessage::text(text)).await
    }

    /// Point later connects at a different agent.
    pub fn update_target(&self, agent_id: impl Into<String>, environment: Option<String>) {
        let mut config = self.inner.config.write();
        config.agent_id = agent_id.into();
        config.environment = environment;
        self.inner.original_target.lock().take();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state() == ConnectionState::Connected
    }

    pub fn is_listening(&self) -> bool {
        self.inner.capture.is_listening()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.scheduler.is_playing()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.session.read().clone()
    }

    pub fn debug_messages(&self) -> Vec<DebugMessage> {
        self.inner.handler.debug_messages()
    }

    /// Current normalized audio level in `[0, 1]`.
    pub fn audio_level(&self) -> f32 {
        self.inner.stats.analyser().level()
    }

    pub fn config(&self) -> ClientConfig {
        self.inner.config.read().clone()
    }

    pub fn on_open(&self, callback: StatusCallback) {
        self.inner.listeners.set_status(EventKind::Open, callback);
    }

    pub fn on_close(&self, callback: StatusCallback) {
        self.inner.listeners.set_status(EventKind::Close, callback);
    }

    pub fn on_error(&self, callback: ErrorCallback) {
        self.inner.listeners.set_error(callback);
    }

    pub fn on_listening_start(&self, callback: StatusCallback) {
        self.inner
            .listeners
            .set_status(EventKind::ListeningStart, callback);
    }

    pub fn on_listening_stop(&self, callback: StatusCallback) {
        self.inner
            .listeners
            .set_status(EventKind::ListeningStop, callback);
    }

    pub fn on_playback_start(&self, callback: StatusCallback) {
        self.inner
            .listeners
            .set_status(EventKind::PlaybackStart, callback);
    }

    pub fn on_playback_stop(&self, callback: StatusCallback) {
        self.inner
            .listeners
            .set_status(EventKind::PlaybackStop, callback);
    }

    pub fn on_audio_stats(&self, callback: AudioStatsCallback) {
        self.inner.listeners.set_audio_stats(callback);
    }

    pub fn on_debug_messages(&self, callback: DebugMessageCallback) {
        self.inner.listeners.set_debug_messages(callback);
    }
}

impl std::fmt::Debug for VoiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceClient")
            .field("agent_id", &self.inner.config.read().agent_id)
            .field("state", &self.inner.state())
            .field("listening", &self.is_listening())
            .field("playing", &self.is_playing())
            .finish()
    }
}
