//! In-process mock voice agent
//!
//! Accepts WebSocket connections on a loopback port, records every text frame
//! the client sends (parsed as JSON) per connection, and lets the test push
//! frames, close a connection, or drop its TCP stream from the server side.

// Allow dead code in test infrastructure - not every suite uses every helper
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Server-side action on one connection
enum Control {
    Frame(Message),
    /// Drop the TCP stream without a close frame
    Abort,
}

/// Frames recorded for one accepted connection
#[derive(Default)]
struct ConnectionRecord {
    frames: Vec<Value>,
    closed: bool,
    control: Option<mpsc::UnboundedSender<Control>>,
}

#[derive(Default)]
pub struct MockAgentState {
    connections: Mutex<Vec<ConnectionRecord>>,
}

pub struct MockAgent {
    addr: SocketAddr,
    state: Arc<MockAgentState>,
    handle: JoinHandle<()>,
}

impl MockAgent {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockAgentState::default());

        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        eprintln!("Mock agent connection error: {e}");
                    }
                });
            }
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.lock().len()
    }

    /// Frames received on connection `index` so far.
    pub fn frames(&self, index: usize) -> Vec<Value> {
        self.state
            .connections
            .lock()
            .get(index)
            .map(|c| c.frames.clone())
            .unwrap_or_default()
    }

    /// Frames on connection `index` whose `event` field equals `event`.
    pub fn events(&self, index: usize, event: &str) -> Vec<Value> {
        self.frames(index)
            .into_iter()
            .filter(|f| f["event"] == event)
            .collect()
    }

    pub fn is_closed(&self, index: usize) -> bool {
        self.state
            .connections
            .lock()
            .get(index)
            .map(|c| c.closed)
            .unwrap_or(false)
    }

    /// Push a JSON text frame to the client on connection `index`.
    pub fn send(&self, index: usize, frame: Value) {
        self.push(index, Control::Frame(Message::Text(frame.to_string().into())));
    }

    /// Close connection `index` from the server side.
    pub fn close(&self, index: usize) {
        self.push(index, Control::Frame(Message::Close(None)));
    }

    /// Drop connection `index` abruptly, as a network fault would.
    pub fn abort(&self, index: usize) {
        self.push(index, Control::Abort);
    }

    fn push(&self, index: usize, control_message: Control) {
        let connections = self.state.connections.lock();
        let control = connections
            .get(index)
            .and_then(|c| c.control.clone())
            .expect("no such connection");
        if control.send(control_message).is_err() {
            panic!("connection task ended");
        }
    }

    /// Poll until `condition` holds or `timeout` elapses.
    pub async fn wait_until<F>(&self, timeout: Duration, condition: F) -> bool
    where
        F: Fn(&MockAgent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for MockAgent {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<MockAgentState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Control>();

    let index = {
        let mut connections = state.connections.lock();
        connections.push(ConnectionRecord {
            control: Some(tx),
            ..Default::default()
        });
        connections.len() - 1
    };

    loop {
        tokio::select! {
            Some(control) = rx.recv() => {
                let Control::Frame(message) = control else {
                    break;
                };
                let closing = matches!(message, Message::Close(_));
                write.send(message).await?;
                if closing {
                    break;
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let value: Value = serde_json::from_str(&text)?;
                        state.connections.lock()[index].frames.push(value);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }

    let mut connections = state.connections.lock();
    connections[index].closed = true;
    connections[index].control = None;
    Ok(())
}
