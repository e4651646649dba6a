//! Redirect sub-protocol end to end
//!
//! The mock agent issues `control`/`redirect` frames; the client must tear
//! down and reconnect exactly once per new target and return to its original
//! target on disconnect.

mod fixtures;
mod mock_agent;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;

use fixtures::{RecordingSink, ScriptedDevice, StaticLookup, counter, redirect_frame};
use mock_agent::MockAgent;
use voicelink::{ClientConfig, ConnectionState, VoiceClient};

const WAIT: Duration = Duration::from_secs(3);

fn client_for(agent: &MockAgent, device: Arc<ScriptedDevice>) -> VoiceClient {
    let mut config = ClientConfig::new("agent-1");
    config.server_url = Some(agent.url());
    VoiceClient::builder(config)
        .capture_device(device)
        .playback_sink(RecordingSink::new())
        .build()
        .unwrap()
}

fn handshake_agent(agent: &MockAgent, index: usize) -> Option<String> {
    agent
        .frames(index)
        .first()
        .and_then(|f| f["start"]["customParameters"]["agentId"].as_str().map(String::from))
}

#[tokio::test]
async fn test_identical_redirects_reconnect_once() {
    let agent = MockAgent::start().await;
    let client = client_for(&agent, ScriptedDevice::new(48000, vec![]));
    let (opens, on_open) = counter();
    let (closes, on_close) = counter();
    client.on_open(on_open);
    client.on_close(on_close);

    client.connect().await.unwrap();
    agent.send(0, redirect_frame("agent-2", None));
    agent.send(0, redirect_frame("agent-2", None));

    assert!(
        agent
            .wait_until(WAIT, |a| handshake_agent(a, 1).as_deref() == Some("agent-2"))
            .await
    );
    let client_ref = &client;
    assert!(agent.wait_until(WAIT, |_| client_ref.is_connected()).await);

    // Same target again on the new socket
    agent.send(1, redirect_frame("agent-2", None));
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(agent.connection_count(), 2);
    assert!(agent.is_closed(0));
    assert_eq!(opens.load(Ordering::SeqCst), 2);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(client.config().agent_id, "agent-2");

    client.disconnect().await;
}

#[tokio::test]
async fn test_redirect_resumes_listening() {
    let agent = MockAgent::start().await;
    let device = ScriptedDevice::tone(2);
    let client = client_for(&agent, device.clone());

    client.connect().await.unwrap();
    client.start_listening().await.unwrap();
    agent.send(0, redirect_frame("agent-2", Some("staging")));

    let client_ref = &client;
    assert!(
        agent
            .wait_until(WAIT, |a| a.connection_count() == 2 && client_ref.is_listening())
            .await
    );
    assert_eq!(device.starts.load(Ordering::SeqCst), 2);
    assert_eq!(device.stops.load(Ordering::SeqCst), 1);

    // Audio after the redirect goes out on the new stream
    assert!(agent.wait_until(WAIT, |a| a.events(1, "media").len() == 2).await);
    let stream_id = client.session().unwrap().stream_id.to_string();
    assert_eq!(agent.events(1, "media")[0]["streamSid"], stream_id);

    let frames = agent.frames(1);
    assert_eq!(frames[0]["start"]["customParameters"]["environment"], "staging");

    client.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_restores_original_target() {
    let agent = MockAgent::start().await;
    let client = client_for(&agent, ScriptedDevice::new(48000, vec![]));

    client.connect().await.unwrap();
    agent.send(0, redirect_frame("agent-2", None));
    assert!(agent.wait_until(WAIT, |a| a.connection_count() == 2).await);
    let client_ref = &client;
    assert!(agent.wait_until(WAIT, |_| client_ref.is_connected()).await);
    assert_eq!(client.config().agent_id, "agent-2");

    client.disconnect().await;
    assert_eq!(client.config().agent_id, "agent-1");

    client.connect().await.unwrap();
    assert!(
        agent
            .wait_until(WAIT, |a| handshake_agent(a, 2).as_deref() == Some("agent-1"))
            .await
    );

    client.disconnect().await;
}

#[tokio::test]
async fn test_new_environment_is_a_new_target() {
    let agent = MockAgent::start().await;
    let client = client_for(&agent, ScriptedDevice::new(48000, vec![]));

    client.connect().await.unwrap();
    agent.send(0, redirect_frame("agent-2", None));
    assert!(agent.wait_until(WAIT, |a| !a.frames(1).is_empty()).await);

    agent.send(1, redirect_frame("agent-2", Some("canary")));
    assert!(agent.wait_until(WAIT, |a| !a.frames(2).is_empty()).await);
    assert_eq!(client.config().environment.as_deref(), Some("canary"));

    client.disconnect().await;
}

#[tokio::test]
async fn test_redirect_ids_are_not_reapplied() {
    let agent = MockAgent::start().await;
    let client = client_for(&agent, ScriptedDevice::new(48000, vec![]));

    client.connect().await.unwrap();
    let redirect = |agent_id: &str| {
        json!({
            "event": "control",
            "name": "redirect",
            "data": { "agentId": agent_id, "redirectId": "r-1" }
        })
    };

    agent.send(0, redirect("agent-2"));
    assert!(agent.wait_until(WAIT, |a| !a.frames(1).is_empty()).await);

    agent.send(1, redirect("agent-3"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(agent.connection_count(), 2);
    assert_eq!(client.config().agent_id, "agent-2");

    client.disconnect().await;
}

#[tokio::test]
async fn test_malformed_control_keeps_session() {
    let agent = MockAgent::start().await;
    let client = client_for(&agent, ScriptedDevice::new(48000, vec![]));

    client.connect().await.unwrap();
    agent.send(0, json!({"event": "control", "name": "redirect", "data": {}}));
    agent.send(0, json!({"event": "control", "name": "transfer", "data": {"agentId": "x"}}));
    agent.send(0, json!({"event": "bogus"}));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(client.is_connected());
    assert_eq!(agent.connection_count(), 1);

    client.send_text_event("still here").await.unwrap();
    assert!(agent.wait_until(WAIT, |a| a.events(0, "text").len() == 1).await);

    client.disconnect().await;
}

#[tokio::test]
async fn test_failed_redirect_reconnect_leaves_client_disconnected() {
    let agent = MockAgent::start().await;
    let lookup = StaticLookup::new(&[("agent-1", agent.url().as_str())]);
    let device = ScriptedDevice::tone(1);
    let client = VoiceClient::builder(ClientConfig::new("agent-1"))
        .capture_device(device.clone())
        .playback_sink(RecordingSink::new())
        .lookup(lookup.clone())
        .build()
        .unwrap();
    let (opens, on_open) = counter();
    client.on_open(on_open);

    client.connect().await.unwrap();
    client.start_listening().await.unwrap();
    agent.send(0, redirect_frame("agent-2", None));

    let client_ref = &client;
    let lookup_ref = &lookup;
    assert!(
        agent
            .wait_until(WAIT, |_| lookup_ref.calls().len() == 2
                && client_ref.connection_state() == ConnectionState::Disconnected)
            .await
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(lookup.calls(), vec!["agent-1".to_string(), "agent-2".to_string()]);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert!(!client.is_connected());
    assert!(!client.is_listening());
    assert_eq!(agent.connection_count(), 1);
    assert!(agent.is_closed(0));
    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert_eq!(device.starts.load(Ordering::SeqCst), 1);
    assert_eq!(device.stops.load(Ordering::SeqCst), 1);
}
