//! Gateway integration tests: start a real gateway over scripted providers
//! and drive it via HTTP and WebSocket.
//!
//! Run with: `cargo test -p talkback-gateway --test integration`

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use talkback_core::config::{Config, TalkConfig};
use talkback_core::store::MemoryStore;
use talkback_core::types::ScenarioContext;
use talkback_gateway::GatewayState;
use talkback_providers::mock::{EchoTts, ScriptedLlm, ScriptedStt};
use talkback_voice::Pipeline;
use talkback_voice::directory::StaticDirectory;

/// Find an available port.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn cafe_scenario() -> ScenarioContext {
    ScenarioContext {
        scenario_id: "cafe-order".into(),
        npc_name: "Luca".into(),
        npc_backstory: "You run a tiny espresso bar near the station.".into(),
        npc_voice_id: "luca-voice".into(),
        objective_text: "order a coffee to go".into(),
        player_proficiency_level: "INTERMEDIATE".into(),
        target_phrases: vec!["to go".into(), "please".into()],
    }
}

/// Build a gateway over scripted providers and return its state + port.
async fn start_test_gateway(reply: &[&str]) -> (Arc<GatewayState>, u16) {
    let port = find_free_port();

    let directory = Arc::new(StaticDirectory::new().with_scenario(cafe_scenario()).open_users());
    let pipeline = Pipeline::new(
        Arc::new(ScriptedStt::new(["One espresso to go, please."])),
        Arc::new(ScriptedLlm::new(reply.iter().copied())),
        Arc::new(EchoTts::new()),
        Arc::new(MemoryStore::new()),
        directory.clone(),
        directory,
        &TalkConfig::default(),
    );
    let state = Arc::new(GatewayState::new(Arc::new(Config::default()), pipeline));

    let state_clone = state.clone();
    tokio::spawn(async move {
        let _ = talkback_gateway::start_gateway(state_clone, port).await;
    });

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .is_ok()
        {
            break;
        }
    }

    (state, port)
}

async fn next_event<S>(ws: &mut S) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Collect events up to and including the first one of `until` type.
async fn events_until<S>(ws: &mut S, until: &str) -> Vec<Value>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut events = Vec::new();
    loop {
        let event = next_event(ws).await;
        let done = event["type"] == until;
        events.push(event);
        if done {
            return events;
        }
    }
}

fn text_of(events: &[Value]) -> String {
    events
        .iter()
        .filter(|e| e["type"] == "aiTextChunk")
        .map(|e| e["text"].as_str().unwrap().to_string())
        .collect()
}

fn audio_of(events: &[Value]) -> Vec<u8> {
    events
        .iter()
        .filter(|e| e["type"] == "audioChunk")
        .flat_map(|e| STANDARD.decode(e["bytes"].as_str().unwrap()).unwrap())
        .collect()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_state, port) = start_test_gateway(&["unused"]).await;

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .expect("Health request failed");

    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert_eq!(body["connections"], 0);
}

#[tokio::test]
async fn test_turn_based_flow() {
    let (_state, port) = start_test_gateway(&["Ciao! What can I get you? ", "[TURN_END]"]).await;
    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{port}");

    let resp = client
        .post(format!("{base}/talk"))
        .header("x-user-id", "learner-1")
        .json(&json!({ "scenarioId": "cafe-order" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let created: Value = resp.json().await.unwrap();
    let session_id = created["sessionId"].as_str().unwrap().to_string();
    assert_eq!(created["reply"]["text"], "Ciao! What can I get you?");
    let audio = STANDARD
        .decode(created["reply"]["audioBytesBase64"].as_str().unwrap())
        .unwrap();
    assert_eq!(audio, b"Ciao! What can I get you?");

    let resp = client
        .post(format!("{base}/talk/{session_id}/turns"))
        .header("x-user-id", "learner-1")
        .json(&json!({ "audioBytesBase64": STANDARD.encode([0u8, 1, 2, 3]) }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let turn: Value = resp.json().await.unwrap();
    assert_eq!(turn["transcript"], "One espresso to go, please.");
    assert_eq!(turn["reply"]["text"], "Ciao! What can I get you?");

    let resp = client
        .get(format!("{base}/talk/{session_id}/context"))
        .header("x-user-id", "learner-1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let context: Value = resp.json().await.unwrap();
    assert_eq!(context["sessionId"], session_id.as_str());
    let history: Vec<Value> = serde_json::from_str(context["history"].as_str().unwrap()).unwrap();
    assert_eq!(history.len(), 4);
    assert!(!history[0]["text"].as_str().unwrap().contains("{currentLevel}"));
    assert_eq!(history[2]["text"], "One espresso to go, please.");
}

#[tokio::test]
async fn test_turn_based_errors() {
    let (_state, port) = start_test_gateway(&["Hello."]).await;
    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{port}");

    let resp = client
        .post(format!("{base}/talk/no-such-session/turns"))
        .header("x-user-id", "learner-1")
        .json(&json!({ "audioBytesBase64": STANDARD.encode([1u8, 2]) }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "session_not_found");

    let resp = client
        .post(format!("{base}/talk"))
        .header("x-user-id", "learner-1")
        .json(&json!({ "scenarioId": "moon-base" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "scenario_not_found");

    let resp = client
        .post(format!("{base}/talk"))
        .json(&json!({ "scenarioId": "cafe-order" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Sessions are per user.
    let created: Value = client
        .post(format!("{base}/talk"))
        .header("x-user-id", "learner-1")
        .json(&json!({ "scenarioId": "cafe-order" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id = created["sessionId"].as_str().unwrap();
    let resp = client
        .get(format!("{base}/talk/{session_id}/context"))
        .header("x-user-id", "learner-2")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_ws_streaming_conversation() {
    let (state, port) = start_test_gateway(&["Ciao! ", "What can ", "I get you?"]).await;

    let url = format!("ws://127.0.0.1:{port}/ws?user_id=learner-1");
    let (mut ws, _) = connect_async(&url).await.expect("WS connect failed");

    let create = json!({ "type": "createConversation", "scenarioId": "cafe-order" });
    ws.send(Message::Text(create.to_string().into())).await.unwrap();

    let created = next_event(&mut ws).await;
    assert_eq!(created["type"], "conversationCreated");
    assert!(created["sessionId"].is_string());

    let opening = events_until(&mut ws, "endAudioResponse").await;
    assert_eq!(text_of(&opening), "Ciao! What can I get you?");
    assert_eq!(audio_of(&opening), b"Ciao! What can I get you?");
    assert_eq!(state.connection_count(), 1);

    ws.send(Message::Binary(vec![0u8, 1, 0, 1].into())).await.unwrap();
    let chunk = json!({ "type": "audioChunk", "bytes": STANDARD.encode([2u8, 3]) });
    ws.send(Message::Text(chunk.to_string().into())).await.unwrap();
    ws.send(Message::Text(json!({ "type": "endAudio" }).to_string().into()))
        .await
        .unwrap();

    let reply = events_until(&mut ws, "endAudioResponse").await;
    assert_eq!(reply[0]["type"], "transcript");
    assert_eq!(reply[0]["text"], "One espresso to go, please.");
    assert_eq!(text_of(&reply), "Ciao! What can I get you?");

    ws.close(None).await.ok();
    for _ in 0..50 {
        if state.connection_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.connection_count(), 0);
    assert_eq!(state.orchestrator.registry().handle_count(), 0);
}

#[tokio::test]
async fn test_ws_bad_frames_report_errors() {
    let (_state, port) = start_test_gateway(&["Hello."]).await;

    let url = format!("ws://127.0.0.1:{port}/ws?user_id=learner-1");
    let (mut ws, _) = connect_async(&url).await.expect("WS connect failed");

    ws.send(Message::Text("not json".into())).await.unwrap();
    let err = next_event(&mut ws).await;
    assert_eq!(err["type"], "streamError");
    assert_eq!(err["code"], "parse_error");

    ws.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    let err = next_event(&mut ws).await;
    assert_eq!(err["type"], "streamError");
    assert_eq!(err["code"], "invalid_input");

    let create = json!({ "type": "createConversation", "scenarioId": "moon-base" });
    ws.send(Message::Text(create.to_string().into())).await.unwrap();
    let err = next_event(&mut ws).await;
    assert_eq!(err["code"], "scenario_not_found");

    ws.close(None).await.ok();
}

#[tokio::test]
async fn test_ws_requires_user() {
    let (_state, port) = start_test_gateway(&["Hello."]).await;
    let url = format!("ws://127.0.0.1:{port}/ws");
    assert!(connect_async(&url).await.is_err());
}
