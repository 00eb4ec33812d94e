//! Streaming talk over a persistent duplex connection.
//!
//! Per connection: inbound audio feeds an STT stream; its final transcript
//! starts a turn that opens a TTS stream, streams the LLM reply into it
//! fragment by fragment, and forwards synthesized audio to the client as it
//! arrives. `endAudioResponse` is sent once both the generation side and the
//! synthesis side have finished, in either order.
//!
//! Three independent tasks run per turn (audio ingestion, generation, audio
//! emission); they share only the stream handles and the outbound event
//! channel, so a slow synthesizer never stalls generation or forwarding.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use talkback_core::error::{Result, TalkError};
use talkback_core::protocol::{ClientEvent, ServerEvent};
use talkback_core::types::Turn;
use talkback_providers::{AudioStream, TranscriptStream};

use crate::barrier::CompletionBarrier;
use crate::history::StoredConversation;
use crate::pipeline::Pipeline;
use crate::registry::{SessionRegistry, StreamHandle, StreamKind};

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// No recognition stream open; ready for audio.
    Idle,
    /// Forwarding inbound audio to STT.
    Listening,
    /// Audio input closed, waiting for the final transcript.
    Transcribing,
    /// Generating and synthesizing a reply.
    Responding,
    /// The conversation ended; a new `createConversation` is required.
    Finalized,
}

pub struct Orchestrator {
    pipeline: Pipeline,
    registry: Arc<SessionRegistry>,
}

impl Orchestrator {
    pub fn new(pipeline: Pipeline) -> Self {
        Self::with_registry(pipeline, Arc::new(SessionRegistry::new()))
    }

    pub fn with_registry(pipeline: Pipeline, registry: Arc<SessionRegistry>) -> Self {
        Self { pipeline, registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Register a new client connection. Outbound events are written to `events`.
    pub fn connect(&self, user_id: &str, events: mpsc::UnboundedSender<ServerEvent>) -> Connection {
        let id = format!("conn-{}", NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed));
        info!(connection = %id, user_id, "Connection opened");
        Connection {
            shared: Arc::new(Shared {
                id,
                user_id: user_id.to_string(),
                pipeline: self.pipeline.clone(),
                registry: self.registry.clone(),
                events,
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
                state: Mutex::new(ConnState {
                    phase: ConnectionPhase::Idle,
                    conversation: None,
                }),
                turn_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

#[derive(Clone)]
struct ActiveConversation {
    session_id: String,
    cancel: CancellationToken,
}

struct ConnState {
    phase: ConnectionPhase,
    conversation: Option<ActiveConversation>,
}

struct Shared {
    id: String,
    user_id: String,
    pipeline: Pipeline,
    registry: Arc<SessionRegistry>,
    events: mpsc::UnboundedSender<ServerEvent>,
    cancel: CancellationToken,
    closed: AtomicBool,
    state: Mutex<ConnState>,
    /// One turn at a time per connection.
    turn_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send(&self, event: ServerEvent) -> bool {
        self.events.send(event).is_ok()
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        self.state().phase = phase;
    }

    fn set_phase_if(&self, from: ConnectionPhase, to: ConnectionPhase) {
        let mut state = self.state();
        if state.phase == from {
            state.phase = to;
        }
    }

    fn active(&self) -> Result<ActiveConversation> {
        self.state()
            .conversation
            .clone()
            .ok_or_else(|| TalkError::InvalidInput("no active conversation; send createConversation first".into()))
    }

    /// Report an error to the client and reset this connection's streams.
    fn fail(&self, err: &TalkError) {
        warn!(connection = %self.id, code = err.code(), error = %err, "Stream error");
        self.send(ServerEvent::error(err.code(), err.to_string()));
        let released = self.registry.release_all(&self.id);
        let mut state = self.state();
        if state.phase != ConnectionPhase::Finalized {
            state.phase = ConnectionPhase::Idle;
        }
        debug!(connection = %self.id, released, "Connection streams reset");
    }

    /// Forget `conv` if it is still the active conversation.
    fn finish_conversation(&self, conv: &ActiveConversation) {
        let mut state = self.state();
        if state
            .conversation
            .as_ref()
            .is_some_and(|c| c.session_id == conv.session_id)
        {
            state.conversation = None;
            state.phase = ConnectionPhase::Finalized;
        }
    }
}

/// One live client connection. Dropping it disconnects.
pub struct Connection {
    shared: Arc<Shared>,
}

enum TurnInput {
    /// The rendered scenario prompt that opens a conversation.
    Opening(String),
    /// A final transcript of the user's speech.
    Utterance(String),
}

impl Connection {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.shared.state().phase
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.state().conversation.as_ref().map(|c| c.session_id.clone())
    }

    /// Handle one inbound event. Failures are reported to the client as `streamError`.
    pub async fn handle(&self, event: ClientEvent) {
        let result = match event {
            ClientEvent::CreateConversation { scenario_id } => self.create_conversation(&scenario_id).await,
            ClientEvent::AudioChunk { bytes } => self.audio_chunk(bytes).await,
            ClientEvent::EndAudio => {
                self.end_audio();
                Ok(())
            }
        };
        if let Err(e) = result {
            self.shared.fail(&e);
        }
    }

    /// Tear down every stream this connection owns and cancel in-flight turns.
    ///
    /// Idempotent; returns the number of stream handles released by this call.
    pub fn disconnect(&self) -> usize {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.shared.cancel.cancel();
        let released = self.shared.registry.release_all(&self.shared.id);
        info!(connection = %self.shared.id, released, "Connection closed");
        released
    }

    async fn create_conversation(&self, scenario_id: &str) -> Result<()> {
        let shared = &self.shared;
        let pipeline = &shared.pipeline;
        let (session, prompt) = pipeline.open_session(&shared.user_id, scenario_id).await?;
        pipeline
            .conversations
            .save(&shared.user_id, &session.session_id, &StoredConversation::new(session.voice.clone()))
            .await?;

        let conv = ActiveConversation {
            session_id: session.session_id.clone(),
            cancel: shared.cancel.child_token(),
        };
        let previous = {
            let mut state = shared.state();
            state.phase = ConnectionPhase::Responding;
            state.conversation.replace(conv.clone())
        };
        if let Some(previous) = previous {
            debug!(connection = %shared.id, session_id = %previous.session_id, "Replacing active conversation");
            previous.cancel.cancel();
            shared.registry.release_all(&shared.id);
        }

        shared.send(ServerEvent::ConversationCreated {
            session_id: session.session_id,
        });
        tokio::spawn(run_turn(shared.clone(), TurnInput::Opening(prompt), conv));
        Ok(())
    }

    async fn audio_chunk(&self, bytes: Bytes) -> Result<()> {
        let conv = self.shared.active()?;
        let handle = match self.shared.registry.get(&self.shared.id, StreamKind::Stt) {
            Some(handle) if handle.is_live() => handle,
            _ => self.open_recognition(&conv).await?,
        };
        if !handle.send_audio(bytes) {
            debug!(connection = %self.shared.id, "Recognition input closed; dropping audio chunk");
        }
        Ok(())
    }

    fn end_audio(&self) {
        match self.shared.registry.get(&self.shared.id, StreamKind::Stt) {
            Some(handle) => {
                handle.close_input();
                self.shared.set_phase(ConnectionPhase::Transcribing);
            }
            None => debug!(connection = %self.shared.id, "endAudio with no open recognition stream"),
        }
    }

    async fn open_recognition(&self, conv: &ActiveConversation) -> Result<Arc<StreamHandle>> {
        let shared = &self.shared;
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let transcripts = shared
            .pipeline
            .stt
            .transcribe_stream(Box::pin(UnboundedReceiverStream::new(audio_rx)))
            .await?;

        let handle = StreamHandle::new(&shared.id, StreamKind::Stt, conv.cancel.child_token());
        handle.set_audio_sender(audio_tx);
        shared.registry.attach(handle.clone());
        // The connection may have closed while the provider stream was opening.
        if conv.cancel.is_cancelled() {
            shared.registry.detach_if(&shared.id, StreamKind::Stt, handle.id());
            debug!(connection = %shared.id, "Closed while opening recognition; stream released");
            return Ok(handle);
        }
        shared.set_phase(ConnectionPhase::Listening);

        let task = tokio::spawn(listen(shared.clone(), handle.clone(), transcripts, conv.clone()));
        handle.track(task.abort_handle());
        debug!(connection = %shared.id, handle = handle.id(), "Recognition stream opened");
        Ok(handle)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Wait for one final transcript, then hand it to a new turn.
///
/// The recognition stream is not reused across turns.
async fn listen(shared: Arc<Shared>, handle: Arc<StreamHandle>, mut transcripts: TranscriptStream, conv: ActiveConversation) {
    let token = handle.token();
    let next = tokio::select! {
        _ = token.cancelled() => {
            shared.registry.detach_if(&shared.id, StreamKind::Stt, handle.id());
            return;
        }
        next = transcripts.next() => next,
    };
    drop(transcripts);

    match next {
        Some(Ok(text)) if !text.trim().is_empty() => {
            debug!(connection = %shared.id, chars = text.len(), "Final transcript");
            tokio::spawn(run_turn(shared.clone(), TurnInput::Utterance(text), conv));
        }
        Some(Err(e)) => {
            shared.fail(&e.into());
            return;
        }
        _ => {
            debug!(connection = %shared.id, "Recognition ended without speech");
            shared.set_phase(ConnectionPhase::Idle);
        }
    }
    shared.registry.detach_if(&shared.id, StreamKind::Stt, handle.id());
}

async fn run_turn(shared: Arc<Shared>, input: TurnInput, conv: ActiveConversation) {
    let _turn = tokio::select! {
        _ = conv.cancel.cancelled() => return,
        guard = shared.turn_lock.lock() => guard,
    };
    if let Err(e) = respond(&shared, input, &conv).await {
        if conv.cancel.is_cancelled() {
            debug!(connection = %shared.id, error = %e, "Cancelled turn failed; ignoring");
        } else {
            shared.fail(&e);
        }
    }
}

async fn respond(shared: &Arc<Shared>, input: TurnInput, conv: &ActiveConversation) -> Result<()> {
    let pipeline = &shared.pipeline;
    let token = &conv.cancel;
    let user_id = shared.user_id.as_str();
    let session_id = conv.session_id.as_str();

    let prompt = match input {
        TurnInput::Opening(prompt) => prompt,
        TurnInput::Utterance(text) => {
            shared.send(ServerEvent::Transcript { text: text.clone() });
            text
        }
    };
    shared.set_phase(ConnectionPhase::Responding);
    let mut conversation = pipeline.conversations.require(user_id, session_id).await?;

    // Open synthesis before any text exists so the provider connection is warm.
    let (text_tx, text_rx) = mpsc::unbounded_channel::<String>();
    let audio = pipeline
        .tts
        .synthesize_stream(Box::pin(UnboundedReceiverStream::new(text_rx)), &conversation.voice)
        .await?;
    let tts = StreamHandle::new(&shared.id, StreamKind::Tts, token.child_token());
    shared.registry.attach(tts.clone());
    if token.is_cancelled() {
        shared.registry.detach_if(&shared.id, StreamKind::Tts, tts.id());
        debug!(connection = %shared.id, session_id, "Closed while opening synthesis; stream released");
        return Ok(());
    }

    let barrier = Arc::new(CompletionBarrier::new(2, {
        let events = shared.events.clone();
        let connection = shared.id.clone();
        move || {
            debug!(%connection, "Reply audio complete");
            let _ = events.send(ServerEvent::EndAudioResponse);
        }
    }));
    let forward = tokio::spawn(forward_audio(shared.clone(), tts.clone(), audio, barrier.clone()));
    tts.track(forward.abort_handle());

    let mut fragments = pipeline
        .llm
        .generate_stream(&prompt, conversation.history.turns())
        .await?;
    let mut scanner = pipeline.scanner();
    let mut reply = String::new();

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => {
                debug!(connection = %shared.id, session_id, "Turn cancelled; discarding reply");
                return Ok(());
            }
            next = fragments.next() => next,
        };
        match next {
            Some(Ok(fragment)) => {
                let text = scanner.push(&fragment);
                emit_text(shared, &text_tx, &mut reply, text);
                if scanner.is_stopped() {
                    break;
                }
            }
            Some(Err(e)) => return Err(e.into()),
            None => break,
        }
    }
    drop(fragments);
    let tail = scanner.finish();
    emit_text(shared, &text_tx, &mut reply, tail);

    // Empty fragment: flush, no more input.
    let _ = text_tx.send(String::new());
    drop(text_tx);
    barrier.arrive();

    if token.is_cancelled() {
        return Ok(());
    }

    let reply = reply.trim().to_string();
    conversation.history.push(Turn::user(prompt));
    conversation.history.push(Turn::model(reply.as_str()));

    if scanner.condition().ends_conversation() {
        info!(connection = %shared.id, session_id, "Conversation objective reached");
        shared.send(ServerEvent::FinalResponse { text: reply });
        shared.finish_conversation(conv);
        pipeline.finalize(user_id, session_id, conversation.history).await?;
    } else {
        pipeline.conversations.save(user_id, session_id, &conversation).await?;
        shared.set_phase_if(ConnectionPhase::Responding, ConnectionPhase::Idle);
        debug!(connection = %shared.id, session_id, condition = ?scanner.condition(), "Turn persisted");
    }

    // Keep the turn lock until synthesis drains; the next turn must not replace this TTS stream.
    let _ = forward.await;
    Ok(())
}

fn emit_text(shared: &Shared, text_tx: &mpsc::UnboundedSender<String>, reply: &mut String, text: String) {
    if text.is_empty() {
        return;
    }
    reply.push_str(&text);
    shared.send(ServerEvent::AiTextChunk { text: text.clone() });
    // The synthesizer may already have closed; text still reaches the client.
    let _ = text_tx.send(text);
}

/// Forward synthesized audio to the client in provider emission order.
async fn forward_audio(shared: Arc<Shared>, handle: Arc<StreamHandle>, mut audio: AudioStream, barrier: Arc<CompletionBarrier>) {
    let token = handle.token();
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => {
                shared.registry.detach_if(&shared.id, StreamKind::Tts, handle.id());
                return;
            }
            next = audio.next() => next,
        };
        match next {
            Some(Ok(bytes)) => {
                if !shared.send(ServerEvent::AudioChunk { bytes }) {
                    break;
                }
            }
            Some(Err(e)) => {
                let err = TalkError::from(e);
                warn!(connection = %shared.id, error = %err, "Synthesis stream failed");
                shared.send(ServerEvent::error(err.code(), err.to_string()));
                break;
            }
            None => break,
        }
    }
    drop(audio);
    barrier.arrive();
    shared.registry.detach_if(&shared.id, StreamKind::Tts, handle.id());
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::history::ConversationStore;
    use crate::pipeline::testing::pipeline;
    use talkback_core::store::{MemoryStore, StateStore};
    use talkback_providers::mock::{EchoTts, ScriptedLlm, ScriptedStt};
    use tokio::sync::Notify;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        orchestrator: Orchestrator,
        store: Arc<MemoryStore>,
        stt: Arc<ScriptedStt>,
        tts: Arc<EchoTts>,
    }

    fn harness(stt: ScriptedStt, llm: ScriptedLlm, tts: EchoTts) -> Harness {
        let stt = Arc::new(stt);
        let tts = Arc::new(tts);
        let (p, store) = pipeline(stt.clone(), Arc::new(llm), tts.clone());
        Harness {
            orchestrator: Orchestrator::new(p),
            store,
            stt,
            tts,
        }
    }

    fn create(scenario: &str) -> ClientEvent {
        ClientEvent::CreateConversation {
            scenario_id: scenario.into(),
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Collect events up to and including the first one matching `stop`.
    async fn collect_until(
        rx: &mut mpsc::UnboundedReceiver<ServerEvent>,
        stop: impl Fn(&ServerEvent) -> bool,
    ) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        loop {
            let event = next_event(rx).await;
            let done = stop(&event);
            events.push(event);
            if done {
                return events;
            }
        }
    }

    fn is_end_audio(e: &ServerEvent) -> bool {
        matches!(e, ServerEvent::EndAudioResponse)
    }

    fn audio_of(events: &[ServerEvent]) -> Vec<Bytes> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::AudioChunk { bytes } => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    fn text_of(events: &[ServerEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::AiTextChunk { text } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn session_of(events: &[ServerEvent]) -> String {
        events
            .iter()
            .find_map(|e| match e {
                ServerEvent::ConversationCreated { session_id } => Some(session_id.clone()),
                _ => None,
            })
            .expect("conversationCreated")
    }

    async fn stored_turns(store: &MemoryStore, session_id: &str) -> Option<usize> {
        let raw = store.get(&ConversationStore::key("u1", session_id)).await.unwrap()?;
        let record: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let turns: Vec<Turn> = serde_json::from_str(record["history"].as_str().unwrap()).unwrap();
        Some(turns.len())
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        tokio::time::timeout(WAIT, async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn test_audio_reaches_client_in_provider_order() {
        let h = harness(
            ScriptedStt::new(["unused"]),
            ScriptedLlm::new(["Hel", "lo ", "the", "re"]),
            EchoTts::new().batch(3),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = h.orchestrator.connect("u1", tx);
        conn.handle(create("bus-rush-hour")).await;

        let events = collect_until(&mut rx, is_end_audio).await;
        assert_eq!(text_of(&events), vec!["Hel", "lo ", "the", "re"]);
        assert_eq!(audio_of(&events), h.tts.emitted());
        assert_eq!(audio_of(&events), vec![Bytes::from("Hello the"), Bytes::from("re")]);
        assert_eq!(h.tts.received(), vec!["Hel", "lo ", "the", "re", ""]);
    }

    #[tokio::test]
    async fn test_end_audio_waits_for_synthesis_when_generation_finishes_first() {
        let hold = Arc::new(Notify::new());
        let h = harness(
            ScriptedStt::new(["unused"]),
            ScriptedLlm::new(["One. ", "Two."]),
            EchoTts::new().hold_close(hold.clone()),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = h.orchestrator.connect("u1", tx);
        conn.handle(create("bus-rush-hour")).await;

        let created = next_event(&mut rx).await;
        let session_id = session_of(std::slice::from_ref(&created));
        // Generation is done once the turn is persisted.
        wait_for(|| async { stored_turns(&h.store, &session_id).await == Some(2) }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let early = drain(&mut rx);
        assert!(!early.iter().any(is_end_audio), "endAudioResponse before synthesis closed");
        assert_eq!(audio_of(&early).len(), 2);

        hold.notify_one();
        let rest = collect_until(&mut rx, is_end_audio).await;
        assert_eq!(rest.iter().filter(|e| is_end_audio(e)).count(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!drain(&mut rx).iter().any(is_end_audio));
    }

    #[tokio::test]
    async fn test_end_audio_waits_for_generation_when_synthesis_closes_first() {
        let gate = Arc::new(Notify::new());
        let h = harness(
            ScriptedStt::new(["unused"]),
            ScriptedLlm::new(["Hi", " there"]).with_gate(gate.clone()),
            EchoTts::new().close_after_chunks(1),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = h.orchestrator.connect("u1", tx);
        conn.handle(create("bus-rush-hour")).await;

        let events = collect_until(&mut rx, |e| matches!(e, ServerEvent::AiTextChunk { text } if text == " there")).await;
        let conn_id = conn.id().to_string();
        wait_for(|| async { h.orchestrator.registry().get(&conn_id, StreamKind::Tts).is_none() }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut seen = events;
        seen.extend(drain(&mut rx));
        assert_eq!(audio_of(&seen), vec![Bytes::from("Hi")]);
        assert!(!seen.iter().any(is_end_audio), "endAudioResponse before generation finished");

        gate.notify_one();
        let rest = collect_until(&mut rx, is_end_audio).await;
        assert_eq!(rest.iter().filter(|e| is_end_audio(e)).count(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!drain(&mut rx).iter().any(is_end_audio));
    }

    #[tokio::test]
    async fn test_conversation_end_marker_is_stripped_and_session_deleted() {
        let h = harness(
            ScriptedStt::new(["unused"]),
            ScriptedLlm::new(["Great, ", "you did it! [CONV", "ERSATION_END]", "never sent"]),
            EchoTts::new(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = h.orchestrator.connect("u1", tx);
        conn.handle(create("bus-rush-hour")).await;

        let mut events = collect_until(&mut rx, |e| matches!(e, ServerEvent::FinalResponse { .. })).await;
        if !events.iter().any(is_end_audio) {
            events.extend(collect_until(&mut rx, is_end_audio).await);
        }
        let session_id = session_of(&events);

        for text in text_of(&events) {
            assert!(!text.contains('['), "marker leaked: {text}");
            assert!(!text.contains("never sent"));
        }
        for chunk in audio_of(&events) {
            assert!(!String::from_utf8_lossy(&chunk).contains("CONVERSATION_END"));
        }
        let final_text = events.iter().find_map(|e| match e {
            ServerEvent::FinalResponse { text } => Some(text.clone()),
            _ => None,
        });
        assert_eq!(final_text.as_deref(), Some("Great, you did it!"));

        wait_for(|| async { stored_turns(&h.store, &session_id).await.is_none() }).await;
        assert_eq!(conn.phase(), ConnectionPhase::Finalized);
        assert_eq!(conn.session_id(), None);

        conn.handle(ClientEvent::AudioChunk {
            bytes: Bytes::from_static(&[0, 1]),
        })
        .await;
        let err = next_event(&mut rx).await;
        assert!(matches!(err, ServerEvent::StreamError { ref code, .. } if code == "invalid_input"));
    }

    #[tokio::test]
    async fn test_spoken_turn_round_trip() {
        let h = harness(
            ScriptedStt::new(["Where is the museum?"]),
            ScriptedLlm::new(["Take line 4. ", "[TURN_END]"]),
            EchoTts::new(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = h.orchestrator.connect("u1", tx);
        conn.handle(create("bus-rush-hour")).await;
        let opening = collect_until(&mut rx, is_end_audio).await;
        let session_id = session_of(&opening);
        wait_for(|| async { stored_turns(&h.store, &session_id).await == Some(2) }).await;

        conn.handle(ClientEvent::AudioChunk { bytes: Bytes::from_static(&[1, 2, 3]) }).await;
        assert_eq!(conn.phase(), ConnectionPhase::Listening);
        conn.handle(ClientEvent::AudioChunk { bytes: Bytes::from_static(&[4, 5]) }).await;
        conn.handle(ClientEvent::EndAudio).await;

        let events = collect_until(&mut rx, is_end_audio).await;
        assert!(matches!(&events[0], ServerEvent::Transcript { text } if text == "Where is the museum?"));
        assert_eq!(text_of(&events).concat(), "Take line 4. ");

        wait_for(|| async { stored_turns(&h.store, &session_id).await == Some(4) }).await;
        assert_eq!(h.stt.audio_bytes(), 5);
        assert!(h.orchestrator.registry().get(conn.id(), StreamKind::Stt).is_none());
        wait_for(|| async { conn.phase() == ConnectionPhase::Idle }).await;
    }

    #[tokio::test]
    async fn test_provider_endpoint_ends_listening_without_end_audio() {
        let h = harness(
            ScriptedStt::new(["Two tickets, please."]).final_after_chunks(2),
            ScriptedLlm::new(["Here you go."]),
            EchoTts::new(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = h.orchestrator.connect("u1", tx);
        conn.handle(create("bus-rush-hour")).await;
        collect_until(&mut rx, is_end_audio).await;

        conn.handle(ClientEvent::AudioChunk { bytes: Bytes::from_static(&[1, 1]) }).await;
        conn.handle(ClientEvent::AudioChunk { bytes: Bytes::from_static(&[2, 2]) }).await;
        let events = collect_until(&mut rx, is_end_audio).await;
        assert!(matches!(&events[0], ServerEvent::Transcript { text } if text == "Two tickets, please."));
        assert_eq!(h.stt.stream_calls(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_mid_listening_releases_once() {
        let h = harness(ScriptedStt::new(["hello"]), ScriptedLlm::new(["Hi."]), EchoTts::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = h.orchestrator.connect("u1", tx);
        conn.handle(create("bus-rush-hour")).await;
        collect_until(&mut rx, is_end_audio).await;

        conn.handle(ClientEvent::AudioChunk { bytes: Bytes::from_static(&[9, 9]) }).await;
        let stt = h
            .orchestrator
            .registry()
            .get(conn.id(), StreamKind::Stt)
            .expect("recognition stream open");
        assert!(stt.is_live());

        assert!(conn.disconnect() >= 1);
        assert!(!stt.is_live());
        assert!(!stt.release());
        assert_eq!(conn.disconnect(), 0);
        assert_eq!(h.orchestrator.registry().release_all(conn.id()), 0);

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let other = h.orchestrator.connect("u1", tx2);
        other.handle(create("bus-rush-hour")).await;
        let events = collect_until(&mut rx2, is_end_audio).await;
        assert!(matches!(events[0], ServerEvent::ConversationCreated { .. }));
        assert_ne!(other.id(), conn.id());
    }

    #[tokio::test]
    async fn test_disconnect_mid_generation_discards_reply() {
        let gate = Arc::new(Notify::new());
        let h = harness(
            ScriptedStt::new(["unused"]),
            ScriptedLlm::new(["Partial"]).with_gate(gate.clone()),
            EchoTts::new(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = h.orchestrator.connect("u1", tx);
        conn.handle(create("bus-rush-hour")).await;
        let events = collect_until(&mut rx, |e| matches!(e, ServerEvent::AiTextChunk { .. })).await;
        let session_id = session_of(&events);

        conn.disconnect();
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stored_turns(&h.store, &session_id).await, Some(0));
        assert_eq!(h.orchestrator.registry().handle_count(), 0);
    }

    #[tokio::test]
    async fn test_audio_before_conversation_is_rejected() {
        let h = harness(ScriptedStt::new(["x"]), ScriptedLlm::new(["y"]), EchoTts::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = h.orchestrator.connect("u1", tx);
        conn.handle(ClientEvent::AudioChunk { bytes: Bytes::from_static(&[1]) }).await;

        let event = next_event(&mut rx).await;
        assert!(matches!(event, ServerEvent::StreamError { ref code, .. } if code == "invalid_input"));
        assert_eq!(h.stt.stream_calls(), 0);
        assert_eq!(conn.phase(), ConnectionPhase::Idle);
    }

    #[tokio::test]
    async fn test_unknown_scenario_reports_stream_error() {
        let h = harness(ScriptedStt::new(["x"]), ScriptedLlm::new(["y"]), EchoTts::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = h.orchestrator.connect("u1", tx);
        conn.handle(create("moon-base")).await;
        let event = next_event(&mut rx).await;
        assert!(matches!(event, ServerEvent::StreamError { ref code, .. } if code == "scenario_not_found"));
        assert_eq!(conn.session_id(), None);
    }

    #[tokio::test]
    async fn test_generation_failure_resets_streams() {
        let h = harness(
            ScriptedStt::new(["x"]),
            ScriptedLlm::new(["Hello", " again"]).fail_after(1),
            EchoTts::new(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = h.orchestrator.connect("u1", tx);
        conn.handle(create("bus-rush-hour")).await;

        let events = collect_until(&mut rx, |e| matches!(e, ServerEvent::StreamError { .. })).await;
        assert!(matches!(
            events.last(),
            Some(ServerEvent::StreamError { code, .. }) if code == "provider_unavailable"
        ));
        assert_eq!(h.orchestrator.registry().handle_count(), 0);
        assert_eq!(conn.phase(), ConnectionPhase::Idle);
        assert!(conn.session_id().is_some());
    }

    #[tokio::test]
    async fn test_stt_failure_reports_error() {
        let h = harness(ScriptedStt::failing(), ScriptedLlm::new(["Hi."]), EchoTts::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = h.orchestrator.connect("u1", tx);
        conn.handle(create("bus-rush-hour")).await;
        collect_until(&mut rx, is_end_audio).await;

        conn.handle(ClientEvent::AudioChunk { bytes: Bytes::from_static(&[1, 2]) }).await;
        let event = collect_until(&mut rx, |e| matches!(e, ServerEvent::StreamError { .. })).await;
        assert!(matches!(
            event.last(),
            Some(ServerEvent::StreamError { code, .. }) if code == "provider_unavailable"
        ));
        assert!(h.orchestrator.registry().get(conn.id(), StreamKind::Stt).is_none());
    }

    #[tokio::test]
    async fn test_disconnect_while_synthesis_opens_leaves_no_handles() {
        let h = harness(
            ScriptedStt::new(["unused"]),
            ScriptedLlm::new(["Hello."]),
            EchoTts::new().open_delay(Duration::from_millis(100)),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = h.orchestrator.connect("u1", tx);
        conn.handle(create("bus-rush-hour")).await;
        assert!(matches!(next_event(&mut rx).await, ServerEvent::ConversationCreated { .. }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.disconnect();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(h.tts.streams_opened(), 1);
        assert_eq!(h.orchestrator.registry().handle_count(), 0);
        assert_eq!(h.orchestrator.registry().connection_count(), 0);
        assert!(!drain(&mut rx).iter().any(is_end_audio));
    }

    #[tokio::test]
    async fn test_disconnect_while_recognition_opens_leaves_no_handles() {
        let h = harness(
            ScriptedStt::new(["hello"]).open_delay(Duration::from_millis(100)),
            ScriptedLlm::new(["Hi."]),
            EchoTts::new(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = h.orchestrator.connect("u1", tx);
        conn.handle(create("bus-rush-hour")).await;
        collect_until(&mut rx, is_end_audio).await;
        wait_for(|| async { h.orchestrator.registry().handle_count() == 0 }).await;

        tokio::join!(
            conn.handle(ClientEvent::AudioChunk { bytes: Bytes::from_static(&[1, 2]) }),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                conn.disconnect();
            }
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.stt.stream_calls(), 1);
        assert_eq!(h.orchestrator.registry().handle_count(), 0);
        assert_eq!(h.orchestrator.registry().connection_count(), 0);
        assert_eq!(h.stt.audio_bytes(), 0);
    }

    #[tokio::test]
    async fn test_follow_up_utterance_waits_for_previous_audio_to_drain() {
        let hold = Arc::new(Notify::new());
        let h = harness(
            ScriptedStt::new(["Is this the 7:40?"]),
            ScriptedLlm::new(["Yes. ", "Hop on."]),
            EchoTts::new().hold_close(hold.clone()),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = h.orchestrator.connect("u1", tx);
        conn.handle(create("bus-rush-hour")).await;
        let created = next_event(&mut rx).await;
        let session_id = session_of(std::slice::from_ref(&created));
        wait_for(|| async { stored_turns(&h.store, &session_id).await == Some(2) }).await;

        // Opening reply is generated but its synthesis is still open.
        conn.handle(ClientEvent::AudioChunk { bytes: Bytes::from_static(&[3, 4]) }).await;
        conn.handle(ClientEvent::EndAudio).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let pending = drain(&mut rx);
        assert!(!pending.iter().any(|e| matches!(e, ServerEvent::Transcript { .. })));
        assert!(!pending.iter().any(is_end_audio));
        assert_eq!(h.tts.streams_opened(), 1);

        hold.notify_one();
        let opening = collect_until(&mut rx, is_end_audio).await;
        assert!(!opening.iter().any(|e| matches!(e, ServerEvent::Transcript { .. })));

        let reply = collect_until(&mut rx, |e| matches!(e, ServerEvent::Transcript { .. })).await;
        assert_eq!(reply.len(), 1);
        hold.notify_one();
        let reply = collect_until(&mut rx, is_end_audio).await;
        assert_eq!(text_of(&reply).concat(), "Yes. Hop on.");
        assert_eq!(h.tts.streams_opened(), 2);
        wait_for(|| async { stored_turns(&h.store, &session_id).await == Some(4) }).await;
    }
}
