//! Turn-based talk: one request, one reply.
//!
//! Each call drives the providers sequentially (transcribe, generate,
//! synthesize) and persists history in between. Callers must not overlap
//! turns for one session: the read-append-write of history is not locked, and
//! concurrent turns are last-write-wins.

use bytes::Bytes;
use tracing::{debug, info};

use talkback_core::error::{Result, TalkError};
use talkback_core::types::{EndCondition, Turn};

use crate::history::StoredConversation;
use crate::pipeline::Pipeline;

/// A generated reply and its synthesized audio.
#[derive(Debug, Clone, PartialEq)]
pub struct TalkTurn {
    pub text: String,
    pub audio: Bytes,
    pub end: EndCondition,
}

pub struct TalkService {
    pipeline: Pipeline,
}

impl TalkService {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    /// Start a session for `scenario_id` and play the opening prompt as its first turn.
    pub async fn create_talk(&self, user_id: &str, scenario_id: &str) -> Result<(String, TalkTurn)> {
        let (session, prompt) = self.pipeline.open_session(user_id, scenario_id).await?;
        let conversation = StoredConversation::new(session.voice.clone());
        let turn = self
            .respond(user_id, &session.session_id, conversation, &prompt)
            .await?;
        Ok((session.session_id, turn))
    }

    /// Append `utterance` to the session and reply to it with the full history as context.
    ///
    /// Not idempotent: every call appends a user turn and a model turn.
    pub async fn add_turn(&self, user_id: &str, session_id: &str, utterance: &str) -> Result<TalkTurn> {
        if utterance.trim().is_empty() {
            return Err(TalkError::InvalidInput("utterance is empty".into()));
        }
        let conversation = self.pipeline.conversations.require(user_id, session_id).await?;
        self.respond(user_id, session_id, conversation, utterance).await
    }

    /// Transcribe a recorded clip and take it as the user's next turn.
    ///
    /// The session is checked first, so a stale session costs no provider calls.
    pub async fn add_spoken_turn(&self, user_id: &str, session_id: &str, audio: &[u8]) -> Result<(String, TalkTurn)> {
        let conversation = self.pipeline.conversations.require(user_id, session_id).await?;
        let transcript = self.transcribe(audio).await?;
        if transcript.trim().is_empty() {
            return Err(TalkError::InvalidInput("no speech recognized".into()));
        }
        let turn = self.respond(user_id, session_id, conversation, &transcript).await?;
        Ok((transcript, turn))
    }

    pub async fn transcribe(&self, audio: &[u8]) -> Result<String> {
        if audio.is_empty() {
            return Err(TalkError::InvalidInput("audio is empty".into()));
        }
        let transcript = self.pipeline.stt.transcribe(audio).await?;
        debug!(bytes = audio.len(), chars = transcript.len(), "Transcribed clip");
        Ok(transcript)
    }

    /// The stored history, serialized as persisted.
    pub async fn session_context(&self, user_id: &str, session_id: &str) -> Result<String> {
        self.pipeline.conversations.raw_history(user_id, session_id).await
    }

    async fn respond(
        &self,
        user_id: &str,
        session_id: &str,
        mut conversation: StoredConversation,
        utterance: &str,
    ) -> Result<TalkTurn> {
        let reply = self
            .pipeline
            .llm
            .generate(utterance, conversation.history.turns())
            .await?;
        let (text, end) = self.pipeline.scan_reply(&reply);

        conversation.history.push(Turn::user(utterance));
        conversation.history.push(Turn::model(text.as_str()));
        self.pipeline
            .conversations
            .save(user_id, session_id, &conversation)
            .await?;

        let audio = if text.is_empty() {
            Bytes::new()
        } else {
            self.pipeline.tts.synthesize(&text, &conversation.voice).await?
        };

        if end.ends_conversation() {
            self.pipeline
                .finalize(user_id, session_id, conversation.history)
                .await?;
        }

        info!(
            user_id,
            session_id,
            reply_chars = text.len(),
            audio_bytes = audio.len(),
            end = ?end,
            "Turn complete"
        );
        Ok(TalkTurn { text, audio, end })
    }
}
