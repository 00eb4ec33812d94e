//! Conversation persistence on top of a [`StateStore`].
//!
//! Stored under `talk:{userId}:{sessionId}` as
//! `{"history": "<json array of turns>", "voiceSpeed": f32, "voiceId": str}`.
//! Every save replaces the record and restarts the TTL.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use talkback_core::error::{Result, TalkError};
use talkback_core::store::StateStore;
use talkback_core::types::{ConversationHistory, VoiceOptions};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Record {
    history: String,
    voice_speed: f32,
    voice_id: String,
}

/// A conversation as loaded from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredConversation {
    pub history: ConversationHistory,
    pub voice: VoiceOptions,
}

impl StoredConversation {
    pub fn new(voice: VoiceOptions) -> Self {
        Self {
            history: ConversationHistory::new(),
            voice,
        }
    }
}

pub struct ConversationStore {
    store: Arc<dyn StateStore>,
    ttl: Duration,
}

impl ConversationStore {
    pub fn new(store: Arc<dyn StateStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn key(user_id: &str, session_id: &str) -> String {
        format!("talk:{user_id}:{session_id}")
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn load(&self, user_id: &str, session_id: &str) -> Result<Option<StoredConversation>> {
        let Some(raw) = self.store.get(&Self::key(user_id, session_id)).await? else {
            return Ok(None);
        };
        let record: Record = serde_json::from_str(&raw)?;
        let history: ConversationHistory = serde_json::from_str(&record.history)?;
        Ok(Some(StoredConversation {
            history,
            voice: VoiceOptions {
                voice_id: record.voice_id,
                speaking_rate: record.voice_speed,
            },
        }))
    }

    /// Like [`load`](Self::load), but a missing or expired session is `SessionNotFound`.
    pub async fn require(&self, user_id: &str, session_id: &str) -> Result<StoredConversation> {
        self.load(user_id, session_id)
            .await?
            .ok_or(TalkError::SessionNotFound)
    }

    pub async fn save(&self, user_id: &str, session_id: &str, conversation: &StoredConversation) -> Result<()> {
        let record = Record {
            history: serde_json::to_string(&conversation.history)?,
            voice_speed: conversation.voice.speaking_rate,
            voice_id: conversation.voice.voice_id.clone(),
        };
        self.store
            .set(&Self::key(user_id, session_id), serde_json::to_string(&record)?, self.ttl)
            .await?;
        debug!(user_id, session_id, turns = conversation.history.len(), "Conversation saved");
        Ok(())
    }

    pub async fn delete(&self, user_id: &str, session_id: &str) -> Result<()> {
        self.store.delete(&Self::key(user_id, session_id)).await?;
        debug!(user_id, session_id, "Conversation deleted");
        Ok(())
    }

    /// The stored record exactly as persisted, for context inspection.
    pub async fn raw_history(&self, user_id: &str, session_id: &str) -> Result<String> {
        let raw = self
            .store
            .get(&Self::key(user_id, session_id))
            .await?
            .ok_or(TalkError::SessionNotFound)?;
        let record: Record = serde_json::from_str(&raw)?;
        Ok(record.history)
    }
}
