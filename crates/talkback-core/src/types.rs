//! Domain types shared across the talk pipeline.

use serde::{Deserialize, Serialize};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// A single utterance in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

/// Ordered, append-only conversation history.
///
/// Replayed as context on every LLM call, oldest turn first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationHistory {
    turns: Vec<Turn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Render as plain `role: text` lines, used for summaries and logs.
    pub fn to_transcript(&self) -> String {
        self.turns
            .iter()
            .map(|t| match t.role {
                Role::User => format!("user: {}", t.text),
                Role::Model => format!("model: {}", t.text),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// How a model reply ended, derived from sentinel markers in its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndCondition {
    #[default]
    Continue,
    TurnEnd,
    ConversationEnd,
}

impl EndCondition {
    /// Combine two observations; `ConversationEnd` wins over `TurnEnd`.
    pub fn merge(self, other: EndCondition) -> EndCondition {
        use EndCondition::*;
        match (self, other) {
            (ConversationEnd, _) | (_, ConversationEnd) => ConversationEnd,
            (TurnEnd, _) | (_, TurnEnd) => TurnEnd,
            _ => Continue,
        }
    }

    pub fn ends_conversation(self) -> bool {
        self == EndCondition::ConversationEnd
    }
}

/// Scenario/persona data resolved once when a session is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioContext {
    pub scenario_id: String,
    pub npc_name: String,
    pub npc_backstory: String,
    pub npc_voice_id: String,
    pub objective_text: String,
    pub player_proficiency_level: String,
    #[serde(default)]
    pub target_phrases: Vec<String>,
}

/// The slice of a user record the pipeline cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    #[serde(default)]
    pub proficiency_level: Option<String>,
}

/// Voice parameters carried by a session and passed to TTS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceOptions {
    pub voice_id: String,
    pub speaking_rate: f32,
}

/// One ongoing conversation, identified by `(user_id, session_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TalkSession {
    pub session_id: String,
    pub user_id: String,
    pub scenario: ScenarioContext,
    pub voice: VoiceOptions,
}

impl TalkSession {
    /// Generate a fresh opaque session id.
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}
