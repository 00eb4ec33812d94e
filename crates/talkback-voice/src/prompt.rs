//! Opening prompt rendering.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use talkback_core::config::TalkConfig;
use talkback_core::types::ScenarioContext;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{([A-Za-z]+)\}").expect("static regex"));

/// Built-in role-play prompt. `{conversationEnd}` and `{turnEnd}` are the configured markers.
pub const DEFAULT_TEMPLATE: &str = "\
You are {npcName}, a character in a spoken language-practice role play. {npcBackstory}
The learner's proficiency level is {currentLevel}. Keep your vocabulary and sentence length suitable for that level.
The learner's objective: {objective}.
Gently steer the learner toward using these phrases: {targetPhrases}.
Stay in character and keep every reply to one or two short sentences. Start the conversation now with a greeting.
When the learner has completed the objective, say goodbye and end that reply with {conversationEnd}. End every other reply with {turnEnd}.";

#[derive(Debug, Clone)]
pub struct PromptTemplate {
    template: String,
    conversation_end: String,
    turn_end: String,
}

impl PromptTemplate {
    pub fn new(template: impl Into<String>, conversation_end: &str, turn_end: &str) -> Self {
        Self {
            template: template.into(),
            conversation_end: conversation_end.to_string(),
            turn_end: turn_end.to_string(),
        }
    }

    pub fn from_config(talk: &TalkConfig) -> Self {
        Self::new(
            talk.prompt_template.as_deref().unwrap_or(DEFAULT_TEMPLATE),
            &talk.conversation_end_marker,
            &talk.turn_end_marker,
        )
    }

    /// Substitute scenario fields and the learner's level into the template.
    pub fn render(&self, scenario: &ScenarioContext, level: &str) -> String {
        let phrases = if scenario.target_phrases.is_empty() {
            "none in particular".to_string()
        } else {
            scenario
                .target_phrases
                .iter()
                .map(|p| format!("\"{p}\""))
                .collect::<Vec<_>>()
                .join(", ")
        };

        // Single pass: placeholders inside substituted values stay literal.
        PLACEHOLDER
            .replace_all(&self.template, |caps: &Captures| {
                let value = match &caps[1] {
                    "currentLevel" => level,
                    "npcName" => scenario.npc_name.as_str(),
                    "npcBackstory" => scenario.npc_backstory.as_str(),
                    "objective" => scenario.objective_text.as_str(),
                    "targetPhrases" => phrases.as_str(),
                    "conversationEnd" => self.conversation_end.as_str(),
                    "turnEnd" => self.turn_end.as_str(),
                    _ => return caps[0].to_string(),
                };
                value.to_string()
            })
            .into_owned()
    }
}
