//! Shared wiring for both talk modes: providers, persistence, lookups, and prompt.

use std::sync::Arc;

use tracing::{debug, info, warn};

use talkback_core::config::TalkConfig;
use talkback_core::error::Result;
use talkback_core::store::StateStore;
use talkback_core::types::{ConversationHistory, EndCondition, TalkSession, VoiceOptions};
use talkback_providers::{LlmProvider, SttProvider, TtsProvider};

use crate::directory::{ScenarioDirectory, UserDirectory, effective_proficiency};
use crate::history::ConversationStore;
use crate::prompt::PromptTemplate;
use crate::sentinel::SentinelScanner;
use crate::summary::{SessionSummarizer, spawn_summary};

#[derive(Clone)]
pub struct Pipeline {
    pub stt: Arc<dyn SttProvider>,
    pub llm: Arc<dyn LlmProvider>,
    pub tts: Arc<dyn TtsProvider>,
    pub conversations: Arc<ConversationStore>,
    scenarios: Arc<dyn ScenarioDirectory>,
    users: Arc<dyn UserDirectory>,
    template: Arc<PromptTemplate>,
    summarizer: Option<Arc<dyn SessionSummarizer>>,
    conversation_end_marker: Arc<str>,
    turn_end_marker: Arc<str>,
    speaking_rate: f32,
}

impl Pipeline {
    pub fn new(
        stt: Arc<dyn SttProvider>,
        llm: Arc<dyn LlmProvider>,
        tts: Arc<dyn TtsProvider>,
        store: Arc<dyn StateStore>,
        scenarios: Arc<dyn ScenarioDirectory>,
        users: Arc<dyn UserDirectory>,
        talk: &TalkConfig,
    ) -> Self {
        Self {
            stt,
            llm,
            tts,
            conversations: Arc::new(ConversationStore::new(store, talk.session_ttl())),
            scenarios,
            users,
            template: Arc::new(PromptTemplate::from_config(talk)),
            summarizer: None,
            conversation_end_marker: talk.conversation_end_marker.as_str().into(),
            turn_end_marker: talk.turn_end_marker.as_str().into(),
            speaking_rate: talk.default_speaking_rate,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn SessionSummarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Resolve scenario and user, and render the opening prompt for a new session.
    pub async fn open_session(&self, user_id: &str, scenario_id: &str) -> Result<(TalkSession, String)> {
        let scenario = self.scenarios.scenario(scenario_id).await?;
        let user = self.users.user(user_id).await?;
        let level = effective_proficiency(&user, &scenario).to_string();
        let prompt = self.template.render(&scenario, &level);

        let session = TalkSession {
            session_id: TalkSession::generate_id(),
            user_id: user_id.to_string(),
            voice: VoiceOptions {
                voice_id: scenario.npc_voice_id.clone(),
                speaking_rate: self.speaking_rate,
            },
            scenario,
        };
        info!(user_id, scenario_id, session_id = %session.session_id, level, "Session opened");
        Ok((session, prompt))
    }

    pub fn scanner(&self) -> SentinelScanner {
        SentinelScanner::new(&self.conversation_end_marker, &self.turn_end_marker)
    }

    /// Strip markers from a complete reply and classify how it ended.
    pub fn scan_reply(&self, reply: &str) -> (String, EndCondition) {
        let (text, condition) = self.scanner().scan_all(reply);
        (text.trim().to_string(), condition)
    }

    /// End a conversation: kick off the summary, then drop the stored history.
    pub async fn finalize(&self, user_id: &str, session_id: &str, history: ConversationHistory) -> Result<()> {
        match &self.summarizer {
            Some(summarizer) => {
                spawn_summary(summarizer.clone(), user_id.to_string(), session_id.to_string(), history);
            }
            None => debug!(session_id, "No summarizer configured"),
        }
        if let Err(e) = self.conversations.delete(user_id, session_id).await {
            warn!(session_id, error = %e, "Failed to delete finished conversation");
            return Err(e);
        }
        info!(user_id, session_id, "Conversation finalized");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use talkback_core::store::MemoryStore;
    use talkback_core::types::{ScenarioContext, UserProfile};
    use talkback_providers::mock::{EchoTts, ScriptedLlm, ScriptedStt};

    use crate::directory::StaticDirectory;

    pub fn bus_scenario() -> ScenarioContext {
        ScenarioContext {
            scenario_id: "bus-rush-hour".into(),
            npc_name: "Mina".into(),
            npc_backstory: "You drive the crowded 7:40 city bus.".into(),
            npc_voice_id: "mina-voice".into(),
            objective_text: "ask for directions".into(),
            player_proficiency_level: "NOVICE".into(),
            target_phrases: vec!["Excuse me".into()],
        }
    }

    pub fn pipeline(stt: Arc<ScriptedStt>, llm: Arc<ScriptedLlm>, tts: Arc<EchoTts>) -> (Pipeline, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(StaticDirectory::new().with_scenario(bus_scenario()).with_user(UserProfile {
            user_id: "u1".into(),
            proficiency_level: None,
        }));
        let pipeline = Pipeline::new(
            stt,
            llm,
            tts,
            store.clone(),
            directory.clone(),
            directory,
            &TalkConfig::default(),
        );
        (pipeline, store)
    }
}
