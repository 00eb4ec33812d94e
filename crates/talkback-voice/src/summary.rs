//! Best-effort post-conversation summaries.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use talkback_core::types::ConversationHistory;
use talkback_providers::LlmProvider;

const SUMMARY_PROMPT: &str = "Summarize the conversation above in two or three sentences: \
what the learner tried to do, whether they succeeded, and which phrases they used well.";

#[async_trait]
pub trait SessionSummarizer: Send + Sync {
    async fn summarize(&self, user_id: &str, session_id: &str, history: &ConversationHistory) -> anyhow::Result<String>;
}

/// Asks the configured LLM for a short recap and logs it.
pub struct LlmSummarizer {
    llm: Arc<dyn LlmProvider>,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl SessionSummarizer for LlmSummarizer {
    async fn summarize(&self, user_id: &str, session_id: &str, history: &ConversationHistory) -> anyhow::Result<String> {
        if history.is_empty() {
            anyhow::bail!("nothing to summarize");
        }
        let summary = self.llm.generate(SUMMARY_PROMPT, history.turns()).await?;
        info!(user_id, session_id, summary = %summary.trim(), "Conversation summary");
        Ok(summary)
    }
}

/// Run a summary in the background. Failures are logged and otherwise ignored.
pub fn spawn_summary(
    summarizer: Arc<dyn SessionSummarizer>,
    user_id: String,
    session_id: String,
    history: ConversationHistory,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = summarizer.summarize(&user_id, &session_id, &history).await {
            warn!(%user_id, %session_id, error = %e, "Conversation summary failed");
        }
    })
}
