//! Google Generative AI (Gemini) language model.
//!
//! Buffered replies use `generateContent`; streaming uses
//! `streamGenerateContent` with SSE. Auth is via API key in query parameter.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, trace};

use talkback_core::types::{Role, Turn};

use crate::error::check_status;
use crate::sse::sse_events;
use crate::{LlmProvider, ProviderError, ProviderResult, TextStream, require_text};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiProvider {
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    temperature: Option<f64>,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(base_url: Option<&str>, api_key: Option<String>, model: &str) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.to_string(),
            max_tokens: 1024,
            temperature: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_generation(mut self, max_tokens: u32, temperature: Option<f64>) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    fn api_key(&self) -> ProviderResult<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::unavailable("No LLM API key configured"))
    }

    fn request_body(&self, prompt: &str, history: &[Turn]) -> GeminiRequest {
        GeminiRequest {
            contents: build_contents(prompt, history),
            generation_config: GenerationConfig {
                max_output_tokens: self.max_tokens,
                temperature: self.temperature,
            },
        }
    }
}

/// Map history plus the new prompt onto Gemini `contents`.
fn build_contents(prompt: &str, history: &[Turn]) -> Vec<serde_json::Value> {
    history
        .iter()
        .map(|t| {
            let role = match t.role {
                Role::User => "user",
                Role::Model => "model",
            };
            json!({ "role": role, "parts": [{ "text": t.text }] })
        })
        .chain(std::iter::once(
            json!({ "role": "user", "parts": [{ "text": prompt }] }),
        ))
        .collect()
}

// --- Gemini request/response types ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<serde_json::Value>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

impl GeminiResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| {
                c.parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn id(&self) -> &str {
        "google"
    }

    async fn generate(&self, prompt: &str, history: &[Turn]) -> ProviderResult<String> {
        require_text(prompt, "prompt")?;
        let api_key = self.api_key()?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, api_key
        );

        debug!(model = %self.model, turns = history.len(), "Gemini generate");

        let resp = self
            .client
            .post(&url)
            .json(&self.request_body(prompt, history))
            .send()
            .await?;
        let resp = check_status(resp, "Gemini").await?;
        let body: GeminiResponse = resp.json().await?;
        Ok(body.text())
    }

    async fn generate_stream(&self, prompt: &str, history: &[Turn]) -> ProviderResult<TextStream> {
        require_text(prompt, "prompt")?;
        let api_key = self.api_key()?;
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.model, api_key
        );

        debug!(model = %self.model, turns = history.len(), "Streaming Gemini API");

        let resp = self
            .client
            .post(&url)
            .json(&self.request_body(prompt, history))
            .send()
            .await?;
        let resp = check_status(resp, "Gemini").await?;

        let fragments = sse_events(resp).filter_map(|event| async move {
            match event {
                Ok(ev) => match serde_json::from_str::<GeminiResponse>(ev.data.trim()) {
                    Ok(chunk) => {
                        if let Some(reason) = chunk.candidates.first().and_then(|c| c.finish_reason.as_deref()) {
                            trace!(reason, "Gemini finish reason");
                        }
                        let text = chunk.text();
                        (!text.is_empty()).then_some(Ok(text))
                    }
                    Err(e) => {
                        trace!(%e, "Skipping unparseable Gemini chunk");
                        None
                    }
                },
                Err(e) => Some(Err(e)),
            }
        });

        Ok(Box::pin(fragments))
    }
}
