//! OpenAI text-to-speech (`/v1/audio/speech`).
//!
//! There is no input-streaming endpoint, so streaming synthesis groups incoming
//! fragments into sentences and synthesizes them one after another, forwarding
//! each response body as it downloads.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::json;
use tracing::debug;

use talkback_core::types::VoiceOptions;

use crate::error::check_status;
use crate::{AudioStream, ProviderError, ProviderResult, TextInput, TtsProvider, require_text};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "tts-1";

#[derive(Clone)]
pub struct OpenAiTts {
    base_url: String,
    api_key: Option<String>,
    model: String,
    response_format: String,
    client: reqwest::Client,
}

impl OpenAiTts {
    pub fn new(base_url: Option<&str>, api_key: Option<String>, model: Option<&str>, format: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            response_format: format.unwrap_or("pcm").to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn request(&self, text: &str, voice: &VoiceOptions) -> ProviderResult<reqwest::Response> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::unavailable("No TTS API key configured"))?;

        debug!(voice = %voice.voice_id, text_len = text.len(), "OpenAI speech request");

        let resp = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(api_key)
            .json(&json!({
                "model": self.model,
                "input": text,
                "voice": voice.voice_id,
                "speed": voice.speaking_rate,
                "response_format": self.response_format,
            }))
            .send()
            .await?;
        check_status(resp, "TTS").await
    }
}

/// Take the longest prefix of `buffer` that ends on a sentence boundary.
pub fn take_sentence(buffer: &mut String) -> Option<String> {
    let end = buffer
        .char_indices()
        .filter(|&(i, c)| {
            matches!(c, '.' | '!' | '?' | '\n')
                && buffer[i + c.len_utf8()..]
                    .chars()
                    .next()
                    .is_none_or(char::is_whitespace)
        })
        .map(|(i, c)| i + c.len_utf8())
        .last()?;
    let sentence: String = buffer.drain(..end).collect();
    let trimmed = sentence.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

struct SentenceState {
    tts: OpenAiTts,
    voice: VoiceOptions,
    fragments: TextInput,
    pending: String,
    body: Option<BodyStream>,
    input_done: bool,
    failed: bool,
}

impl SentenceState {
    async fn start(&mut self, sentence: &str) -> ProviderResult<()> {
        let resp = self.tts.request(sentence, &self.voice).await?;
        self.body = Some(Box::pin(resp.bytes_stream()));
        Ok(())
    }
}

#[async_trait]
impl TtsProvider for OpenAiTts {
    fn id(&self) -> &str {
        "openai"
    }

    async fn synthesize(&self, text: &str, voice: &VoiceOptions) -> ProviderResult<Bytes> {
        require_text(text, "text")?;
        Ok(self.request(text, voice).await?.bytes().await?)
    }

    async fn synthesize_stream(&self, fragments: TextInput, voice: &VoiceOptions) -> ProviderResult<AudioStream> {
        if self.api_key.is_none() {
            return Err(ProviderError::unavailable("No TTS API key configured"));
        }

        let state = SentenceState {
            tts: self.clone(),
            voice: voice.clone(),
            fragments,
            pending: String::new(),
            body: None,
            input_done: false,
            failed: false,
        };

        let audio = futures::stream::unfold(state, |mut state| async move {
            if state.failed {
                return None;
            }
            loop {
                if let Some(body) = state.body.as_mut() {
                    match body.next().await {
                        Some(Ok(chunk)) => return Some((Ok(chunk), state)),
                        Some(Err(e)) => {
                            state.failed = true;
                            return Some((Err(e.into()), state));
                        }
                        None => state.body = None,
                    }
                    continue;
                }

                let next = match take_sentence(&mut state.pending) {
                    Some(sentence) => Some(sentence),
                    None if state.input_done => {
                        let rest = std::mem::take(&mut state.pending);
                        let rest = rest.trim();
                        if rest.is_empty() {
                            return None;
                        }
                        Some(rest.to_string())
                    }
                    None => None,
                };

                if let Some(sentence) = next {
                    if let Err(e) = state.start(&sentence).await {
                        state.failed = true;
                        return Some((Err(e), state));
                    }
                    continue;
                }

                match state.fragments.next().await {
                    Some(fragment) if !fragment.is_empty() => state.pending.push_str(&fragment),
                    _ => state.input_done = true,
                }
            }
        });

        Ok(Box::pin(audio))
    }
}
