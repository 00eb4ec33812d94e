//! Provider selection from configuration, resolved once at process start.

use std::sync::Arc;

use tracing::{info, warn};

use talkback_core::config::{LlmConfig, SttConfig, TtsConfig};

use crate::elevenlabs::ElevenLabsTts;
use crate::google::GeminiProvider;
use crate::openai_tts::OpenAiTts;
use crate::whisper::WhisperStt;
use crate::{LlmProvider, SttProvider, TtsProvider};

pub fn build_stt_provider(config: &SttConfig) -> anyhow::Result<Arc<dyn SttProvider>> {
    let api_key = config.resolve_api_key();
    if api_key.is_none() {
        warn!(provider = %config.provider, "No STT API key; transcription calls will fail");
    }
    let provider: Arc<dyn SttProvider> = match config.provider.as_str() {
        "groq" | "openai" => Arc::new(WhisperStt::new(
            &config.provider,
            config.base_url.as_deref(),
            api_key,
            config.model.as_deref(),
        )),
        other => anyhow::bail!("Unknown STT provider: {other}"),
    };
    info!(provider = provider.id(), "STT provider ready");
    Ok(provider)
}

pub fn build_llm_provider(config: &LlmConfig) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let api_key = config.resolve_api_key();
    if api_key.is_none() {
        warn!(provider = %config.provider, "No LLM API key; generation calls will fail");
    }
    let provider: Arc<dyn LlmProvider> = match config.provider.as_str() {
        "google" => Arc::new(
            GeminiProvider::new(config.base_url.as_deref(), api_key, config.model())
                .with_generation(config.max_tokens(), config.temperature),
        ),
        other => anyhow::bail!("Unknown LLM provider: {other}"),
    };
    info!(provider = provider.id(), model = config.model(), "LLM provider ready");
    Ok(provider)
}

pub fn build_tts_provider(config: &TtsConfig) -> anyhow::Result<Arc<dyn TtsProvider>> {
    let api_key = config.resolve_api_key();
    if api_key.is_none() {
        warn!(provider = %config.provider, "No TTS API key; synthesis calls will fail");
    }
    let provider: Arc<dyn TtsProvider> = match config.provider.as_str() {
        "elevenlabs" => Arc::new(ElevenLabsTts::new(
            config.base_url.as_deref(),
            api_key,
            config.default_model.as_deref(),
            config.output_format.as_deref(),
        )),
        "openai" => Arc::new(OpenAiTts::new(
            config.base_url.as_deref(),
            api_key,
            config.default_model.as_deref(),
            config.output_format.as_deref(),
        )),
        other => anyhow::bail!("Unknown TTS provider: {other}"),
    };
    info!(provider = provider.id(), "TTS provider ready");
    Ok(provider)
}
