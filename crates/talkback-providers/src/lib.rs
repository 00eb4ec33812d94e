//! Speech and language provider abstraction.
//!
//! Three capabilities, each with a buffered and a streaming call shape:
//! [`SttProvider`] (audio -> text), [`LlmProvider`] (prompt + history -> text)
//! and [`TtsProvider`] (text -> audio). Streaming shapes return a single lazy,
//! finite, single-consumer stream that ends when the upstream transport ends
//! or fails. Dropping a stream cancels the upstream call.
//!
//! Providers never retry. Failures surface as [`ProviderError`].

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use talkback_core::types::{Turn, VoiceOptions};

pub mod elevenlabs;
pub mod endpoint;
pub mod error;
pub mod factory;
pub mod google;
pub mod openai_tts;
pub mod sse;
pub mod whisper;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use error::ProviderError;
pub use factory::{build_llm_provider, build_stt_provider, build_tts_provider};

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Raw inbound audio chunks, in arrival order.
pub type AudioInput = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// Text fragments fed to a streaming synthesizer. An empty fragment means "flush, no more input".
pub type TextInput = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Final transcripts from a streaming recognizer.
pub type TranscriptStream = Pin<Box<dyn Stream<Item = ProviderResult<String>> + Send>>;

/// Text fragments from a streaming generation.
pub type TextStream = Pin<Box<dyn Stream<Item = ProviderResult<String>> + Send>>;

/// Synthesized audio chunks, in provider emission order.
pub type AudioStream = Pin<Box<dyn Stream<Item = ProviderResult<Bytes>> + Send>>;

#[async_trait]
pub trait SttProvider: Send + Sync {
    /// Provider identifier (e.g., "groq", "openai").
    fn id(&self) -> &str;

    /// Transcribe a complete audio clip.
    async fn transcribe(&self, audio: &[u8]) -> ProviderResult<String>;

    /// Transcribe incrementally pushed audio.
    ///
    /// Yields only final, stable transcripts; interim results are never emitted.
    async fn transcribe_stream(&self, audio: AudioInput) -> ProviderResult<TranscriptStream>;
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g., "google").
    fn id(&self) -> &str;

    /// Generate a full reply to `prompt`, with `history` as prior context.
    async fn generate(&self, prompt: &str, history: &[Turn]) -> ProviderResult<String>;

    /// Stream a reply fragment by fragment.
    async fn generate_stream(&self, prompt: &str, history: &[Turn]) -> ProviderResult<TextStream>;
}

#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Provider identifier (e.g., "elevenlabs").
    fn id(&self) -> &str;

    /// Synthesize a complete utterance.
    async fn synthesize(&self, text: &str, voice: &VoiceOptions) -> ProviderResult<Bytes>;

    /// Open a synthesis stream fed by `fragments`.
    ///
    /// Fragments may be merged into fewer audio chunks; only overall order is kept.
    async fn synthesize_stream(
        &self,
        fragments: TextInput,
        voice: &VoiceOptions,
    ) -> ProviderResult<AudioStream>;
}

pub(crate) fn require_text(text: &str, what: &str) -> ProviderResult<()> {
    if text.trim().is_empty() {
        return Err(ProviderError::InvalidInput(format!("{what} is empty")));
    }
    Ok(())
}

pub(crate) fn require_audio(audio: &[u8]) -> ProviderResult<()> {
    if audio.is_empty() {
        return Err(ProviderError::InvalidInput("audio is empty".into()));
    }
    Ok(())
}

/// Aborts a background task when dropped, tying its lifetime to a stream.
pub(crate) struct AbortOnDrop(pub tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
