//! Whisper-compatible speech-to-text (Groq, OpenAI).
//!
//! The upstream API is request/response only. Streaming recognition buffers
//! pushed audio and transcribes once per utterance, where an utterance ends on
//! input close or on detected end of speech.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tracing::{debug, warn};

use crate::endpoint::SpeechEndpointer;
use crate::error::check_status;
use crate::{AudioInput, ProviderError, ProviderResult, SttProvider, TranscriptStream, require_audio};

const SAMPLE_RATE: u32 = 16_000;

/// Wrap raw 16-bit PCM bytes in a WAV container.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Vec<u8> {
    let bits_per_sample: u16 = 16;
    let data_len = pcm.len() as u32;
    let byte_rate = sample_rate * u32::from(channels) * u32::from(bits_per_sample) / 8;
    let block_align = channels * bits_per_sample / 8;

    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());

    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

/// Containers the upstream API accepts directly, by magic bytes.
fn sniff_container(audio: &[u8]) -> Option<(&'static str, &'static str)> {
    if audio.starts_with(b"RIFF") {
        Some(("audio.wav", "audio/wav"))
    } else if audio.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        Some(("audio.webm", "audio/webm"))
    } else if audio.starts_with(b"OggS") {
        Some(("audio.ogg", "audio/ogg"))
    } else if audio.starts_with(b"ID3") || audio.starts_with(&[0xFF, 0xFB]) {
        Some(("audio.mp3", "audio/mpeg"))
    } else {
        None
    }
}

#[derive(Clone)]
pub struct WhisperStt {
    provider: String,
    url: String,
    api_key: Option<String>,
    model: String,
    endpointing: bool,
    client: reqwest::Client,
}

impl WhisperStt {
    pub fn new(provider: &str, base_url: Option<&str>, api_key: Option<String>, model: Option<&str>) -> Self {
        let url = match (base_url, provider) {
            (Some(base), _) => format!("{}/audio/transcriptions", base.trim_end_matches('/')),
            (None, "openai") => "https://api.openai.com/v1/audio/transcriptions".to_string(),
            (None, _) => "https://api.groq.com/openai/v1/audio/transcriptions".to_string(),
        };
        let default_model = if provider == "openai" { "whisper-1" } else { "whisper-large-v3-turbo" };
        Self {
            provider: provider.to_string(),
            url,
            api_key,
            model: model.unwrap_or(default_model).to_string(),
            endpointing: true,
            client: reqwest::Client::new(),
        }
    }

    /// Disable silence-based utterance detection; only input close ends an utterance.
    pub fn without_endpointing(mut self) -> Self {
        self.endpointing = false;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn upload(&self, audio: &[u8]) -> ProviderResult<String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::unavailable("No transcription API key configured"))?;

        let (file_name, mime, body) = match sniff_container(audio) {
            Some((name, mime)) => (name, mime, audio.to_vec()),
            None => ("audio.wav", "audio/wav", pcm_to_wav(audio, SAMPLE_RATE, 1)),
        };

        debug!(url = %self.url, model = %self.model, bytes = body.len(), "Sending audio for transcription");

        let part = reqwest::multipart::Part::bytes(body)
            .file_name(file_name)
            .mime_str(mime)?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "text")
            .part("file", part);

        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await?;
        let resp = check_status(resp, "Transcription").await?;
        Ok(resp.text().await?.trim().to_string())
    }
}

struct RecognizerState {
    stt: std::sync::Arc<WhisperStt>,
    audio: AudioInput,
    buffer: BytesMut,
    endpointer: Option<SpeechEndpointer>,
    input_done: bool,
}

impl RecognizerState {
    /// Pull audio until an utterance boundary; `None` once input is exhausted.
    async fn next_utterance(&mut self) -> Option<Bytes> {
        while !self.input_done {
            match self.audio.next().await {
                Some(chunk) => {
                    self.buffer.extend_from_slice(&chunk);
                    let ended = self.endpointer.as_mut().is_some_and(|ep| ep.push(&chunk));
                    if ended {
                        return Some(self.buffer.split().freeze());
                    }
                }
                None => self.input_done = true,
            }
        }
        (!self.buffer.is_empty()).then(|| self.buffer.split().freeze())
    }
}

#[async_trait]
impl SttProvider for WhisperStt {
    fn id(&self) -> &str {
        &self.provider
    }

    async fn transcribe(&self, audio: &[u8]) -> ProviderResult<String> {
        require_audio(audio)?;
        self.upload(audio).await
    }

    async fn transcribe_stream(&self, audio: AudioInput) -> ProviderResult<TranscriptStream> {
        if self.api_key.is_none() {
            return Err(ProviderError::unavailable("No transcription API key configured"));
        }

        let state = RecognizerState {
            stt: std::sync::Arc::new(self.clone()),
            audio,
            buffer: BytesMut::new(),
            endpointer: self.endpointing.then(SpeechEndpointer::default_16khz),
            input_done: false,
        };

        let transcripts = futures::stream::unfold(state, |mut state| async move {
            loop {
                let utterance = state.next_utterance().await?;
                match state.stt.upload(&utterance).await {
                    Ok(text) if text.is_empty() => {
                        debug!("Empty transcript, waiting for more audio");
                        continue;
                    }
                    Ok(text) => return Some((Ok(text), state)),
                    Err(e) => {
                        warn!(%e, "Streaming transcription failed");
                        state.input_done = true;
                        state.buffer.clear();
                        return Some((Err(e), state));
                    }
                }
            }
        });

        Ok(Box::pin(transcripts))
    }
}
