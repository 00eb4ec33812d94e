//! ElevenLabs text-to-speech.
//!
//! Buffered synthesis uses the REST endpoint. Streaming synthesis uses the
//! `stream-input` WebSocket: text is forwarded as it arrives, an empty text
//! message flushes and ends input, and base64 audio frames come back until
//! the server marks the stream final.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use talkback_core::types::VoiceOptions;

use crate::error::check_status;
use crate::{AbortOnDrop, AudioStream, ProviderError, ProviderResult, TextInput, TtsProvider, require_text};

const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io";
const DEFAULT_MODEL: &str = "eleven_turbo_v2";
const DEFAULT_OUTPUT_FORMAT: &str = "pcm_16000";

pub struct ElevenLabsTts {
    base_url: String,
    api_key: Option<String>,
    model: String,
    output_format: String,
    client: reqwest::Client,
}

impl ElevenLabsTts {
    pub fn new(
        base_url: Option<&str>,
        api_key: Option<String>,
        model: Option<&str>,
        output_format: Option<&str>,
    ) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            output_format: output_format.unwrap_or(DEFAULT_OUTPUT_FORMAT).to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn api_key(&self) -> ProviderResult<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::unavailable("No TTS API key configured"))
    }

    /// REST synthesis URL for a voice.
    pub fn speech_url(&self, voice_id: &str) -> String {
        format!(
            "{}/v1/text-to-speech/{voice_id}?output_format={}",
            self.base_url, self.output_format
        )
    }

    /// WebSocket input-streaming URL for a voice.
    pub fn stream_input_url(&self, voice_id: &str) -> String {
        let ws_base = self
            .base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!(
            "{ws_base}/v1/text-to-speech/{voice_id}/stream-input?model_id={}&output_format={}",
            self.model, self.output_format
        )
    }
}

fn voice_settings(voice: &VoiceOptions) -> serde_json::Value {
    json!({
        "stability": 0.5,
        "similarity_boost": 0.8,
        "speed": voice.speaking_rate,
    })
}

/// One server frame on the input-streaming socket.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamFrame {
    #[serde(default)]
    audio: Option<String>,
    #[serde(default)]
    is_final: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

enum FrameOutcome {
    Audio(Bytes),
    Skip,
    Done,
    Failed(ProviderError),
}

fn interpret_frame(text: &str) -> FrameOutcome {
    let frame: StreamFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            trace!(%e, "Unparseable TTS frame");
            return FrameOutcome::Skip;
        }
    };
    if let Some(err) = frame.error {
        let detail = frame.message.unwrap_or_default();
        return FrameOutcome::Failed(ProviderError::Unavailable(format!("ElevenLabs error {err}: {detail}")));
    }
    if let Some(audio) = frame.audio.filter(|a| !a.is_empty()) {
        return match STANDARD.decode(audio) {
            Ok(bytes) => FrameOutcome::Audio(Bytes::from(bytes)),
            Err(e) => FrameOutcome::Failed(ProviderError::unavailable(format!("bad audio frame: {e}"))),
        };
    }
    if frame.is_final == Some(true) {
        return FrameOutcome::Done;
    }
    FrameOutcome::Skip
}

#[async_trait]
impl TtsProvider for ElevenLabsTts {
    fn id(&self) -> &str {
        "elevenlabs"
    }

    async fn synthesize(&self, text: &str, voice: &VoiceOptions) -> ProviderResult<Bytes> {
        require_text(text, "text")?;
        let api_key = self.api_key()?;

        debug!(voice = %voice.voice_id, text_len = text.len(), "ElevenLabs synthesize");

        let resp = self
            .client
            .post(self.speech_url(&voice.voice_id))
            .header("xi-api-key", api_key)
            .json(&json!({
                "text": text,
                "model_id": self.model,
                "voice_settings": voice_settings(voice),
            }))
            .send()
            .await?;
        let resp = check_status(resp, "TTS").await?;
        Ok(resp.bytes().await?)
    }

    async fn synthesize_stream(&self, mut fragments: TextInput, voice: &VoiceOptions) -> ProviderResult<AudioStream> {
        let api_key = self.api_key()?.to_string();
        let url = self.stream_input_url(&voice.voice_id);

        debug!(voice = %voice.voice_id, model = %self.model, "Opening TTS input stream");

        let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut sink, mut source) = socket.split();

        let init = json!({
            "text": " ",
            "voice_settings": voice_settings(voice),
            "xi_api_key": api_key,
        });
        sink.send(Message::Text(init.to_string().into())).await?;

        // Text pump: fragments -> socket. An empty fragment (or end of input) closes input.
        let writer = tokio::spawn(async move {
            while let Some(fragment) = fragments.next().await {
                let last = fragment.is_empty();
                let msg = if last {
                    json!({ "text": "" })
                } else {
                    json!({ "text": fragment, "try_trigger_generation": true })
                };
                if sink.send(Message::Text(msg.to_string().into())).await.is_err() {
                    return;
                }
                if last {
                    return;
                }
            }
            let _ = sink.send(Message::Text(json!({ "text": "" }).to_string().into())).await;
        });

        let state = (source, AbortOnDrop(writer), false);
        let audio = futures::stream::unfold(state, |(mut source, writer, done)| async move {
            if done {
                return None;
            }
            loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => match interpret_frame(&text) {
                        FrameOutcome::Audio(bytes) => return Some((Ok(bytes), (source, writer, false))),
                        FrameOutcome::Skip => continue,
                        FrameOutcome::Done => return None,
                        FrameOutcome::Failed(e) => {
                            warn!(%e, "TTS stream reported an error");
                            return Some((Err(e), (source, writer, true)));
                        }
                    },
                    Some(Ok(Message::Binary(bytes))) => return Some((Ok(bytes), (source, writer, false))),
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Some((Err(e.into()), (source, writer, true))),
                }
            }
        });

        Ok(Box::pin(audio))
    }
}
