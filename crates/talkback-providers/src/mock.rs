//! Scripted in-process providers for tests.
//!
//! Enabled in this crate's own tests and, for dependents, via the `test-utils` feature.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::Notify;

use talkback_core::types::{Turn, VoiceOptions};

use crate::{
    AudioInput, AudioStream, LlmProvider, ProviderError, ProviderResult, SttProvider, TextInput,
    TextStream, TranscriptStream, TtsProvider, require_audio, require_text,
};

// --- STT ---

/// Returns scripted transcripts in order; repeats the last one when exhausted.
#[derive(Default)]
pub struct ScriptedStt {
    transcripts: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    final_after_chunks: Option<usize>,
    open_delay: Option<Duration>,
    fail: bool,
    transcribe_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    audio_bytes: Arc<AtomicUsize>,
}

impl ScriptedStt {
    pub fn new<I, S>(transcripts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            transcripts: Mutex::new(transcripts.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    /// Emit a final transcript after `n` chunks, without waiting for input to close.
    pub fn final_after_chunks(mut self, n: usize) -> Self {
        self.final_after_chunks = Some(n);
        self
    }

    /// Sleep this long inside `transcribe_stream` before the stream is returned.
    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn transcribe_calls(&self) -> usize {
        self.transcribe_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn audio_bytes(&self) -> usize {
        self.audio_bytes.load(Ordering::SeqCst)
    }

    fn next_transcript(&self) -> String {
        let mut last = self.last.lock().unwrap();
        if let Some(t) = self.transcripts.lock().unwrap().pop_front() {
            *last = t;
        }
        last.clone()
    }
}

#[async_trait]
impl SttProvider for ScriptedStt {
    fn id(&self) -> &str {
        "scripted-stt"
    }

    async fn transcribe(&self, audio: &[u8]) -> ProviderResult<String> {
        require_audio(audio)?;
        self.transcribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProviderError::unavailable("scripted STT failure"));
        }
        Ok(self.next_transcript())
    }

    async fn transcribe_stream(&self, mut audio: AudioInput) -> ProviderResult<TranscriptStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(ProviderError::unavailable("scripted STT failure"));
        }
        let transcript = self.next_transcript();
        let final_after = self.final_after_chunks;
        let counter = self.audio_bytes.clone();

        let stream = futures::stream::once(async move {
            let mut chunks = 0usize;
            while let Some(chunk) = audio.next().await {
                counter.fetch_add(chunk.len(), Ordering::SeqCst);
                chunks += 1;
                if final_after.is_some_and(|n| chunks >= n) {
                    return Some(Ok(transcript));
                }
            }
            (chunks > 0).then_some(Ok(transcript))
        })
        .filter_map(|t| async move { t });

        Ok(Box::pin(stream))
    }
}

// --- LLM ---

/// Streams scripted fragments; `generate` returns them joined.
#[derive(Default)]
pub struct ScriptedLlm {
    fragments: Vec<String>,
    gate: Option<Arc<Notify>>,
    fail_after: Option<usize>,
    calls: AtomicUsize,
    contexts: Mutex<Vec<(String, Vec<Turn>)>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Hold the stream open after the last fragment until `gate` is notified.
    pub fn with_gate(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Yield `n` fragments, then an error.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every `(prompt, history)` pair this provider was called with.
    pub fn contexts(&self) -> Vec<(String, Vec<Turn>)> {
        self.contexts.lock().unwrap().clone()
    }

    fn record(&self, prompt: &str, history: &[Turn]) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts
            .lock()
            .unwrap()
            .push((prompt.to_string(), history.to_vec()));
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn id(&self) -> &str {
        "scripted-llm"
    }

    async fn generate(&self, prompt: &str, history: &[Turn]) -> ProviderResult<String> {
        require_text(prompt, "prompt")?;
        self.record(prompt, history);
        if self.fail_after.is_some() {
            return Err(ProviderError::unavailable("scripted LLM failure"));
        }
        Ok(self.fragments.concat())
    }

    async fn generate_stream(&self, prompt: &str, history: &[Turn]) -> ProviderResult<TextStream> {
        require_text(prompt, "prompt")?;
        self.record(prompt, history);

        let fragments = self.fragments.clone();
        let gate = self.gate.clone();
        let fail_after = self.fail_after;

        let stream = futures::stream::unfold(0usize, move |i| {
            let fragments = fragments.clone();
            let gate = gate.clone();
            async move {
                if fail_after == Some(i) {
                    return Some((Err(ProviderError::unavailable("scripted LLM failure")), usize::MAX));
                }
                if i == usize::MAX {
                    return None;
                }
                if let Some(f) = fragments.get(i) {
                    return Some((Ok(f.clone()), i + 1));
                }
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                None
            }
        });

        Ok(Box::pin(stream))
    }
}

// --- TTS ---

#[derive(Default)]
struct TtsRecord {
    received: Mutex<Vec<String>>,
    emitted: Mutex<Vec<Bytes>>,
    streams_opened: AtomicUsize,
}

/// Echoes text back as audio bytes.
///
/// `batch(n)` merges every `n` fragments into one chunk, so chunk boundaries
/// differ from fragment boundaries.
#[derive(Default)]
pub struct EchoTts {
    batch: usize,
    hold: Option<Arc<Notify>>,
    close_after_chunks: Option<usize>,
    open_delay: Option<Duration>,
    fail_open: bool,
    record: Arc<TtsRecord>,
}

impl EchoTts {
    pub fn new() -> Self {
        Self {
            batch: 1,
            ..Default::default()
        }
    }

    pub fn batch(mut self, n: usize) -> Self {
        self.batch = n.max(1);
        self
    }

    /// After input is flushed, keep the stream open until `hold` is notified.
    pub fn hold_close(mut self, hold: Arc<Notify>) -> Self {
        self.hold = Some(hold);
        self
    }

    /// Close the stream on the provider side after `n` chunks, regardless of input.
    pub fn close_after_chunks(mut self, n: usize) -> Self {
        self.close_after_chunks = Some(n);
        self
    }

    /// Sleep this long inside `synthesize_stream`, like a slow socket handshake.
    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    pub fn failing() -> Self {
        Self {
            batch: 1,
            fail_open: true,
            ..Default::default()
        }
    }

    /// Fragments received across all streams, including flush markers.
    pub fn received(&self) -> Vec<String> {
        self.record.received.lock().unwrap().clone()
    }

    /// Chunks emitted across all streams, in emission order.
    pub fn emitted(&self) -> Vec<Bytes> {
        self.record.emitted.lock().unwrap().clone()
    }

    pub fn streams_opened(&self) -> usize {
        self.record.streams_opened.load(Ordering::SeqCst)
    }
}

struct EchoState {
    fragments: TextInput,
    batch: usize,
    pending: Vec<String>,
    emitted: usize,
    close_after: Option<usize>,
    input_done: bool,
    hold: Option<Arc<Notify>>,
    record: Arc<TtsRecord>,
}

impl EchoState {
    fn emit(&mut self) -> Bytes {
        let chunk = Bytes::from(self.pending.concat());
        self.pending.clear();
        self.emitted += 1;
        self.record.emitted.lock().unwrap().push(chunk.clone());
        chunk
    }
}

#[async_trait]
impl TtsProvider for EchoTts {
    fn id(&self) -> &str {
        "echo-tts"
    }

    async fn synthesize(&self, text: &str, _voice: &VoiceOptions) -> ProviderResult<Bytes> {
        require_text(text, "text")?;
        if self.fail_open {
            return Err(ProviderError::unavailable("scripted TTS failure"));
        }
        Ok(Bytes::from(text.to_string()))
    }

    async fn synthesize_stream(&self, fragments: TextInput, _voice: &VoiceOptions) -> ProviderResult<AudioStream> {
        if self.fail_open {
            return Err(ProviderError::unavailable("scripted TTS failure"));
        }
        self.record.streams_opened.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }

        let state = EchoState {
            fragments,
            batch: self.batch.max(1),
            pending: Vec::new(),
            emitted: 0,
            close_after: self.close_after_chunks,
            input_done: false,
            hold: self.hold.clone(),
            record: self.record.clone(),
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if state.close_after.is_some_and(|n| state.emitted >= n) {
                    return None;
                }
                if state.input_done {
                    if !state.pending.is_empty() {
                        let chunk = state.emit();
                        return Some((Ok(chunk), state));
                    }
                    if let Some(hold) = state.hold.take() {
                        hold.notified().await;
                    }
                    return None;
                }
                match state.fragments.next().await {
                    Some(fragment) => {
                        state.record.received.lock().unwrap().push(fragment.clone());
                        if fragment.is_empty() {
                            state.input_done = true;
                            continue;
                        }
                        state.pending.push(fragment);
                        if state.pending.len() >= state.batch {
                            let chunk = state.emit();
                            return Some((Ok(chunk), state));
                        }
                    }
                    None => state.input_done = true,
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
