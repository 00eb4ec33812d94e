//! Server-Sent Events decoding.
//!
//! [`SseDecoder`] is a push parser over arbitrary byte-chunk boundaries;
//! [`sse_events`] drives it from a `reqwest::Response` body.

use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::ProviderError;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE line parser.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completes.
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(ev) = self.dispatch() {
                    out.push(ev);
                }
            } else if line.starts_with(':') {
                // comment
            } else if let Some(v) = line.strip_prefix("event:") {
                self.event = Some(v.trim_start().to_string());
            } else if let Some(v) = line.strip_prefix("data:") {
                self.data.push(v.trim_start().to_string());
            }
        }
        out
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let mut events = self.push(&format!("{rest}\n"));
            if let Some(ev) = events.pop() {
                return Some(ev);
            }
        }
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();
        Some(SseEvent {
            event: self.event.take(),
            data,
        })
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

struct SseState {
    body: ByteStream,
    decoder: SseDecoder,
    ready: std::collections::VecDeque<SseEvent>,
    done: bool,
}

/// Decode a response body as a stream of SSE events.
pub fn sse_events(
    response: reqwest::Response,
) -> impl Stream<Item = Result<SseEvent, ProviderError>> + Send {
    let state = SseState {
        body: Box::pin(response.bytes_stream()),
        decoder: SseDecoder::new(),
        ready: Default::default(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(ev) = state.ready.pop_front() {
                return Some((Ok(ev), state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let events = state.decoder.push(&String::from_utf8_lossy(&chunk));
                    state.ready.extend(events);
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(ProviderError::unavailable(format!("SSE stream error: {e}"))), state));
                }
                None => {
                    state.done = true;
                    state.ready.extend(state.decoder.finish());
                }
            }
        }
    })
}
