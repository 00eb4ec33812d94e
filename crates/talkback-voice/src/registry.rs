//! Per-connection provider stream bookkeeping.
//!
//! Each live connection owns at most one STT and one TTS [`StreamHandle`].
//! Attaching a handle of a kind tears down the previous one of that kind.
//! Release is idempotent, so end-of-turn, error, and disconnect paths can all
//! call it without coordinating.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stt,
    Tts,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stt => f.write_str("stt"),
            Self::Tts => f.write_str("tts"),
        }
    }
}

/// A live provider stream owned by one connection.
pub struct StreamHandle {
    id: u64,
    connection_id: String,
    kind: StreamKind,
    cancel: CancellationToken,
    released: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
    audio_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

impl StreamHandle {
    /// `cancel` is usually a child of the connection's token.
    pub fn new(connection_id: &str, kind: StreamKind, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            connection_id: connection_id.to_string(),
            kind,
            cancel,
            released: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            audio_tx: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_live(&self) -> bool {
        !self.released.load(Ordering::Acquire)
    }

    /// Install the sender feeding this stream's provider with audio.
    pub fn set_audio_sender(&self, tx: mpsc::UnboundedSender<Bytes>) {
        if self.is_live() {
            *lock(&self.audio_tx) = Some(tx);
        }
    }

    /// Forward one audio chunk. Returns false if the stream no longer accepts audio.
    pub fn send_audio(&self, chunk: Bytes) -> bool {
        lock(&self.audio_tx)
            .as_ref()
            .is_some_and(|tx| tx.send(chunk).is_ok())
    }

    /// Signal end of audio input; the provider sees its input stream end.
    pub fn close_input(&self) {
        lock(&self.audio_tx).take();
    }

    /// Tie a background task to this handle. Aborted immediately if already released.
    pub fn track(&self, task: AbortHandle) {
        let mut tasks = lock(&self.tasks);
        if self.is_live() {
            tasks.push(task);
        } else {
            task.abort();
        }
    }

    /// Tear the stream down. Returns true only for the call that actually released it.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        lock(&self.audio_tx).take();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        debug!(connection = %self.connection_id, kind = %self.kind, handle = self.id, "Stream released");
        true
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct ConnectionStreams {
    stt: Option<Arc<StreamHandle>>,
    tts: Option<Arc<StreamHandle>>,
}

impl ConnectionStreams {
    fn slot(&mut self, kind: StreamKind) -> &mut Option<Arc<StreamHandle>> {
        match kind {
            StreamKind::Stt => &mut self.stt,
            StreamKind::Tts => &mut self.tts,
        }
    }

    fn is_empty(&self) -> bool {
        self.stt.is_none() && self.tts.is_none()
    }
}

/// Connection-keyed map of open stream handles.
#[derive(Default)]
pub struct SessionRegistry {
    connections: Mutex<HashMap<String, ConnectionStreams>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` for its connection, releasing any prior handle of the same kind.
    pub fn attach(&self, handle: Arc<StreamHandle>) {
        let prior = {
            let mut connections = lock(&self.connections);
            connections
                .entry(handle.connection_id().to_string())
                .or_default()
                .slot(handle.kind())
                .replace(handle)
        };
        if let Some(prior) = prior {
            prior.release();
        }
    }

    pub fn get(&self, connection_id: &str, kind: StreamKind) -> Option<Arc<StreamHandle>> {
        lock(&self.connections)
            .get_mut(connection_id)
            .and_then(|c| c.slot(kind).clone())
    }

    /// Remove and release the handle of `kind`. Returns true if one was attached.
    pub fn detach(&self, connection_id: &str, kind: StreamKind) -> bool {
        let Some(handle) = self.take(connection_id, kind, None) else {
            return false;
        };
        handle.release();
        true
    }

    /// Like [`detach`](Self::detach), but only if the attached handle is `handle_id`.
    ///
    /// Lets a finished stream clean up after itself without touching a newer replacement.
    pub fn detach_if(&self, connection_id: &str, kind: StreamKind, handle_id: u64) -> bool {
        let Some(handle) = self.take(connection_id, kind, Some(handle_id)) else {
            return false;
        };
        handle.release();
        true
    }

    /// Release every handle of a connection and forget it. Returns how many were attached.
    pub fn release_all(&self, connection_id: &str) -> usize {
        let removed = lock(&self.connections).remove(connection_id);
        let Some(streams) = removed else {
            return 0;
        };
        let handles: Vec<_> = [streams.stt, streams.tts].into_iter().flatten().collect();
        for handle in &handles {
            handle.release();
        }
        handles.len()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn handle_count(&self) -> usize {
        lock(&self.connections)
            .values()
            .map(|c| usize::from(c.stt.is_some()) + usize::from(c.tts.is_some()))
            .sum()
    }

    fn take(&self, connection_id: &str, kind: StreamKind, handle_id: Option<u64>) -> Option<Arc<StreamHandle>> {
        let mut connections = lock(&self.connections);
        let streams = connections.get_mut(connection_id)?;
        let slot = streams.slot(kind);
        if handle_id.is_some_and(|id| slot.as_ref().map(|h| h.id()) != Some(id)) {
            return None;
        }
        let handle = slot.take();
        if streams.is_empty() {
            connections.remove(connection_id);
        }
        handle
    }
}
