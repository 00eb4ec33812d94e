//! End-of-speech detection over 16-bit little-endian PCM.
//!
//! Used by recognizers without native streaming to decide when an utterance
//! is complete: speech must be heard first, then sustained silence.

/// Energy-based utterance endpointer.
#[derive(Debug, Clone)]
pub struct SpeechEndpointer {
    threshold: f64,
    silence_frames_needed: usize,
    frame_samples: usize,
    heard_speech: bool,
    silent_frames: usize,
    pending: Vec<i16>,
    carry: Option<u8>,
}

impl SpeechEndpointer {
    pub fn new(threshold: f64, silence_frames_needed: usize, frame_samples: usize) -> Self {
        Self {
            threshold,
            silence_frames_needed,
            frame_samples,
            heard_speech: false,
            silent_frames: 0,
            pending: Vec::new(),
            carry: None,
        }
    }

    /// 20ms frames at 16kHz, ~700ms of trailing silence ends an utterance.
    pub fn default_16khz() -> Self {
        Self::new(300.0, 35, 320)
    }

    /// Root-mean-square energy of a frame.
    pub fn rms(samples: &[i16]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
        (sum / samples.len() as f64).sqrt()
    }

    /// Feed raw bytes; returns true when an utterance has just ended.
    ///
    /// Odd trailing bytes are carried into the next call.
    pub fn push(&mut self, bytes: &[u8]) -> bool {
        let mut input = bytes;
        if let Some(lo) = self.carry.take() {
            match input.split_first() {
                Some((&hi, rest)) => {
                    self.pending.push(i16::from_le_bytes([lo, hi]));
                    input = rest;
                }
                None => {
                    self.carry = Some(lo);
                    return false;
                }
            }
        }

        let mut pairs = input.chunks_exact(2);
        self.pending
            .extend(pairs.by_ref().map(|c| i16::from_le_bytes([c[0], c[1]])));
        if let [b] = pairs.remainder() {
            self.carry = Some(*b);
        }

        let mut ended = false;
        while self.pending.len() >= self.frame_samples {
            let frame: Vec<i16> = self.pending.drain(..self.frame_samples).collect();
            if Self::rms(&frame) > self.threshold {
                self.heard_speech = true;
                self.silent_frames = 0;
            } else if self.heard_speech {
                self.silent_frames += 1;
                if self.silent_frames >= self.silence_frames_needed {
                    ended = true;
                    self.heard_speech = false;
                    self.silent_frames = 0;
                }
            }
        }
        ended
    }

    pub fn heard_speech(&self) -> bool {
        self.heard_speech
    }

    pub fn reset(&mut self) {
        self.heard_speech = false;
        self.silent_frames = 0;
        self.pending.clear();
        self.carry = None;
    }
}
