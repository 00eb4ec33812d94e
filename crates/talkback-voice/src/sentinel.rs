//! In-band end markers in model output.
//!
//! The model ends replies with `[TURN_END]` or `[CONVERSATION_END]`. Markers
//! may arrive split across stream fragments, so the scanner holds back any
//! trailing text that could still grow into a marker.

use talkback_core::types::EndCondition;

pub struct SentinelScanner {
    markers: Vec<(String, EndCondition)>,
    held: String,
    condition: EndCondition,
    stopped: bool,
}

impl SentinelScanner {
    pub fn new(conversation_end: &str, turn_end: &str) -> Self {
        Self {
            markers: vec![
                (conversation_end.to_string(), EndCondition::ConversationEnd),
                (turn_end.to_string(), EndCondition::TurnEnd),
            ],
            held: String::new(),
            condition: EndCondition::Continue,
            stopped: false,
        }
    }

    /// Feed one fragment; returns the text that is safe to forward now.
    ///
    /// Once a marker is seen, every marker occurrence is stripped, the rest of
    /// the buffered text is returned and all later input is ignored.
    pub fn push(&mut self, fragment: &str) -> String {
        if self.stopped {
            return String::new();
        }
        self.held.push_str(fragment);

        let mut found = EndCondition::Continue;
        for (marker, condition) in &self.markers {
            if self.held.contains(marker.as_str()) {
                found = found.merge(*condition);
            }
        }

        if found != EndCondition::Continue {
            self.condition = found;
            self.stopped = true;
            let mut text = std::mem::take(&mut self.held);
            for (marker, _) in &self.markers {
                text = text.replace(marker.as_str(), "");
            }
            return text;
        }

        let keep_from = self.partial_marker_start();
        let ready = self.held[..keep_from].to_string();
        self.held.drain(..keep_from);
        ready
    }

    /// End of input: release any held text that never became a marker.
    pub fn finish(&mut self) -> String {
        self.stopped = true;
        std::mem::take(&mut self.held)
    }

    pub fn condition(&self) -> EndCondition {
        self.condition
    }

    /// True once a marker has been seen or input has finished.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Scan a complete reply in one go.
    pub fn scan_all(mut self, text: &str) -> (String, EndCondition) {
        let mut out = self.push(text);
        out.push_str(&self.finish());
        (out, self.condition)
    }

    /// Byte offset of the longest suffix of `held` that is a prefix of some marker.
    fn partial_marker_start(&self) -> usize {
        self.held
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| {
                let tail = &self.held[i..];
                self.markers.iter().any(|(m, _)| m.starts_with(tail))
            })
            .unwrap_or(self.held.len())
    }
}
