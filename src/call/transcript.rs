//! Transcript assembly from incremental speech-to-text fragments.
//!
//! Fragments are cumulative: each one carries the full text of the speaker's
//! current utterance so far, so an open entry is replaced rather than
//! appended to. A turn boundary closes the open entries of both speakers.
//!
//! Only the last entry is ever rewritten. A fragment that follows the other
//! speaker starts a new entry, so entry order stays conversation order.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// The human on the local microphone
    Operator,
    /// The remote conversational agent
    Agent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    #[serde(rename = "final")]
    pub is_final: bool,
}

#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    entries: Vec<TranscriptEntry>,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_fragment(&mut self, speaker: Speaker, text: &str) {
        let open = self
            .entries
            .last_mut()
            .filter(|e| e.speaker == speaker && !e.is_final);
        match open {
            Some(entry) => entry.text = text.to_string(),
            None => self.entries.push(TranscriptEntry {
                speaker,
                text: text.to_string(),
                is_final: false,
            }),
        }
    }

    /// Finalize every open entry.
    pub fn turn_complete(&mut self) {
        for entry in self.entries.iter_mut().filter(|e| !e.is_final) {
            entry.is_final = true;
        }
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
