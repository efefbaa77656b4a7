//! Conversation transcript

/// Who said it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
}

/// Ordered, append-only log for the current connection
#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line, ignoring blank ones. Returns the stored entry.
    pub fn append(&mut self, speaker: Speaker, text: &str) -> Option<&TranscriptEntry> {
        if text.trim().is_empty() {
            return None;
        }
        self.entries.push(TranscriptEntry {
            speaker,
            text: text.to_string(),
        });
        self.entries.last()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
