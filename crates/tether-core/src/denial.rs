//! Permission-denial detection.
//!
//! The agent enforces its own permission policy and reports a refusal only as
//! free text inside an error tool result. Phrase matching is the sole signal
//! available, so the rules live behind [`DenialDetector`] and nothing else in
//! the crate knows what a denial looks like.

/// Classifies error tool-result text as a permission denial.
pub trait DenialDetector: Send + Sync {
    fn is_denial(&self, text: &str) -> bool;
}

/// Phrases the agent uses when it refuses a tool for lack of permission.
pub const DEFAULT_DENIAL_PHRASES: &[&str] = &[
    "requires approval",
    "requested permissions",
    "haven't granted",
];

/// Case-sensitive substring matcher over a fixed phrase list.
#[derive(Debug, Clone)]
pub struct PhraseDenialDetector {
    phrases: Vec<String>,
}

impl PhraseDenialDetector {
    pub fn new(phrases: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            phrases: phrases
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.is_empty())
                .collect(),
        }
    }

    /// Built-in phrases plus `extra`.
    pub fn with_extra(extra: &[String]) -> Self {
        Self::new(
            DEFAULT_DENIAL_PHRASES
                .iter()
                .map(|p| (*p).to_string())
                .chain(extra.iter().cloned()),
        )
    }

    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }
}

impl Default for PhraseDenialDetector {
    fn default() -> Self {
        Self::new(DEFAULT_DENIAL_PHRASES.iter().copied())
    }
}

impl DenialDetector for PhraseDenialDetector {
    fn is_denial(&self, text: &str) -> bool {
        self.phrases.iter().any(|phrase| text.contains(phrase.as_str()))
    }
}
