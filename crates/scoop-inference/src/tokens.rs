use scoop_core::{ChatMessage, Part};

/// Fixed structural overhead added per message when counting histories.
const PER_MESSAGE_OVERHEAD: u32 = 10;

/// Heuristic token counter for routing decisions.
///
/// Character-class counting, no API call: ASCII at `chars_per_token`,
/// everything else at `chars_per_token / unicode_multiplier` — Georgian
/// text tokenises much denser than English. Precision is not required;
/// the extended threshold sits at 75% of the smallest model's context.
#[derive(Debug, Clone)]
pub struct TokenEstimator {
    chars_per_token: f64,
    unicode_multiplier: f64,
    extended_threshold: u32,
}

impl TokenEstimator {
    pub fn new(extended_threshold: u32) -> Self {
        Self {
            chars_per_token: 4.0,
            unicode_multiplier: 2.0,
            extended_threshold,
        }
    }

    pub fn extended_threshold(&self) -> u32 {
        self.extended_threshold
    }

    /// Estimate the token count of a single string.
    pub fn estimate(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }

        let mut ascii_chars = 0u64;
        let mut unicode_chars = 0u64;
        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                unicode_chars += 1;
            }
        }

        let ascii_tokens = ascii_chars as f64 / self.chars_per_token;
        let unicode_tokens =
            unicode_chars as f64 / (self.chars_per_token / self.unicode_multiplier);

        (ascii_tokens + unicode_tokens) as u32
    }

    /// Estimate tokens across a history: text parts plus a fixed
    /// per-message overhead for role and structure.
    pub fn count_history(&self, history: &[ChatMessage]) -> u32 {
        history
            .iter()
            .map(|msg| {
                let text_tokens: u32 = msg
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        Part::Text { text } => Some(self.estimate(text)),
                        _ => None,
                    })
                    .sum();
                text_tokens + PER_MESSAGE_OVERHEAD
            })
            .sum()
    }

    pub fn needs_extended(&self, history: &[ChatMessage]) -> bool {
        self.count_history(history) >= self.extended_threshold
    }
}
