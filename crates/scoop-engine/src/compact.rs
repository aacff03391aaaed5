use std::sync::Arc;

use tracing::{info, warn};

use scoop_core::{ChatMessage, Part};
use scoop_inference::{ModelConfig, TokenEstimator};
use scoop_memory::{FactInsert, FactSource, MemoryStore};

use crate::extract::FactExtractor;
use crate::provider::LlmClient;

/// Summary temperature is deliberately conservative.
const SUMMARY_TEMPERATURE: f32 = 0.3;
/// Summary output cap (~500 tokens).
const SUMMARY_MAX_TOKENS: u32 = 512;

const SUMMARY_PROMPT: &str = "\
შეაჯამე ეს საუბარი მოკლედ (მაქსიმუმ 500 ტოკენი): რა უნდოდა მომხმარებელს, \
რა ურჩიეს, რა პროდუქტები განიხილეს. შეინარჩუნე ყველა მნიშვნელოვანი ფაქტი \
მომხმარებელზე.";

/// Context-window compactor.
///
/// When the combined prompt budget crosses the configured fraction of the
/// target model's context and the history is long enough, the oldest half
/// is flushed to the fact store and replaced with an LLM summary message.
pub struct ContextCompactor {
    llm: Arc<dyn LlmClient>,
    store: Arc<MemoryStore>,
    extractor: FactExtractor,
    summary_model: String,
    context_fraction: f64,
    min_messages: usize,
}

impl ContextCompactor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<MemoryStore>,
        summary_model: impl Into<String>,
    ) -> Self {
        let summary_model = summary_model.into();
        let config = store.config().clone();
        Self {
            extractor: FactExtractor::new(Arc::clone(&llm), summary_model.clone()),
            llm,
            store,
            summary_model,
            context_fraction: config.compact_context_fraction,
            min_messages: config.compact_min_messages,
        }
    }

    /// Compact the history if the trigger condition holds, otherwise
    /// return it unchanged. On summarization failure the original
    /// history is returned — compaction must never lose messages.
    pub async fn maybe_compact(
        &self,
        user_id: &str,
        history: Vec<ChatMessage>,
        system_prompt_tokens: u32,
        model_config: &ModelConfig,
        estimator: &TokenEstimator,
    ) -> Vec<ChatMessage> {
        let history_tokens = estimator.count_history(&history);
        let budget = (model_config.max_context as f64 * self.context_fraction) as u32;
        let total = system_prompt_tokens + history_tokens;

        if total < budget || history.len() < self.min_messages {
            return history;
        }

        info!(
            user_id,
            total_tokens = total,
            budget,
            messages = history.len(),
            "compaction triggered"
        );

        let split = history.len() / 2;
        let (head, tail) = history.split_at(split);

        // Pre-flush facts from the head BEFORE any truncation. Zero
        // extracted facts is fine; compaction proceeds regardless.
        let extracted = self.extractor.extract(head).await;
        let mut flushed = 0usize;
        for fact in extracted {
            match self.llm.embed(&fact.fact).await {
                Ok(embedding) => {
                    let insert = FactInsert {
                        text: fact.fact.clone(),
                        embedding,
                        importance: fact.importance,
                        source: FactSource::Compaction,
                        is_sensitive: fact.is_sensitive(),
                    };
                    match self.store.add_user_fact(user_id, insert) {
                        Ok(_) => flushed += 1,
                        Err(e) => warn!(error = %e, fact = %fact.fact, "fact flush rejected"),
                    }
                }
                Err(e) => warn!(error = %e, "fact embedding failed"),
            }
        }

        // Summarize the head. Failure aborts compaction entirely.
        let transcript: String = head
            .iter()
            .filter_map(|m| {
                let text = m.visible_text();
                let text = text.trim().to_string();
                (!text.is_empty()).then(|| format!("{}: {}", m.role, text))
            })
            .collect::<Vec<_>>()
            .join("\n");

        let summary = match self
            .llm
            .generate(
                &self.summary_model,
                SUMMARY_PROMPT,
                &transcript,
                SUMMARY_TEMPERATURE,
                SUMMARY_MAX_TOKENS,
            )
            .await
        {
            Ok(response) => {
                let text: String = response.parts.iter().filter_map(Part::as_text).collect();
                if text.trim().is_empty() {
                    warn!(user_id, "empty summary, aborting compaction");
                    return rejoin(head, tail);
                }
                text
            }
            Err(e) => {
                warn!(user_id, error = %e, "summarization failed, aborting compaction");
                return rejoin(head, tail);
            }
        };

        info!(
            user_id,
            pruned = head.len(),
            kept = tail.len(),
            facts_flushed = flushed,
            "history compacted"
        );

        let mut compacted = Vec::with_capacity(tail.len() + 1);
        compacted.push(ChatMessage::user_text(format!(
            "[წინა საუბრის შეჯამება] {}",
            summary.trim()
        )));
        compacted.extend_from_slice(tail);
        compacted
    }
}

fn rejoin(head: &[ChatMessage], tail: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut all = Vec::with_capacity(head.len() + tail.len());
    all.extend_from_slice(head);
    all.extend_from_slice(tail);
    all
}
