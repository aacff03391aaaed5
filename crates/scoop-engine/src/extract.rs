use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use scoop_core::{ChatMessage, LlmError};

use crate::provider::LlmClient;

/// Extraction retries on transient provider failures.
const MAX_ATTEMPTS: u32 = 3;
/// Base backoff, doubled per attempt.
const BACKOFF_MS: u64 = 500;

const EXTRACTION_PROMPT: &str = "\
გაანალიზე საუბრის ფრაგმენტი და ამოიღე მომხმარებლის გრძელვადიანი ფაქტები: \
მიზნები, ალერგიები, ჯანმრთელობა, პრეფერენციები, ფიზიკური მონაცემები. \
დააბრუნე მხოლოდ JSON მასივი ამ ფორმით: \
[{\"fact\": \"მოკლე ფაქტი\", \"importance\": 0.0-1.0, \"category\": \
\"health|allergy|goal|preference|physical|other\"}] \
მაქსიმუმ 10 ელემენტი. თუ არაფერია შესანახი, დააბრუნე [].";

/// One fact parsed out of the extraction response.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedFact {
    pub fact: String,
    #[serde(default = "default_importance")]
    pub importance: f64,
    #[serde(default)]
    pub category: String,
}

fn default_importance() -> f64 {
    0.5
}

impl ExtractedFact {
    /// Health/allergy facts carry a sensitivity flag; insertion floors
    /// their importance at 0.85.
    pub fn is_sensitive(&self) -> bool {
        matches!(self.category.as_str(), "health" | "allergy")
    }
}

/// LLM-backed fact extractor used before history pruning.
pub struct FactExtractor {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl FactExtractor {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    /// Extract facts from a message window. Returns `[]` on total
    /// failure — extraction is best-effort and never blocks compaction.
    pub async fn extract(&self, messages: &[ChatMessage]) -> Vec<ExtractedFact> {
        let transcript = transcript_of(messages);
        if transcript.trim().is_empty() {
            return Vec::new();
        }

        let mut backoff = Duration::from_millis(BACKOFF_MS);
        for attempt in 1..=MAX_ATTEMPTS {
            match self
                .llm
                .generate(&self.model, EXTRACTION_PROMPT, &transcript, 0.2, 1024)
                .await
            {
                Ok(response) => {
                    let text: String = response
                        .parts
                        .iter()
                        .filter_map(scoop_core::Part::as_text)
                        .collect();
                    let facts = parse_fact_array(&text);
                    debug!(count = facts.len(), "facts extracted");
                    return facts;
                }
                Err(e) if is_transient(&e) && attempt < MAX_ATTEMPTS => {
                    warn!(attempt, error = %e, "extraction retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    warn!(error = %e, "fact extraction failed");
                    return Vec::new();
                }
            }
        }
        Vec::new()
    }
}

fn is_transient(e: &LlmError) -> bool {
    matches!(
        e,
        LlmError::RateLimited { .. }
            | LlmError::Unavailable(_)
            | LlmError::Timeout { .. }
            | LlmError::Api { status: 500..=599, .. }
            | LlmError::Api { status: 429, .. }
    )
}

fn transcript_of(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter_map(|m| {
            let text = m.visible_text();
            let text = text.trim();
            (!text.is_empty()).then(|| format!("{}: {}", m.role, text))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Tolerant JSON-array parsing: accepts fenced blocks, recovers the
/// first `[...]` region, and strips trailing commas.
pub fn parse_fact_array(raw: &str) -> Vec<ExtractedFact> {
    let unfenced = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let candidate = match (unfenced.find('['), unfenced.rfind(']')) {
        (Some(s), Some(e)) if e > s => &unfenced[s..=e],
        _ => unfenced,
    };

    if let Ok(facts) = serde_json::from_str::<Vec<ExtractedFact>>(candidate) {
        return facts;
    }

    // Trailing commas before a closing bracket trip serde; scrub and retry.
    let scrubbed = Regex::new(r",\s*([\]}])")
        .unwrap()
        .replace_all(candidate, "$1")
        .to_string();
    match serde_json::from_str::<Vec<ExtractedFact>>(&scrubbed) {
        Ok(facts) => facts,
        Err(e) => {
            warn!(error = %e, raw = %candidate, "fact JSON parse failed");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_array_parses() {
        let facts = parse_fact_array(
            r#"[{"fact": "ალერგია ლაქტოზაზე", "importance": 0.9, "category": "allergy"}]"#,
        );
        assert_eq!(facts.len(), 1);
        assert!(facts[0].is_sensitive());
    }

    #[test]
    fn fenced_array_parses() {
        let facts = parse_fact_array(
            "```json\n[{\"fact\": \"მიზანი კუნთის მომატება\", \"importance\": 0.8, \"category\": \"goal\"}]\n```",
        );
        assert_eq!(facts.len(), 1);
        assert!(!facts[0].is_sensitive());
    }

    #[test]
    fn surrounding_prose_is_recovered() {
        let facts = parse_fact_array(
            "აი შედეგი: [{\"fact\": \"ვეგეტარიანელია და ეძებს მცენარეულ პროტეინს\", \"category\": \"preference\"}] იმედია გამოგადგება.",
        );
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].importance, 0.5);
    }

    #[test]
    fn trailing_commas_are_scrubbed() {
        let facts = parse_fact_array(
            r#"[{"fact": "წონა 82 კგ", "importance": 0.7, "category": "physical",},]"#,
        );
        assert_eq!(facts.len(), 1);
    }

    #[test]
    fn garbage_yields_empty() {
        assert!(parse_fact_array("ბოდიში, ვერ მოვახერხე").is_empty());
        assert!(parse_fact_array("").is_empty());
    }

    #[test]
    fn health_and_allergy_are_sensitive() {
        let health = ExtractedFact {
            fact: "აქვს დიაბეტი".to_string(),
            importance: 0.4,
            category: "health".to_string(),
        };
        assert!(health.is_sensitive());
        let pref = ExtractedFact {
            fact: "უყვარს შოკოლადის გემო".to_string(),
            importance: 0.4,
            category: "preference".to_string(),
        };
        assert!(!pref.is_sensitive());
    }
}
