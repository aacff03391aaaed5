use chrono::{Duration, Utc};
use tracing::{debug, info};

use scoop_core::config::{
    CURATED_FACTS_CAP, CURATED_IMPORTANCE_THRESHOLD, DAILY_FACTS_CAP, EMBEDDING_DIMS,
    FACT_DUP_SIMILARITY, SENSITIVE_IMPORTANCE_FLOOR,
};

use crate::error::{MemoryError, Result};
use crate::store::MemoryStore;
use crate::types::{Fact, FactSource, FactTier};

/// Weights for the blended retrieval score.
const VECTOR_WEIGHT: f64 = 0.7;
const KEYWORD_WEIGHT: f64 = 0.3;

/// A fact candidate for insertion.
#[derive(Debug, Clone)]
pub struct FactInsert {
    pub text: String,
    pub embedding: Vec<f32>,
    pub importance: f64,
    pub source: FactSource,
    pub is_sensitive: bool,
}

/// Outcome of an insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactInsertOutcome {
    Added(FactTier),
    /// Cosine similarity above 0.90 against an existing fact in any tier.
    Duplicate,
}

/// Retrieval request for `get_relevant_facts`.
#[derive(Debug, Clone)]
pub struct FactQuery<'a> {
    pub embedding: &'a [f32],
    /// Optional raw query text; enables the keyword component.
    pub text: Option<&'a str>,
    pub limit: usize,
    pub min_similarity: f64,
}

impl MemoryStore {
    /// Insert a fact into the tiered store.
    ///
    /// Validation, cosine dedup across all three tiers, importance-based
    /// tier choice, and the slice-from-tail bucket caps all happen here.
    /// Sensitive (health/allergy) facts get an importance floor of 0.85,
    /// which lands them in the curated tier.
    pub fn add_user_fact(&self, user_id: &str, insert: FactInsert) -> Result<FactInsertOutcome> {
        if insert.text.chars().count() < 10 {
            return Err(MemoryError::InvalidFact(format!(
                "fact too short: {:?}",
                insert.text
            )));
        }
        if !EMBEDDING_DIMS.contains(&insert.embedding.len()) {
            return Err(MemoryError::InvalidFact(format!(
                "unsupported embedding dimension {}",
                insert.embedding.len()
            )));
        }

        let mut profile = self.get_profile(user_id)?;

        for (existing, tier) in profile.all_facts() {
            let similarity = cosine_similarity(&existing.embedding, &insert.embedding);
            if similarity > FACT_DUP_SIMILARITY {
                debug!(
                    user_id,
                    similarity,
                    ?tier,
                    text = %insert.text,
                    "duplicate fact rejected"
                );
                return Ok(FactInsertOutcome::Duplicate);
            }
        }

        let importance = if insert.is_sensitive {
            insert.importance.max(SENSITIVE_IMPORTANCE_FLOOR)
        } else {
            insert.importance
        };

        let tier = if importance >= CURATED_IMPORTANCE_THRESHOLD {
            FactTier::Curated
        } else {
            FactTier::Daily
        };

        let fact = Fact {
            text: insert.text,
            embedding: insert.embedding,
            created_at: Utc::now(),
            importance,
            source: insert.source,
            is_sensitive: insert.is_sensitive,
            expires_at: match tier {
                FactTier::Daily => {
                    Some(Utc::now() + Duration::days(self.config().daily_fact_ttl_days))
                }
                _ => None,
            },
        };

        match tier {
            FactTier::Curated => {
                profile.curated_facts.push(fact);
                cap_from_tail(&mut profile.curated_facts, CURATED_FACTS_CAP);
            }
            FactTier::Daily => {
                profile.daily_facts.push(fact);
                cap_from_tail(&mut profile.daily_facts, DAILY_FACTS_CAP);
            }
            FactTier::Legacy => unreachable!("legacy tier is read-only"),
        }

        self.save_profile(user_id, &profile)?;
        Ok(FactInsertOutcome::Added(tier))
    }

    /// Retrieve the facts most relevant to a query.
    ///
    /// Score = 0.7·cosine + 0.3·keyword-overlap (keyword part only when
    /// query text is supplied). Filtered by `min_similarity`, sorted by
    /// blended score with importance as the tiebreaker — which is what
    /// ranks curated facts ahead of daily/legacy at equal score.
    pub fn get_relevant_facts(&self, user_id: &str, query: FactQuery<'_>) -> Result<Vec<Fact>> {
        let profile = self.get_profile(user_id)?;

        let mut scored: Vec<(f64, Fact)> = profile
            .all_facts()
            .map(|(fact, _tier)| {
                let vector = cosine_similarity(&fact.embedding, query.embedding);
                let keyword = query
                    .text
                    .map(|q| keyword_overlap(&fact.text, q))
                    .unwrap_or(0.0);
                let blended = VECTOR_WEIGHT * vector + KEYWORD_WEIGHT * keyword;
                (blended, fact.clone())
            })
            .filter(|(score, _)| *score >= query.min_similarity)
            .collect();

        scored.sort_by(|(sa, fa), (sb, fb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    fb.importance
                        .partial_cmp(&fa.importance)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });

        Ok(scored
            .into_iter()
            .take(query.limit)
            .map(|(_, f)| f)
            .collect())
    }

    /// Remove expired daily facts for every user in one pass.
    /// Returns the number of facts removed.
    pub fn cleanup_expired_daily_facts(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0usize;

        for user_id in self.all_user_ids()? {
            let mut profile = self.get_profile(&user_id)?;
            let before = profile.daily_facts.len();
            profile
                .daily_facts
                .retain(|f| f.expires_at.map(|exp| exp >= now).unwrap_or(true));
            let dropped = before - profile.daily_facts.len();
            if dropped > 0 {
                self.save_profile(&user_id, &profile)?;
                removed += dropped;
            }
        }

        if removed > 0 {
            info!(removed, "expired daily facts swept");
        }
        Ok(removed)
    }
}

/// Keep the most recent `cap` entries (insertion order = age order).
fn cap_from_tail(facts: &mut Vec<Fact>, cap: usize) {
    if facts.len() > cap {
        facts.drain(..facts.len() - cap);
    }
}

/// Cosine similarity of two vectors; 0.0 on dimension mismatch or zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        norm_a += *x as f64 * *x as f64;
        norm_b += *y as f64 * *y as f64;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Token-overlap ratio of the query against a fact's text.
fn keyword_overlap(fact_text: &str, query_text: &str) -> f64 {
    let fact_tokens: std::collections::HashSet<String> = tokenize(fact_text);
    let query_tokens: std::collections::HashSet<String> = tokenize(query_text);
    if query_tokens.is_empty() {
        return 0.0;
    }
    let hits = query_tokens.intersection(&fact_tokens).count();
    hits as f64 / query_tokens.len() as f64
}

fn tokenize(text: &str) -> std::collections::HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(|t| t.to_lowercase())
        .collect()
}
