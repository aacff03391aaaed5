use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scoop_core::ChatMessage;

/// How a fact was acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactSource {
    /// User explicitly stated this ("ლაქტოზაზე ალერგია მაქვს").
    UserStated,
    /// Inferred from conversation context.
    Inferred,
    /// Extracted during context-window compaction.
    Compaction,
}

impl std::fmt::Display for FactSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserStated => write!(f, "user_stated"),
            Self::Inferred => write!(f, "inferred"),
            Self::Compaction => write!(f, "compaction"),
        }
    }
}

/// Which bucket a fact landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactTier {
    Curated,
    Daily,
    Legacy,
}

/// A single long-term fact about a user, with its embedding for cosine
/// dedup and retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub text: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    /// 0.0–1.0; ≥ 0.8 routes to the curated tier.
    pub importance: f64,
    pub source: FactSource,
    #[serde(default)]
    pub is_sensitive: bool,
    /// Daily tier only; curated facts never expire.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// A weight measurement with optional note.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeightEntry {
    pub value: f64,
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Demographics {
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub occupation: Option<String>,
    #[serde(default)]
    pub occupation_category: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhysicalStats {
    #[serde(default)]
    pub height: Option<f64>,
    #[serde(default)]
    pub body_fat_percent: Option<f64>,
    #[serde(default)]
    pub weight_history: Vec<WeightEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lifestyle {
    #[serde(default)]
    pub workout_frequency: Option<String>,
    #[serde(default)]
    pub experience_years: Option<f64>,
    #[serde(default)]
    pub sleep_hours: Option<f64>,
    #[serde(default)]
    pub activity_level: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageStats {
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub session_count: u64,
    #[serde(default)]
    pub last_active: Option<DateTime<Utc>>,
}

/// Full user profile document. Never expires; created on first write and
/// destroyed only by an explicit erasure request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub allergies: Vec<String>,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub preferences: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub fitness_level: Option<String>,
    #[serde(default)]
    pub demographics: Demographics,
    #[serde(default)]
    pub physical_stats: PhysicalStats,
    #[serde(default)]
    pub lifestyle: Lifestyle,
    #[serde(default)]
    pub usage: UsageStats,
    /// High-importance facts, capped at 100, no TTL.
    #[serde(default)]
    pub curated_facts: Vec<Fact>,
    /// Lower-importance facts, capped at 200, ~60-day TTL.
    #[serde(default)]
    pub daily_facts: Vec<Fact>,
    /// Pre-tiered single bucket. Read-only: retrieval and dedup include
    /// it, writes never touch it.
    #[serde(default)]
    pub user_facts: Vec<Fact>,
}

impl UserProfile {
    /// Iterate facts across all three tiers (curated first).
    pub fn all_facts(&self) -> impl Iterator<Item = (&Fact, FactTier)> {
        self.curated_facts
            .iter()
            .map(|f| (f, FactTier::Curated))
            .chain(self.daily_facts.iter().map(|f| (f, FactTier::Daily)))
            .chain(self.user_facts.iter().map(|f| (f, FactTier::Legacy)))
    }

    /// Compact rendering of curated + daily fact texts for prompt
    /// injection, newest first within each tier.
    pub fn render_facts(&self, max_chars: usize) -> String {
        let mut out = String::new();
        for fact in self.curated_facts.iter().rev().chain(self.daily_facts.iter().rev()) {
            let line = format!("- {}\n", fact.text);
            if out.len() + line.len() > max_chars {
                break;
            }
            out.push_str(&line);
        }
        out
    }
}

/// Conversation metadata stored beside the history document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub last_topic: Option<String>,
    #[serde(default)]
    pub products_viewed: Vec<String>,
    #[serde(default)]
    pub products_recommended: Vec<String>,
}

fn default_language() -> String {
    "ka".to_string()
}

/// A session row loaded from the store.
#[derive(Debug, Clone)]
pub struct StoredSession {
    pub session_id: String,
    pub user_id: String,
    pub history: Vec<ChatMessage>,
    pub message_count: usize,
    pub token_estimate: u32,
    /// Short summary of previously pruned messages, if any.
    pub summary: Option<String>,
    pub metadata: SessionMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
