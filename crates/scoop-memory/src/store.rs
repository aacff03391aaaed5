use std::sync::Mutex;

use chrono::{Duration, Utc};
use rusqlite::Connection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use scoop_core::config::MemoryConfig;
use scoop_core::ChatMessage;

use crate::error::{MemoryError, Result};
use crate::types::{SessionMetadata, StoredSession, UserProfile};

/// Cap on the stored head summary; keeps the synthetic context prefix
/// well under a thousand tokens.
const SUMMARY_MAX_CHARS: usize = 1200;
/// Per-message excerpt length inside the head summary.
const SUMMARY_LINE_CHARS: usize = 80;

/// Thread-safe session/profile persistence.
///
/// Wraps a single SQLite connection in a `Mutex`. History is re-read at
/// the start of each request and written at the end; concurrent writers
/// to the same session resolve last-writer-wins.
pub struct MemoryStore {
    db: Mutex<Connection>,
    config: MemoryConfig,
}

impl MemoryStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection, config: MemoryConfig) -> Self {
        Self {
            db: Mutex::new(conn),
            config,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    // ── Sessions ────────────────────────────────────────────────────────────

    /// Load a session by id, falling back to the user's most recent
    /// session when no id is given. Expired rows are treated as absent.
    pub fn load_session(
        &self,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<Option<StoredSession>> {
        let db = self.db.lock().unwrap();
        let now = Utc::now().to_rfc3339();

        let row = match session_id {
            Some(sid) => db
                .query_row(
                    "SELECT session_id, user_id, history, message_count, token_estimate,
                            summary, summary_expires_at, metadata, created_at, updated_at
                     FROM conversations
                     WHERE session_id = ?1 AND expires_at > ?2",
                    rusqlite::params![sid, now],
                    row_to_session,
                )
                .map(Some),
            None => db
                .query_row(
                    "SELECT session_id, user_id, history, message_count, token_estimate,
                            summary, summary_expires_at, metadata, created_at, updated_at
                     FROM conversations
                     WHERE user_id = ?1 AND expires_at > ?2
                     ORDER BY created_at DESC
                     LIMIT 1",
                    rusqlite::params![user_id, now],
                    row_to_session,
                )
                .map(Some),
        };

        match row {
            Ok(s) => Ok(s),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MemoryError::Database(e)),
        }
    }

    /// Create an empty session row for a user.
    pub fn create_session(&self, user_id: &str) -> Result<StoredSession> {
        let now = Utc::now();
        let session_id = Uuid::new_v4().to_string();
        let expires = now + Duration::days(self.config.session_ttl_days);
        let metadata = SessionMetadata::default();

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO conversations
             (session_id, user_id, history, message_count, token_estimate,
              metadata, created_at, updated_at, expires_at)
             VALUES (?1, ?2, '[]', 0, 0, ?3, ?4, ?4, ?5)",
            rusqlite::params![
                session_id,
                user_id,
                serde_json::to_string(&metadata)?,
                now.to_rfc3339(),
                expires.to_rfc3339(),
            ],
        )?;

        debug!(user_id, session = %session_id, "session created");
        Ok(StoredSession {
            session_id,
            user_id: user_id.to_string(),
            history: Vec::new(),
            message_count: 0,
            token_estimate: 0,
            summary: None,
            metadata,
            created_at: now,
            updated_at: now,
        })
    }

    /// Persist a session's history.
    ///
    /// Applies the sliding-window policy: the most recent
    /// `history_window` messages are kept verbatim; the discarded head is
    /// folded into the stored summary so the context survives reloads.
    /// Refreshes the row's TTL.
    pub fn save_session(
        &self,
        session_id: &str,
        user_id: &str,
        history: &[ChatMessage],
        existing_summary: Option<&str>,
        metadata: &SessionMetadata,
    ) -> Result<()> {
        let window = self.config.history_window;
        let (summary, kept) = if history.len() > window {
            let pruned = &history[..history.len() - window];
            let summary = summarize_head(pruned, existing_summary);
            (Some(summary), &history[history.len() - window..])
        } else {
            (existing_summary.map(String::from), history)
        };

        let now = Utc::now();
        let expires = now + Duration::days(self.config.session_ttl_days);
        let summary_expires = summary
            .as_ref()
            .map(|_| (now + Duration::days(self.config.summary_ttl_days)).to_rfc3339());
        let token_estimate: u32 = kept
            .iter()
            .map(|m| (m.visible_text().chars().count() / 4) as u32 + 10)
            .sum();

        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE conversations
             SET history = ?1, message_count = ?2, token_estimate = ?3,
                 summary = ?4, summary_created_at = CASE WHEN ?4 IS NULL THEN NULL ELSE ?5 END,
                 summary_expires_at = ?6, metadata = ?7, updated_at = ?5, expires_at = ?8
             WHERE session_id = ?9 AND user_id = ?10",
            rusqlite::params![
                serde_json::to_string(kept)?,
                kept.len() as i64,
                token_estimate,
                summary,
                now.to_rfc3339(),
                summary_expires,
                serde_json::to_string(metadata)?,
                expires.to_rfc3339(),
                session_id,
                user_id,
            ],
        )?;
        if changed == 0 {
            return Err(MemoryError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }

        debug!(
            session = %session_id,
            kept = kept.len(),
            pruned = history.len().saturating_sub(kept.len()),
            "session saved"
        );
        Ok(())
    }

    /// Delete expired conversations and clear expired summaries.
    /// Returns the number of rows removed.
    pub fn sweep_expired_conversations(&self) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let removed = db.execute(
            "DELETE FROM conversations WHERE expires_at < ?1",
            rusqlite::params![now],
        )?;
        let cleared = db.execute(
            "UPDATE conversations
             SET summary = NULL, summary_created_at = NULL, summary_expires_at = NULL
             WHERE summary_expires_at IS NOT NULL AND summary_expires_at < ?1",
            rusqlite::params![now],
        )?;
        if removed > 0 || cleared > 0 {
            info!(removed, summaries_cleared = cleared, "conversation sweep");
        }
        Ok(removed)
    }

    // ── Profiles ────────────────────────────────────────────────────────────

    /// Load a user's profile, or a default one if none is stored yet.
    pub fn get_profile(&self, user_id: &str) -> Result<UserProfile> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT profile FROM users WHERE user_id = ?1",
            rusqlite::params![user_id],
            |row| row.get::<_, String>(0),
        ) {
            Ok(json) => Ok(serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!(user_id, error = %e, "profile JSON corrupt, starting fresh");
                UserProfile::default()
            })),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(UserProfile::default()),
            Err(e) => Err(MemoryError::Database(e)),
        }
    }

    /// Upsert the full profile document.
    pub fn save_profile(&self, user_id: &str, profile: &UserProfile) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let json = serde_json::to_string(profile)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO users (user_id, profile, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(user_id) DO UPDATE SET profile = ?2, updated_at = ?3",
            rusqlite::params![user_id, json, now],
        )?;
        Ok(())
    }

    /// Merge a flat field patch (from the profile-update tool) into the
    /// stored profile. Unknown keys land in `preferences`.
    pub fn update_profile_fields(
        &self,
        user_id: &str,
        patch: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<UserProfile> {
        let mut profile = self.get_profile(user_id)?;
        apply_profile_patch(&mut profile, patch);
        self.save_profile(user_id, &profile)?;
        Ok(profile)
    }

    /// Bump usage counters after a completed request.
    pub fn bump_usage(&self, user_id: &str) -> Result<()> {
        let mut profile = self.get_profile(user_id)?;
        profile.usage.message_count += 1;
        profile.usage.last_active = Some(Utc::now());
        self.save_profile(user_id, &profile)
    }

    /// All user ids with a stored profile (for the daily fact sweep).
    pub fn all_user_ids(&self) -> Result<Vec<String>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT user_id FROM users")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

/// Fold pruned messages into a short role-tagged summary string.
/// Deterministic on purpose — saving must never depend on LLM
/// availability; the compactor owns the LLM-quality summary path.
fn summarize_head(pruned: &[ChatMessage], existing: Option<&str>) -> String {
    let mut lines: Vec<String> = Vec::new();
    if let Some(prev) = existing {
        lines.push(prev.to_string());
    }
    for msg in pruned {
        let text = msg.visible_text();
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        let excerpt: String = text.chars().take(SUMMARY_LINE_CHARS).collect();
        lines.push(format!("{}: {}", msg.role, excerpt));
    }

    let mut summary = lines.join("\n");
    // Keep the most recent tail when over the cap.
    if summary.chars().count() > SUMMARY_MAX_CHARS {
        let chars: Vec<char> = summary.chars().collect();
        summary = chars[chars.len() - SUMMARY_MAX_CHARS..].iter().collect();
    }
    summary
}

/// Map known top-level fields onto the typed profile; anything else is a
/// free-form preference.
fn apply_profile_patch(
    profile: &mut UserProfile,
    patch: &serde_json::Map<String, serde_json::Value>,
) {
    for (key, value) in patch {
        match key.as_str() {
            "name" => profile.name = value.as_str().map(String::from),
            "allergies" => {
                if let Some(arr) = value.as_array() {
                    for a in arr.iter().filter_map(|v| v.as_str()) {
                        if !profile.allergies.iter().any(|x| x == a) {
                            profile.allergies.push(a.to_string());
                        }
                    }
                } else if let Some(s) = value.as_str() {
                    if !profile.allergies.iter().any(|x| x == s) {
                        profile.allergies.push(s.to_string());
                    }
                }
            }
            "goals" => {
                if let Some(arr) = value.as_array() {
                    profile.goals = arr
                        .iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect();
                }
            }
            "fitness_level" => profile.fitness_level = value.as_str().map(String::from),
            "age" => profile.demographics.age = value.as_u64().map(|v| v as u32),
            "gender" => profile.demographics.gender = value.as_str().map(String::from),
            "occupation" => profile.demographics.occupation = value.as_str().map(String::from),
            "height" => profile.physical_stats.height = value.as_f64(),
            "body_fat_percent" => profile.physical_stats.body_fat_percent = value.as_f64(),
            "weight" => {
                if let Some(v) = value.as_f64() {
                    profile.physical_stats.weight_history.push(crate::types::WeightEntry {
                        value: v,
                        date: Some(Utc::now()),
                        note: None,
                    });
                }
            }
            "workout_frequency" => {
                profile.lifestyle.workout_frequency = value.as_str().map(String::from)
            }
            "experience_years" => profile.lifestyle.experience_years = value.as_f64(),
            "sleep_hours" => profile.lifestyle.sleep_hours = value.as_f64(),
            "activity_level" => profile.lifestyle.activity_level = value.as_str().map(String::from),
            _ => {
                profile.preferences.insert(key.clone(), value.clone());
            }
        }
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredSession> {
    let history_json: String = row.get(2)?;
    let metadata_json: String = row.get(7)?;
    let created: String = row.get(8)?;
    let updated: String = row.get(9)?;

    // A summary past its own TTL is dropped at read time even before the
    // daily sweep clears the column.
    let summary: Option<String> = row.get(5)?;
    let summary_expires: Option<String> = row.get(6)?;
    let summary = match (summary, summary_expires) {
        (Some(s), Some(exp)) if exp > Utc::now().to_rfc3339() => Some(s),
        (Some(s), None) => Some(s),
        _ => None,
    };

    Ok(StoredSession {
        session_id: row.get(0)?,
        user_id: row.get(1)?,
        history: serde_json::from_str(&history_json).unwrap_or_default(),
        message_count: row.get::<_, i64>(3)? as usize,
        token_estimate: row.get::<_, i64>(4)? as u32,
        summary,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        created_at: parse_rfc3339(&created),
        updated_at: parse_rfc3339(&updated),
    })
}

fn parse_rfc3339(s: &str) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
