//! Background TTL maintenance.
//!
//! One cooperative timer task runs the daily cleanup at 04:00 UTC —
//! expired daily facts are pulled from every user document in one pass,
//! and expired conversations (plus expired summaries) are removed. The
//! job never blocks request tasks and swallows its own errors.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};

use scoop_memory::MemoryStore;

/// Cleanup fires at this UTC time, chosen for minimal user impact.
const CLEANUP_HOUR: u32 = 4;

/// Handle for the scheduler task. Dropping it does not stop the task;
/// call `shutdown` for a graceful stop.
pub struct TtlScheduler {
    shutdown: watch::Sender<bool>,
}

impl TtlScheduler {
    /// Spawn the daily cleanup loop.
    pub fn start(store: Arc<MemoryStore>) -> Self {
        let (shutdown, mut rx) = watch::channel(false);

        tokio::spawn(async move {
            info!(hour = CLEANUP_HOUR, "TTL scheduler started");
            loop {
                let delay = delay_until_next_run(Utc::now());
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        run_daily_cleanup(&store);
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            info!("TTL scheduler shutting down");
                            return;
                        }
                    }
                }
            }
        });

        Self { shutdown }
    }

    /// Signal the loop to exit at its next wakeup.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// One cleanup pass. Errors are logged and swallowed — maintenance must
/// never take a request down with it.
pub fn run_daily_cleanup(store: &MemoryStore) {
    let started = std::time::Instant::now();

    let facts = match store.cleanup_expired_daily_facts() {
        Ok(n) => n,
        Err(e) => {
            error!(error = %e, "daily fact cleanup failed");
            0
        }
    };
    let conversations = match store.sweep_expired_conversations() {
        Ok(n) => n,
        Err(e) => {
            error!(error = %e, "conversation sweep failed");
            0
        }
    };

    if facts == 0 && conversations == 0 {
        info!("TTL cleanup: nothing to do");
    } else {
        info!(
            facts_removed = facts,
            conversations_removed = conversations,
            took_ms = started.elapsed().as_millis() as u64,
            "TTL cleanup complete"
        );
    }
}

/// Time until the next 04:00 UTC, from `now`.
fn delay_until_next_run(now: DateTime<Utc>) -> Duration {
    let run_time = NaiveTime::from_hms_opt(CLEANUP_HOUR, 0, 0).expect("valid time");
    let today_run = now.date_naive().and_time(run_time).and_utc();
    let next = if today_run > now {
        today_run
    } else {
        today_run + chrono::Duration::days(1)
    };
    match (next - now).to_std() {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, "negative delay computed, defaulting to 24h");
            Duration::from_secs(24 * 60 * 60)
        }
    }
}
