//! Trial usage tracking — a permanent, append-only set of identities.
//!
//! Membership is what makes the trial a one-time benefit: it outlives the
//! trial entitlement itself, which is deleted at expiry.

use sqlx::SqlitePool;

use super::Result;

/// Tracks which identities have ever activated a trial.
#[derive(Clone)]
pub struct TrialTracker {
    pool: SqlitePool,
}

impl TrialTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Whether the identity has consumed its trial.
    pub async fn has_used(&self, user_id: i64) -> Result<bool> {
        let used: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM trial_usage WHERE user_id = $1)")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(used)
    }

    /// Record that the identity has consumed its trial. Idempotent.
    pub async fn mark_used(&self, user_id: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO trial_usage (user_id) VALUES ($1)")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
