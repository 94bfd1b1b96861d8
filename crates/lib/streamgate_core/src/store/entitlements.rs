//! Entitlement records keyed by media-server login.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::Result;
use crate::models::Entitlement;

type EntitlementRow = (String, Option<i64>, String, DateTime<Utc>, bool);

/// Store of entitlement records.
///
/// Single-statement reads and writes are atomic per key; serializing
/// read-modify-write sequences across calls is the engine's job.
#[derive(Clone)]
pub struct EntitlementStore {
    pool: SqlitePool,
}

impl EntitlementStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch a record by login.
    pub async fn get(&self, login: &str) -> Result<Option<Entitlement>> {
        let row = sqlx::query_as::<_, EntitlementRow>(
            "SELECT login, user_id, credential, expires_at, is_trial \
             FROM entitlements WHERE login = $1",
        )
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(from_row))
    }

    /// Fetch a record by the chat identity that owns it.
    pub async fn get_by_user(&self, user_id: i64) -> Result<Option<Entitlement>> {
        let row = sqlx::query_as::<_, EntitlementRow>(
            "SELECT login, user_id, credential, expires_at, is_trial \
             FROM entitlements WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(from_row))
    }

    /// Full upsert: overwrites any prior record for the same login.
    pub async fn put(&self, record: &Entitlement) -> Result<()> {
        sqlx::query(
            "INSERT INTO entitlements (login, user_id, credential, expires_at, is_trial) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT(login) DO UPDATE SET \
                 user_id = excluded.user_id, \
                 credential = excluded.credential, \
                 expires_at = excluded.expires_at, \
                 is_trial = excluded.is_trial",
        )
        .bind(&record.login)
        .bind(record.user_id)
        .bind(&record.credential)
        .bind(record.expires_at)
        .bind(record.is_trial)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove a record. Returns whether a row was actually deleted.
    pub async fn delete(&self, login: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM entitlements WHERE login = $1")
            .bind(login)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// All records, ordered by login, for administrator enumeration.
    pub async fn list(&self) -> Result<Vec<Entitlement>> {
        let rows = sqlx::query_as::<_, EntitlementRow>(
            "SELECT login, user_id, credential, expires_at, is_trial \
             FROM entitlements ORDER BY login",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(from_row).collect())
    }
}

fn from_row((login, user_id, credential, expires_at, is_trial): EntitlementRow) -> Entitlement {
    Entitlement {
        login,
        user_id,
        credential,
        expires_at,
        is_trial,
    }
}
