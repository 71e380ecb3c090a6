//! Device token queries.

use std::collections::{BTreeSet, HashSet};

use pusher_core::db::unix_timestamp;
use tracing::{debug, warn};

use super::db::{DatabaseError, TokenDatabase};
use super::record::{TokenRecord, bucket_name};

impl TokenDatabase {
    /// Store `token` for `owner`, stamped with the current time.
    ///
    /// Re-saving an existing token replaces its owner and timestamp.
    pub async fn save(
        &self,
        owner: &str,
        topic: &str,
        token: &str,
        sandbox: bool,
    ) -> Result<(), DatabaseError> {
        self.save_at(owner, topic, token, sandbox, unix_timestamp())
            .await
    }

    /// Store `token` for `owner` with an explicit insertion time.
    pub async fn save_at(
        &self,
        owner: &str,
        topic: &str,
        token: &str,
        sandbox: bool,
        added: i64,
    ) -> Result<(), DatabaseError> {
        let bucket = bucket_name(topic, sandbox);
        let value = TokenRecord::new(owner, added).encode();

        sqlx::query(
            "INSERT INTO device_tokens (bucket, token, value) VALUES (?, ?, ?) \
             ON CONFLICT(bucket, token) DO UPDATE SET value = excluded.value",
        )
        .bind(&bucket)
        .bind(token)
        .bind(value)
        .execute(self.pool())
        .await?;

        debug!(bucket = %bucket, owner, "Device token saved");
        Ok(())
    }

    /// Tokens in the bucket whose owner is one of `owners`.
    pub async fn query(
        &self,
        topic: &str,
        sandbox: bool,
        owners: &[String],
    ) -> Result<Vec<String>, DatabaseError> {
        if owners.is_empty() {
            return Ok(Vec::new());
        }
        let wanted: HashSet<&str> = owners.iter().map(String::as_str).collect();

        Ok(self
            .scan(topic, sandbox)
            .await?
            .into_iter()
            .filter(|(_, record)| wanted.contains(record.owner.as_str()))
            .map(|(token, _)| token)
            .collect())
    }

    /// Remove `token` if it was saved strictly before `not_before`
    /// (`None` means now).
    ///
    /// Returns whether a row was removed. A token saved again after the
    /// cutoff is kept.
    pub async fn delete(
        &self,
        topic: &str,
        token: &str,
        not_before: Option<i64>,
        sandbox: bool,
    ) -> Result<bool, DatabaseError> {
        let cutoff = not_before.unwrap_or_else(unix_timestamp);
        let bucket = bucket_name(topic, sandbox);
        let mut tx = self.pool().begin().await?;

        let value: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT value FROM device_tokens WHERE bucket = ? AND token = ?")
                .bind(&bucket)
                .bind(token)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(value) = value else {
            return Ok(false);
        };
        let record = TokenRecord::decode(&value)?;
        if record.added >= cutoff {
            debug!(
                bucket = %bucket,
                added = record.added,
                cutoff,
                "Token re-registered after cutoff, kept"
            );
            return Ok(false);
        }

        sqlx::query("DELETE FROM device_tokens WHERE bucket = ? AND token = ?")
            .bind(&bucket)
            .bind(token)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(true)
    }

    /// Distinct owners with at least one token in the bucket, sorted.
    pub async fn owners(&self, topic: &str, sandbox: bool) -> Result<Vec<String>, DatabaseError> {
        let owners: BTreeSet<String> = self
            .scan(topic, sandbox)
            .await?
            .into_iter()
            .map(|(_, record)| record.owner)
            .collect();
        Ok(owners.into_iter().collect())
    }

    /// Remove every token `owner` holds in the bucket. Returns how many went.
    pub async fn delete_owner(
        &self,
        topic: &str,
        sandbox: bool,
        owner: &str,
    ) -> Result<u64, DatabaseError> {
        let bucket = bucket_name(topic, sandbox);
        let mut tx = self.pool().begin().await?;

        let rows: Vec<(String, Vec<u8>)> =
            sqlx::query_as("SELECT token, value FROM device_tokens WHERE bucket = ?")
                .bind(&bucket)
                .fetch_all(&mut *tx)
                .await?;

        let mut removed = 0;
        for (token, value) in rows {
            if TokenRecord::decode(&value).is_ok_and(|r| r.owner == owner) {
                removed += sqlx::query("DELETE FROM device_tokens WHERE bucket = ? AND token = ?")
                    .bind(&bucket)
                    .bind(&token)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            }
        }
        tx.commit().await?;

        Ok(removed)
    }

    /// Every decodable record in the bucket, ordered by token.
    async fn scan(
        &self,
        topic: &str,
        sandbox: bool,
    ) -> Result<Vec<(String, TokenRecord)>, DatabaseError> {
        let bucket = bucket_name(topic, sandbox);
        let rows: Vec<(String, Vec<u8>)> = sqlx::query_as(
            "SELECT token, value FROM device_tokens WHERE bucket = ? ORDER BY token",
        )
        .bind(&bucket)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(token, value)| match TokenRecord::decode(&value) {
                Ok(record) => Some((token, record)),
                Err(e) => {
                    warn!(bucket = %bucket, error = %e, "Skipping unreadable token record");
                    None
                }
            })
            .collect())
    }
}
