//! # PostgreSQL Reservation Ledger
//!
//! The `match_history` primary key is what makes `reserve` atomic across
//! processes: `INSERT .. ON CONFLICT DO NOTHING` affects one row for exactly
//! one caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use std::time::Duration;

use crate::core::{ReservationRecord, ReservationStore, StoreError};

/// [`ReservationStore`] over PostgreSQL.
#[derive(Clone)]
pub struct PgReservationStore {
    pool: Pool,
}

impl PgReservationStore {
    /// Uses the given pool. Run [`super::Database::migrate`] first.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReservationStore for PgReservationStore {
    async fn reserve(&self, candidate_id: &str, owner: &str) -> Result<bool, StoreError> {
        let client = self.pool.get().await?;
        let inserted = client
            .execute(
                "INSERT INTO match_history (candidate_id, reserved, reserved_by)
                 VALUES ($1, TRUE, $2)
                 ON CONFLICT (candidate_id) DO NOTHING",
                &[&candidate_id, &owner],
            )
            .await?;
        Ok(inserted == 1)
    }

    async fn confirm(&self, candidate_id: &str, owner: &str) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO match_history (candidate_id, owners, reserved)
                 VALUES ($1, ARRAY[$2::text], FALSE)
                 ON CONFLICT (candidate_id) DO UPDATE SET
                     owners = CASE
                         WHEN $2::text = ANY(match_history.owners) THEN match_history.owners
                         ELSE array_append(match_history.owners, $2::text)
                     END,
                     reserved = FALSE,
                     reserved_by = NULL",
                &[&candidate_id, &owner],
            )
            .await?;
        Ok(())
    }

    async fn release(&self, candidate_id: &str) -> Result<bool, StoreError> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute(
                "DELETE FROM match_history WHERE candidate_id = $1 AND reserved",
                &[&candidate_id],
            )
            .await?;
        Ok(deleted == 1)
    }

    async fn count_for_owner(&self, owner: &str) -> Result<u64, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM match_history WHERE $1::text = ANY(owners)",
                &[&owner],
            )
            .await?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }

    async fn recent_for_owner(&self, owner: &str, limit: usize) -> Result<Vec<ReservationRecord>, StoreError> {
        let client = self.pool.get().await?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = client
            .query(
                "SELECT candidate_id, first_seen_at, owners, reserved
                 FROM match_history
                 WHERE $1::text = ANY(owners)
                 ORDER BY first_seen_at DESC
                 LIMIT $2",
                &[&owner, &limit],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let owners: Vec<String> = row.get(2);
                let first_seen_at: DateTime<Utc> = row.get(1);
                ReservationRecord {
                    external_id: row.get(0),
                    first_seen_at,
                    owners: owners.into_iter().collect(),
                    reserved: row.get(3),
                }
            })
            .collect())
    }

    async fn clear_owner(&self, owner: &str) -> Result<u64, StoreError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let touched = tx
            .query(
                "UPDATE match_history
                 SET owners = array_remove(owners, $1::text)
                 WHERE $1::text = ANY(owners)
                 RETURNING candidate_id",
                &[&owner],
            )
            .await?;
        let ids: Vec<String> = touched.iter().map(|row| row.get(0)).collect();
        tx.execute(
            "DELETE FROM match_history
             WHERE candidate_id = ANY($1) AND cardinality(owners) = 0 AND NOT reserved",
            &[&ids],
        )
        .await?;
        tx.commit().await?;
        Ok(ids.len() as u64)
    }

    async fn wipe(&self) -> Result<u64, StoreError> {
        let client = self.pool.get().await?;
        Ok(client.execute("DELETE FROM match_history", &[]).await?)
    }

    async fn sweep_stale(&self, older_than: Duration) -> Result<u64, StoreError> {
        let client = self.pool.get().await?;
        let seconds = older_than.as_secs_f64();
        Ok(client
            .execute(
                "DELETE FROM match_history
                 WHERE reserved
                   AND cardinality(owners) = 0
                   AND first_seen_at <= now() - make_interval(secs => $1)",
                &[&seconds],
            )
            .await?)
    }
}
