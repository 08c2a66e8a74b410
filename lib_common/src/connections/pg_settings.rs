//! # PostgreSQL Settings Store

use async_trait::async_trait;
use deadpool_postgres::Pool;
use std::collections::BTreeSet;

use crate::core::{SettingsStore, StoreError};

/// [`SettingsStore`] over the `matcher_settings` and `owner_countries` tables.
#[derive(Clone)]
pub struct PgSettingsStore {
    pool: Pool,
}

impl PgSettingsStore {
    /// Uses the given pool. Run [`super::Database::migrate`] first.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsStore for PgSettingsStore {
    async fn get_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT value FROM matcher_settings WHERE key = $1", &[&key])
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO matcher_settings (key, value) VALUES ($1, $2)
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
                &[&key, &value],
            )
            .await?;
        Ok(())
    }

    async fn list_countries(&self, owner: &str) -> Result<BTreeSet<String>, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query("SELECT code FROM owner_countries WHERE owner_id = $1", &[&owner])
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn add_countries(&self, owner: &str, codes: &[String]) -> Result<BTreeSet<String>, StoreError> {
        {
            let client = self.pool.get().await?;
            client
                .execute(
                    "INSERT INTO owner_countries (owner_id, code)
                     SELECT $1::text, code FROM unnest($2::text[]) AS code
                     ON CONFLICT DO NOTHING",
                    &[&owner, &codes],
                )
                .await?;
        }
        self.list_countries(owner).await
    }

    async fn clear_countries(&self, owner: &str) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .execute("DELETE FROM owner_countries WHERE owner_id = $1", &[&owner])
            .await?;
        Ok(())
    }
}
