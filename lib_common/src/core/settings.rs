//! # Settings Collaborator
//!
//! Key-value configuration consumed by the core: the global feed URL and the
//! per-owner filter, dedup and country settings. Writes are last-write-wins,
//! country add/clear are idempotent.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use crate::core::error::StoreError;

/// Key holding the feed URL every engine fetches from.
pub const FEED_URL_KEY: &str = "explore_url";

/// Namespaces a setting under an owner.
pub fn owner_key(owner: &str, name: &str) -> String {
    format!("owner:{}:{}", owner, name)
}

/// Backing store for settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Reads a raw value.
    async fn get_value(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes a raw value, replacing any previous one.
    async fn set_value(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Reads a boolean, falling back to `default` when unset or unparsable.
    async fn get_bool(&self, key: &str, default: bool) -> Result<bool, StoreError> {
        Ok(self
            .get_value(key)
            .await?
            .and_then(|raw| parse_bool(&raw))
            .unwrap_or(default))
    }

    /// Writes a boolean.
    async fn set_bool(&self, key: &str, value: bool) -> Result<(), StoreError> {
        self.set_value(key, if value { "true" } else { "false" }).await
    }

    /// The owner's country codes.
    async fn list_countries(&self, owner: &str) -> Result<BTreeSet<String>, StoreError>;

    /// Adds already-normalized codes and returns the resulting set.
    async fn add_countries(&self, owner: &str, codes: &[String]) -> Result<BTreeSet<String>, StoreError>;

    /// Removes every code of the owner.
    async fn clear_countries(&self, owner: &str) -> Result<(), StoreError>;
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Some(true),
        "false" | "0" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct SettingsState {
    values: HashMap<String, String>,
    countries: HashMap<String, BTreeSet<String>>,
}

/// Process-local settings, used when no database is configured and in tests.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    state: Mutex<SettingsState>,
}

impl MemorySettingsStore {
    fn with_state<T>(&self, f: impl FnOnce(&mut SettingsState) -> T) -> Result<T, StoreError> {
        let mut state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&mut state))
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_state(|s| s.values.get(key).cloned())
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.values.insert(key.to_string(), value.to_string());
        })
    }

    async fn list_countries(&self, owner: &str) -> Result<BTreeSet<String>, StoreError> {
        self.with_state(|s| s.countries.get(owner).cloned().unwrap_or_default())
    }

    async fn add_countries(&self, owner: &str, codes: &[String]) -> Result<BTreeSet<String>, StoreError> {
        self.with_state(|s| {
            let set = s.countries.entry(owner.to_string()).or_default();
            set.extend(codes.iter().cloned());
            set.clone()
        })
    }

    async fn clear_countries(&self, owner: &str) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.countries.remove(owner);
        })
    }
}
