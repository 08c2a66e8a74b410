//! # Country Filter Policy
//!
//! Derives a normalized two-letter country code from a candidate and decides
//! whether the candidate is processed under the owner's include/exclude list.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::core::error::StoreError;
use crate::core::model::Candidate;
use crate::core::settings::{owner_key, SettingsStore};

/// How the country set is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Only candidates whose country is in the set pass.
    Include,
    /// Candidates whose country is in the set are skipped.
    #[default]
    Exclude,
}

impl FilterMode {
    fn as_setting(self) -> &'static str {
        match self {
            FilterMode::Include => "include",
            FilterMode::Exclude => "exclude",
        }
    }

    fn from_setting(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("include") {
            FilterMode::Include
        } else {
            FilterMode::Exclude
        }
    }
}

/// Per-owner filter and dedup configuration, re-read every cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Include or exclude semantics.
    pub mode: FilterMode,
    /// When false every candidate passes.
    pub enabled: bool,
    /// Normalized codes.
    pub countries: BTreeSet<String>,
    /// Whether candidates are reserved against the shared history.
    pub dedup_enabled: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            mode: FilterMode::Exclude,
            enabled: true,
            countries: BTreeSet::new(),
            dedup_enabled: true,
        }
    }
}

const MODE_KEY: &str = "filter_mode";
const ENABLED_KEY: &str = "filter_enabled";
const DEDUP_KEY: &str = "dedup_enabled";

impl FilterConfig {
    /// Reads the owner's current configuration from the settings store.
    pub async fn load(store: &dyn SettingsStore, owner: &str) -> Result<Self, StoreError> {
        let mode = store
            .get_value(&owner_key(owner, MODE_KEY))
            .await?
            .map(|raw| FilterMode::from_setting(&raw))
            .unwrap_or_default();
        let enabled = store.get_bool(&owner_key(owner, ENABLED_KEY), true).await?;
        let dedup_enabled = store.get_bool(&owner_key(owner, DEDUP_KEY), true).await?;
        let countries = store.list_countries(owner).await?;

        Ok(Self {
            mode,
            enabled,
            countries,
            dedup_enabled,
        })
    }

    /// Decides whether a candidate is processed.
    pub fn passes(&self, candidate: &Candidate) -> bool {
        passes(candidate.country_hint.as_deref(), self)
    }
}

/// Upper-cases a code and keeps only the trailing region subtag
/// (`"en-US"` → `"US"`, `"fr"` → `"FR"`).
pub fn normalize(code: &str) -> String {
    let trimmed = code.trim();
    let tail = trimmed
        .rsplit(|c| c == '-' || c == '_')
        .next()
        .unwrap_or(trimmed);
    tail.to_uppercase()
}

/// Filter decision on a raw country hint.
///
/// Exclude lets candidates without a derivable code through, Include does not.
pub fn passes(country_hint: Option<&str>, config: &FilterConfig) -> bool {
    if !config.enabled {
        return true;
    }
    let code = country_hint.map(normalize).filter(|c| !c.is_empty());
    match (config.mode, code) {
        (FilterMode::Exclude, None) => true,
        (FilterMode::Exclude, Some(code)) => !config.countries.contains(&code),
        (FilterMode::Include, None) => false,
        (FilterMode::Include, Some(code)) => config.countries.contains(&code),
    }
}

/// Sets the owner's filter mode.
pub async fn set_mode(store: &dyn SettingsStore, owner: &str, mode: FilterMode) -> Result<(), StoreError> {
    store.set_value(&owner_key(owner, MODE_KEY), mode.as_setting()).await
}

/// Turns the country filter on or off.
pub async fn set_enabled(store: &dyn SettingsStore, owner: &str, enabled: bool) -> Result<(), StoreError> {
    store.set_bool(&owner_key(owner, ENABLED_KEY), enabled).await
}

/// Turns history-based deduplication on or off.
pub async fn set_dedup(store: &dyn SettingsStore, owner: &str, enabled: bool) -> Result<(), StoreError> {
    store.set_bool(&owner_key(owner, DEDUP_KEY), enabled).await
}

/// Normalizes and adds codes to the owner's set. Adding a code twice is a no-op.
pub async fn add_countries(
    store: &dyn SettingsStore,
    owner: &str,
    codes: &[String],
) -> Result<BTreeSet<String>, StoreError> {
    let normalized: Vec<String> = codes
        .iter()
        .map(|c| normalize(c))
        .filter(|c| !c.is_empty())
        .collect();
    store.add_countries(owner, &normalized).await
}

/// Empties the owner's set and resets the filter to enabled Exclude mode.
pub async fn clear(store: &dyn SettingsStore, owner: &str) -> Result<(), StoreError> {
    store.clear_countries(owner).await?;
    set_mode(store, owner, FilterMode::Exclude).await?;
    set_enabled(store, owner, true).await
}
