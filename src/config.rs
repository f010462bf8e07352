//! TOML configuration, read once at startup.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::catalog::{ContentUnit, StaticCatalog};
use crate::gate::{BonusTier, GateType, default_bonus_tiers};
use crate::idempotency::DEFAULT_MAX_KEY_LEN;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// `[ledger]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// JSON-lines journal; the log is in-memory when unset.
    pub journal_path: Option<PathBuf>,
    pub max_idempotency_key_len: usize,
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            journal_path: None,
            max_idempotency_key_len: DEFAULT_MAX_KEY_LEN,
            default_page_size: 20,
            max_page_size: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub ledger: LedgerSettings,
    pub bonus_tiers: Vec<BonusTier>,
    pub content: Vec<ContentUnit>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerSettings::default(),
            bonus_tiers: default_bonus_tiers(),
            content: Vec::new(),
        }
    }
}

impl LedgerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let ledger = &self.ledger;

        if ledger.max_idempotency_key_len == 0 {
            return invalid("ledger.max_idempotency_key_len must be > 0".to_string());
        }
        if ledger.default_page_size == 0 || ledger.max_page_size == 0 {
            return invalid("ledger page sizes must be > 0".to_string());
        }
        if ledger.default_page_size > ledger.max_page_size {
            return invalid(format!(
                "ledger.default_page_size {} exceeds max_page_size {}",
                ledger.default_page_size, ledger.max_page_size
            ));
        }
        if let Some(tier) = self.bonus_tiers.iter().find(|t| !t.credits.is_positive()) {
            return invalid(format!(
                "bonus tier at {}s must grant a positive amount",
                tier.min_seconds
            ));
        }

        let mut seen = HashSet::new();
        for unit in &self.content {
            if unit.id.trim().is_empty() {
                return invalid("content id must not be empty".to_string());
            }
            if !seen.insert(unit.id.as_str()) {
                return invalid(format!("content id {} is defined twice", unit.id));
            }
            let policy = &unit.policy;
            if policy.gate_type == GateType::Progressive && policy.messages_per_credit == 0 {
                return invalid(format!("content {}: messages_per_credit must be > 0", unit.id));
            }
            if policy.gate_type == GateType::PerUnit && !policy.chapter_credits.is_positive() {
                return invalid(format!("content {}: chapter_credits must be > 0", unit.id));
            }
            if policy.bonus_tiers.iter().any(|t| !t.credits.is_positive()) {
                return invalid(format!(
                    "content {}: bonus tiers must grant a positive amount",
                    unit.id
                ));
            }
        }
        Ok(())
    }

    pub fn catalog(&self) -> StaticCatalog {
        self.content.iter().cloned().collect()
    }
}
