use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::BloodGroup;

/// Runtime settings for a blood bank store.
///
/// Every field has a default, so a config file only needs the keys it wants
/// to override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the sled database.
    pub db_path: PathBuf,

    /// How long an approval waits for its category section before giving up
    /// with a contention error.
    pub lock_timeout_ms: u64,

    /// Requests report `is_low` when availability is at or below this.
    pub low_stock_threshold: i64,

    /// Submission notices warn about low stock at or below this.
    pub notice_threshold: i64,

    /// Units credited per blood group when a fresh ledger is opened.
    ///
    /// Keys are category labels such as `"O-"`.
    pub initial_stock: BTreeMap<String, u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("bloodbank.db"),
            lock_timeout_ms: 2_000,
            low_stock_threshold: 5,
            notice_threshold: 10,
            initial_stock: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Loads the configuration from a TOML file at the given path.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.initial_stock()?;
        Ok(config)
    }

    /// Saves the configuration to a TOML file at the given path.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config file {}", path.display()))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// The configured starting stock with labels resolved to categories.
    /// Zero-unit entries are skipped.
    pub fn initial_stock(&self) -> Result<Vec<(BloodGroup, u32)>, ValidationError> {
        let mut stock = Vec::with_capacity(self.initial_stock.len());
        for (label, units) in &self.initial_stock {
            let group: BloodGroup = label.parse()?;
            if *units > 0 {
                stock.push((group, *units));
            }
        }
        stock.sort_by_key(|(group, _)| *group);
        Ok(stock)
    }
}
