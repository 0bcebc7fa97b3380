//! CLI configuration: TOML file with environment overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ledger::TokenMetadata;
use crate::units::{tokens, DECIMALS, DEFAULT_INITIAL_SUPPLY};
use crate::types::Amount;

pub const STATE_ENV: &str = "VCDORA_STATE";
pub const LOG_ENV: &str = "VCDORA_LOG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TokenSection {
    pub name: String,
    pub symbol: String,
    /// Whole tokens minted to the founder on deploy.
    pub initial_supply: u64,
}

impl Default for TokenSection {
    fn default() -> Self {
        Self {
            name: "TestToken".into(),
            symbol: "TST".into(),
            initial_supply: DEFAULT_INITIAL_SUPPLY,
        }
    }
}

impl TokenSection {
    pub fn metadata(&self) -> TokenMetadata {
        TokenMetadata {
            name: self.name.clone(),
            symbol: self.symbol.clone(),
            decimals: DECIMALS,
        }
    }

    pub fn initial_supply_units(&self) -> Amount {
        tokens(self.initial_supply)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EscrowSection {
    pub name: String,
    pub symbol: String,
}

impl Default for EscrowSection {
    fn default() -> Self {
        Self {
            name: "vcDORA".into(),
            symbol: "VCD".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VcdoraConfig {
    pub state_path: PathBuf,
    pub log_filter: String,
    pub token: TokenSection,
    pub escrow: EscrowSection,
}

impl Default for VcdoraConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("vcdora-state.json"),
            log_filter: "info".into(),
            token: TokenSection::default(),
            escrow: EscrowSection::default(),
        }
    }
}

impl VcdoraConfig {
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Load `path` if given and present, fall back to defaults, then apply
    /// `VCDORA_STATE` and `VCDORA_LOG`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.exists() => Self::from_toml_file(p)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(state) = lookup(STATE_ENV).filter(|v| !v.is_empty()) {
            self.state_path = PathBuf::from(state);
        }
        if let Some(filter) = lookup(LOG_ENV).filter(|v| !v.is_empty()) {
            self.log_filter = filter;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let names = [
            ("token.name", &self.token.name),
            ("token.symbol", &self.token.symbol),
            ("escrow.name", &self.escrow.name),
            ("escrow.symbol", &self.escrow.symbol),
        ];
        for (key, value) in names {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: value.clone(),
                    reason: "must not be empty",
                });
            }
        }
        if self.token.initial_supply == 0 {
            return Err(ConfigError::InvalidValue {
                key: "token.initial_supply",
                value: "0".into(),
                reason: "must be positive",
            });
        }
        Ok(())
    }
}
