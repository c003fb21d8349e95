//! Configuration loading and representation.
//!
//! Sources, later ones winning:
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. `PBALEND__<SECTION>__<KEY>` environment variables
//!    (e.g. `PBALEND__DATABASE__URL`, `PBALEND__CHAIN__START_BLOCK`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use pbalend_core::Address;
use pbalend_lending::MarketPolicy;

use crate::workers::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub chain: ChainConfig,
    pub database: DatabaseConfig,
    pub projection: ProjectionConfig,
    pub worker: WorkerConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Sepolia by default.
    pub chain_id: u64,
    /// Address of the lending contract whose events are indexed.
    pub contract_address: String,
    /// Events from earlier blocks are ignored.
    pub start_block: u64,
    /// JSON-lines file of decoded logs.
    pub events_file: Option<PathBuf>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: 11_155_111,
            contract_address: Address::ZERO.to_string(),
            start_block: 0,
            events_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres URL; the in-memory store is used when unset.
    pub url: Option<String>,
    pub schema: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            schema: "public".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Highest LTV a market may be created with.
    pub max_ltv: u64,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self { max_ltv: 100 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            max_attempts: retry.max_attempts,
            retry_delay_ms: retry.delay.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: true,
        }
    }
}

impl IndexerConfig {
    /// Load defaults, then `path` (if given), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let cfg: Self = builder
            .add_source(
                config::Environment::with_prefix("PBALEND")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML document on top of the defaults (no environment).
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let cfg: Self = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.contract_address()?;

        if self.projection.max_ltv == 0 {
            return Err(ConfigError::Invalid("projection.max_ltv must be greater than zero".to_string()));
        }
        if self.worker.max_attempts == 0 {
            return Err(ConfigError::Invalid("worker.max_attempts must be at least 1".to_string()));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid("database.max_connections must be at least 1".to_string()));
        }
        if self.database.schema.is_empty() {
            return Err(ConfigError::Invalid("database.schema cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn contract_address(&self) -> Result<Address, ConfigError> {
        self.chain
            .contract_address
            .parse::<Address>()
            .map_err(|e| ConfigError::Invalid(format!("chain.contract_address: {e}")))
    }

    pub fn market_policy(&self) -> MarketPolicy {
        MarketPolicy::new(self.projection.max_ltv)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.worker.max_attempts,
            delay: Duration::from_millis(self.worker.retry_delay_ms),
        }
    }
}
