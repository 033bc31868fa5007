//! Configuration management for the mirror engine.
//!
//! Loads settings from environment variables and config files.

use std::collections::HashMap;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Master venue accounts to mirror
    pub master: MasterConfig,
    /// Follower venue credentials
    pub binance: BinanceConfig,
    /// Size translation parameters
    pub sizing: SizingConfig,
    /// Per-instrument constraints; the key set is the instrument whitelist
    pub instruments: HashMap<String, InstrumentConfig>,
    /// Key-value store location
    pub store: StoreConfig,
    /// Engine timing knobs
    #[serde(default)]
    pub engine: EngineConfig,
    /// Global kill-switch: when set, every new placement is denied
    #[serde(default)]
    pub emergency_stop: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    /// Addresses of the followed traders
    pub followed_users: Vec<String>,
    /// Override for the Master venue API endpoint
    #[serde(default = "default_master_api_url")]
    pub api_url: String,
    /// Override for the Master venue WebSocket endpoint
    #[serde(default = "default_master_ws_url")]
    pub ws_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinanceConfig {
    /// API key for authentication
    pub api_key: String,
    /// Secret key for signing requests
    pub secret_key: String,
    /// Use testnet instead of production
    #[serde(default)]
    pub testnet: bool,
}

/// How a Master order size becomes a Follower order size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizingMode {
    /// `follower = master * fixed_ratio`
    Fixed,
    /// `follower = master * (follower_equity / master_equity) * equal_ratio`
    Equal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SizingConfig {
    #[serde(default = "default_sizing_mode")]
    pub mode: SizingMode,
    #[serde(default = "default_ratio")]
    pub fixed_ratio: Decimal,
    #[serde(default = "default_ratio")]
    pub equal_ratio: Decimal,
    /// Equity-snapshot freshness for equal mode, in seconds
    #[serde(default = "default_account_cache_ttl")]
    pub account_cache_ttl_secs: u64,
}

/// Minimum order size, either one scalar or split per action kind.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum MinOrderSize {
    Scalar(Decimal),
    Split { open: Decimal, close: Decimal },
}

impl MinOrderSize {
    pub fn open(&self) -> Decimal {
        match self {
            Self::Scalar(v) => *v,
            Self::Split { open, .. } => *open,
        }
    }

    pub fn close(&self) -> Decimal {
        match self {
            Self::Scalar(v) => *v,
            Self::Split { close, .. } => *close,
        }
    }
}

/// Per-instrument trading constraints, carried as configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentConfig {
    /// Venue minimum order size in base units
    pub min_order_size: MinOrderSize,
    /// Quantity decimal precision
    pub quantity_decimals: u32,
    /// Price tick size on the Follower venue
    pub price_tick: Decimal,
    /// Maximum absolute position in Follower base units
    pub max_position: Decimal,
    /// Uncovered exposure that triggers an aggressive half-size reduction;
    /// absent disables the aggressive path
    #[serde(default)]
    pub reduction_threshold: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path of the SQLite database file
    #[serde(default = "default_store_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Per-oid execution lock TTL in seconds
    #[serde(default = "default_order_lock_ttl")]
    pub order_lock_ttl_secs: u64,
    /// Interval between mapping validation sweeps, in seconds
    #[serde(default = "default_validator_interval")]
    pub validator_interval_secs: u64,
    /// Hard age limit for a mapping before the validator reaps it, in hours
    #[serde(default = "default_mapping_max_age")]
    pub mapping_max_age_hours: u64,
    /// Profit offset applied to rebalance take-profit prices (0.0001 = 0.01%)
    #[serde(default = "default_profit_offset")]
    pub profit_offset: Decimal,
    /// Relative tolerance for price matching during snapshot recovery
    #[serde(default = "default_price_match_tolerance")]
    pub price_match_tolerance: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            order_lock_ttl_secs: default_order_lock_ttl(),
            validator_interval_secs: default_validator_interval(),
            mapping_max_age_hours: default_mapping_max_age(),
            profit_offset: default_profit_offset(),
            price_match_tolerance: default_price_match_tolerance(),
        }
    }
}

// Default value functions

fn default_master_api_url() -> String {
    "https://api.hyperliquid.xyz".to_string()
}

fn default_master_ws_url() -> String {
    "wss://api.hyperliquid.xyz/ws".to_string()
}

fn default_sizing_mode() -> SizingMode {
    SizingMode::Fixed
}

fn default_ratio() -> Decimal {
    Decimal::ONE
}

fn default_account_cache_ttl() -> u64 {
    60
}

fn default_store_path() -> String {
    "perp_mirror.db".to_string()
}

fn default_order_lock_ttl() -> u64 {
    10
}

fn default_validator_interval() -> u64 {
    60
}

fn default_mapping_max_age() -> u64 {
    24
}

fn default_profit_offset() -> Decimal {
    Decimal::new(1, 4) // 0.0001
}

fn default_price_match_tolerance() -> Decimal {
    Decimal::new(1, 4) // 0.0001
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("MIRROR"),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values. Violations are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.master.followed_users.is_empty(),
            "At least one followed user is required"
        );
        anyhow::ensure!(
            !self.binance.api_key.is_empty() && !self.binance.secret_key.is_empty(),
            "Follower venue credentials are required"
        );
        anyhow::ensure!(
            !self.instruments.is_empty(),
            "At least one supported instrument is required"
        );
        anyhow::ensure!(
            self.sizing.fixed_ratio > Decimal::ZERO && self.sizing.equal_ratio > Decimal::ZERO,
            "Sizing ratios must be positive"
        );

        for (coin, instrument) in &self.instruments {
            anyhow::ensure!(
                instrument.min_order_size.open() > Decimal::ZERO
                    && instrument.min_order_size.close() > Decimal::ZERO,
                "min_order_size must be positive for {coin}"
            );
            anyhow::ensure!(
                instrument.price_tick > Decimal::ZERO,
                "price_tick must be positive for {coin}"
            );
            anyhow::ensure!(
                instrument.max_position > Decimal::ZERO,
                "max_position must be positive for {coin}"
            );
        }

        Ok(())
    }

    /// Whether the instrument is on the whitelist.
    pub fn supports(&self, coin: &str) -> bool {
        self.instruments.contains_key(coin)
    }
}

/// Fixtures shared by the synchronization-core tests.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use rust_decimal_macros::dec;

    /// BTC: min 0.002, 3 decimals, tick 0.1, max position 10.
    pub(crate) fn test_instrument() -> InstrumentConfig {
        InstrumentConfig {
            min_order_size: MinOrderSize::Scalar(dec!(0.002)),
            quantity_decimals: 3,
            price_tick: dec!(0.1),
            max_position: dec!(10),
            reduction_threshold: None,
        }
    }

    /// Fixed mode with ratio 0.1 over a single BTC instrument.
    pub(crate) fn test_config() -> Config {
        let mut instruments = HashMap::new();
        instruments.insert("BTC".to_string(), test_instrument());
        Config {
            master: MasterConfig {
                followed_users: vec!["0xabc".to_string()],
                api_url: default_master_api_url(),
                ws_url: default_master_ws_url(),
            },
            binance: BinanceConfig {
                api_key: "key".to_string(),
                secret_key: "secret".to_string(),
                testnet: true,
            },
            sizing: SizingConfig {
                mode: SizingMode::Fixed,
                fixed_ratio: dec!(0.1),
                equal_ratio: Decimal::ONE,
                account_cache_ttl_secs: 60,
            },
            instruments,
            store: StoreConfig {
                path: ":memory:".to_string(),
            },
            engine: EngineConfig::default(),
            emergency_stop: false,
        }
    }
}
