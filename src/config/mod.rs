//! Configuration management for the keeper.
//!
//! Loads settings from an optional config file and `KEEPER__*` environment
//! variables. Command-line overrides are applied on top by the launcher.

use crate::chain::TokenInfo;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node and contract addresses
    #[serde(default)]
    pub chain: ChainConfig,
    /// Loop intervals, thresholds and module switches
    #[serde(default)]
    pub keeper: KeeperConfig,
    /// Retry budget and chain call timeouts
    #[serde(default)]
    pub retry: RetryConfig,
    /// Gas limits for submitted transactions
    #[serde(default)]
    pub gas: GasConfig,
    /// Log level and output directory
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// JSON-RPC endpoint
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Unlocked node account the keeper transacts from
    #[serde(default)]
    pub keeper_address: String,
    /// Router contract address
    #[serde(default)]
    pub router_address: String,
    /// Refuse to start if the node reports a different network id
    #[serde(default)]
    pub expected_chain_id: Option<u64>,
    /// Tokens reported in diagnostics, keyed by symbol
    #[serde(default)]
    pub tokens: BTreeMap<String, TokenConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub address: String,
    #[serde(default = "default_token_decimals")]
    pub decimals: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeeperConfig {
    /// Seconds between order checks
    #[serde(default = "default_order_check_interval")]
    pub order_check_interval_secs: u64,
    /// Seconds between position checks
    #[serde(default = "default_position_check_interval")]
    pub position_check_interval_secs: u64,
    /// Seconds between diagnostics snapshots
    #[serde(default = "default_diagnostics_interval")]
    pub diagnostics_interval_secs: u64,
    /// PnL percentage at or below which a position is liquidated (negative)
    #[serde(default = "default_liquidation_threshold")]
    pub liquidation_threshold: i64,
    /// Maximum open orders evaluated per cycle
    #[serde(default = "default_max_orders_per_batch")]
    pub max_orders_per_batch: usize,
    #[serde(default = "default_true")]
    pub enable_order_execution: bool,
    #[serde(default = "default_true")]
    pub enable_position_liquidation: bool,
    #[serde(default = "default_true")]
    pub enable_diagnostics: bool,
    /// Upper bound on how long `stop()` waits for in-flight work
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per action, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on each further attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Timeout for every chain read and gas estimate
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Timeout for a submitted transaction to be mined
    #[serde(default = "default_receipt_timeout")]
    pub receipt_timeout_secs: u64,
    /// Receipt polling interval
    #[serde(default = "default_receipt_poll_interval_ms")]
    pub receipt_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasConfig {
    /// Hard cap on gas per transaction
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    /// Submissions are deferred while the network gas price is above this
    #[serde(default = "default_max_gas_price")]
    pub max_gas_price_wei: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// One of TRACE, DEBUG, INFO, WARN, ERROR
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for the rolling log file
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

// Default value functions
fn default_rpc_url() -> String {
    "http://localhost:8545".to_string()
}

fn default_token_decimals() -> u32 {
    18
}

fn default_order_check_interval() -> u64 {
    5
}

fn default_position_check_interval() -> u64 {
    8
}

fn default_diagnostics_interval() -> u64 {
    30
}

fn default_liquidation_threshold() -> i64 {
    -90 // -90% PnL
}

fn default_max_orders_per_batch() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_shutdown_timeout() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_call_timeout() -> u64 {
    15
}

fn default_receipt_timeout() -> u64 {
    120
}

fn default_receipt_poll_interval_ms() -> u64 {
    1_000
}

fn default_gas_limit() -> u64 {
    500_000
}

fn default_max_gas_price() -> u64 {
    50_000_000_000 // 50 gwei
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Config {
    /// Load configuration from `.env`, an optional config file and the environment.
    ///
    /// Without an explicit path, `keeper.{toml,json,yaml}` in the working
    /// directory is used if present.
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let file = match path {
            Some(path) => config::File::with_name(path).required(true),
            None => config::File::with_name("keeper").required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::with_prefix("KEEPER").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            is_address(&self.chain.keeper_address),
            "keeper_address must be a 20-byte hex address"
        );

        anyhow::ensure!(
            is_address(&self.chain.router_address),
            "router_address must be a 20-byte hex address"
        );

        anyhow::ensure!(
            self.keeper.order_check_interval_secs >= 1,
            "order_check_interval_secs must be >= 1"
        );

        anyhow::ensure!(
            self.keeper.position_check_interval_secs >= 1,
            "position_check_interval_secs must be >= 1"
        );

        anyhow::ensure!(
            self.keeper.diagnostics_interval_secs >= 1,
            "diagnostics_interval_secs must be >= 1"
        );

        anyhow::ensure!(
            self.keeper.liquidation_threshold < 0,
            "liquidation_threshold must be negative"
        );

        anyhow::ensure!(
            self.keeper.max_orders_per_batch >= 1,
            "max_orders_per_batch must be >= 1"
        );

        anyhow::ensure!(self.retry.max_attempts >= 1, "max_attempts must be >= 1");

        anyhow::ensure!(
            self.retry.base_delay_ms <= self.retry.max_delay_ms,
            "base_delay_ms must not exceed max_delay_ms"
        );

        anyhow::ensure!(
            self.retry.call_timeout_secs >= 1,
            "call_timeout_secs must be >= 1"
        );

        anyhow::ensure!(
            self.retry.receipt_poll_interval_ms >= 1,
            "receipt_poll_interval_ms must be >= 1"
        );

        anyhow::ensure!(
            self.retry.receipt_timeout_secs >= 1,
            "receipt_timeout_secs must be >= 1"
        );

        for (symbol, token) in &self.chain.tokens {
            anyhow::ensure!(
                is_address(&token.address),
                "token {} has an invalid address",
                symbol
            );
        }

        Ok(())
    }

    /// Configured tokens in the shape the chain layer expects.
    pub fn token_list(&self) -> Vec<TokenInfo> {
        self.chain
            .tokens
            .iter()
            .map(|(symbol, token)| TokenInfo {
                symbol: symbol.clone(),
                address: token.address.clone(),
                decimals: token.decimals,
            })
            .collect()
    }
}

impl RetryConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }
}

fn is_address(value: &str) -> bool {
    let stripped = value.strip_prefix("0x").unwrap_or(value);
    stripped.len() == 40 && stripped.chars().all(|c| c.is_ascii_hexdigit())
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            keeper_address: String::new(),
            router_address: String::new(),
            expected_chain_id: None,
            tokens: BTreeMap::new(),
        }
    }
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            order_check_interval_secs: default_order_check_interval(),
            position_check_interval_secs: default_position_check_interval(),
            diagnostics_interval_secs: default_diagnostics_interval(),
            liquidation_threshold: default_liquidation_threshold(),
            max_orders_per_batch: default_max_orders_per_batch(),
            enable_order_execution: true,
            enable_position_liquidation: true,
            enable_diagnostics: true,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            call_timeout_secs: default_call_timeout(),
            receipt_timeout_secs: default_receipt_timeout(),
            receipt_poll_interval_ms: default_receipt_poll_interval_ms(),
        }
    }
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            gas_limit: default_gas_limit(),
            max_gas_price_wei: default_max_gas_price(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: default_log_dir(),
        }
    }
}
