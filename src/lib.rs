//! # DEX Keeper
//!
//! Off-chain keeper for a DEX router: executes limit and stop-loss orders
//! once their trigger price is reached and liquidates leveraged positions
//! whose loss crosses the configured threshold.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading and validation
//! - `chain`: Router access over JSON-RPC, plus an in-memory mock
//! - `keeper`: Monitors, retry executor, diagnostics and the controller
//! - `utils`: Shared utilities and decimal arithmetic

pub mod chain;
pub mod config;
pub mod keeper;
pub mod utils;

pub use config::Config;
