//! Read-only health snapshot of the keeper's view of the chain.

use super::stats::KeeperStats;
use crate::chain::{with_timeout, ChainClient, ChainResult, TokenInfo, NATIVE_TOKEN};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Balances and oracle prices at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceReport {
    pub keeper_address: String,
    /// Keeper wallet ETH plus its router-held token balances.
    pub balances: BTreeMap<String, Decimal>,
    /// Symbol -> total liquidity held by the router.
    pub pool_balances: BTreeMap<String, Decimal>,
    /// Symbol -> keeper balance inside the router not locked as collateral.
    pub available_balances: BTreeMap<String, Decimal>,
    /// Symbol -> oracle price, `None` when the oracle has no price.
    pub oracle_prices: BTreeMap<String, Option<Decimal>>,
    /// Every checked token has a positive oracle price.
    pub oracle_valid: bool,
    pub errors: Vec<String>,
}

/// Result of one diagnostics run. Reads that failed are listed in `errors`
/// and leave their field at its empty value.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub keeper_address: String,
    pub balances: BTreeMap<String, Decimal>,
    pub pool_balances: BTreeMap<String, Decimal>,
    pub available_balances: BTreeMap<String, Decimal>,
    pub oracle_prices: BTreeMap<String, Option<Decimal>>,
    pub oracle_valid: bool,
    pub contracts_reachable: bool,
    pub total_orders: Option<u64>,
    pub total_positions: Option<u64>,
    /// Wei per gas.
    pub gas_price: Option<u128>,
    pub errors: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl DiagnosticsReport {
    pub fn is_healthy(&self) -> bool {
        self.errors.is_empty() && self.oracle_valid && self.contracts_reachable
    }
}

pub struct DiagnosticsReporter {
    chain: Arc<dyn ChainClient>,
    stats: Arc<KeeperStats>,
    tokens: Vec<TokenInfo>,
    call_timeout: Duration,
}

impl DiagnosticsReporter {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        stats: Arc<KeeperStats>,
        tokens: Vec<TokenInfo>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            chain,
            stats,
            tokens,
            call_timeout,
        }
    }

    /// Collect a report. Never fails: each read is independent.
    pub async fn snapshot(&self) -> DiagnosticsReport {
        let BalanceReport {
            keeper_address,
            balances,
            pool_balances,
            available_balances,
            oracle_prices,
            oracle_valid,
            mut errors,
        } = self.balance_report().await;

        let contracts_reachable = self
            .read("contracts", self.chain.contracts_reachable(), &mut errors)
            .await
            .unwrap_or(false);
        let total_orders = self
            .read("order count", self.chain.order_count(), &mut errors)
            .await;
        let total_positions = self
            .read("position count", self.chain.position_count(), &mut errors)
            .await;
        let gas_price = self
            .read("gas price", self.chain.gas_price(), &mut errors)
            .await;

        self.stats.record_diagnostics_run();

        DiagnosticsReport {
            keeper_address,
            balances,
            pool_balances,
            available_balances,
            oracle_prices,
            oracle_valid,
            contracts_reachable,
            total_orders,
            total_positions,
            gas_price,
            errors,
            timestamp: Utc::now(),
        }
    }

    /// Read keeper, pool and oracle state. Never fails.
    pub async fn balance_report(&self) -> BalanceReport {
        let keeper_address = self.chain.keeper_address().to_string();
        let tokens = self.checked_tokens();
        let mut errors = Vec::new();

        let balances = self
            .read(
                "balances",
                self.chain.balances(&keeper_address, &self.tokens),
                &mut errors,
            )
            .await
            .unwrap_or_default();
        let pool_balances = self
            .read("pool balances", self.chain.pool_balances(&tokens), &mut errors)
            .await
            .unwrap_or_default();
        let available_balances = self
            .read(
                "available balances",
                self.chain.available_balances(&keeper_address, &tokens),
                &mut errors,
            )
            .await
            .unwrap_or_default();

        let mut oracle_prices = BTreeMap::new();
        let mut oracle_valid = true;
        for token in &tokens {
            match self
                .read("oracle", self.chain.oracle_health(&token.address), &mut errors)
                .await
            {
                Some(health) => {
                    oracle_valid &= health.valid;
                    oracle_prices.insert(token.symbol.clone(), health.price);
                }
                None => {
                    oracle_valid = false;
                    oracle_prices.insert(token.symbol.clone(), None);
                }
            }
        }

        BalanceReport {
            keeper_address,
            balances,
            pool_balances,
            available_balances,
            oracle_prices,
            oracle_valid,
            errors,
        }
    }

    /// Log balances and prices tagged with `phase`, e.g. before an execution.
    pub async fn log_balances(&self, phase: &str) {
        let report = self.balance_report().await;
        info!(
            phase,
            keeper = %report.keeper_address,
            oracle_valid = report.oracle_valid,
            "💰 [DIAGNOSTICS] Balances"
        );
        log_amounts("Keeper balance", &report.balances);
        log_amounts("Pool balance", &report.pool_balances);
        log_amounts("Available in pool", &report.available_balances);
        log_prices(&report.oracle_prices);
        for error in &report.errors {
            warn!(phase, %error, "   Balance read failed");
        }
    }

    /// Write a report to the log.
    pub fn log_report(report: &DiagnosticsReport) {
        info!(
            keeper = %report.keeper_address,
            contracts_reachable = report.contracts_reachable,
            oracle_valid = report.oracle_valid,
            total_orders = ?report.total_orders,
            total_positions = ?report.total_positions,
            gas_price = ?report.gas_price,
            "🩺 [DIAGNOSTICS] Keeper health"
        );
        log_amounts("Keeper balance", &report.balances);
        log_amounts("Pool balance", &report.pool_balances);
        log_amounts("Available in pool", &report.available_balances);
        log_prices(&report.oracle_prices);
        for error in &report.errors {
            warn!(%error, "   Diagnostics read failed");
        }
    }

    /// Native token first, then configured tokens.
    fn checked_tokens(&self) -> Vec<TokenInfo> {
        let mut tokens = vec![TokenInfo {
            symbol: "ETH".to_string(),
            address: NATIVE_TOKEN.to_string(),
            decimals: 18,
        }];
        tokens.extend(
            self.tokens
                .iter()
                .filter(|t| t.address != NATIVE_TOKEN)
                .cloned(),
        );
        tokens
    }

    async fn read<T>(
        &self,
        what: &str,
        fut: impl Future<Output = ChainResult<T>>,
        errors: &mut Vec<String>,
    ) -> Option<T> {
        match with_timeout(self.call_timeout, fut).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(read = what, error = %e, "Diagnostics read failed");
                errors.push(format!("{}: {}", what, e));
                None
            }
        }
    }
}

fn log_amounts(label: &'static str, amounts: &BTreeMap<String, Decimal>) {
    for (symbol, amount) in amounts {
        info!(%symbol, %amount, "   {}", label);
    }
}

fn log_prices(prices: &BTreeMap<String, Option<Decimal>>) {
    for (symbol, price) in prices {
        match price {
            Some(price) => info!(%symbol, %price, "   Oracle price"),
            None => warn!(%symbol, "   Oracle price unavailable"),
        }
    }
}
