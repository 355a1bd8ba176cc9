//! DEX Keeper - Main Entry Point
//!
//! Runs the keeper loops until interrupted, or performs a single operator
//! command and exits.

use anyhow::{Context, Result};
use clap::Parser;
use dex_keeper::chain::{ChainClient, RpcChainClient};
use dex_keeper::config::{Config, LoggingConfig};
use dex_keeper::keeper::{
    DiagnosticsReport, ExecutionOutcome, ExecutionResult, KeeperController, KeeperStatus,
    OrderView, PositionView,
};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// DEX Keeper CLI
#[derive(Parser)]
#[command(name = "dex-keeper")]
#[command(version, about = "Executes triggered orders and liquidates underwater positions")]
struct Cli {
    /// Path to a config file (default: ./keeper.toml if present)
    #[arg(short, long)]
    config: Option<String>,

    /// JSON-RPC endpoint of the node
    #[arg(long)]
    rpc_url: Option<String>,

    /// Account transactions are sent from
    #[arg(long)]
    keeper_address: Option<String>,

    /// Seconds between order checks
    #[arg(long)]
    order_interval: Option<u64>,

    /// Seconds between position checks
    #[arg(long)]
    position_interval: Option<u64>,

    /// Liquidate at or below this PnL percent (negative)
    #[arg(long, allow_hyphen_values = true)]
    liquidation_threshold: Option<i64>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(long)]
    log_level: Option<String>,

    /// Do not run the order loop
    #[arg(long)]
    disable_orders: bool,

    /// Do not run the liquidation loop
    #[arg(long)]
    disable_liquidation: bool,

    /// Do not run the diagnostics loop
    #[arg(long)]
    disable_diagnostics: bool,

    /// Print keeper status and exit
    #[arg(long)]
    status: bool,

    /// Print every order and exit
    #[arg(long)]
    orders: bool,

    /// Print every position and exit
    #[arg(long)]
    positions: bool,

    /// Print a diagnostics snapshot and exit
    #[arg(long)]
    diagnostics: bool,

    /// Execute one order and exit
    #[arg(long, value_name = "ID")]
    execute_order: Option<u64>,

    /// Liquidate one position and exit
    #[arg(long, value_name = "ID")]
    liquidate_position: Option<u64>,
}

/// A command that runs once instead of starting the loops.
enum OneShot {
    Status,
    Orders,
    Positions,
    Diagnostics,
    ExecuteOrder(u64),
    LiquidatePosition(u64),
}

impl Cli {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(url) = &self.rpc_url {
            config.chain.rpc_url = url.clone();
        }
        if let Some(address) = &self.keeper_address {
            config.chain.keeper_address = address.clone();
        }
        if let Some(secs) = self.order_interval {
            config.keeper.order_check_interval_secs = secs;
        }
        if let Some(secs) = self.position_interval {
            config.keeper.position_check_interval_secs = secs;
        }
        if let Some(threshold) = self.liquidation_threshold {
            config.keeper.liquidation_threshold = threshold;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.disable_orders {
            config.keeper.enable_order_execution = false;
        }
        if self.disable_liquidation {
            config.keeper.enable_position_liquidation = false;
        }
        if self.disable_diagnostics {
            config.keeper.enable_diagnostics = false;
        }
    }

    fn one_shot(&self) -> Option<OneShot> {
        if let Some(id) = self.execute_order {
            Some(OneShot::ExecuteOrder(id))
        } else if let Some(id) = self.liquidate_position {
            Some(OneShot::LiquidatePosition(id))
        } else if self.status {
            Some(OneShot::Status)
        } else if self.orders {
            Some(OneShot::Orders)
        } else if self.positions {
            Some(OneShot::Positions)
        } else if self.diagnostics {
            Some(OneShot::Diagnostics)
        } else {
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);

    let _log_guard = init_logging(&config.logging)?;
    config.validate().context("Invalid configuration")?;

    let chain: Arc<dyn ChainClient> =
        Arc::new(RpcChainClient::new(&config).context("Failed to create chain client")?);
    let controller = KeeperController::new(config.clone(), chain);

    controller
        .initialize()
        .await
        .context("Keeper initialization failed")?;

    if let Some(command) = cli.one_shot() {
        return run_one_shot(&controller, command).await;
    }

    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║                  DEX Keeper v{}                         ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");
    log_config(&config);

    controller.start()?;
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    wait_for_shutdown_signal().await;
    info!("🛑 Shutdown signal received");

    controller.stop().await?;
    log_final_stats(&controller.status());

    Ok(())
}

async fn run_one_shot(controller: &KeeperController, command: OneShot) -> Result<()> {
    match command {
        OneShot::Status => print_status(&controller.status()),
        OneShot::Orders => print_orders(&controller.all_orders().await?),
        OneShot::Positions => print_positions(&controller.all_positions().await?),
        OneShot::Diagnostics => print_diagnostics(&controller.diagnostics().await),
        OneShot::ExecuteOrder(id) => {
            let result = controller.manual_execute_order(id).await?;
            return report_execution(&result);
        }
        OneShot::LiquidatePosition(id) => {
            let result = controller.manual_liquidate_position(id).await?;
            return report_execution(&result);
        }
    }
    Ok(())
}

/// Print an execution result; anything but a confirmation is an error.
fn report_execution(result: &ExecutionResult) -> Result<()> {
    match result.outcome {
        ExecutionOutcome::Confirmed => {
            println!(
                "✅ {} confirmed after {} attempt(s). Tx: {}",
                result.key,
                result.attempts,
                result.tx_hash.as_deref().unwrap_or("-")
            );
            Ok(())
        }
        ExecutionOutcome::Stale => anyhow::bail!("{} is no longer open", result.key),
        ExecutionOutcome::InFlight => {
            anyhow::bail!("{} is already being executed", result.key)
        }
        ExecutionOutcome::Rejected | ExecutionOutcome::Exhausted => anyhow::bail!(
            "{} failed after {} attempt(s): {}",
            result.key,
            result.attempts,
            result.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

fn print_status(status: &KeeperStatus) {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                     KEEPER STATUS                          ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!("   Keeper:            {}", status.keeper_address);
    println!(
        "   Network:           {}",
        status
            .network_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("   State:             {}", status.state);

    println!("\n📊 Counters");
    println!("   Order cycles:        {}", status.stats.orders_checked);
    println!("   Position cycles:     {}", status.stats.positions_checked);
    println!("   Orders executed:     {}", status.stats.orders_executed);
    println!("   Positions liquidated: {}", status.stats.positions_liquidated);
    println!("   Execution failures:  {}", status.stats.execution_failures);
    println!("   Diagnostics runs:    {}", status.stats.diagnostics_runs);

    let c = &status.config;
    println!("\n📋 Configuration");
    println!("   Order interval:      {}s", c.order_check_interval_secs);
    println!("   Position interval:   {}s", c.position_check_interval_secs);
    println!("   Diagnostics interval: {}s", c.diagnostics_interval_secs);
    println!("   Liquidation threshold: {}%", c.liquidation_threshold);
    println!("   Batch size:          {}", c.max_orders_per_batch);
    println!(
        "   Modules:             orders={} liquidation={} diagnostics={}",
        c.order_execution_enabled, c.position_liquidation_enabled, c.diagnostics_enabled
    );
    println!(
        "   Retry:               {} attempts, {}ms base, {}ms max",
        c.max_attempts, c.base_delay_ms, c.max_delay_ms
    );
}

fn print_orders(orders: &[OrderView]) {
    println!("📜 Orders ({})", orders.len());
    if orders.is_empty() {
        println!("   No orders found.");
        return;
    }
    for view in orders {
        let o = &view.order;
        println!(
            "   #{:<5} {:<9} {:<5} {:?}  trigger {} {}  price {}  execute {}",
            o.id,
            o.kind,
            o.side,
            o.status,
            o.comparator,
            o.trigger_price,
            view.mark_price
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            view.should_execute
                .map(|b| b.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
        if let Some(reason) = &view.failure_reason {
            println!("          ❌ {}", reason);
        }
    }
}

fn print_positions(positions: &[PositionView]) {
    println!("📜 Positions ({})", positions.len());
    if positions.is_empty() {
        println!("   No positions found.");
        return;
    }
    for view in positions {
        let p = &view.position;
        println!(
            "   #{:<5} {:<5} {}x {:?}  entry {}  mark {}  pnl {}{}",
            p.id,
            p.side,
            p.leverage,
            p.status,
            p.entry_price,
            view.mark_price
                .map(|m| m.to_string())
                .unwrap_or_else(|| "-".to_string()),
            view.pnl_ratio
                .map(|r| format!("{:.2}%", r))
                .unwrap_or_else(|| "-".to_string()),
            if view.liquidation_candidate {
                "  ⚠️ LIQUIDATABLE"
            } else {
                ""
            },
        );
        if let Some(reason) = &view.failure_reason {
            println!("          ❌ {}", reason);
        }
    }
}

fn print_diagnostics(report: &DiagnosticsReport) {
    println!("🩺 Diagnostics at {}", report.timestamp.to_rfc3339());
    println!("   Keeper:              {}", report.keeper_address);
    println!("   Contracts reachable: {}", report.contracts_reachable);
    println!("   Oracle valid:        {}", report.oracle_valid);
    if let Some(total) = report.total_orders {
        println!("   Total orders:        {}", total);
    }
    if let Some(total) = report.total_positions {
        println!("   Total positions:     {}", total);
    }
    if let Some(gas_price) = report.gas_price {
        println!("   Gas price:           {} wei", gas_price);
    }
    for (symbol, balance) in &report.balances {
        println!("   Balance {:<8}     {}", symbol, balance);
    }
    for (symbol, balance) in &report.pool_balances {
        println!("   Pool {:<8}        {}", symbol, balance);
    }
    for (symbol, balance) in &report.available_balances {
        println!("   Available {:<8}   {}", symbol, balance);
    }
    for (symbol, price) in &report.oracle_prices {
        match price {
            Some(price) => println!("   Price {:<8}       ${}", symbol, price),
            None => println!("   Price {:<8}       unavailable", symbol),
        }
    }
    for error in &report.errors {
        println!("   ❌ {}", error);
    }
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log directory {}", config.log_dir))?;

    let file_appender = tracing_appender::rolling::hourly(&config.log_dir, "dex-keeper.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let level = config.level.to_lowercase();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("dex_keeper={}", level).parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(guard)
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   RPC: {}", config.chain.rpc_url);
    info!("   Keeper: {}", config.chain.keeper_address);
    info!("   Router: {}", config.chain.router_address);
    info!(
        "   Order Check: every {}s (batch {}){}",
        config.keeper.order_check_interval_secs,
        config.keeper.max_orders_per_batch,
        if config.keeper.enable_order_execution { "" } else { " [disabled]" }
    );
    info!(
        "   Position Check: every {}s{}",
        config.keeper.position_check_interval_secs,
        if config.keeper.enable_position_liquidation { "" } else { " [disabled]" }
    );
    info!(
        "   Diagnostics: every {}s{}",
        config.keeper.diagnostics_interval_secs,
        if config.keeper.enable_diagnostics { "" } else { " [disabled]" }
    );
    info!("   Liquidation Threshold: {}%", config.keeper.liquidation_threshold);
    info!(
        "   Retry: {} attempts, {}ms base delay, {}ms max",
        config.retry.max_attempts, config.retry.base_delay_ms, config.retry.max_delay_ms
    );
    info!(
        "   Gas: limit {}, max price {} gwei",
        config.gas.gas_limit,
        config.gas.max_gas_price_wei / 1_000_000_000
    );
}

fn log_final_stats(status: &KeeperStatus) {
    info!("📊 Final Statistics:");
    info!("   Order cycles: {}", status.stats.orders_checked);
    info!("   Position cycles: {}", status.stats.positions_checked);
    info!("   Orders executed: {}", status.stats.orders_executed);
    info!("   Positions liquidated: {}", status.stats.positions_liquidated);
    info!("   Execution failures: {}", status.stats.execution_failures);
    info!("👋 DEX Keeper shutdown complete");
}

/// Wait for Ctrl-C, or SIGTERM on unix.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, waiting for Ctrl-C only");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
