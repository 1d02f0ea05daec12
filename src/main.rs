//! Worker entry point.
//!
//! The default (and only) command starts the bot. Exit codes: 0 on a
//! normal stop, 1 on a configuration error, 2 on an unrecoverable startup
//! failure such as adapter authentication.

use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use funding_arb::adapter::paper::{spawn_market_simulator, PaperExchange};
use funding_arb::adapter::rest::{RestAdapter, RestConfig};
use funding_arb::adapter::ExchangeAdapter;
use funding_arb::lifecycle::audit::TracingAuditSink;
use funding_arb::{BotConfig, Worker};

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    let (writer, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(writer)
        .init();

    info!("═══════════════════════════════════════════════════");
    info!("  funding-arb — delta-neutral funding-rate worker");
    info!("═══════════════════════════════════════════════════");

    let config = BotConfig::from_env();
    if let Err(err) = config.validate() {
        error!(%err, "configuration invalid");
        return ExitCode::from(1);
    }
    let config = Arc::new(config);
    info!(
        perp = %config.perp_symbol,
        spot = %config.spot_symbol,
        dry_run = config.dry_run,
        eval_tick_ms = config.timing.eval_tick_ms,
        "configuration loaded"
    );

    // Dry run trades against the paper venue with a simulated market;
    // live mode signs against the real exchange.
    let adapter: Arc<dyn ExchangeAdapter> = if config.dry_run {
        let paper = PaperExchange::new(&config.base_asset, &config.quote_asset, config.base_decimals);
        paper.set_balance(funding_arb::types::Balance::new(
            config.quote_asset.clone(),
            100_000_000_000,
            0,
        ));
        spawn_market_simulator(paper.clone(), config.perp_symbol.clone(), 50_000_000_000, 20);
        info!("dry-run mode: paper venue with simulated market");
        paper
    } else {
        let rest_config = match RestConfig::from_env() {
            Ok(rest_config) => rest_config,
            Err(err) => {
                error!(%err, "exchange credentials missing");
                return ExitCode::from(1);
            }
        };
        match RestAdapter::new(rest_config) {
            Ok(adapter) => Arc::new(adapter),
            Err(err) => {
                error!(%err, "adapter construction failed");
                return ExitCode::from(2);
            }
        }
    };

    let worker = Worker::new(adapter, config, Arc::new(TracingAuditSink));

    // SIGINT flips the shutdown switch; the worker drains and stops.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    match worker.run(shutdown_rx).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "worker failed to start");
            ExitCode::from(2)
        }
    }
}
