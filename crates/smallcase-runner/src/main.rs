//! smallcase-runner: drive the aggregation engine against a SQLite ledger
//! and the paper broker.
//!
//! Usage:
//!   cargo run -p smallcase-runner                       # loop until Ctrl-C
//!   cargo run -p smallcase-runner -- --seed-demo --once
//!   cargo run -p smallcase-runner -- --db sqlite:demo.db --process-dividends
//!   cargo run -p smallcase-runner -- --reconcile

use std::sync::Arc;

use anyhow::Result;
use broker_trait::{BrokerMode, QuoteSource};
use chrono::{NaiveDate, Utc};
use paper_broker::{PaperBroker, PaperBrokerConfig};
use portfolio_manager::{AssetCatalog, PortfolioDb, PortfolioManager};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use smallcase_engine::{AggregationEngine, BrokerRouter, EngineConfig};
use tokio::signal::unix::SignalKind;
use tokio::time;

mod seed;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "smallcase_runner=info,smallcase_engine=info".into())
    };
    if json_logging {
        tracing_subscriber::fmt().json().with_env_filter(filter()).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
    }

    let args: Vec<String> = std::env::args().collect();
    let seed_demo = args.iter().any(|a| a == "--seed-demo");
    let once = args.iter().any(|a| a == "--once");
    let process_dividends = args.iter().any(|a| a == "--process-dividends");
    let reconcile = args.iter().any(|a| a == "--reconcile");

    let mut config = EngineConfig::from_env()?;
    if let Some(url) = args
        .iter()
        .position(|a| a == "--db")
        .and_then(|i| args.get(i + 1))
    {
        config.database_url = url.clone();
    }

    tracing::info!("Starting smallcase runner");
    tracing::info!("  Database: {}", config.database_url);
    tracing::info!("  Batch interval: {}s, max {} requests", config.batch_interval_seconds, config.max_batch_size);
    tracing::info!("  Quantity scale: {}, cash buffer: {} bps", config.quantity_scale, config.cash_buffer_bps);

    let db = PortfolioDb::new(&config.database_url).await?;
    let quotes: Arc<dyn QuoteSource> = Arc::new(AssetCatalog::new(db.clone()));
    let paper = PaperBroker::new(
        quotes.clone(),
        PaperBrokerConfig {
            starting_cash: config.paper_starting_cash,
            slippage_bps: config.paper_slippage_bps,
            max_fill_quantity: None,
        },
    );
    restore_paper_positions(&paper, &db).await?;
    tracing::info!(
        "Paper broker ready (cash {}, slippage {} bps)",
        config.paper_starting_cash,
        config.paper_slippage_bps
    );
    tracing::warn!("No live broker configured: live-mode requests will be rejected");

    let router = BrokerRouter::new(Arc::new(paper));
    let engine = AggregationEngine::new(db, quotes, router, config);

    let recovered = engine.recover_interrupted().await?;
    if recovered > 0 {
        tracing::warn!("{} requests from an interrupted batch need reconciliation", recovered);
    }

    if seed_demo {
        seed::seed_demo(&engine).await?;
    }

    if once || process_dividends || reconcile {
        if once {
            run_batch(&engine).await?;
        }
        if process_dividends {
            run_dividends(&engine, Utc::now().date_naive()).await?;
        }
        if reconcile {
            run_reconciliation(&engine).await?;
        }
        return Ok(());
    }

    let mut interval = time::interval(engine.config().batch_interval());
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
        }
    };
    tokio::pin!(shutdown);

    // Dividends and reconciliation run once per calendar day
    let mut last_daily_run: Option<NaiveDate> = None;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = run_batch(&engine).await {
                    tracing::error!("Batch cycle failed: {}", e);
                }

                let today = Utc::now().date_naive();
                if last_daily_run != Some(today) {
                    if let Err(e) = run_dividends(&engine, today).await {
                        tracing::error!("Dividend run failed: {}", e);
                    }
                    if let Err(e) = run_reconciliation(&engine).await {
                        tracing::error!("Reconciliation failed: {}", e);
                    }
                    last_daily_run = Some(today);
                }
            }
            _ = &mut shutdown => {
                break;
            }
        }
    }

    tracing::info!("Runner stopped");
    Ok(())
}

/// The paper account lives in memory; rebuild it from the ledger so it
/// matches what paper users already hold.
async fn restore_paper_positions(paper: &PaperBroker, db: &PortfolioDb) -> Result<()> {
    let holdings = PortfolioManager::new(db.clone())
        .holdings_for_broker_mode(BrokerMode::Paper)
        .await?;

    let mut pooled: BTreeMap<String, (Decimal, Decimal)> = BTreeMap::new();
    for holding in holdings {
        let entry = pooled.entry(holding.symbol.clone()).or_default();
        entry.0 += holding.quantity;
        entry.1 += holding.cost_basis();
    }
    if pooled.is_empty() {
        return Ok(());
    }

    tracing::info!("Restoring {} paper positions from the ledger", pooled.len());
    paper
        .restore_positions(
            pooled
                .into_iter()
                .filter(|(_, (qty, _))| *qty > Decimal::ZERO)
                .map(|(symbol, (qty, cost))| (symbol, qty, cost / qty)),
        )
        .await;
    Ok(())
}

async fn run_batch(engine: &AggregationEngine) -> Result<()> {
    let report = engine.run_pending().await?;
    if report.requests > 0 {
        tracing::info!("Batch report: {}", serde_json::to_string(&report)?);
    }
    Ok(())
}

async fn run_dividends(engine: &AggregationEngine, as_of: NaiveDate) -> Result<()> {
    let reports = engine.process_payable_dividends(as_of).await?;
    for report in &reports {
        tracing::info!("Dividend report: {}", serde_json::to_string(report)?);
    }
    Ok(())
}

async fn run_reconciliation(engine: &AggregationEngine) -> Result<()> {
    for mode in [BrokerMode::Paper, BrokerMode::Live] {
        if !engine.router().has(mode) {
            continue;
        }
        let result = engine.reconcile(mode).await?;
        tracing::info!(
            "Reconciled {}: {}/{} positions match",
            mode,
            result.matches,
            result.total_positions
        );
    }
    Ok(())
}
