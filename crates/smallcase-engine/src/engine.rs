use crate::aggregator::{aggregate, LegRef};
use crate::config::EngineConfig;
use crate::error::{EngineError, Rejection, Result};
use crate::executor::{record_broker_orders, BrokerRouter, OrderExecutor, SymbolExecution};
use crate::planner::{self, PlannedLeg};
use crate::requests::{
    self, LegFill, OrderIntent, OrderRequest, RequestOutcome, RequestQueue, RequestStatus,
};
use broker_trait::{BrokerMode, QuoteSource};
use chrono::Utc;
use portfolio_manager::db::investment_key;
use portfolio_manager::{
    ledger, AccountManager, CashKind, DividendRegistry, NewTransaction, Portfolio, PortfolioDb,
    PortfolioManager, ReconciliationResult, Reconciler, SmallcaseCatalog, SmallcaseInvestment,
    TradeSide, TransactionSource,
};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::SqliteConnection;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Summary of one `run_pending` pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub batch_id: Option<Uuid>,
    pub requests: usize,
    pub filled: usize,
    pub partially_filled: usize,
    pub rejected: usize,
    pub failed: usize,
    pub broker_orders: usize,
    pub crossed_symbols: usize,
    #[serde(skip)]
    pub outcomes: Vec<(String, RequestOutcome)>,
}

impl BatchReport {
    fn record(&mut self, key: &str, outcome: RequestOutcome) {
        match outcome.status {
            RequestStatus::Filled => self.filled += 1,
            RequestStatus::PartiallyFilled => self.partially_filled += 1,
            RequestStatus::Rejected => self.rejected += 1,
            _ => self.failed += 1,
        }
        self.outcomes.push((key.to_string(), outcome));
    }

    pub fn outcome(&self, key: &str) -> Option<&RequestOutcome> {
        self.outcomes.iter().find(|(k, _)| k == key).map(|(_, o)| o)
    }
}

/// A request ready for execution.
#[derive(Debug)]
struct PlannedRequest {
    request: OrderRequest,
    mode: BrokerMode,
    source: TransactionSource,
    investment_id: Option<Uuid>,
    /// Smallcase and the version the legs were planned against
    smallcase: Option<(Uuid, i64)>,
    legs: Vec<PlannedLeg>,
}

enum Entry {
    Ready(PlannedRequest),
    Rejected(OrderRequest, Rejection),
}

enum PlanError {
    Rejected(Rejection),
    Engine(EngineError),
}

impl From<Rejection> for PlanError {
    fn from(r: Rejection) -> Self {
        PlanError::Rejected(r)
    }
}

impl From<EngineError> for PlanError {
    fn from(e: EngineError) -> Self {
        PlanError::Engine(e)
    }
}

impl From<anyhow::Error> for PlanError {
    fn from(e: anyhow::Error) -> Self {
        PlanError::Engine(EngineError::Store(e))
    }
}

/// Cash and shares already promised to earlier requests of the batch.
#[derive(Default)]
struct Reservations {
    cash: HashMap<Uuid, Decimal>,
    shares: HashMap<(Uuid, String, String), Decimal>,
    /// (portfolio, smallcase) pairs already touched by the batch
    busy: HashSet<(Uuid, Uuid)>,
}

impl Reservations {
    fn reserve_cash(&mut self, portfolio: &Portfolio, required: Decimal) -> std::result::Result<(), Rejection> {
        let available = self.cash.entry(portfolio.id).or_insert(portfolio.cash_balance);
        if required > *available {
            return Err(Rejection::InsufficientCash {
                required,
                available: *available,
            });
        }
        *available -= required;
        Ok(())
    }

    fn reserve_shares(
        &mut self,
        portfolio_id: Uuid,
        investment_id: Option<Uuid>,
        symbol: &str,
        held: Decimal,
        required: Decimal,
    ) -> std::result::Result<(), Rejection> {
        let reserved = self
            .shares
            .entry((portfolio_id, investment_key(investment_id), symbol.to_string()))
            .or_default();
        let available = held - *reserved;
        if required > available {
            return Err(Rejection::InsufficientQuantity {
                symbol: symbol.to_string(),
                required,
                available,
            });
        }
        *reserved += required;
        Ok(())
    }
}

/// Collects user requests, nets them per stock and executes one broker
/// order per (mode, symbol), then fans the fills back out to every user.
pub struct AggregationEngine {
    pub(crate) db: PortfolioDb,
    pub(crate) queue: RequestQueue,
    pub(crate) accounts: AccountManager,
    pub(crate) smallcases: SmallcaseCatalog,
    pub(crate) portfolios: PortfolioManager,
    pub(crate) dividends: DividendRegistry,
    pub(crate) quotes: Arc<dyn QuoteSource>,
    pub(crate) executor: OrderExecutor,
    pub(crate) config: EngineConfig,
    /// Serializes batches, dividend runs and reconciliation
    pub(crate) batch_lock: Mutex<()>,
}

impl AggregationEngine {
    pub fn new(
        db: PortfolioDb,
        quotes: Arc<dyn QuoteSource>,
        router: BrokerRouter,
        config: EngineConfig,
    ) -> Self {
        let executor = OrderExecutor::new(
            router,
            config.fill_poll_attempts,
            config.fill_poll_interval(),
        );
        Self {
            queue: RequestQueue::new(db.clone()),
            accounts: AccountManager::new(db.clone()),
            smallcases: SmallcaseCatalog::new(db.clone()),
            portfolios: PortfolioManager::new(db.clone()),
            dividends: DividendRegistry::new(db.clone()),
            db,
            quotes,
            executor,
            config,
            batch_lock: Mutex::new(()),
        }
    }

    pub fn db(&self) -> &PortfolioDb {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn accounts(&self) -> &AccountManager {
        &self.accounts
    }

    pub fn smallcases(&self) -> &SmallcaseCatalog {
        &self.smallcases
    }

    pub fn portfolios(&self) -> &PortfolioManager {
        &self.portfolios
    }

    pub fn dividends(&self) -> &DividendRegistry {
        &self.dividends
    }

    pub fn router(&self) -> &BrokerRouter {
        self.executor.router()
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    pub async fn submit(
        &self,
        portfolio_id: Uuid,
        idempotency_key: &str,
        intent: OrderIntent,
    ) -> Result<OrderRequest> {
        if self.accounts.get_portfolio(portfolio_id).await?.is_none() {
            return Err(EngineError::PortfolioNotFound(portfolio_id));
        }
        self.queue.submit(portfolio_id, idempotency_key, intent).await
    }

    pub async fn submit_investment(
        &self,
        portfolio_id: Uuid,
        idempotency_key: &str,
        smallcase_id: Uuid,
        amount: Decimal,
    ) -> Result<OrderRequest> {
        self.submit(
            portfolio_id,
            idempotency_key,
            OrderIntent::Invest {
                smallcase_id,
                amount,
            },
        )
        .await
    }

    pub async fn submit_exit(
        &self,
        portfolio_id: Uuid,
        idempotency_key: &str,
        investment_id: Uuid,
    ) -> Result<OrderRequest> {
        self.submit(portfolio_id, idempotency_key, OrderIntent::Exit { investment_id })
            .await
    }

    pub async fn submit_rebalance(
        &self,
        portfolio_id: Uuid,
        idempotency_key: &str,
        investment_id: Uuid,
    ) -> Result<OrderRequest> {
        self.submit(
            portfolio_id,
            idempotency_key,
            OrderIntent::Rebalance { investment_id },
        )
        .await
    }

    pub async fn submit_trade(
        &self,
        portfolio_id: Uuid,
        idempotency_key: &str,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
    ) -> Result<OrderRequest> {
        self.submit(
            portfolio_id,
            idempotency_key,
            OrderIntent::Trade {
                symbol: symbol.to_string(),
                side,
                quantity,
            },
        )
        .await
    }

    pub async fn request(&self, idempotency_key: &str) -> Result<Option<OrderRequest>> {
        self.queue.get(idempotency_key).await
    }

    /// Fail requests a crashed batch left in processing. Run at startup.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let _guard = self.batch_lock.lock().await;
        let failed = self.queue.fail_interrupted().await?;
        sqlx::query(
            "UPDATE execution_batches SET status = 'interrupted', completed_at = ? WHERE status = 'running'",
        )
        .bind(Utc::now())
        .execute(self.db.pool())
        .await?;
        if failed > 0 {
            tracing::warn!("Marked {} interrupted requests as failed", failed);
        }
        Ok(failed)
    }

    // -----------------------------------------------------------------------
    // Batch processing
    // -----------------------------------------------------------------------

    /// Drain up to `max_batch_size` pending requests as one batch.
    pub async fn run_pending(&self) -> Result<BatchReport> {
        let _guard = self.batch_lock.lock().await;

        let requests = self.queue.pending(self.config.max_batch_size).await?;
        if requests.is_empty() {
            return Ok(BatchReport::default());
        }

        let batch_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO execution_batches (id, status, request_count, started_at) VALUES (?, 'running', ?, ?)",
        )
        .bind(batch_id.to_string())
        .bind(requests.len() as i64)
        .bind(Utc::now())
        .execute(self.db.pool())
        .await?;

        let keys: Vec<String> = requests.iter().map(|r| r.idempotency_key.clone()).collect();
        self.queue.claim(batch_id, &keys).await?;
        tracing::info!("Batch {} started with {} requests", batch_id, requests.len());

        match self.process_batch(batch_id, requests).await {
            Ok(report) => {
                tracing::info!(
                    "Batch {} done: {} filled, {} partial, {} rejected, {} failed, {} broker orders",
                    batch_id,
                    report.filled,
                    report.partially_filled,
                    report.rejected,
                    report.failed,
                    report.broker_orders
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!("Batch {} failed: {}", batch_id, e);
                let message = format!("batch failed: {}", e);
                if let Err(mark_err) = self.queue.fail_batch(batch_id, &message).await {
                    tracing::error!("Could not mark batch {} requests failed: {}", batch_id, mark_err);
                }
                let marked = sqlx::query(
                    "UPDATE execution_batches SET status = 'failed', summary = ?, completed_at = ? WHERE id = ?",
                )
                .bind(&message)
                .bind(Utc::now())
                .bind(batch_id.to_string())
                .execute(self.db.pool())
                .await;
                if let Err(mark_err) = marked {
                    tracing::error!("Could not mark batch {} failed: {}", batch_id, mark_err);
                }
                Err(e)
            }
        }
    }

    async fn process_batch(&self, batch_id: Uuid, requests: Vec<OrderRequest>) -> Result<BatchReport> {
        let mut reservations = Reservations::default();
        let mut prices: HashMap<String, Decimal> = HashMap::new();
        let mut entries = Vec::with_capacity(requests.len());

        for request in requests {
            match self.plan_request(&request, &mut reservations, &mut prices).await {
                Ok(planned) => {
                    tracing::debug!(
                        "Planned {} ({}) with {} legs",
                        request.idempotency_key,
                        request.intent.kind(),
                        planned.legs.len()
                    );
                    entries.push(Entry::Ready(planned));
                }
                Err(PlanError::Rejected(reason)) => {
                    tracing::warn!("Rejected {}: {}", request.idempotency_key, reason);
                    entries.push(Entry::Rejected(request, reason));
                }
                Err(PlanError::Engine(e)) => return Err(e),
            }
        }

        let books = aggregate(entries.iter().enumerate().flat_map(|(i, entry)| match entry {
            Entry::Ready(p) => p
                .legs
                .iter()
                .enumerate()
                .map(|(j, leg)| (LegRef { request: i, leg: j }, p.mode, leg))
                .collect::<Vec<_>>(),
            Entry::Rejected(..) => Vec::new(),
        }));

        let executions = self.executor.execute(&batch_id.simple().to_string(), &books).await;

        let mut fills: HashMap<LegRef, Decimal> = HashMap::new();
        for (book, execution) in books.iter().zip(&executions) {
            fills.extend(book.fills(execution.broker_filled, self.config.quantity_scale));
        }
        let by_symbol: HashMap<(BrokerMode, String), &SymbolExecution> = executions
            .iter()
            .map(|e| ((e.mode, e.symbol.clone()), e))
            .collect();

        let mut report = BatchReport {
            batch_id: Some(batch_id),
            requests: entries.len(),
            crossed_symbols: books.iter().filter(|b| b.crossed() > Decimal::ZERO).count(),
            ..Default::default()
        };

        // Written outside the settlement transaction
        report.broker_orders = {
            let mut conn = self.db.pool().acquire().await?;
            record_broker_orders(&mut *conn, Some(batch_id), &executions).await?
        };

        let mut tx = self.db.begin().await?;

        for (index, entry) in entries.iter().enumerate() {
            let (request, outcome) = match entry {
                Entry::Rejected(request, reason) => (request, RequestOutcome::rejected(reason.to_string())),
                Entry::Ready(planned) => (
                    &planned.request,
                    settle(&mut *tx, batch_id, index, planned, &fills, &by_symbol).await?,
                ),
            };
            requests::complete(&mut *tx, &request.idempotency_key, &outcome).await?;
            report.record(&request.idempotency_key, outcome);
        }

        sqlx::query(
            "UPDATE execution_batches SET status = 'completed', order_count = ?, summary = ?, completed_at = ? WHERE id = ?",
        )
        .bind(report.broker_orders as i64)
        .bind(serde_json::to_string(&report)?)
        .bind(Utc::now())
        .bind(batch_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(report)
    }

    async fn load_quotes<'a>(
        &self,
        symbols: impl IntoIterator<Item = &'a str>,
        prices: &mut HashMap<String, Decimal>,
    ) -> Result<()> {
        let missing: Vec<String> = symbols
            .into_iter()
            .filter(|s| !prices.contains_key(*s))
            .map(str::to_string)
            .collect();
        if !missing.is_empty() {
            prices.extend(self.quotes.latest_prices(&missing).await?);
        }
        Ok(())
    }

    async fn owned_investment(
        &self,
        portfolio_id: Uuid,
        investment_id: Uuid,
    ) -> std::result::Result<SmallcaseInvestment, PlanError> {
        let investment = self
            .portfolios
            .get_investment(investment_id)
            .await?
            .ok_or(Rejection::InvestmentNotFound)?;
        if investment.portfolio_id != portfolio_id {
            return Err(Rejection::NotOwner.into());
        }
        if investment.status != portfolio_manager::InvestmentStatus::Active {
            return Err(Rejection::InvestmentClosed.into());
        }
        Ok(investment)
    }

    async fn plan_request(
        &self,
        request: &OrderRequest,
        reservations: &mut Reservations,
        prices: &mut HashMap<String, Decimal>,
    ) -> std::result::Result<PlannedRequest, PlanError> {
        let portfolio_id = request.portfolio_id;
        let portfolio = self
            .accounts
            .get_portfolio(portfolio_id)
            .await?
            .ok_or(Rejection::PortfolioNotFound(portfolio_id))?;
        let owner = self
            .accounts
            .portfolio_owner(portfolio_id)
            .await?
            .ok_or(Rejection::PortfolioNotFound(portfolio_id))?;
        let mode = owner.broker_mode;
        if !self.executor.router().has(mode) {
            return Err(Rejection::BrokerUnavailable(mode).into());
        }

        let scale = self.config.quantity_scale;
        let headroom = self.config.buy_headroom();
        let haircut = self.config.sell_haircut();

        let planned = |source, investment_id, smallcase, legs| PlannedRequest {
            request: request.clone(),
            mode,
            source,
            investment_id,
            smallcase,
            legs,
        };

        match &request.intent {
            OrderIntent::Invest {
                smallcase_id,
                amount,
            } => {
                let smallcase = self
                    .smallcases
                    .get(*smallcase_id)
                    .await?
                    .ok_or(Rejection::SmallcaseNotFound)?;
                if !smallcase.is_active {
                    return Err(Rejection::SmallcaseInactive.into());
                }
                if reservations.busy.contains(&(portfolio_id, smallcase.id)) {
                    return Err(Rejection::InvestmentBusy.into());
                }

                self.load_quotes(smallcase.constituents.iter().map(|c| c.symbol.as_str()), prices)
                    .await?;
                let legs = planner::plan_investment(&smallcase.constituents, prices, *amount, scale)?;
                reservations.reserve_cash(&portfolio, planner::cash_required(&legs, headroom, haircut)?)?;
                reservations.busy.insert((portfolio_id, smallcase.id));

                let existing = self
                    .portfolios
                    .active_investment(portfolio_id, smallcase.id)
                    .await?
                    .map(|i| i.id);
                Ok(planned(
                    TransactionSource::SmallcaseInvest,
                    existing,
                    Some((smallcase.id, smallcase.version)),
                    legs,
                ))
            }

            OrderIntent::Exit { investment_id } => {
                let investment = self.owned_investment(portfolio_id, *investment_id).await?;
                if reservations.busy.contains(&(portfolio_id, investment.smallcase_id)) {
                    return Err(Rejection::InvestmentBusy.into());
                }

                let holdings = self.portfolios.investment_holdings(investment.id).await?;
                self.load_quotes(holdings.iter().map(|h| h.symbol.as_str()), prices)
                    .await?;
                let legs = planner::plan_exit(&holdings, prices)?;
                for (leg, holding) in legs.iter().zip(&holdings) {
                    reservations.reserve_shares(
                        portfolio_id,
                        Some(investment.id),
                        &leg.symbol,
                        holding.quantity,
                        leg.quantity,
                    )?;
                }
                reservations.busy.insert((portfolio_id, investment.smallcase_id));

                Ok(planned(
                    TransactionSource::SmallcaseExit,
                    Some(investment.id),
                    Some((investment.smallcase_id, investment.smallcase_version)),
                    legs,
                ))
            }

            OrderIntent::Rebalance { investment_id } => {
                let investment = self.owned_investment(portfolio_id, *investment_id).await?;
                if reservations.busy.contains(&(portfolio_id, investment.smallcase_id)) {
                    return Err(Rejection::InvestmentBusy.into());
                }
                let smallcase = self
                    .smallcases
                    .get(investment.smallcase_id)
                    .await?
                    .ok_or(Rejection::SmallcaseNotFound)?;

                let holdings = self.portfolios.investment_holdings(investment.id).await?;
                self.load_quotes(
                    holdings
                        .iter()
                        .map(|h| h.symbol.as_str())
                        .chain(smallcase.constituents.iter().map(|c| c.symbol.as_str())),
                    prices,
                )
                .await?;
                let legs =
                    planner::plan_rebalance(&holdings, &smallcase.constituents, prices, scale)?;
                reservations.reserve_cash(&portfolio, planner::cash_required(&legs, headroom, haircut)?)?;
                for leg in legs.iter().filter(|l| l.side == TradeSide::Sell) {
                    let held = holdings
                        .iter()
                        .find(|h| h.symbol == leg.symbol)
                        .map(|h| h.quantity)
                        .unwrap_or_default();
                    reservations.reserve_shares(
                        portfolio_id,
                        Some(investment.id),
                        &leg.symbol,
                        held,
                        leg.quantity,
                    )?;
                }
                reservations.busy.insert((portfolio_id, investment.smallcase_id));

                Ok(planned(
                    TransactionSource::Rebalance,
                    Some(investment.id),
                    Some((smallcase.id, smallcase.version)),
                    legs,
                ))
            }

            OrderIntent::Trade {
                symbol,
                side,
                quantity,
            } => {
                self.load_quotes([symbol.as_str()], prices).await?;
                let legs = planner::plan_trade(symbol, *side, *quantity, prices, scale)?;
                match side {
                    TradeSide::Buy => reservations
                        .reserve_cash(&portfolio, planner::cash_required(&legs, headroom, haircut)?)?,
                    TradeSide::Sell => {
                        let held = self
                            .portfolios
                            .direct_holdings(portfolio_id)
                            .await?
                            .into_iter()
                            .find(|h| &h.symbol == symbol)
                            .map(|h| h.quantity)
                            .unwrap_or_default();
                        reservations.reserve_shares(portfolio_id, None, symbol, held, legs[0].quantity)?;
                    }
                }
                Ok(planned(TransactionSource::Direct, None, None, legs))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// Compare the pooled broker account for `mode` with the summed ledger
    /// and store the result.
    pub async fn reconcile(&self, mode: BrokerMode) -> Result<ReconciliationResult> {
        let _guard = self.batch_lock.lock().await;
        let broker = self.executor.router().get(mode).ok_or_else(|| {
            EngineError::InvalidRequest(format!("no broker configured for {} trading", mode))
        })?;

        let positions = broker.get_positions().await?;
        let result = Reconciler::reconcile(&self.portfolios, mode, &positions).await?;
        Reconciler::save_log(&self.db, &result).await?;

        if result.discrepancies.is_empty() {
            tracing::info!("Reconciliation ({}): {} positions match", mode, result.matches);
        } else {
            for d in &result.discrepancies {
                tracing::warn!(
                    "Reconciliation ({}): {} {} local={:?} broker={:?}",
                    mode,
                    d.symbol,
                    d.discrepancy_type,
                    d.local_shares,
                    d.broker_shares
                );
            }
        }
        Ok(result)
    }
}

/// Write one request's share of the batch into the ledger.
async fn settle(
    conn: &mut SqliteConnection,
    batch_id: Uuid,
    index: usize,
    planned: &PlannedRequest,
    fills: &HashMap<LegRef, Decimal>,
    executions: &HashMap<(BrokerMode, String), &SymbolExecution>,
) -> Result<RequestOutcome> {
    let key = planned.request.idempotency_key.as_str();
    let portfolio_id = planned.request.portfolio_id;

    let filled_of = |leg: usize| {
        fills
            .get(&LegRef {
                request: index,
                leg,
            })
            .copied()
            .unwrap_or_default()
    };
    let any_filled = (0..planned.legs.len()).any(|i| filled_of(i) > Decimal::ZERO);

    let mut investment_id = planned.investment_id;
    if planned.source == TransactionSource::SmallcaseInvest && any_filled {
        if let Some((smallcase_id, version)) = planned.smallcase {
            let investment = match ledger::find_active_investment(conn, portfolio_id, smallcase_id).await? {
                Some(existing) => existing,
                None => ledger::create_investment(conn, portfolio_id, smallcase_id, version).await?,
            };
            investment_id = Some(investment.id);
        }
    }

    let mut leg_fills = Vec::with_capacity(planned.legs.len());
    let mut errors = Vec::new();
    let mut bought = Decimal::ZERO;
    let mut sold = Decimal::ZERO;
    let mut realized = Decimal::ZERO;
    let mut complete = true;

    for (i, leg) in planned.legs.iter().enumerate() {
        let filled = filled_of(i);
        let execution = executions.get(&(planned.mode, leg.symbol.clone()));
        let price = execution.map(|e| e.price).unwrap_or(leg.quote);

        if filled < leg.quantity {
            complete = false;
            if let Some(err) = execution.and_then(|e| e.error.as_ref()) {
                errors.push(format!("{}: {}", leg.symbol, err));
            }
        }
        leg_fills.push(LegFill {
            symbol: leg.symbol.clone(),
            side: leg.side,
            requested: leg.quantity,
            filled,
            price: (filled > Decimal::ZERO).then_some(price),
        });
        if filled <= Decimal::ZERO {
            continue;
        }

        let amount = filled * price;
        let pnl = match leg.side {
            TradeSide::Buy => {
                ledger::apply_buy(conn, portfolio_id, investment_id, &leg.symbol, filled, price).await?;
                ledger::adjust_cash(conn, portfolio_id, -amount, CashKind::TradeBuy, Some(key)).await?;
                bought += amount;
                None
            }
            TradeSide::Sell => {
                let pnl =
                    ledger::apply_sell(conn, portfolio_id, investment_id, &leg.symbol, filled, price).await?;
                ledger::adjust_cash(conn, portfolio_id, amount, CashKind::TradeSell, Some(key)).await?;
                sold += amount;
                realized += pnl;
                Some(pnl)
            }
        };

        ledger::record_transaction(
            conn,
            &NewTransaction {
                portfolio_id,
                investment_id,
                batch_id: Some(batch_id),
                request_key: Some(key.to_string()),
                symbol: leg.symbol.clone(),
                side: leg.side,
                quantity: filled,
                price,
                realized_pnl: pnl,
                source: planned.source,
            },
        )
        .await?;
    }

    ledger::add_realized_pnl(conn, portfolio_id, realized).await?;

    if let Some(investment_id) = investment_id {
        match planned.source {
            TransactionSource::SmallcaseInvest if any_filled => {
                ledger::update_investment_totals(conn, investment_id, bought, Decimal::ZERO, Decimal::ZERO)
                    .await?;
            }
            TransactionSource::SmallcaseExit => {
                if any_filled {
                    ledger::update_investment_totals(conn, investment_id, Decimal::ZERO, realized, sold)
                        .await?;
                }
                if ledger::count_investment_holdings(conn, investment_id).await? == 0 {
                    ledger::close_investment(conn, investment_id).await?;
                    tracing::info!("Investment {} closed", investment_id);
                }
            }
            TransactionSource::Rebalance => {
                if any_filled {
                    ledger::update_investment_totals(conn, investment_id, bought - sold, realized, Decimal::ZERO)
                        .await?;
                }
                if complete {
                    if let Some((_, version)) = planned.smallcase {
                        ledger::set_investment_version(conn, investment_id, version).await?;
                    }
                }
            }
            _ => {}
        }
    }

    let status = if complete {
        RequestStatus::Filled
    } else if any_filled {
        RequestStatus::PartiallyFilled
    } else {
        RequestStatus::Failed
    };
    let message = if !errors.is_empty() {
        Some(errors.join("; "))
    } else if status == RequestStatus::Failed {
        Some("no quantity was filled".to_string())
    } else {
        None
    };

    Ok(RequestOutcome {
        status,
        message,
        investment_id,
        fills: leg_fills,
        cash_delta: sold - bought,
        realized_pnl: realized,
    })
}
