use crate::aggregator::{LegRef, SymbolBook};
use crate::engine::AggregationEngine;
use crate::error::{EngineError, Result};
use crate::executor::record_broker_orders;
use crate::planner::floor_to_scale;
use broker_trait::BrokerMode;
use chrono::NaiveDate;
use portfolio_manager::{
    dividends, ledger, CashKind, DividendEntitlement, DividendStatus, InvestmentStatus,
    NewTransaction, TradeSide, TransactionSource,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DividendReport {
    pub dividend_id: Uuid,
    pub symbol: String,
    pub payments: usize,
    pub gross_total: Decimal,
    pub reinvested_quantity: Decimal,
    pub reinvested_cost: Decimal,
    pub cash_paid: Decimal,
}

struct Payee {
    entitlement: DividendEntitlement,
    mode: BrokerMode,
    gross: Decimal,
    /// Shares the payout can buy, zero when not reinvesting
    desired: Decimal,
}

impl AggregationEngine {
    /// Pay one dividend to everyone who held the stock before its ex-date.
    /// Portfolios with DRIP enabled have whole shares bought back through a
    /// single aggregated order per broker mode; the remainder is paid as
    /// cash. Processing is all-or-nothing and runs at most once.
    pub async fn process_dividend(&self, dividend_id: Uuid, as_of: NaiveDate) -> Result<DividendReport> {
        let _guard = self.batch_lock.lock().await;

        let dividend = self
            .dividends
            .get(dividend_id)
            .await?
            .ok_or(EngineError::DividendNotFound(dividend_id))?;
        if dividend.status == DividendStatus::Paid {
            return Err(EngineError::DividendAlreadyProcessed(dividend_id));
        }
        if dividend.pay_date > as_of {
            return Err(EngineError::DividendNotPayable(dividend_id, dividend.pay_date));
        }

        let quote = self.quotes.latest_price(&dividend.symbol).await?;
        let scale = self.config.quantity_scale;

        let mut payees = Vec::new();
        for entitlement in self.dividends.entitlements(&dividend).await? {
            let portfolio = match self.accounts.get_portfolio(entitlement.portfolio_id).await? {
                Some(p) => p,
                None => continue,
            };
            let Some(owner) = self.accounts.portfolio_owner(portfolio.id).await? else {
                continue;
            };

            let gross = (entitlement.quantity * dividend.amount_per_share).round_dp(2);
            let investment_open = match entitlement.investment_id {
                Some(id) => matches!(
                    self.portfolios.get_investment(id).await?,
                    Some(inv) if inv.status == InvestmentStatus::Active
                ),
                None => true,
            };

            let desired = match quote {
                Some(price)
                    if portfolio.drip_enabled
                        && investment_open
                        && price > Decimal::ZERO
                        && self.router().has(owner.broker_mode) =>
                {
                    floor_to_scale(gross / price, scale)
                }
                _ => Decimal::ZERO,
            };

            payees.push(Payee {
                entitlement,
                mode: owner.broker_mode,
                gross,
                desired,
            });
        }

        let mut books: BTreeMap<BrokerMode, SymbolBook> = BTreeMap::new();
        if let Some(price) = quote {
            for (i, payee) in payees.iter().enumerate() {
                if payee.desired > Decimal::ZERO {
                    books
                        .entry(payee.mode)
                        .or_insert_with(|| SymbolBook::new(payee.mode, &dividend.symbol, price))
                        .buys
                        .push((LegRef { request: i, leg: 0 }, payee.desired));
                }
            }
        }
        let books: Vec<SymbolBook> = books.into_values().collect();

        let tag = format!("div-{}", dividend.id.simple());
        let executions = self.executor.execute(&tag, &books).await;

        let mut reinvested: HashMap<usize, (Decimal, Decimal)> = HashMap::new();
        for (book, execution) in books.iter().zip(&executions) {
            for (leg, quantity) in book.fills(execution.broker_filled, scale) {
                if quantity > Decimal::ZERO {
                    reinvested.insert(leg.request, (quantity, execution.price));
                }
            }
        }

        let mut report = DividendReport {
            dividend_id,
            symbol: dividend.symbol.clone(),
            ..Default::default()
        };
        let reference = format!("dividend:{}", dividend.id);

        {
            let mut conn = self.db.pool().acquire().await?;
            record_broker_orders(&mut *conn, None, &executions).await?;
        }

        let mut tx = self.db.begin().await?;

        for (i, payee) in payees.iter().enumerate() {
            let (quantity, price) = reinvested.get(&i).copied().unwrap_or_default();
            let cost = quantity * price;
            let cash = payee.gross - cost;
            let portfolio_id = payee.entitlement.portfolio_id;

            let recorded = dividends::record_payment(
                &mut *tx,
                &dividend,
                &payee.entitlement,
                payee.gross,
                quantity,
                (quantity > Decimal::ZERO).then_some(price),
                cash,
            )
            .await?;
            if !recorded {
                continue;
            }

            ledger::adjust_cash(&mut *tx, portfolio_id, payee.gross, CashKind::Dividend, Some(&reference))
                .await?;

            if quantity > Decimal::ZERO {
                let investment_id = payee.entitlement.investment_id;
                ledger::apply_buy(&mut *tx, portfolio_id, investment_id, &dividend.symbol, quantity, price)
                    .await?;
                ledger::adjust_cash(&mut *tx, portfolio_id, -cost, CashKind::TradeBuy, Some(&reference))
                    .await?;
                ledger::record_transaction(
                    &mut *tx,
                    &NewTransaction {
                        portfolio_id,
                        investment_id,
                        batch_id: None,
                        request_key: Some(reference.clone()),
                        symbol: dividend.symbol.clone(),
                        side: TradeSide::Buy,
                        quantity,
                        price,
                        realized_pnl: None,
                        source: TransactionSource::Drip,
                    },
                )
                .await?;
            }

            report.payments += 1;
            report.gross_total += payee.gross;
            report.reinvested_quantity += quantity;
            report.reinvested_cost += cost;
            report.cash_paid += cash;
        }

        if !dividends::mark_paid(&mut *tx, dividend_id).await? {
            tx.rollback().await?;
            return Err(EngineError::DividendAlreadyProcessed(dividend_id));
        }
        tx.commit().await?;

        tracing::info!(
            "Dividend {} on {}: {} payments, {} paid, {} shares reinvested",
            dividend_id,
            dividend.symbol,
            report.payments,
            report.gross_total,
            report.reinvested_quantity
        );
        Ok(report)
    }

    /// Process every announced dividend whose pay date has arrived.
    /// A failing dividend is logged and skipped.
    pub async fn process_payable_dividends(&self, as_of: NaiveDate) -> Result<Vec<DividendReport>> {
        let mut reports = Vec::new();
        for dividend in self.dividends.payable(as_of).await? {
            match self.process_dividend(dividend.id, as_of).await {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!("Dividend {} failed: {}", dividend.id, e),
            }
        }
        Ok(reports)
    }
}
