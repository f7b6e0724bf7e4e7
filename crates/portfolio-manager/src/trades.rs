use crate::db::PortfolioDb;
use crate::models::*;
use anyhow::Result;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Read side of the trading transaction log.
pub struct TradeLogger {
    db: PortfolioDb,
}

impl TradeLogger {
    pub fn new(db: PortfolioDb) -> Self {
        Self { db }
    }

    /// Get all transactions of a portfolio, newest first
    pub async fn get_transactions(
        &self,
        portfolio_id: Uuid,
        limit: Option<i64>,
    ) -> Result<Vec<TradingTransaction>> {
        let trades = sqlx::query_as::<_, TradingTransaction>(
            "SELECT * FROM trading_transactions WHERE portfolio_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(portfolio_id.to_string())
        .bind(limit.unwrap_or(-1))
        .fetch_all(self.db.pool())
        .await?;

        Ok(trades)
    }

    /// Transactions that belong to one smallcase investment, oldest first
    pub async fn get_investment_transactions(&self, investment_id: Uuid) -> Result<Vec<TradingTransaction>> {
        let trades = sqlx::query_as::<_, TradingTransaction>(
            "SELECT * FROM trading_transactions WHERE investment_id = ? ORDER BY created_at, rowid",
        )
        .bind(investment_id.to_string())
        .fetch_all(self.db.pool())
        .await?;

        Ok(trades)
    }

    /// Transactions written by one execution batch
    pub async fn get_batch_transactions(&self, batch_id: Uuid) -> Result<Vec<TradingTransaction>> {
        let trades = sqlx::query_as::<_, TradingTransaction>(
            "SELECT * FROM trading_transactions WHERE batch_id = ? ORDER BY rowid",
        )
        .bind(batch_id.to_string())
        .fetch_all(self.db.pool())
        .await?;

        Ok(trades)
    }

    /// Calculate performance metrics from the realized P&L stored on sells
    pub async fn get_performance_metrics(&self, portfolio_id: Uuid) -> Result<PerformanceMetrics> {
        let trades = self.get_transactions(portfolio_id, None).await?;

        let closed: Vec<Decimal> = trades.iter().filter_map(|t| t.realized_pnl).collect();
        let wins: Vec<Decimal> = closed.iter().copied().filter(|p| *p > Decimal::ZERO).collect();
        let losses: Vec<Decimal> = closed.iter().copied().filter(|p| *p < Decimal::ZERO).collect();

        let win_rate = if closed.is_empty() {
            0.0
        } else {
            (wins.len() as f64 / closed.len() as f64) * 100.0
        };

        let average = |values: &[Decimal]| {
            if values.is_empty() {
                Decimal::ZERO
            } else {
                values.iter().sum::<Decimal>() / Decimal::from(values.len())
            }
        };

        Ok(PerformanceMetrics {
            total_trades: trades.len(),
            closed_trades: closed.len(),
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate,
            total_realized_pnl: closed.iter().sum(),
            average_win: average(&wins),
            average_loss: average(&losses),
            largest_win: wins.iter().copied().max().unwrap_or_default(),
            largest_loss: losses.iter().copied().min().unwrap_or_default(),
            recent_trades: trades.into_iter().take(20).collect(),
        })
    }
}
