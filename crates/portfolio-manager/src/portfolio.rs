use crate::db::PortfolioDb;
use crate::models::*;
use anyhow::{anyhow, Result};
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

pub struct PortfolioManager {
    db: PortfolioDb,
}

fn percent(part: Decimal, whole: Decimal) -> Decimal {
    if whole > Decimal::ZERO {
        (part / whole * Decimal::ONE_HUNDRED).round_dp(2)
    } else {
        Decimal::ZERO
    }
}

/// Value holdings at the given prices; holdings without a price keep their cost.
fn with_pnl(holdings: Vec<Holding>, prices: &HashMap<String, Decimal>) -> Vec<HoldingWithPnL> {
    holdings
        .into_iter()
        .map(|holding| {
            let current_price = prices
                .get(&holding.symbol)
                .copied()
                .unwrap_or(holding.avg_cost);
            let market_value = holding.quantity * current_price;
            let cost_basis = holding.cost_basis();
            let unrealized_pnl = market_value - cost_basis;
            HoldingWithPnL {
                unrealized_pnl_percent: percent(unrealized_pnl, cost_basis),
                holding,
                current_price,
                market_value,
                cost_basis,
                unrealized_pnl,
            }
        })
        .collect()
}

impl PortfolioManager {
    pub fn new(db: PortfolioDb) -> Self {
        Self { db }
    }

    /// Get a reference to the database
    pub fn db(&self) -> &PortfolioDb {
        &self.db
    }

    /// All holdings of a portfolio, direct and through smallcases
    pub async fn holdings(&self, portfolio_id: Uuid) -> Result<Vec<Holding>> {
        let holdings = sqlx::query_as::<_, Holding>(
            "SELECT * FROM holdings WHERE portfolio_id = ? ORDER BY symbol, investment_id",
        )
        .bind(portfolio_id.to_string())
        .fetch_all(self.db.pool())
        .await?;
        Ok(holdings)
    }

    /// Holdings bought directly, outside any smallcase
    pub async fn direct_holdings(&self, portfolio_id: Uuid) -> Result<Vec<Holding>> {
        let holdings = sqlx::query_as::<_, Holding>(
            "SELECT * FROM holdings WHERE portfolio_id = ? AND investment_id = '' ORDER BY symbol",
        )
        .bind(portfolio_id.to_string())
        .fetch_all(self.db.pool())
        .await?;
        Ok(holdings)
    }

    pub async fn investment_holdings(&self, investment_id: Uuid) -> Result<Vec<Holding>> {
        let holdings = sqlx::query_as::<_, Holding>(
            "SELECT * FROM holdings WHERE investment_id = ? ORDER BY symbol",
        )
        .bind(investment_id.to_string())
        .fetch_all(self.db.pool())
        .await?;
        Ok(holdings)
    }

    /// Every holding of every portfolio whose owner trades in `mode`
    pub async fn holdings_for_broker_mode(&self, mode: broker_trait::BrokerMode) -> Result<Vec<Holding>> {
        let holdings = sqlx::query_as::<_, Holding>(
            r#"
            SELECT h.* FROM holdings h
            JOIN portfolios p ON p.id = h.portfolio_id
            JOIN users u ON u.id = p.user_id
            WHERE u.broker_mode = ?
            ORDER BY h.symbol
            "#,
        )
        .bind(mode.as_str())
        .fetch_all(self.db.pool())
        .await?;
        Ok(holdings)
    }

    pub async fn get_investment(&self, investment_id: Uuid) -> Result<Option<SmallcaseInvestment>> {
        let investment = sqlx::query_as::<_, SmallcaseInvestment>(
            "SELECT * FROM user_smallcase_investments WHERE id = ?",
        )
        .bind(investment_id.to_string())
        .fetch_optional(self.db.pool())
        .await?;
        Ok(investment)
    }

    /// Investments of a portfolio, closed ones included
    pub async fn investments(&self, portfolio_id: Uuid) -> Result<Vec<SmallcaseInvestment>> {
        let investments = sqlx::query_as::<_, SmallcaseInvestment>(
            "SELECT * FROM user_smallcase_investments WHERE portfolio_id = ? ORDER BY created_at",
        )
        .bind(portfolio_id.to_string())
        .fetch_all(self.db.pool())
        .await?;
        Ok(investments)
    }

    pub async fn active_investment(
        &self,
        portfolio_id: Uuid,
        smallcase_id: Uuid,
    ) -> Result<Option<SmallcaseInvestment>> {
        let investment = sqlx::query_as::<_, SmallcaseInvestment>(
            "SELECT * FROM user_smallcase_investments WHERE portfolio_id = ? AND smallcase_id = ? AND status = 'active'",
        )
        .bind(portfolio_id.to_string())
        .bind(smallcase_id.to_string())
        .fetch_optional(self.db.pool())
        .await?;
        Ok(investment)
    }

    /// Get portfolio summary with current prices
    pub async fn get_portfolio_summary(
        &self,
        portfolio_id: Uuid,
        prices: &HashMap<String, Decimal>,
    ) -> Result<PortfolioSummary> {
        let portfolio = sqlx::query_as::<_, Portfolio>("SELECT * FROM portfolios WHERE id = ?")
            .bind(portfolio_id.to_string())
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| anyhow!("Portfolio not found: {}", portfolio_id))?;

        let positions = with_pnl(self.holdings(portfolio_id).await?, prices);
        let holdings_value: Decimal = positions.iter().map(|p| p.market_value).sum();
        let total_cost: Decimal = positions.iter().map(|p| p.cost_basis).sum();
        let unrealized_pnl = holdings_value - total_cost;

        Ok(PortfolioSummary {
            portfolio_id,
            cash_balance: portfolio.cash_balance,
            total_positions: positions.len(),
            holdings_value,
            total_value: portfolio.cash_balance + holdings_value,
            total_cost,
            unrealized_pnl,
            unrealized_pnl_percent: percent(unrealized_pnl, total_cost),
            realized_pnl: portfolio.realized_pnl,
            positions,
        })
    }

    /// Valuation of one smallcase investment, ready to be serialized as JSON
    pub async fn investment_summary(
        &self,
        investment_id: Uuid,
        prices: &HashMap<String, Decimal>,
    ) -> Result<InvestmentSummary> {
        let investment = self
            .get_investment(investment_id)
            .await?
            .ok_or_else(|| anyhow!("Investment not found: {}", investment_id))?;

        let (smallcase_name, latest_version): (String, i64) =
            sqlx::query_as("SELECT name, version FROM smallcases WHERE id = ?")
                .bind(investment.smallcase_id.to_string())
                .fetch_one(self.db.pool())
                .await?;

        let holdings = with_pnl(self.investment_holdings(investment_id).await?, prices);
        let current_value: Decimal = holdings.iter().map(|h| h.market_value).sum();
        let cost_basis: Decimal = holdings.iter().map(|h| h.cost_basis).sum();
        let total_return_percent = percent(
            current_value + investment.exit_value - investment.invested_amount,
            investment.invested_amount,
        );

        Ok(InvestmentSummary {
            rebalance_available: investment.status == InvestmentStatus::Active
                && investment.smallcase_version < latest_version,
            investment,
            smallcase_name,
            current_value,
            cost_basis,
            unrealized_pnl: current_value - cost_basis,
            total_return_percent,
            holdings,
        })
    }

    /// Save a portfolio snapshot for equity curve
    pub async fn save_snapshot(&self, summary: &PortfolioSummary) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO portfolio_snapshots (portfolio_id, total_value, total_cost, total_pnl, snapshot_date)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(summary.portfolio_id.to_string())
        .bind(summary.total_value.to_string())
        .bind(summary.total_cost.to_string())
        .bind((summary.unrealized_pnl + summary.realized_pnl).to_string())
        .bind(chrono::Utc::now())
        .fetch_one(self.db.pool())
        .await?;

        Ok(id)
    }

    /// Get portfolio snapshots for equity curve
    pub async fn get_snapshots(&self, portfolio_id: Uuid, days: i64) -> Result<Vec<PortfolioSnapshot>> {
        let since = chrono::Utc::now() - chrono::Duration::days(days);
        let snapshots = sqlx::query_as::<_, PortfolioSnapshot>(
            "SELECT * FROM portfolio_snapshots WHERE portfolio_id = ? AND snapshot_date >= ? ORDER BY snapshot_date",
        )
        .bind(portfolio_id.to_string())
        .bind(since)
        .fetch_all(self.db.pool())
        .await?;

        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountManager;
    use crate::ledger;
    use broker_trait::BrokerMode;
    use rust_decimal_macros::dec;

    async fn setup() -> (PortfolioManager, Uuid) {
        let db = PortfolioDb::new("sqlite::memory:").await.unwrap();
        let accounts = AccountManager::new(db.clone());
        let user = accounts
            .create_user("kiran@example.com", "Kiran", BrokerMode::Paper)
            .await
            .unwrap();
        let portfolio = accounts.create_portfolio(user.id, "main", dec!(5000)).await.unwrap();
        (PortfolioManager::new(db), portfolio.id)
    }

    #[tokio::test]
    async fn test_portfolio_summary() {
        let (manager, portfolio_id) = setup().await;
        {
            let mut conn = manager.db().pool().acquire().await.unwrap();
            ledger::apply_buy(&mut conn, portfolio_id, None, "INFY", dec!(10), dec!(100))
                .await
                .unwrap();
            ledger::apply_buy(&mut conn, portfolio_id, None, "TCS", dec!(2), dec!(500))
                .await
                .unwrap();
        }

        let prices = HashMap::from([("INFY".to_string(), dec!(110))]);
        let summary = manager.get_portfolio_summary(portfolio_id, &prices).await.unwrap();

        assert_eq!(summary.total_positions, 2);
        assert_eq!(summary.cash_balance, dec!(5000));
        // TCS has no price and is carried at cost
        assert_eq!(summary.holdings_value, dec!(2100));
        assert_eq!(summary.total_cost, dec!(2000));
        assert_eq!(summary.unrealized_pnl, dec!(100));
        assert_eq!(summary.unrealized_pnl_percent, dec!(5));
        assert_eq!(summary.total_value, dec!(7100));
        assert_eq!(manager.direct_holdings(portfolio_id).await.unwrap().len(), 2);

        manager.save_snapshot(&summary).await.unwrap();
        let snapshots = manager.get_snapshots(portfolio_id, 1).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].total_value, dec!(7100));
    }
}
