use crate::db::{investment_key, PortfolioDb};
use crate::models::*;
use anyhow::{bail, Result};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::SqliteConnection;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Announced corporate dividends and the payments made against them.
#[derive(Clone)]
pub struct DividendRegistry {
    db: PortfolioDb,
}

impl DividendRegistry {
    pub fn new(db: PortfolioDb) -> Self {
        Self { db }
    }

    pub async fn announce(
        &self,
        symbol: &str,
        amount_per_share: Decimal,
        ex_date: NaiveDate,
        pay_date: NaiveDate,
    ) -> Result<Dividend> {
        if amount_per_share <= Decimal::ZERO {
            bail!("Dividend per share must be positive");
        }
        if pay_date < ex_date {
            bail!("Pay date {} is before ex-date {}", pay_date, ex_date);
        }

        let dividend = Dividend {
            id: Uuid::new_v4(),
            symbol: symbol.to_uppercase(),
            amount_per_share,
            ex_date,
            pay_date,
            status: DividendStatus::Announced,
            created_at: Utc::now(),
            processed_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO dividends (id, symbol, amount_per_share, ex_date, pay_date, status, created_at)
            VALUES (?, ?, ?, ?, ?, 'announced', ?)
            "#,
        )
        .bind(dividend.id.to_string())
        .bind(&dividend.symbol)
        .bind(amount_per_share.to_string())
        .bind(ex_date)
        .bind(pay_date)
        .bind(dividend.created_at)
        .execute(self.db.pool())
        .await?;

        Ok(dividend)
    }

    pub async fn get(&self, dividend_id: Uuid) -> Result<Option<Dividend>> {
        let dividend = sqlx::query_as::<_, Dividend>("SELECT * FROM dividends WHERE id = ?")
            .bind(dividend_id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        Ok(dividend)
    }

    /// Unpaid dividends whose pay date has arrived
    pub async fn payable(&self, as_of: NaiveDate) -> Result<Vec<Dividend>> {
        let dividends = sqlx::query_as::<_, Dividend>(
            "SELECT * FROM dividends WHERE status = 'announced' AND pay_date <= ? ORDER BY pay_date, created_at",
        )
        .bind(as_of)
        .fetch_all(self.db.pool())
        .await?;
        Ok(dividends)
    }

    pub async fn payments(&self, dividend_id: Uuid) -> Result<Vec<DividendPayment>> {
        let payments = sqlx::query_as::<_, DividendPayment>(
            "SELECT * FROM dividend_payments WHERE dividend_id = ? ORDER BY created_at, portfolio_id",
        )
        .bind(dividend_id.to_string())
        .fetch_all(self.db.pool())
        .await?;
        Ok(payments)
    }

    /// Quantity of the dividend's symbol each portfolio bucket held before
    /// the ex-date, rebuilt from the transaction log so positions sold after
    /// the ex-date still receive the payout.
    pub async fn entitlements(&self, dividend: &Dividend) -> Result<Vec<DividendEntitlement>> {
        let cutoff = dividend
            .ex_date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or_else(Utc::now);

        let trades = sqlx::query_as::<_, TradingTransaction>(
            "SELECT * FROM trading_transactions WHERE symbol = ? ORDER BY created_at, rowid",
        )
        .bind(&dividend.symbol)
        .fetch_all(self.db.pool())
        .await?;

        let mut held: BTreeMap<(Uuid, String), (Option<Uuid>, Decimal)> = BTreeMap::new();
        for trade in trades.iter().filter(|t| t.created_at < cutoff) {
            let entry = held
                .entry((trade.portfolio_id, investment_key(trade.investment_id)))
                .or_insert((trade.investment_id, Decimal::ZERO));
            match trade.side {
                TradeSide::Buy => entry.1 += trade.quantity,
                TradeSide::Sell => entry.1 -= trade.quantity,
            }
        }

        Ok(held
            .into_iter()
            .filter(|(_, (_, qty))| *qty > Decimal::ZERO)
            .map(|((portfolio_id, _), (investment_id, quantity))| DividendEntitlement {
                portfolio_id,
                investment_id,
                quantity,
            })
            .collect())
    }
}

/// Record one payment; returns false when it was already recorded.
pub async fn record_payment(
    conn: &mut SqliteConnection,
    dividend: &Dividend,
    entitlement: &DividendEntitlement,
    gross_amount: Decimal,
    reinvested_quantity: Decimal,
    reinvest_price: Option<Decimal>,
    cash_amount: Decimal,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO dividend_payments
        (dividend_id, portfolio_id, investment_id, symbol, quantity, gross_amount, reinvested_quantity, reinvest_price, cash_amount, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (dividend_id, portfolio_id, investment_id, symbol) DO NOTHING
        "#,
    )
    .bind(dividend.id.to_string())
    .bind(entitlement.portfolio_id.to_string())
    .bind(investment_key(entitlement.investment_id))
    .bind(&dividend.symbol)
    .bind(entitlement.quantity.to_string())
    .bind(gross_amount.to_string())
    .bind(reinvested_quantity.to_string())
    .bind(reinvest_price.map(|p| p.to_string()))
    .bind(cash_amount.to_string())
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Flip a dividend to paid; false if another run got there first.
pub async fn mark_paid(conn: &mut SqliteConnection, dividend_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE dividends SET status = 'paid', processed_at = ? WHERE id = ? AND status = 'announced'",
    )
    .bind(Utc::now())
    .bind(dividend_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountManager;
    use crate::assets::AssetCatalog;
    use crate::ledger;
    use broker_trait::BrokerMode;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_announce_validation_and_payable() {
        let db = PortfolioDb::new("sqlite::memory:").await.unwrap();
        AssetCatalog::new(db.clone())
            .upsert_asset("ITC", "ITC", "NSE", dec!(430))
            .await
            .unwrap();
        let registry = DividendRegistry::new(db);
        let today = Utc::now().date_naive();

        assert!(registry.announce("ITC", dec!(0), today, today).await.is_err());
        assert!(registry
            .announce("ITC", dec!(6.5), today, today - Duration::days(1))
            .await
            .is_err());

        let due = registry.announce("ITC", dec!(6.5), today, today).await.unwrap();
        registry
            .announce("ITC", dec!(7), today, today + Duration::days(10))
            .await
            .unwrap();

        let payable = registry.payable(today).await.unwrap();
        assert_eq!(payable.len(), 1);
        assert_eq!(payable[0].id, due.id);
        assert_eq!(payable[0].amount_per_share, dec!(6.5));
    }

    #[tokio::test]
    async fn test_entitlements_from_transactions() {
        let db = PortfolioDb::new("sqlite::memory:").await.unwrap();
        AssetCatalog::new(db.clone())
            .upsert_asset("ITC", "ITC", "NSE", dec!(430))
            .await
            .unwrap();
        let accounts = AccountManager::new(db.clone());
        let user = accounts
            .create_user("om@example.com", "Om", BrokerMode::Paper)
            .await
            .unwrap();
        let portfolio = accounts.create_portfolio(user.id, "main", dec!(0)).await.unwrap();

        {
            let mut conn = db.pool().acquire().await.unwrap();
            for (side, qty) in [(TradeSide::Buy, dec!(10)), (TradeSide::Sell, dec!(4))] {
                ledger::record_transaction(
                    &mut conn,
                    &NewTransaction {
                        portfolio_id: portfolio.id,
                        investment_id: None,
                        batch_id: None,
                        request_key: None,
                        symbol: "ITC".to_string(),
                        side,
                        quantity: qty,
                        price: dec!(430),
                        realized_pnl: None,
                        source: TransactionSource::Direct,
                    },
                )
                .await
                .unwrap();
            }
        }

        let registry = DividendRegistry::new(db);
        let tomorrow = Utc::now().date_naive() + Duration::days(1);
        let dividend = registry.announce("ITC", dec!(5), tomorrow, tomorrow).await.unwrap();
        let entitlements = registry.entitlements(&dividend).await.unwrap();
        assert_eq!(
            entitlements,
            vec![DividendEntitlement {
                portfolio_id: portfolio.id,
                investment_id: None,
                quantity: dec!(6),
            }]
        );

        // Nothing was held before an ex-date in the past
        let yesterday = Utc::now().date_naive() - Duration::days(1);
        let old = registry.announce("ITC", dec!(5), yesterday, yesterday).await.unwrap();
        assert!(registry.entitlements(&old).await.unwrap().is_empty());
    }
}
