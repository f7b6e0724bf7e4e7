//! Connection-level writes for cash, holdings, transactions and investments.
//!
//! Every function takes a `&mut SqliteConnection` so callers can compose
//! several of them inside one transaction; none of them commit.

use crate::db::investment_key;
use crate::models::*;
use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::SqliteConnection;
use uuid::Uuid;

pub async fn load_portfolio(conn: &mut SqliteConnection, portfolio_id: Uuid) -> Result<Portfolio> {
    sqlx::query_as::<_, Portfolio>("SELECT * FROM portfolios WHERE id = ?")
        .bind(portfolio_id.to_string())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| anyhow!("Portfolio not found: {}", portfolio_id))
}

/// Apply a signed cash movement and log it. Returns the new balance.
pub async fn adjust_cash(
    conn: &mut SqliteConnection,
    portfolio_id: Uuid,
    delta: Decimal,
    kind: CashKind,
    reference: Option<&str>,
) -> Result<Decimal> {
    let portfolio = load_portfolio(conn, portfolio_id).await?;
    let balance = portfolio.cash_balance + delta;

    sqlx::query("UPDATE portfolios SET cash_balance = ? WHERE id = ?")
        .bind(balance.to_string())
        .bind(portfolio_id.to_string())
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO cash_transactions (id, portfolio_id, kind, amount, balance_after, reference, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(portfolio_id.to_string())
    .bind(kind.as_str())
    .bind(delta.to_string())
    .bind(balance.to_string())
    .bind(reference)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    Ok(balance)
}

pub async fn add_realized_pnl(
    conn: &mut SqliteConnection,
    portfolio_id: Uuid,
    pnl: Decimal,
) -> Result<()> {
    if pnl.is_zero() {
        return Ok(());
    }
    let portfolio = load_portfolio(conn, portfolio_id).await?;
    sqlx::query("UPDATE portfolios SET realized_pnl = ? WHERE id = ?")
        .bind((portfolio.realized_pnl + pnl).to_string())
        .bind(portfolio_id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn find_holding(
    conn: &mut SqliteConnection,
    portfolio_id: Uuid,
    investment_id: Option<Uuid>,
    symbol: &str,
) -> Result<Option<Holding>> {
    let holding = sqlx::query_as::<_, Holding>(
        "SELECT * FROM holdings WHERE portfolio_id = ? AND investment_id = ? AND symbol = ?",
    )
    .bind(portfolio_id.to_string())
    .bind(investment_key(investment_id))
    .bind(symbol)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(holding)
}

/// Add shares to a holding, re-averaging its cost.
pub async fn apply_buy(
    conn: &mut SqliteConnection,
    portfolio_id: Uuid,
    investment_id: Option<Uuid>,
    symbol: &str,
    quantity: Decimal,
    price: Decimal,
) -> Result<Holding> {
    if quantity <= Decimal::ZERO {
        bail!("buy quantity must be positive, got {}", quantity);
    }

    let now = Utc::now();
    match find_holding(conn, portfolio_id, investment_id, symbol).await? {
        Some(mut holding) => {
            let total = holding.quantity + quantity;
            holding.avg_cost = (holding.cost_basis() + quantity * price) / total;
            holding.quantity = total;
            holding.updated_at = now;

            sqlx::query("UPDATE holdings SET quantity = ?, avg_cost = ?, updated_at = ? WHERE id = ?")
                .bind(holding.quantity.to_string())
                .bind(holding.avg_cost.to_string())
                .bind(now)
                .bind(holding.id.to_string())
                .execute(&mut *conn)
                .await?;
            Ok(holding)
        }
        None => {
            let holding = Holding {
                id: Uuid::new_v4(),
                portfolio_id,
                investment_id,
                symbol: symbol.to_string(),
                quantity,
                avg_cost: price,
                updated_at: now,
            };
            sqlx::query(
                r#"
                INSERT INTO holdings (id, portfolio_id, investment_id, symbol, quantity, avg_cost, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(holding.id.to_string())
            .bind(portfolio_id.to_string())
            .bind(investment_key(investment_id))
            .bind(symbol)
            .bind(quantity.to_string())
            .bind(price.to_string())
            .bind(now)
            .execute(&mut *conn)
            .await?;
            Ok(holding)
        }
    }
}

/// Remove shares from a holding (deleting it at zero) and return the
/// realized P&L against its average cost.
pub async fn apply_sell(
    conn: &mut SqliteConnection,
    portfolio_id: Uuid,
    investment_id: Option<Uuid>,
    symbol: &str,
    quantity: Decimal,
    price: Decimal,
) -> Result<Decimal> {
    if quantity <= Decimal::ZERO {
        bail!("sell quantity must be positive, got {}", quantity);
    }

    let holding = find_holding(conn, portfolio_id, investment_id, symbol)
        .await?
        .ok_or_else(|| anyhow!("No holding of {} in portfolio {}", symbol, portfolio_id))?;

    if quantity > holding.quantity {
        bail!(
            "Cannot sell {} {}: only {} held",
            quantity,
            symbol,
            holding.quantity
        );
    }

    let realized = (price - holding.avg_cost) * quantity;
    let remaining = holding.quantity - quantity;

    if remaining.is_zero() {
        sqlx::query("DELETE FROM holdings WHERE id = ?")
            .bind(holding.id.to_string())
            .execute(&mut *conn)
            .await?;
    } else {
        sqlx::query("UPDATE holdings SET quantity = ?, updated_at = ? WHERE id = ?")
            .bind(remaining.to_string())
            .bind(Utc::now())
            .bind(holding.id.to_string())
            .execute(&mut *conn)
            .await?;
    }

    Ok(realized)
}

pub async fn record_transaction(conn: &mut SqliteConnection, tx: &NewTransaction) -> Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO trading_transactions
        (id, portfolio_id, investment_id, batch_id, request_key, symbol, side, quantity, price, amount, realized_pnl, source, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(tx.portfolio_id.to_string())
    .bind(tx.investment_id.map(|i| i.to_string()))
    .bind(tx.batch_id.map(|b| b.to_string()))
    .bind(&tx.request_key)
    .bind(&tx.symbol)
    .bind(tx.side.as_str())
    .bind(tx.quantity.to_string())
    .bind(tx.price.to_string())
    .bind((tx.quantity * tx.price).to_string())
    .bind(tx.realized_pnl.map(|p| p.to_string()))
    .bind(tx.source.as_str())
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(id)
}

// ---------------------------------------------------------------------------
// Investment lifecycle
// ---------------------------------------------------------------------------

pub async fn get_investment(
    conn: &mut SqliteConnection,
    investment_id: Uuid,
) -> Result<Option<SmallcaseInvestment>> {
    let investment = sqlx::query_as::<_, SmallcaseInvestment>(
        "SELECT * FROM user_smallcase_investments WHERE id = ?",
    )
    .bind(investment_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(investment)
}

pub async fn find_active_investment(
    conn: &mut SqliteConnection,
    portfolio_id: Uuid,
    smallcase_id: Uuid,
) -> Result<Option<SmallcaseInvestment>> {
    let investment = sqlx::query_as::<_, SmallcaseInvestment>(
        "SELECT * FROM user_smallcase_investments WHERE portfolio_id = ? AND smallcase_id = ? AND status = 'active'",
    )
    .bind(portfolio_id.to_string())
    .bind(smallcase_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(investment)
}

pub async fn create_investment(
    conn: &mut SqliteConnection,
    portfolio_id: Uuid,
    smallcase_id: Uuid,
    smallcase_version: i64,
) -> Result<SmallcaseInvestment> {
    let now = Utc::now();
    let investment = SmallcaseInvestment {
        id: Uuid::new_v4(),
        portfolio_id,
        smallcase_id,
        smallcase_version,
        status: InvestmentStatus::Active,
        invested_amount: Decimal::ZERO,
        realized_pnl: Decimal::ZERO,
        exit_value: Decimal::ZERO,
        created_at: now,
        updated_at: now,
        closed_at: None,
    };

    sqlx::query(
        r#"
        INSERT INTO user_smallcase_investments
        (id, portfolio_id, smallcase_id, smallcase_version, status, invested_amount, realized_pnl, exit_value, created_at, updated_at)
        VALUES (?, ?, ?, ?, 'active', '0', '0', '0', ?, ?)
        "#,
    )
    .bind(investment.id.to_string())
    .bind(portfolio_id.to_string())
    .bind(smallcase_id.to_string())
    .bind(smallcase_version)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(investment)
}

/// Add deltas to an investment's running totals.
pub async fn update_investment_totals(
    conn: &mut SqliteConnection,
    investment_id: Uuid,
    invested_delta: Decimal,
    realized_delta: Decimal,
    exit_delta: Decimal,
) -> Result<SmallcaseInvestment> {
    let mut investment = get_investment(conn, investment_id)
        .await?
        .ok_or_else(|| anyhow!("Investment not found: {}", investment_id))?;

    investment.invested_amount += invested_delta;
    investment.realized_pnl += realized_delta;
    investment.exit_value += exit_delta;
    investment.updated_at = Utc::now();

    sqlx::query(
        r#"
        UPDATE user_smallcase_investments
        SET invested_amount = ?, realized_pnl = ?, exit_value = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(investment.invested_amount.to_string())
    .bind(investment.realized_pnl.to_string())
    .bind(investment.exit_value.to_string())
    .bind(investment.updated_at)
    .bind(investment_id.to_string())
    .execute(&mut *conn)
    .await?;

    Ok(investment)
}

pub async fn set_investment_version(
    conn: &mut SqliteConnection,
    investment_id: Uuid,
    version: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE user_smallcase_investments SET smallcase_version = ?, updated_at = ? WHERE id = ?",
    )
    .bind(version)
    .bind(Utc::now())
    .bind(investment_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn count_investment_holdings(
    conn: &mut SqliteConnection,
    investment_id: Uuid,
) -> Result<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM holdings WHERE investment_id = ?")
            .bind(investment_id.to_string())
            .fetch_one(&mut *conn)
            .await?;
    Ok(count)
}

/// Mark an investment closed. The row and its transactions are kept.
pub async fn close_investment(conn: &mut SqliteConnection, investment_id: Uuid) -> Result<()> {
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        UPDATE user_smallcase_investments
        SET status = 'closed', closed_at = ?, updated_at = ?
        WHERE id = ? AND status = 'active'
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(investment_id.to_string())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        bail!("Investment {} is not active", investment_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountManager;
    use crate::db::PortfolioDb;
    use broker_trait::BrokerMode;
    use rust_decimal_macros::dec;

    async fn setup() -> (PortfolioDb, Uuid) {
        let db = PortfolioDb::new("sqlite::memory:").await.unwrap();
        let accounts = AccountManager::new(db.clone());
        let user = accounts
            .create_user("asha@example.com", "Asha", BrokerMode::Paper)
            .await
            .unwrap();
        let portfolio = accounts
            .create_portfolio(user.id, "main", dec!(10000))
            .await
            .unwrap();
        (db, portfolio.id)
    }

    #[tokio::test]
    async fn test_buy_averages_cost() {
        let (db, portfolio_id) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();

        apply_buy(&mut conn, portfolio_id, None, "INFY", dec!(10), dec!(100)).await.unwrap();
        let holding = apply_buy(&mut conn, portfolio_id, None, "INFY", dec!(10), dec!(120))
            .await
            .unwrap();

        assert_eq!(holding.quantity, dec!(20));
        assert_eq!(holding.avg_cost, dec!(110));
    }

    #[tokio::test]
    async fn test_sell_realizes_pnl_and_removes_empty_holding() {
        let (db, portfolio_id) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();

        apply_buy(&mut conn, portfolio_id, None, "INFY", dec!(10), dec!(100)).await.unwrap();
        let pnl = apply_sell(&mut conn, portfolio_id, None, "INFY", dec!(4), dec!(125))
            .await
            .unwrap();
        assert_eq!(pnl, dec!(100));

        assert!(apply_sell(&mut conn, portfolio_id, None, "INFY", dec!(7), dec!(125))
            .await
            .is_err());

        let pnl = apply_sell(&mut conn, portfolio_id, None, "INFY", dec!(6), dec!(90))
            .await
            .unwrap();
        assert_eq!(pnl, dec!(-60));
        assert!(find_holding(&mut conn, portfolio_id, None, "INFY")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_adjust_cash_logs_balance() {
        let (db, portfolio_id) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();

        let balance = adjust_cash(&mut conn, portfolio_id, dec!(-2500.50), CashKind::TradeBuy, Some("test"))
            .await
            .unwrap();
        assert_eq!(balance, dec!(7499.50));

        let portfolio = load_portfolio(&mut conn, portfolio_id).await.unwrap();
        assert_eq!(portfolio.cash_balance, dec!(7499.50));
    }

    #[tokio::test]
    async fn test_close_investment_only_once() {
        let (db, portfolio_id) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();

        sqlx::query(
            "INSERT INTO smallcases (id, name, version, is_active, created_at, updated_at) VALUES (?, 'Test', 1, 1, ?, ?)",
        )
        .bind(Uuid::nil().to_string())
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .unwrap();

        let investment = create_investment(&mut conn, portfolio_id, Uuid::nil(), 1).await.unwrap();
        let found = find_active_investment(&mut conn, portfolio_id, Uuid::nil())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, investment.id);

        close_investment(&mut conn, investment.id).await.unwrap();
        assert!(close_investment(&mut conn, investment.id).await.is_err());

        let closed = get_investment(&mut conn, investment.id).await.unwrap().unwrap();
        assert_eq!(closed.status, InvestmentStatus::Closed);
        assert!(closed.closed_at.is_some());
        assert!(find_active_investment(&mut conn, portfolio_id, Uuid::nil())
            .await
            .unwrap()
            .is_none());
    }
}
