use crate::db::PortfolioDb;
use crate::ledger;
use crate::models::*;
use anyhow::{anyhow, bail, Result};
use broker_trait::BrokerMode;
use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Users, their portfolios and the cash they hold.
#[derive(Clone)]
pub struct AccountManager {
    db: PortfolioDb,
}

impl AccountManager {
    pub fn new(db: PortfolioDb) -> Self {
        Self { db }
    }

    pub async fn create_user(
        &self,
        email: &str,
        display_name: &str,
        broker_mode: BrokerMode,
    ) -> Result<User> {
        let email = email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            bail!("Invalid email address: {:?}", email);
        }

        let user = User {
            id: Uuid::new_v4(),
            email,
            display_name: display_name.trim().to_string(),
            broker_mode,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO users (id, email, display_name, broker_mode, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user.id.to_string())
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(user.broker_mode.as_str())
        .bind(user.created_at)
        .execute(self.db.pool())
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                anyhow!("A user with email {} already exists", user.email)
            }
            other => other.into(),
        })?;

        Ok(user)
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(user_id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        Ok(user)
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
            .bind(email.trim().to_lowercase())
            .fetch_optional(self.db.pool())
            .await?;
        Ok(user)
    }

    /// The owner of a portfolio
    pub async fn portfolio_owner(&self, portfolio_id: Uuid) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT u.* FROM users u JOIN portfolios p ON p.user_id = u.id WHERE p.id = ?",
        )
        .bind(portfolio_id.to_string())
        .fetch_optional(self.db.pool())
        .await?;
        Ok(user)
    }

    /// Create a portfolio, recording any opening balance as a deposit.
    pub async fn create_portfolio(
        &self,
        user_id: Uuid,
        name: &str,
        opening_cash: Decimal,
    ) -> Result<Portfolio> {
        if opening_cash < Decimal::ZERO {
            bail!("Opening cash cannot be negative");
        }
        if self.get_user(user_id).await?.is_none() {
            bail!("User not found: {}", user_id);
        }

        let id = Uuid::new_v4();
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO portfolios (id, user_id, name, cash_balance, realized_pnl, drip_enabled, created_at) VALUES (?, ?, ?, '0', '0', 0, ?)",
        )
        .bind(id.to_string())
        .bind(user_id.to_string())
        .bind(name.trim())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        if opening_cash > Decimal::ZERO {
            ledger::adjust_cash(&mut tx, id, opening_cash, CashKind::Deposit, Some("opening balance"))
                .await?;
        }
        let portfolio = ledger::load_portfolio(&mut tx, id).await?;
        tx.commit().await?;

        Ok(portfolio)
    }

    pub async fn get_portfolio(&self, portfolio_id: Uuid) -> Result<Option<Portfolio>> {
        let portfolio = sqlx::query_as::<_, Portfolio>("SELECT * FROM portfolios WHERE id = ?")
            .bind(portfolio_id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        Ok(portfolio)
    }

    pub async fn list_portfolios(&self, user_id: Uuid) -> Result<Vec<Portfolio>> {
        let portfolios = sqlx::query_as::<_, Portfolio>(
            "SELECT * FROM portfolios WHERE user_id = ? ORDER BY created_at",
        )
        .bind(user_id.to_string())
        .fetch_all(self.db.pool())
        .await?;
        Ok(portfolios)
    }

    pub async fn deposit(&self, portfolio_id: Uuid, amount: Decimal) -> Result<Decimal> {
        if amount <= Decimal::ZERO {
            bail!("Deposit amount must be positive");
        }
        let mut tx = self.db.begin().await?;
        let balance =
            ledger::adjust_cash(&mut tx, portfolio_id, amount, CashKind::Deposit, None).await?;
        tx.commit().await?;
        Ok(balance)
    }

    pub async fn withdraw(&self, portfolio_id: Uuid, amount: Decimal) -> Result<Decimal> {
        if amount <= Decimal::ZERO {
            bail!("Withdrawal amount must be positive");
        }
        let mut tx = self.db.begin().await?;
        let portfolio = ledger::load_portfolio(&mut tx, portfolio_id).await?;
        if portfolio.cash_balance < amount {
            bail!(
                "Insufficient cash: balance {}, requested {}",
                portfolio.cash_balance,
                amount
            );
        }
        let balance =
            ledger::adjust_cash(&mut tx, portfolio_id, -amount, CashKind::Withdrawal, None).await?;
        tx.commit().await?;
        Ok(balance)
    }

    pub async fn set_drip_enabled(&self, portfolio_id: Uuid, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE portfolios SET drip_enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(portfolio_id.to_string())
            .execute(self.db.pool())
            .await?;
        if result.rows_affected() == 0 {
            bail!("Portfolio not found: {}", portfolio_id);
        }
        Ok(())
    }

    pub async fn cash_history(&self, portfolio_id: Uuid, limit: i64) -> Result<Vec<CashTransaction>> {
        let rows = sqlx::query_as::<_, CashTransaction>(
            "SELECT * FROM cash_transactions WHERE portfolio_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(portfolio_id.to_string())
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn setup() -> AccountManager {
        AccountManager::new(PortfolioDb::new("sqlite::memory:").await.unwrap())
    }

    #[tokio::test]
    async fn test_create_user_and_portfolio() {
        let accounts = setup().await;
        let user = accounts
            .create_user("Ravi@Example.com", "Ravi", BrokerMode::Paper)
            .await
            .unwrap();
        assert_eq!(user.email, "ravi@example.com");
        assert!(accounts
            .create_user("ravi@example.com", "Ravi again", BrokerMode::Live)
            .await
            .is_err());

        let portfolio = accounts
            .create_portfolio(user.id, "Long term", dec!(50000))
            .await
            .unwrap();
        assert_eq!(portfolio.cash_balance, dec!(50000));
        assert!(!portfolio.drip_enabled);

        let history = accounts.cash_history(portfolio.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, CashKind::Deposit);

        let owner = accounts.portfolio_owner(portfolio.id).await.unwrap().unwrap();
        assert_eq!(owner.id, user.id);
        assert_eq!(accounts.list_portfolios(user.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deposit_and_withdraw() {
        let accounts = setup().await;
        let user = accounts
            .create_user("meera@example.com", "Meera", BrokerMode::Paper)
            .await
            .unwrap();
        let portfolio = accounts
            .create_portfolio(user.id, "main", Decimal::ZERO)
            .await
            .unwrap();

        assert_eq!(accounts.deposit(portfolio.id, dec!(1000)).await.unwrap(), dec!(1000));
        assert_eq!(accounts.withdraw(portfolio.id, dec!(400)).await.unwrap(), dec!(600));
        assert!(accounts.withdraw(portfolio.id, dec!(600.01)).await.is_err());
        assert!(accounts.deposit(portfolio.id, dec!(-5)).await.is_err());

        let portfolio = accounts.get_portfolio(portfolio.id).await.unwrap().unwrap();
        assert_eq!(portfolio.cash_balance, dec!(600));
    }

    #[tokio::test]
    async fn test_drip_toggle() {
        let accounts = setup().await;
        let user = accounts
            .create_user("dev@example.com", "Dev", BrokerMode::Live)
            .await
            .unwrap();
        let portfolio = accounts.create_portfolio(user.id, "main", dec!(10)).await.unwrap();

        accounts.set_drip_enabled(portfolio.id, true).await.unwrap();
        assert!(accounts.get_portfolio(portfolio.id).await.unwrap().unwrap().drip_enabled);
        assert!(accounts.set_drip_enabled(Uuid::new_v4(), true).await.is_err());
    }
}
