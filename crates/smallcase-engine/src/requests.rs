//! The idempotent request queue. Callers enqueue intents under a key of
//! their choosing; the batch engine drains pending requests and writes an
//! outcome back onto each one.

use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use portfolio_manager::{PortfolioDb, TradeSide};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqliteConnection};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Largest cash amount a single request may carry, 10^15.
pub const MAX_ORDER_AMOUNT: Decimal = Decimal::from_parts(2764472320, 232830, 0, false, 0);
/// Largest share quantity a single trade may carry, 10^12.
pub const MAX_ORDER_QUANTITY: Decimal = Decimal::from_parts(3567587328, 232, 0, false, 0);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderIntent {
    /// Buy into a smallcase, or top up the active investment
    Invest { smallcase_id: Uuid, amount: Decimal },
    /// Sell every holding of an investment and close it
    Exit { investment_id: Uuid },
    /// Bring an investment in line with the latest smallcase version
    Rebalance { investment_id: Uuid },
    /// Buy or sell a single stock outside any smallcase
    Trade {
        symbol: String,
        side: TradeSide,
        quantity: Decimal,
    },
}

impl OrderIntent {
    pub fn kind(&self) -> &'static str {
        match self {
            OrderIntent::Invest { .. } => "invest",
            OrderIntent::Exit { .. } => "exit",
            OrderIntent::Rebalance { .. } => "rebalance",
            OrderIntent::Trade { .. } => "trade",
        }
    }

    /// Shape checks that need no database access.
    pub fn validate(&self) -> Result<()> {
        match self {
            OrderIntent::Invest { amount, .. } if *amount <= Decimal::ZERO => Err(
                EngineError::InvalidRequest("investment amount must be positive".to_string()),
            ),
            OrderIntent::Invest { amount, .. } if *amount > MAX_ORDER_AMOUNT => Err(
                EngineError::InvalidRequest(format!("investment amount exceeds {}", MAX_ORDER_AMOUNT)),
            ),
            OrderIntent::Trade { symbol, .. } if symbol.trim().is_empty() => {
                Err(EngineError::InvalidRequest("symbol is required".to_string()))
            }
            OrderIntent::Trade { quantity, .. } if *quantity <= Decimal::ZERO => Err(
                EngineError::InvalidRequest("trade quantity must be positive".to_string()),
            ),
            OrderIntent::Trade { quantity, .. } if *quantity > MAX_ORDER_QUANTITY => Err(
                EngineError::InvalidRequest(format!("trade quantity exceeds {}", MAX_ORDER_QUANTITY)),
            ),
            _ => Ok(()),
        }
    }

    /// Uppercase symbols so keys compare equal regardless of input casing.
    pub fn normalized(self) -> Self {
        match self {
            OrderIntent::Trade {
                symbol,
                side,
                quantity,
            } => OrderIntent::Trade {
                symbol: symbol.trim().to_uppercase(),
                side,
                quantity,
            },
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processing,
    Filled,
    PartiallyFilled,
    Rejected,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Filled => "filled",
            RequestStatus::PartiallyFilled => "partially_filled",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending | RequestStatus::Processing)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "processing" => Ok(RequestStatus::Processing),
            "filled" => Ok(RequestStatus::Filled),
            "partially_filled" => Ok(RequestStatus::PartiallyFilled),
            "rejected" => Ok(RequestStatus::Rejected),
            "failed" => Ok(RequestStatus::Failed),
            other => Err(anyhow::anyhow!("invalid request status: {}", other)),
        }
    }
}

/// What one planned leg of a request ended up with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegFill {
    pub symbol: String,
    pub side: TradeSide,
    pub requested: Decimal,
    pub filled: Decimal,
    pub price: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub status: RequestStatus,
    pub message: Option<String>,
    pub investment_id: Option<Uuid>,
    pub fills: Vec<LegFill>,
    /// Signed change to the portfolio's cash
    pub cash_delta: Decimal,
    pub realized_pnl: Decimal,
}

impl RequestOutcome {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::terminal(RequestStatus::Rejected, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::terminal(RequestStatus::Failed, message)
    }

    fn terminal(status: RequestStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
            investment_id: None,
            fills: Vec::new(),
            cash_delta: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub idempotency_key: String,
    pub portfolio_id: Uuid,
    pub intent: OrderIntent,
    pub status: RequestStatus,
    pub batch_id: Option<Uuid>,
    pub outcome: Option<RequestOutcome>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

fn decode_err(column: &str, err: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    }
}

impl<'r> FromRow<'r, SqliteRow> for OrderRequest {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let portfolio_id: String = row.try_get("portfolio_id")?;
        let payload: String = row.try_get("payload")?;
        let status: String = row.try_get("status")?;
        let batch_id: Option<String> = row.try_get("batch_id")?;
        let outcome: Option<String> = row.try_get("outcome")?;

        Ok(Self {
            idempotency_key: row.try_get("idempotency_key")?,
            portfolio_id: Uuid::parse_str(&portfolio_id).map_err(|e| decode_err("portfolio_id", e))?,
            intent: serde_json::from_str(&payload).map_err(|e| decode_err("payload", e))?,
            status: status
                .parse()
                .map_err(|e: anyhow::Error| decode_err("status", std::io::Error::other(e.to_string())))?,
            batch_id: batch_id
                .map(|id| Uuid::parse_str(&id))
                .transpose()
                .map_err(|e| decode_err("batch_id", e))?,
            outcome: outcome
                .map(|json| serde_json::from_str(&json))
                .transpose()
                .map_err(|e| decode_err("outcome", e))?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }
}

#[derive(Clone)]
pub struct RequestQueue {
    db: PortfolioDb,
}

impl RequestQueue {
    pub fn new(db: PortfolioDb) -> Self {
        Self { db }
    }

    /// Enqueue an intent. Re-submitting the same key with the same intent
    /// returns the stored request untouched; a different intent under a
    /// used key is an error.
    pub async fn submit(
        &self,
        portfolio_id: Uuid,
        idempotency_key: &str,
        intent: OrderIntent,
    ) -> Result<OrderRequest> {
        let key = idempotency_key.trim();
        if key.is_empty() {
            return Err(EngineError::InvalidRequest(
                "idempotency key is required".to_string(),
            ));
        }
        let intent = intent.normalized();
        intent.validate()?;

        let payload = serde_json::to_string(&intent)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO order_requests (idempotency_key, portfolio_id, kind, payload, status, created_at)
            VALUES (?, ?, ?, ?, 'pending', ?)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(portfolio_id.to_string())
        .bind(intent.kind())
        .bind(&payload)
        .bind(Utc::now())
        .execute(self.db.pool())
        .await?
        .rows_affected()
            == 1;

        let existing = self
            .get(key)
            .await?
            .ok_or_else(|| EngineError::InvalidRequest(format!("request {} vanished", key)))?;

        if !inserted && (existing.portfolio_id != portfolio_id || existing.intent != intent) {
            return Err(EngineError::IdempotencyConflict(key.to_string()));
        }

        if inserted {
            tracing::debug!("Queued {} request {}", intent.kind(), key);
        } else {
            tracing::debug!("Request {} already queued ({})", key, existing.status);
        }

        Ok(existing)
    }

    pub async fn get(&self, idempotency_key: &str) -> Result<Option<OrderRequest>> {
        let request = sqlx::query_as::<_, OrderRequest>(
            "SELECT * FROM order_requests WHERE idempotency_key = ?",
        )
        .bind(idempotency_key)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(request)
    }

    /// Oldest pending requests first
    pub async fn pending(&self, limit: i64) -> Result<Vec<OrderRequest>> {
        let requests = sqlx::query_as::<_, OrderRequest>(
            "SELECT * FROM order_requests WHERE status = 'pending' ORDER BY created_at, rowid LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        Ok(requests)
    }

    pub async fn by_batch(&self, batch_id: Uuid) -> Result<Vec<OrderRequest>> {
        let requests = sqlx::query_as::<_, OrderRequest>(
            "SELECT * FROM order_requests WHERE batch_id = ? ORDER BY created_at, rowid",
        )
        .bind(batch_id.to_string())
        .fetch_all(self.db.pool())
        .await?;
        Ok(requests)
    }

    /// Claim requests for a batch. Only rows still pending are claimed.
    pub async fn claim(&self, batch_id: Uuid, keys: &[String]) -> Result<u64> {
        let mut tx = self.db.begin().await?;
        let mut claimed = 0;
        for key in keys {
            claimed += sqlx::query(
                "UPDATE order_requests SET status = 'processing', batch_id = ? WHERE idempotency_key = ? AND status = 'pending'",
            )
            .bind(batch_id.to_string())
            .bind(key)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(claimed)
    }

    /// Mark every request stuck in processing as failed. A request only
    /// stays there if its batch died between the broker and the ledger.
    pub async fn fail_interrupted(&self) -> Result<u64> {
        let outcome = RequestOutcome::failed(
            "batch was interrupted before settlement; check reconciliation before resubmitting",
        );
        let result = sqlx::query(
            "UPDATE order_requests SET status = 'failed', outcome = ?, processed_at = ? WHERE status = 'processing'",
        )
        .bind(serde_json::to_string(&outcome)?)
        .bind(Utc::now())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Mark the requests of one batch failed, outside any transaction.
    pub async fn fail_batch(&self, batch_id: Uuid, message: &str) -> Result<u64> {
        let outcome = RequestOutcome::failed(message);
        let result = sqlx::query(
            "UPDATE order_requests SET status = 'failed', outcome = ?, processed_at = ? WHERE batch_id = ? AND status = 'processing'",
        )
        .bind(serde_json::to_string(&outcome)?)
        .bind(Utc::now())
        .bind(batch_id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

/// Write a final outcome onto a request inside the settlement transaction.
pub async fn complete(
    conn: &mut SqliteConnection,
    idempotency_key: &str,
    outcome: &RequestOutcome,
) -> Result<()> {
    sqlx::query(
        "UPDATE order_requests SET status = ?, outcome = ?, processed_at = ? WHERE idempotency_key = ?",
    )
    .bind(outcome.status.as_str())
    .bind(serde_json::to_string(outcome)?)
    .bind(Utc::now())
    .bind(idempotency_key)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_trait::BrokerMode;
    use portfolio_manager::AccountManager;
    use rust_decimal_macros::dec;

    async fn setup() -> (RequestQueue, Uuid) {
        let db = PortfolioDb::new("sqlite::memory:").await.unwrap();
        let accounts = AccountManager::new(db.clone());
        let user = accounts
            .create_user("ravi@example.com", "Ravi", BrokerMode::Paper)
            .await
            .unwrap();
        let portfolio = accounts.create_portfolio(user.id, "main", dec!(1000)).await.unwrap();
        (RequestQueue::new(db), portfolio.id)
    }

    #[test]
    fn test_intent_wire_format() {
        let intent = OrderIntent::Trade {
            symbol: "infy".to_string(),
            side: TradeSide::Buy,
            quantity: dec!(3),
        }
        .normalized();
        let json = serde_json::to_value(&intent).unwrap();
        assert_eq!(json["kind"], "trade");
        assert_eq!(json["symbol"], "INFY");
        assert_eq!(json["side"], "buy");

        let parsed: OrderIntent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, intent);
    }

    #[test]
    fn test_intent_validation() {
        let zero = OrderIntent::Invest {
            smallcase_id: Uuid::new_v4(),
            amount: dec!(0),
        };
        assert!(matches!(zero.validate(), Err(EngineError::InvalidRequest(_))));

        let short = OrderIntent::Trade {
            symbol: " ".to_string(),
            side: TradeSide::Sell,
            quantity: dec!(1),
        };
        assert!(short.validate().is_err());

        let huge = OrderIntent::Trade {
            symbol: "INFY".to_string(),
            side: TradeSide::Buy,
            quantity: Decimal::from_scientific("5e28").unwrap(),
        };
        assert!(matches!(huge.validate(), Err(EngineError::InvalidRequest(m)) if m.contains("exceeds")));

        let ceiling = OrderIntent::Invest {
            smallcase_id: Uuid::new_v4(),
            amount: MAX_ORDER_AMOUNT,
        };
        assert!(ceiling.validate().is_ok());
        let above = OrderIntent::Invest {
            smallcase_id: Uuid::new_v4(),
            amount: MAX_ORDER_AMOUNT + dec!(0.01),
        };
        assert!(above.validate().is_err());
    }

    #[tokio::test]
    async fn test_submit_is_idempotent() {
        let (queue, portfolio_id) = setup().await;
        let intent = OrderIntent::Invest {
            smallcase_id: Uuid::new_v4(),
            amount: dec!(500),
        };

        let first = queue.submit(portfolio_id, "k-1", intent.clone()).await.unwrap();
        let again = queue.submit(portfolio_id, "k-1", intent).await.unwrap();
        assert_eq!(first.created_at, again.created_at);
        assert_eq!(again.status, RequestStatus::Pending);
        assert_eq!(queue.pending(10).await.unwrap().len(), 1);

        let other = OrderIntent::Invest {
            smallcase_id: Uuid::new_v4(),
            amount: dec!(500),
        };
        let err = queue.submit(portfolio_id, "k-1", other).await.unwrap_err();
        assert!(matches!(err, EngineError::IdempotencyConflict(k) if k == "k-1"));
    }

    #[tokio::test]
    async fn test_claim_and_interrupt_recovery() {
        let (queue, portfolio_id) = setup().await;
        let intent = OrderIntent::Trade {
            symbol: "TCS".to_string(),
            side: TradeSide::Buy,
            quantity: dec!(1),
        };
        queue.submit(portfolio_id, "a", intent.clone()).await.unwrap();
        queue.submit(portfolio_id, "b", intent).await.unwrap();

        let batch = Uuid::new_v4();
        let claimed = queue.claim(batch, &["a".to_string()]).await.unwrap();
        assert_eq!(claimed, 1);
        assert_eq!(queue.by_batch(batch).await.unwrap().len(), 1);
        assert_eq!(queue.pending(10).await.unwrap().len(), 1);

        assert_eq!(queue.fail_interrupted().await.unwrap(), 1);
        let a = queue.get("a").await.unwrap().unwrap();
        assert_eq!(a.status, RequestStatus::Failed);
        assert!(a.outcome.unwrap().message.unwrap().contains("interrupted"));
    }
}
