use crate::db::{decimal_col, opt_decimal_col, opt_uuid_col, parsed_col, uuid_col};
use anyhow::anyhow;
use broker_trait::BrokerMode;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enumerations stored as TEXT
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            TradeSide::Buy => TradeSide::Sell,
            TradeSide::Sell => TradeSide::Buy,
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(TradeSide::Buy),
            "sell" => Ok(TradeSide::Sell),
            other => Err(anyhow!("invalid trade side: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvestmentStatus {
    Active,
    Closed,
}

impl InvestmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestmentStatus::Active => "active",
            InvestmentStatus::Closed => "closed",
        }
    }
}

impl FromStr for InvestmentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(InvestmentStatus::Active),
            "closed" => Ok(InvestmentStatus::Closed),
            other => Err(anyhow!("invalid investment status: {}", other)),
        }
    }
}

/// What produced a trading transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionSource {
    Direct,
    SmallcaseInvest,
    SmallcaseExit,
    Rebalance,
    Drip,
}

impl TransactionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionSource::Direct => "direct",
            TransactionSource::SmallcaseInvest => "smallcase_invest",
            TransactionSource::SmallcaseExit => "smallcase_exit",
            TransactionSource::Rebalance => "rebalance",
            TransactionSource::Drip => "drip",
        }
    }
}

impl FromStr for TransactionSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(TransactionSource::Direct),
            "smallcase_invest" => Ok(TransactionSource::SmallcaseInvest),
            "smallcase_exit" => Ok(TransactionSource::SmallcaseExit),
            "rebalance" => Ok(TransactionSource::Rebalance),
            "drip" => Ok(TransactionSource::Drip),
            other => Err(anyhow!("invalid transaction source: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CashKind {
    Deposit,
    Withdrawal,
    TradeBuy,
    TradeSell,
    Dividend,
}

impl CashKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CashKind::Deposit => "deposit",
            CashKind::Withdrawal => "withdrawal",
            CashKind::TradeBuy => "trade_buy",
            CashKind::TradeSell => "trade_sell",
            CashKind::Dividend => "dividend",
        }
    }
}

impl FromStr for CashKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(CashKind::Deposit),
            "withdrawal" => Ok(CashKind::Withdrawal),
            "trade_buy" => Ok(CashKind::TradeBuy),
            "trade_sell" => Ok(CashKind::TradeSell),
            "dividend" => Ok(CashKind::Dividend),
            other => Err(anyhow!("invalid cash transaction kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DividendStatus {
    Announced,
    Paid,
}

impl DividendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DividendStatus::Announced => "announced",
            DividendStatus::Paid => "paid",
        }
    }
}

impl FromStr for DividendStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "announced" => Ok(DividendStatus::Announced),
            "paid" => Ok(DividendStatus::Paid),
            other => Err(anyhow!("invalid dividend status: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub broker_mode: BrokerMode,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for User {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: uuid_col(row, "id")?,
            email: row.try_get("email")?,
            display_name: row.try_get("display_name")?,
            broker_mode: parsed_col(row, "broker_mode")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub cash_balance: Decimal,
    pub realized_pnl: Decimal,
    pub drip_enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for Portfolio {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: uuid_col(row, "id")?,
            user_id: uuid_col(row, "user_id")?,
            name: row.try_get("name")?,
            cash_balance: decimal_col(row, "cash_balance")?,
            realized_pnl: decimal_col(row, "realized_pnl")?,
            drip_enabled: row.try_get("drip_enabled")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashTransaction {
    pub id: Uuid,
    pub portfolio_id: Uuid,
    pub kind: CashKind,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for CashTransaction {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: uuid_col(row, "id")?,
            portfolio_id: uuid_col(row, "portfolio_id")?,
            kind: parsed_col(row, "kind")?,
            amount: decimal_col(row, "amount")?,
            balance_after: decimal_col(row, "balance_after")?,
            reference: row.try_get("reference")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Assets and smallcases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub symbol: String,
    pub name: String,
    pub exchange: String,
    pub last_price: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for Asset {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            symbol: row.try_get("symbol")?,
            name: row.try_get("name")?,
            exchange: row.try_get("exchange")?,
            last_price: decimal_col(row, "last_price")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constituent {
    pub symbol: String,
    /// Percent of the basket, all weights of a version sum to 100
    pub weight: Decimal,
}

impl<'r> FromRow<'r, SqliteRow> for Constituent {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            symbol: row.try_get("symbol")?,
            weight: decimal_col(row, "weight")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Smallcase {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub version: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub constituents: Vec<Constituent>,
}

impl<'r> FromRow<'r, SqliteRow> for Smallcase {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: uuid_col(row, "id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            version: row.try_get("version")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            constituents: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSmallcase {
    pub name: String,
    pub description: Option<String>,
    pub constituents: Vec<Constituent>,
}

// ---------------------------------------------------------------------------
// Investments, holdings, transactions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmallcaseInvestment {
    pub id: Uuid,
    pub portfolio_id: Uuid,
    pub smallcase_id: Uuid,
    pub smallcase_version: i64,
    pub status: InvestmentStatus,
    /// Net capital put in: buy cost minus rebalance sale proceeds
    pub invested_amount: Decimal,
    pub realized_pnl: Decimal,
    /// Sale proceeds of exits
    pub exit_value: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, SqliteRow> for SmallcaseInvestment {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: uuid_col(row, "id")?,
            portfolio_id: uuid_col(row, "portfolio_id")?,
            smallcase_id: uuid_col(row, "smallcase_id")?,
            smallcase_version: row.try_get("smallcase_version")?,
            status: parsed_col(row, "status")?,
            invested_amount: decimal_col(row, "invested_amount")?,
            realized_pnl: decimal_col(row, "realized_pnl")?,
            exit_value: decimal_col(row, "exit_value")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            closed_at: row.try_get("closed_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub id: Uuid,
    pub portfolio_id: Uuid,
    /// None for shares bought directly rather than through a smallcase
    pub investment_id: Option<Uuid>,
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_cost: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Holding {
    pub fn cost_basis(&self) -> Decimal {
        self.quantity * self.avg_cost
    }
}

impl<'r> FromRow<'r, SqliteRow> for Holding {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: uuid_col(row, "id")?,
            portfolio_id: uuid_col(row, "portfolio_id")?,
            investment_id: opt_uuid_col(row, "investment_id")?,
            symbol: row.try_get("symbol")?,
            quantity: decimal_col(row, "quantity")?,
            avg_cost: decimal_col(row, "avg_cost")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldingWithPnL {
    #[serde(flatten)]
    pub holding: Holding,
    pub current_price: Decimal,
    pub market_value: Decimal,
    pub cost_basis: Decimal,
    pub unrealized_pnl: Decimal,
    pub unrealized_pnl_percent: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingTransaction {
    pub id: Uuid,
    pub portfolio_id: Uuid,
    pub investment_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub request_key: Option<String>,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub amount: Decimal,
    pub realized_pnl: Option<Decimal>,
    pub source: TransactionSource,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for TradingTransaction {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: uuid_col(row, "id")?,
            portfolio_id: uuid_col(row, "portfolio_id")?,
            investment_id: opt_uuid_col(row, "investment_id")?,
            batch_id: opt_uuid_col(row, "batch_id")?,
            request_key: row.try_get("request_key")?,
            symbol: row.try_get("symbol")?,
            side: parsed_col(row, "side")?,
            quantity: decimal_col(row, "quantity")?,
            price: decimal_col(row, "price")?,
            amount: decimal_col(row, "amount")?,
            realized_pnl: opt_decimal_col(row, "realized_pnl")?,
            source: parsed_col(row, "source")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// A fill to be written to the transaction log.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub portfolio_id: Uuid,
    pub investment_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub request_key: Option<String>,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub realized_pnl: Option<Decimal>,
    pub source: TransactionSource,
}

// ---------------------------------------------------------------------------
// Dividends
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dividend {
    pub id: Uuid,
    pub symbol: String,
    pub amount_per_share: Decimal,
    pub ex_date: NaiveDate,
    pub pay_date: NaiveDate,
    pub status: DividendStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, SqliteRow> for Dividend {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: uuid_col(row, "id")?,
            symbol: row.try_get("symbol")?,
            amount_per_share: decimal_col(row, "amount_per_share")?,
            ex_date: row.try_get("ex_date")?,
            pay_date: row.try_get("pay_date")?,
            status: parsed_col(row, "status")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }
}

/// Shares of a dividend symbol held before the ex-date by one portfolio bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DividendEntitlement {
    pub portfolio_id: Uuid,
    pub investment_id: Option<Uuid>,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DividendPayment {
    pub dividend_id: Uuid,
    pub portfolio_id: Uuid,
    pub investment_id: Option<Uuid>,
    pub symbol: String,
    pub quantity: Decimal,
    pub gross_amount: Decimal,
    pub reinvested_quantity: Decimal,
    pub reinvest_price: Option<Decimal>,
    pub cash_amount: Decimal,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for DividendPayment {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            dividend_id: uuid_col(row, "dividend_id")?,
            portfolio_id: uuid_col(row, "portfolio_id")?,
            investment_id: opt_uuid_col(row, "investment_id")?,
            symbol: row.try_get("symbol")?,
            quantity: decimal_col(row, "quantity")?,
            gross_amount: decimal_col(row, "gross_amount")?,
            reinvested_quantity: decimal_col(row, "reinvested_quantity")?,
            reinvest_price: opt_decimal_col(row, "reinvest_price")?,
            cash_amount: decimal_col(row, "cash_amount")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub portfolio_id: Uuid,
    pub cash_balance: Decimal,
    pub total_positions: usize,
    pub holdings_value: Decimal,
    pub total_value: Decimal,
    pub total_cost: Decimal,
    pub unrealized_pnl: Decimal,
    pub unrealized_pnl_percent: Decimal,
    pub realized_pnl: Decimal,
    pub positions: Vec<HoldingWithPnL>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestmentSummary {
    pub investment: SmallcaseInvestment,
    pub smallcase_name: String,
    /// A newer constituent version exists and a rebalance is due
    pub rebalance_available: bool,
    pub current_value: Decimal,
    pub cost_basis: Decimal,
    pub unrealized_pnl: Decimal,
    /// (current value + exit proceeds - invested) / invested
    pub total_return_percent: Decimal,
    pub holdings: Vec<HoldingWithPnL>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub id: i64,
    pub portfolio_id: Uuid,
    pub total_value: Decimal,
    pub total_cost: Decimal,
    pub total_pnl: Decimal,
    pub snapshot_date: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for PortfolioSnapshot {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            portfolio_id: uuid_col(row, "portfolio_id")?,
            total_value: decimal_col(row, "total_value")?,
            total_cost: decimal_col(row, "total_cost")?,
            total_pnl: decimal_col(row, "total_pnl")?,
            snapshot_date: row.try_get("snapshot_date")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_trades: usize,
    pub closed_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_realized_pnl: Decimal,
    pub average_win: Decimal,
    pub average_loss: Decimal,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
    pub recent_trades: Vec<TradingTransaction>,
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discrepancy {
    pub symbol: String,
    pub discrepancy_type: String,
    pub local_shares: Option<Decimal>,
    pub broker_shares: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub broker_mode: BrokerMode,
    pub reconciliation_date: String,
    pub total_positions: usize,
    pub matches: usize,
    pub discrepancies: Vec<Discrepancy>,
}
