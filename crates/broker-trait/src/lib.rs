use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Unified broker types (broker-agnostic)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerAccount {
    pub id: String,
    pub account_number: String,
    pub status: String,
    pub currency: String,
    pub buying_power: String,
    pub cash: String,
    pub portfolio_value: String,
    pub trading_blocked: bool,
}

impl BrokerAccount {
    pub fn buying_power_decimal(&self) -> Decimal {
        Decimal::from_str(&self.buying_power).unwrap_or_default()
    }
    pub fn cash_decimal(&self) -> Decimal {
        Decimal::from_str(&self.cash).unwrap_or_default()
    }
    pub fn portfolio_value_decimal(&self) -> Decimal {
        Decimal::from_str(&self.portfolio_value).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: String,
    pub avg_entry_price: String,
    pub market_value: String,
    pub cost_basis: String,
    pub unrealized_pl: String,
    pub current_price: String,
}

impl BrokerPosition {
    pub fn avg_entry_price_decimal(&self) -> Decimal {
        Decimal::from_str(&self.avg_entry_price).unwrap_or_default()
    }
    pub fn qty_decimal(&self) -> Decimal {
        Decimal::from_str(&self.qty).unwrap_or_default()
    }
    pub fn market_value_decimal(&self) -> Decimal {
        Decimal::from_str(&self.market_value).unwrap_or_default()
    }
    pub fn cost_basis_decimal(&self) -> Decimal {
        Decimal::from_str(&self.cost_basis).unwrap_or_default()
    }
    pub fn current_price_decimal(&self) -> Decimal {
        Decimal::from_str(&self.current_price).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerOrderSide {
    Buy,
    Sell,
}

impl BrokerOrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerOrderSide::Buy => "buy",
            BrokerOrderSide::Sell => "sell",
        }
    }
}

impl fmt::Display for BrokerOrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrderRequest {
    pub symbol: String,
    pub qty: Decimal,
    pub side: BrokerOrderSide,
    /// Caller-supplied id, echoed back as `client_order_id`
    pub client_order_id: Option<String>,
}

impl BrokerOrderRequest {
    pub fn buy(symbol: impl Into<String>, qty: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            side: BrokerOrderSide::Buy,
            client_order_id: None,
        }
    }
    pub fn sell(symbol: impl Into<String>, qty: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            side: BrokerOrderSide::Sell,
            client_order_id: None,
        }
    }
    pub fn with_client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub id: String,
    pub client_order_id: String,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub symbol: String,
    pub qty: Option<String>,
    pub filled_qty: Option<String>,
    pub filled_avg_price: Option<String>,
    pub order_type: String,
    pub side: String,
    pub status: String,
}

impl BrokerOrder {
    pub fn filled_quantity_decimal(&self) -> Option<Decimal> {
        self.filled_qty
            .as_ref()
            .and_then(|s| Decimal::from_str(s).ok())
    }
    pub fn filled_avg_price_decimal(&self) -> Option<Decimal> {
        self.filled_avg_price
            .as_ref()
            .and_then(|s| Decimal::from_str(s).ok())
    }

    /// No further fills will arrive for this order
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_str(),
            "filled" | "canceled" | "expired" | "rejected" | "done_for_day"
        )
    }
}

/// Which broker account a user trades through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerMode {
    Paper,
    Live,
}

impl BrokerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerMode::Paper => "paper",
            BrokerMode::Live => "live",
        }
    }
}

impl fmt::Display for BrokerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "paper" => Ok(BrokerMode::Paper),
            "live" => Ok(BrokerMode::Live),
            other => Err(anyhow::anyhow!("unknown broker mode: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Broker trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Get account information (balance, buying power, etc.)
    async fn get_account(&self) -> Result<BrokerAccount>;

    /// Get all open positions
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>>;

    /// Get a specific position by symbol (None if no position)
    async fn get_position(&self, symbol: &str) -> Result<Option<BrokerPosition>>;

    /// Submit a market order
    async fn submit_market_order(&self, order: BrokerOrderRequest) -> Result<BrokerOrder>;

    /// Get an order by ID
    async fn get_order(&self, order_id: &str) -> Result<BrokerOrder>;

    /// Get recent orders
    async fn get_orders(&self, limit: Option<usize>) -> Result<Vec<BrokerOrder>>;

    /// Cancel an order by ID
    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    /// Close an entire position
    async fn close_position(&self, symbol: &str) -> Result<BrokerOrder>;

    /// Whether this is a paper/simulated account
    fn is_paper(&self) -> bool;

    /// Broker name for logging
    fn broker_name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Quotes
// ---------------------------------------------------------------------------

/// Last traded prices used for planning and for paper fills.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn latest_price(&self, symbol: &str) -> Result<Option<Decimal>>;

    /// Prices for several symbols; symbols without a quote are left out.
    async fn latest_prices(&self, symbols: &[String]) -> Result<HashMap<String, Decimal>> {
        let mut prices = HashMap::with_capacity(symbols.len());
        for symbol in symbols {
            if let Some(price) = self.latest_price(symbol).await? {
                prices.insert(symbol.clone(), price);
            }
        }
        Ok(prices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_terminal_statuses() {
        let mut order = BrokerOrder {
            id: "1".to_string(),
            client_order_id: "c1".to_string(),
            created_at: Utc::now(),
            filled_at: None,
            symbol: "INFY".to_string(),
            qty: Some("10".to_string()),
            filled_qty: Some("4".to_string()),
            filled_avg_price: Some("1500.25".to_string()),
            order_type: "market".to_string(),
            side: "buy".to_string(),
            status: "partially_filled".to_string(),
        };
        assert!(!order.is_terminal());
        assert_eq!(order.filled_quantity_decimal(), Some(dec!(4)));
        assert_eq!(order.filled_avg_price_decimal(), Some(dec!(1500.25)));

        order.status = "canceled".to_string();
        assert!(order.is_terminal());
    }

    #[test]
    fn test_broker_mode_parse() {
        assert_eq!("paper".parse::<BrokerMode>().unwrap(), BrokerMode::Paper);
        assert_eq!("live".parse::<BrokerMode>().unwrap(), BrokerMode::Live);
        assert!("demo".parse::<BrokerMode>().is_err());
    }
}
