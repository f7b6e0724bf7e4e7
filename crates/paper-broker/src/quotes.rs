use anyhow::Result;
use async_trait::async_trait;
use broker_trait::QuoteSource;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Map-backed quotes, settable at runtime.
#[derive(Default)]
pub struct StaticQuotes {
    prices: RwLock<HashMap<String, Decimal>>,
}

impl StaticQuotes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_prices<I, S>(prices: I) -> Self
    where
        I: IntoIterator<Item = (S, Decimal)>,
        S: Into<String>,
    {
        Self {
            prices: RwLock::new(prices.into_iter().map(|(s, p)| (s.into(), p)).collect()),
        }
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }
}

#[async_trait]
impl QuoteSource for StaticQuotes {
    async fn latest_price(&self, symbol: &str) -> Result<Option<Decimal>> {
        Ok(self.prices.read().await.get(symbol).copied())
    }
}
