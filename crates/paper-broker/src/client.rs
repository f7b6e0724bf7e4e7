use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use broker_trait::{
    BrokerAccount, BrokerClient, BrokerOrder, BrokerOrderRequest, BrokerOrderSide, BrokerPosition,
    QuoteSource,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PaperBrokerConfig {
    /// Virtual cash the account starts with
    pub starting_cash: Decimal,
    /// Price penalty applied to every fill, in basis points
    pub slippage_bps: u32,
    /// Cap on the quantity a single order can fill; the rest is canceled
    pub max_fill_quantity: Option<Decimal>,
}

impl Default for PaperBrokerConfig {
    fn default() -> Self {
        Self {
            starting_cash: Decimal::from(10_000_000),
            slippage_bps: 0,
            max_fill_quantity: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PaperPosition {
    qty: Decimal,
    avg_price: Decimal,
}

#[derive(Debug, Default)]
struct PaperState {
    cash: Decimal,
    positions: HashMap<String, PaperPosition>,
    orders: Vec<BrokerOrder>,
}

/// Simulated broker: market orders fill immediately against the quote source.
pub struct PaperBroker {
    quotes: Arc<dyn QuoteSource>,
    config: PaperBrokerConfig,
    account_id: String,
    state: RwLock<PaperState>,
}

impl PaperBroker {
    pub fn new(quotes: Arc<dyn QuoteSource>, config: PaperBrokerConfig) -> Self {
        let state = PaperState {
            cash: config.starting_cash,
            ..Default::default()
        };
        Self {
            quotes,
            config,
            account_id: format!("PAPER-{}", Uuid::new_v4().simple()),
            state: RwLock::new(state),
        }
    }

    pub fn config(&self) -> &PaperBrokerConfig {
        &self.config
    }

    /// Rebuild positions after a restart. Cash is charged as if the
    /// positions had been bought at `avg_price`.
    pub async fn restore_positions<I>(&self, positions: I)
    where
        I: IntoIterator<Item = (String, Decimal, Decimal)>,
    {
        let mut state = self.state.write().await;
        for (symbol, qty, avg_price) in positions {
            if qty <= Decimal::ZERO {
                continue;
            }
            state.cash -= qty * avg_price;
            state.positions.insert(symbol, PaperPosition { qty, avg_price });
        }
    }

    fn fill_price(&self, quote: Decimal, side: BrokerOrderSide) -> Decimal {
        let slip = Decimal::from(self.config.slippage_bps) / Decimal::from(10_000);
        let price = match side {
            BrokerOrderSide::Buy => quote * (Decimal::ONE + slip),
            BrokerOrderSide::Sell => quote * (Decimal::ONE - slip),
        };
        price.round_dp(4)
    }

    fn position_view(symbol: &str, position: &PaperPosition, price: Decimal) -> BrokerPosition {
        let market_value = position.qty * price;
        let cost_basis = position.qty * position.avg_price;
        BrokerPosition {
            symbol: symbol.to_string(),
            qty: position.qty.to_string(),
            avg_entry_price: position.avg_price.to_string(),
            market_value: market_value.to_string(),
            cost_basis: cost_basis.to_string(),
            unrealized_pl: (market_value - cost_basis).to_string(),
            current_price: price.to_string(),
        }
    }

    async fn quote_or_avg(&self, symbol: &str, position: &PaperPosition) -> Result<Decimal> {
        Ok(self
            .quotes
            .latest_price(symbol)
            .await?
            .unwrap_or(position.avg_price))
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    async fn get_account(&self) -> Result<BrokerAccount> {
        let (cash, positions) = {
            let state = self.state.read().await;
            (state.cash, state.positions.clone())
        };

        let mut positions_value = Decimal::ZERO;
        for (symbol, position) in &positions {
            positions_value += position.qty * self.quote_or_avg(symbol, position).await?;
        }

        Ok(BrokerAccount {
            id: self.account_id.clone(),
            account_number: self.account_id.clone(),
            status: "ACTIVE".to_string(),
            currency: "INR".to_string(),
            buying_power: cash.to_string(),
            cash: cash.to_string(),
            portfolio_value: (cash + positions_value).to_string(),
            trading_blocked: false,
        })
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        let positions = self.state.read().await.positions.clone();
        let mut symbols: Vec<&String> = positions.keys().collect();
        symbols.sort();

        let mut out = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let position = &positions[symbol];
            let price = self.quote_or_avg(symbol, position).await?;
            out.push(Self::position_view(symbol, position, price));
        }
        Ok(out)
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<BrokerPosition>> {
        let position = self.state.read().await.positions.get(symbol).cloned();
        match position {
            Some(position) => {
                let price = self.quote_or_avg(symbol, &position).await?;
                Ok(Some(Self::position_view(symbol, &position, price)))
            }
            None => Ok(None),
        }
    }

    async fn submit_market_order(&self, order: BrokerOrderRequest) -> Result<BrokerOrder> {
        if order.qty <= Decimal::ZERO {
            bail!("order quantity must be positive, got {}", order.qty);
        }

        let quote = self
            .quotes
            .latest_price(&order.symbol)
            .await?
            .ok_or_else(|| anyhow!("no quote available for {}", order.symbol))?;
        let price = self.fill_price(quote, order.side);

        let fill_qty = match self.config.max_fill_quantity {
            Some(cap) if order.qty > cap => cap,
            _ => order.qty,
        };

        let mut state = self.state.write().await;
        match order.side {
            BrokerOrderSide::Buy => {
                let cost = fill_qty * price;
                if cost > state.cash {
                    bail!(
                        "insufficient paper buying power: need {}, have {}",
                        cost,
                        state.cash
                    );
                }
                state.cash -= cost;
                let position = state.positions.entry(order.symbol.clone()).or_default();
                let total_qty = position.qty + fill_qty;
                position.avg_price =
                    (position.qty * position.avg_price + fill_qty * price) / total_qty;
                position.qty = total_qty;
            }
            BrokerOrderSide::Sell => {
                let held = state
                    .positions
                    .get(&order.symbol)
                    .map(|p| p.qty)
                    .unwrap_or_default();
                if fill_qty > held {
                    bail!(
                        "paper account holds {} {}, cannot sell {}",
                        held,
                        order.symbol,
                        fill_qty
                    );
                }
                state.cash += fill_qty * price;
                let remaining = held - fill_qty;
                if remaining.is_zero() {
                    state.positions.remove(&order.symbol);
                } else if let Some(position) = state.positions.get_mut(&order.symbol) {
                    position.qty = remaining;
                }
            }
        }

        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let filled = BrokerOrder {
            client_order_id: order.client_order_id.clone().unwrap_or_else(|| id.clone()),
            id,
            created_at: now,
            filled_at: Some(now),
            symbol: order.symbol.clone(),
            qty: Some(order.qty.to_string()),
            filled_qty: Some(fill_qty.to_string()),
            filled_avg_price: Some(price.to_string()),
            order_type: "market".to_string(),
            side: order.side.as_str().to_string(),
            status: if fill_qty == order.qty {
                "filled".to_string()
            } else {
                "canceled".to_string()
            },
        };
        state.orders.push(filled.clone());

        tracing::debug!(
            "Paper {} {} {} @ {} ({})",
            filled.side,
            fill_qty,
            filled.symbol,
            price,
            filled.status
        );

        Ok(filled)
    }

    async fn get_order(&self, order_id: &str) -> Result<BrokerOrder> {
        self.state
            .read()
            .await
            .orders
            .iter()
            .find(|o| o.id == order_id)
            .cloned()
            .ok_or_else(|| anyhow!("paper order not found: {}", order_id))
    }

    async fn get_orders(&self, limit: Option<usize>) -> Result<Vec<BrokerOrder>> {
        let state = self.state.read().await;
        let limit = limit.unwrap_or(state.orders.len());
        Ok(state.orders.iter().rev().take(limit).cloned().collect())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        // Paper orders are terminal as soon as they are submitted.
        self.get_order(order_id).await.map(|_| ())
    }

    async fn close_position(&self, symbol: &str) -> Result<BrokerOrder> {
        let qty = self
            .state
            .read()
            .await
            .positions
            .get(symbol)
            .map(|p| p.qty)
            .ok_or_else(|| anyhow!("no paper position in {}", symbol))?;
        self.submit_market_order(BrokerOrderRequest::sell(symbol, qty))
            .await
    }

    fn is_paper(&self) -> bool {
        true
    }

    fn broker_name(&self) -> &str {
        "paper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quotes::StaticQuotes;
    use rust_decimal_macros::dec;

    fn broker(config: PaperBrokerConfig) -> PaperBroker {
        let quotes = StaticQuotes::from_prices([("INFY", dec!(1500)), ("TCS", dec!(3800))]);
        PaperBroker::new(Arc::new(quotes), config)
    }

    #[tokio::test]
    async fn test_buy_then_sell_updates_cash_and_position() {
        let broker = broker(PaperBrokerConfig {
            starting_cash: dec!(100000),
            ..Default::default()
        });

        let order = broker
            .submit_market_order(BrokerOrderRequest::buy("INFY", dec!(10)))
            .await
            .unwrap();
        assert_eq!(order.status, "filled");
        assert_eq!(order.filled_quantity_decimal(), Some(dec!(10)));

        let account = broker.get_account().await.unwrap();
        assert_eq!(account.cash_decimal(), dec!(85000));
        assert_eq!(account.portfolio_value_decimal(), dec!(100000));

        broker
            .submit_market_order(BrokerOrderRequest::sell("INFY", dec!(4)))
            .await
            .unwrap();
        let position = broker.get_position("INFY").await.unwrap().unwrap();
        assert_eq!(position.qty_decimal(), dec!(6));
        assert_eq!(position.avg_entry_price_decimal(), dec!(1500));
    }

    #[tokio::test]
    async fn test_slippage_moves_price_against_the_order() {
        let broker = broker(PaperBrokerConfig {
            slippage_bps: 10,
            ..Default::default()
        });

        let buy = broker
            .submit_market_order(BrokerOrderRequest::buy("TCS", dec!(1)))
            .await
            .unwrap();
        assert_eq!(buy.filled_avg_price_decimal(), Some(dec!(3803.8)));

        let sell = broker
            .submit_market_order(BrokerOrderRequest::sell("TCS", dec!(1)))
            .await
            .unwrap();
        assert_eq!(sell.filled_avg_price_decimal(), Some(dec!(3796.2)));
    }

    #[tokio::test]
    async fn test_fill_cap_cancels_remainder() {
        let broker = broker(PaperBrokerConfig {
            max_fill_quantity: Some(dec!(5)),
            ..Default::default()
        });

        let order = broker
            .submit_market_order(BrokerOrderRequest::buy("INFY", dec!(8)))
            .await
            .unwrap();
        assert_eq!(order.status, "canceled");
        assert!(order.is_terminal());
        assert_eq!(order.filled_quantity_decimal(), Some(dec!(5)));
    }

    #[tokio::test]
    async fn test_rejections() {
        let broker = broker(PaperBrokerConfig {
            starting_cash: dec!(1000),
            ..Default::default()
        });

        assert!(broker
            .submit_market_order(BrokerOrderRequest::buy("WIPRO", dec!(1)))
            .await
            .is_err());
        assert!(broker
            .submit_market_order(BrokerOrderRequest::buy("INFY", dec!(1)))
            .await
            .is_err());
        assert!(broker
            .submit_market_order(BrokerOrderRequest::sell("INFY", dec!(1)))
            .await
            .is_err());
        assert!(broker
            .submit_market_order(BrokerOrderRequest::buy("INFY", dec!(0)))
            .await
            .is_err());
        assert!(broker.get_orders(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_position_sells_everything() {
        let broker = broker(PaperBrokerConfig::default());
        broker
            .submit_market_order(BrokerOrderRequest::buy("INFY", dec!(3)))
            .await
            .unwrap();

        let order = broker.close_position("INFY").await.unwrap();
        assert_eq!(order.side, "sell");
        assert!(broker.get_positions().await.unwrap().is_empty());
        assert_eq!(broker.get_orders(Some(1)).await.unwrap()[0].id, order.id);
    }

    #[tokio::test]
    async fn test_restore_positions() {
        let broker = broker(PaperBrokerConfig::default());
        broker
            .restore_positions([("INFY".to_string(), dec!(4), dec!(1400))])
            .await;

        let position = broker.get_position("INFY").await.unwrap().unwrap();
        assert_eq!(position.qty_decimal(), dec!(4));
        assert_eq!(broker.get_account().await.unwrap().cash_decimal(), dec!(9994400));

        broker
            .submit_market_order(BrokerOrderRequest::sell("INFY", dec!(4)))
            .await
            .unwrap();
        assert!(broker.get_position("INFY").await.unwrap().is_none());
    }
}
