use crate::aggregator::SymbolBook;
use crate::error::Result;
use broker_trait::{BrokerClient, BrokerMode, BrokerOrder, BrokerOrderRequest};
use chrono::Utc;
use portfolio_manager::TradeSide;
use rust_decimal::Decimal;
use sqlx::SqliteConnection;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Which broker account handles each mode. Live is optional; paper is
/// normally always present.
#[derive(Clone, Default)]
pub struct BrokerRouter {
    paper: Option<Arc<dyn BrokerClient>>,
    live: Option<Arc<dyn BrokerClient>>,
}

impl BrokerRouter {
    pub fn new(paper: Arc<dyn BrokerClient>) -> Self {
        Self {
            paper: Some(paper),
            live: None,
        }
    }

    pub fn with_live(mut self, live: Arc<dyn BrokerClient>) -> Self {
        self.live = Some(live);
        self
    }

    pub fn get(&self, mode: BrokerMode) -> Option<&Arc<dyn BrokerClient>> {
        match mode {
            BrokerMode::Paper => self.paper.as_ref(),
            BrokerMode::Live => self.live.as_ref(),
        }
    }

    pub fn has(&self, mode: BrokerMode) -> bool {
        self.get(mode).is_some()
    }
}

/// Result of executing one book.
#[derive(Debug, Clone)]
pub struct SymbolExecution {
    pub mode: BrokerMode,
    pub symbol: String,
    pub side: Option<TradeSide>,
    pub requested: Decimal,
    pub broker_filled: Decimal,
    /// Settlement price for every leg of the book, crossed quantity included
    pub price: Decimal,
    pub broker: Option<String>,
    pub order: Option<BrokerOrder>,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct OrderExecutor {
    router: BrokerRouter,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl OrderExecutor {
    pub fn new(router: BrokerRouter, poll_attempts: u32, poll_interval: Duration) -> Self {
        Self {
            router,
            poll_attempts,
            poll_interval,
        }
    }

    pub fn router(&self) -> &BrokerRouter {
        &self.router
    }

    /// Send one market order per book with a residual. Books run one after
    /// another; a failing symbol does not stop the rest.
    pub async fn execute(&self, tag: &str, books: &[SymbolBook]) -> Vec<SymbolExecution> {
        let mut executions = Vec::with_capacity(books.len());
        for book in books {
            executions.push(self.execute_book(tag, book).await);
        }
        executions
    }

    async fn execute_book(&self, tag: &str, book: &SymbolBook) -> SymbolExecution {
        let mut execution = SymbolExecution {
            mode: book.mode,
            symbol: book.symbol.clone(),
            side: None,
            requested: Decimal::ZERO,
            broker_filled: Decimal::ZERO,
            price: book.quote,
            broker: None,
            order: None,
            error: None,
        };

        let Some((side, quantity)) = book.net() else {
            tracing::debug!(
                "{} {} fully crossed internally ({})",
                book.mode,
                book.symbol,
                book.crossed()
            );
            return execution;
        };
        execution.side = Some(side);
        execution.requested = quantity;

        let Some(broker) = self.router.get(book.mode) else {
            execution.error = Some(format!("no broker configured for {} trading", book.mode));
            return execution;
        };
        execution.broker = Some(broker.broker_name().to_string());

        let request = match side {
            TradeSide::Buy => BrokerOrderRequest::buy(&book.symbol, quantity),
            TradeSide::Sell => BrokerOrderRequest::sell(&book.symbol, quantity),
        }
        .with_client_order_id(format!("{}-{}", tag, book.symbol));

        tracing::info!(
            "Submitting {} {} {} to {} (crossed {})",
            side,
            quantity,
            book.symbol,
            broker.broker_name(),
            book.crossed()
        );

        let order = match broker.submit_market_order(request).await {
            Ok(order) => order,
            Err(e) => {
                tracing::error!("Order for {} {} failed: {}", book.mode, book.symbol, e);
                execution.error = Some(e.to_string());
                return execution;
            }
        };

        let order = self.await_terminal(broker.as_ref(), order).await;
        let filled = order
            .filled_quantity_decimal()
            .unwrap_or_default()
            .clamp(Decimal::ZERO, quantity);

        execution.broker_filled = filled;
        if filled > Decimal::ZERO {
            if let Some(avg) = order.filled_avg_price_decimal() {
                execution.price = avg;
            }
        }
        if filled < quantity {
            tracing::warn!(
                "{} {} filled {} of {} (status {})",
                book.mode,
                book.symbol,
                filled,
                quantity,
                order.status
            );
        }
        execution.order = Some(order);
        execution
    }

    /// Poll until the order reaches a terminal state, then cancel whatever
    /// is left so the fill quantity can no longer move.
    async fn await_terminal(&self, broker: &dyn BrokerClient, mut order: BrokerOrder) -> BrokerOrder {
        let mut attempts = 0;
        while !order.is_terminal() && attempts < self.poll_attempts {
            tokio::time::sleep(self.poll_interval).await;
            attempts += 1;
            match broker.get_order(&order.id).await {
                Ok(latest) => order = latest,
                Err(e) => tracing::warn!("Polling order {} failed: {}", order.id, e),
            }
        }

        if !order.is_terminal() {
            if let Err(e) = broker.cancel_order(&order.id).await {
                tracing::warn!("Cancel of order {} failed: {}", order.id, e);
            }
            if let Ok(latest) = broker.get_order(&order.id).await {
                order = latest;
            }
        }
        order
    }
}

/// Persist the broker side of a batch. Fully crossed books are skipped
/// since nothing was sent.
pub async fn record_broker_orders(
    conn: &mut SqliteConnection,
    batch_id: Option<Uuid>,
    executions: &[SymbolExecution],
) -> Result<usize> {
    let mut recorded = 0;
    for execution in executions {
        let Some(side) = execution.side else {
            continue;
        };
        let order = execution.order.as_ref();
        let status = match (order, &execution.error) {
            (Some(order), _) => order.status.clone(),
            (None, Some(_)) => "error".to_string(),
            (None, None) => "unknown".to_string(),
        };

        sqlx::query(
            r#"
            INSERT INTO broker_orders
            (id, batch_id, broker, paper, broker_order_id, symbol, side, requested_qty, filled_qty, avg_fill_price, status, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(batch_id.map(|id| id.to_string()))
        .bind(execution.broker.as_deref().unwrap_or("none"))
        .bind(execution.mode == BrokerMode::Paper)
        .bind(order.map(|o| o.id.clone()))
        .bind(&execution.symbol)
        .bind(side.as_str())
        .bind(execution.requested.to_string())
        .bind(execution.broker_filled.to_string())
        .bind(order.and_then(|o| o.filled_avg_price.clone()))
        .bind(status)
        .bind(execution.error.as_deref())
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
        recorded += 1;
    }
    Ok(recorded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{aggregate, LegRef};
    use crate::planner::PlannedLeg;
    use paper_broker::{PaperBroker, PaperBrokerConfig, StaticQuotes};
    use rust_decimal_macros::dec;

    fn executor(max_fill: Option<Decimal>) -> OrderExecutor {
        let quotes = Arc::new(StaticQuotes::from_prices([("INFY", dec!(1500))]));
        let broker = PaperBroker::new(
            quotes,
            PaperBrokerConfig {
                max_fill_quantity: max_fill,
                ..Default::default()
            },
        );
        OrderExecutor::new(BrokerRouter::new(Arc::new(broker)), 1, Duration::from_millis(1))
    }

    fn book(buy: Decimal, sell: Decimal) -> Vec<SymbolBook> {
        let legs = [
            PlannedLeg {
                symbol: "INFY".to_string(),
                side: TradeSide::Buy,
                quantity: buy,
                quote: dec!(1490),
            },
            PlannedLeg {
                symbol: "INFY".to_string(),
                side: TradeSide::Sell,
                quantity: sell,
                quote: dec!(1490),
            },
        ];
        aggregate(
            legs.iter()
                .enumerate()
                .map(|(i, l)| (LegRef { request: i, leg: 0 }, BrokerMode::Paper, l)),
        )
    }

    #[tokio::test]
    async fn test_net_order_fills_at_broker_price() {
        let executions = executor(None).execute("b1", &book(dec!(10), dec!(4))).await;
        assert_eq!(executions.len(), 1);
        let e = &executions[0];
        assert_eq!(e.side, Some(TradeSide::Buy));
        assert_eq!(e.requested, dec!(6));
        assert_eq!(e.broker_filled, dec!(6));
        assert_eq!(e.price, dec!(1500));
        assert_eq!(e.order.as_ref().unwrap().client_order_id, "b1-INFY");
    }

    #[tokio::test]
    async fn test_crossed_book_uses_quote() {
        let executions = executor(None).execute("b2", &book(dec!(5), dec!(5))).await;
        let e = &executions[0];
        assert!(e.side.is_none());
        assert!(e.order.is_none());
        assert_eq!(e.price, dec!(1490));
    }

    #[tokio::test]
    async fn test_missing_broker_and_partial_fill() {
        let router = BrokerRouter::default();
        let executor_without = OrderExecutor::new(router, 1, Duration::from_millis(1));
        let executions = executor_without.execute("b3", &book(dec!(3), dec!(0))).await;
        assert_eq!(executions[0].broker_filled, dec!(0));
        assert!(executions[0].error.as_ref().unwrap().contains("no broker"));

        let executions = executor(Some(dec!(2))).execute("b4", &book(dec!(3), dec!(0))).await;
        assert_eq!(executions[0].broker_filled, dec!(2));
        assert_eq!(executions[0].order.as_ref().unwrap().status, "canceled");
    }
}
