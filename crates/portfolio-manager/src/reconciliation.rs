use crate::db::PortfolioDb;
use crate::models::*;
use crate::portfolio::PortfolioManager;
use anyhow::Result;
use broker_trait::{BrokerMode, BrokerPosition};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

pub struct Reconciler;

impl Reconciler {
    /// Reconcile the summed holdings of every user on `mode` against the
    /// positions the broker reports for the pooled account.
    pub async fn reconcile(
        pm: &PortfolioManager,
        mode: BrokerMode,
        broker: &[BrokerPosition],
    ) -> Result<ReconciliationResult> {
        let mut local: BTreeMap<String, Decimal> = BTreeMap::new();
        for holding in pm.holdings_for_broker_mode(mode).await? {
            *local.entry(holding.symbol).or_default() += holding.quantity;
        }

        let broker_map: BTreeMap<String, Decimal> = broker
            .iter()
            .map(|p| (p.symbol.clone(), p.qty_decimal()))
            .collect();

        let mut discrepancies = Vec::new();
        let mut matches = 0usize;

        // Check all broker positions
        for (symbol, broker_shares) in &broker_map {
            match local.get(symbol) {
                Some(local_shares) if local_shares == broker_shares => matches += 1,
                Some(local_shares) => discrepancies.push(Discrepancy {
                    symbol: symbol.clone(),
                    discrepancy_type: "shares_mismatch".to_string(),
                    local_shares: Some(*local_shares),
                    broker_shares: Some(*broker_shares),
                }),
                None => discrepancies.push(Discrepancy {
                    symbol: symbol.clone(),
                    discrepancy_type: "missing_local".to_string(),
                    local_shares: None,
                    broker_shares: Some(*broker_shares),
                }),
            }
        }

        // Check local positions missing from broker
        for (symbol, local_shares) in &local {
            if !broker_map.contains_key(symbol) {
                discrepancies.push(Discrepancy {
                    symbol: symbol.clone(),
                    discrepancy_type: "missing_broker".to_string(),
                    local_shares: Some(*local_shares),
                    broker_shares: None,
                });
            }
        }

        let total = matches + discrepancies.len();

        Ok(ReconciliationResult {
            broker_mode: mode,
            reconciliation_date: chrono::Utc::now().to_rfc3339(),
            total_positions: total,
            matches,
            discrepancies,
        })
    }

    /// Save reconciliation result to the log table.
    pub async fn save_log(db: &PortfolioDb, result: &ReconciliationResult) -> Result<i64> {
        let details = serde_json::to_string(&result.discrepancies)?;
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO reconciliation_log
            (broker_mode, reconciliation_date, total_positions, matches, discrepancies, details_json)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(result.broker_mode.as_str())
        .bind(&result.reconciliation_date)
        .bind(result.total_positions as i64)
        .bind(result.matches as i64)
        .bind(result.discrepancies.len() as i64)
        .bind(details)
        .fetch_one(db.pool())
        .await?;

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountManager;
    use crate::ledger;
    use rust_decimal_macros::dec;

    fn position(symbol: &str, qty: &str) -> BrokerPosition {
        BrokerPosition {
            symbol: symbol.to_string(),
            qty: qty.to_string(),
            avg_entry_price: "0".to_string(),
            market_value: "0".to_string(),
            cost_basis: "0".to_string(),
            unrealized_pl: "0".to_string(),
            current_price: "0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_reconcile_pooled_holdings() {
        let db = PortfolioDb::new("sqlite::memory:").await.unwrap();
        let accounts = AccountManager::new(db.clone());
        let a = accounts.create_user("a@example.com", "A", BrokerMode::Paper).await.unwrap();
        let b = accounts.create_user("b@example.com", "B", BrokerMode::Paper).await.unwrap();
        let live = accounts.create_user("c@example.com", "C", BrokerMode::Live).await.unwrap();
        let pa = accounts.create_portfolio(a.id, "main", dec!(0)).await.unwrap();
        let pb = accounts.create_portfolio(b.id, "main", dec!(0)).await.unwrap();
        let pl = accounts.create_portfolio(live.id, "main", dec!(0)).await.unwrap();

        {
            let mut conn = db.pool().acquire().await.unwrap();
            ledger::apply_buy(&mut conn, pa.id, None, "INFY", dec!(3), dec!(1)).await.unwrap();
            ledger::apply_buy(&mut conn, pb.id, None, "INFY", dec!(2), dec!(1)).await.unwrap();
            ledger::apply_buy(&mut conn, pb.id, None, "TCS", dec!(1), dec!(1)).await.unwrap();
            ledger::apply_buy(&mut conn, pl.id, None, "WIPRO", dec!(9), dec!(1)).await.unwrap();
        }

        let pm = PortfolioManager::new(db.clone());
        let broker = vec![position("INFY", "5"), position("HDFC", "1")];
        let result = Reconciler::reconcile(&pm, BrokerMode::Paper, &broker).await.unwrap();

        assert_eq!(result.matches, 1);
        assert_eq!(result.total_positions, 3);
        let kinds: Vec<(&str, &str)> = result
            .discrepancies
            .iter()
            .map(|d| (d.symbol.as_str(), d.discrepancy_type.as_str()))
            .collect();
        assert_eq!(kinds, vec![("HDFC", "missing_local"), ("TCS", "missing_broker")]);

        let id = Reconciler::save_log(&db, &result).await.unwrap();
        assert!(id > 0);
    }
}
