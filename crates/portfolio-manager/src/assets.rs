use crate::db::PortfolioDb;
use crate::models::Asset;
use anyhow::{bail, Result};
use async_trait::async_trait;
use broker_trait::QuoteSource;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Tradable instruments and their last known price.
#[derive(Clone)]
pub struct AssetCatalog {
    db: PortfolioDb,
}

impl AssetCatalog {
    pub fn new(db: PortfolioDb) -> Self {
        Self { db }
    }

    pub async fn upsert_asset(
        &self,
        symbol: &str,
        name: &str,
        exchange: &str,
        last_price: Decimal,
    ) -> Result<Asset> {
        if last_price <= Decimal::ZERO {
            bail!("Price for {} must be positive", symbol);
        }
        let asset = Asset {
            symbol: symbol.trim().to_uppercase(),
            name: name.to_string(),
            exchange: exchange.to_uppercase(),
            last_price,
            updated_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO assets (symbol, name, exchange, last_price, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(symbol) DO UPDATE SET
                name = excluded.name,
                exchange = excluded.exchange,
                last_price = excluded.last_price,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&asset.symbol)
        .bind(&asset.name)
        .bind(&asset.exchange)
        .bind(asset.last_price.to_string())
        .bind(asset.updated_at)
        .execute(self.db.pool())
        .await?;

        Ok(asset)
    }

    pub async fn update_price(&self, symbol: &str, price: Decimal) -> Result<()> {
        if price <= Decimal::ZERO {
            bail!("Price for {} must be positive", symbol);
        }
        let result = sqlx::query("UPDATE assets SET last_price = ?, updated_at = ? WHERE symbol = ?")
            .bind(price.to_string())
            .bind(Utc::now())
            .bind(symbol)
            .execute(self.db.pool())
            .await?;
        if result.rows_affected() == 0 {
            bail!("Unknown asset: {}", symbol);
        }
        Ok(())
    }

    pub async fn get_asset(&self, symbol: &str) -> Result<Option<Asset>> {
        let asset = sqlx::query_as::<_, Asset>("SELECT * FROM assets WHERE symbol = ?")
            .bind(symbol)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(asset)
    }

    pub async fn list_assets(&self) -> Result<Vec<Asset>> {
        let assets = sqlx::query_as::<_, Asset>("SELECT * FROM assets ORDER BY symbol")
            .fetch_all(self.db.pool())
            .await?;
        Ok(assets)
    }

    /// Last prices of every known asset
    pub async fn prices(&self) -> Result<HashMap<String, Decimal>> {
        Ok(self
            .list_assets()
            .await?
            .into_iter()
            .map(|a| (a.symbol, a.last_price))
            .collect())
    }
}

#[async_trait]
impl QuoteSource for AssetCatalog {
    async fn latest_price(&self, symbol: &str) -> Result<Option<Decimal>> {
        Ok(self.get_asset(symbol).await?.map(|a| a.last_price))
    }
}
