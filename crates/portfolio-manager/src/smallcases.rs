use crate::db::PortfolioDb;
use crate::models::*;
use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::SqliteConnection;
use std::collections::HashSet;
use uuid::Uuid;

/// Basket products and their versioned constituent weights.
#[derive(Clone)]
pub struct SmallcaseCatalog {
    db: PortfolioDb,
}

/// Weights are percentages; a basket must add up to exactly this.
pub const TOTAL_WEIGHT: Decimal = Decimal::ONE_HUNDRED;

/// Check a constituent list before it is stored.
pub fn validate_constituents(constituents: &[Constituent]) -> Result<()> {
    if constituents.is_empty() {
        bail!("A smallcase needs at least one constituent");
    }

    let mut seen = HashSet::new();
    for c in constituents {
        if c.weight <= Decimal::ZERO {
            bail!("Weight for {} must be positive", c.symbol);
        }
        if !seen.insert(c.symbol.as_str()) {
            bail!("Duplicate constituent: {}", c.symbol);
        }
    }

    let total: Decimal = constituents.iter().map(|c| c.weight).sum();
    if total != TOTAL_WEIGHT {
        bail!("Constituent weights must sum to {}, got {}", TOTAL_WEIGHT, total);
    }
    Ok(())
}

impl SmallcaseCatalog {
    pub fn new(db: PortfolioDb) -> Self {
        Self { db }
    }

    pub async fn create(&self, new: NewSmallcase) -> Result<Smallcase> {
        let constituents = normalize(new.constituents);
        validate_constituents(&constituents)?;

        let now = Utc::now();
        let id = Uuid::new_v4();
        let mut tx = self.db.begin().await?;

        ensure_assets_exist(&mut tx, &constituents).await?;

        sqlx::query(
            r#"
            INSERT INTO smallcases (id, name, description, version, is_active, created_at, updated_at)
            VALUES (?, ?, ?, 1, 1, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(new.name.trim())
        .bind(&new.description)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        insert_constituents(&mut tx, id, 1, &constituents).await?;
        tx.commit().await?;

        self.get(id)
            .await?
            .ok_or_else(|| anyhow!("Smallcase {} vanished after insert", id))
    }

    /// A smallcase with its current constituents
    pub async fn get(&self, smallcase_id: Uuid) -> Result<Option<Smallcase>> {
        let smallcase = sqlx::query_as::<_, Smallcase>("SELECT * FROM smallcases WHERE id = ?")
            .bind(smallcase_id.to_string())
            .fetch_optional(self.db.pool())
            .await?;

        match smallcase {
            Some(mut smallcase) => {
                smallcase.constituents = self.constituents_at(smallcase.id, smallcase.version).await?;
                Ok(Some(smallcase))
            }
            None => Ok(None),
        }
    }

    pub async fn constituents_at(&self, smallcase_id: Uuid, version: i64) -> Result<Vec<Constituent>> {
        let constituents = sqlx::query_as::<_, Constituent>(
            "SELECT symbol, weight FROM smallcase_constituents WHERE smallcase_id = ? AND version = ? ORDER BY symbol",
        )
        .bind(smallcase_id.to_string())
        .bind(version)
        .fetch_all(self.db.pool())
        .await?;
        Ok(constituents)
    }

    pub async fn list_active(&self) -> Result<Vec<Smallcase>> {
        let rows = sqlx::query_as::<_, Smallcase>(
            "SELECT * FROM smallcases WHERE is_active = 1 ORDER BY name",
        )
        .fetch_all(self.db.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for mut smallcase in rows {
            smallcase.constituents = self.constituents_at(smallcase.id, smallcase.version).await?;
            out.push(smallcase);
        }
        Ok(out)
    }

    /// Replace the constituents with a new version. Earlier versions stay
    /// readable so investments made against them can still be explained.
    pub async fn update_constituents(
        &self,
        smallcase_id: Uuid,
        constituents: Vec<Constituent>,
    ) -> Result<Smallcase> {
        let constituents = normalize(constituents);
        validate_constituents(&constituents)?;

        let mut tx = self.db.begin().await?;
        ensure_assets_exist(&mut tx, &constituents).await?;

        let current: Option<(i64,)> = sqlx::query_as("SELECT version FROM smallcases WHERE id = ?")
            .bind(smallcase_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let (version,) = current.ok_or_else(|| anyhow!("Smallcase not found: {}", smallcase_id))?;
        let next = version + 1;

        sqlx::query("UPDATE smallcases SET version = ?, updated_at = ? WHERE id = ?")
            .bind(next)
            .bind(Utc::now())
            .bind(smallcase_id.to_string())
            .execute(&mut *tx)
            .await?;
        insert_constituents(&mut tx, smallcase_id, next, &constituents).await?;
        tx.commit().await?;

        self.get(smallcase_id)
            .await?
            .ok_or_else(|| anyhow!("Smallcase not found: {}", smallcase_id))
    }

    /// Stop new investments. Existing investments can still exit or rebalance.
    pub async fn deactivate(&self, smallcase_id: Uuid) -> Result<()> {
        let result = sqlx::query("UPDATE smallcases SET is_active = 0, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(smallcase_id.to_string())
            .execute(self.db.pool())
            .await?;
        if result.rows_affected() == 0 {
            bail!("Smallcase not found: {}", smallcase_id);
        }
        Ok(())
    }
}

fn normalize(constituents: Vec<Constituent>) -> Vec<Constituent> {
    constituents
        .into_iter()
        .map(|c| Constituent {
            symbol: c.symbol.trim().to_uppercase(),
            weight: c.weight,
        })
        .collect()
}

async fn ensure_assets_exist(conn: &mut SqliteConnection, constituents: &[Constituent]) -> Result<()> {
    for c in constituents {
        let found: Option<(String,)> = sqlx::query_as("SELECT symbol FROM assets WHERE symbol = ?")
            .bind(&c.symbol)
            .fetch_optional(&mut *conn)
            .await?;
        if found.is_none() {
            bail!("Unknown asset in smallcase: {}", c.symbol);
        }
    }
    Ok(())
}

async fn insert_constituents(
    conn: &mut SqliteConnection,
    smallcase_id: Uuid,
    version: i64,
    constituents: &[Constituent],
) -> Result<()> {
    for c in constituents {
        sqlx::query(
            "INSERT INTO smallcase_constituents (smallcase_id, version, symbol, weight) VALUES (?, ?, ?, ?)",
        )
        .bind(smallcase_id.to_string())
        .bind(version)
        .bind(&c.symbol)
        .bind(c.weight.to_string())
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::AssetCatalog;
    use rust_decimal_macros::dec;

    fn c(symbol: &str, weight: Decimal) -> Constituent {
        Constituent {
            symbol: symbol.to_string(),
            weight,
        }
    }

    async fn setup() -> SmallcaseCatalog {
        let db = PortfolioDb::new("sqlite::memory:").await.unwrap();
        let assets = AssetCatalog::new(db.clone());
        for (symbol, price) in [("INFY", dec!(1500)), ("TCS", dec!(3800)), ("WIPRO", dec!(450))] {
            assets.upsert_asset(symbol, symbol, "NSE", price).await.unwrap();
        }
        SmallcaseCatalog::new(db)
    }

    #[test]
    fn test_validate_constituents() {
        assert!(validate_constituents(&[c("INFY", dec!(60)), c("TCS", dec!(40))]).is_ok());
        assert!(validate_constituents(&[]).is_err());
        assert!(validate_constituents(&[c("INFY", dec!(60)), c("TCS", dec!(30))]).is_err());
        assert!(validate_constituents(&[c("INFY", dec!(100)), c("TCS", dec!(0))]).is_err());
        assert!(validate_constituents(&[c("INFY", dec!(50)), c("INFY", dec!(50))]).is_err());
    }

    #[tokio::test]
    async fn test_create_and_version_constituents() {
        let catalog = setup().await;
        let smallcase = catalog
            .create(NewSmallcase {
                name: "IT Leaders".to_string(),
                description: Some("Large-cap IT".to_string()),
                constituents: vec![c("infy", dec!(50)), c("TCS", dec!(50))],
            })
            .await
            .unwrap();
        assert_eq!(smallcase.version, 1);
        assert_eq!(smallcase.constituents.len(), 2);
        assert_eq!(smallcase.constituents[0].symbol, "INFY");

        let updated = catalog
            .update_constituents(
                smallcase.id,
                vec![c("INFY", dec!(40)), c("TCS", dec!(40)), c("WIPRO", dec!(20))],
            )
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.constituents.len(), 3);

        let original = catalog.constituents_at(smallcase.id, 1).await.unwrap();
        assert_eq!(original, smallcase.constituents);
    }

    #[tokio::test]
    async fn test_unknown_asset_and_deactivate() {
        let catalog = setup().await;
        let err = catalog
            .create(NewSmallcase {
                name: "Bad".to_string(),
                description: None,
                constituents: vec![c("HDFC", dec!(100))],
            })
            .await;
        assert!(err.is_err());

        let smallcase = catalog
            .create(NewSmallcase {
                name: "Solo".to_string(),
                description: None,
                constituents: vec![c("WIPRO", dec!(100))],
            })
            .await
            .unwrap();
        assert_eq!(catalog.list_active().await.unwrap().len(), 1);
        catalog.deactivate(smallcase.id).await.unwrap();
        assert!(catalog.list_active().await.unwrap().is_empty());
        assert!(!catalog.get(smallcase.id).await.unwrap().unwrap().is_active);
    }
}
