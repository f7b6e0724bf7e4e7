//! Demo catalog and investors for local runs.

use anyhow::Result;
use broker_trait::BrokerMode;
use portfolio_manager::{AssetCatalog, Constituent, NewSmallcase};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use smallcase_engine::AggregationEngine;

const ASSETS: &[(&str, &str, Decimal)] = &[
    ("INFY", "Infosys", dec!(1500)),
    ("TCS", "Tata Consultancy Services", dec!(3800)),
    ("WIPRO", "Wipro", dec!(450)),
    ("HCLTECH", "HCL Technologies", dec!(1350)),
    ("HDFCBANK", "HDFC Bank", dec!(1600)),
    ("ICICIBANK", "ICICI Bank", dec!(1050)),
    ("KOTAKBANK", "Kotak Mahindra Bank", dec!(1750)),
    ("ITC", "ITC", dec!(430)),
];

const SMALLCASES: &[(&str, &str, &[(&str, Decimal)])] = &[
    (
        "IT Leaders",
        "Large-cap Indian IT services",
        &[
            ("INFY", dec!(30)),
            ("TCS", dec!(30)),
            ("HCLTECH", dec!(25)),
            ("WIPRO", dec!(15)),
        ],
    ),
    (
        "Banking Basket",
        "Private sector banks",
        &[
            ("HDFCBANK", dec!(40)),
            ("ICICIBANK", dec!(35)),
            ("KOTAKBANK", dec!(25)),
        ],
    ),
];

const INVESTORS: &[(&str, &str, Decimal, bool)] = &[
    ("meera@example.com", "Meera", dec!(500000), true),
    ("arjun@example.com", "Arjun", dec!(250000), false),
];

fn demo_key(email: &str, smallcase: &str) -> String {
    format!("demo:{}:{}", email, smallcase.to_lowercase().replace(' ', "-"))
}

/// Create the demo catalog and investors if missing, then queue one
/// investment per investor and smallcase. Safe to run repeatedly.
pub async fn seed_demo(engine: &AggregationEngine) -> Result<usize> {
    let assets = AssetCatalog::new(engine.db().clone());
    for (symbol, name, price) in ASSETS {
        assets.upsert_asset(symbol, name, "NSE", *price).await?;
    }

    let existing = engine.smallcases().list_active().await?;
    let mut smallcase_ids = Vec::new();
    for (name, description, weights) in SMALLCASES {
        let id = match existing.iter().find(|s| s.name == *name) {
            Some(smallcase) => smallcase.id,
            None => {
                engine
                    .smallcases()
                    .create(NewSmallcase {
                        name: name.to_string(),
                        description: Some(description.to_string()),
                        constituents: weights
                            .iter()
                            .map(|(symbol, weight)| Constituent {
                                symbol: symbol.to_string(),
                                weight: *weight,
                            })
                            .collect(),
                    })
                    .await?
                    .id
            }
        };
        smallcase_ids.push((*name, id));
    }

    let mut queued = 0;
    for (email, name, cash, drip) in INVESTORS {
        let user = match engine.accounts().get_user_by_email(email).await? {
            Some(user) => user,
            None => engine.accounts().create_user(email, name, BrokerMode::Paper).await?,
        };
        let portfolio = match engine.accounts().list_portfolios(user.id).await?.into_iter().next() {
            Some(portfolio) => portfolio,
            None => engine.accounts().create_portfolio(user.id, "Main", *cash).await?,
        };
        engine.accounts().set_drip_enabled(portfolio.id, *drip).await?;

        for (smallcase_name, smallcase_id) in &smallcase_ids {
            let request = engine
                .submit_investment(
                    portfolio.id,
                    &demo_key(email, smallcase_name),
                    *smallcase_id,
                    *cash / Decimal::from(4),
                )
                .await?;
            if !request.status.is_terminal() {
                queued += 1;
            }
        }
    }

    tracing::info!(
        "Demo data ready: {} assets, {} smallcases, {} pending investments",
        ASSETS.len(),
        smallcase_ids.len(),
        queued
    );
    Ok(queued)
}
