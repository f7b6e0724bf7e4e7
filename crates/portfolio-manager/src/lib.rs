pub mod accounts;
pub mod assets;
pub mod db;
pub mod dividends;
pub mod ledger;
pub mod models;
pub mod portfolio;
pub mod reconciliation;
pub mod smallcases;
pub mod trades;

pub use accounts::AccountManager;
pub use assets::AssetCatalog;
pub use db::PortfolioDb;
pub use dividends::DividendRegistry;
pub use models::*;
pub use portfolio::PortfolioManager;
pub use reconciliation::Reconciler;
pub use smallcases::SmallcaseCatalog;
pub use trades::TradeLogger;
