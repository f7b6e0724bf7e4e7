pub mod aggregator;
pub mod config;
pub mod drip;
pub mod engine;
pub mod error;
pub mod executor;
pub mod planner;
pub mod requests;


pub use config::EngineConfig;
pub use drip::DividendReport;
pub use engine::{AggregationEngine, BatchReport};
pub use error::{EngineError, Rejection};
pub use executor::{BrokerRouter, OrderExecutor};
pub use requests::{LegFill, OrderIntent, OrderRequest, RequestOutcome, RequestQueue, RequestStatus};
