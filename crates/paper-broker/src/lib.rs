pub mod client;
pub mod quotes;

pub use broker_trait::BrokerClient;
pub use client::{PaperBroker, PaperBrokerConfig};
pub use quotes::StaticQuotes;
