use broker_trait::BrokerMode;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Portfolio not found: {0}")]
    PortfolioNotFound(Uuid),

    #[error("Idempotency key '{0}' was already used for a different request")]
    IdempotencyConflict(String),

    #[error("Dividend not found: {0}")]
    DividendNotFound(Uuid),

    #[error("Dividend {0} has already been processed")]
    DividendAlreadyProcessed(Uuid),

    #[error("Dividend {0} is not payable until {1}")]
    DividendNotPayable(Uuid, NaiveDate),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Why a single request was turned away during planning. Rejections are
/// written to the request's outcome; they never fail the batch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("portfolio {0} no longer exists")]
    PortfolioNotFound(Uuid),

    #[error("no broker is configured for {0} trading")]
    BrokerUnavailable(BrokerMode),

    #[error("smallcase not found")]
    SmallcaseNotFound,

    #[error("smallcase is not accepting new investments")]
    SmallcaseInactive,

    #[error("investment not found")]
    InvestmentNotFound,

    #[error("investment belongs to another portfolio")]
    NotOwner,

    #[error("investment is already closed")]
    InvestmentClosed,

    #[error("another request for this smallcase is already in the batch")]
    InvestmentBusy,

    #[error("amount {0} is too small to buy any constituent")]
    InvestmentTooSmall(Decimal),

    #[error("insufficient cash: need {required}, available {available}")]
    InsufficientCash { required: Decimal, available: Decimal },

    #[error("insufficient {symbol}: need {required}, available {available}")]
    InsufficientQuantity {
        symbol: String,
        required: Decimal,
        available: Decimal,
    },

    #[error("no quote available for {0}")]
    MissingQuote(String),

    #[error("investment already matches the smallcase weights")]
    AlreadyBalanced,

    #[error("order value is too large to process")]
    ValueOutOfRange,
}
