//! Error types for quote minting, price authorities, aggregation and
//! monitoring.

use quote_oracle_core::{NotifierError, ScheduleError, TimerError};
use quote_oracle_types::{AmountError, Brand};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuoteError {
    #[error("quote encoding failed: {0}")]
    Encode(String),

    #[error("quote payment was not minted by this issuer")]
    Forged,

    #[error("quote issued by {actual}, expected {expected}")]
    WrongIssuer { expected: Brand, actual: Brand },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PriceAuthorityError {
    #[error(transparent)]
    Amount(#[from] AmountError),

    #[error("no quotes for {brand_in}/{brand_out}")]
    UnsupportedPair { brand_in: Brand, brand_out: Brand },

    #[error("price ratio has a zero side")]
    ZeroPrice,

    #[error("arithmetic overflow")]
    Overflow,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("quote source failed: {0}")]
    SourceFailed(String),

    #[error("quote source finished")]
    SourceFinished,

    #[error("quote request cancelled")]
    Cancelled,

    #[error(transparent)]
    Quote(#[from] QuoteError),

    #[error(transparent)]
    Timer(#[from] TimerError),
}

impl From<NotifierError> for PriceAuthorityError {
    fn from(err: NotifierError) -> Self {
        match err {
            NotifierError::Failed(reason) => PriceAuthorityError::SourceFailed(reason),
            NotifierError::Abandoned => {
                PriceAuthorityError::SourceFailed("quote publisher dropped".to_string())
            }
            NotifierError::Terminated | NotifierError::NoValue => PriceAuthorityError::SourceFinished,
        }
    }
}

pub type PriceAuthorityResult<T> = Result<T, PriceAuthorityError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    #[error("oracle query failed: {0}")]
    Query(String),

    #[error("oracle requires fee of {required}, offered {offered}")]
    InsufficientFee { required: u128, offered: u128 },

    #[error("oracle unavailable")]
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregatorError {
    #[error("oracle already registered: {0}")]
    DuplicateOracle(String),

    #[error("unknown oracle: {0}")]
    UnknownOracle(String),

    #[error("invalid aggregator config: {0}")]
    InvalidConfig(String),

    #[error("aggregator shut down")]
    Shutdown,

    #[error(transparent)]
    Authority(#[from] PriceAuthorityError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FluxError {
    #[error("invalid flux monitor config: {0}")]
    InvalidConfig(String),

    #[error("unusable oracle reply: {0}")]
    InvalidReply(String),

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("price authority already registered for {brand_in}/{brand_out}")]
    AlreadyRegistered { brand_in: Brand, brand_out: Brand },

    #[error("no price authority registered for {brand_in}/{brand_out}")]
    NotRegistered { brand_in: Brand, brand_out: Brand },

    #[error(transparent)]
    Authority(#[from] PriceAuthorityError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}
