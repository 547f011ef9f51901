//! Events broadcast to feed subscribers.

use serde::{Deserialize, Serialize};

use crate::amount::{Brand, NatValue};
use crate::quote::{PriceQuote, Timestamp};

/// Flattened view of a published quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteView {
    pub brand_in: Brand,
    pub brand_out: Brand,
    pub amount_in: NatValue,
    pub amount_out: NatValue,
    pub timestamp: Timestamp,
}

impl From<&PriceQuote> for QuoteView {
    fn from(quote: &PriceQuote) -> Self {
        Self {
            brand_in: quote.amount_in().brand.clone(),
            brand_out: quote.amount_out().brand.clone(),
            amount_in: quote.amount_in().value,
            amount_out: quote.amount_out().value,
            timestamp: quote.timestamp(),
        }
    }
}

/// Why a flux monitor submitted a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionReason {
    /// An externally started round asked for a fresh value.
    Round,
    /// A polled value moved past the deviation thresholds.
    Deviation,
    /// No round advanced for the idle period.
    Idle,
}

/// A value submitted by a flux monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub round_id: u64,
    pub value: NatValue,
    pub timestamp: Timestamp,
    pub reason: SubmissionReason,
}

/// Events emitted by the oracle service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    /// The aggregator published a new quote
    Quote(QuoteView),

    /// A flux monitor submitted a value
    Submission(Submission),

    /// An oracle joined the aggregator
    OracleAdded { oracle: String },

    /// An oracle left the aggregator
    OracleDropped { oracle: String },

    /// An error occurred
    Error { message: String },
}
