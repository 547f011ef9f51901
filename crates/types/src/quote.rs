//! Price descriptions and authenticated quotes.

use serde::{Deserialize, Serialize};

use crate::amount::{Amount, Brand, NatValue};

/// Absolute time in seconds, as reported by a timer service.
pub type Timestamp = u64;

/// Duration in seconds.
pub type RelativeTime = u64;

/// A single exchange-rate sample: `amount_in` of one brand buys `amount_out`
/// of another at `timestamp` according to `timer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceDescription {
    pub amount_in: Amount,
    pub amount_out: Amount,
    /// Label of the timer service the timestamp was read from.
    pub timer: String,
    pub timestamp: Timestamp,
}

/// Amount of the quote brand minted by a quote issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteAmount {
    /// Brand of the issuer that minted this quote.
    pub brand: Brand,
    pub description: PriceDescription,
}

/// Proof that a quote amount was minted by a particular issuer.
///
/// Carries the amount and a tag only the minting issuer can produce, so any
/// holder of that issuer can check provenance without trusting the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotePayment {
    pub amount: QuoteAmount,
    /// Hex-encoded authentication tag.
    pub tag: String,
}

/// An authenticated quote. Immutable once minted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub quote_amount: QuoteAmount,
    pub quote_payment: QuotePayment,
}

impl PriceQuote {
    pub fn description(&self) -> &PriceDescription {
        &self.quote_amount.description
    }

    pub fn amount_in(&self) -> &Amount {
        &self.quote_amount.description.amount_in
    }

    pub fn amount_out(&self) -> &Amount {
        &self.quote_amount.description.amount_out
    }

    pub fn timestamp(&self) -> Timestamp {
        self.quote_amount.description.timestamp
    }
}

/// Comparison applied by a quote trigger: `actual <cmp> limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Comparator {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparator {
    pub fn holds(self, actual: NatValue, limit: NatValue) -> bool {
        match self {
            Comparator::Gt => actual > limit,
            Comparator::Gte => actual >= limit,
            Comparator::Lt => actual < limit,
            Comparator::Lte => actual <= limit,
        }
    }
}

impl std::fmt::Display for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Comparator::Gt => ">",
            Comparator::Gte => ">=",
            Comparator::Lt => "<",
            Comparator::Lte => "<=",
        };
        write!(f, "{}", op)
    }
}
