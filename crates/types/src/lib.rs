//! Value and wire-format types for the quote oracle.
//!
//! Everything here is plain data: brands and natural-number amounts, the
//! timestamped price descriptions carried inside authenticated quotes, and the
//! events broadcast to feed subscribers.

pub mod amount;
pub mod event;
pub mod quote;

pub use amount::{Amount, AmountError, Brand, NatValue};
pub use event::{FeedEvent, QuoteView, Submission, SubmissionReason};
pub use quote::{
    Comparator, PriceDescription, PriceQuote, QuoteAmount, QuotePayment, RelativeTime, Timestamp,
};
