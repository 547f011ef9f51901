//! Price authorities: point queries and threshold triggers over a stream of
//! exchange-rate samples.
//!
//! - [`SinglePriceAuthority`]: prices set directly, or cycled from a list
//! - [`LinearPriceAuthority`]: rescales another quote stream
//! - [`FungiblePriceAuthority`]: plain numeric value pairs
//! - [`InversePriceAuthority`]: another authority with in and out swapped
//!
//! All of them expose [`PriceAuthority`] through the [`QuoteAuthority`] they
//! wrap.

mod base;
mod fungible;
mod inverse;
mod linear;
mod single;

use std::sync::Arc;

use async_trait::async_trait;
use quote_oracle_core::{Notifier, TimerService};
use quote_oracle_types::{Amount, Brand, Comparator, PriceQuote, Timestamp};

use crate::error::PriceAuthorityResult;
use crate::issuer::QuoteIssuer;

pub use base::{MutableQuote, PendingQuote, QuoteAuthority, RateSample};
pub use fungible::{FungiblePriceAuthority, ValuePair};
pub use inverse::InversePriceAuthority;
pub use linear::{LinearPriceAuthority, LinearScale};
pub use single::SinglePriceAuthority;

#[async_trait]
pub trait PriceAuthority: Send + Sync {
    /// Issuer that mints this authority's quotes for the pair.
    fn quote_issuer(&self, brand_in: &Brand, brand_out: &Brand)
        -> PriceAuthorityResult<Arc<QuoteIssuer>>;

    fn timer_service(
        &self,
        brand_in: &Brand,
        brand_out: &Brand,
    ) -> PriceAuthorityResult<Arc<dyn TimerService>>;

    /// Notifier of unit quotes for the pair.
    fn quote_notifier(
        &self,
        brand_in: &Brand,
        brand_out: &Brand,
    ) -> PriceAuthorityResult<Notifier<PriceQuote>>;

    /// `amount_out = floor(amount_in * latest_out / latest_in)`.
    async fn quote_given(&self, amount_in: &Amount, brand_out: &Brand)
        -> PriceAuthorityResult<PriceQuote>;

    /// `amount_in = ceil(amount_out * latest_in / latest_out)`.
    async fn quote_wanted(&self, brand_in: &Brand, amount_out: &Amount)
        -> PriceAuthorityResult<PriceQuote>;

    async fn quote_at_time(
        &self,
        deadline: Timestamp,
        amount_in: &Amount,
        brand_out: &Brand,
    ) -> PriceAuthorityResult<PriceQuote>;

    fn quote_when(
        &self,
        comparator: Comparator,
        amount_in: &Amount,
        amount_out_limit: &Amount,
    ) -> PriceAuthorityResult<PendingQuote>;

    fn mutable_quote_when(
        &self,
        comparator: Comparator,
        amount_in: &Amount,
        amount_out_limit: &Amount,
    ) -> PriceAuthorityResult<MutableQuote>;

    fn quote_when_gt(&self, amount_in: &Amount, amount_out_limit: &Amount) -> PriceAuthorityResult<PendingQuote> {
        self.quote_when(Comparator::Gt, amount_in, amount_out_limit)
    }

    fn quote_when_gte(&self, amount_in: &Amount, amount_out_limit: &Amount) -> PriceAuthorityResult<PendingQuote> {
        self.quote_when(Comparator::Gte, amount_in, amount_out_limit)
    }

    fn quote_when_lt(&self, amount_in: &Amount, amount_out_limit: &Amount) -> PriceAuthorityResult<PendingQuote> {
        self.quote_when(Comparator::Lt, amount_in, amount_out_limit)
    }

    fn quote_when_lte(&self, amount_in: &Amount, amount_out_limit: &Amount) -> PriceAuthorityResult<PendingQuote> {
        self.quote_when(Comparator::Lte, amount_in, amount_out_limit)
    }
}

#[async_trait]
impl<A> PriceAuthority for A
where
    A: AsRef<QuoteAuthority> + Send + Sync,
{
    fn quote_issuer(
        &self,
        brand_in: &Brand,
        brand_out: &Brand,
    ) -> PriceAuthorityResult<Arc<QuoteIssuer>> {
        let authority = self.as_ref();
        authority.check_pair(brand_in, brand_out)?;
        Ok(Arc::clone(authority.issuer()))
    }

    fn timer_service(
        &self,
        brand_in: &Brand,
        brand_out: &Brand,
    ) -> PriceAuthorityResult<Arc<dyn TimerService>> {
        let authority = self.as_ref();
        authority.check_pair(brand_in, brand_out)?;
        Ok(Arc::clone(authority.timer()))
    }

    fn quote_notifier(
        &self,
        brand_in: &Brand,
        brand_out: &Brand,
    ) -> PriceAuthorityResult<Notifier<PriceQuote>> {
        let authority = self.as_ref();
        authority.check_pair(brand_in, brand_out)?;
        Ok(authority.notifier())
    }

    async fn quote_given(
        &self,
        amount_in: &Amount,
        brand_out: &Brand,
    ) -> PriceAuthorityResult<PriceQuote> {
        self.as_ref().quote_given(amount_in, brand_out).await
    }

    async fn quote_wanted(
        &self,
        brand_in: &Brand,
        amount_out: &Amount,
    ) -> PriceAuthorityResult<PriceQuote> {
        self.as_ref().quote_wanted(brand_in, amount_out).await
    }

    async fn quote_at_time(
        &self,
        deadline: Timestamp,
        amount_in: &Amount,
        brand_out: &Brand,
    ) -> PriceAuthorityResult<PriceQuote> {
        self.as_ref().quote_at_time(deadline, amount_in, brand_out).await
    }

    fn quote_when(
        &self,
        comparator: Comparator,
        amount_in: &Amount,
        amount_out_limit: &Amount,
    ) -> PriceAuthorityResult<PendingQuote> {
        self.as_ref().quote_when(comparator, amount_in, amount_out_limit)
    }

    fn mutable_quote_when(
        &self,
        comparator: Comparator,
        amount_in: &Amount,
        amount_out_limit: &Amount,
    ) -> PriceAuthorityResult<MutableQuote> {
        self.as_ref()
            .mutable_quote_when(comparator, amount_in, amount_out_limit)
    }
}
