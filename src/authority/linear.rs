//! Price authority that rescales another quote stream.

use std::sync::Arc;

use quote_oracle_core::{Notifier, TimerService};
use quote_oracle_types::{Brand, NatValue, PriceQuote};
use tokio::task::JoinHandle;

use super::base::{QuoteAuthority, RateSample};
use crate::error::{PriceAuthorityError, PriceAuthorityResult};
use crate::issuer::QuoteIssuer;

/// Each source quote of `in -> out` becomes
/// `in * denominator -> out * numerator` in the new brands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearScale {
    pub numerator: NatValue,
    pub denominator: NatValue,
}

impl LinearScale {
    pub const IDENTITY: LinearScale = LinearScale {
        numerator: 1,
        denominator: 1,
    };

    fn apply(&self, quote: &PriceQuote) -> PriceAuthorityResult<Option<RateSample>> {
        let value_in = quote
            .amount_in()
            .value
            .checked_mul(self.denominator)
            .ok_or(PriceAuthorityError::Overflow)?;
        let value_out = quote
            .amount_out()
            .value
            .checked_mul(self.numerator)
            .ok_or(PriceAuthorityError::Overflow)?;
        if value_in == 0 || value_out == 0 {
            return Ok(None);
        }
        Ok(Some(RateSample {
            value_in,
            value_out,
            timestamp: quote.timestamp(),
        }))
    }
}

pub struct LinearPriceAuthority {
    authority: QuoteAuthority,
    follower: JoinHandle<()>,
}

impl AsRef<QuoteAuthority> for LinearPriceAuthority {
    fn as_ref(&self) -> &QuoteAuthority {
        &self.authority
    }
}

impl Drop for LinearPriceAuthority {
    fn drop(&mut self) {
        self.follower.abort();
    }
}

impl LinearPriceAuthority {
    /// Follow `source`, rescaling each quote into `brand_in`/`brand_out`.
    /// With `source_issuer`, quotes that fail verification fail the
    /// authority.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        source: Notifier<PriceQuote>,
        source_issuer: Option<Arc<QuoteIssuer>>,
        brand_in: Brand,
        brand_out: Brand,
        scale: LinearScale,
        timer: Arc<dyn TimerService>,
        issuer: Arc<QuoteIssuer>,
    ) -> PriceAuthorityResult<Self> {
        if scale.numerator == 0 || scale.denominator == 0 {
            return Err(PriceAuthorityError::ZeroPrice);
        }
        let authority = QuoteAuthority::new(brand_in, brand_out, timer, issuer);
        let follower = authority.follow(source, move |quote: PriceQuote| {
            if let Some(source_issuer) = &source_issuer {
                source_issuer.verify(&quote)?;
            }
            scale.apply(&quote)
        });
        Ok(Self {
            authority,
            follower,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{PriceAuthority, SinglePriceAuthority};
    use quote_oracle_core::ManualTimer;
    use quote_oracle_types::Amount;

    #[tokio::test]
    async fn test_rescales_source_quotes() {
        let timer = Arc::new(ManualTimer::new("manual", 0, 1));
        let atom = Brand::new("ATOM");
        let usd = Brand::new("USD");
        let source_issuer = Arc::new(QuoteIssuer::new(Brand::new("source")));
        let source =
            SinglePriceAuthority::new(atom.clone(), usd.clone(), timer.clone(), source_issuer.clone());
        source
            .set_price(&Amount::make(&atom, 1), &Amount::make(&usd, 12))
            .unwrap();

        // uatom -> ucent: 1 ATOM = 10^6 uatom, 1 USD = 100 cents.
        let uatom = Brand::new("uATOM");
        let cent = Brand::new("cent");
        let linear = LinearPriceAuthority::spawn(
            source.quote_notifier(&atom, &usd).unwrap(),
            Some(source_issuer),
            uatom.clone(),
            cent.clone(),
            LinearScale {
                numerator: 100,
                denominator: 1_000_000,
            },
            timer,
            Arc::new(QuoteIssuer::new(Brand::new("linear"))),
        )
        .unwrap();

        let quote = linear
            .quote_given(&Amount::make(&uatom, 2_000_000), &cent)
            .await
            .unwrap();
        assert_eq!(quote.amount_out().value, 2400);
        assert_eq!(quote.amount_out().brand, cent);
    }

    #[tokio::test]
    async fn test_forged_source_quote_fails_authority() {
        let timer = Arc::new(ManualTimer::new("manual", 0, 1));
        let atom = Brand::new("ATOM");
        let usd = Brand::new("USD");
        let real_issuer = Arc::new(QuoteIssuer::new(Brand::new("source")));
        let impostor = Arc::new(QuoteIssuer::new(Brand::new("source")));
        let source = SinglePriceAuthority::new(atom.clone(), usd.clone(), timer.clone(), impostor);
        source
            .set_price(&Amount::make(&atom, 1), &Amount::make(&usd, 12))
            .unwrap();

        let linear = LinearPriceAuthority::spawn(
            source.quote_notifier(&atom, &usd).unwrap(),
            Some(real_issuer),
            atom.clone(),
            usd.clone(),
            LinearScale::IDENTITY,
            timer,
            Arc::new(QuoteIssuer::new(Brand::new("linear"))),
        )
        .unwrap();

        let result = linear.quote_given(&Amount::make(&atom, 1), &usd).await;
        assert!(matches!(result, Err(PriceAuthorityError::SourceFailed(_))));
    }
}
