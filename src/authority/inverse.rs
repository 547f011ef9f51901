//! Price authority that reads another authority backwards.

use std::sync::Arc;

use quote_oracle_types::{Brand, PriceQuote};
use tokio::task::JoinHandle;
use tracing::warn;

use super::base::{QuoteAuthority, RateSample};
use super::PriceAuthority;
use crate::error::PriceAuthorityResult;
use crate::issuer::QuoteIssuer;

pub struct InversePriceAuthority {
    authority: QuoteAuthority,
    follower: JoinHandle<()>,
}

impl AsRef<QuoteAuthority> for InversePriceAuthority {
    fn as_ref(&self) -> &QuoteAuthority {
        &self.authority
    }
}

impl Drop for InversePriceAuthority {
    fn drop(&mut self) {
        self.follower.abort();
    }
}

impl InversePriceAuthority {
    /// Quote `brand_out -> brand_in` from `wrapped`'s `brand_in -> brand_out`
    /// quotes. Each wrapped quote is verified against the wrapped issuer
    /// before use.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        wrapped: &dyn PriceAuthority,
        brand_in: &Brand,
        brand_out: &Brand,
        issuer: Arc<QuoteIssuer>,
    ) -> PriceAuthorityResult<Self> {
        let source = wrapped.quote_notifier(brand_in, brand_out)?;
        let source_issuer = wrapped.quote_issuer(brand_in, brand_out)?;
        let timer = wrapped.timer_service(brand_in, brand_out)?;

        let authority = QuoteAuthority::new(brand_out.clone(), brand_in.clone(), timer, issuer);
        let follower = authority.follow(source, move |quote: PriceQuote| {
            source_issuer.verify(&quote)?;
            if quote.amount_out().is_empty() {
                warn!("Skipping quote at {} with nothing out", quote.timestamp());
                return Ok(None);
            }
            Ok(Some(RateSample {
                value_in: quote.amount_out().value,
                value_out: quote.amount_in().value,
                timestamp: quote.timestamp(),
            }))
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
    use crate::authority::SinglePriceAuthority;
    use crate::error::PriceAuthorityError;
    use quote_oracle_core::ManualTimer;
    use quote_oracle_types::{Amount, Comparator};

    #[tokio::test]
    async fn test_inverts_wrapped_quotes() {
        let timer = Arc::new(ManualTimer::new("manual", 0, 1));
        let atom = Brand::new("ATOM");
        let usd = Brand::new("USD");
        let forward = SinglePriceAuthority::new(
            atom.clone(),
            usd.clone(),
            timer,
            Arc::new(QuoteIssuer::new(Brand::new("forward"))),
        );
        forward
            .set_price(&Amount::make(&atom, 1), &Amount::make(&usd, 8))
            .unwrap();

        let inverse = InversePriceAuthority::spawn(
            &forward,
            &atom,
            &usd,
            Arc::new(QuoteIssuer::new(Brand::new("inverse"))),
        )
        .unwrap();

        let quote = inverse.quote_given(&Amount::make(&usd, 20), &atom).await.unwrap();
        assert_eq!(quote.amount_out().value, 2);
        let wanted = inverse.quote_wanted(&usd, &Amount::make(&atom, 3)).await.unwrap();
        assert_eq!(wanted.amount_in().value, 24);

        // ATOM getting cheaper means a dollar buys more of it.
        let trigger = inverse
            .quote_when(Comparator::Gte, &Amount::make(&usd, 20), &Amount::make(&atom, 4))
            .unwrap();
        forward
            .set_price(&Amount::make(&atom, 1), &Amount::make(&usd, 5))
            .unwrap();
        assert_eq!(trigger.await.unwrap().amount_out().value, 4);
    }

    #[tokio::test]
    async fn test_wrong_pair_rejected() {
        let timer = Arc::new(ManualTimer::new("manual", 0, 1));
        let atom = Brand::new("ATOM");
        let usd = Brand::new("USD");
        let forward = SinglePriceAuthority::new(
            atom.clone(),
            usd.clone(),
            timer,
            Arc::new(QuoteIssuer::new(Brand::new("forward"))),
        );
        let result = InversePriceAuthority::spawn(
            &forward,
            &usd,
            &atom,
            Arc::new(QuoteIssuer::new(Brand::new("inverse"))),
        );
        assert!(matches!(result, Err(PriceAuthorityError::UnsupportedPair { .. })));
    }
}
