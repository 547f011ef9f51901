//! Price authority whose rate is set directly.

use std::sync::Arc;

use quote_oracle_core::{TickSource, TimerService};
use quote_oracle_types::{Amount, Brand, NatValue, PriceQuote};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::base::{QuoteAuthority, RateSample};
use crate::error::{PriceAuthorityError, PriceAuthorityResult};
use crate::issuer::QuoteIssuer;

pub struct SinglePriceAuthority {
    authority: QuoteAuthority,
    driver: Option<JoinHandle<()>>,
}

impl AsRef<QuoteAuthority> for SinglePriceAuthority {
    fn as_ref(&self) -> &QuoteAuthority {
        &self.authority
    }
}

impl Drop for SinglePriceAuthority {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

impl SinglePriceAuthority {
    pub fn new(
        brand_in: Brand,
        brand_out: Brand,
        timer: Arc<dyn TimerService>,
        issuer: Arc<QuoteIssuer>,
    ) -> Self {
        Self {
            authority: QuoteAuthority::new(brand_in, brand_out, timer, issuer),
            driver: None,
        }
    }

    /// Authority that steps through `prices` (per `unit_amount_in`) on each
    /// tick, wrapping around at the end. The first price is live at once.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_price_list(
        brand_in: Brand,
        brand_out: Brand,
        unit_amount_in: NatValue,
        prices: Vec<NatValue>,
        ticks: TickSource,
        timer: Arc<dyn TimerService>,
        issuer: Arc<QuoteIssuer>,
    ) -> PriceAuthorityResult<Self> {
        if prices.is_empty() {
            return Err(PriceAuthorityError::InvalidArgument(
                "price list is empty".to_string(),
            ));
        }
        if unit_amount_in == 0 || prices.contains(&0) {
            return Err(PriceAuthorityError::ZeroPrice);
        }

        let mut single = Self::new(brand_in, brand_out, timer, issuer);
        let authority = single.authority.clone();
        let now = authority.timer().current_timestamp();
        authority.ingest(
            RateSample {
                value_in: unit_amount_in,
                value_out: prices[0],
                timestamp: now,
            },
            true,
        )?;

        single.driver = Some(tokio::spawn(async move {
            let mut ticks = ticks.ticks_from(now.saturating_add(1));
            let mut index = 0;
            while let Some(tick) = ticks.next_tick().await {
                let timestamp = match tick {
                    Ok(timestamp) => timestamp,
                    Err(err) => {
                        authority.fail(err.to_string());
                        return;
                    }
                };
                index = (index + 1) % prices.len();
                debug!("Price list tick at {}: {}", timestamp, prices[index]);
                let sample = RateSample {
                    value_in: unit_amount_in,
                    value_out: prices[index],
                    timestamp,
                };
                if let Err(err) = authority.ingest(sample, true) {
                    warn!("Price list stopped: {}", err);
                    return;
                }
            }
            authority.finish();
        }));
        Ok(single)
    }

    /// Make `amount_in` worth `amount_out` from now on.
    pub fn set_price(&self, amount_in: &Amount, amount_out: &Amount) -> PriceAuthorityResult<PriceQuote> {
        amount_in.coerce(self.authority.brand_in())?;
        amount_out.coerce(self.authority.brand_out())?;
        let sample = RateSample {
            value_in: amount_in.value,
            value_out: amount_out.value,
            timestamp: self.authority.timer().current_timestamp(),
        };
        self.authority
            .ingest(sample, true)?
            .ok_or(PriceAuthorityError::SourceFinished)
    }

    pub fn fail(&self, reason: impl Into<String>) {
        self.authority.fail(reason);
    }

    pub fn finish(&self) {
        self.authority.finish();
    }
}
