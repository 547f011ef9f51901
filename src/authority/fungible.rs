//! Price authority over bare numeric value pairs.

use std::sync::Arc;

use quote_oracle_core::{Notifier, TimerService};
use quote_oracle_types::{Brand, NatValue};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::base::{QuoteAuthority, RateSample};
use crate::error::PriceAuthorityResult;
use crate::issuer::QuoteIssuer;

/// `value_in` units buy `value_out` units. No brands attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValuePair {
    pub value_in: NatValue,
    pub value_out: NatValue,
}

pub struct FungiblePriceAuthority {
    authority: QuoteAuthority,
    follower: JoinHandle<()>,
}

impl AsRef<QuoteAuthority> for FungiblePriceAuthority {
    fn as_ref(&self) -> &QuoteAuthority {
        &self.authority
    }
}

impl Drop for FungiblePriceAuthority {
    fn drop(&mut self) {
        self.follower.abort();
    }
}

impl FungiblePriceAuthority {
    /// Follow `source`, stamping each pair with the timer's current time.
    /// Pairs with a zero side are skipped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        source: Notifier<ValuePair>,
        brand_in: Brand,
        brand_out: Brand,
        timer: Arc<dyn TimerService>,
        issuer: Arc<QuoteIssuer>,
    ) -> Self {
        let authority = QuoteAuthority::new(brand_in, brand_out, Arc::clone(&timer), issuer);
        let follower = authority.follow(source, move |pair: ValuePair| -> PriceAuthorityResult<_> {
            if pair.value_in == 0 || pair.value_out == 0 {
                return Ok(None);
            }
            Ok(Some(RateSample {
                value_in: pair.value_in,
                value_out: pair.value_out,
                timestamp: timer.current_timestamp(),
            }))
        });
        Self {
            authority,
            follower,
        }
    }
}
