//! Brand-pair directory of price authorities.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use quote_oracle_core::{Notifier, ReplaceableNotifiers};
use quote_oracle_types::{Amount, Brand, PriceQuote};
use tracing::info;

use crate::authority::PriceAuthority;
use crate::error::RegistryError;

/// Routes queries to the authority registered for a brand pair.
///
/// Quote subscriptions go through a stable per-pair notifier, so replacing
/// the authority for a pair does not disturb existing subscribers.
pub struct PriceAuthorityRegistry {
    authorities: Mutex<HashMap<(Brand, Brand), Arc<dyn PriceAuthority>>>,
    quotes: ReplaceableNotifiers<Brand, PriceQuote>,
}

impl Default for PriceAuthorityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceAuthorityRegistry {
    pub fn new() -> Self {
        Self {
            authorities: Mutex::new(HashMap::new()),
            quotes: ReplaceableNotifiers::new(),
        }
    }

    /// Register `authority` for `brand_in -> brand_out`. An existing
    /// registration is only replaced with `force`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(
        &self,
        authority: Arc<dyn PriceAuthority>,
        brand_in: &Brand,
        brand_out: &Brand,
        force: bool,
    ) -> Result<(), RegistryError> {
        let source = authority.quote_notifier(brand_in, brand_out)?;
        let key = (brand_in.clone(), brand_out.clone());
        {
            let mut authorities = self.authorities.lock();
            if authorities.contains_key(&key) && !force {
                return Err(RegistryError::AlreadyRegistered {
                    brand_in: key.0,
                    brand_out: key.1,
                });
            }
            authorities.insert(key, authority);
        }
        let generation = self
            .quotes
            .replace(&[brand_in.clone(), brand_out.clone()], source);
        info!("Registered price authority for {}/{} (generation {})", brand_in, brand_out, generation);
        Ok(())
    }

    /// Remove the authority for the pair. Its quote notifier finishes with
    /// the last quote.
    pub fn unregister(&self, brand_in: &Brand, brand_out: &Brand) -> Result<(), RegistryError> {
        let key = (brand_in.clone(), brand_out.clone());
        if self.authorities.lock().remove(&key).is_none() {
            return Err(RegistryError::NotRegistered {
                brand_in: key.0,
                brand_out: key.1,
            });
        }
        self.quotes.delete(&[key.0, key.1]);
        info!("Unregistered price authority for {}/{}", brand_in, brand_out);
        Ok(())
    }

    pub fn lookup(
        &self,
        brand_in: &Brand,
        brand_out: &Brand,
    ) -> Result<Arc<dyn PriceAuthority>, RegistryError> {
        self.authorities
            .lock()
            .get(&(brand_in.clone(), brand_out.clone()))
            .cloned()
            .ok_or_else(|| RegistryError::NotRegistered {
                brand_in: brand_in.clone(),
                brand_out: brand_out.clone(),
            })
    }

    /// Stable notifier of quotes for the pair, whichever authority serves
    /// it. Available before the first registration.
    ///
    /// Must be called from within a tokio runtime.
    pub fn quote_notifier(&self, brand_in: &Brand, brand_out: &Brand) -> Notifier<PriceQuote> {
        self.quotes.notifier(&[brand_in.clone(), brand_out.clone()])
    }

    pub async fn quote_given(
        &self,
        amount_in: &Amount,
        brand_out: &Brand,
    ) -> Result<PriceQuote, RegistryError> {
        let authority = self.lookup(&amount_in.brand, brand_out)?;
        Ok(authority.quote_given(amount_in, brand_out).await?)
    }

    pub async fn quote_wanted(
        &self,
        brand_in: &Brand,
        amount_out: &Amount,
    ) -> Result<PriceQuote, RegistryError> {
        let authority = self.lookup(brand_in, &amount_out.brand)?;
        Ok(authority.quote_wanted(brand_in, amount_out).await?)
    }
}
