//! Minting and verification of authenticated quotes.
//!
//! A quote payment carries an HMAC-SHA256 tag over the serialized quote
//! amount. Only the issuer holding the key can produce a valid tag, and any
//! holder of the issuer can check one.

use hmac::{Hmac, Mac};
use quote_oracle_types::{Brand, PriceDescription, PriceQuote, QuoteAmount, QuotePayment};
use rand::RngCore;
use sha2::Sha256;

use crate::error::QuoteError;

type HmacSha256 = Hmac<Sha256>;

const KEY_LEN: usize = 32;

pub struct QuoteIssuer {
    brand: Brand,
    key: Vec<u8>,
}

impl std::fmt::Debug for QuoteIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuoteIssuer")
            .field("brand", &self.brand)
            .finish_non_exhaustive()
    }
}

impl QuoteIssuer {
    /// Issuer with a fresh random key.
    pub fn new(brand: Brand) -> Self {
        let mut key = vec![0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self { brand, key }
    }

    pub fn with_key(brand: Brand, key: impl Into<Vec<u8>>) -> Self {
        Self {
            brand,
            key: key.into(),
        }
    }

    pub fn brand(&self) -> &Brand {
        &self.brand
    }

    /// Mint an authenticated quote for `description`.
    pub fn mint(&self, description: PriceDescription) -> Result<PriceQuote, QuoteError> {
        let quote_amount = QuoteAmount {
            brand: self.brand.clone(),
            description,
        };
        let tag = hex::encode(self.sign(&quote_amount)?);
        let quote_payment = QuotePayment {
            amount: quote_amount.clone(),
            tag,
        };
        Ok(PriceQuote {
            quote_amount,
            quote_payment,
        })
    }

    /// The amount a payment stands for, once its tag checks out.
    pub fn get_amount_of<'a>(&self, payment: &'a QuotePayment) -> Result<&'a QuoteAmount, QuoteError> {
        if payment.amount.brand != self.brand {
            return Err(QuoteError::WrongIssuer {
                expected: self.brand.clone(),
                actual: payment.amount.brand.clone(),
            });
        }
        let tag = hex::decode(&payment.tag).map_err(|_| QuoteError::Forged)?;
        let mut mac = self.mac()?;
        mac.update(&encode(&payment.amount)?);
        mac.verify_slice(&tag).map_err(|_| QuoteError::Forged)?;
        Ok(&payment.amount)
    }

    /// Check that `quote` was minted here and its payment matches its amount.
    pub fn verify(&self, quote: &PriceQuote) -> Result<(), QuoteError> {
        let amount = self.get_amount_of(&quote.quote_payment)?;
        if amount != &quote.quote_amount {
            return Err(QuoteError::Forged);
        }
        Ok(())
    }

    fn sign(&self, amount: &QuoteAmount) -> Result<Vec<u8>, QuoteError> {
        let mut mac = self.mac()?;
        mac.update(&encode(amount)?);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn mac(&self) -> Result<HmacSha256, QuoteError> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| QuoteError::Encode(e.to_string()))
    }
}

fn encode(amount: &QuoteAmount) -> Result<Vec<u8>, QuoteError> {
    serde_json::to_vec(amount).map_err(|e| QuoteError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quote_oracle_types::Amount;

    fn description() -> PriceDescription {
        PriceDescription {
            amount_in: Amount::make(&Brand::new("ATOM"), 1),
            amount_out: Amount::make(&Brand::new("USD"), 1020),
            timer: "manual".to_string(),
            timestamp: 7,
        }
    }

    #[test]
    fn test_minted_quote_verifies() {
        let issuer = QuoteIssuer::new(Brand::new("quote"));
        let quote = issuer.mint(description()).unwrap();

        assert!(issuer.verify(&quote).is_ok());
        assert_eq!(issuer.get_amount_of(&quote.quote_payment).unwrap(), &quote.quote_amount);
    }

    #[test]
    fn test_tampered_quote_is_forged() {
        let issuer = QuoteIssuer::new(Brand::new("quote"));
        let mut quote = issuer.mint(description()).unwrap();
        quote.quote_payment.amount.description.amount_out.value = 9999;

        assert_eq!(issuer.verify(&quote), Err(QuoteError::Forged));
    }

    #[test]
    fn test_mismatched_amount_is_forged() {
        let issuer = QuoteIssuer::new(Brand::new("quote"));
        let mut quote = issuer.mint(description()).unwrap();
        quote.quote_amount.description.timestamp = 8;

        assert_eq!(issuer.verify(&quote), Err(QuoteError::Forged));
    }

    #[test]
    fn test_other_issuer_rejects_quote() {
        let ours = QuoteIssuer::new(Brand::new("quote"));
        let theirs = QuoteIssuer::new(Brand::new("quote"));
        let quote = theirs.mint(description()).unwrap();

        // Same brand, different key.
        assert_eq!(ours.verify(&quote), Err(QuoteError::Forged));

        let other_brand = QuoteIssuer::with_key(Brand::new("other"), vec![1u8; 32]);
        assert!(matches!(
            other_brand.verify(&quote),
            Err(QuoteError::WrongIssuer { .. })
        ));
    }
}
