//! Brands and natural-number amounts.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Natural-number amount value.
pub type NatValue = u128;

/// Identity of an asset kind. Two amounts are comparable only when their
/// brands are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Brand(String);

impl Brand {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Brand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A quantity of a single brand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Amount {
    /// What the amount is of.
    pub brand: Brand,
    /// How much, in the brand's smallest unit.
    pub value: NatValue,
}

impl Amount {
    /// Make an amount of `brand`.
    pub fn make(brand: &Brand, value: NatValue) -> Self {
        Self {
            brand: brand.clone(),
            value,
        }
    }

    /// Raw value, without the brand.
    pub fn value(&self) -> NatValue {
        self.value
    }

    /// True for a zero amount.
    pub fn is_empty(&self) -> bool {
        self.value == 0
    }

    /// Check that this amount has the expected brand.
    pub fn coerce(&self, brand: &Brand) -> Result<&Self, AmountError> {
        if &self.brand == brand {
            Ok(self)
        } else {
            Err(AmountError::BrandMismatch {
                expected: brand.clone(),
                actual: self.brand.clone(),
            })
        }
    }

    /// `self >= other`, both of the same brand.
    pub fn is_gte(&self, other: &Amount) -> Result<bool, AmountError> {
        other.coerce(&self.brand)?;
        Ok(self.value >= other.value)
    }

    /// Sum of two amounts of the same brand.
    pub fn add(&self, other: &Amount) -> Result<Amount, AmountError> {
        other.coerce(&self.brand)?;
        let value = self
            .value
            .checked_add(other.value)
            .ok_or(AmountError::Overflow)?;
        Ok(Amount::make(&self.brand, value))
    }
}

/// Errors from amount arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("brand mismatch: expected {expected}, got {actual}")]
    BrandMismatch { expected: Brand, actual: Brand },

    #[error("amount arithmetic overflow")]
    Overflow,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_rejects_foreign_brand() {
        let atom = Brand::new("ATOM");
        let usd = Brand::new("USD");
        let amount = Amount::make(&atom, 5);

        assert!(amount.coerce(&atom).is_ok());
        assert_eq!(
            amount.coerce(&usd),
            Err(AmountError::BrandMismatch {
                expected: usd,
                actual: atom,
            })
        );
    }

    #[test]
    fn test_add_and_compare() {
        let usd = Brand::new("USD");
        let a = Amount::make(&usd, 7);
        let b = Amount::make(&usd, 3);

        assert_eq!(a.add(&b).unwrap().value(), 10);
        assert!(a.is_gte(&b).unwrap());
        assert!(!b.is_gte(&a).unwrap());
        assert_eq!(
            Amount::make(&usd, u128::MAX).add(&b),
            Err(AmountError::Overflow)
        );
    }

    #[test]
    fn test_brand_serializes_as_string() {
        let json = serde_json::to_string(&Brand::new("ATOM")).unwrap();
        assert_eq!(json, "\"ATOM\"");
    }
}
