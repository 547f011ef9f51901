//! Rate scaling and median selection on natural numbers.

use quote_oracle_types::NatValue;

use crate::error::{PriceAuthorityError, PriceAuthorityResult};

/// `floor(amount * numerator / denominator)`.
pub fn floor_scale(
    amount: NatValue,
    numerator: NatValue,
    denominator: NatValue,
) -> PriceAuthorityResult<NatValue> {
    if denominator == 0 {
        return Err(PriceAuthorityError::ZeroPrice);
    }
    let product = amount
        .checked_mul(numerator)
        .ok_or(PriceAuthorityError::Overflow)?;
    Ok(product / denominator)
}

/// `ceil(amount * numerator / denominator)`.
pub fn ceil_scale(
    amount: NatValue,
    numerator: NatValue,
    denominator: NatValue,
) -> PriceAuthorityResult<NatValue> {
    if denominator == 0 {
        return Err(PriceAuthorityError::ZeroPrice);
    }
    let product = amount
        .checked_mul(numerator)
        .ok_or(PriceAuthorityError::Overflow)?;
    Ok(product.div_ceil(denominator))
}

/// Median of the positive samples. Even counts take the floor of the mean
/// of the two central values. `None` when no sample is positive.
pub fn median(samples: impl IntoIterator<Item = NatValue>) -> Option<NatValue> {
    let mut valid: Vec<NatValue> = samples.into_iter().filter(|v| *v > 0).collect();
    if valid.is_empty() {
        return None;
    }
    valid.sort_unstable();

    let mid = valid.len() / 2;
    if valid.len() % 2 == 1 {
        return Some(valid[mid]);
    }
    let (a, b) = (valid[mid - 1], valid[mid]);
    // Split to stay clear of overflow near u128::MAX.
    Some(a / 2 + b / 2 + (a % 2 + b % 2) / 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_scaling_rounds_in_opposite_directions() {
        assert_eq!(floor_scale(10, 2, 3).unwrap(), 6);
        assert_eq!(ceil_scale(10, 2, 3).unwrap(), 7);
        assert_eq!(ceil_scale(9, 2, 3).unwrap(), 6);
        assert_eq!(floor_scale(1, 1, 0), Err(PriceAuthorityError::ZeroPrice));
        assert_eq!(
            floor_scale(u128::MAX, 2, 1),
            Err(PriceAuthorityError::Overflow)
        );
    }

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median([1030]), Some(1030));
        assert_eq!(median([1040, 1316]), Some(1178));
        assert_eq!(median([1060, 1332, 834]), Some(1060));
        assert_eq!(median([1, 2]), Some(1));
        assert_eq!(median([]), None);
    }

    #[test]
    fn test_median_skips_invalid_samples() {
        assert_eq!(median([0, 0]), None);
        assert_eq!(median([0, 900, 0, 1100]), Some(1000));
    }

    #[test]
    fn test_median_no_overflow() {
        assert_eq!(median([u128::MAX, u128::MAX]), Some(u128::MAX));
        assert_eq!(median([u128::MAX, u128::MAX - 1]), Some(u128::MAX - 1));
    }

    proptest! {
        #[test]
        fn prop_median_ignores_order(mut samples in prop::collection::vec(0u128..1_000_000, 1..12), seed in any::<u64>()) {
            let expected = median(samples.clone());
            // Deterministic shuffle driven by the seed.
            let len = samples.len();
            let mut state = seed;
            for i in (1..len).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let j = (state % (i as u64 + 1)) as usize;
                samples.swap(i, j);
            }
            prop_assert_eq!(median(samples), expected);
        }

        #[test]
        fn prop_wanted_input_buys_at_least_wanted_output(
            wanted in 1u128..1_000_000_000,
            rate_in in 1u128..1_000_000,
            rate_out in 1u128..1_000_000,
        ) {
            let pay = ceil_scale(wanted, rate_in, rate_out).unwrap();
            let received = floor_scale(pay, rate_out, rate_in).unwrap();
            prop_assert!(received >= wanted);
        }

        #[test]
        fn prop_given_output_never_costs_more_than_input(
            given in 1u128..1_000_000_000,
            rate_in in 1u128..1_000_000,
            rate_out in 1u128..1_000_000,
        ) {
            let out = floor_scale(given, rate_out, rate_in).unwrap();
            let cost = ceil_scale(out, rate_in, rate_out).unwrap();
            prop_assert!(cost <= given);
        }
    }
}
