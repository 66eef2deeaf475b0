//! Amount → factor calculation
//!
//! Factors 8 through 16 are bucket sums of amounts divided by amount 1 (the
//! divisor). Factors 17 through 29 carry their amounts through unchanged. The
//! bucket groupings are fixed business rules kept in [`FACTOR_BUCKETS`].

use crate::amount::{AmountSlots, FactorSlots};
use crate::error::ValidationError;
use rust_decimal::{Decimal, RoundingStrategy};

/// One divided factor: `factor = sum(amount[first..=last]) / amount[1]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub factor: usize,
    pub first: usize,
    pub last: usize,
}

const fn bucket(factor: usize, first: usize, last: usize) -> Bucket {
    Bucket { factor, first, last }
}

/// Amount groupings for factors 8..=16
pub const FACTOR_BUCKETS: [Bucket; 9] = [
    bucket(8, 8, 13),
    bucket(9, 14, 15),
    bucket(10, 16, 18),
    bucket(11, 19, 21),
    bucket(12, 22, 23),
    bucket(13, 24, 24),
    bucket(14, 25, 25),
    bucket(15, 26, 26),
    bucket(16, 27, 28),
];

/// Factors copied from the same-numbered amount without division
pub const PASS_THROUGH: std::ops::RangeInclusive<usize> = 17..=29;

/// Factors whose sum is bounded by one
pub const BOUNDED_FACTORS: std::ops::RangeInclusive<usize> = 8..=16;

/// Decimal places used when comparing the bounded sum against one
pub const SUM_SCALE: u32 = 4;

/// Derive the 29 factors from 29 amounts and validate the result
///
/// A zero divisor is a valid "no allocation" case: every factor is zero.
/// Amounts whose bucket sum or quotient leaves the decimal range are rejected
/// with [`ValidationError::AmountOverflow`].
pub fn compute(amounts: &AmountSlots) -> Result<FactorSlots, ValidationError> {
    let mut factors = FactorSlots::zero();

    let divisor = amounts.get(1);
    if divisor.is_zero() {
        return Ok(factors);
    }

    for bucket in FACTOR_BUCKETS.iter() {
        let overflow = ValidationError::AmountOverflow {
            factor: bucket.factor,
        };
        let numerator = amounts
            .checked_sum(bucket.first, bucket.last)
            .ok_or_else(|| overflow.clone())?;
        let quotient = numerator.checked_div(divisor).ok_or(overflow)?;
        factors.set(bucket.factor, quotient);
    }

    for index in PASS_THROUGH {
        factors.set(index, amounts.get(index));
    }

    validate_factor_sum(&factors)?;
    Ok(factors)
}

/// Check that factors 8..=16 sum to at most one after rounding to 4 places
///
/// Returns the rounded sum on success.
pub fn validate_factor_sum(factors: &FactorSlots) -> Result<Decimal, ValidationError> {
    let sum = bounded_sum(factors)?;
    if sum > Decimal::ONE {
        return Err(ValidationError::FactorSumExceeded { sum });
    }
    Ok(sum)
}

/// Sum of factors 8..=16 rounded half-to-even to [`SUM_SCALE`] places
pub fn bounded_sum(factors: &FactorSlots) -> Result<Decimal, ValidationError> {
    factors
        .checked_sum(*BOUNDED_FACTORS.start(), *BOUNDED_FACTORS.end())
        .map(|sum| sum.round_dp_with_strategy(SUM_SCALE, RoundingStrategy::MidpointNearestEven))
        .ok_or(ValidationError::FactorSumOverflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Slots;
    use std::str::FromStr;

    fn dec(text: &str) -> Decimal {
        Decimal::from_str(text).unwrap()
    }

    fn amounts(pairs: &[(usize, &str)]) -> AmountSlots {
        let mut slots = Slots::zero();
        for (index, value) in pairs {
            slots.set(*index, dec(value));
        }
        slots
    }

    #[test]
    fn test_buckets_cover_amounts_8_to_28_once() {
        let mut covered = Vec::new();
        for bucket in FACTOR_BUCKETS.iter() {
            assert!(bucket.first <= bucket.last);
            covered.extend(bucket.first..=bucket.last);
        }
        assert_eq!(covered, (8..=28).collect::<Vec<_>>());

        let factors: Vec<usize> = FACTOR_BUCKETS.iter().map(|b| b.factor).collect();
        assert_eq!(factors, BOUNDED_FACTORS.collect::<Vec<_>>());
    }

    #[test]
    fn test_bucket_division() {
        let input = amounts(&[
            (1, "1000"),
            (8, "10"),
            (13, "20"),
            (14, "30"),
            (18, "40"),
            (21, "50"),
            (22, "60"),
            (24, "70"),
            (25, "80"),
            (26, "90"),
            (28, "100"),
        ]);
        let factors = compute(&input).unwrap();

        assert_eq!(factors.get(8), dec("0.03"));
        assert_eq!(factors.get(9), dec("0.03"));
        assert_eq!(factors.get(10), dec("0.04"));
        assert_eq!(factors.get(11), dec("0.05"));
        assert_eq!(factors.get(12), dec("0.06"));
        assert_eq!(factors.get(13), dec("0.07"));
        assert_eq!(factors.get(14), dec("0.08"));
        assert_eq!(factors.get(15), dec("0.09"));
        assert_eq!(factors.get(16), dec("0.1"));
    }

    #[test]
    fn test_pass_through_factors_are_not_divided() {
        let input = amounts(&[(1, "4"), (17, "1"), (18, "2"), (29, "123.45")]);
        let factors = compute(&input).unwrap();

        assert_eq!(factors.get(17), dec("1"));
        assert_eq!(factors.get(18), dec("2"));
        assert_eq!(factors.get(29), dec("123.45"));
        // amounts 17 and 18 also feed bucket 10
        assert_eq!(factors.get(10), dec("0.75"));
    }

    #[test]
    fn test_factors_below_eight_stay_zero() {
        let input = amounts(&[(1, "10"), (2, "5"), (7, "3")]);
        let factors = compute(&input).unwrap();
        for index in 1..=7 {
            assert_eq!(factors.get(index), Decimal::ZERO);
        }
    }

    #[test]
    fn test_zero_divisor_yields_all_zero() {
        let input = amounts(&[(1, "0"), (8, "999"), (20, "5"), (29, "1")]);
        let factors = compute(&input).unwrap();
        assert_eq!(factors, Slots::zero());
    }

    #[test]
    fn test_sum_exceeding_one_is_rejected() {
        let input = amounts(&[(1, "100"), (8, "50"), (9, "60")]);
        let err = compute(&input).unwrap_err();
        assert_eq!(err, ValidationError::FactorSumExceeded { sum: dec("1.1") });
    }

    #[test]
    fn test_sum_exactly_one_is_accepted() {
        let input = amounts(&[(1, "100"), (8, "40"), (27, "60")]);
        let factors = compute(&input).unwrap();
        assert_eq!(bounded_sum(&factors).unwrap(), Decimal::ONE);
    }

    #[test]
    fn test_sum_within_rounding_tolerance_is_accepted() {
        // 1.00004 rounds to 1.0000
        let mut factors = Slots::zero();
        factors.set(8, dec("0.50004"));
        factors.set(16, dec("0.5"));
        assert_eq!(validate_factor_sum(&factors).unwrap(), Decimal::ONE);

        // 1.00006 rounds to 1.0001
        factors.set(8, dec("0.50006"));
        assert!(validate_factor_sum(&factors).is_err());
    }

    #[test]
    fn test_quotient_out_of_range_is_rejected() {
        let input = amounts(&[
            (1, "0.0000000000000000000000000001"),
            (8, "79228162514264337593543950335"),
        ]);
        assert_eq!(
            compute(&input).unwrap_err(),
            ValidationError::AmountOverflow { factor: 8 }
        );
    }

    #[test]
    fn test_bucket_sum_out_of_range_is_rejected() {
        let input = amounts(&[
            (1, "1"),
            (25, "1"),
            (27, "79228162514264337593543950335"),
            (28, "79228162514264337593543950335"),
        ]);
        assert_eq!(
            compute(&input).unwrap_err(),
            ValidationError::AmountOverflow { factor: 16 }
        );
    }

    #[test]
    fn test_factor_sum_out_of_range_is_rejected() {
        let mut factors = Slots::zero();
        factors.set(8, Decimal::MAX);
        factors.set(9, Decimal::MAX);
        assert_eq!(
            validate_factor_sum(&factors).unwrap_err(),
            ValidationError::FactorSumOverflow
        );
    }

    #[test]
    fn test_repeating_division_is_deterministic() {
        let input = amounts(&[(1, "3"), (8, "1"), (14, "1")]);
        let first = compute(&input).unwrap();
        let second = compute(&input).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_array(), second.as_array());
    }
}
