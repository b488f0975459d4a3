//! IEEE-754 binary64 arithmetic in all four rounding directions
//!
//! The host FPU only rounds to nearest here, so directed rounding is derived
//! from the round-to-nearest result plus the exact sign of its error. The
//! error comes from TwoSum for addition and from a fused multiply-add
//! residual for multiplication, division and square root. Those errors are
//! exact only while the result and the residual stay normal; subnormal or
//! underflowing results may round the wrong way in a directed mode.
//!
//! RandomX operands stay clear of that region: group F starts from 32-bit
//! integers and adds group A values in [1, 2^32), and group E keeps its
//! exponent between 2^-255 and 2^1 on every load, so in practice results
//! and residuals stay in the normal range.

use serde::{Deserialize, Serialize};

/// Rounding direction selected by CFROUND
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RoundingMode {
    #[default]
    NearestEven = 0,
    TowardNegative = 1,
    TowardPositive = 2,
    TowardZero = 3,
}

impl From<u8> for RoundingMode {
    fn from(val: u8) -> Self {
        match val & 3 {
            0 => RoundingMode::NearestEven,
            1 => RoundingMode::TowardNegative,
            2 => RoundingMode::TowardPositive,
            _ => RoundingMode::TowardZero,
        }
    }
}

/// Soft-float wrapper over IEEE-754 bits
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SoftFloat(f64);

impl SoftFloat {
    pub fn from_bits(bits: u64) -> Self {
        Self(f64::from_bits(bits))
    }

    pub fn from_i32(value: i32) -> Self {
        Self(value as f64)
    }

    pub fn to_bits(self) -> u64 {
        self.0.to_bits()
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn add(self, other: Self, rm: RoundingMode) -> Self {
        let (a, b) = (self.0, other.0);
        let sum = a + b;
        if !sum.is_finite() {
            return Self(overflow(sum, a.is_finite() && b.is_finite(), rm));
        }
        // TwoSum
        let bb = sum - a;
        let err = (a - (sum - bb)) + (b - bb);
        if sum == 0.0 && err == 0.0 && a.to_bits() != b.to_bits() {
            // exact zero from opposite signs: -0 only when rounding down
            return Self(if rm == RoundingMode::TowardNegative { -0.0 } else { 0.0 });
        }
        Self(adjust(sum, err.partial_cmp(&0.0), rm))
    }

    pub fn sub(self, other: Self, rm: RoundingMode) -> Self {
        self.add(other.neg(), rm)
    }

    pub fn mul(self, other: Self, rm: RoundingMode) -> Self {
        let (a, b) = (self.0, other.0);
        let product = a * b;
        if !product.is_finite() {
            return Self(overflow(product, a.is_finite() && b.is_finite(), rm));
        }
        let err = a.mul_add(b, -product);
        Self(adjust(product, err.partial_cmp(&0.0), rm))
    }

    pub fn div(self, other: Self, rm: RoundingMode) -> Self {
        let (a, b) = (self.0, other.0);
        let quotient = a / b;
        if !quotient.is_finite() {
            let overflowed = a.is_finite() && b.is_finite() && b != 0.0;
            return Self(overflow(quotient, overflowed, rm));
        }
        if quotient == 0.0 || b.is_infinite() {
            return Self(quotient);
        }
        // a - q*b is exact; the true quotient lies above q when it has b's sign
        let remainder = (-quotient).mul_add(b, a);
        let direction = if b > 0.0 {
            remainder.partial_cmp(&0.0)
        } else {
            remainder.partial_cmp(&0.0).map(|o| o.reverse())
        };
        Self(adjust(quotient, direction, rm))
    }

    pub fn sqrt(self, rm: RoundingMode) -> Self {
        let a = self.0;
        let root = a.sqrt();
        if !root.is_finite() || root == 0.0 {
            return Self(root);
        }
        let remainder = (-root).mul_add(root, a);
        Self(adjust(root, remainder.partial_cmp(&0.0), rm))
    }

    pub fn neg(self) -> Self {
        Self(-self.0)
    }
}

/// Move a round-to-nearest result one ulp when the exact value lies on the
/// wrong side of it for the requested direction.
fn adjust(rounded: f64, exact_vs_rounded: Option<core::cmp::Ordering>, rm: RoundingMode) -> f64 {
    use core::cmp::Ordering::*;
    let Some(order) = exact_vs_rounded else {
        return rounded;
    };
    match (rm, order) {
        (RoundingMode::NearestEven, _) | (_, Equal) => rounded,
        (RoundingMode::TowardNegative, Less) => next_down(rounded),
        (RoundingMode::TowardPositive, Greater) => next_up(rounded),
        (RoundingMode::TowardZero, Less) if rounded > 0.0 => next_down(rounded),
        (RoundingMode::TowardZero, Greater) if rounded < 0.0 => next_up(rounded),
        _ => rounded,
    }
}

/// Result for an infinite round-to-nearest outcome. Overflow from finite
/// operands saturates to the largest finite value unless the direction
/// points away from zero.
fn overflow(result: f64, from_finite: bool, rm: RoundingMode) -> f64 {
    if !from_finite || result.is_nan() {
        return result;
    }
    let positive = result > 0.0;
    match rm {
        RoundingMode::NearestEven => result,
        RoundingMode::TowardZero => f64::MAX.copysign(result),
        RoundingMode::TowardPositive if !positive => -f64::MAX,
        RoundingMode::TowardNegative if positive => f64::MAX,
        _ => result,
    }
}

/// Smallest representable value above a finite `x`
pub fn next_up(x: f64) -> f64 {
    if x == 0.0 {
        return f64::from_bits(1);
    }
    let bits = x.to_bits();
    if x > 0.0 {
        f64::from_bits(bits + 1)
    } else {
        f64::from_bits(bits - 1)
    }
}

/// Largest representable value below a finite `x`
pub fn next_down(x: f64) -> f64 {
    -next_up(-x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MODES: [RoundingMode; 4] = [
        RoundingMode::NearestEven,
        RoundingMode::TowardNegative,
        RoundingMode::TowardPositive,
        RoundingMode::TowardZero,
    ];

    fn sf(x: f64) -> SoftFloat {
        SoftFloat(x)
    }

    #[test]
    fn mode_from_bits() {
        assert_eq!(RoundingMode::from(1), RoundingMode::TowardNegative);
        assert_eq!(RoundingMode::from(2), RoundingMode::TowardPositive);
        assert_eq!(RoundingMode::from(7), RoundingMode::TowardZero);
    }

    #[test]
    fn add_rounds_in_each_direction() {
        let tiny = 2f64.powi(-60);
        let one = sf(1.0);
        assert_eq!(one.add(sf(tiny), RoundingMode::NearestEven).value(), 1.0);
        assert_eq!(one.add(sf(tiny), RoundingMode::TowardNegative).value(), 1.0);
        assert_eq!(one.add(sf(tiny), RoundingMode::TowardPositive).value(), next_up(1.0));
        assert_eq!(one.add(sf(tiny), RoundingMode::TowardZero).value(), 1.0);

        let minus = sf(-1.0);
        assert_eq!(minus.sub(sf(tiny), RoundingMode::TowardNegative).value(), next_down(-1.0));
        assert_eq!(minus.sub(sf(tiny), RoundingMode::TowardZero).value(), -1.0);
        assert_eq!(minus.sub(sf(tiny), RoundingMode::TowardPositive).value(), -1.0);
    }

    #[test]
    fn exact_zero_sign() {
        let x = sf(3.25);
        let down = x.sub(x, RoundingMode::TowardNegative).value();
        assert_eq!(down.to_bits(), (-0.0f64).to_bits());
        let near = x.sub(x, RoundingMode::NearestEven).value();
        assert_eq!(near.to_bits(), 0.0f64.to_bits());
        let neg_zero = sf(-0.0).add(sf(-0.0), RoundingMode::TowardPositive).value();
        assert_eq!(neg_zero.to_bits(), (-0.0f64).to_bits());
    }

    #[test]
    fn division_and_sqrt_bracket() {
        let third_down = sf(1.0).div(sf(3.0), RoundingMode::TowardNegative).value();
        let third_up = sf(1.0).div(sf(3.0), RoundingMode::TowardPositive).value();
        assert_eq!(next_up(third_down), third_up);
        assert!(third_down < 1.0 / 3.0 || third_up > 1.0 / 3.0);

        let neg_third = sf(1.0).div(sf(-3.0), RoundingMode::TowardZero).value();
        assert_eq!(neg_third, -third_down);

        let root_down = sf(2.0).sqrt(RoundingMode::TowardNegative).value();
        let root_up = sf(2.0).sqrt(RoundingMode::TowardPositive).value();
        assert_eq!(next_up(root_down), root_up);
        assert_eq!(sf(4.0).sqrt(RoundingMode::TowardPositive).value(), 2.0);
    }

    #[test]
    fn overflow_saturates_toward_zero() {
        let big = sf(f64::MAX);
        assert_eq!(big.mul(sf(2.0), RoundingMode::TowardZero).value(), f64::MAX);
        assert_eq!(big.mul(sf(2.0), RoundingMode::TowardNegative).value(), f64::MAX);
        assert_eq!(big.mul(sf(2.0), RoundingMode::TowardPositive).value(), f64::INFINITY);
        assert_eq!(big.mul(sf(-2.0), RoundingMode::TowardPositive).value(), -f64::MAX);
        assert_eq!(big.add(big, RoundingMode::NearestEven).value(), f64::INFINITY);
    }

    proptest! {
        #[test]
        fn directed_results_bracket_nearest(
            a in -1.0e12f64..1.0e12,
            b in -1.0e12f64..1.0e12,
        ) {
            prop_assume!(b != 0.0);
            let (x, y) = (sf(a), sf(b));
            for op in 0..3 {
                let run = |rm: RoundingMode| match op {
                    0 => x.add(y, rm),
                    1 => x.mul(y, rm),
                    _ => x.div(y, rm),
                }.value();
                let near = run(RoundingMode::NearestEven);
                let down = run(RoundingMode::TowardNegative);
                let up = run(RoundingMode::TowardPositive);
                let zero = run(RoundingMode::TowardZero);
                prop_assert!(down <= near && near <= up);
                prop_assert!(down == up || next_up(down) == up);
                prop_assert!(near == down || near == up);
                prop_assert_eq!(zero, if near >= 0.0 { down } else { up });
            }
        }

        #[test]
        fn exact_results_ignore_mode(a in -1_000_000i32..1_000_000, b in -1_000_000i32..1_000_000) {
            for rm in MODES {
                let sum = SoftFloat::from_i32(a).add(SoftFloat::from_i32(b), rm).value();
                prop_assert_eq!(sum, (a as i64 + b as i64) as f64);
                let product = SoftFloat::from_i32(a).mul(SoftFloat::from_i32(b), rm).value();
                prop_assert_eq!(product, (a as i64 * b as i64) as f64);
            }
        }
    }
}
