use crate::error::{AlignError, AlignResult};
use num_rational::Ratio;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::str::FromStr;

/// Largest denominator `Fraction::closest` will produce. Covers nested tuplets
/// down to 1/1024 of a whole note.
pub const QUANTIZE_MAX_DENOMINATOR: i64 = 1024;

/// Distance below which a convergent is accepted as the notated value.
const QUANTIZE_EPSILON: f64 = 1e-6;

/// An exact musical time, in whole notes.
///
/// Always held in lowest terms with a positive denominator, so the derived
/// equality and hashing agree with numeric equality. Ordering compares by
/// cross-multiplication and never goes through floating point.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(into = "String", try_from = "String")]
pub struct Fraction(Ratio<i64>);

impl Fraction {
    pub fn new(numerator: i64, denominator: i64) -> AlignResult<Self> {
        if denominator == 0 {
            return Err(AlignError::InvalidFraction(format!(
                "{}/{}",
                numerator, denominator
            )));
        }

        Ok(Fraction(Ratio::new(numerator, denominator)))
    }

    pub fn zero() -> Self {
        Fraction(Ratio::from_integer(0))
    }

    pub fn from_integer(value: i64) -> Self {
        Fraction(Ratio::from_integer(value))
    }

    pub fn numerator(&self) -> i64 {
        *self.0.numer()
    }

    pub fn denominator(&self) -> i64 {
        *self.0.denom()
    }

    pub fn is_zero(&self) -> bool {
        self.numerator() == 0
    }

    pub fn to_f64(&self) -> f64 {
        self.numerator() as f64 / self.denominator() as f64
    }

    /// Closest rational approximation of a float produced by the engraving
    /// toolkit, using continued-fraction convergents bounded by
    /// [`QUANTIZE_MAX_DENOMINATOR`]. The same input always yields the same
    /// fraction.
    pub fn closest(value: f64) -> AlignResult<Self> {
        if !value.is_finite() {
            return Err(AlignError::InvalidFraction(value.to_string()));
        }

        let negative = value < 0.0;
        let target = value.abs();

        // (h, k) convergents, seeded with h[-2]/k[-2] = 0/1 and h[-1]/k[-1] = 1/0
        let (mut h_prev, mut h) = (0i64, 1i64);
        let (mut k_prev, mut k) = (1i64, 0i64);
        let mut remainder = target;

        loop {
            let whole = remainder.floor();
            if whole >= i64::MAX as f64 {
                break;
            }
            let whole = whole as i64;

            let next_h = whole.checked_mul(h).and_then(|v| v.checked_add(h_prev));
            let next_k = whole.checked_mul(k).and_then(|v| v.checked_add(k_prev));
            let (Some(next_h), Some(next_k)) = (next_h, next_k) else {
                break;
            };

            if next_k > QUANTIZE_MAX_DENOMINATOR {
                break;
            }

            (h_prev, h) = (h, next_h);
            (k_prev, k) = (k, next_k);

            if (h as f64 / k as f64 - target).abs() < QUANTIZE_EPSILON {
                break;
            }

            let fractional = remainder - whole as f64;
            if fractional < f64::EPSILON {
                break;
            }
            remainder = 1.0 / fractional;
        }

        if k == 0 {
            return Err(AlignError::InvalidFraction(value.to_string()));
        }

        let numerator = if negative { -h } else { h };
        Fraction::new(numerator, k)
    }
}

impl Default for Fraction {
    fn default() -> Self {
        Fraction::zero()
    }
}

impl Add for Fraction {
    type Output = Fraction;

    fn add(self, rhs: Fraction) -> Fraction {
        Fraction(self.0 + rhs.0)
    }
}

impl AddAssign for Fraction {
    fn add_assign(&mut self, rhs: Fraction) {
        self.0 += rhs.0;
    }
}

impl Sub for Fraction {
    type Output = Fraction;

    fn sub(self, rhs: Fraction) -> Fraction {
        Fraction(self.0 - rhs.0)
    }
}

impl SubAssign for Fraction {
    fn sub_assign(&mut self, rhs: Fraction) {
        self.0 -= rhs.0;
    }
}

impl Neg for Fraction {
    type Output = Fraction;

    fn neg(self) -> Fraction {
        Fraction(-self.0)
    }
}

/// Always `num/den`, including whole numbers (`2/1`) and zero (`0/1`).
impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator(), self.denominator())
    }
}

impl From<Fraction> for String {
    fn from(value: Fraction) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Fraction {
    type Error = AlignError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Accepts `num/den` or a bare integer, with surrounding whitespace.
impl FromStr for Fraction {
    type Err = AlignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AlignError::InvalidFraction(s.to_string());
        let trimmed = s.trim();

        match trimmed.split_once('/') {
            Some((num, den)) => {
                let num = num.trim().parse::<i64>().map_err(|_| invalid())?;
                let den = den.trim().parse::<i64>().map_err(|_| invalid())?;
                Fraction::new(num, den).map_err(|_| invalid())
            }
            None => trimmed
                .parse::<i64>()
                .map(Fraction::from_integer)
                .map_err(|_| invalid()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn frac(n: i64, d: i64) -> Fraction {
        Fraction::new(n, d).unwrap()
    }

    #[test]
    fn sums_are_reduced_with_positive_denominator() {
        let pairs = [((1, 4), (1, 4)), ((1, 6), (1, 3)), ((3, -8), (1, 8)), ((-1, -2), (1, 2))];

        for ((n1, d1), (n2, d2)) in pairs {
            let a = frac(n1, d1);
            let b = frac(n2, d2);
            let sum = a + b;

            assert!(sum.denominator() > 0);
            let gcd = {
                let (mut x, mut y) = (sum.numerator().abs(), sum.denominator());
                while y != 0 {
                    (x, y) = (y, x % y);
                }
                x
            };
            assert!(sum.is_zero() || gcd == 1, "{} not reduced", sum);
            assert_eq!(sum - b, a);
        }
    }

    #[test]
    fn zero_denominator_is_rejected() {
        assert!(Fraction::new(3, 0).is_err());
        assert!("3/0".parse::<Fraction>().is_err());
    }

    #[test]
    fn ordering_is_exact() {
        assert!(frac(1, 3) < frac(334, 1000));
        assert!(frac(2, 6) == frac(1, 3));
        assert!(frac(-1, 2) < Fraction::zero());
    }

    #[test]
    fn parse_and_display() {
        assert_eq!("3/4".parse::<Fraction>().unwrap(), frac(3, 4));
        assert_eq!(" 6/8 ".parse::<Fraction>().unwrap(), frac(3, 4));
        assert_eq!("2".parse::<Fraction>().unwrap(), frac(2, 1));
        assert!("three/4".parse::<Fraction>().is_err());

        assert_eq!(frac(4, 2).to_string(), "2/1");
        assert_eq!(Fraction::zero().to_string(), "0/1");
        assert_eq!(frac(1, -4).to_string(), "-1/4");
    }

    #[test]
    fn closest_recovers_notated_values() {
        assert_eq!(Fraction::closest(0.25).unwrap(), frac(1, 4));
        assert_eq!(Fraction::closest(1.0 / 3.0).unwrap(), frac(1, 3));
        assert_eq!(Fraction::closest(0.333_333_34_f32 as f64).unwrap(), frac(1, 3));
        assert_eq!(Fraction::closest(2.0 / 12.0).unwrap(), frac(1, 6));
        assert_eq!(Fraction::closest(0.0).unwrap(), Fraction::zero());
        assert_eq!(Fraction::closest(-0.75).unwrap(), frac(-3, 4));
        assert_eq!(Fraction::closest(3.5).unwrap(), frac(7, 2));
        assert!(Fraction::closest(f64::NAN).is_err());
    }

    #[test]
    fn closest_is_deterministic() {
        let raw = 0.1428571_f32 as f64;
        assert_eq!(Fraction::closest(raw).unwrap(), Fraction::closest(raw).unwrap());
        assert_eq!(Fraction::closest(raw).unwrap(), frac(1, 7));
    }
}
