//! Simulation time
//!
//! Event-chain runs add millions of small increments to a clock that keeps
//! growing. A plain `f64` loses the precision of those increments as the
//! magnitude of the clock grows. [`Time`] splits the value into the quotient
//! and the remainder of an integer division by one, so the remainder (where
//! the increments land) keeps a constant precision for the whole run.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// Split-precision simulation time.
///
/// Invariant for finite values: `0 <= remainder < 1`.
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct Time {
    quotient: f64,
    remainder: f64,
}

/// `divmod(value, 1.0)` with the rounding rules of a floored float division.
#[inline]
fn divmod_one(value: f64) -> (f64, f64) {
    let mut remainder = value % 1.0;
    if remainder != 0.0 {
        if remainder < 0.0 {
            remainder += 1.0;
        }
    } else {
        remainder = 0.0;
    }
    let division = value - remainder;
    let mut quotient = division.floor();
    if division - quotient > 0.5 {
        quotient += 1.0;
    }
    // Rounding of `remainder + 1.0` above may land exactly on one.
    if remainder >= 1.0 {
        return (quotient + 1.0, 0.0);
    }
    (quotient, remainder)
}

impl Time {
    pub const ZERO: Time = Time {
        quotient: 0.0,
        remainder: 0.0,
    };
    pub const INF: Time = Time {
        quotient: f64::INFINITY,
        remainder: f64::INFINITY,
    };
    pub const NEG_INF: Time = Time {
        quotient: f64::NEG_INFINITY,
        remainder: f64::NEG_INFINITY,
    };

    /// Create a time from an already split quotient and remainder.
    #[inline]
    pub fn new(quotient: f64, remainder: f64) -> Self {
        Time {
            quotient,
            remainder,
        }
    }

    #[inline]
    pub fn from_float(time: f64) -> Self {
        if time.is_infinite() {
            return Time::new(time, time);
        }
        let (quotient, remainder) = divmod_one(time);
        Time::new(quotient, remainder)
    }

    #[inline]
    pub fn quotient(self) -> f64 {
        self.quotient
    }

    #[inline]
    pub fn remainder(self) -> f64 {
        self.remainder
    }

    #[inline]
    pub fn to_float(self) -> f64 {
        if self.quotient.is_infinite() {
            return self.quotient;
        }
        self.quotient + self.remainder
    }

    #[inline]
    pub fn is_finite(self) -> bool {
        self.quotient.is_finite()
    }
}

impl Default for Time {
    fn default() -> Self {
        Time::ZERO
    }
}

impl Add<f64> for Time {
    type Output = Time;

    #[inline]
    fn add(self, rhs: f64) -> Self::Output {
        if rhs.is_infinite() {
            return Time::new(rhs, rhs);
        }
        let (carry, remainder) = divmod_one(self.remainder + rhs);
        Time::new(self.quotient + carry, remainder)
    }
}

impl Sub<Time> for Time {
    type Output = f64;

    #[inline]
    fn sub(self, rhs: Time) -> Self::Output {
        self.quotient - rhs.quotient + self.remainder - rhs.remainder
    }
}

impl PartialEq for Time {
    fn eq(&self, other: &Self) -> bool {
        self.quotient == other.quotient && self.remainder == other.remainder
    }
}

// NaN is never constructed, so the lexicographic order is total.
impl Eq for Time {}

impl PartialOrd for Time {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Time {
    fn cmp(&self, other: &Self) -> Ordering {
        self.quotient
            .total_cmp(&other.quotient)
            .then_with(|| self.remainder.total_cmp(&other.remainder))
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time({}, {})", self.quotient, self.remainder)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_float())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_add_matches_from_float() {
        let time = Time::new(0.0, 0.0) + 1.6;
        assert_eq!(time, Time::from_float(1.6));
        assert_eq!(time.quotient(), 1.0);
    }

    #[test]
    fn test_float_roundtrip() {
        for value in [0.0, 0.25, 1.6, 3.75, 12345.125, 0.1] {
            assert_eq!(Time::from_float(value).to_float(), value);
        }
    }

    #[test]
    fn test_negative_from_float() {
        let time = Time::from_float(-0.25);
        assert_eq!(time.quotient(), -1.0);
        assert_eq!(time.remainder(), 0.75);
    }

    #[test]
    fn test_infinity() {
        assert_eq!(Time::from_float(f64::INFINITY), Time::INF);
        assert_eq!(Time::from_float(2.5) + f64::INFINITY, Time::INF);
        assert!(Time::from_float(1e300) < Time::INF);
        assert!(Time::NEG_INF < Time::ZERO);
        assert!(!Time::INF.is_finite());
    }

    #[test]
    fn test_subtraction() {
        let a = Time::from_float(5.75);
        let b = Time::from_float(2.5);
        assert_eq!(a - b, 3.25);
        assert_eq!(b - a, -3.25);
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let a = Time::new(1.0, 0.9);
        let b = Time::new(2.0, 0.1);
        assert!(a < b);
        assert!(Time::new(2.0, 0.1) < Time::new(2.0, 0.2));
        assert_eq!(a.max(b), b);
    }

    #[test]
    fn test_carry_keeps_remainder_bounded() {
        let mut time = Time::ZERO;
        for _ in 0..1000 {
            time = time + 0.37;
            assert!(time.remainder() >= 0.0 && time.remainder() < 1.0);
        }
        assert!((time.to_float() - 370.0).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn prop_remainder_in_unit_interval(start in 0.0f64..1e6, step in 0.0f64..1e3) {
            let time = Time::from_float(start) + step;
            prop_assert!(time.remainder() >= 0.0);
            prop_assert!(time.remainder() < 1.0);
        }

        #[test]
        fn prop_addition_is_monotonic(start in 0.0f64..1e6, step in 0.0f64..1e3) {
            let time = Time::from_float(start);
            prop_assert!(time + step >= time);
        }

        #[test]
        fn prop_difference_recovers_step(start in 0.0f64..1e3, step in 0.0f64..1e2) {
            let time = Time::from_float(start);
            prop_assert!(((time + step) - time - step).abs() < 1e-9);
        }
    }
}
