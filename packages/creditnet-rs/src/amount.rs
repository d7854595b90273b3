//! Fixed-precision decimal amounts.
//!
//! Amounts cross every boundary (JSON payloads, SQL, events) as canonical
//! strings and are only ever manipulated as `BigDecimal` in between.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

use bigdecimal::{BigDecimal, Signed, Zero};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::GeoError;

/// A decimal amount in some equivalent.
///
/// The canonical string form strips all trailing fractional zeros; integral
/// values serialize without a decimal point ("50.00" -> "50", "0.50" -> "0.5").
/// Two amounts are equal iff they are numerically equal.
#[derive(Debug, Clone)]
pub struct Amount(BigDecimal);

impl Amount {
    pub fn zero() -> Self {
        Amount(BigDecimal::zero())
    }

    /// Parse a decimal string. Accepts an optional leading minus, digits, and
    /// at most one fractional part; anything else (exponents, whitespace,
    /// thousands separators) is rejected.
    pub fn parse(s: &str) -> Result<Self, GeoError> {
        let digits = s.strip_prefix('-').unwrap_or(s);
        if digits.is_empty() {
            return Err(GeoError::Validation(format!("empty amount: {s:?}")));
        }
        let mut parts = digits.splitn(2, '.');
        let int_part = parts.next().unwrap_or("");
        let frac_part = parts.next();
        if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(GeoError::Validation(format!("malformed amount: {s:?}")));
        }
        if let Some(frac) = frac_part {
            if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return Err(GeoError::Validation(format!("malformed amount: {s:?}")));
            }
        }
        let value = BigDecimal::from_str(s)
            .map_err(|e| GeoError::Validation(format!("malformed amount {s:?}: {e}")))?;
        Ok(Amount(value))
    }

    pub fn from_bigdecimal(value: BigDecimal) -> Self {
        Amount(value)
    }

    pub fn as_bigdecimal(&self) -> &BigDecimal {
        &self.0
    }

    /// Canonical string form: normalized, plain notation.
    pub fn canonical(&self) -> String {
        if self.0.is_zero() {
            return "0".to_string();
        }
        self.0.normalized().to_string()
    }

    /// Number of significant fractional digits.
    pub fn scale(&self) -> u32 {
        let n = self.0.normalized().fractional_digit_count();
        if n < 0 {
            0
        } else {
            n as u32
        }
    }

    /// Reject amounts with more fractional digits than the equivalent allows.
    pub fn check_precision(&self, precision: u32) -> Result<(), GeoError> {
        if self.scale() > precision {
            return Err(GeoError::Validation(format!(
                "amount {} exceeds precision {} of the equivalent",
                self.canonical(),
                precision
            )));
        }
        Ok(())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.0.is_positive()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_negative()
    }

    pub fn min(self, other: Amount) -> Amount {
        if self.0 <= other.0 {
            self
        } else {
            other
        }
    }
}

impl PartialEq for Amount {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Amount {}

impl PartialOrd for Amount {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Amount {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add for Amount {
    type Output = Amount;
    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl<'a> Add<&'a Amount> for &'a Amount {
    type Output = Amount;
    fn add(self, rhs: &'a Amount) -> Amount {
        Amount(&self.0 + &rhs.0)
    }
}

impl Sub for Amount {
    type Output = Amount;
    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl<'a> Sub<&'a Amount> for &'a Amount {
    type Output = Amount;
    fn sub(self, rhs: &'a Amount) -> Amount {
        Amount(&self.0 - &rhs.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

impl FromStr for Amount {
    type Err = GeoError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::parse(s)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Amount::parse(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_canonical_strips_trailing_zeros() {
        assert_eq!(Amount::parse("50.00").unwrap().canonical(), "50");
        assert_eq!(Amount::parse("0.50").unwrap().canonical(), "0.5");
        assert_eq!(Amount::parse("50.25").unwrap().canonical(), "50.25");
        assert_eq!(Amount::parse("0").unwrap().canonical(), "0");
        assert_eq!(Amount::parse("0.000").unwrap().canonical(), "0");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Amount::parse("").is_err());
        assert!(Amount::parse(".5").is_err());
        assert!(Amount::parse("5.").is_err());
        assert!(Amount::parse("1e3").is_err());
        assert!(Amount::parse(" 1").is_err());
        assert!(Amount::parse("1_000").is_err());
        assert!(Amount::parse("--1").is_err());
    }

    #[test]
    fn test_equality_is_numeric() {
        assert_eq!(
            Amount::parse("50.00").unwrap(),
            Amount::parse("50").unwrap()
        );
        assert_ne!(
            Amount::parse("50.01").unwrap(),
            Amount::parse("50").unwrap()
        );
    }

    #[test]
    fn test_precision_check() {
        let a = Amount::parse("1.25").unwrap();
        assert!(a.check_precision(2).is_ok());
        assert!(a.check_precision(1).is_err());
        // Trailing zeros do not count against precision
        let b = Amount::parse("1.2500").unwrap();
        assert!(b.check_precision(2).is_ok());
    }

    #[test]
    fn test_arithmetic() {
        let a = Amount::parse("70").unwrap();
        let b = Amount::parse("30.5").unwrap();
        assert_eq!((&a - &b).canonical(), "39.5");
        assert_eq!((&a + &b).canonical(), "100.5");
        assert!((&b - &a).is_negative());
    }

    proptest! {
        #[test]
        fn prop_canonical_roundtrip(int in 0u64..1_000_000_000, frac in 0u32..1_000_000) {
            let s = format!("{int}.{frac:06}");
            let a = Amount::parse(&s).unwrap();
            let reparsed = Amount::parse(&a.canonical()).unwrap();
            prop_assert_eq!(a, reparsed);
        }

        #[test]
        fn prop_canonical_equal_iff_numerically_equal(int in 0u64..1_000_000, zeros in 0usize..6) {
            let padded = format!("{int}.{}", "0".repeat(zeros + 1));
            let plain = format!("{int}");
            let a = Amount::parse(&padded).unwrap();
            let b = Amount::parse(&plain).unwrap();
            prop_assert_eq!(a.canonical(), b.canonical());
        }
    }
}
