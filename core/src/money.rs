//! Fixed-point monetary amounts and ISO-4217 currency codes.
//!
//! Every amount is held at scale 4 (10 000 minor units per major unit).
//! Arithmetic that can produce more digits (interest, valuation) rounds with
//! banker's rounding back to scale 4. Amounts never pass through `f64`:
//! they are persisted as integer minor units and written to JSON as exact
//! decimal numbers.

use crate::error::{CoreError, CoreResult};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, Neg, Sub};
use std::str::FromStr;

pub const MONEY_SCALE: u32 = 4;
const MINOR_PER_MAJOR: i64 = 10_000;

/// Round any decimal to money scale with banker's rounding.
pub fn round_money(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointNearestEven);
    rounded.rescale(MONEY_SCALE);
    rounded
}

/// Largest magnitude an amount may take: `i64::MAX` minor units.
pub fn max_amount() -> Decimal {
    Decimal::new(i64::MAX, MONEY_SCALE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// Build from any decimal, rounding to scale 4.
    pub fn new(value: Decimal) -> Self {
        Money(round_money(value))
    }

    /// Build from integer minor units (1 major unit = 10 000 minor units).
    pub fn from_minor(minor: i64) -> Self {
        Money(Decimal::new(minor, MONEY_SCALE))
    }

    /// Whole major units, handy for literals in tests and fixtures.
    pub fn from_major(major: i64) -> Self {
        Money::from_minor(major * MINOR_PER_MAJOR)
    }

    /// Round `value` to scale 4, refusing anything outside the minor-unit range.
    pub fn checked_new(value: Decimal, field: &str) -> CoreResult<Money> {
        if value.abs() > max_amount() {
            return Err(CoreError::validation(field, format!("exceeds the largest amount {}", max_amount())));
        }
        Ok(Money::new(value))
    }

    pub fn to_minor(&self) -> CoreResult<i64> {
        self.0
            .checked_mul(Decimal::from(MINOR_PER_MAJOR))
            .and_then(|minor| minor.trunc().to_i64())
            .ok_or_else(|| CoreError::validation("amount", format!("{self} exceeds the largest amount {}", max_amount())))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    pub fn abs(&self) -> Money {
        Money(self.0.abs())
    }

    pub fn min(self, other: Money) -> Money {
        if self <= other { self } else { other }
    }

    /// Whether the amount fits the stored minor-unit range.
    pub fn in_range(&self) -> bool {
        self.0.abs() <= max_amount()
    }

    /// Multiply by a dimensionless factor (rate, quantity) and round.
    /// Only for factors known to keep the result in range.
    pub fn scale_by(&self, factor: Decimal) -> Money {
        Money::new(self.0 * factor)
    }

    /// `scale_by` for factors from callers. Overflow is a validation error on `field`.
    pub fn checked_scale_by(&self, factor: Decimal, field: &str) -> CoreResult<Money> {
        let product = self
            .0
            .checked_mul(factor)
            .ok_or_else(|| CoreError::validation(field, format!("{self} × {factor} is out of range")))?;
        Money::checked_new(product, field)
    }

    pub fn checked_add(self, rhs: Money, field: &str) -> CoreResult<Money> {
        Money::checked_new(self.0 + rhs.0, field)
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money::new(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money::new(self.0 - rhs.0)
    }
}

impl Neg for Money {
    type Output = Money;
    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Money {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Decimal::from_str(s.trim())
            .map_err(|e| CoreError::validation("amount", format!("not a decimal amount: {e}")))?;
        Money::try_from_decimal(value)
    }
}

impl Money {
    /// Accept a wire value only if it carries at most 4 fractional digits
    /// and fits the minor-unit range.
    pub fn try_from_decimal(value: Decimal) -> CoreResult<Money> {
        let normalized = value.normalize();
        if normalized.scale() > MONEY_SCALE {
            return Err(CoreError::validation(
                "amount",
                format!("{value} has more than {MONEY_SCALE} fractional digits"),
            ));
        }
        Money::checked_new(normalized, "amount")
    }
}

/// Written as a JSON number carrying every digit (`70.0000`), never via `f64`.
impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        rust_decimal::serde::arbitrary_precision::serialize(&self.0, serializer)
    }
}

/// Read from a JSON number or a decimal string.
impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = rust_decimal::serde::arbitrary_precision::deserialize(deserializer)?;
        Money::try_from_decimal(value).map_err(serde::de::Error::custom)
    }
}

// ── Currency ─────────────────────────────────────────────────────────────────

/// Three uppercase ASCII letters. Allow-list membership is checked by callers
/// against [`CoreConfig::currencies`](crate::config::CoreConfig).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn parse(code: &str) -> CoreResult<Self> {
        if code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase()) {
            Ok(Currency(code.to_string()))
        } else {
            Err(CoreError::validation(
                "currency",
                format!("'{code}' is not a three-letter uppercase ISO-4217 code"),
            ))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Currency {
    type Error = CoreError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Currency::parse(&value)
    }
}

impl From<Currency> for String {
    fn from(c: Currency) -> String {
        c.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_half_to_even_at_scale_four() {
        let a = Money::new(Decimal::from_str("1.00005").unwrap());
        let b = Money::new(Decimal::from_str("1.00015").unwrap());
        assert_eq!(a.to_string(), "1.0000");
        assert_eq!(b.to_string(), "1.0002");
    }

    #[test]
    fn minor_units_are_exact() {
        let m: Money = "30.0001".parse().unwrap();
        assert_eq!(m.to_minor().unwrap(), 300_001);
        assert_eq!(Money::from_minor(300_001), m);
        assert_eq!(Money::from_major(100).to_string(), "100.0000");
    }

    #[test]
    fn rejects_more_than_four_fraction_digits() {
        let err = "1.00001".parse::<Money>().unwrap_err();
        assert_eq!(err.code(), "validation");
        assert!("1.10000".parse::<Money>().is_ok());
    }

    #[test]
    fn serializes_as_json_number() {
        let m: Money = "70.0000".parse().unwrap();
        assert_eq!(serde_json::to_string(&m).unwrap(), "70.0000");
        let back: Money = serde_json::from_str("1066.1854").unwrap();
        assert_eq!(back.to_string(), "1066.1854");
        let text: Money = serde_json::from_str("\"12.5\"").unwrap();
        assert_eq!(text, Money::from_minor(125_000));
    }

    #[test]
    fn large_amounts_keep_every_digit() {
        let m = Money::from_minor(99_999_999_999_999_999);
        let text = serde_json::to_string(&m).unwrap();
        assert_eq!(text, "9999999999999.9999");
        assert_eq!(serde_json::from_str::<Money>(&text).unwrap(), m);

        let value = serde_json::to_value(m).unwrap();
        assert_eq!(value.to_string(), "9999999999999.9999");
        assert_eq!(serde_json::from_value::<Money>(value).unwrap(), m);
        assert_eq!(serde_json::from_str::<Money>("\"9999999999999.9999\"").unwrap(), m);
    }

    #[test]
    fn amounts_beyond_minor_units_are_invalid() {
        let err = "922337203685477.5808".parse::<Money>().unwrap_err();
        assert_eq!(err.code(), "validation");
        assert!("922337203685477.5807".parse::<Money>().is_ok());
        let big: Money = "900000000000000".parse().unwrap();
        assert_eq!(big.checked_add(big, "amount").unwrap_err().code(), "validation");
        assert_eq!(big.checked_scale_by(Decimal::from(2), "amount").unwrap_err().code(), "validation");
        let huge = Decimal::from_str("79228162514264337593543950335").unwrap();
        assert_eq!(big.checked_scale_by(huge, "amount").unwrap_err().code(), "validation");
    }

    #[test]
    fn currency_requires_three_uppercase_letters() {
        assert!(Currency::parse("USD").is_ok());
        assert!(Currency::parse("usd").is_err());
        assert!(Currency::parse("US").is_err());
        assert!(serde_json::from_str::<Currency>("\"EURO\"").is_err());
    }
}
