//! A monetary amount newtype which maintains some useful internal invariants
//! and keeps all engine arithmetic in integer minor units.
//!
//! Every hand-off between components and the payment provider is an integer
//! number of minor units (cents of a shilling). [`rust_decimal`] appears only
//! at the boundaries: parsing user-supplied major-unit strings, applying the
//! platform fee rate, and formatting for display.
//!
//! ### Parsing [`Amount`]s
//!
//! User input arrives in major units ("5000" shillings), so use
//! [`Amount::parse_major`]. Values already in minor units use
//! [`Amount::from_minor`].
//!
//! ### Displaying [`Amount`]s
//!
//! [`Amount`]'s [`Display`] impl shows the minor-unit integer. Use
//! [`Amount::major`] or [`Amount::format`] when rendering for humans.

use std::fmt::{self, Display};
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Deserializer, Serialize};

/// Minor units per major unit. The engine supports currencies with a
/// hundredth subdivision (KES, NGN, USD, ...).
const MINOR_PER_MAJOR: Decimal = dec!(100);

/// Errors that can occur when attempting to construct an [`Amount`].
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("amount is negative")]
    Negative,
    #[error("amount is not a number")]
    NotANumber,
    #[error("amount is too large")]
    TooLarge,
    #[error("fee rate must be within [0, 1)")]
    BadFeeRate,
    #[error("not a currency code")]
    BadCurrency,
}

/// A monetary amount in integer minor units.
///
/// - The contained value is non-negative.
/// - Addition and subtraction are exact; scaling by a fee rate rounds
///   half-even to the nearest minor unit.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct Amount(i64);

/// The result of splitting a total into the platform fee and the seller's
/// share. Maintains `fee + seller == total`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FeeSplit {
    pub fee: Amount,
    pub seller: Amount,
}

impl Amount {
    /// An [`Amount`] of zero.
    pub const ZERO: Self = Self(0);

    // --- Constructors --- //

    /// Construct an [`Amount`] from an integer minor-unit value.
    pub fn from_minor(minor: i64) -> Result<Self, Error> {
        if minor < 0 {
            return Err(Error::Negative);
        }
        Ok(Self(minor))
    }

    /// Construct an [`Amount`] from a [`u32`] minor-unit value.
    #[inline]
    pub fn from_minor_u32(minor: u32) -> Self {
        Self(i64::from(minor))
    }

    /// Parse a user-supplied major-unit string ("5000" or "4999.95") into an
    /// [`Amount`], rounding sub-minor-unit precision half-even.
    pub fn parse_major(text: &str) -> Result<Self, Error> {
        let major =
            Decimal::from_str(text.trim()).map_err(|_| Error::NotANumber)?;
        Self::try_from_major(major)
    }

    /// Construct an [`Amount`] from a major-unit [`Decimal`] value.
    pub fn try_from_major(major: Decimal) -> Result<Self, Error> {
        if major.is_sign_negative() {
            return Err(Error::Negative);
        }
        let minor = (major * MINOR_PER_MAJOR).round_dp_with_strategy(
            0,
            RoundingStrategy::MidpointNearestEven,
        );
        minor.to_i64().map(Self).ok_or(Error::TooLarge)
    }

    // --- Getters --- //

    /// Returns the contained minor-unit integer.
    #[inline]
    pub fn minor(self) -> i64 {
        self.0
    }

    /// Returns the amount as a major-unit [`Decimal`] value.
    #[inline]
    pub fn major(self) -> Decimal {
        Decimal::from(self.0) / MINOR_PER_MAJOR
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    // --- Arithmetic --- //

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).and_then(|v| Self::from_minor(v).ok())
    }

    /// Scale by a non-negative decimal factor, rounding half-even.
    pub fn checked_mul(self, factor: Decimal) -> Option<Self> {
        if factor.is_sign_negative() {
            return None;
        }
        let scaled = (Decimal::from(self.0) * factor).round_dp_with_strategy(
            0,
            RoundingStrategy::MidpointNearestEven,
        );
        scaled.to_i64().map(Self)
    }

    /// Split this total into `(fee, seller)` where
    /// `fee = round_half_even(total × fee_rate)` and `seller = total − fee`.
    pub fn split(self, fee_rate: Decimal) -> Result<FeeSplit, Error> {
        if fee_rate.is_sign_negative() || fee_rate >= Decimal::ONE {
            return Err(Error::BadFeeRate);
        }
        let fee = self.checked_mul(fee_rate).ok_or(Error::TooLarge)?;
        let seller = self.checked_sub(fee).ok_or(Error::Negative)?;
        Ok(FeeSplit { fee, seller })
    }

    // --- Display --- //

    /// Format for display with a currency code, e.g. `KES 5000.00`.
    pub fn format(self, currency: &Currency) -> String {
        format!("{} {:.2}", currency.as_str(), self.major())
    }
}

/// Enforces that the deserialized minor-unit integer is non-negative.
impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let minor = i64::deserialize(deserializer)?;
        Self::from_minor(minor)
            .map_err(|_| serde::de::Error::custom("amount was negative"))
    }
}

impl Display for Amount {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

// --- Currency --- //

/// An ISO-4217 currency code. Immutable on an escrow after creation.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    pub const KES: &'static str = "KES";

    /// Parse a currency code: three ASCII letters, uppercased.
    pub fn new(code: &str) -> Result<Self, Error> {
        let code = code.trim();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(Error::BadCurrency);
        }
        Ok(Self(code.to_ascii_uppercase()))
    }

    pub fn kes() -> Self {
        Self(Self::KES.to_owned())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Currency {
    fn default() -> Self {
        Self::kes()
    }
}

impl Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Tests --- //

#[cfg(test)]
mod test {
    use proptest::arbitrary::any;
    use proptest::{prop_assert, prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn parse_major_scales_to_minor_units() {
        assert_eq!(Amount::parse_major("5000").unwrap().minor(), 500_000);
        assert_eq!(Amount::parse_major("4999.95").unwrap().minor(), 499_995);
        assert_eq!(Amount::parse_major("0").unwrap().minor(), 0);
        assert_eq!(Amount::parse_major(" 12.5 ").unwrap().minor(), 1250);
    }

    #[test]
    fn parse_major_rejects_garbage() {
        assert_eq!(Amount::parse_major("-1"), Err(Error::Negative));
        assert_eq!(Amount::parse_major("abc"), Err(Error::NotANumber));
        assert_eq!(Amount::parse_major(""), Err(Error::NotANumber));
        assert_eq!(Amount::parse_major("12,5"), Err(Error::NotANumber));
    }

    #[test]
    fn parse_major_rounds_half_even() {
        // 0.125 major = 12.5 minor, banker's rounding lands on the even 12.
        assert_eq!(Amount::parse_major("0.125").unwrap().minor(), 12);
        // 0.135 major = 13.5 minor -> 14.
        assert_eq!(Amount::parse_major("0.135").unwrap().minor(), 14);
    }

    #[test]
    fn split_default_fee_rate() {
        let total = Amount::from_minor(500_000).unwrap();
        let split = total.split(dec!(0.02)).unwrap();
        assert_eq!(split.fee.minor(), 10_000);
        assert_eq!(split.seller.minor(), 490_000);
    }

    #[test]
    fn split_rejects_bad_rates() {
        let total = Amount::from_minor(100).unwrap();
        assert!(total.split(dec!(1)).is_err());
        assert!(total.split(dec!(-0.01)).is_err());
        assert!(total.split(dec!(0)).is_ok());
    }

    #[test]
    fn split_preserves_total() {
        proptest!(|(minor in 0i64..=1_000_000_000_000, bps in 0u32..10_000)| {
            let total = Amount::from_minor(minor).unwrap();
            let rate = Decimal::from(bps) / dec!(10_000);
            let split = total.split(rate).unwrap();
            prop_assert_eq!(
                split.fee.minor() + split.seller.minor(),
                total.minor()
            );
            prop_assert!(split.fee.minor() >= 0);
            prop_assert!(split.seller.minor() >= 0);
        })
    }

    /// `format(parse(x)) == format(parse(format(x)))` for representable x.
    #[test]
    fn format_parse_roundtrip() {
        proptest!(|(minor in 0i64..=1_000_000_000_000)| {
            let amount = Amount::from_minor(minor).unwrap();
            let formatted = amount.major().to_string();
            let reparsed = Amount::parse_major(&formatted).unwrap();
            prop_assert_eq!(amount, reparsed);
            prop_assert_eq!(
                reparsed.major().to_string(),
                formatted
            );
        })
    }

    #[test]
    fn serde_transports_minor_units() {
        let amount = Amount::from_minor(490_000).unwrap();
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "490000");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
        assert!(serde_json::from_str::<Amount>("-1").is_err());
    }

    #[test]
    fn checked_arithmetic() {
        proptest!(|(a in 0i64..=1 << 40, b in 0i64..=1 << 40)| {
            let aa = Amount::from_minor(a).unwrap();
            let bb = Amount::from_minor(b).unwrap();
            let sum = aa.checked_add(bb).unwrap();
            prop_assert_eq!(sum.checked_sub(bb).unwrap(), aa);
            if a < b {
                prop_assert!(aa.checked_sub(bb).is_none());
            }
        })
    }

    #[test]
    fn currency_parsing() {
        assert_eq!(Currency::new("kes").unwrap().as_str(), "KES");
        assert!(Currency::new("KESH").is_err());
        assert!(Currency::new("K3S").is_err());
        assert_eq!(Currency::default().as_str(), "KES");
    }

    #[test]
    fn format_for_display() {
        let amount = Amount::from_minor(500_000).unwrap();
        assert_eq!(amount.format(&Currency::kes()), "KES 5000.00");
    }

    #[test]
    fn arbitrary_amounts_stay_nonnegative() {
        proptest!(|(minor in any::<i64>())| {
            match Amount::from_minor(minor) {
                Ok(amount) => prop_assert!(amount.minor() >= 0),
                Err(e) => prop_assert_eq!(e, Error::Negative),
            }
        })
    }
}
