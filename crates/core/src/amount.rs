//! Unsigned ledger amounts (asset amounts, pool shares, rates).
//!
//! Every accounting field in the ledger is an `Amount`. Chain values are
//! `uint256`, which does not fit any native integer, and floating point is never
//! used for accounting. Stored totals are sums of many `uint256` values, so the
//! representation is 512 bits wide and a running total never wraps or saturates
//! at the word size of a single event field.

use core::str::FromStr;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{DomainError, DomainResult};

uint::construct_uint! {
    /// Raw 256-bit unsigned integer (one chain word).
    pub struct U256(4);
}

uint::construct_uint! {
    /// Raw 512-bit unsigned integer backing accumulated totals.
    pub struct U512(8);
}

/// Non-negative accumulated quantity.
///
/// Serialized as a decimal string. Deserializes from a JSON integer, a decimal
/// string or a `0x`-prefixed hex string.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Amount(U512);

impl Amount {
    pub const ZERO: Amount = Amount(U512([0; 8]));
    /// Largest single chain word, `2^256 - 1`.
    pub const WORD_MAX: Amount = Amount(U512([u64::MAX, u64::MAX, u64::MAX, u64::MAX, 0, 0, 0, 0]));

    pub fn new(value: U512) -> Self {
        Self(value)
    }

    pub fn as_u512(&self) -> U512 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Parse a base-10 string (the persisted form).
    pub fn from_dec_str(s: &str) -> DomainResult<Self> {
        U512::from_dec_str(s)
            .map(Self)
            .map_err(|e| DomainError::invalid_amount(format!("{s:?}: {e:?}")))
    }

    /// Accumulate. Only a total past `2^512 - 1` is rejected.
    pub fn checked_add(self, rhs: Amount) -> DomainResult<Amount> {
        self.0
            .checked_add(rhs.0)
            .map(Self)
            .ok_or_else(|| DomainError::invariant(format!("amount overflow: {self} + {rhs}")))
    }

    /// Subtract with a zero floor.
    ///
    /// Returns the result and whether the floor was hit (i.e. `rhs > self`).
    pub fn clamped_sub(self, rhs: Amount) -> (Amount, bool) {
        match self.0.checked_sub(rhs.0) {
            Some(v) => (Self(v), false),
            None => (Self::ZERO, true),
        }
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self(U512::from(value))
    }
}

impl From<u128> for Amount {
    fn from(value: u128) -> Self {
        Self(U512::from(value))
    }
}

impl From<U256> for Amount {
    fn from(value: U256) -> Self {
        let [a, b, c, d] = value.0;
        Self(U512([a, b, c, d, 0, 0, 0, 0]))
    }
}

impl From<U512> for Amount {
    fn from(value: U512) -> Self {
        Self(value)
    }
}

impl core::fmt::Display for Amount {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for Amount {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DomainError::invalid_amount("empty string"));
        }

        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => U512::from_str_radix(hex, 16)
                .map(Self)
                .map_err(|e| DomainError::invalid_amount(format!("{s:?}: {e:?}"))),
            None => Self::from_dec_str(s),
        }
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(AmountVisitor)
    }
}

struct AmountVisitor;

impl<'de> Visitor<'de> for AmountVisitor {
    type Value = Amount;

    fn expecting(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("an unsigned integer, a decimal string or a 0x-prefixed hex string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
        Ok(Amount::from(v))
    }

    fn visit_u128<E: de::Error>(self, v: u128) -> Result<Amount, E> {
        Ok(Amount::from(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
        u64::try_from(v)
            .map(Amount::from)
            .map_err(|_| E::custom(format!("amount cannot be negative: {v}")))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Amount, E> {
        Err(E::custom(format!(
            "amount {v} is not an exact integer; encode large values as strings"
        )))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
        v.parse().map_err(E::custom)
    }
}
