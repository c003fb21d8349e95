//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A 20-byte chain account or token identifier.
///
/// Rendered as `0x`-prefixed lowercase hex; parsing is case-insensitive and
/// tolerates a missing prefix.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address([u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);

        if raw.len() != 40 {
            return Err(DomainError::invalid_id(format!(
                "Address: expected 40 hex digits, got {} in {s:?}",
                raw.len()
            )));
        }

        let mut bytes = [0u8; 20];
        hex::decode_to_slice(raw, &mut bytes)
            .map_err(|e| DomainError::invalid_id(format!("Address: {e} in {s:?}")))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Address {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

impl From<[u8; 20]> for Address {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

/// Identity of a market: the (loan token, collateral token) pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarketKey {
    pub loan_token: Address,
    pub collateral_token: Address,
}

impl MarketKey {
    pub fn new(loan_token: Address, collateral_token: Address) -> Self {
        Self {
            loan_token,
            collateral_token,
        }
    }

    /// Key of `user`'s position inside this market.
    pub fn position(&self, user: Address) -> PositionKey {
        PositionKey { market: *self, user }
    }
}

impl core::fmt::Display for MarketKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}-{}", self.loan_token, self.collateral_token)
    }
}

/// Identity of a lend or borrow position: market + user.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub market: MarketKey,
    pub user: Address,
}

impl PositionKey {
    pub fn new(loan_token: Address, collateral_token: Address, user: Address) -> Self {
        Self {
            market: MarketKey::new(loan_token, collateral_token),
            user,
        }
    }
}

impl core::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}-{}", self.market, self.user)
    }
}
