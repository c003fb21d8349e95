use serde::{Deserialize, Serialize};

use pbalend_core::{Address, Amount, DomainError, DomainResult, MarketKey};

use crate::event::MarketCreated;
use crate::transition::{NoChange, Transition};

/// Protocol limits applied when a market is first recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketPolicy {
    /// Highest LTV a market may be created with (in the contract's LTV unit,
    /// percent by default).
    pub max_ltv: Amount,
}

impl MarketPolicy {
    pub fn new(max_ltv: impl Into<Amount>) -> Self {
        Self {
            max_ltv: max_ltv.into(),
        }
    }
}

impl Default for MarketPolicy {
    fn default() -> Self {
        Self::new(100u64)
    }
}

/// Row: a configured (loan token, collateral token) market.
///
/// Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub loan_token: Address,
    pub collateral_token: Address,
    pub interest_rate: Amount,
    pub ltv: Amount,
}

impl Market {
    pub fn key(&self) -> MarketKey {
        MarketKey::new(self.loan_token, self.collateral_token)
    }

    /// Reduce `MarketCreated`: create if absent, otherwise keep the first row.
    ///
    /// Re-creation is a no-op whatever its arguments. The LTV bound only
    /// applies to the event that would create the row.
    pub fn created(
        current: Option<&Market>,
        ev: &MarketCreated,
        policy: &MarketPolicy,
    ) -> DomainResult<Transition<Market>> {
        if current.is_some() {
            return Ok(Transition::Unchanged(NoChange::AlreadyExists));
        }

        if ev.ltv > policy.max_ltv {
            return Err(DomainError::validation(format!(
                "LTV {} exceeds protocol maximum {}",
                ev.ltv, policy.max_ltv
            )));
        }

        Ok(Transition::write(Market {
            loan_token: ev.loan_token,
            collateral_token: ev.collateral_token,
            interest_rate: ev.interest_rate,
            ltv: ev.ltv,
        }))
    }
}
