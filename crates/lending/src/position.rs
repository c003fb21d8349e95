use serde::{Deserialize, Serialize};

use pbalend_core::{Address, Amount, DomainResult, PositionKey};

use crate::event::{Borrow, Deposit, Repay, Withdraw, WithdrawCollateral};
use crate::transition::{ClampedField, NoChange, Transition};

/// Lifecycle of a stored position (an absent key has no row at all).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PositionState {
    /// Some amount or shares outstanding.
    Active,
    /// Fully withdrawn / repaid; the row stays queryable.
    Zeroed,
}

fn state_of(amount: Amount, shares: Amount) -> PositionState {
    if amount.is_zero() && shares.is_zero() {
        PositionState::Zeroed
    } else {
        PositionState::Active
    }
}

/// Subtract with the zero floor, recording the field if it was clamped.
fn floor_sub(
    current: Amount,
    delta: Amount,
    field: ClampedField,
    clamped: &mut Vec<ClampedField>,
) -> Amount {
    let (next, hit_floor) = current.clamped_sub(delta);
    if hit_floor {
        clamped.push(field);
    }
    next
}

/// Row: a lender's deposit in one market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LendPosition {
    pub loan_token: Address,
    pub collateral_token: Address,
    pub user: Address,
    /// Deposited principal.
    pub amount: Amount,
    /// Pool shares owned.
    pub shares: Amount,
}

impl LendPosition {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.loan_token, self.collateral_token, self.user)
    }

    pub fn state(&self) -> PositionState {
        state_of(self.amount, self.shares)
    }

    /// Reduce `Deposit`: create on first deposit, otherwise accumulate.
    pub fn deposited(current: Option<&LendPosition>, ev: &Deposit) -> DomainResult<Transition<LendPosition>> {
        let row = match current {
            None => LendPosition {
                loan_token: ev.loan_token,
                collateral_token: ev.collateral_token,
                user: ev.user,
                amount: ev.amount,
                shares: ev.shares,
            },
            Some(p) => LendPosition {
                amount: p.amount.checked_add(ev.amount)?,
                shares: p.shares.checked_add(ev.shares)?,
                ..p.clone()
            },
        };
        Ok(Transition::write(row))
    }

    /// Reduce `Withdraw`: decrement with a zero floor; no-op on an absent key.
    pub fn withdrawn(current: Option<&LendPosition>, ev: &Withdraw) -> Transition<LendPosition> {
        let Some(p) = current else {
            return Transition::Unchanged(NoChange::MissingAggregate);
        };

        let mut clamped = Vec::new();
        let amount = floor_sub(p.amount, ev.amount, ClampedField::Amount, &mut clamped);
        let shares = floor_sub(p.shares, ev.shares, ClampedField::Shares, &mut clamped);

        Transition::Write {
            row: LendPosition {
                amount,
                shares,
                ..p.clone()
            },
            clamped,
        }
    }
}

/// Row: a borrower's debt and posted collateral in one market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowPosition {
    pub loan_token: Address,
    pub collateral_token: Address,
    pub user: Address,
    /// Outstanding debt.
    pub amount: Amount,
    /// Debt shares.
    pub shares: Amount,
    /// Posted collateral.
    pub collateral_amount: Amount,
}

impl BorrowPosition {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.loan_token, self.collateral_token, self.user)
    }

    /// Debt state only; collateral left behind after a full repay does not
    /// make the position active.
    pub fn state(&self) -> PositionState {
        state_of(self.amount, self.shares)
    }

    /// Reduce `Borrow`: create on first borrow, otherwise accumulate all three fields.
    pub fn borrowed(current: Option<&BorrowPosition>, ev: &Borrow) -> DomainResult<Transition<BorrowPosition>> {
        let row = match current {
            None => BorrowPosition {
                loan_token: ev.loan_token,
                collateral_token: ev.collateral_token,
                user: ev.user,
                amount: ev.amount,
                shares: ev.shares,
                collateral_amount: ev.collateral_amount,
            },
            Some(p) => BorrowPosition {
                amount: p.amount.checked_add(ev.amount)?,
                shares: p.shares.checked_add(ev.shares)?,
                collateral_amount: p.collateral_amount.checked_add(ev.collateral_amount)?,
                ..p.clone()
            },
        };
        Ok(Transition::write(row))
    }

    /// Reduce `Repay`: decrement debt and shares with a zero floor.
    pub fn repaid(current: Option<&BorrowPosition>, ev: &Repay) -> Transition<BorrowPosition> {
        let Some(p) = current else {
            return Transition::Unchanged(NoChange::MissingAggregate);
        };

        let mut clamped = Vec::new();
        let amount = floor_sub(p.amount, ev.amount, ClampedField::Amount, &mut clamped);
        let shares = floor_sub(p.shares, ev.shares, ClampedField::Shares, &mut clamped);

        Transition::Write {
            row: BorrowPosition {
                amount,
                shares,
                ..p.clone()
            },
            clamped,
        }
    }

    /// Reduce `WithdrawCollateral`: decrement collateral only.
    pub fn collateral_withdrawn(
        current: Option<&BorrowPosition>,
        ev: &WithdrawCollateral,
    ) -> Transition<BorrowPosition> {
        let Some(p) = current else {
            return Transition::Unchanged(NoChange::MissingAggregate);
        };

        let mut clamped = Vec::new();
        let collateral_amount = floor_sub(
            p.collateral_amount,
            ev.amount,
            ClampedField::CollateralAmount,
            &mut clamped,
        );

        Transition::Write {
            row: BorrowPosition {
                collateral_amount,
                ..p.clone()
            },
            clamped,
        }
    }
}
