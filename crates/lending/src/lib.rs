//! Lending domain module (event projection).
//!
//! This crate contains the bookkeeping rules of the lending ledger, implemented
//! purely as deterministic reducers over chain events (no IO, no storage):
//! given the current row for a key and one event, compute the next row.

pub mod event;
pub mod market;
pub mod position;
pub mod transition;

pub use event::{
    Borrow, Deposit, LendingEvent, MarketCreated, Repay, Withdraw, WithdrawCollateral,
};
pub use market::{Market, MarketPolicy};
pub use position::{BorrowPosition, LendPosition, PositionState};
pub use transition::{ClampedField, NoChange, Transition};
