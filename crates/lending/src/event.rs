use serde::{Deserialize, Serialize};

use pbalend_core::{Address, Amount, MarketKey, PositionKey};
use pbalend_events::Event;

/// Event: MarketCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketCreated {
    pub loan_token: Address,
    pub collateral_token: Address,
    pub interest_rate: Amount,
    #[serde(rename = "LTV")]
    pub ltv: Amount,
}

/// Event: Deposit (lender supplies loan tokens, receives pool shares).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deposit {
    pub loan_token: Address,
    pub collateral_token: Address,
    pub user: Address,
    pub amount: Amount,
    pub shares: Amount,
}

/// Event: Borrow (borrower posts collateral, takes debt and debt shares).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Borrow {
    pub loan_token: Address,
    pub collateral_token: Address,
    pub user: Address,
    pub amount: Amount,
    pub shares: Amount,
    pub collateral_amount: Amount,
}

/// Event: Repay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repay {
    pub loan_token: Address,
    pub collateral_token: Address,
    pub user: Address,
    pub shares: Amount,
    pub amount: Amount,
}

/// Event: Withdraw (lender redeems shares for loan tokens).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Withdraw {
    pub loan_token: Address,
    pub collateral_token: Address,
    pub user: Address,
    pub amount: Amount,
    pub shares: Amount,
}

/// Event: WithdrawCollateral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawCollateral {
    pub loan_token: Address,
    pub collateral_token: Address,
    pub user: Address,
    pub amount: Amount,
}

/// Every event the lending contract emits.
///
/// JSON form is the decoded-log shape `{"event": "Deposit", "args": {...}}`
/// with the contract's camelCase argument names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "args")]
pub enum LendingEvent {
    MarketCreated(MarketCreated),
    Deposit(Deposit),
    Borrow(Borrow),
    Repay(Repay),
    Withdraw(Withdraw),
    WithdrawCollateral(WithdrawCollateral),
}

impl Event for LendingEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LendingEvent::MarketCreated(_) => "lending.market.created",
            LendingEvent::Deposit(_) => "lending.deposit",
            LendingEvent::Borrow(_) => "lending.borrow",
            LendingEvent::Repay(_) => "lending.repay",
            LendingEvent::Withdraw(_) => "lending.withdraw",
            LendingEvent::WithdrawCollateral(_) => "lending.withdraw_collateral",
        }
    }

    fn version(&self) -> u32 {
        1
    }
}

impl LendingEvent {
    /// The market this event belongs to (the ordering scope).
    pub fn market(&self) -> MarketKey {
        let (loan, collateral) = match self {
            LendingEvent::MarketCreated(e) => (e.loan_token, e.collateral_token),
            LendingEvent::Deposit(e) => (e.loan_token, e.collateral_token),
            LendingEvent::Borrow(e) => (e.loan_token, e.collateral_token),
            LendingEvent::Repay(e) => (e.loan_token, e.collateral_token),
            LendingEvent::Withdraw(e) => (e.loan_token, e.collateral_token),
            LendingEvent::WithdrawCollateral(e) => (e.loan_token, e.collateral_token),
        };
        MarketKey::new(loan, collateral)
    }

    /// The user position this event touches, if any.
    pub fn position(&self) -> Option<PositionKey> {
        let user = match self {
            LendingEvent::MarketCreated(_) => return None,
            LendingEvent::Deposit(e) => e.user,
            LendingEvent::Borrow(e) => e.user,
            LendingEvent::Repay(e) => e.user,
            LendingEvent::Withdraw(e) => e.user,
            LendingEvent::WithdrawCollateral(e) => e.user,
        };
        Some(self.market().position(user))
    }
}

macro_rules! impl_position_event {
    ($($t:ident),* $(,)?) => {
        $(
            impl $t {
                pub fn key(&self) -> PositionKey {
                    PositionKey::new(self.loan_token, self.collateral_token, self.user)
                }
            }

            impl From<$t> for LendingEvent {
                fn from(value: $t) -> Self {
                    LendingEvent::$t(value)
                }
            }
        )*
    };
}

impl_position_event!(Deposit, Borrow, Repay, Withdraw, WithdrawCollateral);

impl MarketCreated {
    pub fn key(&self) -> MarketKey {
        MarketKey::new(self.loan_token, self.collateral_token)
    }
}

impl From<MarketCreated> for LendingEvent {
    fn from(value: MarketCreated) -> Self {
        LendingEvent::MarketCreated(value)
    }
}
