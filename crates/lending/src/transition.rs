//! Result of reducing one event against the current row of its key.

/// Why a reducer produced no write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NoChange {
    /// The market already exists; creation is first-write-wins.
    AlreadyExists,
    /// A decrement arrived for a position that was never opened.
    MissingAggregate,
}

/// A field whose decrement hit the zero floor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ClampedField {
    Amount,
    Shares,
    CollateralAmount,
}

impl core::fmt::Display for ClampedField {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            ClampedField::Amount => "amount",
            ClampedField::Shares => "shares",
            ClampedField::CollateralAmount => "collateral_amount",
        })
    }
}

/// Next state for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition<T> {
    /// Leave the stored row (or its absence) as is.
    Unchanged(NoChange),
    /// Store `row`. `clamped` lists fields that would have gone negative.
    Write { row: T, clamped: Vec<ClampedField> },
}

impl<T> Transition<T> {
    pub(crate) fn write(row: T) -> Self {
        Transition::Write {
            row,
            clamped: Vec::new(),
        }
    }

    /// The row to store, if any.
    pub fn row(&self) -> Option<&T> {
        match self {
            Transition::Write { row, .. } => Some(row),
            Transition::Unchanged(_) => None,
        }
    }

    pub fn into_row(self) -> Option<T> {
        match self {
            Transition::Write { row, .. } => Some(row),
            Transition::Unchanged(_) => None,
        }
    }

    pub fn clamped(&self) -> &[ClampedField] {
        match self {
            Transition::Write { clamped, .. } => clamped,
            Transition::Unchanged(_) => &[],
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Transition<U> {
        match self {
            Transition::Write { row, clamped } => Transition::Write {
                row: f(row),
                clamped,
            },
            Transition::Unchanged(reason) => Transition::Unchanged(reason),
        }
    }
}
