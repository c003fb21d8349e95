//! `pbalend-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! chain identifiers, wide unsigned amounts and the shared error model.

pub mod amount;
pub mod error;
pub mod id;

pub use amount::{Amount, U256, U512};
pub use error::{DomainError, DomainResult};
pub use id::{Address, MarketKey, PositionKey};
