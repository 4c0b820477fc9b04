//! Piece Selector
//!
//! Per-peer candidate tracking and global claim bookkeeping. A piece is
//! claimed by at most one peer at a time, and once had it is never offered
//! again.

mod selector;
mod shared;
mod strategy;

#[cfg(test)]
mod tests;

pub use selector::{PieceSelector, PieceState};
pub use shared::SharedPieceSelector;
pub use strategy::{Custom, DynStrategy, IndexOrder, RarestFirst, SelectionStrategy, StrategyKind};
