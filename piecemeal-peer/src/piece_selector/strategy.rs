//! Candidate ordering policies for the piece selector

use std::{fmt, str::FromStr};

use crate::types::PieceIndex;

/// Ranks candidate pieces for polling. Higher ranks are polled first; equal
/// ranks fall back to the higher piece index.
///
/// `availability` is the number of registered peers that have announced the
/// piece.
pub trait SelectionStrategy {
    fn rank(&self, piece_index: PieceIndex, availability: u32) -> i64;

    /// Whether rank depends on availability, so that queued ranks may go
    /// stale as peers come and go.
    fn uses_availability(&self) -> bool {
        true
    }
}

/// Deterministic order by piece index alone, highest index first.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexOrder;

impl SelectionStrategy for IndexOrder {
    fn rank(&self, _piece_index: PieceIndex, _availability: u32) -> i64 {
        0
    }

    fn uses_availability(&self) -> bool {
        false
    }
}

/// Prefers pieces announced by the fewest peers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RarestFirst;

impl SelectionStrategy for RarestFirst {
    fn rank(&self, _piece_index: PieceIndex, availability: u32) -> i64 {
        -i64::from(availability)
    }
}

/// Caller-supplied ranking function.
#[derive(Clone)]
pub struct Custom<F>(pub F);

impl<F: Fn(PieceIndex, u32) -> i64> SelectionStrategy for Custom<F> {
    fn rank(&self, piece_index: PieceIndex, availability: u32) -> i64 {
        (self.0)(piece_index, availability)
    }
}

impl<S: SelectionStrategy + ?Sized> SelectionStrategy for Box<S> {
    fn rank(&self, piece_index: PieceIndex, availability: u32) -> i64 {
        (**self).rank(piece_index, availability)
    }

    fn uses_availability(&self) -> bool {
        (**self).uses_availability()
    }
}

/// Boxed strategy, for picking a policy at runtime.
pub type DynStrategy = Box<dyn SelectionStrategy + Send + Sync>;

/// Named built-in strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StrategyKind {
    #[default]
    IndexOrder,
    RarestFirst,
}

impl StrategyKind {
    pub fn build(self) -> DynStrategy {
        match self {
            StrategyKind::IndexOrder => Box::new(IndexOrder),
            StrategyKind::RarestFirst => Box::new(RarestFirst),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::IndexOrder => f.write_str("index-order"),
            StrategyKind::RarestFirst => f.write_str("rarest-first"),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "index-order" | "sequential" => Ok(StrategyKind::IndexOrder),
            "rarest-first" | "rarest" => Ok(StrategyKind::RarestFirst),
            _ => Err(anyhow::anyhow!("unknown selection strategy: {}", s)),
        }
    }
}
