//! Types for the Piece Coordinator

use std::time::Duration;

use crate::{piece_selector::StrategyKind, types::PieceIndex};

/// Configuration for the piece coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long a claim may go without completing before it is given back
    pub claim_timeout: Duration,

    /// First delay between connection attempts
    pub connect_initial_interval: Duration,

    /// Give up reconnecting after this long
    pub connect_max_elapsed: Duration,

    /// Candidate ordering policy
    pub strategy: StrategyKind,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            claim_timeout: Duration::from_secs(60),
            connect_initial_interval: Duration::from_millis(500),
            connect_max_elapsed: Duration::from_secs(30),
            strategy: StrategyKind::default(),
        }
    }
}

/// Whether the client still needs pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Leeching,
    /// Every piece is had; upload only.
    Seeding,
}

/// Result of applying a received block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Written; the piece still needs more blocks.
    Pending,

    /// The piece completed and validated.
    Completed { seeding: bool },

    /// The piece completed but failed validation, and was given back.
    ValidationFailed,

    /// Stale block for a piece no longer claimed, or from an unknown peer.
    Ignored,
}

/// Piece events published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PieceStatus {
    Verified {
        piece_index: PieceIndex,
        all_complete: bool,
    },
    Invalid {
        piece_index: PieceIndex,
    },
}
