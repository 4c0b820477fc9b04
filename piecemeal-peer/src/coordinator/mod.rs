//! Piece Coordinator
//!
//! Glues the peer registry and the piece selector to piece storage and the
//! transport. Protocol events from peer connections (bitfields, haves,
//! received blocks) update candidate and claim state; when a piece completes
//! it is validated, announced to every active peer and published to
//! subscribers. Once every piece is had the coordinator switches to seeding.

mod manager;
mod types;


pub use manager::PieceCoordinator;
pub use types::{BlockOutcome, CoordinatorConfig, Mode, PieceStatus};
