mod error;
mod peer_registry;
mod piece_map;
mod store;
mod transport;
mod types;

pub mod coordinator;
pub mod piece_selector;

pub use coordinator::{BlockOutcome, CoordinatorConfig, Mode, PieceCoordinator, PieceStatus};
pub use error::{
    as_peer_error, is_cancelled, is_protocol_error, is_validation_failure, BlockError,
    CancelError, Error, PeerError, Result,
};
pub use peer_registry::{Peer, PeerRegistry};
pub use piece_map::PieceMap;
pub use piece_selector::{
    PieceSelector, PieceState, SelectionStrategy, SharedPieceSelector, StrategyKind,
};
pub use store::{piece_digest, MemoryPiece, MemoryPieceStore, Piece, PieceStore};
pub use transport::{PeerConnection, Transport};
pub use types::{BlockRequest, ConnId, NetHandle, PeerAddr, PeerId, PieceIndex, PEER_ID_LEN};

#[cfg(test)]
pub mod tests;
