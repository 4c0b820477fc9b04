use std::fmt;

use crate::types::{PeerAddr, PieceIndex};

pub type Error = anyhow::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures the coordinator reports about a single peer or piece. None of
/// these are fatal to the process; each is scoped to the peer or piece named.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("peer {0} is already registered")]
    DuplicatePeer(PeerAddr),

    #[error("peer {0} is not registered")]
    PeerNotFound(PeerAddr),

    #[error("failed to connect to {addr}: {source}")]
    ConnectFailure {
        addr: PeerAddr,
        #[source]
        source: Error,
    },

    #[error("protocol error from {addr}: {reason}")]
    PeerProtocol { addr: PeerAddr, reason: String },

    #[error("piece {piece} failed validation")]
    PieceValidation { piece: PieceIndex },
}

impl PeerError {
    pub fn protocol(addr: &PeerAddr, reason: impl Into<String>) -> PeerError {
        PeerError::PeerProtocol {
            addr: addr.to_owned(),
            reason: reason.into(),
        }
    }

    /// The peer this error is scoped to, if any.
    pub fn addr(&self) -> Option<&PeerAddr> {
        match self {
            PeerError::DuplicatePeer(addr) | PeerError::PeerNotFound(addr) => Some(addr),
            PeerError::ConnectFailure { addr, .. } | PeerError::PeerProtocol { addr, .. } => {
                Some(addr)
            }
            PeerError::PieceValidation { .. } => None,
        }
    }
}

/// Rejected writes into a piece.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("block offset {offset} is not aligned to block size {block_size}")]
    Misaligned { offset: u32, block_size: u32 },

    #[error("block offset {offset} is beyond piece length {piece_len}")]
    OutOfRange { offset: u32, piece_len: u32 },

    #[error("block at offset {offset} has length {actual}, expected {expected}")]
    WrongLength {
        offset: u32,
        expected: u32,
        actual: usize,
    },
}

pub struct CancelError;

impl std::error::Error for CancelError {}

impl fmt::Display for CancelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cancelled")
    }
}

impl fmt::Debug for CancelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cancelled")
    }
}

pub fn as_peer_error(e: &Error) -> Option<&PeerError> {
    for cause in e.chain() {
        if let Some(err) = cause.downcast_ref::<PeerError>() {
            return Some(err);
        }
    }
    None
}

pub fn is_cancelled(e: &Error) -> bool {
    for cause in e.chain() {
        if cause.downcast_ref::<CancelError>().is_some() {
            return true;
        }
    }
    false
}

pub fn is_protocol_error(e: &Error) -> bool {
    matches!(as_peer_error(e), Some(PeerError::PeerProtocol { .. }))
}

pub fn is_validation_failure(e: &Error) -> bool {
    matches!(as_peer_error(e), Some(PeerError::PieceValidation { .. }))
}
