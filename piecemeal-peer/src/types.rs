use std::{fmt, net::SocketAddr};

/// Index of one fixed-size piece of the shared content.
pub type PieceIndex = u32;

/// Network address of a peer; the identity under which it is registered.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> PeerAddr {
        PeerAddr {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(value: SocketAddr) -> Self {
        PeerAddr {
            host: value.ip().to_string(),
            port: value.port(),
        }
    }
}

pub const PEER_ID_LEN: usize = 20;

/// Protocol-level peer identifier, when the peer supplied one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    pub fn new(bytes: [u8; PEER_ID_LEN]) -> PeerId {
        PeerId(bytes)
    }
}

impl TryFrom<&[u8]> for PeerId {
    type Error = std::array::TryFromSliceError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Ok(PeerId(value.try_into()?))
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Opaque handle issued by a [`crate::Transport`] for an open connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NetHandle(pub u64);

/// Opaque identifier of a live [`crate::PeerConnection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

/// A request for one block of a piece.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRequest {
    pub piece: PieceIndex,
    pub offset: u32,
    pub length: u32,
}
