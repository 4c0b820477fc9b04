use std::future::Future;

use crate::{
    types::{BlockRequest, ConnId, NetHandle, PeerAddr, PieceIndex},
    Result,
};

/// Socket-level I/O, keyed by opaque handles.
pub trait Transport: Send {
    fn connect(&mut self, addr: &PeerAddr) -> impl Future<Output = Result<NetHandle>> + Send;

    fn send(&mut self, handle: NetHandle, bytes: &[u8])
        -> impl Future<Output = Result<usize>> + Send;

    fn receive(
        &mut self,
        handle: NetHandle,
        buf: &mut [u8],
    ) -> impl Future<Output = Result<usize>> + Send;

    fn disconnect(&mut self, handle: NetHandle) -> impl Future<Output = Result<()>> + Send;
}

/// The protocol state machine of one peer connection, as seen by the
/// coordinator.
pub trait PeerConnection {
    fn id(&self) -> ConnId;

    /// Whether the connection is up and past its handshake.
    fn is_active(&self) -> bool;

    fn send_have(&mut self, piece_index: PieceIndex) -> Result<()>;

    fn send_request(&mut self, request: &BlockRequest) -> Result<()>;
}
