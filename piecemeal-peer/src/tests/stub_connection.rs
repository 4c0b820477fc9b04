use anyhow::anyhow;

use crate::{
    error::Result,
    types::{BlockRequest, ConnId, PieceIndex},
    PeerConnection,
};

/// Peer connection that records what the coordinator sends through it.
#[derive(Debug, Clone)]
pub struct StubConnection {
    pub id: ConnId,
    pub active: bool,
    pub fail_sends: bool,
    pub haves: Vec<PieceIndex>,
    pub requests: Vec<BlockRequest>,
}

impl StubConnection {
    pub fn new(id: ConnId) -> Self {
        StubConnection {
            id,
            active: true,
            fail_sends: false,
            haves: vec![],
            requests: vec![],
        }
    }

    pub fn inactive(id: ConnId) -> Self {
        StubConnection {
            active: false,
            ..Self::new(id)
        }
    }
}

impl PeerConnection for StubConnection {
    fn id(&self) -> ConnId {
        self.id
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn send_have(&mut self, piece_index: PieceIndex) -> Result<()> {
        if self.fail_sends {
            return Err(anyhow!("stub connection {:?} send failed", self.id));
        }
        self.haves.push(piece_index);
        Ok(())
    }

    fn send_request(&mut self, request: &BlockRequest) -> Result<()> {
        if self.fail_sends {
            return Err(anyhow!("stub connection {:?} send failed", self.id));
        }
        self.requests.push(*request);
        Ok(())
    }
}
