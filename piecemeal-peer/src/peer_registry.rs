use std::collections::{hash_map::Keys, HashMap, HashSet};

use tracing::{debug, trace};

use crate::{
    piece_map::PieceMap,
    transport::PeerConnection,
    types::{ConnId, NetHandle, PeerAddr, PeerId, PieceIndex},
};

/// A known peer, owned by the [`PeerRegistry`] for the lifetime of its
/// connection.
#[derive(Debug)]
pub struct Peer<C> {
    addr: PeerAddr,
    peer_id: Option<PeerId>,
    pub(crate) connection: Option<C>,
    pub(crate) net_handle: Option<NetHandle>,
    pub(crate) have_map: PieceMap,
    pub(crate) expired_claims: HashSet<PieceIndex>,
}

impl<C> Peer<C> {
    fn new(addr: PeerAddr, peer_id: Option<PeerId>) -> Peer<C> {
        Peer {
            addr,
            peer_id,
            connection: None,
            net_handle: None,
            have_map: PieceMap::new(),
            expired_claims: HashSet::new(),
        }
    }

    pub fn addr(&self) -> &PeerAddr {
        &self.addr
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }

    pub fn connection(&self) -> Option<&C> {
        self.connection.as_ref()
    }

    pub fn connection_mut(&mut self) -> Option<&mut C> {
        self.connection.as_mut()
    }

    pub fn set_connection(&mut self, connection: C) -> Option<C> {
        self.connection.replace(connection)
    }

    pub fn net_handle(&self) -> Option<NetHandle> {
        self.net_handle
    }

    pub fn set_net_handle(&mut self, handle: Option<NetHandle>) {
        self.net_handle = handle;
    }

    /// Pieces this peer has announced it possesses.
    pub fn have_map(&self) -> &PieceMap {
        &self.have_map
    }

    /// Pieces this peer was asked for whose claims have since expired.
    /// Blocks for these may still be in flight.
    pub fn expired_claims(&self) -> &HashSet<PieceIndex> {
        &self.expired_claims
    }
}

/// Registry of known peers, keyed by network address. At most one peer is
/// registered per (host, port).
pub struct PeerRegistry<C> {
    peers: HashMap<PeerAddr, Peer<C>>,
}

impl<C> Default for PeerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> PeerRegistry<C> {
    pub fn new() -> Self {
        PeerRegistry {
            peers: HashMap::new(),
        }
    }

    pub fn contains(&self, host: &str, port: u16) -> bool {
        self.peers.contains_key(&PeerAddr::new(host, port))
    }

    /// Register a new peer. Returns `None`, leaving the registry untouched,
    /// when (host, port) is already registered.
    pub fn add(&mut self, host: &str, port: u16, peer_id: Option<PeerId>) -> Option<&mut Peer<C>> {
        let addr = PeerAddr::new(host, port);
        if self.peers.contains_key(&addr) {
            debug!(%addr, "rejecting duplicate peer");
            return None;
        }
        trace!(%addr, "adding peer");
        Some(
            self.peers
                .entry(addr.clone())
                .or_insert_with(|| Peer::new(addr, peer_id)),
        )
    }

    /// Unregister a peer, handing back ownership of it and its connection.
    pub fn remove(&mut self, addr: &PeerAddr) -> Option<Peer<C>> {
        let peer = self.peers.remove(addr);
        if peer.is_some() {
            debug!(%addr, "removed peer");
        }
        peer
    }

    pub fn get(&self, addr: &PeerAddr) -> Option<&Peer<C>> {
        self.peers.get(addr)
    }

    pub fn get_mut(&mut self, addr: &PeerAddr) -> Option<&mut Peer<C>> {
        self.peers.get_mut(addr)
    }

    /// Reverse lookup by transport handle.
    pub fn find_by_handle(&self, handle: NetHandle) -> Option<&Peer<C>> {
        self.peers
            .values()
            .find(|peer| peer.net_handle == Some(handle))
    }

    pub fn for_each<F: FnMut(&Peer<C>)>(&self, mut visitor: F) {
        self.peers.values().for_each(|peer| visitor(peer));
    }

    pub fn for_each_mut<F: FnMut(&mut Peer<C>)>(&mut self, mut visitor: F) {
        self.peers.values_mut().for_each(|peer| visitor(peer));
    }

    pub fn addrs(&self) -> Keys<'_, PeerAddr, Peer<C>> {
        self.peers.keys()
    }

    pub fn count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl<C: PeerConnection> PeerRegistry<C> {
    /// Reverse lookup by live connection.
    pub fn find_by_connection(&self, conn: ConnId) -> Option<&Peer<C>> {
        self.peers.values().find(|peer| {
            peer.connection
                .as_ref()
                .map(|c| c.id() == conn)
                .unwrap_or(false)
        })
    }
}
