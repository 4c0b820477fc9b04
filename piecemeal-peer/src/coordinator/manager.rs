//! Core Piece Coordinator functionality

use backoff::{backoff::Backoff, ExponentialBackoff};
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    error::{BlockError, CancelError, Error, PeerError, Result},
    peer_registry::PeerRegistry,
    piece_map::PieceMap,
    piece_selector::{DynStrategy, PieceSelector, PieceState},
    store::{Piece, PieceStore},
    transport::{PeerConnection, Transport},
    types::{BlockRequest, NetHandle, PeerAddr, PeerId, PieceIndex},
};

use super::types::*;

/// Binds the peer registry and piece selector to storage and transport.
///
/// Driven by one event loop: every method takes `&mut self`, so callbacks are
/// serialized and the registry and selector need no locking of their own.
pub struct PieceCoordinator<T, S, C> {
    config: CoordinatorConfig,
    registry: PeerRegistry<C>,
    selector: PieceSelector<PeerAddr, DynStrategy>,
    store: S,
    transport: T,
    mode: Mode,
    subscribers: Vec<flume::Sender<PieceStatus>>,
}

impl<T: Transport, S: PieceStore, C: PeerConnection> PieceCoordinator<T, S, C> {
    /// Create a coordinator over `store`. Pieces the store already holds
    /// valid are had from the start.
    pub fn new(config: CoordinatorConfig, mut store: S, transport: T) -> Self {
        let n_pieces = store.piece_count();
        let mut selector = PieceSelector::with_strategy(n_pieces, config.strategy.build());
        for piece_index in 0..n_pieces {
            if store.get(piece_index).map(|p| p.is_valid()).unwrap_or(false) {
                selector.mark_have(piece_index);
            }
        }
        let mode = if store.all_complete() {
            Mode::Seeding
        } else {
            Mode::Leeching
        };
        info!(n_pieces, have = selector.have_count(), ?mode, strategy = %config.strategy, "coordinator ready");
        PieceCoordinator {
            config,
            registry: PeerRegistry::new(),
            selector,
            store,
            transport,
            mode,
            subscribers: vec![],
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn registry(&self) -> &PeerRegistry<C> {
        &self.registry
    }

    pub fn selector(&self) -> &PieceSelector<PeerAddr, DynStrategy> {
        &self.selector
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Receive a [`PieceStatus`] for every piece that completes.
    pub fn subscribe(&mut self) -> flume::Receiver<PieceStatus> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Register a peer. Returns `None` if one is already registered at
    /// (host, port).
    pub fn add_peer(&mut self, host: &str, port: u16, peer_id: Option<PeerId>) -> Option<PeerAddr> {
        let addr = self.registry.add(host, port, peer_id)?.addr().to_owned();
        self.selector.add_peer(&addr);
        debug!(%addr, peers = self.registry.count(), "peer added");
        Some(addr)
    }

    pub fn attach_connection(&mut self, addr: &PeerAddr, connection: C) -> Result<()> {
        let peer = self
            .registry
            .get_mut(addr)
            .ok_or_else(|| PeerError::PeerNotFound(addr.to_owned()))?;
        if peer.set_connection(connection).is_some() {
            debug!(%addr, "replaced peer connection");
        }
        Ok(())
    }

    /// Apply a peer's full possession bitmap.
    #[tracing::instrument(skip_all, fields(addr = %addr), err)]
    pub async fn on_bitfield(&mut self, addr: &PeerAddr, bitfield: &[u8]) -> Result<()> {
        if self.registry.get(addr).is_none() {
            debug!("bitfield from unknown peer");
            return Ok(());
        }
        let n_pieces = self.selector.piece_count();
        let have_map = PieceMap::from(bitfield);
        if bitfield.len() != PieceMap::capacity(n_pieces as usize)
            || have_map.iter().any(|piece_index| piece_index >= n_pieces)
        {
            return Err(self
                .fail_peer(addr, format!("malformed bitfield of {} bytes", bitfield.len()))
                .await);
        }
        for piece_index in have_map.iter() {
            self.selector.peer_announces(addr, piece_index);
        }
        if let Some(peer) = self.registry.get_mut(addr) {
            trace!(pieces = have_map.count(), "peer bitfield");
            peer.have_map = have_map;
        }
        Ok(())
    }

    /// Apply a peer's announcement that it has one piece.
    #[tracing::instrument(skip_all, fields(addr = %addr, piece_index = piece_index), err)]
    pub async fn on_have(&mut self, addr: &PeerAddr, piece_index: PieceIndex) -> Result<()> {
        if self.registry.get(addr).is_none() {
            debug!("have from unknown peer");
            return Ok(());
        }
        if piece_index >= self.selector.piece_count() {
            return Err(self
                .fail_peer(addr, format!("have for piece {} out of range", piece_index))
                .await);
        }
        self.selector.peer_announces(addr, piece_index);
        if let Some(peer) = self.registry.get_mut(addr) {
            peer.have_map.set(piece_index);
        }
        Ok(())
    }

    /// Write a block received from `addr` into its piece, completing and
    /// validating the piece when it is the last one missing.
    ///
    /// A block for a piece this peer was not asked for, or one that does not
    /// fit its piece, is a protocol error: the peer is disconnected and its
    /// claims given back. A late block for a claim that expired is ignored.
    #[tracing::instrument(skip_all, fields(addr = %addr, piece_index = piece_index, offset = offset), err)]
    pub async fn on_block_received(
        &mut self,
        addr: &PeerAddr,
        piece_index: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> Result<BlockOutcome> {
        let (announced, expired) = match self.registry.get(addr) {
            Some(peer) => (
                peer.have_map.get(piece_index),
                peer.expired_claims.contains(&piece_index),
            ),
            None => {
                debug!(piece_index, "block from unknown peer");
                return Ok(BlockOutcome::Ignored);
            }
        };
        let stale = match self.selector.state(piece_index) {
            PieceState::Claimed(claimant) if claimant == addr => None,
            PieceState::Claimed(_) => Some(expired),
            PieceState::Have => Some(true),
            PieceState::Unclaimed => Some(announced || expired),
        };
        match stale {
            None => {}
            Some(true) => {
                debug!(piece_index, "block for piece not claimed by peer, ignoring");
                return Ok(BlockOutcome::Ignored);
            }
            Some(false) => {
                return Err(self
                    .fail_peer(addr, format!("unrequested block for piece {}", piece_index))
                    .await);
            }
        }

        let written = match self.store.get(piece_index) {
            Some(piece) => piece
                .write_block(offset, data)
                .map(|()| (piece.is_complete(), piece.is_valid())),
            None => Err(BlockError::OutOfRange {
                offset,
                piece_len: 0,
            }),
        };
        let (complete, valid) = match written {
            Ok(status) => status,
            Err(err) => return Err(self.fail_peer(addr, err.to_string()).await),
        };

        if !complete {
            return Ok(BlockOutcome::Pending);
        }
        if !valid {
            let err = PeerError::PieceValidation { piece: piece_index };
            warn!(%err, "giving back piece");
            if let Some(piece) = self.store.get(piece_index) {
                piece.reset();
            }
            self.selector.giveback(addr, piece_index);
            self.notify(PieceStatus::Invalid { piece_index });
            return Ok(BlockOutcome::ValidationFailed);
        }

        self.selector.mark_have(piece_index);
        self.announce_have(piece_index);
        let all_complete = self.store.all_complete();
        self.notify(PieceStatus::Verified {
            piece_index,
            all_complete,
        });
        if all_complete && self.mode != Mode::Seeding {
            info!(pieces = self.selector.piece_count(), "all pieces complete, seeding");
            self.mode = Mode::Seeding;
        }
        Ok(BlockOutcome::Completed {
            seeding: self.mode == Mode::Seeding,
        })
    }

    /// Pick the next block to request from `addr` and send the request.
    /// Peers without an active connection are not given work.
    ///
    /// Continues pieces already claimed by the peer before claiming a new
    /// one. `None` means there is nothing to request from this peer.
    #[tracing::instrument(skip_all, fields(addr = %addr), err)]
    pub async fn request_next_block(&mut self, addr: &PeerAddr) -> Result<Option<BlockRequest>> {
        if self.mode == Mode::Seeding {
            return Ok(None);
        }
        match self.registry.get(addr) {
            Some(peer) if peer.connection().is_some_and(|conn| conn.is_active()) => {}
            Some(_) => {
                trace!("no active connection to request on");
                return Ok(None);
            }
            None => return Ok(None),
        }

        let mut request = None;
        for piece_index in self.selector.claims_of(addr) {
            if let Some(piece) = self.store.get(piece_index) {
                if !piece.is_complete() && !piece.is_fully_requested() {
                    request = piece.next_request();
                    if request.is_some() {
                        break;
                    }
                }
            }
        }

        while request.is_none() {
            let piece_index = match self.selector.poll_best(addr) {
                Some(piece_index) => piece_index,
                None => {
                    trace!("nothing to request");
                    return Ok(None);
                }
            };
            let piece = match self.store.get(piece_index) {
                Some(piece) => piece,
                None => {
                    warn!(piece_index, "claimed piece missing from store");
                    self.selector.mark_have(piece_index);
                    continue;
                }
            };
            if piece.is_complete() {
                if piece.is_valid() {
                    warn!(piece_index, "claimed piece already complete");
                    self.selector.mark_have(piece_index);
                    continue;
                }
                warn!(piece_index, "claimed piece complete but invalid, resetting");
                piece.reset();
            } else if piece.is_fully_requested() {
                warn!(piece_index, "claimed piece already fully requested, releasing requests");
                piece.release_requests();
            }
            request = piece.next_request();
        }
        let request = match request {
            Some(request) => request,
            None => return Ok(None),
        };

        let sent = match self.registry.get_mut(addr) {
            Some(peer) => {
                peer.expired_claims.remove(&request.piece);
                match peer.connection_mut() {
                    Some(conn) => conn.send_request(&request),
                    None => Err(Error::msg("connection closed")),
                }
            }
            None => Err(Error::msg("peer removed")),
        };
        if let Err(err) = sent {
            warn!(?err, piece_index = request.piece, "sending block request");
            if let Some(piece) = self.store.get(request.piece) {
                piece.release_requests();
            }
            self.selector.giveback(addr, request.piece);
            return Err(err.context(format!("requesting block from {}", addr)));
        }
        trace!(piece_index = request.piece, offset = request.offset, "block requested");
        Ok(Some(request))
    }

    /// Open a transport connection to a registered peer. On failure the peer
    /// stays registered so the connection can be retried.
    #[tracing::instrument(skip_all, fields(addr = %addr), err)]
    pub async fn connect(&mut self, addr: &PeerAddr) -> Result<NetHandle> {
        if self.registry.get(addr).is_none() {
            return Err(PeerError::PeerNotFound(addr.to_owned()).into());
        }
        match self.transport.connect(addr).await {
            Ok(handle) => {
                if let Some(peer) = self.registry.get_mut(addr) {
                    peer.set_net_handle(Some(handle));
                }
                debug!(?handle, "connected");
                Ok(handle)
            }
            Err(err) => {
                warn!(?err, "connect failed");
                Err(PeerError::ConnectFailure {
                    addr: addr.to_owned(),
                    source: err,
                }
                .into())
            }
        }
    }

    /// [`Self::connect`], retrying with exponential backoff until connected,
    /// cancelled, or `connect_max_elapsed` has passed.
    #[tracing::instrument(skip_all, fields(addr = %addr), err)]
    pub async fn connect_with_backoff(
        &mut self,
        addr: &PeerAddr,
        cancel: CancellationToken,
    ) -> Result<NetHandle> {
        let mut retry = ExponentialBackoff {
            initial_interval: self.config.connect_initial_interval,
            current_interval: self.config.connect_initial_interval,
            max_elapsed_time: Some(self.config.connect_max_elapsed),
            ..ExponentialBackoff::default()
        };
        retry.reset();
        let mut attempt = 0u32;
        loop {
            let err = match self.connect(addr).await {
                Ok(handle) => {
                    if attempt > 0 {
                        info!(attempt, "retry successful");
                    }
                    return Ok(handle);
                }
                Err(err) => err,
            };
            if matches!(
                crate::error::as_peer_error(&err),
                Some(PeerError::PeerNotFound(_))
            ) {
                return Err(err);
            }
            match retry.next_backoff() {
                Some(delay) => {
                    attempt += 1;
                    select! {
                        _ = cancel.cancelled() => {
                            return Err(CancelError.into());
                        }
                        _ = sleep(delay) => {}
                    }
                    warn!(?delay, attempt, "retrying connect");
                }
                None => return Err(err),
            }
        }
    }

    /// Send raw bytes to a peer. Unknown or unconnected peers send nothing.
    pub async fn send(&mut self, addr: &PeerAddr, bytes: &[u8]) -> Result<usize> {
        match self.registry.get(addr).and_then(|peer| peer.net_handle()) {
            Some(handle) => self.transport.send(handle, bytes).await,
            None => {
                debug!(%addr, "send to unconnected peer");
                Ok(0)
            }
        }
    }

    /// Receive raw bytes from a peer. Unknown or unconnected peers read
    /// nothing.
    pub async fn receive(&mut self, addr: &PeerAddr, buf: &mut [u8]) -> Result<usize> {
        match self.registry.get(addr).and_then(|peer| peer.net_handle()) {
            Some(handle) => self.transport.receive(handle, buf).await,
            None => {
                debug!(%addr, "receive from unconnected peer");
                Ok(0)
            }
        }
    }

    /// Tear down a peer: give back its claims, forget its candidates, close
    /// its transport connection and unregister it.
    #[tracing::instrument(skip_all, fields(addr = %addr))]
    pub async fn disconnect(&mut self, addr: &PeerAddr) -> Vec<PieceIndex> {
        let released = self.selector.release_peer(addr);
        for piece_index in released.iter() {
            if let Some(piece) = self.store.get(*piece_index) {
                piece.release_requests();
            }
        }
        let peer = match self.registry.remove(addr) {
            Some(peer) => peer,
            None => return released,
        };
        if let Some(handle) = peer.net_handle() {
            if let Err(err) = self.transport.disconnect(handle).await {
                warn!(?err, "transport disconnect");
            }
        }
        info!(released = released.len(), peers = self.registry.count(), "peer disconnected");
        released
    }

    /// Give back claims that have stalled past `claim_timeout`.
    pub fn expire_stalled_claims(&mut self) -> Vec<(PeerAddr, PieceIndex)> {
        let expired = self.selector.expire_claims(self.config.claim_timeout);
        for (addr, piece_index) in expired.iter() {
            debug!(%addr, piece_index, "claim expired");
            if let Some(peer) = self.registry.get_mut(addr) {
                peer.expired_claims.insert(*piece_index);
            }
            if let Some(piece) = self.store.get(*piece_index) {
                piece.release_requests();
            }
        }
        expired
    }

    fn announce_have(&mut self, piece_index: PieceIndex) {
        let mut sent = 0;
        self.registry.for_each_mut(|peer| {
            if let Some(conn) = peer.connection_mut() {
                if !conn.is_active() {
                    return;
                }
                match conn.send_have(piece_index) {
                    Ok(()) => sent += 1,
                    Err(err) => warn!(?err, addr = %peer.addr(), piece_index, "sending have"),
                }
            }
        });
        trace!(piece_index, sent, "announced have");
    }

    fn notify(&mut self, status: PieceStatus) {
        self.subscribers.retain(|tx| tx.send(status.clone()).is_ok());
    }

    async fn fail_peer(&mut self, addr: &PeerAddr, reason: String) -> Error {
        let err = PeerError::protocol(addr, reason);
        warn!(%err, "disconnecting peer");
        self.disconnect(addr).await;
        err.into()
    }
}
