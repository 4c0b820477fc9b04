//! Core piece selector bookkeeping

use std::{
    collections::{BinaryHeap, HashMap, HashSet},
    fmt::Debug,
    hash::Hash,
    time::{Duration, Instant},
};

use tracing::{debug, trace, warn};

use crate::{piece_map::PieceMap, types::PieceIndex};

use super::strategy::{IndexOrder, SelectionStrategy};

/// Global state of a piece, shared across all peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState<K> {
    /// No request for the piece is in flight.
    Unclaimed,
    /// Exactly one peer is serving the piece.
    Claimed(K),
    /// Possessed and validated locally. Terminal.
    Have,
}

/// Queue entry. Ordered by rank, then by piece index, both descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Candidate {
    rank: i64,
    piece_index: PieceIndex,
}

#[derive(Default)]
struct PeerCandidates {
    /// Candidates not yet polled from this peer.
    queue: BinaryHeap<Candidate>,

    /// Piece indexes currently in `queue`, to keep it free of duplicates.
    queued: HashSet<PieceIndex>,

    /// Every piece this peer has announced.
    known: HashSet<PieceIndex>,
}

#[derive(Debug, Clone)]
struct Claim<K> {
    peer: K,
    claimed_at: Instant,
}

/// Decides which piece to request next from each peer, and keeps the claim
/// bookkeeping that prevents two peers serving the same piece at once.
///
/// Peers are identified by any hashable key; the selector does not care what
/// a peer is beyond that.
pub struct PieceSelector<K, S = IndexOrder> {
    strategy: S,
    n_pieces: u32,
    peers: HashMap<K, PeerCandidates>,
    claims: HashMap<PieceIndex, Claim<K>>,
    have: PieceMap,
    have_count: usize,
    availability: HashMap<PieceIndex, u32>,
}

impl<K: Eq + Hash + Clone + Debug> PieceSelector<K, IndexOrder> {
    /// Create a selector over `n_pieces` pieces, all initially unclaimed,
    /// polling in descending index order.
    pub fn new(n_pieces: u32) -> Self {
        Self::with_strategy(n_pieces, IndexOrder)
    }
}

impl<K: Eq + Hash + Clone + Debug, S: SelectionStrategy> PieceSelector<K, S> {
    pub fn with_strategy(n_pieces: u32, strategy: S) -> Self {
        PieceSelector {
            strategy,
            n_pieces,
            peers: HashMap::new(),
            claims: HashMap::new(),
            have: PieceMap::with_capacity(n_pieces as usize),
            have_count: 0,
            availability: HashMap::new(),
        }
    }

    /// Start tracking candidates for a peer. No-op if already tracked.
    pub fn add_peer(&mut self, peer: &K) -> bool {
        if self.peers.contains_key(peer) {
            return false;
        }
        trace!(?peer, "add peer");
        self.peers.insert(peer.clone(), PeerCandidates::default());
        true
    }

    /// Discard a peer's candidates. Claims it holds stay claimed until given
    /// back.
    pub fn remove_peer(&mut self, peer: &K) -> bool {
        let candidates = match self.peers.remove(peer) {
            Some(candidates) => candidates,
            None => return false,
        };
        for piece_index in candidates.known.iter() {
            if let Some(count) = self.availability.get_mut(piece_index) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.availability.remove(piece_index);
                }
            }
        }
        if self.strategy.uses_availability() {
            self.rerank(&candidates.known);
        }
        trace!(?peer, "removed peer");
        true
    }

    /// Record that `peer` possesses `piece_index`, making it a candidate for
    /// that peer unless we already have it.
    ///
    /// Returns false if the peer is not tracked or the index is out of range.
    pub fn peer_announces(&mut self, peer: &K, piece_index: PieceIndex) -> bool {
        if piece_index >= self.n_pieces {
            warn!(?peer, piece_index, n_pieces = self.n_pieces, "announced piece out of range");
            return false;
        }
        let candidates = match self.peers.get_mut(peer) {
            Some(candidates) => candidates,
            None => return false,
        };
        if candidates.known.insert(piece_index) {
            *self.availability.entry(piece_index).or_default() += 1;
        }

        if self.have.get(piece_index) || candidates.queued.contains(&piece_index) {
            return true;
        }
        if let Some(claim) = self.claims.get(&piece_index) {
            if &claim.peer == peer {
                return true;
            }
        }

        let rank = rank_of(&self.strategy, &self.availability, piece_index);
        candidates.queued.insert(piece_index);
        candidates.queue.push(Candidate { rank, piece_index });
        true
    }

    /// Mark a piece as possessed and validated. Permanent; any claim on the
    /// piece is dropped and its claimant returned.
    pub fn mark_have(&mut self, piece_index: PieceIndex) -> Option<K> {
        if piece_index >= self.n_pieces {
            warn!(piece_index, n_pieces = self.n_pieces, "have piece out of range");
            return None;
        }
        if !self.have.get(piece_index) {
            self.have.set(piece_index);
            self.have_count += 1;
        }
        let prior = self.claims.remove(&piece_index).map(|claim| claim.peer);
        debug!(piece_index, ?prior, have = self.have_count, "have piece");
        prior
    }

    /// Claim the best unclaimed candidate this peer can serve.
    ///
    /// Candidates that are already claimed elsewhere or already had are
    /// dropped from the peer's queue on the way. A candidate whose rank went
    /// down since it was queued is re-queued once per poll.
    pub fn poll_best(&mut self, peer: &K) -> Option<PieceIndex> {
        let candidates = self.peers.get_mut(peer)?;
        let mut reranked = HashSet::new();
        while let Some(candidate) = candidates.queue.pop() {
            let piece_index = candidate.piece_index;
            if self.have.get(piece_index) || self.claims.contains_key(&piece_index) {
                candidates.queued.remove(&piece_index);
                continue;
            }
            if self.strategy.uses_availability() {
                let rank = rank_of(&self.strategy, &self.availability, piece_index);
                if rank < candidate.rank && reranked.insert(piece_index) {
                    candidates.queue.push(Candidate { rank, piece_index });
                    continue;
                }
            }
            candidates.queued.remove(&piece_index);
            self.claims.insert(
                piece_index,
                Claim {
                    peer: peer.clone(),
                    claimed_at: Instant::now(),
                },
            );
            trace!(?peer, piece_index, "claimed piece");
            return Some(piece_index);
        }
        None
    }

    /// Release `peer`'s claim on a piece so it can be polled again, by this
    /// peer or any other that announced it.
    ///
    /// Returns false if `peer` did not hold the claim.
    pub fn giveback(&mut self, peer: &K, piece_index: PieceIndex) -> bool {
        match self.claims.get(&piece_index) {
            Some(claim) if &claim.peer == peer => {}
            _ => return false,
        }
        self.claims.remove(&piece_index);
        self.requeue(piece_index);
        debug!(?peer, piece_index, "gave back piece");
        true
    }

    /// Give back every claim held by `peer`, then stop tracking it.
    pub fn release_peer(&mut self, peer: &K) -> Vec<PieceIndex> {
        let released = self.claims_of(peer);
        for piece_index in released.iter() {
            self.giveback(peer, *piece_index);
        }
        self.remove_peer(peer);
        released
    }

    /// Give back every claim held for at least `timeout`.
    pub fn expire_claims(&mut self, timeout: Duration) -> Vec<(K, PieceIndex)> {
        let expired: Vec<(K, PieceIndex)> = self
            .claims
            .iter()
            .filter(|(_, claim)| claim.claimed_at.elapsed() >= timeout)
            .map(|(piece_index, claim)| (claim.peer.clone(), *piece_index))
            .collect();
        if expired.is_empty() {
            return expired;
        }
        debug!(count = expired.len(), "expiring stalled claims");
        for (peer, piece_index) in expired.iter() {
            self.giveback(peer, *piece_index);
        }
        expired
    }

    /// Recompute queued ranks for peers holding any of `changed`. Ranks that
    /// rose are not caught when popped, so the heaps are rebuilt eagerly.
    fn rerank(&mut self, changed: &HashSet<PieceIndex>) {
        for candidates in self.peers.values_mut() {
            if !candidates.queued.iter().any(|piece_index| changed.contains(piece_index)) {
                continue;
            }
            candidates.queue = candidates
                .queued
                .iter()
                .map(|piece_index| Candidate {
                    rank: rank_of(&self.strategy, &self.availability, *piece_index),
                    piece_index: *piece_index,
                })
                .collect();
        }
    }

    fn requeue(&mut self, piece_index: PieceIndex) {
        if self.have.get(piece_index) {
            return;
        }
        let rank = rank_of(&self.strategy, &self.availability, piece_index);
        for candidates in self.peers.values_mut() {
            if candidates.known.contains(&piece_index) && candidates.queued.insert(piece_index) {
                candidates.queue.push(Candidate { rank, piece_index });
            }
        }
    }
}

impl<K: Eq + Hash, S> PieceSelector<K, S> {
    pub fn state(&self, piece_index: PieceIndex) -> PieceState<&K> {
        if self.have.get(piece_index) {
            PieceState::Have
        } else if let Some(claim) = self.claims.get(&piece_index) {
            PieceState::Claimed(&claim.peer)
        } else {
            PieceState::Unclaimed
        }
    }

    pub fn contains_peer(&self, peer: &K) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn piece_count(&self) -> u32 {
        self.n_pieces
    }

    pub fn have_count(&self) -> usize {
        self.have_count
    }

    pub fn claimed_count(&self) -> usize {
        self.claims.len()
    }

    pub fn is_complete(&self) -> bool {
        self.have_count == self.n_pieces as usize
    }

    /// Number of tracked peers that announced the piece.
    pub fn availability(&self, piece_index: PieceIndex) -> u32 {
        self.availability.get(&piece_index).copied().unwrap_or(0)
    }

    /// Pieces claimed by `peer`, ascending.
    pub fn claims_of(&self, peer: &K) -> Vec<PieceIndex> {
        let mut pieces: Vec<PieceIndex> = self
            .claims
            .iter()
            .filter(|(_, claim)| &claim.peer == peer)
            .map(|(piece_index, _)| *piece_index)
            .collect();
        pieces.sort_unstable();
        pieces
    }

    /// Number of queued candidates for `peer`, including ones that will be
    /// skipped at poll time.
    pub fn candidate_count(&self, peer: &K) -> usize {
        self.peers
            .get(peer)
            .map(|candidates| candidates.queued.len())
            .unwrap_or(0)
    }

    pub fn have_map(&self) -> &PieceMap {
        &self.have
    }
}

fn rank_of<S: SelectionStrategy>(
    strategy: &S,
    availability: &HashMap<PieceIndex, u32>,
    piece_index: PieceIndex,
) -> i64 {
    strategy.rank(
        piece_index,
        availability.get(&piece_index).copied().unwrap_or(0),
    )
}
