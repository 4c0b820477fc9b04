//! Selector handle for peers running on separate tasks

use std::{fmt::Debug, hash::Hash, sync::Arc, time::Duration};

use tokio::sync::Mutex;

use crate::types::PieceIndex;

use super::{selector::PieceSelector, strategy::SelectionStrategy};

/// Cloneable handle to a [`PieceSelector`] shared between tasks.
///
/// Every operation holds the lock for its whole duration, so claims, givebacks
/// and haves are applied atomically with respect to one another.
pub struct SharedPieceSelector<K, S> {
    inner: Arc<Mutex<PieceSelector<K, S>>>,
}

impl<K, S> Clone for SharedPieceSelector<K, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Eq + Hash + Clone + Debug, S: SelectionStrategy> SharedPieceSelector<K, S> {
    pub fn new(selector: PieceSelector<K, S>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(selector)),
        }
    }

    pub async fn add_peer(&self, peer: &K) -> bool {
        self.inner.lock().await.add_peer(peer)
    }

    pub async fn remove_peer(&self, peer: &K) -> bool {
        self.inner.lock().await.remove_peer(peer)
    }

    pub async fn peer_announces(&self, peer: &K, piece_index: PieceIndex) -> bool {
        self.inner.lock().await.peer_announces(peer, piece_index)
    }

    pub async fn mark_have(&self, piece_index: PieceIndex) -> Option<K> {
        self.inner.lock().await.mark_have(piece_index)
    }

    pub async fn poll_best(&self, peer: &K) -> Option<PieceIndex> {
        self.inner.lock().await.poll_best(peer)
    }

    pub async fn giveback(&self, peer: &K, piece_index: PieceIndex) -> bool {
        self.inner.lock().await.giveback(peer, piece_index)
    }

    pub async fn release_peer(&self, peer: &K) -> Vec<PieceIndex> {
        self.inner.lock().await.release_peer(peer)
    }

    pub async fn expire_claims(&self, timeout: Duration) -> Vec<(K, PieceIndex)> {
        self.inner.lock().await.expire_claims(timeout)
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.lock().await.peer_count()
    }

    pub async fn piece_count(&self) -> u32 {
        self.inner.lock().await.piece_count()
    }

    pub async fn is_complete(&self) -> bool {
        self.inner.lock().await.is_complete()
    }

    /// Run `f` with exclusive access, for compound operations that must not
    /// interleave with other tasks.
    pub async fn with<R>(&self, f: impl FnOnce(&mut PieceSelector<K, S>) -> R) -> R {
        let mut selector = self.inner.lock().await;
        f(&mut selector)
    }
}
