use tokio::task::JoinSet;

use crate::piece_selector::*;

const N_PEERS: u32 = 16;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_polls_have_one_winner() {
    let selector = SharedPieceSelector::new(PieceSelector::<u32>::new(1));
    for peer in 0..N_PEERS {
        selector.add_peer(&peer).await;
        assert!(selector.peer_announces(&peer, 0).await);
    }

    let mut tasks = JoinSet::new();
    for peer in 0..N_PEERS {
        let selector = selector.clone();
        tasks.spawn(async move { (peer, selector.poll_best(&peer).await) });
    }
    let results = tasks.join_all().await;

    let winners: Vec<u32> = results
        .iter()
        .filter_map(|(peer, polled)| polled.map(|_| *peer))
        .collect();
    assert_eq!(winners.len(), 1, "exactly one peer should claim the piece");

    // After giveback, some other peer that announced it can claim it
    let winner = winners[0];
    assert!(selector.giveback(&winner, 0).await);
    let other = (winner + 1) % N_PEERS;
    // The other peer dropped the piece while it was claimed; giveback queued
    // it again.
    assert_eq!(selector.poll_best(&other).await, Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_download_claims_each_piece_once() {
    let n_pieces = 64;
    let selector = SharedPieceSelector::new(PieceSelector::with_strategy(
        n_pieces,
        StrategyKind::RarestFirst.build(),
    ));
    for peer in 0..4u32 {
        selector.add_peer(&peer).await;
        for piece_index in 0..n_pieces {
            if piece_index % (peer + 1) == 0 || piece_index % 4 == peer {
                selector.peer_announces(&peer, piece_index).await;
            }
        }
    }

    let mut tasks = JoinSet::new();
    for peer in 0..4u32 {
        let selector = selector.clone();
        tasks.spawn(async move {
            let mut fetched = vec![];
            while let Some(piece_index) = selector.poll_best(&peer).await {
                tokio::task::yield_now().await;
                selector.mark_have(piece_index).await;
                fetched.push(piece_index);
            }
            fetched
        });
    }
    let mut fetched: Vec<u32> = tasks.join_all().await.into_iter().flatten().collect();
    fetched.sort();

    assert_eq!(fetched, (0..n_pieces).collect::<Vec<_>>());
    assert!(selector.is_complete().await);
    assert_eq!(selector.with(|s| s.claimed_count()).await, 0);
}
