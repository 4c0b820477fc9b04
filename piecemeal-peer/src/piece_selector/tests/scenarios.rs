//! End-to-end selector scenarios

use crate::piece_selector::*;

fn selector_with_three_peers_having_piece_one() -> PieceSelector<u32> {
    let mut selector = PieceSelector::new(10);
    for peer in 1..=3 {
        selector.add_peer(&peer);
    }
    for peer in 1..=3 {
        assert!(selector.peer_announces(&peer, 1));
    }
    selector
}

#[test]
fn test_cant_poll_piece_again_until_given_back() {
    let mut selector = selector_with_three_peers_having_piece_one();

    assert_eq!(selector.poll_best(&3), Some(1));
    assert_eq!(selector.poll_best(&3), None);

    selector.giveback(&3, 1);
    assert_eq!(selector.poll_best(&3), Some(1));
}

#[test]
fn test_have_removes_piece_from_polling() {
    let mut selector = selector_with_three_peers_having_piece_one();

    selector.peer_announces(&3, 2);
    // We already own piece 2
    selector.mark_have(2);

    assert_eq!(selector.poll_best(&3), Some(1));
    assert_eq!(selector.poll_best(&3), None);
    for peer in 1..=3 {
        assert_ne!(selector.poll_best(&peer), Some(2));
    }
}

#[test]
fn test_other_peers_locked_out_while_claimed() {
    let mut selector = selector_with_three_peers_having_piece_one();

    assert_eq!(selector.poll_best(&1), Some(1));
    assert_eq!(selector.poll_best(&2), None);
    assert_eq!(selector.poll_best(&3), None);
    assert_eq!(selector.state(1), PieceState::Claimed(&1));

    // Peer 2 dropped piece 1 from its queue while polling; giving back puts
    // it back for every peer that announced it.
    assert!(selector.giveback(&1, 1));
    assert_eq!(selector.state(1), PieceState::Unclaimed);
    assert_eq!(selector.poll_best(&2), Some(1));
    assert_eq!(selector.poll_best(&1), None);
}

#[test]
fn test_have_is_permanent() {
    let mut selector = selector_with_three_peers_having_piece_one();

    assert_eq!(selector.poll_best(&2), Some(1));
    assert_eq!(selector.mark_have(1), Some(2));
    assert_eq!(selector.state(1), PieceState::Have);

    // Giving back a had piece changes nothing
    assert!(!selector.giveback(&2, 1));
    for peer in 1..=3 {
        selector.peer_announces(&peer, 1);
        assert_eq!(selector.poll_best(&peer), None);
    }
    assert_eq!(selector.state(1), PieceState::Have);
}

#[test]
fn test_download_everything_across_peers() {
    let mut selector: PieceSelector<&str> = PieceSelector::new(6);
    selector.add_peer(&"a");
    selector.add_peer(&"b");
    for piece_index in 0..4 {
        selector.peer_announces(&"a", piece_index);
    }
    for piece_index in 2..6 {
        selector.peer_announces(&"b", piece_index);
    }

    let mut fetched = vec![];
    loop {
        let mut progress = false;
        for peer in ["a", "b"] {
            if let Some(piece_index) = selector.poll_best(&peer) {
                selector.mark_have(piece_index);
                fetched.push(piece_index);
                progress = true;
            }
        }
        if !progress {
            break;
        }
    }

    fetched.sort();
    assert_eq!(fetched, vec![0, 1, 2, 3, 4, 5]);
    assert!(selector.is_complete());
    assert_eq!(selector.claimed_count(), 0);
}
