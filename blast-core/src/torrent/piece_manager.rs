//! Chooses which pieces to pursue and which one to request from a peer.
//!
//! All incomplete pieces start in a shuffled backlog. A background loop
//! moves them into a bounded working set and evicts pieces that completed.
//! Peers are offered the working-set piece with the fewest outstanding
//! requests per block that they actually have.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::watch;

use super::piece::Piece;
use super::protocol::Bitfield;
use super::request::{PendingRequests, Request};
use super::session::TorrentState;
use super::PieceIndex;

/// Default bound on the working set.
pub const MAX_PIECES_OF_INTEREST: usize = 100;

/// Piece scheduler shared by every connection of a torrent.
pub struct PieceManager {
    pieces: Arc<Vec<Arc<Piece>>>,
    max_of_interest: usize,
    state: Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    needed: Vec<PieceIndex>,
    of_interest: Vec<PieceIndex>,
    tracked: HashSet<PieceIndex>,
}

impl PieceManager {
    /// Creates a scheduler over `pieces`, backlogging every incomplete one.
    pub fn new(pieces: Arc<Vec<Arc<Piece>>>, max_of_interest: usize) -> Self {
        let mut state = SchedulerState::default();
        for piece in pieces.iter().filter(|piece| !piece.is_complete()) {
            state.needed.push(piece.index());
            state.tracked.insert(piece.index());
        }
        state.needed.shuffle(&mut rand::rng());

        Self {
            pieces,
            max_of_interest,
            state: Mutex::new(state),
        }
    }

    /// Evicts completed pieces from the working set and refills it.
    ///
    /// Pieces that lost their completion after a failed re-verification are
    /// put back into the backlog first.
    pub fn update_priorities(&self) {
        let mut state = self.state.lock();
        let SchedulerState {
            needed,
            of_interest,
            tracked,
        } = &mut *state;

        of_interest.retain(|index| {
            let complete = self.pieces[index.as_usize()].is_complete();
            if complete {
                tracked.remove(index);
            }
            !complete
        });
        needed.retain(|index| {
            let complete = self.pieces[index.as_usize()].is_complete();
            if complete {
                tracked.remove(index);
            }
            !complete
        });

        for piece in self.pieces.iter() {
            if !piece.is_complete() && tracked.insert(piece.index()) {
                tracing::debug!("Re-queued piece after reset: piece={}", piece.index());
                needed.push(piece.index());
            }
        }

        while of_interest.len() < self.max_of_interest {
            let Some(index) = needed.pop() else {
                break;
            };
            of_interest.push(index);
        }
    }

    /// Most useful working-set piece the peer can provide.
    ///
    /// The working set is ordered by ascending average of pending requests
    /// per block, so load spreads across pieces.
    pub fn needed_and_available_piece(&self, available: &Bitfield) -> Option<Arc<Piece>> {
        self.available_pieces(available).into_iter().next()
    }

    /// Every incomplete working-set piece the peer has, most useful first.
    pub fn available_pieces(&self, available: &Bitfield) -> Vec<Arc<Piece>> {
        let mut state = self.state.lock();
        let mut ranked: Vec<(f64, PieceIndex)> = state
            .of_interest
            .iter()
            .map(|index| (self.pieces[index.as_usize()].average_request_count(), *index))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
        state.of_interest = ranked.iter().map(|(_, index)| *index).collect();

        state
            .of_interest
            .iter()
            .map(|index| &self.pieces[index.as_usize()])
            .filter(|piece| available.has(piece.index().as_usize()) && !piece.is_complete())
            .cloned()
            .collect()
    }

    /// Registers a request on the owning piece.
    pub fn add_request(&self, request: Request, owner: Arc<PendingRequests>) {
        if let Some(piece) = self.pieces.get(request.piece_index.as_usize()) {
            piece.add_request(request, owner);
        }
    }

    /// Removes a request from the owning piece.
    pub fn remove_request(&self, request: &Request, owner: &Arc<PendingRequests>) {
        if let Some(piece) = self.pieces.get(request.piece_index.as_usize()) {
            piece.remove_request(request.begin, owner);
        }
    }

    /// Indices currently in the working set.
    pub fn requested_pieces(&self) -> Vec<PieceIndex> {
        self.state.lock().of_interest.clone()
    }

    /// Pieces still waiting in the backlog.
    pub fn backlog_len(&self) -> usize {
        self.state.lock().needed.len()
    }

    /// Refills the working set every `tick` until the torrent stops.
    pub async fn run(self: Arc<Self>, mut state_rx: watch::Receiver<TorrentState>, tick: Duration) {
        tracing::debug!("Piece scheduler started: pieces={}", self.pieces.len());
        loop {
            let stopped = *state_rx.borrow() == TorrentState::Stopped;
            if stopped {
                break;
            }
            self.update_priorities();

            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Piece scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::layout::BLOCK_SIZE;
    use crate::storage::{BlockLayout, BlockStore, MemoryBlockStore};
    use crate::storage::test_fixtures::patterned_bytes;
    use crate::torrent::piece::sha1_digest;

    fn pieces(count: u32) -> Arc<Vec<Arc<Piece>>> {
        Arc::new(
            (0..count)
                .map(|i| {
                    Arc::new(Piece::new(PieceIndex::new(i), 2 * BLOCK_SIZE, [0; 20], None).unwrap())
                })
                .collect(),
        )
    }

    fn bitfield_with(count: usize, indices: &[usize]) -> Bitfield {
        let mut bitfield = Bitfield::new(count);
        for &index in indices {
            bitfield.set(index);
        }
        bitfield
    }

    #[test]
    fn test_working_set_is_bounded() {
        let manager = PieceManager::new(pieces(150), MAX_PIECES_OF_INTEREST);
        assert_eq!(manager.backlog_len(), 150);

        manager.update_priorities();

        assert_eq!(manager.requested_pieces().len(), 100);
        assert_eq!(manager.backlog_len(), 50);
    }

    #[test]
    fn test_empty_working_set_offers_nothing() {
        let manager = PieceManager::new(pieces(4), 10);
        let everything = bitfield_with(4, &[0, 1, 2, 3]);
        assert!(manager.needed_and_available_piece(&everything).is_none());

        manager.update_priorities();
        assert!(manager.needed_and_available_piece(&everything).is_some());
        assert!(manager
            .needed_and_available_piece(&Bitfield::new(4))
            .is_none());
    }

    #[test]
    fn test_prefers_least_requested_available_piece() {
        let all = pieces(3);
        let manager = PieceManager::new(all.clone(), 10);
        manager.update_priorities();

        let owner = PendingRequests::new();
        manager.add_request(Request::new(PieceIndex::new(0), 0, BLOCK_SIZE), owner.clone());
        manager.add_request(Request::new(PieceIndex::new(0), BLOCK_SIZE, BLOCK_SIZE), owner.clone());
        manager.add_request(Request::new(PieceIndex::new(1), 0, BLOCK_SIZE), owner.clone());

        let peer_has_all = bitfield_with(3, &[0, 1, 2]);
        let chosen = manager.needed_and_available_piece(&peer_has_all).unwrap();
        assert_eq!(chosen.index(), PieceIndex::new(2));

        let peer_has_some = bitfield_with(3, &[0, 1]);
        let chosen = manager.needed_and_available_piece(&peer_has_some).unwrap();
        assert_eq!(chosen.index(), PieceIndex::new(1));

        manager.remove_request(&Request::new(PieceIndex::new(0), 0, BLOCK_SIZE), &owner);
        manager.remove_request(&Request::new(PieceIndex::new(0), BLOCK_SIZE, BLOCK_SIZE), &owner);
        assert_eq!(all[0].average_request_count(), 0.0);
    }

    #[test]
    fn test_available_pieces_are_ranked_and_filtered() {
        let manager = PieceManager::new(pieces(3), 10);
        manager.update_priorities();

        let owner = PendingRequests::new();
        manager.add_request(Request::new(PieceIndex::new(0), 0, BLOCK_SIZE), owner.clone());
        manager.add_request(Request::new(PieceIndex::new(0), BLOCK_SIZE, BLOCK_SIZE), owner.clone());
        manager.add_request(Request::new(PieceIndex::new(2), 0, BLOCK_SIZE), owner);

        let ranked: Vec<PieceIndex> = manager
            .available_pieces(&bitfield_with(3, &[0, 1, 2]))
            .iter()
            .map(|piece| piece.index())
            .collect();
        assert_eq!(ranked, vec![PieceIndex::new(1), PieceIndex::new(2), PieceIndex::new(0)]);

        let ranked = manager.available_pieces(&bitfield_with(3, &[0]));
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].index(), PieceIndex::new(0));
    }

    #[tokio::test]
    async fn test_completed_pieces_are_evicted_and_reset_pieces_requeued() {
        let size = BLOCK_SIZE;
        let payload = patterned_bytes(size as usize, 1);
        let layout = BlockLayout::new(size, u64::from(size));
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new(layout));
        let piece = Arc::new(
            Piece::new(PieceIndex::new(0), size, sha1_digest(&payload), Some(store.clone())).unwrap(),
        );
        let manager = PieceManager::new(Arc::new(vec![piece.clone()]), 10);
        manager.update_priorities();
        assert_eq!(manager.requested_pieces(), vec![PieceIndex::new(0)]);

        piece.feed(0, &payload).await.unwrap();
        assert!(piece.check().await.unwrap());
        manager.update_priorities();
        assert!(manager.requested_pieces().is_empty());

        // Corrupt the stored block, then re-verify as the lifecycle does.
        store
            .write_block(PieceIndex::new(0), 0, &vec![0u8; size as usize])
            .await
            .unwrap();
        assert!(!piece.verify_existing().await.unwrap());

        manager.update_priorities();
        assert_eq!(manager.requested_pieces(), vec![PieceIndex::new(0)]);
    }

    #[tokio::test]
    async fn test_run_exits_when_stopped() {
        let manager = Arc::new(PieceManager::new(pieces(2), 10));
        let (state_tx, state_rx) = watch::channel(TorrentState::Started);

        let handle = tokio::spawn(manager.clone().run(state_rx, Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.requested_pieces().len(), 2);

        state_tx.send(TorrentState::Stopped).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
