//! Outstanding block requests and the per-connection list that tracks them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::PieceIndex;

/// Age at which an unanswered request is given up on.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A block request sent to a peer.
#[derive(Debug, Clone)]
pub struct Request {
    pub piece_index: PieceIndex,
    pub begin: u32,
    pub length: u32,
    pub created: Instant,
}

impl Request {
    /// Creates a request stamped with the current time.
    pub fn new(piece_index: PieceIndex, begin: u32, length: u32) -> Self {
        Self::created_at(piece_index, begin, length, Instant::now())
    }

    pub fn created_at(piece_index: PieceIndex, begin: u32, length: u32, created: Instant) -> Self {
        Self {
            piece_index,
            begin,
            length,
            created,
        }
    }

    /// Whether `timeout` or more has elapsed between creation and `now`.
    pub fn is_stale_at(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.created) >= timeout
    }

    /// Whether both requests address the same block.
    pub fn same_block(&self, piece_index: PieceIndex, begin: u32) -> bool {
        self.piece_index == piece_index && self.begin == begin
    }
}

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Requests one connection has in flight.
///
/// Shared between the owning connection and every piece it requested from,
/// so a piece can cancel the request when another peer delivers the block
/// first.
#[derive(Debug)]
pub struct PendingRequests {
    owner_id: u64,
    requests: Mutex<Vec<Request>>,
}

impl PendingRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            owner_id: NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Identifier used in logs.
    pub fn owner_id(&self) -> u64 {
        self.owner_id
    }

    pub fn push(&self, request: Request) {
        self.requests.lock().push(request);
    }

    /// Removes the request for a block, returning it if it was pending.
    pub fn remove(&self, piece_index: PieceIndex, begin: u32) -> Option<Request> {
        let mut requests = self.requests.lock();
        let position = requests
            .iter()
            .position(|request| request.same_block(piece_index, begin))?;
        Some(requests.remove(position))
    }

    pub fn contains(&self, piece_index: PieceIndex, begin: u32) -> bool {
        self.requests
            .lock()
            .iter()
            .any(|request| request.same_block(piece_index, begin))
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }

    /// Removes and returns every request that is stale at `now`.
    pub fn take_stale(&self, now: Instant, timeout: Duration) -> Vec<Request> {
        let mut requests = self.requests.lock();
        let (stale, fresh): (Vec<_>, Vec<_>) = requests
            .drain(..)
            .partition(|request| request.is_stale_at(now, timeout));
        *requests = fresh;
        stale
    }

    /// Removes and returns every pending request.
    pub fn drain(&self) -> Vec<Request> {
        std::mem::take(&mut *self.requests.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_staleness_boundary() {
        let created = Instant::now();
        let request = Request::created_at(PieceIndex::new(0), 0, 16384, created);

        assert!(!request.is_stale_at(created, REQUEST_TIMEOUT));
        assert!(!request.is_stale_at(created + Duration::from_millis(4999), REQUEST_TIMEOUT));
        assert!(request.is_stale_at(created + Duration::from_millis(5000), REQUEST_TIMEOUT));
        assert!(request.is_stale_at(created + Duration::from_secs(60), REQUEST_TIMEOUT));
    }

    #[test]
    fn test_take_stale_keeps_fresh_requests() {
        let now = Instant::now();
        let pending = PendingRequests::new();
        pending.push(Request::created_at(PieceIndex::new(1), 0, 16384, now));
        pending.push(Request::created_at(
            PieceIndex::new(2),
            16384,
            16384,
            now + Duration::from_secs(3),
        ));

        let stale = pending.take_stale(now + Duration::from_secs(6), REQUEST_TIMEOUT);

        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].piece_index, PieceIndex::new(1));
        assert_eq!(pending.len(), 1);
        assert!(pending.contains(PieceIndex::new(2), 16384));
    }

    #[test]
    fn test_remove_and_drain() {
        let pending = PendingRequests::new();
        pending.push(Request::new(PieceIndex::new(3), 0, 100));
        pending.push(Request::new(PieceIndex::new(3), 16384, 100));

        assert!(pending.remove(PieceIndex::new(3), 16384).is_some());
        assert!(pending.remove(PieceIndex::new(3), 16384).is_none());
        assert_eq!(pending.drain().len(), 1);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_owner_ids_are_unique() {
        assert_ne!(PendingRequests::new().owner_id(), PendingRequests::new().owner_id());
    }
}
