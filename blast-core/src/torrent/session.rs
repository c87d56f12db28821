//! Torrent lifecycle: checking, downloading, seeding and shutdown.
//!
//! A [`Torrent`] owns its pieces, the piece scheduler and every peer
//! connection. Its lifecycle task dials known peers up to the configured
//! cap, reaps finished connections, detects completion and keeps trackers
//! informed.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Instant;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::metainfo::TorrentMetadata;
use super::peer_connection::{ConnectionRole, PeerConnection, PeerStatus, TorrentContext};
use super::piece::Piece;
use super::piece_manager::PieceManager;
use super::protocol::{PeerHandshake, PeerId};
use super::tracker::{
    AnnounceEvent, AnnounceRequest, DEFAULT_NUMWANT, HttpTrackerClient, TrackerClient,
};
use super::{InfoHash, PieceIndex, TorrentError};
use crate::config::BlastConfig;
use crate::storage::{BlockStore, FileBlockStore};

/// Lifecycle state of a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    Stopped,
    Checking,
    Started,
    Completed,
}

impl fmt::Display for TorrentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TorrentState::Stopped => "stopped",
            TorrentState::Checking => "checking",
            TorrentState::Started => "started",
            TorrentState::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Snapshot of a torrent's progress.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentStats {
    pub state: TorrentState,
    pub piece_count: u32,
    pub pieces_complete: u32,
    /// Verified share of the payload, 0.0 to 100.0.
    pub completeness: f64,
    pub left: u64,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Wire bytes per second over the last few seconds, all peers together.
    pub upload_rate: f64,
    pub download_rate: f64,
    pub connected_peers: usize,
    pub known_peers: usize,
    pub peers: Vec<PeerStats>,
}

/// Snapshot of one connected peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerStats {
    pub address: SocketAddr,
    /// Remote completion, 0.0 to 100.0.
    pub completion: f64,
    pub upload_rate: f64,
    pub download_rate: f64,
}

struct ActivePeer {
    status: Arc<PeerStatus>,
    outbound: bool,
    handle: JoinHandle<Result<(), TorrentError>>,
}

#[derive(Default)]
struct PeerSet {
    known: VecDeque<SocketAddr>,
    connected: HashMap<SocketAddr, ActivePeer>,
}

struct TrackerSlot {
    client: Arc<dyn TrackerClient>,
    last_announce: Option<Instant>,
    tracker_id: Option<String>,
}

#[derive(Default)]
struct Tasks {
    lifecycle: Option<JoinHandle<()>>,
    scheduler: Option<JoinHandle<()>>,
}

/// A single-file torrent and everything needed to download or seed it.
pub struct Torrent {
    metadata: TorrentMetadata,
    context: Arc<TorrentContext>,
    state_tx: watch::Sender<TorrentState>,
    peers: Mutex<PeerSet>,
    trackers: tokio::sync::Mutex<Vec<TrackerSlot>>,
    tasks: tokio::sync::Mutex<Tasks>,
    listen_port: AtomicU16,
}

impl Torrent {
    /// Creates a stopped torrent whose pieces live in `store`.
    ///
    /// An HTTP tracker client is created for every supported announce URL;
    /// other schemes are skipped with a warning.
    ///
    /// # Errors
    /// - `TorrentError::InvalidPieceSize` - Piece length outside the block bounds
    pub fn new(
        metadata: TorrentMetadata,
        store: Option<Arc<dyn BlockStore>>,
        config: Arc<BlastConfig>,
    ) -> Result<Arc<Self>, TorrentError> {
        let pieces = build_pieces(&metadata, store)?;
        let piece_manager = Arc::new(PieceManager::new(
            pieces.clone(),
            config.torrent.max_pieces_of_interest,
        ));
        let (state_tx, state_rx) = watch::channel(TorrentState::Stopped);
        let context = Arc::new(TorrentContext::new(
            metadata.info_hash,
            PeerId::generate(),
            pieces,
            piece_manager,
            config.clone(),
            state_rx,
        ));

        let mut trackers = Vec::new();
        for url in &metadata.announce_urls {
            match HttpTrackerClient::new(url.clone(), &config.network) {
                Ok(client) => trackers.push(TrackerSlot::new(Arc::new(client))),
                Err(e) => tracing::warn!("Skipping tracker: url={url}, error={e}"),
            }
        }

        Ok(Arc::new(Self {
            listen_port: AtomicU16::new(config.network.listen_port),
            metadata,
            context,
            state_tx,
            peers: Mutex::new(PeerSet::default()),
            trackers: tokio::sync::Mutex::new(trackers),
            tasks: tokio::sync::Mutex::new(Tasks::default()),
        }))
    }

    /// Creates a stopped torrent stored in `<download_dir>/<name>`.
    ///
    /// # Errors
    /// - `TorrentError::Storage` - Payload file could not be opened or sized
    /// - Any error [`Self::new`] returns
    pub async fn open(
        metadata: TorrentMetadata,
        config: Arc<BlastConfig>,
    ) -> Result<Arc<Self>, TorrentError> {
        let path = config.storage.download_dir.join(&metadata.name);
        let store = FileBlockStore::open(&path, metadata.layout()).await?;
        Self::new(metadata, Some(Arc::new(store)), config)
    }

    pub fn info_hash(&self) -> InfoHash {
        self.metadata.info_hash
    }

    pub fn metadata(&self) -> &TorrentMetadata {
        &self.metadata
    }

    pub fn peer_id(&self) -> PeerId {
        self.context.peer_id
    }

    pub fn state(&self) -> TorrentState {
        *self.state_tx.borrow()
    }

    /// Subscribes to lifecycle state changes.
    pub fn subscribe(&self) -> watch::Receiver<TorrentState> {
        self.state_tx.subscribe()
    }

    /// Port reported to trackers.
    pub fn set_listen_port(&self, port: u16) {
        self.listen_port.store(port, Ordering::Relaxed);
    }

    /// Registers an extra tracker next to the ones from the metainfo.
    pub async fn add_tracker(&self, client: Arc<dyn TrackerClient>) {
        self.trackers.lock().await.push(TrackerSlot::new(client));
    }

    /// Adds candidate peers; addresses already known or connected are skipped.
    pub fn add_peers(&self, addresses: impl IntoIterator<Item = SocketAddr>) {
        let mut peers = self.peers.lock();
        for address in addresses {
            if !peers.known.contains(&address) && !peers.connected.contains_key(&address) {
                peers.known.push_back(address);
            }
        }
    }

    /// Verifies on-disk data and starts downloading or seeding.
    ///
    /// A no-op unless the torrent is stopped. Returns once every piece has
    /// been checked; peers and trackers are handled by a background task.
    ///
    /// # Errors
    /// - `TorrentError::Storage` - A piece could not be read back; the
    ///   torrent stays stopped
    pub async fn start(self: &Arc<Self>) -> Result<(), TorrentError> {
        let mut tasks = self.tasks.lock().await;
        if self.state() != TorrentState::Stopped {
            return Ok(());
        }

        tracing::info!(
            "Checking torrent: name={}, info_hash={}",
            self.metadata.name,
            self.info_hash()
        );
        self.state_tx.send_replace(TorrentState::Checking);
        let complete = match self.verify_all().await {
            Ok(complete) => complete,
            Err(e) => {
                self.state_tx.send_replace(TorrentState::Stopped);
                return Err(e);
            }
        };

        let state = if complete {
            TorrentState::Completed
        } else {
            TorrentState::Started
        };
        self.state_tx.send_replace(state);
        tracing::info!(
            "Torrent {state}: name={}, left={}",
            self.metadata.name,
            self.left()
        );

        let scheduler = self.context.piece_manager.clone();
        tasks.scheduler = Some(tokio::spawn(scheduler.run(
            self.state_tx.subscribe(),
            self.context.config.torrent.scheduler_tick,
        )));
        tasks.lifecycle = Some(tokio::spawn(self.clone().lifecycle()));
        Ok(())
    }

    /// Stops the torrent and waits until every connection has closed.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        if self.state() == TorrentState::Stopped && tasks.lifecycle.is_none() {
            return;
        }

        tracing::info!("Stopping torrent: name={}", self.metadata.name);
        self.state_tx.send_replace(TorrentState::Stopped);

        if let Some(lifecycle) = tasks.lifecycle.take() {
            if let Err(e) = lifecycle.await {
                tracing::warn!("Lifecycle task failed: error={e}");
            }
        }
        if let Some(scheduler) = tasks.scheduler.take() {
            if let Err(e) = scheduler.await {
                tracing::warn!("Scheduler task failed: error={e}");
            }
        }
    }

    /// Hands an inbound socket whose handshake was already read to this
    /// torrent.
    ///
    /// # Errors
    /// - `TorrentError::TorrentStopped` - Torrent is not running
    /// - `TorrentError::ConnectionLimitExceeded` - Peer cap reached
    pub fn accept_inbound(
        &self,
        stream: TcpStream,
        address: SocketAddr,
        handshake: PeerHandshake,
    ) -> Result<(), TorrentError> {
        // Checked under the lock so a concurrent stop either sees this peer
        // when it drains the set or refuses it here.
        let mut peers = self.peers.lock();
        if self.state() == TorrentState::Stopped {
            return Err(TorrentError::TorrentStopped {
                info_hash: self.info_hash(),
            });
        }
        if peers.connected.len() >= self.context.config.network.max_peer_connections {
            return Err(TorrentError::ConnectionLimitExceeded);
        }
        if peers.connected.contains_key(&address) {
            return Err(TorrentError::PeerConnectionError {
                reason: format!("Already connected to {address}"),
            });
        }

        let connection = PeerConnection::new(address, self.context.clone());
        let status = connection.status();
        let handle = tokio::spawn(connection.run(stream, ConnectionRole::Inbound { handshake }));
        peers.connected.insert(
            address,
            ActivePeer {
                status,
                outbound: false,
                handle,
            },
        );
        tracing::debug!("Accepted inbound peer: peer={address}");
        Ok(())
    }

    /// Current progress figures.
    pub fn stats(&self) -> TorrentStats {
        let pieces = &self.context.pieces;
        let pieces_complete = pieces.iter().filter(|piece| piece.is_complete()).count() as u32;
        let left = self.left();
        let completeness = if self.metadata.total_length == 0 {
            100.0
        } else {
            100.0 * (self.metadata.total_length - left) as f64 / self.metadata.total_length as f64
        };

        let peers = self.peers.lock();
        let peer_stats = peers
            .connected
            .values()
            .map(|peer| PeerStats {
                address: peer.status.address(),
                completion: peer.status.completion(),
                upload_rate: peer.status.upload_rate(),
                download_rate: peer.status.download_rate(),
            })
            .collect();

        TorrentStats {
            state: self.state(),
            piece_count: pieces.len() as u32,
            pieces_complete,
            completeness,
            left,
            uploaded: self.context.uploaded.load(Ordering::Relaxed),
            downloaded: self.context.downloaded.load(Ordering::Relaxed),
            upload_rate: self.context.upload_meter.rate(),
            download_rate: self.context.download_meter.rate(),
            connected_peers: peers.connected.len(),
            known_peers: peers.known.len(),
            peers: peer_stats,
        }
    }

    /// Bytes not yet verified.
    pub fn left(&self) -> u64 {
        self.context
            .pieces
            .iter()
            .filter(|piece| !piece.is_complete())
            .map(|piece| u64::from(piece.size()))
            .sum()
    }

    async fn verify_all(&self) -> Result<bool, TorrentError> {
        let mut complete = true;
        for piece in self.context.pieces.iter() {
            complete &= piece.verify_existing().await?;
        }
        Ok(complete)
    }

    async fn lifecycle(self: Arc<Self>) {
        let mut state_rx = self.state_tx.subscribe();
        let tick = self.context.config.torrent.lifecycle_tick;
        let initial = self.state();
        self.announce(Some(AnnounceEvent::Started)).await;
        if initial == TorrentState::Completed {
            self.announce(Some(AnnounceEvent::Completed)).await;
        }

        loop {
            let state = *state_rx.borrow_and_update();
            if state == TorrentState::Stopped {
                break;
            }

            self.reap_connections();
            if state == TorrentState::Started && self.all_pieces_complete() {
                self.confirm_completion().await;
            }
            self.connect_peers();

            let stats = self.stats();
            tracing::debug!(
                "Torrent progress: name={}, state={}, completeness={:.1}%, peers={}/{}",
                self.metadata.name,
                stats.state,
                stats.completeness,
                stats.connected_peers,
                stats.known_peers
            );

            self.announce(None).await;

            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.disconnect_all().await;
        self.announce(Some(AnnounceEvent::Stopped)).await;
        tracing::info!("Torrent stopped: name={}", self.metadata.name);
    }

    fn all_pieces_complete(&self) -> bool {
        self.context.pieces.iter().all(|piece| piece.is_complete())
    }

    /// Re-reads every piece before declaring the torrent complete.
    async fn confirm_completion(&self) {
        self.state_tx.send_if_modified(|state| {
            if *state == TorrentState::Started {
                *state = TorrentState::Checking;
                true
            } else {
                false
            }
        });

        let verified = match self.verify_all().await {
            Ok(verified) => verified,
            Err(e) => {
                tracing::warn!("Completion check failed: name={}, error={e}", self.metadata.name);
                false
            }
        };
        let next = if verified {
            TorrentState::Completed
        } else {
            TorrentState::Started
        };

        let moved = self.state_tx.send_if_modified(|state| {
            if *state == TorrentState::Checking {
                *state = next;
                true
            } else {
                false
            }
        });
        if !moved {
            return;
        }

        if verified {
            tracing::info!("Torrent completed: name={}", self.metadata.name);
            self.announce(Some(AnnounceEvent::Completed)).await;
        } else {
            tracing::warn!(
                "Completion check found corrupt pieces: name={}",
                self.metadata.name
            );
        }
    }

    /// Collects finished connections. Peers that closed cleanly go back to
    /// the known list; peers that failed are dropped.
    fn reap_connections(&self) {
        let mut peers = self.peers.lock();
        let finished: Vec<SocketAddr> = peers
            .connected
            .iter()
            .filter(|(_, peer)| peer.handle.is_finished())
            .map(|(address, _)| *address)
            .collect();

        for address in finished {
            let Some(peer) = peers.connected.remove(&address) else {
                continue;
            };
            match peer.handle.now_or_never() {
                Some(Ok(Ok(()))) => {
                    if peer.outbound {
                        peers.known.push_back(address);
                    }
                }
                Some(Ok(Err(e))) => {
                    if e.is_protocol_violation() {
                        tracing::warn!("Dropped misbehaving peer: peer={address}, error={e}");
                    } else {
                        tracing::debug!("Dropped peer: peer={address}, error={e}");
                    }
                }
                Some(Err(e)) => tracing::warn!("Peer task failed: peer={address}, error={e}"),
                None => {}
            }
        }
    }

    fn connect_peers(&self) {
        let max = self.context.config.network.max_peer_connections;
        let mut peers = self.peers.lock();
        while peers.connected.len() < max {
            let Some(address) = peers.known.pop_front() else {
                break;
            };
            if peers.connected.contains_key(&address) {
                continue;
            }

            let connection = PeerConnection::new(address, self.context.clone());
            let status = connection.status();
            let handle = tokio::spawn(connection.dial());
            peers.connected.insert(
                address,
                ActivePeer {
                    status,
                    outbound: true,
                    handle,
                },
            );
            tracing::debug!("Dialing peer: peer={address}");
        }
    }

    async fn disconnect_all(&self) {
        let handles: Vec<_> = {
            let mut peers = self.peers.lock();
            peers.known.clear();
            peers
                .connected
                .drain()
                .map(|(_, peer)| peer.handle)
                .collect()
        };
        let count = handles.len();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::warn!("Peer task failed during shutdown: error={e}");
            }
        }
        tracing::debug!(
            "Disconnected peers: name={}, count={count}",
            self.metadata.name
        );
    }

    /// Announces to every tracker that is due.
    ///
    /// Periodic announces go to trackers whose last success is older than
    /// the re-announce interval. `started` and `completed` go to every
    /// tracker, `stopped` only to trackers that were announced to. A
    /// failed tracker is retried on the next cycle.
    async fn announce(&self, event: Option<AnnounceEvent>) {
        let interval = self.context.config.network.reannounce_interval;
        let now = Instant::now();
        let mut trackers = self.trackers.lock().await;

        for slot in trackers.iter_mut() {
            let due = match event {
                None => slot
                    .last_announce
                    .is_none_or(|last| now.saturating_duration_since(last) >= interval),
                Some(AnnounceEvent::Stopped) => slot.last_announce.is_some(),
                Some(_) => true,
            };
            if !due {
                continue;
            }

            let request = AnnounceRequest {
                info_hash: self.info_hash(),
                peer_id: self.context.peer_id,
                port: self.listen_port.load(Ordering::Relaxed),
                uploaded: self.context.uploaded.load(Ordering::Relaxed),
                downloaded: self.context.downloaded.load(Ordering::Relaxed),
                left: self.left(),
                numwant: DEFAULT_NUMWANT,
                event,
                tracker_id: slot.tracker_id.clone(),
            };

            match slot.client.announce(request).await {
                Ok(response) => {
                    tracing::debug!(
                        "Announced: tracker={}, peers={}, seeders={}, leechers={}",
                        slot.client.tracker_url(),
                        response.peers.len(),
                        response.complete,
                        response.incomplete
                    );
                    slot.last_announce = Some(Instant::now());
                    if response.tracker_id.is_some() {
                        slot.tracker_id = response.tracker_id;
                    }
                    if event != Some(AnnounceEvent::Stopped) {
                        self.add_peers(response.peers);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Tracker announce failed: tracker={}, error={e}",
                        slot.client.tracker_url()
                    );
                }
            }
        }
    }
}

impl TrackerSlot {
    fn new(client: Arc<dyn TrackerClient>) -> Self {
        Self {
            client,
            last_announce: None,
            tracker_id: None,
        }
    }
}

fn build_pieces(
    metadata: &TorrentMetadata,
    store: Option<Arc<dyn BlockStore>>,
) -> Result<Arc<Vec<Arc<Piece>>>, TorrentError> {
    let layout = metadata.layout();
    let mut pieces = Vec::with_capacity(metadata.piece_hashes.len());
    for (index, signature) in metadata.piece_hashes.iter().enumerate() {
        let index = PieceIndex::new(index as u32);
        let size = layout
            .piece_size(index)
            .ok_or_else(|| TorrentError::InvalidTorrentFile {
                reason: format!("Piece {index} lies past the end of the payload"),
            })?;
        pieces.push(Arc::new(Piece::new(index, size, *signature, store.clone())?));
    }
    Ok(Arc::new(pieces))
}
