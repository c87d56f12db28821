//! One connection to a remote peer.
//!
//! After the handshake and the optional key exchange, a reader task pushes
//! decoded frames into a channel while the connection loop polls it on a
//! fixed tick: evict stale requests, dispatch incoming messages, queue
//! keep-alives and new block requests, then flush the outbox in order.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};

use super::piece::Piece;
use super::piece_manager::PieceManager;
use super::protocol::{Bitfield, CryptoReader, CryptoWriter, PeerHandshake, PeerId, PeerMessage};
use super::rate::RateMeter;
use super::request::{PendingRequests, Request};
use super::session::TorrentState;
use super::{InfoHash, PieceIndex, TorrentError, encryption};
use crate::config::BlastConfig;
use crate::storage::layout::BLOCK_SIZE;

/// Frames buffered between the reader task and the connection loop.
const INCOMING_BUFFER: usize = 256;

/// Torrent state shared by every connection of one torrent.
pub struct TorrentContext {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub pieces: Arc<Vec<Arc<Piece>>>,
    pub piece_manager: Arc<PieceManager>,
    pub config: Arc<BlastConfig>,
    /// Verified payload bytes served and received.
    pub uploaded: AtomicU64,
    pub downloaded: AtomicU64,
    /// Wire traffic of every connection, encryption overhead included.
    pub upload_meter: Arc<RateMeter>,
    pub download_meter: Arc<RateMeter>,
    have_tx: broadcast::Sender<PieceIndex>,
    state_rx: watch::Receiver<TorrentState>,
}

impl TorrentContext {
    pub fn new(
        info_hash: InfoHash,
        peer_id: PeerId,
        pieces: Arc<Vec<Arc<Piece>>>,
        piece_manager: Arc<PieceManager>,
        config: Arc<BlastConfig>,
        state_rx: watch::Receiver<TorrentState>,
    ) -> Self {
        let (have_tx, _) = broadcast::channel(pieces.len().clamp(16, 4096));
        Self {
            info_hash,
            peer_id,
            pieces,
            piece_manager,
            config,
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            upload_meter: Arc::new(RateMeter::new()),
            download_meter: Arc::new(RateMeter::new()),
            have_tx,
            state_rx,
        }
    }

    /// Announces a freshly verified piece to every open connection.
    pub fn announce_piece(&self, index: PieceIndex) {
        // No receivers just means no connections are open.
        let _ = self.have_tx.send(index);
    }

    pub fn state(&self) -> TorrentState {
        *self.state_rx.borrow()
    }

    fn piece(&self, index: PieceIndex) -> Option<&Arc<Piece>> {
        self.pieces.get(index.as_usize())
    }
}

/// Which side opened the socket.
#[derive(Debug, Clone)]
pub enum ConnectionRole {
    /// We dialed, so we send the first handshake.
    Outbound,
    /// The peer dialed; its handshake has already been read and matched.
    Inbound { handshake: PeerHandshake },
}

/// Live figures about one connection, readable while it runs.
#[derive(Debug)]
pub struct PeerStatus {
    address: SocketAddr,
    completion_bits: AtomicU64,
    upload: Arc<RateMeter>,
    download: Arc<RateMeter>,
}

impl PeerStatus {
    fn new(address: SocketAddr) -> Self {
        Self {
            address,
            completion_bits: AtomicU64::new(0f64.to_bits()),
            upload: Arc::new(RateMeter::new()),
            download: Arc::new(RateMeter::new()),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Share of pieces the peer has, 0.0 to 100.0.
    pub fn completion(&self) -> f64 {
        f64::from_bits(self.completion_bits.load(Ordering::Relaxed))
    }

    fn set_completion(&self, percent: f64) {
        self.completion_bits
            .store(percent.to_bits(), Ordering::Relaxed);
    }

    /// Bytes per second sent to this peer.
    pub fn upload_rate(&self) -> f64 {
        self.upload.rate()
    }

    /// Bytes per second received from this peer.
    pub fn download_rate(&self) -> f64 {
        self.download.rate()
    }

    pub fn uploaded(&self) -> u64 {
        self.upload.total()
    }

    pub fn downloaded(&self) -> u64 {
        self.download.total()
    }
}

/// Wire-protocol state machine for one peer.
pub struct PeerConnection {
    address: SocketAddr,
    context: Arc<TorrentContext>,
    status: Arc<PeerStatus>,
    am_choked: bool,
    am_interested: bool,
    peer_choked: bool,
    peer_interested: bool,
    available: Bitfield,
    pending: Arc<PendingRequests>,
    outbox: VecDeque<PeerMessage>,
    have_rx: broadcast::Receiver<PieceIndex>,
    last_keep_alive: Instant,
    last_received: Instant,
}

impl PeerConnection {
    /// Creates a connection in the initial fully choked, uninterested state.
    pub fn new(address: SocketAddr, context: Arc<TorrentContext>) -> Self {
        let now = Instant::now();
        Self {
            address,
            status: Arc::new(PeerStatus::new(address)),
            am_choked: true,
            am_interested: false,
            peer_choked: true,
            peer_interested: false,
            available: Bitfield::new(context.pieces.len()),
            pending: PendingRequests::new(),
            outbox: VecDeque::new(),
            have_rx: context.have_tx.subscribe(),
            last_keep_alive: now,
            last_received: now,
            context,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn status(&self) -> Arc<PeerStatus> {
        self.status.clone()
    }

    /// Dials the peer and runs the connection until it ends.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Connect failed or timed out
    /// - Any error [`Self::run`] returns
    pub async fn dial(self) -> Result<(), TorrentError> {
        let timeout = self.context.config.network.connect_timeout;
        let mut state_rx = self.context.state_rx.clone();
        let connect = tokio::time::timeout(timeout, TcpStream::connect(self.address));
        let stream = tokio::select! {
            biased;
            () = wait_for_stop(&mut state_rx) => return Ok(()),
            connected = connect => match connected {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(TorrentError::PeerConnectionError {
                        reason: format!("Failed to connect to {}: {e}", self.address),
                    });
                }
                Err(_) => {
                    return Err(TorrentError::PeerConnectionError {
                        reason: format!("Connect to {} timed out", self.address),
                    });
                }
            },
        };
        self.run(stream, ConnectionRole::Outbound).await
    }

    /// Runs handshake, key exchange and the message loop over `stream`.
    ///
    /// Returns `Ok` when the torrent stopped, including while the handshake,
    /// the key exchange or a write is still waiting on the peer. Every exit
    /// returns this connection's pending requests to the scheduler.
    ///
    /// # Errors
    /// - `TorrentError::InfoHashMismatch` - Peer serves another torrent
    /// - `TorrentError::EncryptionNegotiation` - Key exchange failed
    /// - `TorrentError::ProtocolError` - Peer broke the wire protocol
    /// - `TorrentError::Io` - Socket failed
    pub async fn run<S>(mut self, stream: S, role: ConnectionRole) -> Result<(), TorrentError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = CryptoReader::new(read_half)
            .count_into(self.status.download.clone())
            .count_into(self.context.download_meter.clone());
        let mut writer = CryptoWriter::new(write_half)
            .count_into(self.status.upload.clone())
            .count_into(self.context.upload_meter.clone());

        let mut state_rx = self.context.state_rx.clone();
        let established = tokio::select! {
            result = self.establish(&mut reader, &mut writer, role) => result.map(|()| true),
            () = wait_for_stop(&mut state_rx) => Ok(false),
        };

        let result = match established {
            Ok(true) => {
                let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_BUFFER);
                let reader_task = tokio::spawn(read_frames(reader, incoming_tx));
                let result = self.message_loop(&mut writer, incoming_rx).await;
                reader_task.abort();
                result
            }
            Ok(false) => {
                tracing::debug!("Torrent stopped during setup: peer={}", self.address);
                Ok(())
            }
            Err(e) => Err(e),
        };

        self.release_requests();
        let _ = writer.shutdown().await;

        match &result {
            Ok(()) => tracing::debug!("Peer connection closed: peer={}", self.address),
            Err(e) => tracing::debug!("Peer connection failed: peer={}, error={e}", self.address),
        }
        result
    }

    async fn establish<R, W>(
        &mut self,
        reader: &mut CryptoReader<R>,
        writer: &mut CryptoWriter<W>,
        role: ConnectionRole,
    ) -> Result<(), TorrentError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let config = &self.context.config;
        let local = PeerHandshake::new(self.context.info_hash, self.context.peer_id)
            .with_encryption(config.encryption.enabled);

        let remote = match role {
            ConnectionRole::Outbound => {
                writer.write_handshake(&local).await?;
                writer.flush().await?;
                let remote = tokio::time::timeout(config.network.idle_timeout, reader.read_handshake())
                    .await
                    .map_err(|_| TorrentError::PeerConnectionError {
                        reason: "Timed out waiting for handshake".to_string(),
                    })??;
                if remote.info_hash != self.context.info_hash {
                    return Err(TorrentError::InfoHashMismatch {
                        expected: self.context.info_hash,
                        received: remote.info_hash,
                    });
                }
                remote
            }
            ConnectionRole::Inbound { handshake } => {
                writer.write_handshake(&local).await?;
                writer.flush().await?;
                handshake
            }
        };
        tracing::debug!(
            "Handshake complete: peer={}, peer_id={}",
            self.address,
            remote.peer_id
        );

        if local.supports_encryption() && remote.supports_encryption() {
            tokio::time::timeout(
                config.network.idle_timeout,
                encryption::negotiate(reader, writer, &config.encryption),
            )
            .await
            .map_err(|_| TorrentError::EncryptionNegotiation {
                reason: "Timed out during key exchange".to_string(),
            })??;
        }

        let bitfield = Bitfield::from_pieces(&self.context.pieces);
        self.outbox.push_back(PeerMessage::Bitfield {
            bitfield: bitfield.to_payload(),
        });
        self.last_received = Instant::now();
        Ok(())
    }

    async fn message_loop<W>(
        &mut self,
        writer: &mut CryptoWriter<W>,
        mut incoming: mpsc::Receiver<Result<PeerMessage, TorrentError>>,
    ) -> Result<(), TorrentError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut state_rx = self.context.state_rx.clone();
        let tick = self.context.config.torrent.connection_tick;

        loop {
            let stopped = *state_rx.borrow_and_update() == TorrentState::Stopped;
            if stopped {
                return Ok(());
            }

            let now = Instant::now();
            self.evict_stale_requests(now);
            self.drain_incoming(&mut incoming).await?;
            if now.saturating_duration_since(self.last_received)
                >= self.context.config.network.idle_timeout
            {
                return Err(TorrentError::PeerConnectionError {
                    reason: format!("Peer {} idle too long", self.address),
                });
            }
            self.queue_announced_pieces();
            self.queue_keep_alive(now);
            self.request_blocks();
            tokio::select! {
                flushed = self.flush(writer) => flushed?,
                () = wait_for_stop(&mut state_rx) => return Ok(()),
            }
            self.update_completion();

            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn evict_stale_requests(&mut self, now: Instant) {
        let timeout = self.context.config.torrent.request_timeout;
        for request in self.pending.take_stale(now, timeout) {
            tracing::trace!(
                "Evicted stale request: peer={}, piece={}, begin={}",
                self.address,
                request.piece_index,
                request.begin
            );
            self.context
                .piece_manager
                .remove_request(&request, &self.pending);
        }
    }

    async fn drain_incoming(
        &mut self,
        incoming: &mut mpsc::Receiver<Result<PeerMessage, TorrentError>>,
    ) -> Result<(), TorrentError> {
        for _ in 0..self.context.config.torrent.max_messages_per_tick {
            match incoming.try_recv() {
                Ok(Ok(message)) => {
                    self.last_received = Instant::now();
                    self.handle_message(message).await?;
                }
                Ok(Err(e)) => return Err(e),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(TorrentError::PeerConnectionError {
                        reason: format!("Reader for {} stopped", self.address),
                    });
                }
            }
        }
        Ok(())
    }

    /// Applies one message from the peer.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Message is illegal in this state
    /// - `TorrentError::InvalidBlock` - Piece payload does not fit its piece
    /// - `TorrentError::Storage` - Block could not be stored or read
    pub async fn handle_message(&mut self, message: PeerMessage) -> Result<(), TorrentError> {
        tracing::trace!("Received {}: peer={}", message.kind(), self.address);

        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => self.am_choked = true,
            PeerMessage::Unchoke => self.am_choked = false,
            PeerMessage::Interested => {
                self.peer_interested = true;
                self.peer_choked = false;
                self.outbox.push_back(PeerMessage::Unchoke);
            }
            PeerMessage::NotInterested => {
                self.peer_interested = false;
                self.peer_choked = true;
                self.outbox.push_back(PeerMessage::Choke);
            }
            PeerMessage::Have { piece_index } => {
                if self.context.piece(piece_index).is_none() {
                    return Err(TorrentError::ProtocolError {
                        message: format!("Have for unknown piece {piece_index}"),
                    });
                }
                self.available.set(piece_index.as_usize());
            }
            PeerMessage::Bitfield { bitfield } => {
                let received = Bitfield::from_bytes(&bitfield, self.context.pieces.len())?;
                for index in 0..received.piece_count() {
                    if received.has(index) {
                        self.available.set(index);
                    }
                }
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => self.serve_request(piece_index, offset, length).await?,
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => self.receive_block(piece_index, offset, data).await?,
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                self.outbox.retain(|queued| {
                    !matches!(
                        queued,
                        PeerMessage::Piece { piece_index: p, offset: o, data }
                            if *p == piece_index && *o == offset && data.len() as u32 == length
                    )
                });
            }
            PeerMessage::Port { .. } => {}
            PeerMessage::SendRsaKey { .. } | PeerMessage::SendSymmetricKey { .. } => {
                return Err(TorrentError::ProtocolError {
                    message: "Key exchange message outside negotiation".to_string(),
                });
            }
        }
        Ok(())
    }

    async fn serve_request(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<(), TorrentError> {
        if self.peer_choked || !self.peer_interested {
            tracing::trace!("Ignoring request from choked peer: peer={}", self.address);
            return Ok(());
        }
        let Some(piece) = self.context.piece(piece_index).cloned() else {
            return Ok(());
        };
        if offset % BLOCK_SIZE != 0 || length != piece.block_size(offset / BLOCK_SIZE) {
            tracing::debug!(
                "Ignoring malformed request: peer={}, piece={piece_index}, offset={offset}, length={length}",
                self.address
            );
            return Ok(());
        }

        if let Some(data) = piece.read_block_at(offset).await? {
            self.outbox.push_back(PeerMessage::Piece {
                piece_index,
                offset,
                data: Bytes::from(data),
            });
        }
        Ok(())
    }

    async fn receive_block(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Bytes,
    ) -> Result<(), TorrentError> {
        let Some(piece) = self.context.piece(piece_index).cloned() else {
            return Err(TorrentError::ProtocolError {
                message: format!("Piece message for unknown piece {piece_index}"),
            });
        };

        if let Some(request) = self.pending.remove(piece_index, offset) {
            self.context
                .piece_manager
                .remove_request(&request, &self.pending);
        }

        if piece.feed(offset, &data).await? {
            self.context
                .downloaded
                .fetch_add(data.len() as u64, Ordering::Relaxed);
        }
        if !piece.is_complete() && piece.check().await? {
            tracing::info!("Piece complete: piece={piece_index}, peer={}", self.address);
            self.context.announce_piece(piece_index);
        }
        Ok(())
    }

    fn queue_announced_pieces(&mut self) {
        loop {
            match self.have_rx.try_recv() {
                Ok(piece_index) => self.outbox.push_back(PeerMessage::Have { piece_index }),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::debug!("Missed {skipped} have announcements: peer={}", self.address);
                }
                Err(_) => break,
            }
        }
    }

    fn queue_keep_alive(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_keep_alive)
            >= self.context.config.torrent.keep_alive_interval
        {
            self.outbox.push_back(PeerMessage::KeepAlive);
            self.last_keep_alive = now;
        }
    }

    /// Queues new block requests while the pipeline has room.
    ///
    /// Interest is declared as soon as the peer has something we need and
    /// withdrawn when it no longer does. Each request goes to the highest
    /// ranked piece that still has a block this connection has not asked
    /// for.
    fn request_blocks(&mut self) {
        let torrent = &self.context.config.torrent;
        let mut offered_any = false;

        for _ in 0..torrent.max_request_attempts {
            if self.pending.len() >= torrent.max_pending_requests {
                return;
            }
            let candidates = self
                .context
                .piece_manager
                .available_pieces(&self.available);
            if candidates.is_empty() {
                break;
            }
            offered_any = true;

            if !self.am_interested {
                self.outbox.push_back(PeerMessage::Interested);
                self.am_interested = true;
            }
            if self.am_choked {
                return;
            }

            let Some((piece, block)) = candidates.into_iter().find_map(|piece| {
                piece
                    .least_requested_block_for(&self.pending)
                    .map(|block| (piece, block))
            }) else {
                return;
            };
            let request = Request::new(piece.index(), piece.block_offset(block), piece.block_size(block));
            self.outbox.push_back(PeerMessage::Request {
                piece_index: request.piece_index,
                offset: request.begin,
                length: request.length,
            });
            self.pending.push(request.clone());
            self.context
                .piece_manager
                .add_request(request, self.pending.clone());
        }

        if !offered_any && self.am_interested && self.pending.is_empty() {
            self.outbox.push_back(PeerMessage::NotInterested);
            self.am_interested = false;
        }
    }

    async fn flush<W>(&mut self, writer: &mut CryptoWriter<W>) -> Result<(), TorrentError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if self.outbox.is_empty() {
            return Ok(());
        }
        while let Some(message) = self.outbox.pop_front() {
            match &message {
                PeerMessage::Request {
                    piece_index,
                    offset,
                    ..
                } if !self.pending.contains(*piece_index, *offset) => continue,
                PeerMessage::Piece { data, .. } => {
                    self.context
                        .uploaded
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                }
                _ => {}
            }
            tracing::trace!("Sending {}: peer={}", message.kind(), self.address);
            writer.write_message(&message).await?;
        }
        writer.flush().await
    }

    fn update_completion(&self) {
        let total = self.available.piece_count();
        if total > 0 {
            self.status
                .set_completion(100.0 * self.available.count() as f64 / total as f64);
        }
    }

    fn release_requests(&mut self) {
        for request in self.pending.drain() {
            self.context
                .piece_manager
                .remove_request(&request, &self.pending);
        }
    }
}

/// Resolves once the torrent is stopped or its state channel is gone.
async fn wait_for_stop(state_rx: &mut watch::Receiver<TorrentState>) {
    // A closed channel means the torrent is gone.
    let _ = state_rx
        .wait_for(|state| *state == TorrentState::Stopped)
        .await;
}

/// Decodes frames until the socket fails, forwarding the failure last.
async fn read_frames<S>(
    mut reader: CryptoReader<ReadHalf<S>>,
    incoming: mpsc::Sender<Result<PeerMessage, TorrentError>>,
) where
    S: AsyncRead + Send,
{
    loop {
        let frame = reader.read_message().await;
        let failed = frame.is_err();
        if incoming.send(frame).await.is_err() || failed {
            break;
        }
    }
}
