//! Registry of running torrents and the shared inbound listener.
//!
//! Each accepted socket sends its handshake first. The infohash in that
//! handshake selects the torrent; unknown infohashes close the socket
//! without a reply.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::metainfo::TorrentMetadata;
use super::protocol::{HANDSHAKE_LEN, HandshakeCodec};
use super::session::Torrent;
use super::{InfoHash, TorrentError};
use crate::config::BlastConfig;

/// Pause after a failed accept before polling the listener again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

struct Listener {
    address: SocketAddr,
    task: JoinHandle<()>,
}

/// Owns every torrent of one client and routes inbound peers to them.
pub struct TorrentManager {
    config: Arc<BlastConfig>,
    torrents: RwLock<HashMap<InfoHash, Arc<Torrent>>>,
    listener: tokio::sync::Mutex<Option<Listener>>,
}

impl TorrentManager {
    pub fn new(config: Arc<BlastConfig>) -> Arc<Self> {
        Arc::new(Self {
            config,
            torrents: RwLock::new(HashMap::new()),
            listener: tokio::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Arc<BlastConfig> {
        &self.config
    }

    /// Opens a torrent stored under the configured download directory and
    /// registers it. The torrent is not started.
    ///
    /// # Errors
    /// - `TorrentError::Storage` - Payload file could not be opened
    /// - `TorrentError::InvalidTorrentFile` - Same infohash already registered
    pub async fn open_torrent(&self, metadata: TorrentMetadata) -> Result<Arc<Torrent>, TorrentError> {
        if self.torrent(&metadata.info_hash).is_some() {
            return Err(duplicate(metadata.info_hash));
        }
        let torrent = Torrent::open(metadata, self.config.clone()).await?;
        self.add_torrent(torrent.clone()).await?;
        Ok(torrent)
    }

    /// Registers an existing torrent.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Same infohash already registered
    pub async fn add_torrent(&self, torrent: Arc<Torrent>) -> Result<(), TorrentError> {
        let info_hash = torrent.info_hash();
        {
            let mut torrents = self.torrents.write();
            if torrents.contains_key(&info_hash) {
                return Err(duplicate(info_hash));
            }
            torrents.insert(info_hash, torrent.clone());
        }

        if let Some(listener) = self.listener.lock().await.as_ref() {
            torrent.set_listen_port(listener.address.port());
        }
        tracing::info!(
            "Registered torrent: name={}, info_hash={info_hash}",
            torrent.metadata().name
        );
        Ok(())
    }

    pub fn torrent(&self, info_hash: &InfoHash) -> Option<Arc<Torrent>> {
        self.torrents.read().get(info_hash).cloned()
    }

    pub fn torrents(&self) -> Vec<Arc<Torrent>> {
        self.torrents.read().values().cloned().collect()
    }

    /// Stops and unregisters a torrent.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - No torrent with this infohash
    pub async fn remove_torrent(&self, info_hash: &InfoHash) -> Result<(), TorrentError> {
        let torrent = self
            .torrents
            .write()
            .remove(info_hash)
            .ok_or(TorrentError::TorrentNotFound {
                info_hash: *info_hash,
            })?;
        torrent.stop().await;
        Ok(())
    }

    /// Binds the configured listen port and starts accepting peers.
    ///
    /// Port 0 binds an ephemeral port; the bound port is reported to every
    /// registered torrent. Calling this again returns the existing address.
    ///
    /// # Errors
    /// - `TorrentError::Io` - Port could not be bound
    pub async fn listen(self: &Arc<Self>) -> Result<SocketAddr, TorrentError> {
        let mut listener = self.listener.lock().await;
        if let Some(existing) = listener.as_ref() {
            return Ok(existing.address);
        }

        let socket = TcpListener::bind(("0.0.0.0", self.config.network.listen_port)).await?;
        let address = socket.local_addr()?;
        for torrent in self.torrents() {
            torrent.set_listen_port(address.port());
        }

        let task = tokio::spawn(accept_loop(Arc::downgrade(self), socket));
        *listener = Some(Listener { address, task });
        tracing::info!("Listening for peers: address={address}");
        Ok(address)
    }

    /// Address of the inbound listener, if bound.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().map(|l| l.address)
    }

    /// Closes the listener and stops every torrent.
    pub async fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.task.abort();
        }
        let torrents = self.torrents();
        futures::future::join_all(torrents.iter().map(|torrent| torrent.stop())).await;
        tracing::info!("Torrent manager shut down: torrents={}", torrents.len());
    }

    async fn route_inbound(&self, mut stream: TcpStream, address: SocketAddr) -> Result<(), TorrentError> {
        let mut buffer = [0u8; HANDSHAKE_LEN];
        tokio::time::timeout(
            self.config.network.idle_timeout,
            stream.read_exact(&mut buffer),
        )
        .await
        .map_err(|_| TorrentError::PeerConnectionError {
            reason: format!("Handshake from {address} timed out"),
        })??;
        let handshake = HandshakeCodec::deserialize_handshake(&buffer)?;

        let torrent = self
            .torrent(&handshake.info_hash)
            .ok_or(TorrentError::TorrentNotFound {
                info_hash: handshake.info_hash,
            })?;
        torrent.accept_inbound(stream, address, handshake)
    }
}

async fn accept_loop(manager: std::sync::Weak<TorrentManager>, socket: TcpListener) {
    loop {
        let (stream, address) = accept_next(|| socket.accept()).await;
        let Some(manager) = manager.upgrade() else {
            break;
        };

        tracing::debug!("Inbound connection: peer={address}");
        tokio::spawn(async move {
            if let Err(e) = manager.route_inbound(stream, address).await {
                tracing::debug!("Rejected inbound peer: peer={address}, error={e}");
            }
        });
    }
}

/// Retries `accept` until it yields a peer, pausing after every failure.
async fn accept_next<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                tracing::warn!("Failed to accept peer: error={e}");
                // Errors such as descriptor exhaustion persist; give them time to clear.
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

fn duplicate(info_hash: InfoHash) -> TorrentError {
    TorrentError::InvalidTorrentFile {
        reason: format!("Torrent {info_hash} is already registered"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::storage::test_fixtures::{create_temp_download_dir, patterned_bytes};
    use crate::torrent::metainfo::TorrentCreator;
    use crate::torrent::protocol::{PeerHandshake, PeerId};
    use crate::torrent::session::TorrentState;

    fn manager_in(dir: &std::path::Path) -> Arc<TorrentManager> {
        let mut config = BlastConfig::for_testing();
        config.storage.download_dir = dir.to_path_buf();
        TorrentManager::new(Arc::new(config))
    }

    fn metadata(seed: u8) -> TorrentMetadata {
        TorrentCreator::with_piece_length(16384)
            .create_from_bytes("file.bin", &patterned_bytes(20_000, seed), vec![])
            .unwrap()
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicates() {
        let (_temp_dir, dir) = create_temp_download_dir();
        let manager = manager_in(&dir);
        let metadata = metadata(1);

        let torrent = manager.open_torrent(metadata.clone()).await.unwrap();
        assert!(manager.torrent(&metadata.info_hash).is_some());
        assert!(manager.open_torrent(metadata.clone()).await.is_err());
        assert!(manager.add_torrent(torrent).await.is_err());
        assert_eq!(manager.torrents().len(), 1);

        manager.remove_torrent(&metadata.info_hash).await.unwrap();
        assert!(manager.torrent(&metadata.info_hash).is_none());
        assert!(matches!(
            manager.remove_torrent(&metadata.info_hash).await,
            Err(TorrentError::TorrentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_accepts_back_off_before_retrying() {
        let attempts = std::cell::Cell::new(0);
        let started = std::time::Instant::now();

        let accepted = accept_next(|| {
            attempts.set(attempts.get() + 1);
            let attempt = attempts.get();
            async move {
                if attempt < 3 {
                    Err(std::io::Error::other("too many open files"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(accepted, 3);
        assert_eq!(attempts.get(), 3);
        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF * 2);
    }

    #[tokio::test]
    async fn test_listen_reports_bound_port() {
        let (_temp_dir, dir) = create_temp_download_dir();
        let manager = manager_in(&dir);
        assert!(manager.local_addr().await.is_none());

        let address = manager.listen().await.unwrap();
        assert_ne!(address.port(), 0);
        assert_eq!(manager.listen().await.unwrap(), address);
        assert_eq!(manager.local_addr().await, Some(address));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_info_hash_closes_socket() {
        let (_temp_dir, dir) = create_temp_download_dir();
        let manager = manager_in(&dir);
        let address = manager.listen().await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", address.port()))
            .await
            .unwrap();
        let handshake = PeerHandshake::new(InfoHash::new([9; 20]), PeerId::generate());
        stream
            .write_all(&HandshakeCodec::serialize_handshake(&handshake))
            .await
            .unwrap();

        let mut buffer = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buffer))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_known_torrent_replies_with_handshake() {
        let (_temp_dir, dir) = create_temp_download_dir();
        let manager = manager_in(&dir);
        let torrent = manager.open_torrent(metadata(2)).await.unwrap();
        torrent.start().await.unwrap();
        let address = manager.listen().await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", address.port()))
            .await
            .unwrap();
        let handshake = PeerHandshake::new(torrent.info_hash(), PeerId::generate());
        stream
            .write_all(&HandshakeCodec::serialize_handshake(&handshake))
            .await
            .unwrap();

        let mut reply = [0u8; HANDSHAKE_LEN];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        let reply = HandshakeCodec::deserialize_handshake(&reply).unwrap();
        assert_eq!(reply.info_hash, torrent.info_hash());
        assert_eq!(reply.peer_id, torrent.peer_id());

        manager.shutdown().await;
        assert_eq!(torrent.state(), TorrentState::Stopped);
    }
}
