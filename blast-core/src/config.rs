//! Centralized configuration for Blast.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

use crate::BlastError;
use crate::crypto::rsa::MIN_KEY_BITS;
use crate::torrent::piece_manager::MAX_PIECES_OF_INTEREST;
use crate::torrent::request::REQUEST_TIMEOUT;

/// Central configuration for all Blast components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct BlastConfig {
    pub torrent: TorrentConfig,
    pub network: NetworkConfig,
    pub encryption: EncryptionConfig,
    pub storage: StorageConfig,
}

/// BitTorrent protocol-specific configuration.
///
/// Controls request pipelining, scheduling cadence and protocol timers.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Age after which an unanswered block request is evicted
    pub request_timeout: Duration,
    /// Interval between keep-alive frames on an otherwise idle connection
    pub keep_alive_interval: Duration,
    /// Sleep between iterations of a peer connection loop
    pub connection_tick: Duration,
    /// Sleep between piece scheduler refills
    pub scheduler_tick: Duration,
    /// Sleep between torrent lifecycle iterations
    pub lifecycle_tick: Duration,
    /// Outstanding requests allowed per connection
    pub max_pending_requests: usize,
    /// Request attempts per connection loop iteration
    pub max_request_attempts: usize,
    /// Incoming messages dispatched per connection loop iteration
    pub max_messages_per_tick: usize,
    /// Upper bound on pieces the scheduler actively pursues
    pub max_pieces_of_interest: usize,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            request_timeout: REQUEST_TIMEOUT,
            keep_alive_interval: Duration::from_secs(90),
            connection_tick: Duration::from_millis(100),
            scheduler_tick: Duration::from_secs(2),
            lifecycle_tick: Duration::from_secs(2),
            max_pending_requests: 10,
            max_request_attempts: 100,
            max_messages_per_tick: 100,
            max_pieces_of_interest: MAX_PIECES_OF_INTEREST,
        }
    }
}

/// Network communication and tracker configuration.
///
/// Controls the listen port, peer connection limits, socket timeouts
/// and tracker communication parameters.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// TCP port for inbound peers, 0 lets the OS pick one
    pub listen_port: u16,
    /// Maximum concurrent peer connections per torrent
    pub max_peer_connections: usize,
    /// HTTP request timeout for tracker communication
    pub tracker_timeout: Duration,
    /// Minimum age of the last announce before re-announcing
    pub reannounce_interval: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
    /// Outbound connect timeout
    pub connect_timeout: Duration,
    /// A socket read that stalls this long drops the peer
    pub idle_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            max_peer_connections: 60,
            tracker_timeout: Duration::from_secs(30),
            reannounce_interval: Duration::from_secs(60),
            user_agent: "blast/0.1.0",
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
        }
    }
}

/// Transport encryption negotiated after the handshake.
#[derive(Debug, Clone)]
pub struct EncryptionConfig {
    /// Advertise and accept encrypted sessions
    pub enabled: bool,
    /// RSA modulus size used for the key exchange, multiple of 8
    pub rsa_bits: usize,
    /// Length of the symmetric XOR key sent over the RSA channel
    pub xor_key_length: usize,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rsa_bits: 128,
            xor_key_length: 128,
        }
    }
}

/// File storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory that receives downloaded files
    pub download_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
        }
    }
}

impl BlastConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("BLAST_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.network.listen_port = port;
            }
        }

        if let Ok(max_peers) = std::env::var("BLAST_MAX_PEERS") {
            if let Ok(count) = max_peers.parse::<usize>() {
                config.network.max_peer_connections = count;
            }
        }

        if let Ok(enabled) = std::env::var("BLAST_ENCRYPTION") {
            config.encryption.enabled = enabled.parse().unwrap_or(false);
        }

        if let Ok(bits) = std::env::var("BLAST_RSA_BITS") {
            if let Ok(bits) = bits.parse::<usize>() {
                config.encryption.rsa_bits = bits;
            }
        }

        if let Ok(length) = std::env::var("BLAST_XOR_KEY_LEN") {
            if let Ok(length) = length.parse::<usize>() {
                config.encryption.xor_key_length = length;
            }
        }

        if let Ok(dir) = std::env::var("BLAST_DOWNLOAD_DIR") {
            config.storage.download_dir = PathBuf::from(dir);
        }

        config
    }

    /// Creates a configuration with short timers for loopback tests.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.network.listen_port = 0;
        config.torrent.lifecycle_tick = Duration::from_millis(100);
        config.torrent.scheduler_tick = Duration::from_millis(100);
        config.torrent.connection_tick = Duration::from_millis(10);
        config
    }

    /// Rejects settings the engine cannot run with.
    ///
    /// # Errors
    /// - `BlastError::Configuration` - RSA size too small or not a multiple of 8,
    ///   empty XOR key or zero peer cap
    pub fn validate(&self) -> Result<(), BlastError> {
        let encryption = &self.encryption;
        if encryption.rsa_bits < MIN_KEY_BITS || encryption.rsa_bits % 8 != 0 {
            return Err(BlastError::Configuration {
                reason: format!(
                    "RSA key size must be a multiple of 8 of at least {MIN_KEY_BITS}, got {}",
                    encryption.rsa_bits
                ),
            });
        }
        if encryption.xor_key_length == 0 {
            return Err(BlastError::Configuration {
                reason: "XOR key length must be positive".to_string(),
            });
        }
        if self.network.max_peer_connections == 0 {
            return Err(BlastError::Configuration {
                reason: "Maximum peer connections must be positive".to_string(),
            });
        }
        Ok(())
    }
}
