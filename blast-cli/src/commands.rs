//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use blast_core::config::BlastConfig;
use blast_core::torrent::{
    BencodeTorrentParser, TorrentCreator, TorrentManager, TorrentState, TorrentStats,
    encode_torrent,
};
use blast_core::BlastError;
use clap::Subcommand;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Download a torrent, seeding what is already on disk
    Download {
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Directory the payload is stored in
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Port to accept peers on
        #[arg(short, long)]
        port: Option<u16>,
        /// Maximum simultaneous peer connections
        #[arg(long)]
        max_peers: Option<usize>,
        /// Offer the encrypted transport to peers
        #[arg(long)]
        encrypt: bool,
        /// Keep seeding after the download completes
        #[arg(long)]
        seed: bool,
    },
    /// Print the contents of a torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
    /// Create a torrent file for a local file
    Create {
        /// File to share
        file: PathBuf,
        /// Announce URL, may be repeated
        #[arg(short, long = "tracker")]
        trackers: Vec<String>,
        /// Piece length in bytes
        #[arg(long, default_value_t = blast_core::torrent::metainfo::DEFAULT_PIECE_LENGTH)]
        piece_length: u32,
        /// Where to write the torrent, defaults to `<file>.torrent`
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Download {
            torrent,
            output,
            port,
            max_peers,
            encrypt,
            seed,
        } => {
            let mut config = BlastConfig::from_env();
            if let Some(output) = output {
                config.storage.download_dir = output;
            }
            if let Some(port) = port {
                config.network.listen_port = port;
            }
            if let Some(max_peers) = max_peers {
                config.network.max_peer_connections = max_peers;
            }
            config.encryption.enabled |= encrypt;
            config.validate().map_err(user_error)?;

            download(&torrent, config, seed).await
        }
        Commands::Info { torrent } => show_info(&torrent).await,
        Commands::Create {
            file,
            trackers,
            piece_length,
            output,
        } => create_torrent(&file, trackers, piece_length, output).await,
    }
}

/// Download a torrent until it completes or Ctrl-C
///
/// # Errors
/// - Torrent file unreadable or invalid
/// - Listen port unavailable or payload file not accessible
pub async fn download(torrent_path: &Path, config: BlastConfig, seed: bool) -> anyhow::Result<()> {
    let metadata = BencodeTorrentParser::new()
        .parse_torrent_file(torrent_path)
        .await
        .map_err(|e| user_error(e.into()))?;

    let manager = TorrentManager::new(Arc::new(config));
    let torrent = manager.open_torrent(metadata).await?;
    let address = manager.listen().await?;
    println!("Downloading {} ({})", torrent.metadata().name, torrent.info_hash());
    println!("  Listening on port {}", address.port());

    torrent.start().await?;

    let mut progress = tokio::time::interval(Duration::from_secs(1));
    let mut announced_completion = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nInterrupted, shutting down...");
                break;
            }
            _ = progress.tick() => {
                let stats = torrent.stats();
                println!("{}", progress_line(&stats));

                if stats.state == TorrentState::Completed && !announced_completion {
                    announced_completion = true;
                    println!("Download complete: {}", torrent.metadata().name);
                    if !seed {
                        break;
                    }
                    println!("Seeding, press Ctrl-C to stop");
                }
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

/// Print metadata of a torrent file
///
/// # Errors
/// - Torrent file unreadable or invalid
pub async fn show_info(torrent_path: &Path) -> anyhow::Result<()> {
    let metadata = BencodeTorrentParser::new()
        .parse_torrent_file(torrent_path)
        .await
        .map_err(|e| user_error(e.into()))?;

    println!("Name:         {}", metadata.name);
    println!("Info hash:    {}", metadata.info_hash);
    println!("Pieces:       {}", metadata.piece_count());
    println!("Piece length: {}", format_bytes(u64::from(metadata.piece_length)));
    println!("Total size:   {}", format_bytes(metadata.total_length));
    if metadata.announce_urls.is_empty() {
        println!("Trackers:     none");
    } else {
        println!("Trackers:");
        for url in &metadata.announce_urls {
            println!("  {url}");
        }
    }
    Ok(())
}

/// Hash a local file into a new torrent file
///
/// # Errors
/// - Source file unreadable or empty
/// - Torrent file could not be written
pub async fn create_torrent(
    file: &Path,
    trackers: Vec<String>,
    piece_length: u32,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let metadata = TorrentCreator::with_piece_length(piece_length)
        .create_from_file(file, trackers)
        .await
        .map_err(|e| user_error(e.into()))?;

    let output = output.unwrap_or_else(|| {
        let mut path = file.as_os_str().to_owned();
        path.push(".torrent");
        PathBuf::from(path)
    });
    tokio::fs::write(&output, encode_torrent(&metadata))
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("Created {}", output.display());
    println!("  Info hash: {}", metadata.info_hash);
    println!("  Pieces:    {}", metadata.piece_count());
    Ok(())
}

fn user_error(error: BlastError) -> anyhow::Error {
    if error.is_user_error() {
        anyhow::anyhow!(error.user_message())
    } else {
        anyhow::Error::new(error)
    }
}

fn progress_line(stats: &TorrentStats) -> String {
    format!(
        "{:>9} {:5.1}%  pieces {}/{}  peers {}/{}  down {} ({})  up {} ({})",
        stats.state.to_string(),
        stats.completeness,
        stats.pieces_complete,
        stats.piece_count,
        stats.connected_peers,
        stats.known_peers,
        format_bytes(stats.downloaded),
        format_rate(stats.download_rate),
        format_bytes(stats.uploaded),
        format_rate(stats.upload_rate),
    )
}

fn format_rate(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec.round() as u64))
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> TorrentStats {
        TorrentStats {
            state: TorrentState::Started,
            piece_count: 10,
            pieces_complete: 4,
            completeness: 40.0,
            left: 6 * 16384,
            uploaded: 512,
            downloaded: 3 * 1024 * 1024,
            upload_rate: 0.0,
            download_rate: 1536.0,
            connected_peers: 2,
            known_peers: 5,
            peers: vec![],
        }
    }

    #[test]
    fn test_format_bytes_picks_unit() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }

    #[test]
    fn test_progress_line_shows_totals_and_rates() {
        let line = progress_line(&stats());
        assert!(line.contains("40.0%"));
        assert!(line.contains("pieces 4/10"));
        assert!(line.contains("peers 2/5"));
        assert!(line.contains("down 3.0 MiB (1.5 KiB/s)"));
        assert!(line.contains("up 512 B (0 B/s)"));
    }
}
