//! HTTP tracker client implementation with URL building and response parsing

use std::net::SocketAddr;

use async_trait::async_trait;

use super::types::{AnnounceRequest, AnnounceResponse, TrackerClient};
use crate::config::NetworkConfig;
use crate::torrent::{TorrentError, url_encode_bytes};

/// HTTP tracker client implementation
pub struct HttpTrackerClient {
    announce_url: String,
    client: reqwest::Client,
}

impl HttpTrackerClient {
    /// Creates an HTTP tracker client using the network timeouts.
    ///
    /// # Errors
    /// - `TorrentError::UrlParsing` - Announce URL is not a URL
    /// - `TorrentError::UnsupportedTracker` - Scheme is neither http nor https
    /// - `TorrentError::Http` - HTTP client could not be built
    pub fn new(announce_url: String, config: &NetworkConfig) -> Result<Self, TorrentError> {
        let parsed = url::Url::parse(&announce_url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TorrentError::UnsupportedTracker { url: announce_url });
        }

        let client = reqwest::Client::builder()
            .timeout(config.tracker_timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;

        Ok(Self {
            announce_url,
            client,
        })
    }

    /// Build announce URL with query parameters
    pub(super) fn build_announce_url(&self, request: &AnnounceRequest) -> String {
        // Binary fields are encoded by hand; reqwest would double-encode them.
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
            request.info_hash.url_encoded(),
            url_encode_bytes(request.peer_id.as_bytes()),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
            request.numwant,
        );
        if let Some(event) = request.event {
            query.push_str("&event=");
            query.push_str(event.as_str());
        }
        if let Some(tracker_id) = &request.tracker_id {
            query.push_str("&trackerid=");
            query.push_str(&url_encode_bytes(tracker_id.as_bytes()));
        }

        let separator = if self.announce_url.contains('?') { '&' } else { '?' };
        format!("{}{separator}{query}", self.announce_url)
    }

    /// Parse compact peer list from tracker response
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Invalid compact peer data length (not multiple of 6 bytes)
    pub(crate) fn parse_compact_peers(peer_bytes: &[u8]) -> Result<Vec<SocketAddr>, TorrentError> {
        if peer_bytes.len() % 6 != 0 {
            return Err(TorrentError::ProtocolError {
                message: "Invalid compact peer data length".to_string(),
            });
        }

        let mut peers = Vec::new();
        for chunk in peer_bytes.chunks(6) {
            let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            peers.push(SocketAddr::V4(std::net::SocketAddrV4::new(ip, port)));
        }

        Ok(peers)
    }

    /// Parse tracker response from bencode data
    pub(super) fn parse_announce_response(
        &self,
        response_bytes: &[u8],
    ) -> Result<AnnounceResponse, TorrentError> {
        let parsed =
            bencode_rs::Value::parse(response_bytes).map_err(|e| TorrentError::ProtocolError {
                message: format!("Failed to parse tracker response: {e:?}"),
            })?;

        let Some(bencode_rs::Value::Dictionary(dict)) = parsed.first() else {
            return Err(TorrentError::ProtocolError {
                message: "Invalid tracker response format".to_string(),
            });
        };

        if let Some(bencode_rs::Value::Bytes(failure_reason)) =
            dict.get(b"failure reason".as_slice())
        {
            return Err(TorrentError::TrackerFailure {
                url: self.announce_url.clone(),
                reason: String::from_utf8_lossy(failure_reason).to_string(),
            });
        }

        let interval = match dict.get(b"interval".as_slice()) {
            Some(bencode_rs::Value::Integer(val)) => *val as u32,
            _ => {
                return Err(TorrentError::ProtocolError {
                    message: "Missing interval in tracker response".to_string(),
                });
            }
        };

        let complete = match dict.get(b"complete".as_slice()) {
            Some(bencode_rs::Value::Integer(val)) => *val as u32,
            _ => 0, // Optional field
        };

        let incomplete = match dict.get(b"incomplete".as_slice()) {
            Some(bencode_rs::Value::Integer(val)) => *val as u32,
            _ => 0, // Optional field
        };

        let min_interval = match dict.get(b"min interval".as_slice()) {
            Some(bencode_rs::Value::Integer(val)) => Some(*val as u32),
            _ => None,
        };

        let tracker_id = match dict.get(b"tracker id".as_slice()) {
            Some(bencode_rs::Value::Bytes(id_bytes)) => {
                Some(String::from_utf8_lossy(id_bytes).to_string())
            }
            _ => None,
        };

        // Only the compact peer format is requested
        let peers = match dict.get(b"peers".as_slice()) {
            Some(bencode_rs::Value::Bytes(peer_data)) => Self::parse_compact_peers(peer_data)?,
            _ => Vec::new(),
        };

        Ok(AnnounceResponse {
            interval,
            min_interval,
            tracker_id,
            complete,
            incomplete,
            peers,
        })
    }
}

#[async_trait]
impl TrackerClient for HttpTrackerClient {
    /// Announces to the tracker over HTTP GET.
    ///
    /// # Errors
    /// - `TorrentError::TrackerTimeout` - Request timed out
    /// - `TorrentError::TrackerServerError` - Tracker answered with a 5xx status
    /// - `TorrentError::TrackerConnectionFailed` - Network or other HTTP error
    /// - `TorrentError::TrackerFailure` - Tracker sent a failure reason
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError> {
        let url = self.build_announce_url(&request);
        tracing::debug!(
            "Announcing to tracker: url={}, event={:?}",
            self.announce_url,
            request.event
        );

        let response = self.client.get(&url).send().await.map_err(|e| {
            tracing::warn!("HTTP request to {} failed: {}", self.announce_url, e);

            if e.is_timeout() {
                TorrentError::TrackerTimeout {
                    url: self.announce_url.clone(),
                }
            } else {
                TorrentError::TrackerConnectionFailed {
                    url: self.announce_url.clone(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                "Tracker {} returned error status: {}",
                self.announce_url,
                status
            );
            return Err(match status.as_u16() {
                500..=599 => TorrentError::TrackerServerError {
                    url: self.announce_url.clone(),
                    status: status.as_u16(),
                },
                _ => TorrentError::TrackerConnectionFailed {
                    url: self.announce_url.clone(),
                },
            });
        }

        let response_bytes = response.bytes().await.map_err(|e| {
            tracing::warn!(
                "Failed to read response body from {}: {}",
                self.announce_url,
                e
            );
            TorrentError::TrackerConnectionFailed {
                url: self.announce_url.clone(),
            }
        })?;

        let parsed = self.parse_announce_response(&response_bytes)?;
        tracing::debug!(
            "Announced to {}: peers={}, interval={}s",
            self.announce_url,
            parsed.peers.len(),
            parsed.interval
        );
        Ok(parsed)
    }

    fn tracker_url(&self) -> &str {
        &self.announce_url
    }
}

#[cfg(test)]
mod tracker_client_tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::torrent::tracker::AnnounceEvent;
    use crate::torrent::{InfoHash, PeerId};

    fn request(event: Option<AnnounceEvent>) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash::new([0x11; 20]),
            peer_id: PeerId::new(*b"-BL0100-123456789012"),
            port: 6881,
            uploaded: 1000,
            downloaded: 500,
            left: 2000,
            numwant: 50,
            event,
            tracker_id: None,
        }
    }

    fn client(url: &str) -> HttpTrackerClient {
        HttpTrackerClient::new(url.to_string(), &NetworkConfig::default()).unwrap()
    }

    #[test]
    fn test_rejects_unsupported_schemes() {
        let config = NetworkConfig::default();
        assert!(matches!(
            HttpTrackerClient::new("udp://tracker.example.com:80".to_string(), &config),
            Err(TorrentError::UnsupportedTracker { .. })
        ));
        assert!(HttpTrackerClient::new("not a url".to_string(), &config).is_err());
    }

    #[test]
    fn test_build_announce_url() {
        let client = client("http://tracker.example.com/announce");

        let url = client.build_announce_url(&request(Some(AnnounceEvent::Started)));
        assert!(url.starts_with("http://tracker.example.com/announce?info_hash="));
        assert!(
            url.contains("info_hash=%11%11%11%11%11%11%11%11%11%11%11%11%11%11%11%11%11%11%11%11")
        );
        assert!(url.contains("peer_id=-BL0100-123456789012"));
        assert!(url.contains("port=6881"));
        assert!(url.contains("uploaded=1000"));
        assert!(url.contains("downloaded=500"));
        assert!(url.contains("left=2000"));
        assert!(url.contains("compact=1"));
        assert!(url.contains("numwant=50"));
        assert!(url.contains("event=started"));
        assert!(!url.contains("trackerid"));
    }

    #[test]
    fn test_periodic_announce_omits_event() {
        let client = client("https://tracker.example.com/announce?key=abc");
        let mut periodic = request(None);
        periodic.tracker_id = Some("t 1".to_string());

        let url = client.build_announce_url(&periodic);
        assert!(url.starts_with("https://tracker.example.com/announce?key=abc&info_hash="));
        assert!(!url.contains("event="));
        assert!(url.ends_with("&trackerid=t%201"));
    }

    #[test]
    fn test_parse_compact_peers_success() {
        let peer_bytes = vec![
            127, 0, 0, 1, 26, 225, // 127.0.0.1:6881 (26*256+225=6881)
            192, 168, 1, 100, 195, 80, // 192.168.1.100:50000
        ];

        let peers = HttpTrackerClient::parse_compact_peers(&peer_bytes).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].to_string(), "127.0.0.1:6881");
        assert_eq!(peers[1].to_string(), "192.168.1.100:50000");
    }

    #[test]
    fn test_parse_compact_peers_invalid_length() {
        let peer_bytes = vec![127, 0, 0, 1, 26]; // 5 bytes, not multiple of 6
        let result = HttpTrackerClient::parse_compact_peers(&peer_bytes);
        assert!(matches!(
            result.unwrap_err(),
            TorrentError::ProtocolError { message } if message.contains("Invalid compact peer data length")
        ));
    }

    #[test]
    fn test_parse_announce_response_success() {
        let bencode_data = b"d8:intervali1800e8:completei10e10:incompletei5e10:tracker id3:abc5:peers6:\x7f\x00\x00\x01\x1a\x09e";
        let client = client("http://example.com/announce");

        let response = client.parse_announce_response(bencode_data).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.complete, 10);
        assert_eq!(response.incomplete, 5);
        assert_eq!(response.tracker_id.as_deref(), Some("abc"));
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].to_string(), "127.0.0.1:6665");
    }

    #[test]
    fn test_parse_announce_response_failure_reason() {
        let bencode_data = b"d14:failure reason5:errore";
        let client = client("http://example.com/announce");

        let result = client.parse_announce_response(bencode_data);
        assert!(matches!(
            result.unwrap_err(),
            TorrentError::TrackerFailure { reason, .. } if reason == "error"
        ));
    }

    #[test]
    fn test_parse_announce_response_missing_interval() {
        let client = client("http://example.com/announce");
        assert!(client.parse_announce_response(b"d5:peers0:e").is_err());
        assert!(client.parse_announce_response(b"i42e").is_err());
    }

    /// Serves one canned HTTP response and returns the request line.
    async fn serve_once(status: &'static str, body: &'static [u8]) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/announce", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.shutdown().await.unwrap();
            request.lines().next().unwrap_or_default().to_string()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn test_announce_over_http() {
        let (url, server) =
            serve_once("200 OK", b"d8:intervali60e5:peers6:\x7f\x00\x00\x01\x1a\xe1e").await;
        let client = client(&url);

        let response = client
            .announce(request(Some(AnnounceEvent::Completed)))
            .await
            .unwrap();
        assert_eq!(response.interval, 60);
        assert_eq!(response.peers[0].to_string(), "127.0.0.1:6881");

        let request_line = server.await.unwrap();
        assert!(request_line.starts_with("GET /announce?info_hash="));
        assert!(request_line.contains("event=completed"));
    }

    #[tokio::test]
    async fn test_announce_server_error_status() {
        let (url, server) = serve_once("503 Service Unavailable", b"").await;
        let client = client(&url);

        let result = client.announce(request(None)).await;
        assert!(matches!(
            result,
            Err(TorrentError::TrackerServerError { status: 503, .. })
        ));
        server.await.unwrap();
    }
}
