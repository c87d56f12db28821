//! Torrent metainfo: parsing `.torrent` files and building new ones.
//!
//! Only single-file torrents are supported. The infohash is the SHA-1 of the
//! `info` value exactly as it appears in the file, so the parser locates
//! that byte span instead of re-encoding the decoded dictionary.

use std::path::Path;

use sha1::{Digest, Sha1};

use super::{InfoHash, PieceIndex, TorrentError};
use crate::storage::BlockLayout;
use crate::storage::layout::{BLOCK_SIZE, MAX_BLOCKS_PER_PIECE};

type BencodeDict<'a> = std::collections::HashMap<&'a [u8], bencode_rs::Value<'a>>;
type ParseResult<T> = Result<T, TorrentError>;

/// Default piece length for created torrents (256 KiB).
pub const DEFAULT_PIECE_LENGTH: u32 = 262_144;

/// Metadata extracted from a single-file torrent.
///
/// Contains everything the engine needs to download: piece hashes, sizes
/// and tracker URLs.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentMetadata {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
    pub announce_urls: Vec<String>,
}

impl TorrentMetadata {
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    pub fn layout(&self) -> BlockLayout {
        BlockLayout::new(self.piece_length, self.total_length)
    }

    /// Size of a piece; only the last one may be short.
    pub fn piece_size(&self, index: PieceIndex) -> Option<u32> {
        self.layout().piece_size(index)
    }
}

/// Parser for bencoded `.torrent` files.
#[derive(Debug, Default)]
pub struct BencodeTorrentParser;

impl BencodeTorrentParser {
    pub fn new() -> Self {
        Self
    }

    /// Reads and parses a torrent file.
    ///
    /// # Errors
    /// - `TorrentError::Io` - File could not be read
    /// - `TorrentError::InvalidTorrentFile` - Malformed or unsupported torrent
    pub async fn parse_torrent_file(&self, path: &Path) -> Result<TorrentMetadata, TorrentError> {
        let contents = tokio::fs::read(path).await?;
        self.parse_torrent_data(&contents)
    }

    /// Parses torrent metadata from raw bencode bytes.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Malformed bencode, missing fields,
    ///   inconsistent sizes or a multi-file torrent
    pub fn parse_torrent_data(&self, torrent_bytes: &[u8]) -> Result<TorrentMetadata, TorrentError> {
        let parsed = bencode_rs::Value::parse(torrent_bytes).map_err(|e| {
            TorrentError::InvalidTorrentFile {
                reason: format!("Bencode parsing failed: {e:?}"),
            }
        })?;

        let Some(bencode_rs::Value::Dictionary(dict)) = parsed.first() else {
            return Err(invalid("Root element must be dictionary"));
        };

        let Some(bencode_rs::Value::Dictionary(info)) = dict.get(b"info".as_slice()) else {
            return Err(invalid("Missing or invalid 'info' dictionary"));
        };

        if info.contains_key(b"files".as_slice()) {
            return Err(invalid("Multi-file torrents are not supported"));
        }

        let name = extract_string(info, b"name")?;
        let piece_length = extract_integer(info, b"piece length")?;
        let piece_length = u32::try_from(piece_length)
            .ok()
            .filter(|&length| length > 0)
            .ok_or_else(|| invalid(format!("Invalid piece length {piece_length}")))?;
        let total_length = extract_integer(info, b"length")?;
        let total_length = u64::try_from(total_length)
            .ok()
            .filter(|&length| length > 0)
            .ok_or_else(|| invalid(format!("Invalid length {total_length}")))?;

        let pieces = extract_bytes(info, b"pieces")?;
        if pieces.len() % 20 != 0 {
            return Err(invalid("Invalid pieces length"));
        }
        let piece_hashes: Vec<[u8; 20]> = pieces
            .chunks(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let expected = total_length.div_ceil(u64::from(piece_length));
        if piece_hashes.len() as u64 != expected {
            return Err(invalid(format!(
                "{} piece hashes for {expected} pieces",
                piece_hashes.len()
            )));
        }

        let info_hash = calculate_info_hash(torrent_bytes)?;
        let announce_urls = extract_announce_urls(dict);

        Ok(TorrentMetadata {
            info_hash,
            name,
            piece_length,
            piece_hashes,
            total_length,
            announce_urls,
        })
    }
}

/// Builds single-file torrents from local data.
#[derive(Debug, Clone)]
pub struct TorrentCreator {
    piece_length: u32,
}

impl Default for TorrentCreator {
    fn default() -> Self {
        Self::new()
    }
}

impl TorrentCreator {
    pub fn new() -> Self {
        Self::with_piece_length(DEFAULT_PIECE_LENGTH)
    }

    pub fn with_piece_length(piece_length: u32) -> Self {
        Self { piece_length }
    }

    /// Hashes `payload` into metadata for a torrent named `name`.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Empty payload
    /// - `TorrentError::InvalidPieceSize` - Piece length zero or above 32 blocks
    pub fn create_from_bytes(
        &self,
        name: &str,
        payload: &[u8],
        announce_urls: Vec<String>,
    ) -> Result<TorrentMetadata, TorrentError> {
        if payload.is_empty() {
            return Err(invalid("Cannot create torrent from empty data"));
        }
        let max = MAX_BLOCKS_PER_PIECE * BLOCK_SIZE;
        if self.piece_length == 0 || self.piece_length > max {
            return Err(TorrentError::InvalidPieceSize {
                size: self.piece_length,
                max,
            });
        }

        let piece_hashes: Vec<[u8; 20]> = payload
            .chunks(self.piece_length as usize)
            .map(super::piece::sha1_digest)
            .collect();
        let info = encode_info(name, payload.len() as u64, self.piece_length, &piece_hashes);

        Ok(TorrentMetadata {
            info_hash: InfoHash::new(super::piece::sha1_digest(&info)),
            name: name.to_string(),
            piece_length: self.piece_length,
            piece_hashes,
            total_length: payload.len() as u64,
            announce_urls,
        })
    }

    /// Reads a file and hashes it into metadata named after the file.
    ///
    /// # Errors
    /// - `TorrentError::Io` - File could not be read
    /// - `TorrentError::InvalidTorrentFile` - Empty file or unusable name
    pub async fn create_from_file(
        &self,
        path: &Path,
        announce_urls: Vec<String>,
    ) -> Result<TorrentMetadata, TorrentError> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| invalid("Invalid filename"))?
            .to_string();
        let payload = tokio::fs::read(path).await?;
        self.create_from_bytes(&name, &payload, announce_urls)
    }
}

/// Encodes metadata as a `.torrent` file.
pub fn encode_torrent(metadata: &TorrentMetadata) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(b'd');
    if let Some(first) = metadata.announce_urls.first() {
        put_bytes(&mut out, b"announce");
        put_bytes(&mut out, first.as_bytes());
    }
    if metadata.announce_urls.len() > 1 {
        put_bytes(&mut out, b"announce-list");
        out.push(b'l');
        for url in &metadata.announce_urls {
            out.push(b'l');
            put_bytes(&mut out, url.as_bytes());
            out.push(b'e');
        }
        out.push(b'e');
    }
    put_bytes(&mut out, b"info");
    out.extend_from_slice(&encode_info(
        &metadata.name,
        metadata.total_length,
        metadata.piece_length,
        &metadata.piece_hashes,
    ));
    out.push(b'e');
    out
}

/// Bencoded info dictionary, keys in sorted order.
fn encode_info(name: &str, length: u64, piece_length: u32, piece_hashes: &[[u8; 20]]) -> Vec<u8> {
    let mut info = Vec::new();
    info.push(b'd');
    put_bytes(&mut info, b"length");
    put_integer(&mut info, length);
    put_bytes(&mut info, b"name");
    put_bytes(&mut info, name.as_bytes());
    put_bytes(&mut info, b"piece length");
    put_integer(&mut info, u64::from(piece_length));
    put_bytes(&mut info, b"pieces");
    info.extend_from_slice((piece_hashes.len() * 20).to_string().as_bytes());
    info.push(b':');
    for hash in piece_hashes {
        info.extend_from_slice(hash);
    }
    info.push(b'e');
    info
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

fn put_integer(out: &mut Vec<u8>, value: u64) {
    out.push(b'i');
    out.extend_from_slice(value.to_string().as_bytes());
    out.push(b'e');
}

/// SHA-1 over the raw bytes of the top-level `info` value.
fn calculate_info_hash(torrent_bytes: &[u8]) -> ParseResult<InfoHash> {
    if torrent_bytes.first() != Some(&b'd') {
        return Err(invalid("Root element must be dictionary"));
    }

    let mut pos = 1;
    while pos < torrent_bytes.len() && torrent_bytes[pos] != b'e' {
        let key_end = value_end(torrent_bytes, pos)?;
        let key = string_contents(&torrent_bytes[pos..key_end])?;
        let value_start = key_end;
        let value_stop = value_end(torrent_bytes, value_start)?;
        if key == b"info" {
            let mut hasher = Sha1::new();
            hasher.update(&torrent_bytes[value_start..value_stop]);
            let hash = hasher.finalize();
            let mut hash_array = [0u8; 20];
            hash_array.copy_from_slice(&hash);
            return Ok(InfoHash::new(hash_array));
        }
        pos = value_stop;
    }

    Err(invalid("Could not find info dictionary in data"))
}

/// Position just past the bencode value starting at `pos`.
fn value_end(data: &[u8], pos: usize) -> ParseResult<usize> {
    match data.get(pos) {
        Some(b'i') => {
            let end = data[pos..]
                .iter()
                .position(|&b| b == b'e')
                .ok_or_else(|| invalid("Unterminated integer"))?;
            Ok(pos + end + 1)
        }
        Some(b'l' | b'd') => {
            let mut cursor = pos + 1;
            loop {
                match data.get(cursor) {
                    Some(b'e') => return Ok(cursor + 1),
                    Some(_) => cursor = value_end(data, cursor)?,
                    None => return Err(invalid("Unterminated container")),
                }
            }
        }
        Some(b'0'..=b'9') => {
            let colon = data[pos..]
                .iter()
                .position(|&b| b == b':')
                .ok_or_else(|| invalid("Invalid string format"))?;
            let length: usize = std::str::from_utf8(&data[pos..pos + colon])
                .ok()
                .and_then(|digits| digits.parse().ok())
                .ok_or_else(|| invalid("Invalid string length"))?;
            let end = pos + colon + 1 + length;
            if end > data.len() {
                return Err(invalid("String overruns data"));
            }
            Ok(end)
        }
        _ => Err(invalid("Invalid bencode character")),
    }
}

fn string_contents(encoded: &[u8]) -> ParseResult<&[u8]> {
    let colon = encoded
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| invalid("Dictionary key must be a string"))?;
    Ok(&encoded[colon + 1..])
}

fn extract_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> ParseResult<&'a [u8]> {
    match dict.get(key) {
        Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
        _ => Err(invalid(format!(
            "Missing or invalid field: {:?}",
            String::from_utf8_lossy(key)
        ))),
    }
}

fn extract_string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
    let bytes = extract_bytes(dict, key)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| {
        invalid(format!(
            "Invalid UTF-8 in field: {:?}",
            String::from_utf8_lossy(key)
        ))
    })
}

fn extract_integer(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<i64> {
    match dict.get(key) {
        Some(bencode_rs::Value::Integer(value)) => Ok(*value),
        _ => Err(invalid(format!(
            "Missing or invalid integer field: {:?}",
            String::from_utf8_lossy(key)
        ))),
    }
}

/// `announce` followed by every `announce-list` entry, duplicates dropped.
fn extract_announce_urls(dict: &BencodeDict<'_>) -> Vec<String> {
    let mut announce_urls: Vec<String> = Vec::new();
    let mut push = |url: String| {
        if !announce_urls.contains(&url) {
            announce_urls.push(url);
        }
    };

    if let Ok(announce) = extract_string(dict, b"announce") {
        push(announce);
    }

    if let Some(bencode_rs::Value::List(tiers)) = dict.get(b"announce-list".as_slice()) {
        for tier in tiers {
            if let bencode_rs::Value::List(tier_urls) = tier {
                for url_value in tier_urls {
                    if let bencode_rs::Value::Bytes(url_bytes) = url_value {
                        if let Ok(url) = String::from_utf8(url_bytes.to_vec()) {
                            push(url);
                        }
                    }
                }
            }
        }
    }

    announce_urls
}

fn invalid(reason: impl Into<String>) -> TorrentError {
    TorrentError::InvalidTorrentFile {
        reason: reason.into(),
    }
}
