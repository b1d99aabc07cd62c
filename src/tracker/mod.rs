//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements communication with BitTorrent trackers, including:
//! - Announce requests and responses
//! - Peer parsing (compact and non-compact)
//! - Peer ID generation and URL encoding helpers
//!
//! Used by the client to discover peers for a torrent.
use crate::torrent::file::TorrentFile;
use crate::torrent::TorrentError;
use anyhow::{Ok, Result};
use rand::Rng;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};

/// Fixed listening port advertised to the tracker. The client never binds
/// a listener (leech-only), so this is a nominal value only.
pub const LISTEN_PORT: u16 = 6881;

// Represents a client communicating with a bittorent tracker
#[derive(Debug)]
pub struct Client {
    peer_id: [u8; 20],
    port: u16,
}

// Contains the parameters for a tracker announce request
#[derive(Debug)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: i64,
    pub downloaded: i64,
    pub compact: bool,
    pub left: i64,
}

/// Represents a peer recieved from the tracker.
#[derive(Debug, Clone, Deserialize)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Contains the parsed response from a tracker.
#[derive(Debug, Deserialize)]
pub struct AnnounceResponse {
    pub interval: i64,
    pub peers: Vec<Peer>, // A list of peers that client can connect to.
}

#[derive(Debug, Deserialize)]
struct TrackerResponse {
    #[serde(default)]
    interval: i64,
    #[serde(default)]
    peers: Peers,
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<Vec<u8>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Peers {
    Compact(Vec<u8>),
    NonCompact(Vec<PeerDict>),
}

impl Default for Peers {
    fn default() -> Self {
        Peers::Compact(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

impl Client {
    pub fn new(port: u16) -> Result<Self> {
        Ok(Self {
            peer_id: generate_peer_id()?,
            port,
        })
    }
    /// Sends an announce request to the tracker to get a list of peers.
    #[tracing::instrument(skip(self, torrent), level = "debug")]
    pub async fn announce(&self, torrent: &TorrentFile) -> Result<AnnounceResponse> {
        let request = AnnounceRequest {
            info_hash: torrent.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: 0,
            downloaded: 0,
            compact: true,
            left: torrent.total_length(),
        };
        let url = build_announce_url(&torrent.announce, &request)?;
        tracing::debug!(?url, "Making announce request to tracker");
        let response = reqwest::get(url).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TorrentError::Http(status).into());
        }
        let response_bytes = response.bytes().await?;
        Self::parse_announce_response(&response_bytes)
    }

    /// Parses the response from a BitTorrent tracker announce request.
    ///
    /// This function takes a byte slice containing the bencoded tracker response,
    /// deserializes it into a `TrackerResponse` struct, and then extracts the list of peers.
    /// It handles both the compact and non-compact peer list formats as specified by the BitTorrent protocol:
    /// - **Compact format**: The "peers" field is a byte string where each peer is represented by 6 bytes
    ///   (4 bytes for the IPv4 address and 2 bytes for the port, in network byte order).
    /// - **Non-compact format**: The "peers" field is a list of dictionaries, each containing "ip" and "port".
    ///
    /// # Arguments
    /// * `bytes` - A byte slice containing the bencoded tracker response.
    ///
    /// # Returns
    /// * `Result<AnnounceResponse>` - The parsed announce response, including the interval and the list of peers.
    fn parse_announce_response(bytes: &[u8]) -> Result<AnnounceResponse> {
        // 1. Deserialize the tracker response from bencoded bytes
        let tracker_response: TrackerResponse = serde_bencode::from_bytes(bytes)?;

        // 1a. A `failure reason` key means the tracker rejected the request outright.
        if let Some(reason) = tracker_response.failure_reason {
            let reason = String::from_utf8_lossy(&reason).into_owned();
            return Err(TorrentError::TrackerRejected(reason).into());
        }

        // 2. Parse the peers field, handling both compact and non-compact forms
        let peers = match tracker_response.peers {
            // 2a. Compact: each peer is 6 bytes (4 for IP, 2 for port). A length
            // that isn't a multiple of 6 is malformed, not merely truncated.
            Peers::Compact(bytes) => {
                if bytes.len() % 6 != 0 {
                    return Err(TorrentError::InvalidFormat(format!(
                        "compact peers blob length {} is not a multiple of 6",
                        bytes.len()
                    ))
                    .into());
                }
                bytes
                    .chunks_exact(6)
                    .map(|chunk| {
                        let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                        let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                        Peer {
                            ip: IpAddr::V4(ip),
                            port,
                        }
                    })
                    .collect()
            }
            // 2b. Non-compact: each peer is a dictionary with "ip" and "port"
            Peers::NonCompact(dicts) => dicts
                .into_iter()
                .filter_map(|dict| {
                    dict.ip.parse::<IpAddr>().ok().map(|ip| Peer {
                        ip,
                        port: dict.port,
                    })
                })
                .collect(),
        };

        // 3. Return the parsed announce response
        Ok(AnnounceResponse {
            interval: tracker_response.interval,
            peers,
        })
    }
}
/// Generates a unique peer ID for this client.
///
/// This function creates a 20-byte peer ID that follows the BitTorrent protocol specification.
/// The peer ID consists of:
/// - A 9-byte prefix identifying the client ("-RT0001-") RT = Rust torrent
/// - 11 random bytes to ensure uniqueness
///
/// # Returns
/// * `Result<[u8; 20]>` - A 20-byte peer ID, or an error if generation fails
pub fn generate_peer_id() -> Result<[u8; 20]> {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RT0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[prefix.len()..]);
    Ok(peer_id)
}

/// URL-encodes a byte slice according to RFC 3986.
///
/// This function performs percent-encoding of bytes that are not in the unreserved
/// character set. Unreserved characters (a-z, A-Z, 0-9, -, ., _, ~) are left as-is,
/// while all other characters are encoded as %XX where XX is the hexadecimal
/// representation of the byte value.
///
/// # Arguments
/// * `bytes` - The byte slice to URL-encode
///
/// # Returns
/// * `String` - The URL-encoded string
///
/// # Example
/// ```rust
/// let bytes = b"Hello World!";
/// let encoded = url_encode(bytes);
/// assert_eq!(encoded, "Hello%20World%21");
/// ```
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

/// Builds the announce URL for `request` against `base`.
///
/// `info_hash` and `peer_id` are raw 20-byte blobs that [`url_encode`] has
/// already percent-escaped byte-for-byte; routing an already-escaped string
/// through [`url::Url::query_pairs_mut`] would re-escape every `%` it
/// contains (`%` is not in `url`'s unreserved set), turning e.g. `%1A` into
/// `%251A` on the wire and corrupting the hash. So the binary fields are
/// appended to the query string directly, and only the plain-ASCII numeric
/// fields go through the pair builder.
fn build_announce_url(base: &str, request: &AnnounceRequest) -> Result<url::Url> {
    let mut url = url::Url::parse(base)?;
    url.query_pairs_mut()
        .append_pair("port", &request.port.to_string())
        .append_pair("uploaded", &request.uploaded.to_string())
        .append_pair("downloaded", &request.downloaded.to_string())
        .append_pair("left", &request.left.to_string())
        .append_pair("compact", &(request.compact as i32).to_string());

    let binary_params = format!(
        "info_hash={}&peer_id={}",
        url_encode(&request.info_hash),
        url_encode(&request.peer_id)
    );
    let full_query = match url.query() {
        Some(existing) if !existing.is_empty() => format!("{existing}&{binary_params}"),
        _ => binary_params,
    };
    url.set_query(Some(&full_query));

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encode_escapes_binary_bytes() {
        assert_eq!(url_encode(b"Hello World!"), "Hello%20World%21");
        assert_eq!(url_encode(&[0u8, 1, 255]), "%00%01%FF");
    }

    #[test]
    fn announce_url_does_not_double_encode_info_hash() {
        let mut info_hash = [0u8; 20];
        info_hash[0] = 0x1A;
        let request = AnnounceRequest {
            info_hash,
            peer_id: [0u8; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            compact: true,
            left: 100,
        };

        let url = build_announce_url("http://tracker.example/announce", &request).unwrap();
        let query = url.query().unwrap();

        assert!(
            query.contains("info_hash=%1A"),
            "expected a single-escaped %1A in query, got: {query}"
        );
        assert!(
            !query.contains("%251A"),
            "info_hash byte was double-encoded: {query}"
        );
    }

    #[test]
    fn announce_url_preserves_existing_query_string() {
        let request = AnnounceRequest {
            info_hash: [0u8; 20],
            peer_id: [0u8; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            compact: true,
            left: 0,
        };

        let url =
            build_announce_url("http://tracker.example/announce?passkey=abc", &request).unwrap();
        let query = url.query().unwrap();

        assert!(query.starts_with("passkey=abc&"));
        assert!(query.contains("info_hash="));
    }

    #[test]
    fn compact_peer_list_parses_exact_count() {
        let mut peers_bytes = Vec::new();
        for i in 0u8..3 {
            peers_bytes.extend_from_slice(&[127, 0, 0, i + 1]);
            peers_bytes.extend_from_slice(&(6881 + i as u16).to_be_bytes());
        }
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers");
        body.extend_from_slice(format!("{}:", peers_bytes.len()).as_bytes());
        body.extend_from_slice(&peers_bytes);
        body.extend_from_slice(b"e");

        let response = Client::parse_announce_response(&body).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers.len(), 3);
        assert_eq!(response.peers[0].port, 6881);
    }

    #[test]
    fn non_multiple_of_six_peers_blob_fails() {
        let body = b"d8:intervali1800e5:peers7:1234567e";
        assert!(Client::parse_announce_response(body).is_err());
    }

    #[test]
    fn failure_reason_is_surfaced() {
        let reason = "not registered";
        let body = format!(
            "d14:failure reason{}:{}e",
            reason.len(),
            reason
        );
        let err = Client::parse_announce_response(body.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("not registered"));
    }
}
