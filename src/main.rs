//! Command-line entry point for rs-torrent-client.
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rs_torrent_client::bencode::{self, BencodeValue};
use rs_torrent_client::peer::handshake::Handshake;
use rs_torrent_client::peer::session::PeerSession;
use rs_torrent_client::torrent::file::TorrentFile;
use rs_torrent_client::tracker::{generate_peer_id, Client as TrackerClient, LISTEN_PORT};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::instrument;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rstc", version, about = "A minimal BitTorrent client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a single bencoded value and print it as JSON.
    Decode { value: String },
    /// Print a .torrent file's tracker URL, length, info hash and piece hashes.
    Info { torrent_path: PathBuf },
    /// Announce to the tracker and print the discovered peers.
    Peers { torrent_path: PathBuf },
    /// Perform the peer handshake and print the remote peer id.
    Handshake {
        torrent_path: PathBuf,
        peer_addr: String,
    },
    /// Download a single piece from a peer to a file.
    DownloadPiece {
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        torrent_path: PathBuf,
        piece_index: usize,
    },
    /// Download the full file from a peer to a file.
    Download {
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        torrent_path: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run().await {
        tracing::error!(error = %err, "command failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

#[instrument(level = "debug")]
async fn run() -> Result<()> {
    let cli = Cli::parse();
    tracing::debug!(command = ?cli.command, "dispatching CLI command");

    match cli.command {
        Command::Decode { value } => cmd_decode(&value),
        Command::Info { torrent_path } => cmd_info(&torrent_path),
        Command::Peers { torrent_path } => cmd_peers(&torrent_path).await,
        Command::Handshake {
            torrent_path,
            peer_addr,
        } => cmd_handshake(&torrent_path, &peer_addr).await,
        Command::DownloadPiece {
            output,
            torrent_path,
            piece_index,
        } => cmd_download_piece(&torrent_path, piece_index, &output).await,
        Command::Download {
            output,
            torrent_path,
        } => cmd_download(&torrent_path, &output).await,
    }
}

fn load_torrent(path: &PathBuf) -> Result<TorrentFile> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading torrent file {}", path.display()))?;
    let (value, _) = bencode::decode(&bytes)?;
    TorrentFile::parse(value)
}

#[instrument(level = "debug")]
fn cmd_decode(value: &str) -> Result<()> {
    let (decoded, _) = bencode::decode(value.as_bytes())?;
    let json = bencode_to_json(&decoded);
    println!("{json}");
    Ok(())
}

/// Converts a decoded [`BencodeValue`] to JSON for human display. Byte
/// strings are rendered assuming printable content (lossy UTF-8); this is a
/// display convenience, not a binary-safe serialization.
fn bencode_to_json(value: &BencodeValue) -> serde_json::Value {
    match value {
        BencodeValue::String(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        BencodeValue::Integer(i) => serde_json::Value::Number((*i).into()),
        BencodeValue::List(items) => {
            serde_json::Value::Array(items.iter().map(bencode_to_json).collect())
        }
        BencodeValue::Dict(dict) => {
            let mut map = serde_json::Map::new();
            let mut keys: Vec<&Vec<u8>> = dict.keys().collect();
            keys.sort_unstable();
            for key in keys {
                let key_str = String::from_utf8_lossy(key).into_owned();
                map.insert(key_str, bencode_to_json(&dict[key]));
            }
            serde_json::Value::Object(map)
        }
    }
}

#[instrument(level = "debug")]
fn cmd_info(torrent_path: &PathBuf) -> Result<()> {
    let torrent = load_torrent(torrent_path)?;
    tracing::debug!(pieces = torrent.num_pieces(), "loaded torrent metainfo");

    println!("Tracker URL: {}", torrent.announce);
    println!("Length: {}", torrent.total_length());
    println!("Info Hash: {}", hex::encode(torrent.info_hash));
    println!("Piece Length: {}", torrent.info.piece_length);
    println!("Piece Hashes:");
    for hash in &torrent.pieces_hash {
        println!("{}", hex::encode(hash));
    }

    Ok(())
}

#[instrument(level = "debug")]
async fn cmd_peers(torrent_path: &PathBuf) -> Result<()> {
    let torrent = load_torrent(torrent_path)?;
    let client = TrackerClient::new(LISTEN_PORT)?;
    let response = client.announce(&torrent).await?;
    if response.peers.is_empty() {
        tracing::warn!("tracker returned an empty peer list");
    } else {
        tracing::info!(count = response.peers.len(), "tracker returned peers");
    }

    for peer in response.peers {
        println!("{peer}");
    }

    Ok(())
}

#[instrument(level = "debug")]
async fn cmd_handshake(torrent_path: &PathBuf, peer_addr: &str) -> Result<()> {
    let torrent = load_torrent(torrent_path)?;
    let addr: SocketAddr = SocketAddr::from_str(peer_addr)
        .with_context(|| format!("invalid peer address {peer_addr}"))?;
    let peer_id = generate_peer_id()?;

    let (_stream, handshake) = Handshake::do_handshake(addr, torrent.info_hash, peer_id).await?;
    tracing::info!(peer = %addr, "handshake succeeded");
    println!("Peer ID: {}", hex::encode(handshake.peer_id));

    Ok(())
}

#[instrument(level = "debug")]
async fn cmd_download_piece(
    torrent_path: &PathBuf,
    piece_index: usize,
    output: &PathBuf,
) -> Result<()> {
    let torrent = load_torrent(torrent_path)?;
    if piece_index >= torrent.num_pieces() {
        bail!(
            "piece index {piece_index} out of range (torrent has {} pieces)",
            torrent.num_pieces()
        );
    }

    let client = TrackerClient::new(LISTEN_PORT)?;
    let announce = client.announce(&torrent).await?;
    let peer = announce
        .peers
        .first()
        .context("tracker returned no peers")?;
    tracing::debug!(peer = %peer, "connecting to peer for piece download");

    let peer_id = generate_peer_id()?;
    let mut session = PeerSession::connect(
        (peer.ip, peer.port),
        torrent.info_hash,
        peer_id,
    )
    .await?;

    let data = session.download_piece(&torrent, piece_index).await?;
    std::fs::write(output, &data)
        .with_context(|| format!("writing piece to {}", output.display()))?;
    tracing::info!(piece_index, bytes = data.len(), "piece downloaded");

    println!("Piece downloaded to {}.", output.display());
    Ok(())
}

#[instrument(level = "debug")]
async fn cmd_download(torrent_path: &PathBuf, output: &PathBuf) -> Result<()> {
    let torrent = load_torrent(torrent_path)?;

    let client = TrackerClient::new(LISTEN_PORT)?;
    let announce = client.announce(&torrent).await?;
    let peer = announce
        .peers
        .first()
        .context("tracker returned no peers")?;
    tracing::debug!(peer = %peer, pieces = torrent.num_pieces(), "connecting to peer for full download");

    let peer_id = generate_peer_id()?;
    let mut session = PeerSession::connect(
        (peer.ip, peer.port),
        torrent.info_hash,
        peer_id,
    )
    .await?;

    let data = session.download_file(&torrent).await?;
    std::fs::write(output, &data)
        .with_context(|| format!("writing file to {}", output.display()))?;
    tracing::info!(bytes = data.len(), "download complete");

    println!(
        "Downloaded {} to {}.",
        torrent_path.display(),
        output.display()
    );
    Ok(())
}
