//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use rand::Rng;

use crate::PeerId;

/// The maximum number of concurrently connected peers for a single torrent.
pub const MAX_PEER_CONNECTIONS: usize = 40;

/// A block request that has been outstanding for longer than this is
/// considered expired and eligible to be re-requested.
pub const MAX_PENDING_MS: u64 = 300_000;

/// The only block length dealt with (except possibly the last block of the
/// torrent): 16 KiB.
pub const BLOCK_LEN: u32 = crate::BLOCK_LEN;

/// The port announced to trackers when none is configured explicitly
/// (`SPEC_FULL.md` §6).
pub const DEFAULT_LISTEN_PORT: u16 = 6889;

/// The client version announced in the peer ID, compacted to one digit per
/// version component (e.g. version 0.1.0 becomes `001`).
const CLIENT_VERSION: &str = "001";

/// Builds a 20-byte peer ID of the form `pTor-<version>-0x<9 hex digits
/// upper>`, e.g. `pTor-001-0xA1B2C3D4E`.
///
/// `pTor-` (5) + version (3) + `-0x` (3) + 9 hex digits = 20 bytes exactly.
pub fn generate_peer_id() -> PeerId {
    let mut rng = rand::thread_rng();
    let suffix: u64 = rng.gen_range(0..0x10_0000_0000);
    let s = format!("pTor-{}-0x{:09X}", CLIENT_VERSION, suffix & 0xF_FFFF_FFFF);
    let mut id = [0u8; 20];
    let bytes = s.as_bytes();
    debug_assert_eq!(bytes.len(), 20);
    id.copy_from_slice(&bytes[..20]);
    id
}

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses a freshly generated peer id (see [`generate_peer_id`]).
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: generate_peer_id(),
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which the torrent's output file is placed.
    pub download_dir: PathBuf,

    /// The maximum number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide an announce interval, default to this.
    pub announce_interval: Duration,

    /// The port we announce to trackers as our listen port. This crate never
    /// actually listens (outbound-only, leech core), but trackers still
    /// expect a port in every announce.
    pub listen_port: u16,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            max_connected_peer_count: MAX_PEER_CONNECTIONS,
            announce_interval: Duration::from_secs(30 * 60),
            listen_port: DEFAULT_LISTEN_PORT,
        }
    }
}
