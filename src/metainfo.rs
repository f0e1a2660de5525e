//! Bencoded `.torrent` metainfo decoding.
//!
//! Parsing the metainfo format is an external-collaborator concern (see
//! `SPEC_FULL.md` §1): the core only consumes `info_hash`, piece length,
//! per-piece hashes, total length, and output path. This module is carried
//! so the crate is runnable end to end, but its wire compatibility with any
//! particular `.torrent` producer is not a tested core property.

use serde_bencode::Error;
use sha1::{Digest, Sha1};

use crate::Sha1Hash;

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,
    #[serde(default)]
    pub announce: Option<String>,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        serde_bencode::from_bytes(buf)
    }

    /// Computes the info hash by re-serializing `info` and hashing the
    /// resulting bencoded bytes.
    pub fn create_info_hash(&self) -> Result<Sha1Hash, Error> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Number of pieces described by the metainfo.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Returns the expected SHA-1 hash of the piece at `index`.
    pub fn piece_hash(&self, index: usize) -> Option<Sha1Hash> {
        let start = index * 20;
        let bytes = self.info.pieces.get(start..start + 20)?;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(bytes);
        Some(hash)
    }
}

/// The `info` dictionary of a `.torrent` file.
///
/// `files` is parsed (so well-formed multi-file `.torrent`s still decode
/// without error) but is rejected by `storage_info::StorageInfo::new`: this
/// crate only ever produces a single contiguous output stream.
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bencode_single_file(name: &str, piece_length: u64, pieces: &[u8], length: u64) -> Vec<u8> {
        // Minimal hand-built bencode for a single-file info dict, used only
        // to exercise `Metainfo::from_bytes`/`create_info_hash` without
        // depending on a fixture file on disk.
        let mut pieces_enc = format!("{}:", pieces.len()).into_bytes();
        pieces_enc.extend_from_slice(pieces);
        format!(
            "d4:infod6:lengthi{len}e4:name{name_len}:{name}12:piece lengthi{piece_length}e6:pieces{pieces_bytes}ee",
            len = length,
            name_len = name.len(),
            name = name,
            piece_length = piece_length,
            pieces_bytes = String::from_utf8_lossy(&pieces_enc),
        )
        .into_bytes()
    }

    #[test]
    fn parses_single_file_info() {
        let pieces = vec![0u8; 20];
        let raw = bencode_single_file("a.txt", 16384, &pieces, 10);
        let metainfo = Metainfo::from_bytes(&raw).unwrap();
        assert_eq!(metainfo.info.name, "a.txt");
        assert_eq!(metainfo.info.length, Some(10));
        assert_eq!(metainfo.piece_count(), 1);
        assert!(metainfo.info.files.is_none());
    }
}
