//! The crate-wide error type and result alias.
//!
//! This crate does not reach for a derive-macro error library: the reference
//! engine it's built from hand-rolls its `Error` enum, and the intent here is
//! to keep faith with that rather than bolt on a dependency nothing else in
//! the crate needs.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// The bencoded metainfo could not be parsed, or was missing a required
    /// field.
    InvalidMetainfo(serde_bencode::Error),
    /// `storage_info::StorageInfo::new` was given a metainfo whose `info`
    /// dictionary describes more than one file. Multi-file output is out of
    /// scope for this crate; see `SPEC_FULL.md` Open Question 3.
    MultiFileUnsupported,
    /// A piece index that is not within `[0, piece_count)` was used.
    InvalidPieceIndex,
    /// A block offset/length fell outside its piece's bounds.
    InvalidBlockInfo,
    /// The tracker's announce response could not be decoded as bencode.
    InvalidTrackerResponse(serde_bencode::Error),
    /// The tracker announce response's `peers` field was a list of
    /// dictionaries rather than the compact binary form. Preserved from
    /// `original_source/tracker.py`, which marks this `NotImplementedError`.
    UnsupportedPeerListFormat,
    /// The tracker reported a `failure reason`, or the HTTP response was not
    /// a success status.
    TrackerFailure(String),
    /// The remote peer's handshake carried an `info_hash` that does not match
    /// the torrent being downloaded.
    InfoHashMismatch,
    /// A wire message violated the framing contract (e.g. an implausible
    /// length prefix, or a payload whose size doesn't match its message id).
    MalformedFrame(String),
    /// A `BitField` message arrived after the availability-exchange window
    /// had already closed.
    UnexpectedBitfield,
    /// Writing a verified piece to the output file failed. Fatal: the core
    /// cannot make progress without a working output file.
    OutputWriteFailed(std::io::Error),
    /// Any other I/O failure (socket, file open, etc).
    Io(std::io::Error),
    /// An internal channel between tasks was closed unexpectedly.
    ChannelClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidMetainfo(e) => write!(f, "invalid metainfo: {}", e),
            Error::MultiFileUnsupported => {
                write!(f, "multi-file torrents are not supported")
            }
            Error::InvalidPieceIndex => write!(f, "invalid piece index"),
            Error::InvalidBlockInfo => write!(f, "invalid block offset or length"),
            Error::InvalidTrackerResponse(e) => {
                write!(f, "invalid tracker response: {}", e)
            }
            Error::UnsupportedPeerListFormat => {
                write!(f, "tracker returned a dictionary-form peer list, which is not supported")
            }
            Error::TrackerFailure(reason) => write!(f, "tracker failure: {}", reason),
            Error::InfoHashMismatch => write!(f, "peer handshake info_hash mismatch"),
            Error::MalformedFrame(reason) => write!(f, "malformed peer wire frame: {}", reason),
            Error::UnexpectedBitfield => {
                write!(f, "peer sent a bitfield outside the availability-exchange window")
            }
            Error::OutputWriteFailed(e) => write!(f, "failed to write output file: {}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::ChannelClosed => write!(f, "internal channel closed unexpectedly"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::InvalidMetainfo(e) => Some(e),
            Error::InvalidTrackerResponse(e) => Some(e),
            Error::OutputWriteFailed(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::InvalidMetainfo(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::TrackerFailure(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}
