//! Single-file output geometry: piece/byte-offset arithmetic.
//!
//! The reference engine this crate is built from supports arbitrary
//! multi-file archives (`FsStructure::Archive`). Multi-file output beyond a
//! single contiguous stream is an explicit Non-goal here (see
//! `SPEC_FULL.md` §9, Open Question 3), so only the single-file shape
//! survives; `StorageInfo::new` rejects a metainfo whose `info` dictionary
//! names more than one file.

use std::path::PathBuf;

use crate::{
    error::{Error, Result},
    metainfo::Metainfo,
    PieceIndex,
};

/// Information about the torrent's single output file.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// The file's path, relative to the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
}

/// Information about a torrent's storage details, such as the piece count and
/// length.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The total length of the torrent's output file, in bytes.
    pub download_len: u64,
    /// The single output file.
    pub file: FileInfo,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MultiFileUnsupported`] if the metainfo describes more
    /// than one file.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Result<Self> {
        if metainfo.info.files.is_some() {
            return Err(Error::MultiFileUnsupported);
        }

        let piece_count = metainfo.piece_count();
        let download_len = metainfo
            .info
            .length
            .ok_or(Error::MultiFileUnsupported)?;
        let piece_len = metainfo.info.piece_length as u32;
        let last_piece_len =
            download_len - piece_len as u64 * (piece_count.saturating_sub(1)) as u64;
        let last_piece_len = last_piece_len as u32;

        let file = FileInfo {
            path: download_dir.join(&metainfo.info.name),
            len: download_len,
        };

        Ok(Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            file,
        })
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if self.piece_count == 0 {
            return Err(Error::InvalidPieceIndex);
        }
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::InvalidPieceIndex)
        }
    }

    /// Returns the byte offset of the piece at `index` within the output
    /// file.
    pub fn piece_byte_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::Info;

    fn metainfo(piece_count: usize, piece_len: u32, download_len: u64) -> Metainfo {
        Metainfo {
            info: Info {
                name: "out.bin".to_string(),
                pieces: vec![0u8; piece_count * 20],
                piece_length: piece_len as u64,
                length: Some(download_len),
                files: None,
                private: None,
            },
            announce: None,
        }
    }

    #[test]
    fn computes_last_piece_len() {
        // 3 full pieces of 4 bytes, 1 short piece of 2 bytes
        let mi = metainfo(4, 4, 3 * 4 + 2);
        let info = StorageInfo::new(&mi, PathBuf::from("/tmp")).unwrap();
        assert_eq!(info.piece_len(0).unwrap(), 4);
        assert_eq!(info.piece_len(2).unwrap(), 4);
        assert_eq!(info.piece_len(3).unwrap(), 2);
        assert!(info.piece_len(4).is_err());
    }

    #[test]
    fn exact_multiple_has_no_short_last_piece() {
        let mi = metainfo(4, 4, 16);
        let info = StorageInfo::new(&mi, PathBuf::from("/tmp")).unwrap();
        assert_eq!(info.last_piece_len, 4);
    }

    #[test]
    fn rejects_multi_file_metainfo() {
        let mut mi = metainfo(1, 4, 4);
        mi.info.files = Some(vec![]);
        mi.info.length = None;
        assert!(matches!(
            StorageInfo::new(&mi, PathBuf::from("/tmp")),
            Err(Error::MultiFileUnsupported)
        ));
    }

    #[test]
    fn piece_byte_offset_is_index_times_piece_len() {
        let mi = metainfo(4, 4, 16);
        let info = StorageInfo::new(&mi, PathBuf::from("/tmp")).unwrap();
        assert_eq!(info.piece_byte_offset(0), 0);
        assert_eq!(info.piece_byte_offset(2), 8);
    }
}
