//! The piece manager: the scheduler (`SPEC_FULL.md` §4.4).
//!
//! This merges three of the reference engine's separate components —
//! `piece_picker::PiecePicker` (shared, rarity-only), the per-session
//! `download::PieceDownload` (block-level in-flight tracking), and the
//! `disk` actor (hash verification and the positioned write, reached over
//! an mpsc channel in the reference engine) — into the single component
//! `SPEC_FULL.md` §4.4 specifies: one owner of block state, pending-request
//! expiry, and the hash-verify-then-write commit pipeline. See `DESIGN.md`
//! for why keeping the reference engine's three-way split would make the
//! idempotent-commit and expired-retry properties in §8 untestable as
//! single-component invariants.
//!
//! The rarity computation is grounded on the reference engine's
//! `piece_picker.rs` (referenced throughout `peer.rs` but not itself
//! retrieved in the pack) and on `original_source/peers_manager.py`'s
//! rarest-piece selection at the Python layer. The hash-then-write
//! mechanics (`Sha1::new()/.input()/.result()`, `spawn_blocking`,
//! positioned write via `nix::sys::uio::pwrite`) are grounded on the
//! reference engine's `src/disk/io.rs`.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fs::{File, OpenOptions},
    os::unix::io::AsRawFd,
    sync::Arc,
};

use nix::sys::uio::pwrite;
use sha1::{Digest, Sha1};
use tokio::{sync::Mutex, task};

use crate::{
    block::{PendingRequest, Piece},
    conf::MAX_PENDING_MS,
    error::{Error, Result},
    storage_info::StorageInfo,
    Bitfield, BlockInfo, PeerId, PieceIndex,
};

struct PeerEntry {
    bitfield: Bitfield,
}

/// Builds a bitfield of `len` bits, all set to `value`. Used wherever this
/// module needs to construct a bitfield outside of `PeerCodec::decode`,
/// which only ever hands back the raw wire bytes.
fn filled_bitfield(len: usize, value: bool) -> Bitfield {
    let mut bitfield = Bitfield::new();
    bitfield.resize(len, value);
    bitfield
}

/// Reads a single bit out of a bitfield, treating an out-of-range index as
/// unset rather than panicking.
fn bit_at(bitfield: &Bitfield, index: usize) -> bool {
    bitfield.get(index).as_deref().copied().unwrap_or(false)
}

/// The scheduler: peer bitfield tracking, the request-selection algorithm,
/// and the commit pipeline. Shared across every peer session and the pool
/// behind an `Arc<Mutex<Scheduler>>` (`SPEC_FULL.md` §5: this crate takes
/// the "goes multi-threaded" branch, so the single mutex is load-bearing).
pub(crate) struct Scheduler {
    storage: StorageInfo,
    file: Arc<File>,
    piece_hashes: Vec<[u8; 20]>,
    missing_pieces: VecDeque<PieceIndex>,
    ongoing_pieces: Vec<Piece>,
    have_pieces: HashSet<PieceIndex>,
    peers: HashMap<PeerId, PeerEntry>,
    pending_requests: Vec<PendingRequest>,
    downloaded_bytes: u64,
}

impl Scheduler {
    /// Opens (creating if missing) the single output file and builds the
    /// initial all-missing scheduler state from the metainfo-derived
    /// storage geometry and piece hashes.
    pub fn new(storage: StorageInfo, piece_hashes: Vec<[u8; 20]>) -> Result<Self> {
        if let Some(parent) = storage.file.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&storage.file.path)?;

        let missing_pieces = (0..storage.piece_count).collect();

        Ok(Self {
            storage,
            file: Arc::new(file),
            piece_hashes,
            missing_pieces,
            ongoing_pieces: Vec::new(),
            have_pieces: HashSet::new(),
            peers: HashMap::new(),
            pending_requests: Vec::new(),
            downloaded_bytes: 0,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.storage.piece_count
    }

    /// Registers a peer's claimed pieces. Idempotent: re-adding a known
    /// peer id simply replaces its bitfield.
    pub fn add_peer(&mut self, peer_id: PeerId, mut bitfield: Bitfield) {
        bitfield.resize(self.storage.piece_count, false);
        self.peers.insert(peer_id, PeerEntry { bitfield });
    }

    /// Sets a single bit in a peer's bitfield in response to a `Have`
    /// message. If the peer is not yet known (no prior `BitField`), it is
    /// registered with an all-zero bitfield first, per `SPEC_FULL.md` §4.2's
    /// BEP 3 allowance for a peer that omits the bitfield entirely.
    pub fn update_peer(&mut self, peer_id: PeerId, piece_index: PieceIndex) {
        let piece_count = self.storage.piece_count;
        let entry = self.peers.entry(peer_id).or_insert_with(|| PeerEntry {
            bitfield: filled_bitfield(piece_count, false),
        });
        if piece_index < entry.bitfield.len() {
            entry.bitfield.set(piece_index, true);
        }
    }

    /// Forgets a peer. Any requests it alone could have served are left in
    /// `pending_requests`; they age out via the expired-retry branch.
    pub fn remove_peer(&mut self, peer_id: &PeerId) {
        self.peers.remove(peer_id);
    }

    pub fn is_complete(&self) -> bool {
        self.have_pieces.len() == self.storage.piece_count
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.downloaded_bytes
    }

    /// The request-selection algorithm (`SPEC_FULL.md` §4.4): expired retry,
    /// then continuing an ongoing piece, then starting the rarest missing
    /// piece the peer can offer. Returns `None` if none of the three
    /// branches yields a block.
    pub fn next_request(&mut self, peer_id: &PeerId) -> Option<BlockInfo> {
        let bitfield = &self.peers.get(peer_id)?.bitfield;

        // 1. expired retry
        for pending in self.pending_requests.iter_mut() {
            let covers = bit_at(bitfield, pending.block.piece_index);
            if covers && pending.is_expired(MAX_PENDING_MS) {
                pending.refresh();
                return Some(pending.block);
            }
        }

        // 2. continue an ongoing piece the peer can serve
        for piece in self.ongoing_pieces.iter_mut() {
            let has_piece = bit_at(bitfield, piece.index);
            if !has_piece {
                continue;
            }
            if let Some(block) = piece.next_missing_block() {
                self.pending_requests.push(PendingRequest::new(block));
                return Some(block);
            }
        }

        // 3. start the rarest missing piece the peer can serve
        let bitfield = &self.peers.get(peer_id)?.bitfield;
        let mut best: Option<(PieceIndex, usize)> = None;
        for &index in self.missing_pieces.iter() {
            let has_piece = bit_at(bitfield, index);
            if !has_piece {
                continue;
            }
            let rarity = self.rarity(index);
            best = match best {
                Some((best_index, best_rarity))
                    if best_rarity < rarity
                        || (best_rarity == rarity && best_index < index) =>
                {
                    Some((best_index, best_rarity))
                }
                _ => Some((index, rarity)),
            };
        }

        let (index, _) = best?;
        let pos = self
            .missing_pieces
            .iter()
            .position(|&i| i == index)
            .expect("rarest index must be in missing_pieces");
        self.missing_pieces.remove(pos);

        let piece_len = self.storage.piece_len(index).ok()?;
        let mut piece = Piece::new(index, piece_len, self.piece_hashes[index]);
        let block = piece.next_missing_block();
        self.ongoing_pieces.push(piece);
        if let Some(block) = block {
            self.pending_requests.push(PendingRequest::new(block));
        }
        block
    }

    /// The number of peers (among those currently registered) that claim to
    /// have `index`.
    fn rarity(&self, index: PieceIndex) -> usize {
        self.peers
            .values()
            .filter(|entry| bit_at(&entry.bitfield, index))
            .count()
    }

    /// Phase one of the commit path: pure bookkeeping, no IO. Records the
    /// block as retrieved and, if that completes a piece, removes the piece
    /// from `ongoing_pieces` and hands it back to the caller so the
    /// expensive hash+write step (phase two, [`commit_block`]) can run
    /// without holding the scheduler's lock across an `.await`.
    fn receive_block(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Option<Piece> {
        self.pending_requests
            .retain(|p| !(p.block.piece_index == piece_index && p.block.offset == offset));

        let piece_pos = self.ongoing_pieces.iter().position(|p| p.index == piece_index)?;
        let piece = &mut self.ongoing_pieces[piece_pos];
        piece.receive_block(offset, data);
        if piece.is_complete() {
            Some(self.ongoing_pieces.remove(piece_pos))
        } else {
            None
        }
    }

    /// Phase two: the piece failed its hash check. It is reset to all
    /// blocks `Missing` and put back among `ongoing_pieces` (it is never
    /// returned to `missing_pieces` — it already has at least one
    /// requested block's worth of history).
    fn reject_piece(&mut self, mut piece: Piece) {
        piece.reset();
        self.ongoing_pieces.push(piece);
    }

    /// Phase two: the piece passed its hash check and has been written to
    /// disk. Promote it to `have_pieces` and account for its bytes.
    fn accept_piece(&mut self, piece: &Piece) {
        self.have_pieces.insert(piece.index);
        self.downloaded_bytes += piece.len as u64;
    }

    fn piece_byte_offset(&self, index: PieceIndex) -> u64 {
        self.storage.piece_byte_offset(index)
    }

    fn file(&self) -> Arc<File> {
        Arc::clone(&self.file)
    }
}

/// The commit path (`SPEC_FULL.md` §4.4), split across the scheduler's lock
/// per §5/§9: bookkeeping and the have/ongoing/missing transition are only
/// ever mutated while holding the lock, but the SHA-1 hash and the
/// positioned write run on a blocking-pool thread with the lock released,
/// so one piece's hashing and disk IO never blocks another peer's progress
/// through [`Scheduler::next_request`].
///
/// `_peer_id` is accepted to match the public surface in `SPEC_FULL.md`
/// §4.4, though the commit path itself is peer-agnostic: any peer that
/// redelivers a known block is treated identically (idempotent).
pub(crate) async fn commit_block(
    scheduler: &Arc<Mutex<Scheduler>>,
    _peer_id: PeerId,
    piece_index: PieceIndex,
    offset: u32,
    data: Vec<u8>,
) -> Result<()> {
    let (piece, file, byte_offset) = {
        let mut guard = scheduler.lock().await;
        match guard.receive_block(piece_index, offset, data) {
            Some(piece) => {
                let byte_offset = guard.piece_byte_offset(piece.index);
                (piece, guard.file(), byte_offset)
            }
            None => return Ok(()),
        }
    };

    let (piece, is_valid, write_result) = task::spawn_blocking(move || {
        let is_valid = hash_matches(&piece);
        let write_result = if is_valid {
            Some(write_piece(&file, byte_offset, &piece.assemble()))
        } else {
            None
        };
        (piece, is_valid, write_result)
    })
    .await
    .expect("piece hash/write task panicked");

    let mut guard = scheduler.lock().await;
    if is_valid {
        match write_result {
            Some(Ok(())) => {
                log::info!("Piece {} verified and written", piece.index);
                guard.accept_piece(&piece);
            }
            Some(Err(e)) => {
                log::error!("Failed to write piece {}: {}", piece.index, e);
                return Err(Error::OutputWriteFailed(e));
            }
            None => unreachable!("write_result is Some whenever is_valid"),
        }
    } else {
        log::warn!(
            "Piece {} failed hash verification, resetting to missing",
            piece.index
        );
        guard.reject_piece(piece);
    }

    Ok(())
}

fn hash_matches(piece: &Piece) -> bool {
    let mut hasher = Sha1::new();
    hasher.input(&piece.assemble());
    let digest = hasher.result();
    digest.as_slice() == piece.expected_hash
}

fn write_piece(file: &File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let mut written = 0usize;
    while written < data.len() {
        let n = pwrite(file.as_raw_fd(), &data[written..], offset as i64 + written as i64)
            .map_err(|_| std::io::Error::last_os_error())?;
        if n == 0 {
            break;
        }
        written += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{Info, Metainfo};
    use sha1::{Digest as _, Sha1 as Sha1Hasher};
    use std::path::PathBuf;

    fn sha1(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1Hasher::new();
        hasher.input(data);
        let digest = hasher.result();
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        hash
    }

    fn test_file_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "bitleech_test_{}_{}_{}",
            name,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .subsec_nanos()
        ))
    }

    fn build_scheduler(piece_len: u32, total_len: u64, pieces: Vec<[u8; 20]>, name: &str) -> Scheduler {
        let metainfo = Metainfo {
            info: Info {
                name: "out.bin".to_string(),
                pieces: pieces.iter().flatten().copied().collect(),
                piece_length: piece_len as u64,
                length: Some(total_len),
                files: None,
                private: None,
            },
            announce: None,
        };
        let download_dir = test_file_path(name);
        let storage = StorageInfo::new(&metainfo, download_dir).unwrap();
        Scheduler::new(storage, pieces).unwrap()
    }

    fn peer(byte: u8) -> PeerId {
        let mut id = [0u8; 20];
        id[0] = byte;
        id
    }

    #[tokio::test]
    async fn tiny_torrent_end_to_end() {
        let pieces = vec![sha1(b"AAAA"), sha1(b"BBBB"), sha1(b"CC")];
        let scheduler = Arc::new(Mutex::new(build_scheduler(4, 10, pieces, "tiny")));
        let path = scheduler.lock().await.storage.file.path.clone();

        let full = filled_bitfield(3, true);
        scheduler.lock().await.add_peer(peer(1), full.clone());
        scheduler.lock().await.add_peer(peer(2), full);

        let p1 = peer(1);
        loop {
            let block = { scheduler.lock().await.next_request(&p1) };
            let block = match block {
                Some(b) => b,
                None => break,
            };
            let data = match (block.piece_index, block.offset) {
                (0, 0) => b"AAAA".to_vec(),
                (1, 0) => b"BBBB".to_vec(),
                (2, 0) => b"CC".to_vec(),
                _ => panic!("unexpected block {:?}", block),
            };
            commit_block(&scheduler, p1, block.piece_index, block.offset, data)
                .await
                .unwrap();
        }

        let guard = scheduler.lock().await;
        assert!(guard.is_complete());
        drop(guard);

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"AAAABBBBCC");
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn corrupt_block_then_recover() {
        let pieces = vec![sha1(b"AAAA")];
        let scheduler = Arc::new(Mutex::new(build_scheduler(4, 4, pieces, "corrupt")));
        let path = scheduler.lock().await.storage.file.path.clone();
        let p1 = peer(1);
        scheduler
            .lock()
            .await
            .add_peer(p1, filled_bitfield(1, true));

        let block = scheduler.lock().await.next_request(&p1).unwrap();
        commit_block(&scheduler, p1, block.piece_index, block.offset, b"AXAA".to_vec())
            .await
            .unwrap();

        {
            let guard = scheduler.lock().await;
            assert!(!guard.is_complete());
            assert_eq!(guard.ongoing_pieces.len(), 1);
        }
        assert_eq!(std::fs::read(&path).unwrap_or_default().len(), 0);

        let block = scheduler.lock().await.next_request(&p1).unwrap();
        assert_eq!(block.offset, 0);
        commit_block(&scheduler, p1, block.piece_index, block.offset, b"AAAA".to_vec())
            .await
            .unwrap();

        let guard = scheduler.lock().await;
        assert!(guard.is_complete());
        drop(guard);
        assert_eq!(std::fs::read(&path).unwrap(), b"AAAA");
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn duplicate_delivery_is_idempotent() {
        let pieces = vec![sha1(b"AAAA")];
        let scheduler = Arc::new(Mutex::new(build_scheduler(4, 4, pieces, "dup")));
        let path = scheduler.lock().await.storage.file.path.clone();
        let p1 = peer(1);
        scheduler
            .lock()
            .await
            .add_peer(p1, filled_bitfield(1, true));

        let block = scheduler.lock().await.next_request(&p1).unwrap();
        commit_block(&scheduler, p1, block.piece_index, block.offset, b"AAAA".to_vec())
            .await
            .unwrap();
        // redeliver the same block after the piece has already completed;
        // the piece is no longer in `ongoing_pieces` so this is a no-op.
        commit_block(&scheduler, p1, block.piece_index, block.offset, b"AAAA".to_vec())
            .await
            .unwrap();

        let guard = scheduler.lock().await;
        assert!(guard.is_complete());
        assert_eq!(guard.have_pieces.len(), 1);
        drop(guard);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn expired_request_is_reissued_with_refreshed_timestamp() {
        let pieces = vec![sha1(b"AAAABBBB")];
        let scheduler = Arc::new(Mutex::new(build_scheduler(8, 8, pieces, "expire")));
        let path = scheduler.lock().await.storage.file.path.clone();
        let p1 = peer(1);
        scheduler
            .lock()
            .await
            .add_peer(p1, filled_bitfield(1, true));

        let first = scheduler.lock().await.next_request(&p1).unwrap();
        {
            let mut guard = scheduler.lock().await;
            assert_eq!(guard.pending_requests.len(), 1);
            // simulate the request having aged past MAX_PENDING_MS
            guard.pending_requests[0].added_at =
                std::time::Instant::now() - std::time::Duration::from_millis(MAX_PENDING_MS + 1);
        }

        let second = scheduler.lock().await.next_request(&p1).unwrap();
        assert_eq!(first, second);
        let guard = scheduler.lock().await;
        assert_eq!(guard.pending_requests.len(), 1);
        drop(guard);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn rarest_first_prefers_the_less_available_piece() {
        let pieces = vec![sha1(b"AAAA"), sha1(b"BBBB")];
        let scheduler = Arc::new(Mutex::new(build_scheduler(4, 8, pieces, "rarest")));
        let path = scheduler.lock().await.storage.file.path.clone();

        let mut guard = scheduler.lock().await;
        let mut both = filled_bitfield(2, false);
        both.set(0, true);
        both.set(1, true);
        let mut second_only = filled_bitfield(2, false);
        second_only.set(1, true);
        guard.add_peer(peer(1), both.clone());
        guard.add_peer(peer(2), both);
        guard.add_peer(peer(3), second_only);
        drop(guard);

        let p3 = peer(3);
        let block = scheduler.lock().await.next_request(&p3).unwrap();
        assert_eq!(block.piece_index, 1);
        std::fs::remove_file(&path).ok();
    }
}
