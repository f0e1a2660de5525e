//! The per-peer connection state machine (`SPEC_FULL.md` §4.2).
//!
//! Grounded on the reference engine's fuller `PeerSession` draft, its flat
//! `src/peer.rs` (see `DESIGN.md`'s Open Question decision 1): the dial →
//! handshake → message-loop → teardown shape, the `Command`/`Sender`
//! channel for external shutdown, and the `futures::select!` message-loop
//! idiom all come from there. What changes is what the session talks to:
//! instead of a `PiecePicker` + `PieceDownload` + `Disk` actor split, every
//! piece of cross-peer state lives behind the single
//! `piece_manager::Scheduler`, reached through one `Arc<Mutex<_>>`
//! (`SPEC_FULL.md` §5/§9).
//!
//! `my_state`/`peer_state` follow `SPEC_FULL.md` §9's design note directly:
//! small sets of the fixed symbols `{Choked, Interested, PendingRequest,
//! Stopped}` and `{Interested}`, rather than the reference engine's
//! `State` enum plus loose `bool` fields.

pub(crate) mod codec;

use std::{net::SocketAddr, sync::Arc};

use futures::{
    select,
    stream::{Fuse, SplitSink},
    SinkExt, StreamExt,
};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        Mutex,
    },
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    error::{Error, Result},
    piece_manager::{self, Scheduler},
    Bitfield, PeerId, Sha1Hash,
};

use codec::{Handshake, HandshakeCodec, Message, PeerCodec};

/// Our side of the connection's flags. Initialised per `SPEC_FULL.md` §4.2:
/// choked and interested from the moment the handshake completes, since
/// this is a leech-only core that always wants to download from any peer
/// claiming pieces it's missing.
#[derive(Clone, Copy, Debug)]
struct MyState {
    choked: bool,
    interested: bool,
    pending_request: bool,
    stopped: bool,
}

impl Default for MyState {
    fn default() -> Self {
        Self {
            choked: true,
            interested: true,
            pending_request: false,
            stopped: false,
        }
    }
}

/// The remote's flags as observed by us. Empty at first: the remote hasn't
/// told us anything about its own interest yet.
#[derive(Clone, Copy, Debug, Default)]
struct PeerState {
    interested: bool,
}

/// One outbound peer connection: owns the TCP socket, drives the wire
/// protocol, and pulls/commits blocks through the shared scheduler.
pub(crate) struct PeerSession {
    scheduler: Arc<Mutex<Scheduler>>,
    addr: SocketAddr,
    info_hash: Sha1Hash,
    my_peer_id: PeerId,
    remote_id: Option<PeerId>,
    my_state: MyState,
    peer_state: PeerState,
    /// Whether this peer has been registered with the scheduler yet
    /// (`SPEC_FULL.md` §4.2's availability-exchange window): set on the
    /// first `BitField`, or on the first non-`BitField` message (with an
    /// all-zero bitfield, per BEP 3's "peer may omit BitField" allowance).
    peer_registered: bool,
    cmd_port: Fuse<Receiver>,
}

impl PeerSession {
    /// Creates a new outbound session targeting `addr`, returning it
    /// alongside a [`PeerHandle`] the caller can use to request graceful
    /// shutdown (`SPEC_FULL.md` §4.2's `stop()` operation) without owning
    /// the session itself.
    pub fn outbound(
        scheduler: Arc<Mutex<Scheduler>>,
        info_hash: Sha1Hash,
        my_peer_id: PeerId,
        addr: SocketAddr,
    ) -> (Self, PeerHandle) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                scheduler,
                addr,
                info_hash,
                my_peer_id,
                remote_id: None,
                my_state: MyState::default(),
                peer_state: PeerState::default(),
                peer_registered: false,
                cmd_port: cmd_port.fuse(),
            },
            PeerHandle { cmd_chan },
        )
    }

    /// Dials the peer, exchanges handshakes, and runs the message loop
    /// until the connection ends (peer EOF, protocol error, or a
    /// `Command::Shutdown`). Always forgets the peer from the scheduler on
    /// the way out, unless the handshake itself never succeeded (in which
    /// case the scheduler never heard of this peer to begin with).
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Dialing peer {}", self.addr);
        let socket = TcpStream::connect(self.addr).await?;
        log::info!("Connected to peer {}", self.addr);

        let mut handshake_io = Framed::new(socket, HandshakeCodec);
        let handshake = Handshake::new(self.info_hash, self.my_peer_id);
        handshake_io.send(handshake).await?;

        let peer_handshake = match handshake_io.next().await {
            Some(h) => h?,
            None => {
                log::info!("Peer {} closed before completing handshake", self.addr);
                return Ok(());
            }
        };
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);

        if peer_handshake.info_hash != self.info_hash {
            log::warn!("Peer {} handshake info_hash mismatch", self.addr);
            return Err(Error::InfoHashMismatch);
        }
        self.remote_id = Some(peer_handshake.peer_id);

        // switch from the one-shot handshake codec to the long-lived
        // message codec, carrying over any bytes the peer already sent
        // past the handshake in the same read.
        let old_parts = handshake_io.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        let result = self.run(socket).await;

        if let Some(remote_id) = self.remote_id {
            self.scheduler.lock().await.remove_peer(&remote_id);
        }

        result
    }

    /// The message loop proper: receives wire messages and commands
    /// concurrently, dispatches each inbound message, and after each one
    /// tops up our single outstanding request if we're free to make one.
    async fn run(&mut self, socket: Framed<TcpStream, PeerCodec>) -> Result<()> {
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        // §4.2: "The peer sends Interested immediately after handshake."
        // This is a leech-only core, so we don't wait to see a bitfield
        // first: we're unconditionally interested in anything on offer.
        sink.send(Message::Interested).await?;

        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    log::trace!(
                        "Peer {} message: {:?}",
                        self.addr,
                        msg.id()
                    );
                    self.handle_msg(msg).await?;
                    if self.my_state.stopped {
                        break;
                    }
                    self.maybe_request(&mut sink).await?;
                }
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
                        Command::Shutdown => {
                            log::info!("Stopping peer {} session", self.addr);
                            self.my_state.stopped = true;
                            break;
                        }
                    }
                }
                complete => break,
            }
        }

        Ok(())
    }

    /// Dispatches a single inbound message (`SPEC_FULL.md` §4.2's
    /// per-message table). `Request`/`Cancel` are ignored: this release
    /// never serves blocks to anyone.
    ///
    /// Before the message itself is handled, this enforces the
    /// availability-exchange window: the first message of any kind
    /// registers the peer with the scheduler (taking its real bitfield if
    /// it's a `BitField`, or an all-zero one otherwise — a peer with no
    /// pieces may skip `BitField` entirely per BEP 3). A `BitField`
    /// arriving after that window has already closed is a protocol error.
    async fn handle_msg(&mut self, msg: Message) -> Result<()> {
        let remote_id = self
            .remote_id
            .expect("remote_id is set before the message loop starts");

        if let Message::Bitfield(_) = &msg {
            if self.peer_registered {
                return Err(Error::UnexpectedBitfield);
            }
        } else if !self.peer_registered {
            let piece_count = self.scheduler.lock().await.piece_count();
            let mut empty = Bitfield::new();
            empty.resize(piece_count, false);
            self.scheduler.lock().await.add_peer(remote_id, empty);
            self.peer_registered = true;
        }

        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                self.my_state.choked = true;
            }
            Message::Unchoke => {
                self.my_state.choked = false;
            }
            Message::Interested => {
                self.peer_state.interested = true;
            }
            Message::NotInterested => {
                self.peer_state.interested = false;
            }
            Message::Have(index) => {
                self.scheduler.lock().await.update_peer(remote_id, index);
            }
            Message::Bitfield(bitfield) => {
                let mut guard = self.scheduler.lock().await;
                let piece_count = guard.piece_count();
                let expected_bytes = (piece_count + 7) / 8;
                if bitfield.len() / 8 != expected_bytes {
                    return Err(Error::MalformedFrame(format!(
                        "bitfield carries {} bytes, expected {} for {} pieces",
                        bitfield.len() / 8,
                        expected_bytes,
                        piece_count
                    )));
                }
                guard.add_peer(remote_id, bitfield);
                self.peer_registered = true;
            }
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                self.my_state.pending_request = false;
                piece_manager::commit_block(
                    &self.scheduler,
                    remote_id,
                    piece_index,
                    offset,
                    data,
                )
                .await?;
            }
            Message::Request(_) | Message::Cancel(_) => {
                log::trace!(
                    "Peer {} sent Request/Cancel, ignored (leech-only)",
                    self.addr
                );
            }
            Message::Port(_) => {}
            Message::Unknown(id) => {
                log::debug!("Peer {} sent unknown message id {}, ignoring", self.addr, id);
            }
        }

        Ok(())
    }

    /// After each processed message, pulls the next block from the
    /// scheduler and issues a `Request` if we're unchoked, interested, and
    /// not already waiting on one (`SPEC_FULL.md` §4.2: exactly one
    /// outstanding request per connection).
    async fn maybe_request(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        if self.my_state.choked || !self.my_state.interested || self.my_state.pending_request {
            return Ok(());
        }
        let remote_id = match self.remote_id {
            Some(id) => id,
            None => return Ok(()),
        };

        let block = {
            let mut guard = self.scheduler.lock().await;
            guard.next_request(&remote_id)
        };

        if let Some(block) = block {
            self.my_state.pending_request = true;
            sink.send(Message::Request(block)).await?;
        }

        Ok(())
    }
}

/// The channel on which the pool can tell a peer session to shut down.
type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// Commands a peer session can receive from its owner.
pub(crate) enum Command {
    Shutdown,
}

/// An owned handle to a live (or not-yet-started) [`PeerSession`]'s command
/// channel. The one way an owner outside the session's own `start` task can
/// ask it to stop (`SPEC_FULL.md` §4.2); dropping a handle without calling
/// [`PeerHandle::stop`] leaves the session to run to natural completion.
#[derive(Clone)]
pub(crate) struct PeerHandle {
    cmd_chan: Sender,
}

impl PeerHandle {
    /// Requests a graceful shutdown: the session's message loop breaks out
    /// on its next iteration and `start()` returns. A [`Error::ChannelClosed`]
    /// means the session has already ended on its own, which is not an error
    /// worth the caller's attention beyond logging.
    pub fn stop(&self) -> Result<()> {
        self.cmd_chan.send(Command::Shutdown)?;
        Ok(())
    }
}
