//! The per-peer session task.
//!
//! A session owns one TCP connection and drives the Sans-I/O wire machine
//! over it: it forwards received bytes into the machine, reacts to the
//! parsed messages, keeps the outstanding-request window full, and writes
//! whatever the machine wants to send. On any exit path the session's
//! reservations revert to the registry and its inbox leaves the hub.
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use torrust_downloader_configuration::Configuration;
use torrust_downloader_primitives::bitfield::Bitfield;
use torrust_downloader_primitives::info_hash::InfoHash;
use torrust_downloader_primitives::peer;
use tracing::debug;

use super::PeerCommand;
use crate::core::pieces::registry::{Delivered, DeliverError};
use crate::core::pieces::{Block, SessionId};
use crate::core::storage::StorageError;
use crate::core::{Download, MetadataCollector};
use crate::peer_wire::extended::metadata::{MetadataFetch, MetadataMessage};
use crate::peer_wire::extended::{ExtendedError, ExtendedHandshake, EXTENDED_HANDSHAKE_ID, OUR_METADATA_ID};
use crate::peer_wire::machine::{Event, Machine};
use crate::peer_wire::message::Message;
use crate::peer_wire::WireError;

pub const SESSION_LOG_TARGET: &str = "PEER SESSION";

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("connect timed out")]
    ConnectTimeout,

    #[error("transport failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Wire(#[from] WireError),

    #[error("no bytes from the peer for the idle deadline")]
    IdleTimeout,

    #[error("the peer closed the connection")]
    Disconnected,

    #[error("the peer delivered a corrupt piece")]
    CorruptPiece,

    #[error("the peer sent a block that fits no request: {0}")]
    BadBlock(#[from] DeliverError),

    #[error("the peer does not support the extension protocol")]
    NoExtensionSupport,

    #[error("the peer does not offer ut_metadata")]
    NoMetadataSupport,

    #[error("malformed extension payload: {0}")]
    Extended(#[from] ExtendedError),

    #[error("metadata exchange failed: {0}")]
    Metadata(#[from] crate::peer_wire::extended::metadata::MetadataError),

    #[error("the peer refused to serve metadata")]
    MetadataRejected,

    /// Filesystem failures are fatal for the whole download, not just this
    /// session; the supervisor aborts on them.
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// Reverts the session's footprint in the registry and the hub whatever way
/// the session ends, including cancellation.
struct ReleaseGuard {
    download: Arc<Download>,
    id: SessionId,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.download.registry.release(self.id);
        self.download.peers.unregister(self.id);
    }
}

#[derive(Debug)]
struct SessionState {
    am_choked: bool,
    choked_at: Option<Instant>,
    outstanding: Vec<Block>,
    last_sent: Instant,
    last_received: Instant,
}

/// One downloading connection to one peer.
pub struct Session {
    id: SessionId,
    endpoint: SocketAddr,
    download: Arc<Download>,
    shutdown: watch::Receiver<bool>,
}

impl Session {
    #[must_use]
    pub fn new(id: SessionId, endpoint: SocketAddr, download: Arc<Download>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            id,
            endpoint,
            download,
            shutdown,
        }
    }

    /// Runs the session to completion: connect, handshake, request loop.
    /// Returns `Ok` on orderly exits (shutdown, download complete) and the
    /// fatal reason otherwise.
    ///
    /// # Errors
    ///
    /// Any [`SessionError`]; the supervisor drops the session and replaces
    /// it from the queue.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let mut stream = time::timeout(self.download.config.peer_connect_timeout, TcpStream::connect(self.endpoint))
            .await
            .map_err(|_| SessionError::ConnectTimeout)??;

        debug!(target: SESSION_LOG_TARGET, "{}: connected to {}", self.id, self.endpoint);

        let mut machine = Machine::new(
            self.download.metainfo.info_hash(),
            self.download.peer_id,
            Some(self.download.metainfo.piece_count()),
        );

        self.download.registry.register_peer(self.id);
        let commands = self.download.peers.register(self.id);
        let _guard = ReleaseGuard {
            download: self.download.clone(),
            id: self.id,
        };

        self.drive(&mut stream, &mut machine, commands).await
    }

    async fn drive(
        &mut self,
        stream: &mut TcpStream,
        machine: &mut Machine,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    ) -> Result<(), SessionError> {
        let config = self.download.config.clone();
        let mut completion = self.download.subscribe_completion();
        let mut read_buf = vec![0u8; READ_BUFFER_SIZE];

        let mut state = SessionState {
            am_choked: true,
            choked_at: None,
            outstanding: Vec::new(),
            last_sent: Instant::now(),
            last_received: Instant::now(),
        };

        loop {
            if machine.has_outbound() {
                let bytes = machine.take_outbound();
                stream.write_all(&bytes).await?;
                state.last_sent = Instant::now();
            }

            let keepalive_at = state.last_sent + config.keepalive_interval;
            let idle_at = state.last_received + config.peer_idle_timeout;
            let grace_at = state.choked_at.map(|choked_at| choked_at + config.choke_grace);

            tokio::select! {
                read = stream.read(&mut read_buf) => {
                    let received = read?;
                    if received == 0 {
                        return Err(if machine.has_partial_input() {
                            SessionError::Wire(WireError::TruncatedStream)
                        } else {
                            SessionError::Disconnected
                        });
                    }

                    state.last_received = Instant::now();
                    machine.feed(&read_buf[..received]);
                    while let Some(event) = machine.poll_event()? {
                        if self.on_event(event, machine, &mut state).await? {
                            return Ok(());
                        }
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(PeerCommand::Cancel(block)) => self.on_cancel_hint(block, machine, &mut state)?,
                        // The hub dropped our inbox: the download is being
                        // torn down.
                        None => return Ok(()),
                    }
                }
                () = time::sleep_until(keepalive_at) => {
                    machine.send(&Message::KeepAlive)?;
                }
                () = time::sleep_until(idle_at) => {
                    return Err(SessionError::IdleTimeout);
                }
                () = time::sleep_until(grace_at.unwrap_or_else(Instant::now)), if grace_at.is_some() => {
                    // Still choked when the grace ran out: hand the window
                    // back so other sessions can finish those pieces.
                    debug!(target: SESSION_LOG_TARGET, "{}: choked past grace, releasing {} blocks", self.id, state.outstanding.len());
                    self.download.registry.release_reservations(self.id);
                    state.outstanding.clear();
                    state.choked_at = None;
                }
                result = completion.changed() => {
                    if result.is_err() || *completion.borrow() {
                        return Ok(());
                    }
                }
                _ = self.shutdown.changed() => {
                    return Ok(());
                }
            }
        }
    }

    /// Handles one parsed event. Returns `true` when the download finished
    /// and the session should exit.
    async fn on_event(&self, event: Event, machine: &mut Machine, state: &mut SessionState) -> Result<bool, SessionError> {
        match event {
            Event::HandshakeComplete(handshake) => {
                debug!(target: SESSION_LOG_TARGET, "{}: handshake from {}", self.id, handshake.peer_id);

                let completed = self.download.registry.completed_pieces();
                if completed.any() {
                    machine.send(&Message::Bitfield {
                        bytes: completed.as_bytes().to_vec(),
                    })?;
                }
                machine.send(&Message::Interested)?;
            }
            Event::Message(message) => return self.on_message(message, machine, state).await,
        }

        Ok(false)
    }

    async fn on_message(&self, message: Message, machine: &mut Machine, state: &mut SessionState) -> Result<bool, SessionError> {
        match message {
            Message::Bitfield { bytes } => {
                // The machine already validated the length.
                if let Some(bitfield) = Bitfield::from_bytes(&bytes, self.download.metainfo.piece_count()) {
                    self.download.registry.available_bitfield(self.id, &bitfield);
                }
                self.top_up(machine, state)?;
            }
            Message::Have { piece_index } => {
                self.download.registry.available(self.id, piece_index as usize);
                self.top_up(machine, state)?;
            }
            Message::Choke => {
                state.am_choked = true;
                state.choked_at = Some(Instant::now());
            }
            Message::Unchoke => {
                state.am_choked = false;
                state.choked_at = None;
                self.top_up(machine, state)?;
            }
            Message::Piece {
                piece_index,
                begin,
                block,
            } => {
                return self.on_block(piece_index as usize, begin, &block, machine, state).await;
            }
            // This client never unchokes anyone, so requests are not
            // served; everything else is informational.
            Message::KeepAlive
            | Message::Interested
            | Message::NotInterested
            | Message::Request { .. }
            | Message::Cancel { .. }
            | Message::Extended { .. } => (),
        }

        Ok(false)
    }

    async fn on_block(
        &self,
        piece_index: usize,
        begin: u32,
        payload: &[u8],
        machine: &mut Machine,
        state: &mut SessionState,
    ) -> Result<bool, SessionError> {
        state
            .outstanding
            .retain(|block| !(block.piece_index == piece_index && block.begin == begin));

        match self.download.registry.deliver(self.id, piece_index, begin, payload)? {
            Delivered::Accepted { cancel } => {
                self.download.peers.send_cancels(cancel);
            }
            Delivered::Duplicate => (),
            Delivered::Verified { bytes, cancel } => {
                self.download.peers.send_cancels(cancel);
                if self.download.persist_piece(piece_index, &bytes).await? {
                    return Ok(true);
                }
            }
            Delivered::HashMismatch => {
                return Err(SessionError::CorruptPiece);
            }
        }

        self.top_up(machine, state)?;
        Ok(false)
    }

    /// A block this session requested was satisfied by someone else; tell
    /// the peer to stop sending it.
    fn on_cancel_hint(&self, block: Block, machine: &mut Machine, state: &mut SessionState) -> Result<(), SessionError> {
        let before = state.outstanding.len();
        state.outstanding.retain(|outstanding| *outstanding != block);

        if state.outstanding.len() != before {
            machine.send(&Message::Cancel {
                piece_index: block.piece_index as u32,
                begin: block.begin,
                length: block.length,
            })?;
        }
        Ok(())
    }

    /// Keeps the outstanding-request window at the configured depth.
    fn top_up(&self, machine: &mut Machine, state: &mut SessionState) -> Result<(), SessionError> {
        if state.am_choked {
            return Ok(());
        }

        while state.outstanding.len() < self.download.config.pipeline_depth {
            let Some(block) = self.download.registry.reserve(self.id) else {
                break;
            };
            machine.send(&Message::Request {
                piece_index: block.piece_index as u32,
                begin: block.begin,
                length: block.length,
            })?;
            state.outstanding.push(block);
        }
        Ok(())
    }
}

/// One metadata-fetching connection used to bootstrap a magnet download
/// (BEP 9). It runs the same wire machine but only speaks the extension
/// protocol, and exits as soon as any session collected the metadata.
pub struct MetadataSession {
    pub id: SessionId,
    pub endpoint: SocketAddr,
    pub info_hash: InfoHash,
    pub peer_id: peer::Id,
    pub config: Arc<Configuration>,
    pub collector: Arc<MetadataCollector>,
    pub shutdown: watch::Receiver<bool>,
}

impl MetadataSession {
    /// Runs the metadata exchange against one peer.
    ///
    /// # Errors
    ///
    /// Any [`SessionError`]; the peer is abandoned for metadata purposes
    /// and the supervisor tries the next one.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let mut stream = time::timeout(self.config.peer_connect_timeout, TcpStream::connect(self.endpoint))
            .await
            .map_err(|_| SessionError::ConnectTimeout)??;

        debug!(target: SESSION_LOG_TARGET, "{}: fetching metadata from {}", self.id, self.endpoint);

        let mut machine = Machine::new(self.info_hash, self.peer_id, None);
        let mut collected = self.collector.subscribe();
        let mut read_buf = vec![0u8; READ_BUFFER_SIZE];

        let mut peer_metadata_id: Option<u8> = None;
        let mut fetch: Option<MetadataFetch> = None;
        let mut last_received = Instant::now();

        loop {
            if machine.has_outbound() {
                let bytes = machine.take_outbound();
                stream.write_all(&bytes).await?;
            }

            let idle_at = last_received + self.config.peer_idle_timeout;

            tokio::select! {
                read = stream.read(&mut read_buf) => {
                    let received = read?;
                    if received == 0 {
                        return Err(SessionError::Disconnected);
                    }

                    last_received = Instant::now();
                    machine.feed(&read_buf[..received]);
                    while let Some(event) = machine.poll_event()? {
                        if self.on_event(event, &mut machine, &mut peer_metadata_id, &mut fetch)? {
                            return Ok(());
                        }
                    }
                }
                () = time::sleep_until(idle_at) => {
                    return Err(SessionError::IdleTimeout);
                }
                result = collected.changed() => {
                    if result.is_err() || collected.borrow().is_some() {
                        return Ok(());
                    }
                }
                _ = self.shutdown.changed() => {
                    return Ok(());
                }
            }
        }
    }

    /// Handles one event of the metadata exchange. Returns `true` once the
    /// metadata is collected.
    fn on_event(
        &self,
        event: Event,
        machine: &mut Machine,
        peer_metadata_id: &mut Option<u8>,
        fetch: &mut Option<MetadataFetch>,
    ) -> Result<bool, SessionError> {
        match event {
            Event::HandshakeComplete(handshake) => {
                if !handshake.supports_extensions {
                    return Err(SessionError::NoExtensionSupport);
                }
                machine.send(&Message::Extended {
                    extended_id: EXTENDED_HANDSHAKE_ID,
                    payload: ExtendedHandshake::ours(),
                })?;
            }
            Event::Message(Message::Extended { extended_id, payload }) if extended_id == EXTENDED_HANDSHAKE_ID => {
                let handshake = ExtendedHandshake::parse(&payload)?;

                let metadata_id = handshake.ut_metadata_id.ok_or(SessionError::NoMetadataSupport)?;
                let metadata_size = handshake.metadata_size.ok_or(SessionError::NoMetadataSupport)?;

                let started = MetadataFetch::new(self.info_hash, metadata_size)?;
                let first = started.next_missing().expect("a fresh fetch has missing pieces");
                self.request_piece(machine, metadata_id, first)?;

                *peer_metadata_id = Some(metadata_id);
                *fetch = Some(started);
            }
            Event::Message(Message::Extended { extended_id, payload }) if extended_id == OUR_METADATA_ID => {
                return self.on_metadata_message(&payload, machine, *peer_metadata_id, fetch);
            }
            // Availability traffic is meaningless before we know the
            // torrent shape; drop everything else on the floor.
            Event::Message(_) => (),
        }

        Ok(false)
    }

    fn on_metadata_message(
        &self,
        payload: &[u8],
        machine: &mut Machine,
        peer_metadata_id: Option<u8>,
        fetch: &mut Option<MetadataFetch>,
    ) -> Result<bool, SessionError> {
        let (Some(metadata_id), Some(in_progress)) = (peer_metadata_id, fetch.as_mut()) else {
            // Data before our request: not negotiated, drop the peer.
            return Err(SessionError::NoMetadataSupport);
        };

        match MetadataMessage::parse(payload)? {
            MetadataMessage::Data { piece, payload, .. } => {
                in_progress.store(piece, payload)?;

                if let Some(next) = in_progress.next_missing() {
                    self.request_piece(machine, metadata_id, next)?;
                    return Ok(false);
                }

                let info_bytes = fetch.take().expect("fetch is in progress").assemble()?;
                debug!(target: SESSION_LOG_TARGET, "{}: metadata complete ({} bytes)", self.id, info_bytes.len());
                self.collector.complete(info_bytes);
                Ok(true)
            }
            MetadataMessage::Reject { .. } => Err(SessionError::MetadataRejected),
            // Peers do not request metadata from a client that never
            // advertises having any; ignore it.
            MetadataMessage::Request { .. } => Ok(false),
        }
    }

    fn request_piece(&self, machine: &mut Machine, metadata_id: u8, piece: u64) -> Result<(), SessionError> {
        machine.send(&Message::Extended {
            extended_id: metadata_id,
            payload: MetadataMessage::request(piece),
        })?;
        Ok(())
    }
}

// The session logic needs a live socket on both ends; it is exercised end
// to end against an in-process fake peer in `tests/download_pipeline.rs`.
