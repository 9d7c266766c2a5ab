//! The Sans-I/O driver for one peer wire connection.
//!
//! The machine advances through four states:
//!
//! ```text
//! AwaitingHandshake -> AwaitingBitfield -> Established -> Closed
//! ```
//!
//! Bytes read from the transport go in through [`Machine::feed`]; parsed
//! events come out of [`Machine::poll_event`]; messages to send go in
//! through [`Machine::send`] and the resulting wire bytes are drained with
//! [`Machine::take_outbound`]. Parsing is incremental: partial input stays
//! buffered and only whole frames are yielded.
use bytes::{Buf, BytesMut};
use torrust_downloader_primitives::info_hash::InfoHash;
use torrust_downloader_primitives::peer;
use torrust_downloader_primitives::BLOCK_SIZE;

use super::handshake::{Handshake, HANDSHAKE_LEN};
use super::message::{self, Message};
use super::WireError;

/// Headroom for the bencoded header of a `ut_metadata` data frame, which
/// carries a metadata block on top of the block bytes themselves.
const METADATA_HEADER_MAX: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingHandshake,
    AwaitingBitfield,
    Established,
    Closed,
}

/// An event produced by the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The peer handshake was received and its info-hash matched.
    HandshakeComplete(Handshake),
    /// A whole message was parsed.
    Message(Message),
}

/// The Sans-I/O protocol driver. It owns buffers, never sockets.
#[derive(Debug)]
pub struct Machine {
    state: State,
    incoming: BytesMut,
    outgoing: BytesMut,
    info_hash: InfoHash,
    piece_count: Option<usize>,
    max_frame_len: u32,
    peer_handshake: Option<Handshake>,
}

impl Machine {
    /// Creates a driver for an outbound connection. Our handshake is queued
    /// for sending immediately.
    ///
    /// `piece_count` is `None` while downloading metadata from a magnet
    /// link, in which case the bitfield length cannot be validated yet.
    #[must_use]
    pub fn new(info_hash: InfoHash, peer_id: peer::Id, piece_count: Option<usize>) -> Self {
        let mut outgoing = BytesMut::new();
        Handshake::new(info_hash, peer_id).write_to(&mut outgoing);

        Self {
            state: State::AwaitingHandshake,
            incoming: BytesMut::new(),
            outgoing,
            info_hash,
            piece_count,
            max_frame_len: frame_cap(piece_count),
            peer_handshake: None,
        }
    }

    /// Buffers bytes received from the peer.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.state != State::Closed {
            self.incoming.extend_from_slice(bytes);
        }
    }

    /// Advances the parser. Returns `Ok(None)` when more input is needed.
    ///
    /// # Errors
    ///
    /// Any protocol violation closes the machine and is returned once.
    pub fn poll_event(&mut self) -> Result<Option<Event>, WireError> {
        match self.advance() {
            Ok(event) => Ok(event),
            Err(error) => {
                self.state = State::Closed;
                Err(error)
            }
        }
    }

    fn advance(&mut self) -> Result<Option<Event>, WireError> {
        loop {
            match self.state {
                State::Closed => return Ok(None),
                State::AwaitingHandshake => {
                    if self.incoming.len() < HANDSHAKE_LEN {
                        return Ok(None);
                    }

                    let bytes: [u8; HANDSHAKE_LEN] = self.incoming[..HANDSHAKE_LEN].try_into().expect("length checked");
                    self.incoming.advance(HANDSHAKE_LEN);

                    let handshake = Handshake::parse(&bytes)?;
                    if handshake.info_hash != self.info_hash {
                        return Err(WireError::InfoHashMismatch {
                            expected: self.info_hash,
                            got: handshake.info_hash,
                        });
                    }

                    self.peer_handshake = Some(handshake.clone());
                    self.state = State::AwaitingBitfield;
                    return Ok(Some(Event::HandshakeComplete(handshake)));
                }
                State::AwaitingBitfield | State::Established => {
                    if self.incoming.len() < 4 {
                        return Ok(None);
                    }

                    let length = u32::from_be_bytes(self.incoming[..4].try_into().expect("length checked"));

                    if length > self.max_frame_len {
                        return Err(WireError::FrameTooLarge {
                            length,
                            cap: self.max_frame_len,
                        });
                    }

                    let frame_len = 4 + length as usize;
                    if self.incoming.len() < frame_len {
                        return Ok(None);
                    }
                    self.incoming.advance(4);

                    if length == 0 {
                        // Keepalive. Accepted any time after the handshake.
                        return Ok(Some(Event::Message(Message::KeepAlive)));
                    }

                    let id = self.incoming[0];
                    let payload = self.incoming[1..length as usize].to_vec();
                    self.incoming.advance(length as usize);

                    if id == message::BITFIELD {
                        if self.state != State::AwaitingBitfield {
                            return Err(WireError::UnexpectedBitfield);
                        }
                        if let Some(piece_count) = self.piece_count {
                            if payload.len() != piece_count.div_ceil(8) {
                                return Err(WireError::MalformedBitfield);
                            }
                        }
                    }

                    if self.state == State::AwaitingBitfield {
                        // The bitfield opportunity ends with the first real message.
                        self.state = State::Established;
                    }

                    match Message::parse(id, &payload)? {
                        Some(message) => return Ok(Some(Event::Message(message))),
                        // Unknown id: drop the frame and keep parsing.
                        None => continue,
                    }
                }
            }
        }
    }

    /// Queues a message for sending.
    ///
    /// # Errors
    ///
    /// Will return an error if the machine is closed.
    pub fn send(&mut self, message: &Message) -> Result<(), WireError> {
        if self.state == State::Closed {
            return Err(WireError::Closed);
        }
        message.write_to(&mut self.outgoing);
        Ok(())
    }

    /// Drains the bytes that should be written to the transport.
    pub fn take_outbound(&mut self) -> BytesMut {
        self.outgoing.split()
    }

    #[must_use]
    pub fn has_outbound(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// The peer handshake, once received.
    #[must_use]
    pub fn peer_handshake(&self) -> Option<&Handshake> {
        self.peer_handshake.as_ref()
    }

    /// Whether unconsumed input is sitting in the buffer. An end of stream
    /// while this is true means the peer truncated a frame.
    #[must_use]
    pub fn has_partial_input(&self) -> bool {
        !self.incoming.is_empty()
    }

    pub fn close(&mut self) {
        self.state = State::Closed;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }
}

/// The largest legal frame: a piece message (`1 + 8 + block`), a bitfield
/// (`1 + ceil(pieces / 8)`), or a `ut_metadata` data frame (a metadata block
/// plus its bencoded header).
fn frame_cap(piece_count: Option<usize>) -> u32 {
    let piece_frame = 1 + 8 + BLOCK_SIZE;
    let metadata_frame = 2 + METADATA_HEADER_MAX + BLOCK_SIZE;
    let bitfield_frame = piece_count.map_or(0, |count| {
        1 + u32::try_from(count.div_ceil(8)).expect("piece counts fit in u32")
    });

    piece_frame.max(metadata_frame).max(bitfield_frame)
}
