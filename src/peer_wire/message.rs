//! The length-prefixed messages exchanged after the handshake.
//!
//! Wire form: a 4-byte big-endian length prefix, a 1-byte message id and an
//! id-specific payload. A zero length prefix is a keepalive.
use bytes::{BufMut, BytesMut};

use super::WireError;

/// A parsed peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: u32,
    },
    Bitfield {
        bytes: Vec<u8>,
    },
    Request {
        piece_index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        piece_index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel {
        piece_index: u32,
        begin: u32,
        length: u32,
    },
    /// BEP 10 extension protocol frame. Extended id `0` is the extended
    /// handshake; other ids are whatever the handshakes negotiated.
    Extended {
        extended_id: u8,
        payload: Vec<u8>,
    },
}

pub const CHOKE: u8 = 0;
pub const UNCHOKE: u8 = 1;
pub const INTERESTED: u8 = 2;
pub const NOT_INTERESTED: u8 = 3;
pub const HAVE: u8 = 4;
pub const BITFIELD: u8 = 5;
pub const REQUEST: u8 = 6;
pub const PIECE: u8 = 7;
pub const CANCEL: u8 = 8;
pub const EXTENDED: u8 = 20;

impl Message {
    /// Appends the framed wire bytes of this message to `out`.
    pub fn write_to(&self, out: &mut BytesMut) {
        match self {
            Message::KeepAlive => out.put_u32(0),
            Message::Choke => write_frame(out, CHOKE, &[]),
            Message::Unchoke => write_frame(out, UNCHOKE, &[]),
            Message::Interested => write_frame(out, INTERESTED, &[]),
            Message::NotInterested => write_frame(out, NOT_INTERESTED, &[]),
            Message::Have { piece_index } => write_frame(out, HAVE, &piece_index.to_be_bytes()),
            Message::Bitfield { bytes } => write_frame(out, BITFIELD, bytes),
            Message::Request {
                piece_index,
                begin,
                length,
            } => {
                let mut payload = [0u8; 12];
                payload[0..4].copy_from_slice(&piece_index.to_be_bytes());
                payload[4..8].copy_from_slice(&begin.to_be_bytes());
                payload[8..12].copy_from_slice(&length.to_be_bytes());
                write_frame(out, REQUEST, &payload);
            }
            Message::Piece {
                piece_index,
                begin,
                block,
            } => {
                let length = 1 + 8 + block.len() as u32;
                out.put_u32(length);
                out.put_u8(PIECE);
                out.put_u32(*piece_index);
                out.put_u32(*begin);
                out.put_slice(block);
            }
            Message::Cancel {
                piece_index,
                begin,
                length,
            } => {
                let mut payload = [0u8; 12];
                payload[0..4].copy_from_slice(&piece_index.to_be_bytes());
                payload[4..8].copy_from_slice(&begin.to_be_bytes());
                payload[8..12].copy_from_slice(&length.to_be_bytes());
                write_frame(out, CANCEL, &payload);
            }
            Message::Extended { extended_id, payload } => {
                let length = 2 + payload.len() as u32;
                out.put_u32(length);
                out.put_u8(EXTENDED);
                out.put_u8(*extended_id);
                out.put_slice(payload);
            }
        }
    }

    /// Parses the payload of a frame with message id `id`.
    ///
    /// Returns `Ok(None)` for unknown ids, which are skipped rather than
    /// treated as fatal.
    ///
    /// # Errors
    ///
    /// Will return an error if the payload length does not match the shape
    /// the id requires.
    pub fn parse(id: u8, payload: &[u8]) -> Result<Option<Message>, WireError> {
        let malformed = || WireError::MalformedMessage { id };

        let message = match id {
            CHOKE | UNCHOKE | INTERESTED | NOT_INTERESTED => {
                if !payload.is_empty() {
                    return Err(malformed());
                }
                match id {
                    CHOKE => Message::Choke,
                    UNCHOKE => Message::Unchoke,
                    INTERESTED => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            HAVE => {
                if payload.len() != 4 {
                    return Err(malformed());
                }
                Message::Have {
                    piece_index: read_u32(payload, 0).ok_or_else(malformed)?,
                }
            }
            BITFIELD => Message::Bitfield {
                bytes: payload.to_vec(),
            },
            REQUEST | CANCEL => {
                if payload.len() != 12 {
                    return Err(malformed());
                }
                let piece_index = read_u32(payload, 0).ok_or_else(malformed)?;
                let begin = read_u32(payload, 4).ok_or_else(malformed)?;
                let length = read_u32(payload, 8).ok_or_else(malformed)?;
                if id == REQUEST {
                    Message::Request {
                        piece_index,
                        begin,
                        length,
                    }
                } else {
                    Message::Cancel {
                        piece_index,
                        begin,
                        length,
                    }
                }
            }
            PIECE => {
                if payload.len() < 8 {
                    return Err(malformed());
                }
                Message::Piece {
                    piece_index: read_u32(payload, 0).ok_or_else(malformed)?,
                    begin: read_u32(payload, 4).ok_or_else(malformed)?,
                    block: payload[8..].to_vec(),
                }
            }
            EXTENDED => {
                let Some((extended_id, payload)) = payload.split_first() else {
                    return Err(malformed());
                };
                Message::Extended {
                    extended_id: *extended_id,
                    payload: payload.to_vec(),
                }
            }
            _ => return Ok(None),
        };

        Ok(Some(message))
    }
}

fn write_frame(out: &mut BytesMut, id: u8, payload: &[u8]) {
    out.put_u32(1 + payload.len() as u32);
    out.put_u8(id);
    out.put_slice(payload);
}

fn read_u32(payload: &[u8], at: usize) -> Option<u32> {
    let bytes: [u8; 4] = payload.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}
