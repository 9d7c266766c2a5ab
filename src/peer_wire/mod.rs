//! The peer wire protocol (BEP 3), implemented Sans-I/O.
//!
//! The [`machine::Machine`] owns no sockets. Its only inputs are bytes
//! received from the peer and messages the session wants to send; its only
//! outputs are parsed [`message::Message`] values and bytes to put on the
//! wire. The session task does all the I/O, which keeps the protocol logic
//! deterministic and directly testable with byte fixtures.
pub mod extended;
pub mod handshake;
pub mod machine;
pub mod message;

use thiserror::Error;
use torrust_downloader_primitives::info_hash::InfoHash;

/// Errors raised while driving the peer wire. All of them are fatal for the
/// connection: the machine closes and the session is expected to drop the
/// transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("the peer does not speak the BitTorrent protocol")]
    UnsupportedProtocol,

    #[error("the peer handshake carries info-hash {got} instead of {expected}")]
    InfoHashMismatch { expected: InfoHash, got: InfoHash },

    #[error("the peer sent a bitfield after the first message")]
    UnexpectedBitfield,

    #[error("the peer sent a bitfield of the wrong length")]
    MalformedBitfield,

    #[error("frame of {length} bytes exceeds the cap of {cap} bytes")]
    FrameTooLarge { length: u32, cap: u32 },

    #[error("malformed payload for message id {id}")]
    MalformedMessage { id: u8 },

    #[error("the peer closed the stream in the middle of a frame")]
    TruncatedStream,

    #[error("the connection is closed")]
    Closed,
}
