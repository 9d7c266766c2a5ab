//! The fixed-size handshake that opens every peer wire connection.
//!
//! ```text
//! <0x13><"BitTorrent protocol"><8 reserved bytes><20-byte info-hash><20-byte peer id>
//! ```
//!
//! Bit `0x10` of reserved byte 5 signals support for the extension protocol
//! (BEP 10), which the metadata exchange needs.
use bytes::{BufMut, BytesMut};
use torrust_downloader_primitives::info_hash::InfoHash;
use torrust_downloader_primitives::peer;

use super::WireError;

/// Total size of a handshake on the wire.
pub const HANDSHAKE_LEN: usize = 68;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// Reserved byte 5, bit `0x10`: extension protocol (BEP 10).
const EXTENSIONS_BYTE: usize = 5;
const EXTENSIONS_BIT: u8 = 0x10;

/// A decoded handshake, ours or the peer's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: peer::Id,
    pub supports_extensions: bool,
}

impl Handshake {
    /// The handshake this client sends. The extension bit is always set; the
    /// peer decides whether to use it.
    #[must_use]
    pub fn new(info_hash: InfoHash, peer_id: peer::Id) -> Self {
        Self {
            info_hash,
            peer_id,
            supports_extensions: true,
        }
    }

    /// Appends the 68 wire bytes to `out`.
    pub fn write_to(&self, out: &mut BytesMut) {
        out.reserve(HANDSHAKE_LEN);
        out.put_u8(PROTOCOL.len() as u8);
        out.put_slice(PROTOCOL);

        let mut reserved = [0u8; 8];
        if self.supports_extensions {
            reserved[EXTENSIONS_BYTE] |= EXTENSIONS_BIT;
        }
        out.put_slice(&reserved);

        out.put_slice(&self.info_hash.0);
        out.put_slice(&self.peer_id.0);
    }

    /// Decodes a peer handshake.
    ///
    /// # Errors
    ///
    /// Will return an error if the protocol string is not the `BitTorrent`
    /// one. The info-hash is *not* checked here; the machine compares it
    /// against the expected hash of the download.
    pub fn parse(bytes: &[u8; HANDSHAKE_LEN]) -> Result<Self, WireError> {
        if bytes[0] as usize != PROTOCOL.len() || &bytes[1..20] != PROTOCOL {
            return Err(WireError::UnsupportedProtocol);
        }

        let reserved = &bytes[20..28];
        let supports_extensions = reserved[EXTENSIONS_BYTE] & EXTENSIONS_BIT != 0;

        Ok(Self {
            info_hash: InfoHash::from_bytes(&bytes[28..48]),
            peer_id: peer::Id::from_bytes(&bytes[48..68]),
            supports_extensions,
        })
    }
}
