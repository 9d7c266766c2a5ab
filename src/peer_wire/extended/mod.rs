//! The extension protocol (BEP 10).
//!
//! Once both handshakes carried the extension reserved bit, each side sends
//! an *extended handshake*: extension message id `0` with a bencoded payload
//! mapping extension names to the message ids the sender will accept them
//! under. The only extension this client speaks is `ut_metadata` (BEP 9),
//! used to fetch the `info` dictionary when starting from a magnet link.
pub mod metadata;

use thiserror::Error;
use torrust_downloader_contrib_bencode::{ben_int, ben_map, BencodeParseError, BencodeRef};

/// Extension message id `0` is always the extended handshake.
pub const EXTENDED_HANDSHAKE_ID: u8 = 0;

/// The id under which we accept `ut_metadata` messages.
pub const OUR_METADATA_ID: u8 = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtendedError {
    #[error("invalid bencode in extension payload: {0}")]
    InvalidBencode(#[from] BencodeParseError),

    #[error("the extension payload is not a dictionary")]
    NotADictionary,
}

/// The decoded extended handshake of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtendedHandshake {
    /// The message id the peer accepts `ut_metadata` messages under, if it
    /// supports the extension.
    pub ut_metadata_id: Option<u8>,
    /// The size of the `info` dictionary in bytes, if the peer knows it.
    pub metadata_size: Option<u64>,
}

impl ExtendedHandshake {
    /// Decodes the payload of an incoming extended handshake.
    ///
    /// # Errors
    ///
    /// Will return an error if the payload is not a bencoded dictionary.
    pub fn parse(payload: &[u8]) -> Result<Self, ExtendedError> {
        let root = BencodeRef::decode(payload)?;
        if root.dict().is_none() {
            return Err(ExtendedError::NotADictionary);
        }

        let ut_metadata_id = root
            .lookup(b"m")
            .and_then(|m| m.lookup(b"ut_metadata"))
            .and_then(BencodeRef::int)
            .and_then(|id| u8::try_from(id).ok());

        let metadata_size = root
            .lookup(b"metadata_size")
            .and_then(BencodeRef::int)
            .and_then(|size| u64::try_from(size).ok());

        Ok(Self {
            ut_metadata_id,
            metadata_size,
        })
    }

    /// The payload of the extended handshake we send: it advertises which id
    /// we accept `ut_metadata` messages under.
    #[must_use]
    pub fn ours() -> Vec<u8> {
        (ben_map! {
            "m" => ben_map! {
                "ut_metadata" => ben_int!(i64::from(OUR_METADATA_ID))
            }
        })
        .encode()
    }
}

#[cfg(test)]
mod tests {
    use super::{ExtendedError, ExtendedHandshake};

    #[test]
    fn it_should_parse_the_negotiated_metadata_id_and_size() {
        let payload = b"d1:md11:ut_metadatai3ee13:metadata_sizei31235ee";

        let handshake = ExtendedHandshake::parse(payload).unwrap();

        assert_eq!(handshake.ut_metadata_id, Some(3));
        assert_eq!(handshake.metadata_size, Some(31_235));
    }

    #[test]
    fn a_peer_without_ut_metadata_parses_to_none() {
        let payload = b"d1:md6:ut_pexi2eee";

        let handshake = ExtendedHandshake::parse(payload).unwrap();

        assert_eq!(handshake.ut_metadata_id, None);
        assert_eq!(handshake.metadata_size, None);
    }

    #[test]
    fn a_non_dictionary_payload_is_rejected() {
        assert_eq!(
            ExtendedHandshake::parse(b"i5e").unwrap_err(),
            ExtendedError::NotADictionary
        );
        assert!(matches!(
            ExtendedHandshake::parse(b"garbage").unwrap_err(),
            ExtendedError::InvalidBencode(_)
        ));
    }

    #[test]
    fn our_handshake_advertises_ut_metadata() {
        let payload = ExtendedHandshake::ours();

        assert_eq!(payload, b"d1:md11:ut_metadatai1eee");

        let parsed = ExtendedHandshake::parse(&payload).unwrap();
        assert_eq!(parsed.ut_metadata_id, Some(1));
    }
}
