//! The `ut_metadata` extension (BEP 9): fetching the `info` dictionary from
//! peers when only a magnet link is known.
//!
//! The metadata is treated as a byte string split into 16 KiB pieces. Each
//! message is a bencoded dictionary with a `msg_type` (`0` request, `1`
//! data, `2` reject) and a `piece` index; data messages append the raw piece
//! bytes directly after the bencoded header.
use thiserror::Error;
use torrust_downloader_contrib_bencode::{ben_int, ben_map, BencodeParseError, BencodeRef};
use torrust_downloader_primitives::info_hash::InfoHash;

/// Metadata pieces are always 16 KiB except the last one.
pub const METADATA_PIECE_SIZE: u64 = 16_384;

/// Upper bound accepted for `metadata_size`. An `info` dictionary larger
/// than this is either corrupt or hostile.
const METADATA_SIZE_MAX: u64 = 64 * 1024 * 1024;

const MSG_TYPE_REQUEST: i64 = 0;
const MSG_TYPE_DATA: i64 = 1;
const MSG_TYPE_REJECT: i64 = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("invalid bencode in ut_metadata message: {0}")]
    InvalidBencode(#[from] BencodeParseError),

    #[error("ut_metadata message with missing or unknown msg_type")]
    UnknownMessageType,

    #[error("metadata size {size} is outside the accepted range")]
    SizeOutOfRange { size: u64 },

    #[error("metadata piece {piece} is out of range")]
    PieceOutOfRange { piece: u64 },

    #[error("metadata piece {piece} has the wrong length")]
    WrongPieceLength { piece: u64 },

    #[error("assembled metadata does not hash to the magnet info-hash")]
    HashMismatch,
}

/// A decoded `ut_metadata` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u64 },
    Data { piece: u64, total_size: u64, payload: Vec<u8> },
    Reject { piece: u64 },
}

impl MetadataMessage {
    /// Encodes a request for metadata piece `piece`.
    #[must_use]
    pub fn request(piece: u64) -> Vec<u8> {
        #[allow(clippy::cast_possible_wrap)]
        let message = ben_map! {
            "msg_type" => ben_int!(MSG_TYPE_REQUEST),
            "piece" => ben_int!(piece as i64)
        };

        message.encode()
    }

    /// Decodes an incoming `ut_metadata` payload. For data messages the raw
    /// piece bytes follow the bencoded header.
    ///
    /// # Errors
    ///
    /// Will return an error if the header is not valid bencode or the
    /// message shape is unknown.
    pub fn parse(payload: &[u8]) -> Result<Self, MetadataError> {
        let (header, consumed) = BencodeRef::decode_prefix(payload)?;

        let msg_type = header
            .lookup(b"msg_type")
            .and_then(BencodeRef::int)
            .ok_or(MetadataError::UnknownMessageType)?;
        let piece = header
            .lookup(b"piece")
            .and_then(BencodeRef::int)
            .and_then(|piece| u64::try_from(piece).ok())
            .ok_or(MetadataError::UnknownMessageType)?;

        match msg_type {
            MSG_TYPE_REQUEST => Ok(Self::Request { piece }),
            MSG_TYPE_DATA => {
                let total_size = header
                    .lookup(b"total_size")
                    .and_then(BencodeRef::int)
                    .and_then(|size| u64::try_from(size).ok())
                    .ok_or(MetadataError::UnknownMessageType)?;

                Ok(Self::Data {
                    piece,
                    total_size,
                    payload: payload[consumed..].to_vec(),
                })
            }
            MSG_TYPE_REJECT => Ok(Self::Reject { piece }),
            _ => Err(MetadataError::UnknownMessageType),
        }
    }
}

/// Accumulates metadata pieces until the whole `info` dictionary can be
/// verified against the magnet info-hash.
#[derive(Debug)]
pub struct MetadataFetch {
    expected: InfoHash,
    total_size: u64,
    pieces: Vec<Option<Vec<u8>>>,
}

impl MetadataFetch {
    /// Starts a fetch for metadata of `total_size` bytes.
    ///
    /// # Errors
    ///
    /// Will return an error if the advertised size is zero or implausibly
    /// large.
    pub fn new(expected: InfoHash, total_size: u64) -> Result<Self, MetadataError> {
        if total_size == 0 || total_size > METADATA_SIZE_MAX {
            return Err(MetadataError::SizeOutOfRange { size: total_size });
        }

        let piece_count = usize::try_from(total_size.div_ceil(METADATA_PIECE_SIZE)).expect("bounded by METADATA_SIZE_MAX");

        Ok(Self {
            expected,
            total_size,
            pieces: vec![None; piece_count],
        })
    }

    #[must_use]
    pub fn piece_count(&self) -> u64 {
        self.pieces.len() as u64
    }

    /// The next piece that still has to be requested.
    #[must_use]
    pub fn next_missing(&self) -> Option<u64> {
        self.pieces.iter().position(Option::is_none).map(|piece| piece as u64)
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(Option::is_some)
    }

    /// Stores a received piece. Every piece is 16 KiB except the last one,
    /// which carries the remainder.
    ///
    /// # Errors
    ///
    /// Will return an error for an out-of-range index or a wrong length.
    pub fn store(&mut self, piece: u64, payload: Vec<u8>) -> Result<(), MetadataError> {
        let index = usize::try_from(piece).map_err(|_| MetadataError::PieceOutOfRange { piece })?;
        if index >= self.pieces.len() {
            return Err(MetadataError::PieceOutOfRange { piece });
        }

        let expected_len = if piece == self.piece_count() - 1 {
            self.total_size - piece * METADATA_PIECE_SIZE
        } else {
            METADATA_PIECE_SIZE
        };
        if payload.len() as u64 != expected_len {
            return Err(MetadataError::WrongPieceLength { piece });
        }

        self.pieces[index] = Some(payload);
        Ok(())
    }

    /// Concatenates the pieces and verifies the SHA-1 against the magnet
    /// info-hash.
    ///
    /// # Errors
    ///
    /// Will return an error if pieces are missing or the hash does not
    /// match.
    ///
    /// # Panics
    ///
    /// Will panic if called while [`MetadataFetch::is_complete`] is false.
    pub fn assemble(self) -> Result<Vec<u8>, MetadataError> {
        let mut bytes = Vec::with_capacity(usize::try_from(self.total_size).expect("bounded by METADATA_SIZE_MAX"));
        for piece in self.pieces {
            bytes.extend_from_slice(&piece.expect("assemble requires a complete fetch"));
        }

        if InfoHash::sha1_of(&bytes) != self.expected {
            return Err(MetadataError::HashMismatch);
        }

        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use torrust_downloader_primitives::info_hash::InfoHash;

    use super::{MetadataError, MetadataFetch, MetadataMessage, METADATA_PIECE_SIZE};

    #[test]
    fn a_request_is_a_bencoded_header_only() {
        assert_eq!(MetadataMessage::request(0), b"d8:msg_typei0e5:piecei0ee");
        assert_eq!(MetadataMessage::request(3), b"d8:msg_typei0e5:piecei3ee");
    }

    #[test]
    fn a_data_message_splits_header_and_raw_bytes() {
        let mut payload = b"d8:msg_typei1e5:piecei0e10:total_sizei5ee".to_vec();
        payload.extend_from_slice(b"hello");

        let message = MetadataMessage::parse(&payload).unwrap();

        assert_eq!(
            message,
            MetadataMessage::Data {
                piece: 0,
                total_size: 5,
                payload: b"hello".to_vec(),
            }
        );
    }

    #[test]
    fn a_reject_abandons_the_piece() {
        let message = MetadataMessage::parse(b"d8:msg_typei2e5:piecei4ee").unwrap();

        assert_eq!(message, MetadataMessage::Reject { piece: 4 });
    }

    #[test]
    fn an_unknown_msg_type_is_an_error() {
        assert_eq!(
            MetadataMessage::parse(b"d8:msg_typei9e5:piecei0ee").unwrap_err(),
            MetadataError::UnknownMessageType
        );
    }

    #[test]
    fn a_fetch_collects_pieces_in_16_kib_units() {
        let info_bytes = vec![7u8; METADATA_PIECE_SIZE as usize + 100];
        let expected = InfoHash::sha1_of(&info_bytes);

        let mut fetch = MetadataFetch::new(expected, info_bytes.len() as u64).unwrap();
        assert_eq!(fetch.piece_count(), 2);
        assert_eq!(fetch.next_missing(), Some(0));

        fetch.store(0, info_bytes[..METADATA_PIECE_SIZE as usize].to_vec()).unwrap();
        assert_eq!(fetch.next_missing(), Some(1));
        assert!(!fetch.is_complete());

        fetch.store(1, info_bytes[METADATA_PIECE_SIZE as usize..].to_vec()).unwrap();
        assert!(fetch.is_complete());

        assert_eq!(fetch.assemble().unwrap(), info_bytes);
    }

    #[test]
    fn a_piece_with_the_wrong_length_is_rejected() {
        let expected = InfoHash::sha1_of(b"");
        let mut fetch = MetadataFetch::new(expected, METADATA_PIECE_SIZE + 100).unwrap();

        assert_eq!(
            fetch.store(0, vec![0u8; 100]).unwrap_err(),
            MetadataError::WrongPieceLength { piece: 0 }
        );
        assert_eq!(
            fetch.store(5, vec![0u8; 100]).unwrap_err(),
            MetadataError::PieceOutOfRange { piece: 5 }
        );
    }

    #[test]
    fn assembled_metadata_must_hash_to_the_magnet_info_hash() {
        let info_bytes = vec![7u8; 100];
        let wrong_hash = InfoHash::sha1_of(b"something else");

        let mut fetch = MetadataFetch::new(wrong_hash, info_bytes.len() as u64).unwrap();
        fetch.store(0, info_bytes).unwrap();

        assert_eq!(fetch.assemble().unwrap_err(), MetadataError::HashMismatch);
    }

    #[test]
    fn a_zero_or_huge_metadata_size_is_rejected() {
        let expected = InfoHash::sha1_of(b"");

        assert!(matches!(
            MetadataFetch::new(expected, 0).unwrap_err(),
            MetadataError::SizeOutOfRange { .. }
        ));
        assert!(matches!(
            MetadataFetch::new(expected, u64::MAX).unwrap_err(),
            MetadataError::SizeOutOfRange { .. }
        ));
    }
}
