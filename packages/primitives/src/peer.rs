//! The peer id this client sends in handshakes and tracker announces.
//!
//! Peer ids use the Azureus-style convention: a dash-delimited client tag
//! followed by random bytes, for example `-TD3000-xxxxxxxxxxxx`. The id is
//! generated once per download run. Ids received from remote peers are
//! recorded for logging but never trusted for identity.
use std::ops::Deref;

use rand::Rng;

pub const PEER_ID_BYTES_LEN: usize = 20;

/// The Azureus-style client tag of this implementation.
const CLIENT_PREFIX: &[u8; 8] = b"-TD3000-";

/// A 20-byte peer id as it appears on the wire.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub struct Id(pub [u8; PEER_ID_BYTES_LEN]);

impl Id {
    /// Generates a fresh id: the client tag followed by 12 random
    /// alphanumeric bytes.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; PEER_ID_BYTES_LEN];
        bytes[..CLIENT_PREFIX.len()].copy_from_slice(CLIENT_PREFIX);

        let mut rng = rand::thread_rng();
        for byte in &mut bytes[CLIENT_PREFIX.len()..] {
            *byte = rng.sample(rand::distributions::Alphanumeric);
        }

        Self(bytes)
    }

    /// Create a new `Id` from a byte slice.
    ///
    /// # Panics
    ///
    /// Will panic if byte slice does not contains the exact amount of bytes need for the `Id`.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), PEER_ID_BYTES_LEN);
        let mut ret = Self([0u8; PEER_ID_BYTES_LEN]);
        ret.0.clone_from_slice(bytes);
        ret
    }

    /// Converts to hex string.
    ///
    /// For the `Id` `-qB00000000000000000` it returns `2d71423030303030303030303030303030303030`
    #[must_use]
    pub fn to_hex_string(&self) -> String {
        let mut tmp = [0u8; PEER_ID_BYTES_LEN * 2];
        binascii::bin2hex(&self.0, &mut tmp).expect("failed to hexlify");
        std::str::from_utf8(&tmp).unwrap().to_string()
    }
}

impl Deref for Id {
    type Target = [u8; PEER_ID_BYTES_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{Id, PEER_ID_BYTES_LEN};

    #[test]
    fn a_random_id_starts_with_the_client_tag() {
        let id = Id::random();

        assert_eq!(&id.0[..8], b"-TD3000-");
    }

    #[test]
    fn a_random_id_has_a_printable_random_tail() {
        let id = Id::random();

        assert!(id.0[8..].iter().all(u8::is_ascii_alphanumeric));
    }

    #[test]
    fn two_random_ids_differ() {
        assert_ne!(Id::random().0, Id::random().0);
    }

    #[test]
    fn an_id_should_be_converted_to_hex_string() {
        let id = Id(*b"-qB00000000000000000");

        assert_eq!(id.to_hex_string(), "2d71423030303030303030303030303030303030");
        assert_eq!(id.to_string(), "2d71423030303030303030303030303030303030");
    }

    #[test]
    fn an_id_can_be_created_from_a_20_byte_slice() {
        let id = Id::from_bytes(&[7u8; PEER_ID_BYTES_LEN]);

        assert_eq!(id.0, [7u8; PEER_ID_BYTES_LEN]);
    }
}
