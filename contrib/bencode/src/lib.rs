//! Strict decoding and canonical encoding for bencoded data.
//!
//! # Examples
//!
//! Decoding bencoded data:
//!
//! ```rust
//! use torrust_downloader_contrib_bencode::BencodeRef;
//!
//! let data = b"d12:lucky_numberi7ee"; // cspell:disable-line
//! let bencode = BencodeRef::decode(data).unwrap();
//!
//! assert_eq!(Some(7), bencode.lookup(b"lucky_number").and_then(BencodeRef::int));
//! ```
//!
//! Encoding bencoded data:
//!
//! ```rust
//! use torrust_downloader_contrib_bencode::{ben_bytes, ben_int, ben_map};
//!
//! let message = (ben_map! {
//!     "lucky_number" => ben_int!(7),
//!     "lucky_string" => ben_bytes!("7")
//! })
//! .encode();
//!
//! let data = b"d12:lucky_numberi7e12:lucky_string1:7e"; // cspell:disable-line
//! assert_eq!(&data[..], &message[..]);
//! ```

mod error;
mod mutable;
mod reference;

pub use crate::error::{BencodeParseError, BencodeParseResult};
pub use crate::mutable::BencodeValue;
pub use crate::reference::BencodeRef;

const BEN_END: u8 = b'e';
const DICT_START: u8 = b'd';
const LIST_START: u8 = b'l';
const INT_START: u8 = b'i';

const BYTE_LEN_LOW: u8 = b'0';
const BYTE_LEN_HIGH: u8 = b'9';
const BYTE_LEN_END: u8 = b':';

/// Nesting depth after which the decoder refuses to recurse.
const MAX_RECURSION: usize = 50;

/// Construct a [`BencodeValue`] map by supplying string references as keys and
/// [`BencodeValue`] as values.
#[macro_export]
macro_rules! ben_map {
    ( $($key:expr => $val:expr),* ) => {
        {
            let mut bencode_map = $crate::BencodeValue::new_dict();
            {
                let map = bencode_map.dict_mut().unwrap();
                $(
                    map.insert(Vec::from($key.as_bytes() as &[u8]), $val);
                )*
            }

            bencode_map
        }
    }
}

/// Construct a [`BencodeValue`] list by supplying a list of [`BencodeValue`] values.
#[macro_export]
macro_rules! ben_list {
    ( $($ben:expr),* ) => {
        {
            let mut bencode_list = $crate::BencodeValue::new_list();
            {
                let list = bencode_list.list_mut().unwrap();
                $(
                    list.push($ben);
                )*
            }

            bencode_list
        }
    }
}

/// Construct [`BencodeValue`] bytes by supplying a type convertible to `Vec<u8>`.
#[macro_export]
macro_rules! ben_bytes {
    ( $ben:expr ) => {{
        $crate::BencodeValue::Bytes(Vec::from($ben.as_bytes() as &[u8]))
    }};
}

/// Construct a [`BencodeValue`] integer by supplying an `i64`.
#[macro_export]
macro_rules! ben_int {
    ( $ben:expr ) => {{
        $crate::BencodeValue::Int($ben)
    }};
}
