//! Primitive types shared by the Torrust Downloader packages.
//!
//! This package contains the basic `BitTorrent` domain types: the torrent
//! [`info_hash::InfoHash`], the [`peer::Id`] a client identifies itself with
//! on the wire, and the MSB-first piece [`bitfield::Bitfield`].
pub mod bitfield;
pub mod info_hash;
pub mod peer;

/// The size of a block in bytes, the sub-piece unit requested on the peer
/// wire. Every block of a piece has this size except possibly the last one.
pub const BLOCK_SIZE: u32 = 16_384;
