//! `BitTorrent` domain models shared across the application: the parsed
//! metainfo (torrent file) and the magnet URI.
pub mod magnet;
pub mod metainfo;
