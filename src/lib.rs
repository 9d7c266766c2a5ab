//! Torrust Downloader.
//!
//! A download-only [`BitTorrent`](https://www.bittorrent.org/) client:
//! given a torrent file or a magnet URI it discovers peers through
//! HTTP(S) and UDP trackers, downloads the payload piece by piece from
//! many peers concurrently, verifies every piece against the SHA-1
//! digests in the metainfo, and writes the verified bytes into the target
//! files.
//!
//! The crate is organized the way the data flows:
//!
//! - [`console`] parses the command line and [`app`] wires everything
//!   together.
//! - [`shared::bit_torrent`] holds the parsed
//!   [metainfo](shared::bit_torrent::metainfo::Metainfo) and
//!   [magnet](shared::bit_torrent::magnet::Magnet) models.
//! - [`trackers`] announces to HTTP(S) and UDP trackers (BEP 3, BEP 15),
//!   walking the tracker tiers (BEP 12), and produces peer endpoints.
//! - [`core::peers`] turns endpoints into peer sessions, each driving the
//!   Sans-I/O [`peer_wire`] machine over its own TCP connection. Magnet
//!   downloads bootstrap through the extension protocol
//!   ([`peer_wire::extended`], BEP 9 and BEP 10) first.
//! - [`core::pieces`] is the piece registry: the single coordinator that
//!   decides which block every session requests next, accounts what is in
//!   flight, verifies finished pieces and duplicates the tail of the
//!   download in the endgame.
//! - [`core::storage`] persists verified pieces at the right offsets of
//!   the (possibly multi-file) layout and keeps the resume sidecar.
//!
//! Supported BEPs:
//!
//! - [BEP 3. The `BitTorrent` Protocol Specification](https://www.bittorrent.org/beps/bep_0003.html)
//! - [BEP 9. Extension for Peers to Send Metadata Files](https://www.bittorrent.org/beps/bep_0009.html)
//! - [BEP 10. Extension Protocol](https://www.bittorrent.org/beps/bep_0010.html)
//! - [BEP 12. Multitracker Metadata Extension](https://www.bittorrent.org/beps/bep_0012.html)
//! - [BEP 15. UDP Tracker Protocol](https://www.bittorrent.org/beps/bep_0015.html)
//! - [BEP 23. Tracker Returns Compact Peer Lists](https://www.bittorrent.org/beps/bep_0023.html)
pub mod app;
pub mod bootstrap;
pub mod console;
pub mod core;
pub mod peer_wire;
pub mod shared;
pub mod trackers;
