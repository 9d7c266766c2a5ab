//! Tracker announce clients.
//!
//! Trackers are how the downloader learns peer endpoints. Both transport
//! variants are supported: HTTP(S) announce (BEP 3) and UDP announce
//! (BEP 15). The tracker list of a torrent is walked in tiers (BEP 12) by
//! [`tiers::TierList`].
pub mod http;
pub mod tiers;
pub mod udp;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use torrust_downloader_primitives::info_hash::InfoHash;
use torrust_downloader_primitives::peer;

/// The event reported with an announce request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnounceEvent {
    Started,
    Completed,
    Stopped,
    #[default]
    None,
}

impl AnnounceEvent {
    /// The `event` query value for HTTP announces. Regular announces omit
    /// the parameter.
    #[must_use]
    pub fn query_value(&self) -> Option<&'static str> {
        match self {
            Self::Started => Some("started"),
            Self::Completed => Some("completed"),
            Self::Stopped => Some("stopped"),
            Self::None => None,
        }
    }

    /// The numeric event code used by the UDP protocol.
    #[must_use]
    pub fn udp_value(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Completed => 1,
            Self::Started => 2,
            Self::Stopped => 3,
        }
    }
}

/// Everything a tracker needs to know about this client and download.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceParams {
    pub info_hash: InfoHash,
    pub peer_id: peer::Id,
    /// The port reported to the tracker. The downloader does not listen,
    /// but the protocol requires one.
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub num_want: u32,
}

/// A successful announce: how long to wait before the next cycle and the
/// peer endpoints the tracker returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub peers: Vec<SocketAddr>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("invalid tracker URL: {url}")]
    InvalidUrl { url: String },

    #[error("unsupported tracker URL scheme: {url}")]
    UnsupportedScheme { url: String },

    #[error("transport failure talking to {url}: {message}")]
    Transport { url: String, message: String },

    #[error("tracker {url} rejected the announce: {reason}")]
    Rejected { url: String, reason: String },

    #[error("tracker {url} returned an invalid response: {message}")]
    InvalidResponse { url: String, message: String },

    #[error("tracker {url} did not answer within the retry schedule")]
    ExhaustedRetries { url: String },

    #[error("every tracker tier failed for this announce cycle")]
    AllTiersFailed,
}

/// Decodes the compact peer format: `6 * n` bytes of IPv4 address and
/// big-endian port records.
#[must_use]
pub fn peers_from_compact(bytes: &[u8]) -> Option<Vec<SocketAddr>> {
    if bytes.len() % 6 != 0 {
        return None;
    }

    Some(
        bytes
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddr::new(IpAddr::V4(ip), port)
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::{peers_from_compact, AnnounceEvent};

    #[test]
    fn compact_peer_records_are_4_byte_ip_and_2_byte_port() {
        let peers = peers_from_compact(b"\x01\x02\x03\x04\x1a\xe1").unwrap();

        assert_eq!(peers, vec!["1.2.3.4:6881".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn compact_bytes_not_a_multiple_of_six_are_rejected() {
        assert!(peers_from_compact(b"\x01\x02\x03\x04\x1a").is_none());
    }

    #[test]
    fn an_empty_compact_string_is_an_empty_peer_list() {
        assert_eq!(peers_from_compact(b"").unwrap(), vec![]);
    }

    #[test]
    fn event_codes_match_bep_15() {
        assert_eq!(AnnounceEvent::None.udp_value(), 0);
        assert_eq!(AnnounceEvent::Completed.udp_value(), 1);
        assert_eq!(AnnounceEvent::Started.udp_value(), 2);
        assert_eq!(AnnounceEvent::Stopped.udp_value(), 3);
    }

    #[test]
    fn regular_announces_omit_the_event_parameter() {
        assert_eq!(AnnounceEvent::None.query_value(), None);
        assert_eq!(AnnounceEvent::Started.query_value(), Some("started"));
    }
}
