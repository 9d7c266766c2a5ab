//! The HTTP(S) announce client (BEP 3).
//!
//! The query is assembled by hand because the info-hash and peer id are raw
//! byte arrays, percent-encoded byte by byte; `reqwest` does not allow byte
//! arrays in query parameters. More info on this issue:
//!
//! <https://github.com/seanmonstar/reqwest/issues/1613>
use std::time::Duration;

use percent_encoding::NON_ALPHANUMERIC;
use torrust_downloader_contrib_bencode::BencodeRef;
use tracing::debug;
use url::Url;

use super::{peers_from_compact, AnnounceParams, AnnounceResponse, TrackerError};

pub const HTTP_CLIENT_LOG_TARGET: &str = "HTTP TRACKER CLIENT";

pub type ByteArray20 = [u8; 20];

/// HTTP Tracker Client
#[derive(Debug, Clone)]
pub struct Client {
    reqwest: reqwest::Client,
}

impl Client {
    /// # Errors
    ///
    /// This method fails if the client builder fails.
    pub fn new(timeout: Duration) -> Result<Self, TrackerError> {
        let reqwest = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| TrackerError::Transport {
                url: String::new(),
                message: err.to_string(),
            })?;

        Ok(Self { reqwest })
    }

    /// Sends one announce request and decodes the bencoded response.
    ///
    /// # Errors
    ///
    /// Will return an error if the request fails, the tracker rejects the
    /// announce (`failure reason`), or the response is malformed.
    pub async fn announce(&self, url: &Url, params: &AnnounceParams) -> Result<AnnounceResponse, TrackerError> {
        let announce_url = build_announce_url(url, params);

        debug!(target: HTTP_CLIENT_LOG_TARGET, "announcing to {announce_url}");

        let response = self
            .reqwest
            .get(&announce_url)
            .send()
            .await
            .map_err(|err| TrackerError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::Transport {
                url: url.to_string(),
                message: format!("status {status}"),
            });
        }

        let body = response.bytes().await.map_err(|err| TrackerError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        })?;

        parse_response(url, &body)
    }
}

#[must_use]
pub fn percent_encode_byte_array(bytes: &ByteArray20) -> String {
    percent_encoding::percent_encode(bytes, NON_ALPHANUMERIC).to_string()
}

/// It builds the URL query component for the announce request, appending it
/// to any query the announce URL already carries (private trackers embed
/// keys there).
fn build_announce_url(url: &Url, params: &AnnounceParams) -> String {
    let mut pairs = vec![
        ("info_hash", percent_encode_byte_array(&params.info_hash.0)),
        ("peer_id", percent_encode_byte_array(&params.peer_id.0)),
        ("port", params.port.to_string()),
        ("uploaded", params.uploaded.to_string()),
        ("downloaded", params.downloaded.to_string()),
        ("left", params.left.to_string()),
        ("compact", "1".to_string()),
        ("numwant", params.num_want.to_string()),
    ];

    if let Some(event) = params.event.query_value() {
        pairs.push(("event", event.to_string()));
    }

    let query = pairs
        .iter()
        .map(|param| format!("{}={}", param.0, param.1))
        .collect::<Vec<String>>()
        .join("&");

    let separator = if url.query().is_some() { '&' } else { '?' };

    format!("{url}{separator}{query}")
}

/// Decodes a bencoded announce response: `interval` plus either compact
/// peer bytes or a list of peer dictionaries.
fn parse_response(url: &Url, body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let invalid = |message: &str| TrackerError::InvalidResponse {
        url: url.to_string(),
        message: message.to_string(),
    };

    let root = BencodeRef::decode(body).map_err(|err| invalid(&err.to_string()))?;

    if let Some(reason) = root.lookup(b"failure reason") {
        return Err(TrackerError::Rejected {
            url: url.to_string(),
            reason: reason.str().unwrap_or("<non utf-8 reason>").to_string(),
        });
    }

    let interval = root
        .lookup(b"interval")
        .and_then(BencodeRef::int)
        .and_then(|interval| u64::try_from(interval).ok())
        .ok_or_else(|| invalid("missing interval"))?;

    let peers_value = root.lookup(b"peers").ok_or_else(|| invalid("missing peers"))?;

    let peers = if let Some(compact) = peers_value.bytes() {
        peers_from_compact(compact).ok_or_else(|| invalid("compact peers not a multiple of 6 bytes"))?
    } else if let Some(list) = peers_value.list() {
        let mut peers = Vec::with_capacity(list.len());
        for peer in list {
            let ip = peer
                .lookup(b"ip")
                .and_then(BencodeRef::str)
                .and_then(|ip| ip.parse().ok())
                .ok_or_else(|| invalid("peer entry without a usable ip"))?;
            let port = peer
                .lookup(b"port")
                .and_then(BencodeRef::int)
                .and_then(|port| u16::try_from(port).ok())
                .ok_or_else(|| invalid("peer entry without a usable port"))?;
            peers.push(std::net::SocketAddr::new(ip, port));
        }
        peers
    } else {
        return Err(invalid("peers is neither bytes nor a list"));
    };

    Ok(AnnounceResponse {
        interval: Duration::from_secs(interval),
        peers,
    })
}
