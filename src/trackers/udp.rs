//! The UDP announce client (BEP 15).
//!
//! The protocol is two-phase: a `connect` exchange yields a connection id,
//! which authorizes the following `announce` exchange. Every frame carries a
//! 4-byte action and a 4-byte transaction id; replies are matched on the
//! transaction id. Everything on the wire is network byte order.
//!
//! Lost packets are retried on the BEP 15 schedule: attempt `n` waits
//! `15 * 2^n` seconds, and a tracker that stays silent for 8 attempts is
//! declared failed for this announce cycle.
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use super::{peers_from_compact, AnnounceParams, AnnounceResponse, TrackerError};

pub const UDP_CLIENT_LOG_TARGET: &str = "UDP TRACKER CLIENT";

pub const MAX_PACKET_SIZE: usize = 0xffff;
pub const PROTOCOL_ID: i64 = 0x0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// Retries per exchange before the tracker is declared failed.
const MAX_ATTEMPTS: u32 = 8;

/// Base of the retry schedule: attempt `n` waits `base * 2^n`.
const RETRY_BASE: Duration = Duration::from_secs(15);

/// A connection id may be reused for one minute after the connect exchange.
const CONNECTION_ID_VALIDITY: Duration = Duration::from_secs(60);

/// UDP Tracker Client
#[derive(Debug)]
pub struct Client {
    socket: UdpSocket,
    url: String,
    retry_base: Duration,
    connection: Mutex<Option<(i64, Instant)>>,
}

impl Client {
    /// Resolves the tracker URL and connects a local UDP socket to it.
    ///
    /// # Errors
    ///
    /// Will return an error if the URL has no usable host and port or the
    /// socket cannot be bound.
    pub async fn connect(url: &Url) -> Result<Self, TrackerError> {
        let host = url.host_str().ok_or_else(|| TrackerError::InvalidUrl { url: url.to_string() })?;
        let port = url.port().ok_or_else(|| TrackerError::InvalidUrl { url: url.to_string() })?;

        let transport = |message: String| TrackerError::Transport {
            url: url.to_string(),
            message,
        };

        let remote = lookup_host((host, port))
            .await
            .map_err(|err| transport(err.to_string()))?
            .next()
            .ok_or_else(|| transport("hostname resolved to no addresses".to_string()))?;

        let local: SocketAddr = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }
            .parse()
            .expect("hardcoded addresses are valid");

        let socket = UdpSocket::bind(local).await.map_err(|err| transport(err.to_string()))?;
        socket.connect(remote).await.map_err(|err| transport(err.to_string()))?;

        debug!(target: UDP_CLIENT_LOG_TARGET, "connected to tracker udp://{remote}");

        Ok(Self {
            socket,
            url: url.to_string(),
            retry_base: RETRY_BASE,
            connection: Mutex::new(None),
        })
    }

    /// Runs the connect and announce exchanges.
    ///
    /// # Errors
    ///
    /// Will return an error if the tracker stays silent through the whole
    /// retry schedule, answers with an error action, or replies with a
    /// malformed frame.
    pub async fn announce(&self, params: &AnnounceParams) -> Result<AnnounceResponse, TrackerError> {
        let connection_id = self.connection_id().await?;

        let transaction_id: u32 = rand::thread_rng().gen();
        let request = announce_request(connection_id, transaction_id, params);

        let payload = self.exchange(&request, transaction_id, ACTION_ANNOUNCE).await?;

        parse_announce_payload(&payload).ok_or_else(|| TrackerError::InvalidResponse {
            url: self.url.clone(),
            message: "announce reply too short or misaligned".to_string(),
        })
    }

    /// Returns a cached connection id while it is valid, running a connect
    /// exchange otherwise.
    async fn connection_id(&self) -> Result<i64, TrackerError> {
        if let Some((id, obtained_at)) = *self.connection.lock().expect("connection cache poisoned") {
            if obtained_at.elapsed() < CONNECTION_ID_VALIDITY {
                return Ok(id);
            }
        }

        let transaction_id: u32 = rand::thread_rng().gen();
        let request = connect_request(transaction_id);

        let payload = self.exchange(&request, transaction_id, ACTION_CONNECT).await?;

        let id = payload
            .get(..8)
            .map(|bytes| i64::from_be_bytes(bytes.try_into().expect("slice is 8 bytes")))
            .ok_or_else(|| TrackerError::InvalidResponse {
                url: self.url.clone(),
                message: "connect reply without a connection id".to_string(),
            })?;

        *self.connection.lock().expect("connection cache poisoned") = Some((id, Instant::now()));

        Ok(id)
    }

    /// Sends `request` until a reply with the same transaction id arrives,
    /// applying the retry schedule. Returns the reply payload after the
    /// action and transaction id.
    async fn exchange(&self, request: &[u8], transaction_id: u32, expected_action: u32) -> Result<Vec<u8>, TrackerError> {
        let mut buffer = [0u8; MAX_PACKET_SIZE];

        for attempt in 0..MAX_ATTEMPTS {
            self.socket.send(request).await.map_err(|err| TrackerError::Transport {
                url: self.url.clone(),
                message: err.to_string(),
            })?;

            let deadline = Instant::now() + self.retry_base * 2u32.pow(attempt);

            // Frames with a foreign transaction id are stale replies to an
            // earlier attempt; keep listening until the attempt times out.
            loop {
                let received = match time::timeout_at(deadline, self.socket.recv(&mut buffer)).await {
                    Ok(Ok(received)) => received,
                    Ok(Err(err)) => {
                        return Err(TrackerError::Transport {
                            url: self.url.clone(),
                            message: err.to_string(),
                        })
                    }
                    Err(_) => {
                        debug!(
                            target: UDP_CLIENT_LOG_TARGET,
                            "attempt {attempt} to {} timed out", self.url
                        );
                        break;
                    }
                };

                let Some((action, reply_transaction_id, payload)) = split_reply(&buffer[..received]) else {
                    continue;
                };
                if reply_transaction_id != transaction_id {
                    continue;
                }

                if action == ACTION_ERROR {
                    return Err(TrackerError::Rejected {
                        url: self.url.clone(),
                        reason: String::from_utf8_lossy(payload).to_string(),
                    });
                }
                if action != expected_action {
                    continue;
                }

                return Ok(payload.to_vec());
            }
        }

        Err(TrackerError::ExhaustedRetries { url: self.url.clone() })
    }
}

/// The 16-byte connect request: protocol id, action, transaction id.
fn connect_request(transaction_id: u32) -> Vec<u8> {
    let mut request = Vec::with_capacity(16);
    request.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    request.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    request.extend_from_slice(&transaction_id.to_be_bytes());
    request
}

/// The 98-byte announce request.
fn announce_request(connection_id: i64, transaction_id: u32, params: &AnnounceParams) -> Vec<u8> {
    let key: u32 = rand::thread_rng().gen();

    let mut request = Vec::with_capacity(98);
    request.extend_from_slice(&connection_id.to_be_bytes());
    request.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    request.extend_from_slice(&transaction_id.to_be_bytes());
    request.extend_from_slice(&params.info_hash.0);
    request.extend_from_slice(&params.peer_id.0);
    request.extend_from_slice(&params.downloaded.to_be_bytes());
    request.extend_from_slice(&params.left.to_be_bytes());
    request.extend_from_slice(&params.uploaded.to_be_bytes());
    request.extend_from_slice(&params.event.udp_value().to_be_bytes());
    request.extend_from_slice(&0u32.to_be_bytes()); // ip address: default
    request.extend_from_slice(&key.to_be_bytes());
    #[allow(clippy::cast_possible_wrap)]
    request.extend_from_slice(&(params.num_want as i32).to_be_bytes());
    request.extend_from_slice(&params.port.to_be_bytes());
    request
}

/// Splits a reply into action, transaction id and payload.
fn split_reply(reply: &[u8]) -> Option<(u32, u32, &[u8])> {
    if reply.len() < 8 {
        return None;
    }
    let action = u32::from_be_bytes(reply[0..4].try_into().ok()?);
    let transaction_id = u32::from_be_bytes(reply[4..8].try_into().ok()?);
    Some((action, transaction_id, &reply[8..]))
}

/// Decodes the announce reply payload: interval, leechers, seeders, then
/// compact peer records.
fn parse_announce_payload(payload: &[u8]) -> Option<AnnounceResponse> {
    if payload.len() < 12 {
        return None;
    }

    let interval = u32::from_be_bytes(payload[0..4].try_into().ok()?);
    let peers = peers_from_compact(&payload[12..])?;

    Some(AnnounceResponse {
        interval: Duration::from_secs(u64::from(interval)),
        peers,
    })
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::time::Duration;

    use torrust_downloader_primitives::info_hash::InfoHash;
    use torrust_downloader_primitives::peer;

    use super::{announce_request, connect_request, parse_announce_payload, split_reply, PROTOCOL_ID};
    use crate::trackers::{AnnounceEvent, AnnounceParams};

    fn params() -> AnnounceParams {
        AnnounceParams {
            info_hash: InfoHash::from_str("9c38422213e30bff212b30c360d26f9a02136422").unwrap(),
            peer_id: peer::Id(*b"-qB00000000000000001"),
            port: 6_881,
            uploaded: 0,
            downloaded: 16_384,
            left: 311_296,
            event: AnnounceEvent::Started,
            num_want: 50,
        }
    }

    #[test]
    fn a_connect_request_is_16_bytes_with_the_magic_protocol_id() {
        let request = connect_request(0xDEAD_BEEF);

        assert_eq!(request.len(), 16);
        assert_eq!(request[..8], PROTOCOL_ID.to_be_bytes());
        assert_eq!(request[8..12], 0u32.to_be_bytes());
        assert_eq!(request[12..16], 0xDEAD_BEEF_u32.to_be_bytes());
    }

    #[test]
    fn an_announce_request_is_98_bytes_in_network_byte_order() {
        let request = announce_request(0x0102_0304_0506_0708, 7, &params());

        assert_eq!(request.len(), 98);
        assert_eq!(request[..8], 0x0102_0304_0506_0708_i64.to_be_bytes());
        assert_eq!(request[8..12], 1u32.to_be_bytes());
        assert_eq!(request[12..16], 7u32.to_be_bytes());
        assert_eq!(&request[16..36], &params().info_hash.0);
        assert_eq!(&request[36..56], b"-qB00000000000000001");
        assert_eq!(request[56..64], 16_384_u64.to_be_bytes());
        assert_eq!(request[64..72], 311_296_u64.to_be_bytes());
        assert_eq!(request[72..80], 0u64.to_be_bytes());
        // `started` is event code 2.
        assert_eq!(request[80..84], 2u32.to_be_bytes());
        assert_eq!(request[84..88], 0u32.to_be_bytes()); // default ip address
        assert_eq!(request[92..96], 50_i32.to_be_bytes());
        assert_eq!(request[96..98], 6_881_u16.to_be_bytes());
    }

    #[test]
    fn replies_shorter_than_a_header_are_ignored() {
        assert!(split_reply(&[0u8; 7]).is_none());
    }

    #[test]
    fn a_reply_splits_into_action_transaction_id_and_payload() {
        let mut reply = Vec::new();
        reply.extend_from_slice(&1u32.to_be_bytes());
        reply.extend_from_slice(&42u32.to_be_bytes());
        reply.extend_from_slice(b"rest");

        assert_eq!(split_reply(&reply), Some((1, 42, &b"rest"[..])));
    }

    #[test]
    fn an_announce_payload_decodes_interval_and_compact_peers() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1800u32.to_be_bytes()); // interval
        payload.extend_from_slice(&3u32.to_be_bytes()); // leechers
        payload.extend_from_slice(&5u32.to_be_bytes()); // seeders
        payload.extend_from_slice(b"\x01\x02\x03\x04\x1a\xe1");

        let response = parse_announce_payload(&payload).unwrap();

        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(response.peers, vec!["1.2.3.4:6881".parse().unwrap()]);
    }

    #[test]
    fn an_announce_payload_without_the_fixed_header_is_rejected() {
        assert!(parse_announce_payload(&[0u8; 11]).is_none());
    }

    mod against_a_fake_tracker {
        use std::sync::Mutex;
        use std::time::Duration;

        use tokio::net::UdpSocket;
        use url::Url;

        use super::params;
        use crate::trackers::udp::{Client, ACTION_ANNOUNCE, ACTION_CONNECT};
        use crate::trackers::TrackerError;

        /// A tracker that ignores the first `drops` datagrams, then follows
        /// the protocol.
        async fn fake_tracker(drops: usize) -> (Url, tokio::task::JoinHandle<()>) {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let port = socket.local_addr().unwrap().port();
            let url = Url::parse(&format!("udp://127.0.0.1:{port}")).unwrap();

            let handle = tokio::spawn(async move {
                let mut buffer = [0u8; 1024];
                let mut seen = 0usize;
                loop {
                    let (received, from) = socket.recv_from(&mut buffer).await.unwrap();
                    seen += 1;
                    if seen <= drops {
                        continue;
                    }

                    let frame = &buffer[..received];
                    if frame.len() >= 16 && frame[8..12] == ACTION_CONNECT.to_be_bytes() {
                        let transaction = &frame[12..16];
                        let mut reply = Vec::new();
                        reply.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
                        reply.extend_from_slice(transaction);
                        reply.extend_from_slice(&0x1122_3344_5566_7788_i64.to_be_bytes());
                        socket.send_to(&reply, from).await.unwrap();
                    } else if frame.len() >= 98 && frame[8..12] == ACTION_ANNOUNCE.to_be_bytes() {
                        let transaction = &frame[12..16];
                        let mut reply = Vec::new();
                        reply.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
                        reply.extend_from_slice(transaction);
                        reply.extend_from_slice(&900u32.to_be_bytes());
                        reply.extend_from_slice(&0u32.to_be_bytes());
                        reply.extend_from_slice(&1u32.to_be_bytes());
                        reply.extend_from_slice(b"\x01\x02\x03\x04\x1a\xe1");
                        socket.send_to(&reply, from).await.unwrap();
                    }
                }
            });

            (url, handle)
        }

        #[tokio::test]
        async fn a_lossless_tracker_answers_on_the_first_attempt() {
            let (url, tracker) = fake_tracker(0).await;

            let client = Client::connect(&url).await.unwrap();
            let response = client.announce(&params()).await.unwrap();

            assert_eq!(response.interval, Duration::from_secs(900));
            assert_eq!(response.peers, vec!["1.2.3.4:6881".parse().unwrap()]);

            tracker.abort();
        }

        #[tokio::test]
        async fn lost_connect_packets_are_retried_until_a_reply_arrives() {
            let (url, tracker) = fake_tracker(2).await;

            let mut client = Client::connect(&url).await.unwrap();
            // Shrink the schedule so the test does not wait 45 seconds.
            client.retry_base = Duration::from_millis(50);

            let response = client.announce(&params()).await.unwrap();

            assert_eq!(response.interval, Duration::from_secs(900));

            tracker.abort();
        }

        #[tokio::test]
        async fn every_connect_retry_reuses_the_same_transaction_id() {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let port = socket.local_addr().unwrap().port();
            let url = Url::parse(&format!("udp://127.0.0.1:{port}")).unwrap();

            let transactions = std::sync::Arc::new(Mutex::new(Vec::new()));
            let seen = transactions.clone();
            let tracker = tokio::spawn(async move {
                let mut buffer = [0u8; 1024];
                loop {
                    let (received, _) = socket.recv_from(&mut buffer).await.unwrap();
                    // The transaction id of a request sits at bytes 12..16.
                    if received >= 16 {
                        seen.lock().unwrap().push(buffer[12..16].to_vec());
                    }
                }
            });

            let mut client = Client::connect(&url).await.unwrap();
            client.retry_base = Duration::from_millis(5);

            // The tracker never answers; the exchange exhausts its retries.
            let error = client.announce(&params()).await.unwrap_err();
            assert!(matches!(error, TrackerError::ExhaustedRetries { .. }));

            let seen = transactions.lock().unwrap();
            assert!(seen.len() >= 2);
            assert!(seen.iter().all(|transaction| *transaction == seen[0]));

            tracker.abort();
        }
    }
}
