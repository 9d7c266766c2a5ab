//! Tracker tier handling (BEP 12).
//!
//! The `announce-list` of a torrent groups tracker URLs into tiers. Within a
//! tier the URLs are tried in order and the first one that answers is
//! promoted to the front, so later cycles reach the known-good tracker
//! first. The next tier is only consulted when a whole tier fails.
use std::time::Duration;

use tracing::{debug, warn};
use url::Url;

use super::http;
use super::udp;
use super::{AnnounceParams, AnnounceResponse, TrackerError};

pub const TIERS_LOG_TARGET: &str = "TRACKER TIERS";

/// The ordered tracker tiers of one download.
pub struct TierList {
    tiers: Vec<Vec<Url>>,
    http_client: http::Client,
}

impl TierList {
    /// Builds the tier list from the metainfo `announce-list` (or the single
    /// `announce` URL, or the magnet `tr` hints). URLs that do not parse or
    /// use a scheme other than `http(s)` or `udp` are dropped with a
    /// warning.
    ///
    /// # Errors
    ///
    /// Will return an error if no usable tracker URL remains.
    pub fn new(announce_tiers: &[Vec<String>], http_timeout: Duration) -> Result<Self, TrackerError> {
        let mut tiers = Vec::with_capacity(announce_tiers.len());

        for tier in announce_tiers {
            let mut urls = Vec::with_capacity(tier.len());
            for raw in tier {
                match Url::parse(raw) {
                    Ok(url) if matches!(url.scheme(), "http" | "https" | "udp") => urls.push(url),
                    Ok(url) => {
                        warn!(target: TIERS_LOG_TARGET, "dropping tracker with unsupported scheme: {url}");
                    }
                    Err(_) => {
                        warn!(target: TIERS_LOG_TARGET, "dropping unparsable tracker URL: {raw}");
                    }
                }
            }
            if !urls.is_empty() {
                tiers.push(urls);
            }
        }

        if tiers.is_empty() {
            return Err(TrackerError::AllTiersFailed);
        }

        Ok(Self {
            tiers,
            http_client: http::Client::new(http_timeout)?,
        })
    }

    /// The number of usable tiers.
    #[must_use]
    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    /// Announces to the first tracker that answers, walking tiers in order.
    /// The successful tracker is promoted to the front of its tier.
    ///
    /// # Errors
    ///
    /// Will return an error only when every tracker of every tier failed.
    pub async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceResponse, TrackerError> {
        for tier in &mut self.tiers {
            for index in 0..tier.len() {
                let url = tier[index].clone();

                match announce_once(&self.http_client, &url, params).await {
                    Ok(response) => {
                        debug!(
                            target: TIERS_LOG_TARGET,
                            "tracker {url} returned {} peers, interval {:?}",
                            response.peers.len(),
                            response.interval
                        );
                        tier[..=index].rotate_right(1);
                        return Ok(response);
                    }
                    Err(error) => {
                        warn!(target: TIERS_LOG_TARGET, "tracker {url} failed: {error}");
                    }
                }
            }
        }

        Err(TrackerError::AllTiersFailed)
    }
}

/// One announce over whichever protocol the URL names.
async fn announce_once(http_client: &http::Client, url: &Url, params: &AnnounceParams) -> Result<AnnounceResponse, TrackerError> {
    match url.scheme() {
        "http" | "https" => http_client.announce(url, params).await,
        "udp" => {
            let client = udp::Client::connect(url).await?;
            client.announce(params).await
        }
        _ => Err(TrackerError::UnsupportedScheme { url: url.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::TierList;
    use crate::trackers::TrackerError;

    fn tier_list(tiers: &[Vec<String>]) -> Result<TierList, TrackerError> {
        TierList::new(tiers, Duration::from_secs(5))
    }

    #[test]
    fn unsupported_and_malformed_urls_are_dropped() {
        let tiers = tier_list(&[vec![
            "wss://ws.test/announce".to_string(),
            "not a url".to_string(),
            "http://ok.test/announce".to_string(),
        ]])
        .unwrap();

        assert_eq!(tiers.tier_count(), 1);
        assert_eq!(tiers.tiers[0].len(), 1);
    }

    #[test]
    fn a_torrent_without_usable_trackers_is_an_error() {
        assert!(matches!(
            tier_list(&[vec!["wss://ws.test/announce".to_string()]]),
            Err(TrackerError::AllTiersFailed)
        ));
        assert!(matches!(tier_list(&[]), Err(TrackerError::AllTiersFailed)));
    }

    #[test]
    fn tiers_keep_their_relative_order() {
        let tiers = tier_list(&[
            vec!["http://one.test/a".to_string()],
            vec!["udp://two.test:6969".to_string()],
        ])
        .unwrap();

        assert_eq!(tiers.tier_count(), 2);
        assert_eq!(tiers.tiers[0][0].as_str(), "http://one.test/a");
        assert_eq!(tiers.tiers[1][0].as_str(), "udp://two.test:6969/");
    }

    #[tokio::test]
    async fn the_working_tracker_is_promoted_to_the_front_of_its_tier() {
        // The first URL points nowhere; the second is answered by a fake
        // HTTP tracker. After one announce the order must be swapped.
        let server = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let (mut stream, _) = server.accept().await.unwrap();
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut request = [0u8; 2048];
                    let _ = stream.read(&mut request).await;
                    let body = b"d8:intervali1800e5:peers6:\x01\x02\x03\x04\x1a\xe1e";
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.write_all(body).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        // Port 9 is discard; connection fails fast.
        let mut tiers = tier_list(&[vec![
            "http://127.0.0.1:9/announce".to_string(),
            format!("http://127.0.0.1:{port}/announce"),
        ]])
        .unwrap();

        let params = crate::trackers::AnnounceParams {
            info_hash: "9c38422213e30bff212b30c360d26f9a02136422".parse().unwrap(),
            peer_id: torrust_downloader_primitives::peer::Id(*b"-qB00000000000000001"),
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: crate::trackers::AnnounceEvent::Started,
            num_want: 50,
        };

        let response = tiers.announce(&params).await.unwrap();

        assert_eq!(response.peers.len(), 1);
        assert_eq!(tiers.tiers[0][0].port(), Some(port));
    }
}
