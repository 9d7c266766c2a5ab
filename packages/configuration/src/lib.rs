//! Configuration data structures for the Torrust Downloader.
//!
//! The configuration is populated by the command-line front end; there is no
//! configuration file. Every field has a default so that tests and embedders
//! can start from [`Configuration::default`] and override what they need.
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default maximum number of concurrently connected peers.
pub const DEFAULT_MAX_PEERS: usize = 50;

/// Default maximum number of outstanding block requests per peer.
pub const DEFAULT_PIPELINE_DEPTH: usize = 50;

/// Default number of peers requested from a tracker per announce.
pub const DEFAULT_NUM_WANT: u32 = 50;

/// The port reported to trackers. The downloader does not accept inbound
/// connections, but the announce request requires a port.
pub const DEFAULT_PORT: u16 = 6881;

/// Core configuration of a download run.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Configuration {
    /// Directory the downloaded files are placed in.
    pub download_dir: PathBuf,

    /// Maximum number of concurrently connected peers.
    pub max_peers: usize,

    /// Maximum number of outstanding block requests per peer session.
    pub pipeline_depth: usize,

    /// Number of peers requested from a tracker per announce.
    pub num_want: u32,

    /// The port reported to trackers in announce requests.
    pub port: u16,

    /// Whether to load the resume sidecar and re-verify pieces already on
    /// disk before downloading.
    pub resume: bool,

    /// Logging level. Possible values are: `Off`, `Error`, `Warn`, `Info`,
    /// `Debug` and `Trace`. Default is `Info`.
    pub log_level: Option<String>,

    /// Log file path. Logs go to stderr when absent.
    pub log_file: Option<PathBuf>,

    /// Capacity of the peer endpoint queue. Tracker cycles wait when the
    /// queue is full instead of dropping endpoints.
    pub peer_queue_capacity: usize,

    /// Timeout for opening a TCP connection to a peer.
    pub peer_connect_timeout: Duration,

    /// A peer that sends no bytes for this long is disconnected.
    pub peer_idle_timeout: Duration,

    /// A keepalive is sent after this much outbound silence.
    pub keepalive_interval: Duration,

    /// How long a choked session keeps its reservations before handing them
    /// back to the piece registry.
    pub choke_grace: Duration,

    /// Timeout for a single HTTP announce request.
    pub http_announce_timeout: Duration,

    /// Lower clamp applied to the announce interval returned by trackers.
    pub min_announce_interval: Duration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            max_peers: DEFAULT_MAX_PEERS,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            num_want: DEFAULT_NUM_WANT,
            port: DEFAULT_PORT,
            resume: false,
            log_level: None,
            log_file: None,
            peer_queue_capacity: 512,
            peer_connect_timeout: Duration::from_secs(10),
            peer_idle_timeout: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(120),
            choke_grace: Duration::from_secs(10),
            http_announce_timeout: Duration::from_secs(30),
            min_announce_interval: Duration::from_secs(60),
        }
    }
}

/// Errors that can occur validating a [`Configuration`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("max_peers must be greater than zero")]
    NoPeersAllowed,

    #[error("pipeline_depth must be greater than zero")]
    EmptyPipeline,

    #[error("peer_queue_capacity must be greater than zero")]
    UnboundedQueue,
}

impl Configuration {
    /// Checks the configured bounds.
    ///
    /// # Errors
    ///
    /// Will return an error if any bound would make the download unable to
    /// progress.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_peers == 0 {
            return Err(ValidationError::NoPeersAllowed);
        }
        if self.pipeline_depth == 0 {
            return Err(ValidationError::EmptyPipeline);
        }
        if self.peer_queue_capacity == 0 {
            return Err(ValidationError::UnboundedQueue);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Configuration, ValidationError};

    #[test]
    fn default_configuration_is_valid() {
        assert!(Configuration::default().validate().is_ok());
    }

    #[test]
    fn configuration_without_peers_is_rejected() {
        let configuration = Configuration {
            max_peers: 0,
            ..Default::default()
        };

        assert_eq!(configuration.validate(), Err(ValidationError::NoPeersAllowed));
    }

    #[test]
    fn configuration_without_request_pipeline_is_rejected() {
        let configuration = Configuration {
            pipeline_depth: 0,
            ..Default::default()
        };

        assert_eq!(configuration.validate(), Err(ValidationError::EmptyPipeline));
    }

    #[test]
    fn configuration_with_an_unbounded_peer_queue_is_rejected() {
        let configuration = Configuration {
            peer_queue_capacity: 0,
            ..Default::default()
        };

        assert_eq!(configuration.validate(), Err(ValidationError::UnboundedQueue));
    }
}
