//! The peer supervisor.
//!
//! Keeps up to the configured number of sessions alive, replacing every
//! finished session with a fresh endpoint from the queue. Session failures
//! are normal (peers vanish, violate the protocol, or serve corrupt data)
//! and never abort the download; only storage failures do.
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use torrust_downloader_configuration::Configuration;
use torrust_downloader_primitives::info_hash::InfoHash;
use torrust_downloader_primitives::peer;
use tracing::{debug, info, warn};

use super::queue::PeerQueue;
use super::session::{MetadataSession, Session, SessionError};
use crate::core::pieces::SessionId;
use crate::core::{Download, MetadataCollector};

pub const SUPERVISOR_LOG_TARGET: &str = "PEER SUPERVISOR";

type FinishedSession = (SessionId, SocketAddr, Result<(), SessionError>);

/// Runs the download phase: keeps sessions alive until every piece is
/// persisted or shutdown is requested.
///
/// # Errors
///
/// Will return an error only on a storage failure, which makes finishing
/// the download impossible.
pub async fn run_download(
    download: Arc<Download>,
    queue: Arc<PeerQueue>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), crate::core::storage::StorageError> {
    let mut completion = download.subscribe_completion();
    if *completion.borrow() {
        info!(target: SUPERVISOR_LOG_TARGET, "every piece was already verified on disk");
        return Ok(());
    }

    let mut sessions: JoinSet<FinishedSession> = JoinSet::new();
    let mut next_id = 0u64;
    // Endpoints that violated the protocol or served corrupt data are not
    // retried within this run, even when a tracker re-announces them.
    let mut banned: HashSet<SocketAddr> = HashSet::new();

    loop {
        tokio::select! {
            endpoint = queue.pop(), if sessions.len() < download.config.max_peers => {
                let Some(endpoint) = endpoint else {
                    drain(&mut sessions).await;
                    return Ok(());
                };
                if banned.contains(&endpoint) {
                    debug!(target: SUPERVISOR_LOG_TARGET, "skipping banned endpoint {endpoint}");
                    continue;
                }

                next_id += 1;
                let id = SessionId(next_id);
                let session = Session::new(id, endpoint, download.clone(), shutdown.clone());
                debug!(target: SUPERVISOR_LOG_TARGET, "launching {id} for {endpoint} ({} active)", sessions.len());
                sessions.spawn(async move { (id, endpoint, session.run().await) });
            }
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                match log_finished(finished) {
                    Finished::StorageFailure(storage_error) => {
                        drain(&mut sessions).await;
                        return Err(storage_error);
                    }
                    Finished::Misbehaved(endpoint) => {
                        banned.insert(endpoint);
                    }
                    Finished::Normal => (),
                }
            }
            _ = completion.changed() => {
                info!(target: SUPERVISOR_LOG_TARGET, "download complete, closing {} sessions", sessions.len());
                drain(&mut sessions).await;
                return Ok(());
            }
            _ = shutdown.changed() => {
                debug!(target: SUPERVISOR_LOG_TARGET, "shutdown, closing {} sessions", sessions.len());
                drain(&mut sessions).await;
                return Ok(());
            }
        }
    }
}

/// Runs the magnet bootstrap phase: sessions only exchange metadata.
/// Returns the verified `info` bytes, or `None` when shut down first.
pub async fn run_metadata(
    info_hash: InfoHash,
    peer_id: peer::Id,
    config: Arc<Configuration>,
    queue: Arc<PeerQueue>,
    mut shutdown: watch::Receiver<bool>,
) -> Option<Vec<u8>> {
    let collector = Arc::new(MetadataCollector::default());
    let mut collected = collector.subscribe();

    let mut sessions: JoinSet<FinishedSession> = JoinSet::new();
    let mut next_id = 0u64;

    loop {
        tokio::select! {
            endpoint = queue.pop(), if sessions.len() < config.max_peers => {
                let Some(endpoint) = endpoint else {
                    drain(&mut sessions).await;
                    return None;
                };

                next_id += 1;
                let id = SessionId(next_id);
                let session = MetadataSession {
                    id,
                    endpoint,
                    info_hash,
                    peer_id,
                    config: config.clone(),
                    collector: collector.clone(),
                    shutdown: shutdown.clone(),
                };
                debug!(target: SUPERVISOR_LOG_TARGET, "launching metadata {id} for {endpoint}");
                sessions.spawn(async move { (id, endpoint, session.run().await) });
            }
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                log_finished(finished);
            }
            result = collected.changed() => {
                drain(&mut sessions).await;
                if result.is_err() {
                    return None;
                }
                let info_bytes = collected.borrow().clone();
                return info_bytes;
            }
            _ = shutdown.changed() => {
                drain(&mut sessions).await;
                return None;
            }
        }
    }
}

/// How a finished session should be treated by the supervisor.
enum Finished {
    Normal,
    /// The endpoint violated the protocol or served corrupt data.
    Misbehaved(SocketAddr),
    /// The download cannot continue.
    StorageFailure(crate::core::storage::StorageError),
}

fn log_finished(finished: Result<FinishedSession, tokio::task::JoinError>) -> Finished {
    match finished {
        Ok((id, endpoint, Ok(()))) => {
            debug!(target: SUPERVISOR_LOG_TARGET, "{id} to {endpoint} exited");
            Finished::Normal
        }
        Ok((id, endpoint, Err(SessionError::Storage(storage_error)))) => {
            warn!(target: SUPERVISOR_LOG_TARGET, "{id} to {endpoint} hit a storage failure: {storage_error}");
            Finished::StorageFailure(storage_error)
        }
        Ok((id, endpoint, Err(error))) => {
            debug!(target: SUPERVISOR_LOG_TARGET, "{id} to {endpoint} dropped: {error}");
            match error {
                SessionError::Wire(_) | SessionError::BadBlock(_) | SessionError::CorruptPiece => {
                    Finished::Misbehaved(endpoint)
                }
                _ => Finished::Normal,
            }
        }
        Err(join_error) => {
            warn!(target: SUPERVISOR_LOG_TARGET, "session task panicked: {join_error}");
            Finished::Normal
        }
    }
}

/// Cancels every remaining session and waits for their release paths.
async fn drain(sessions: &mut JoinSet<FinishedSession>) {
    sessions.abort_all();
    while sessions.join_next().await.is_some() {}
}
