//! The peer supervisor job.
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::core::peers::queue::PeerQueue;
use crate::core::peers::supervisor;
use crate::core::storage::StorageError;
use crate::core::Download;

pub const PEER_SUPERVISOR_LOG_TARGET: &str = "PEER SUPERVISOR JOB";

/// It starts the supervisor that keeps peer sessions running until the
/// download completes.
#[must_use]
pub fn start_job(
    download: Arc<Download>,
    queue: Arc<PeerQueue>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<Result<(), StorageError>> {
    info!(
        target: PEER_SUPERVISOR_LOG_TARGET,
        "starting peer supervisor (up to {} peers, {} requests each)",
        download.config.max_peers,
        download.config.pipeline_depth
    );

    tokio::spawn(supervisor::run_download(download, queue, shutdown))
}
