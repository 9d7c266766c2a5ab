//! The tracker announce cycle job.
//!
//! One task per download walks the tracker tiers (BEP 12) on the interval
//! returned by the last successful announce, feeding every returned peer
//! endpoint into the bounded peer queue. The first announce carries the
//! `started` event; the farewell announce on the way out carries
//! `completed` when the download finished and `stopped` otherwise.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use torrust_downloader_configuration::Configuration;
use torrust_downloader_primitives::info_hash::InfoHash;
use torrust_downloader_primitives::peer;
use tracing::{debug, info, warn};

use crate::core::peers::queue::PeerQueue;
use crate::core::Download;
use crate::trackers::tiers::TierList;
use crate::trackers::{AnnounceEvent, AnnounceParams};

pub const TRACKER_CYCLE_LOG_TARGET: &str = "TRACKER CYCLE";

/// How long the farewell announce may take before it is abandoned.
const FAREWELL_TIMEOUT: Duration = Duration::from_secs(5);

/// What the announce cycle reports about download progress. During a magnet
/// bootstrap nothing is known yet.
#[derive(Clone)]
pub enum Progress {
    Download(Arc<Download>),
    Unknown,
}

impl Progress {
    fn left(&self) -> u64 {
        match self {
            Self::Download(download) => download.registry.left_bytes(),
            Self::Unknown => 0,
        }
    }

    fn downloaded(&self) -> u64 {
        match self {
            Self::Download(download) => download.metainfo.total_length() - download.registry.left_bytes(),
            Self::Unknown => 0,
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            Self::Download(download) => download.is_complete(),
            Self::Unknown => false,
        }
    }
}

/// Everything the cycle needs to build announce requests.
#[derive(Clone)]
pub struct AnnounceContext {
    pub info_hash: InfoHash,
    pub peer_id: peer::Id,
    pub config: Arc<Configuration>,
    pub progress: Progress,
}

impl AnnounceContext {
    fn params(&self, event: AnnounceEvent) -> AnnounceParams {
        AnnounceParams {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.config.port,
            uploaded: 0,
            downloaded: self.progress.downloaded(),
            left: self.progress.left(),
            event,
            num_want: self.config.num_want,
        }
    }
}

/// It starts the announce cycle job.
#[must_use]
pub fn start_job(
    tiers: TierList,
    context: AnnounceContext,
    queue: Arc<PeerQueue>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    info!(target: TRACKER_CYCLE_LOG_TARGET, "starting announce cycle over {} tier(s)", tiers.tier_count());

    tokio::spawn(run(tiers, context, queue, shutdown))
}

async fn run(mut tiers: TierList, context: AnnounceContext, queue: Arc<PeerQueue>, mut shutdown: watch::Receiver<bool>) {
    let mut cycle = 0u64;
    let mut event = AnnounceEvent::Started;

    'cycles: loop {
        let interval = match tiers.announce(&context.params(event)).await {
            Ok(response) => {
                debug!(
                    target: TRACKER_CYCLE_LOG_TARGET,
                    "cycle {cycle}: {} peer(s), next announce in {:?}",
                    response.peers.len(),
                    response.interval
                );

                for endpoint in response.peers {
                    tokio::select! {
                        () = queue.push(endpoint, cycle) => {}
                        _ = shutdown.changed() => break 'cycles,
                    }
                }

                event = AnnounceEvent::None;
                response.interval.max(context.config.min_announce_interval)
            }
            Err(error) => {
                warn!(target: TRACKER_CYCLE_LOG_TARGET, "cycle {cycle} failed: {error}");
                context.config.min_announce_interval
            }
        };

        cycle += 1;

        tokio::select! {
            () = time::sleep(interval) => {}
            _ = shutdown.changed() => break 'cycles,
        }
    }

    farewell(&mut tiers, &context).await;
}

/// The final announce: `completed` when every piece arrived, `stopped`
/// otherwise. Best effort only.
async fn farewell(tiers: &mut TierList, context: &AnnounceContext) {
    let event = if context.progress.is_finished() {
        AnnounceEvent::Completed
    } else {
        AnnounceEvent::Stopped
    };

    debug!(target: TRACKER_CYCLE_LOG_TARGET, "sending farewell announce ({event:?})");

    let _ = time::timeout(FAREWELL_TIMEOUT, tiers.announce(&context.params(event))).await;
}
