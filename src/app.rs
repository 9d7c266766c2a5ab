//! Torrust Downloader application.
//!
//! There is no long-lived application process: [`start`] builds the
//! download domain and launches the concurrent jobs, then waits for
//! whichever comes first, the download completing or the user
//! interrupting.
//!
//! The jobs are:
//!
//! - The tracker announce cycle ([`crate::bootstrap::jobs::tracker_cycle`]),
//!   feeding peer endpoints into the bounded queue.
//! - The peer supervisor ([`crate::bootstrap::jobs::peer_supervisor`]),
//!   keeping sessions alive until every piece is verified and persisted.
//!
//! A magnet input adds a bootstrap phase in front: the same queue and
//! announce machinery drive metadata-only sessions until one of them hands
//! back the verified `info` dictionary, which is then used to build the
//! metainfo for the download proper.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tokio::sync::watch;
use tokio::time;
use torrust_downloader_configuration::Configuration;
use torrust_downloader_primitives::peer;
use tracing::info;

use crate::bootstrap::jobs::tracker_cycle::{self, AnnounceContext, Progress};
use crate::bootstrap::jobs::peer_supervisor;
use crate::core::peers::queue::PeerQueue;
use crate::core::peers::supervisor;
use crate::core::Download;
use crate::shared::bit_torrent::magnet::Magnet;
use crate::shared::bit_torrent::metainfo::Metainfo;
use crate::trackers::tiers::TierList;

/// How long teardown waits for the farewell announce.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// What the front end hands to [`start`].
pub enum Input {
    Torrent(Arc<Metainfo>),
    Magnet(Magnet),
}

/// Runs one download to completion.
///
/// # Errors
///
/// Will return an error on invalid configuration, unusable input, storage
/// failure, or interruption; a clean, fully verified download returns
/// `Ok`.
pub async fn start(config: Arc<Configuration>, input: Input) -> anyhow::Result<()> {
    config.validate().context("invalid configuration")?;

    let peer_id = peer::Id::random();

    let metainfo = match input {
        Input::Torrent(metainfo) => metainfo,
        Input::Magnet(magnet) => bootstrap_magnet(&config, &magnet, peer_id).await?,
    };

    info!(
        "downloading {}: {} bytes in {} pieces of {} bytes",
        metainfo.name(),
        metainfo.total_length(),
        metainfo.piece_count(),
        metainfo.piece_length(),
    );

    let download = Download::new(metainfo.clone(), config.clone(), peer_id)
        .await
        .context("cannot prepare the target files")?;

    let tiers = TierList::new(metainfo.announce_tiers(), config.http_announce_timeout).context("no usable trackers")?;

    let (shutdown, shutdown_receiver) = watch::channel(false);
    let queue = Arc::new(PeerQueue::new(config.peer_queue_capacity));

    let announce_job = tracker_cycle::start_job(
        tiers,
        AnnounceContext {
            info_hash: metainfo.info_hash(),
            peer_id,
            config: config.clone(),
            progress: Progress::Download(download.clone()),
        },
        queue.clone(),
        shutdown_receiver.clone(),
    );
    let mut supervisor_job = peer_supervisor::start_job(download.clone(), queue, shutdown_receiver);

    let result = tokio::select! {
        outcome = &mut supervisor_job => match outcome {
            Ok(Ok(())) if download.is_complete() => Ok(()),
            Ok(Ok(())) => Err(anyhow!("the download ended before completing")),
            Ok(Err(storage_error)) => Err(storage_error).context("storage failure, aborting"),
            Err(join_error) => Err(anyhow!("the peer supervisor panicked: {join_error}")),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            // Give the sessions their release paths before exiting.
            let _ = shutdown.send(true);
            let _ = time::timeout(TEARDOWN_TIMEOUT, &mut supervisor_job).await;
            Err(anyhow!("interrupted before the download completed"))
        }
    };

    // The announce job sends its farewell (`completed` or `stopped`) on
    // shutdown.
    let _ = shutdown.send(true);
    let _ = time::timeout(TEARDOWN_TIMEOUT, announce_job).await;

    if result.is_ok() {
        info!("{} downloaded and verified", metainfo.name());
    }

    result
}

/// The magnet bootstrap phase: announce with the magnet's trackers and run
/// metadata-only sessions until the `info` dictionary is recovered and
/// verified against the magnet's info-hash.
async fn bootstrap_magnet(config: &Arc<Configuration>, magnet: &Magnet, peer_id: peer::Id) -> anyhow::Result<Arc<Metainfo>> {
    if magnet.trackers.is_empty() {
        bail!("the magnet URI carries no trackers and DHT is not supported");
    }

    info!(
        "fetching metadata for {} from up to {} tracker(s)",
        magnet.info_hash,
        magnet.trackers.len()
    );

    let announce_tiers: Vec<Vec<String>> = magnet.trackers.iter().map(|url| vec![url.clone()]).collect();
    let tiers = TierList::new(&announce_tiers, config.http_announce_timeout).context("no usable trackers in the magnet URI")?;

    let (shutdown, shutdown_receiver) = watch::channel(false);
    let queue = Arc::new(PeerQueue::new(config.peer_queue_capacity));

    let announce_job = tracker_cycle::start_job(
        tiers,
        AnnounceContext {
            info_hash: magnet.info_hash,
            peer_id,
            config: config.clone(),
            progress: Progress::Unknown,
        },
        queue.clone(),
        shutdown_receiver.clone(),
    );

    let info_bytes = tokio::select! {
        info_bytes = supervisor::run_metadata(magnet.info_hash, peer_id, config.clone(), queue, shutdown_receiver) => info_bytes,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            None
        }
    };

    let _ = shutdown.send(true);
    let _ = time::timeout(TEARDOWN_TIMEOUT, announce_job).await;

    let info_bytes = info_bytes.ok_or_else(|| anyhow!("interrupted before the metadata could be fetched"))?;

    let metainfo = Metainfo::from_info_bytes(&info_bytes, &magnet.trackers).context("peers served an unusable info dictionary")?;

    info!("metadata complete: {} ({} pieces)", metainfo.name(), metainfo.piece_count());

    Ok(Arc::new(metainfo))
}
