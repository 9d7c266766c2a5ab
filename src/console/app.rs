//! Torrust Downloader command-line application.
//!
//! Examples:
//!
//! Downloading from a torrent file:
//!
//! ```text
//! cargo run -- --file ubuntu.torrent --folder ~/Downloads
//! ```
//!
//! Downloading from a magnet URI, resuming a previous run:
//!
//! ```text
//! cargo run -- --magnet "magnet:?xt=urn:btih:..." --resume
//! ```
//!
//! The process exits with code `0` only after every piece was downloaded,
//! SHA-1 verified and written to the target files.
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgGroup, Parser};
use torrust_downloader_configuration::{Configuration, DEFAULT_MAX_PEERS, DEFAULT_PIPELINE_DEPTH};

use crate::app::{self, Input};
use crate::bootstrap;
use crate::shared::bit_torrent::magnet::Magnet;
use crate::shared::bit_torrent::metainfo::Metainfo;

#[derive(Parser, Debug)]
#[command(author, version, about = "A download-only BitTorrent client.", long_about = None)]
#[command(group(ArgGroup::new("input").required(true).args(["file", "magnet"])))]
struct Args {
    /// Path of the torrent metainfo file to download.
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,

    /// Magnet URI to download. The metadata is fetched from peers first.
    #[arg(long, value_name = "URI")]
    magnet: Option<String>,

    /// Directory the downloaded files are placed in.
    #[arg(long, value_name = "PATH", default_value = ".")]
    folder: PathBuf,

    /// Load the resume sidecar and re-verify pieces already on disk.
    #[arg(long)]
    resume: bool,

    /// Maximum number of concurrently connected peers.
    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_PEERS)]
    peers: usize,

    /// Maximum number of outstanding block requests per peer.
    #[arg(long, value_name = "N", default_value_t = DEFAULT_PIPELINE_DEPTH)]
    requests: usize,

    /// Write logs to this file instead of stderr.
    #[arg(long, value_name = "PATH")]
    log: Option<PathBuf>,

    /// Logging level: off, error, warn, info, debug or trace.
    #[arg(long, value_name = "LEVEL", env = "TORRUST_DOWNLOADER_LOG_LEVEL")]
    log_level: Option<String>,
}

/// Parses the command line and runs the download.
///
/// # Errors
///
/// Will return an error for unreadable input, malformed torrents or magnet
/// URIs, and any failure that prevented a fully verified download.
pub async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Arc::new(configuration(&args));
    bootstrap::logging::setup(&config);

    let input = input(&args).await?;

    app::start(config, input).await
}

fn configuration(args: &Args) -> Configuration {
    Configuration {
        download_dir: args.folder.clone(),
        max_peers: args.peers,
        pipeline_depth: args.requests,
        resume: args.resume,
        log_level: args.log_level.clone(),
        log_file: args.log.clone(),
        ..Default::default()
    }
}

async fn input(args: &Args) -> anyhow::Result<Input> {
    if let Some(path) = &args.file {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read the torrent file {}", path.display()))?;
        let metainfo = Metainfo::from_bytes(&bytes).with_context(|| format!("{} is not a valid torrent file", path.display()))?;

        return Ok(Input::Torrent(Arc::new(metainfo)));
    }

    let uri = args.magnet.as_deref().expect("clap enforces one input");
    let magnet = Magnet::from_str(uri).context("the magnet URI is malformed")?;

    Ok(Input::Magnet(magnet))
}
