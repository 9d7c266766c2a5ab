//! The download domain.
//!
//! A [`Download`] is the composition root of one torrent download: the
//! immutable metainfo, the piece registry deciding what to fetch, the file
//! writer persisting verified pieces, and the hub of live peer sessions.
//! There is no global state; everything hangs off this struct.
pub mod peers;
pub mod pieces;
pub mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use torrust_downloader_configuration::Configuration;
use torrust_downloader_primitives::peer;
use tracing::info;

use self::peers::Peers;
use self::pieces::registry::PieceRegistry;
use self::storage::resume::ResumeData;
use self::storage::writer::FileWriter;
use self::storage::StorageError;
use crate::shared::bit_torrent::metainfo::Metainfo;

pub const CORE_LOG_TARGET: &str = "DOWNLOAD";

/// One torrent download: registry, writer, peer hub and metainfo by
/// composition.
pub struct Download {
    pub metainfo: Arc<Metainfo>,
    pub registry: PieceRegistry,
    pub peers: Peers,
    pub config: Arc<Configuration>,
    pub peer_id: peer::Id,
    writer: tokio::sync::Mutex<FileWriter>,
    resume_path: PathBuf,
    completion: watch::Sender<bool>,
}

impl Download {
    /// Builds the download state: opens the target files, loads and
    /// re-verifies the resume sidecar when requested, and seeds the
    /// registry.
    ///
    /// # Errors
    ///
    /// Will return an error if the target files cannot be created or an
    /// existing sidecar belongs to a different torrent.
    pub async fn new(metainfo: Arc<Metainfo>, config: Arc<Configuration>, peer_id: peer::Id) -> Result<Arc<Self>, StorageError> {
        let registry = PieceRegistry::new(metainfo.clone());
        let mut writer = FileWriter::create(metainfo.clone(), &config.download_dir).await?;

        let resume_path = ResumeData::path_for(&config.download_dir, metainfo.name());

        if config.resume {
            if let Some(claimed) = ResumeData::load(&resume_path, metainfo.info_hash(), metainfo.piece_count()).await? {
                let verified = writer.verify_existing(&claimed).await?;
                registry.seed_complete(&verified);
            }
        }

        let already_complete = registry.is_complete();
        let (completion, _) = watch::channel(already_complete);

        Ok(Arc::new(Self {
            metainfo,
            registry,
            peers: Peers::default(),
            config,
            peer_id,
            writer: tokio::sync::Mutex::new(writer),
            resume_path,
            completion,
        }))
    }

    /// A receiver that flips to `true` once every piece is persisted.
    #[must_use]
    pub fn subscribe_completion(&self) -> watch::Receiver<bool> {
        self.completion.subscribe()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        *self.completion.subscribe().borrow()
    }

    /// Persists a verified piece, confirms it with the registry and updates
    /// the resume sidecar. Returns `true` when this was the last piece.
    ///
    /// # Errors
    ///
    /// Will return an error on filesystem failure, which aborts the whole
    /// download.
    pub async fn persist_piece(&self, piece_index: usize, bytes: &[u8]) -> Result<bool, StorageError> {
        {
            let mut writer = self.writer.lock().await;
            writer.write_piece(piece_index, bytes).await?;
        }

        let all_complete = self.registry.confirm_persisted(piece_index);

        info!(
            target: CORE_LOG_TARGET,
            "piece {piece_index} complete ({}/{})",
            self.registry.complete_count(),
            self.metainfo.piece_count()
        );

        // The sidecar is tiny; rewrite it after every piece so a crash
        // loses at most the in-flight pieces.
        ResumeData::new(self.metainfo.info_hash(), &self.registry.completed_pieces())
            .save(&self.resume_path)
            .await?;

        if all_complete {
            self.writer.lock().await.sync_all().await?;
            let _ = self.completion.send(true);
            info!(target: CORE_LOG_TARGET, "download of {} complete", self.metainfo.name());
        }

        Ok(all_complete)
    }
}

/// Collects the `info` dictionary fetched from peers during a magnet
/// bootstrap. The first session to assemble and verify the metadata wins.
#[derive(Debug)]
pub struct MetadataCollector {
    sender: watch::Sender<Option<Vec<u8>>>,
}

impl Default for MetadataCollector {
    fn default() -> Self {
        let (sender, _) = watch::channel(None);
        Self { sender }
    }
}

impl MetadataCollector {
    /// Stores the verified metadata bytes. Later calls are ignored.
    pub fn complete(&self, info_bytes: Vec<u8>) {
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(info_bytes);
                true
            }
        });
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.sender.subscribe().borrow().is_some()
    }

    /// A receiver that yields the metadata bytes once some session fetched
    /// them.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Vec<u8>>> {
        self.sender.subscribe()
    }
}
