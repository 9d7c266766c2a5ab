//! The resume sidecar.
//!
//! A small JSON file next to the download recording the info-hash and the
//! bitfield of complete pieces. The info-hash makes the sidecar
//! self-describing: loading it for a different torrent is rejected instead
//! of seeding bogus pieces. Loaded pieces are still re-verified against the
//! bytes on disk before they count.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use torrust_downloader_primitives::bitfield::Bitfield;
use torrust_downloader_primitives::info_hash::InfoHash;
use tracing::debug;

use super::{StorageError, STORAGE_LOG_TARGET};

/// The serialized state of a partially complete download.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResumeData {
    /// The torrent this sidecar belongs to, as a hex string.
    info_hash: InfoHash,
    /// Number of pieces, to validate the bitfield length.
    piece_count: usize,
    /// MSB-first bitfield of complete pieces.
    bitfield: Vec<u8>,
}

impl ResumeData {
    #[must_use]
    pub fn new(info_hash: InfoHash, completed: &Bitfield) -> Self {
        Self {
            info_hash,
            piece_count: completed.len(),
            bitfield: completed.as_bytes().to_vec(),
        }
    }

    /// The sidecar path for a download: `<name>.resume.json` beside it.
    #[must_use]
    pub fn path_for(download_dir: &Path, name: &str) -> PathBuf {
        download_dir.join(format!("{name}.resume.json"))
    }

    /// Writes the sidecar. Failures are not fatal for the download, only
    /// for resumability.
    ///
    /// # Errors
    ///
    /// Will return an error if the file cannot be written.
    pub async fn save(&self, path: &Path) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, json).await?;

        debug!(target: STORAGE_LOG_TARGET, "resume sidecar saved to {}", path.display());

        Ok(())
    }

    /// Loads the sidecar and extracts the claimed bitfield, validating that
    /// it belongs to this torrent.
    ///
    /// Returns `Ok(None)` when no sidecar exists.
    ///
    /// # Errors
    ///
    /// Will return an error if the sidecar cannot be parsed, belongs to a
    /// different torrent, or its bitfield does not cover the piece count.
    pub async fn load(path: &Path, info_hash: InfoHash, piece_count: usize) -> Result<Option<Bitfield>, StorageError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        let data: ResumeData = serde_json::from_slice(&bytes)?;

        if data.info_hash != info_hash || data.piece_count != piece_count {
            return Err(StorageError::ForeignSidecar);
        }

        let bitfield = Bitfield::from_bytes(&data.bitfield, piece_count).ok_or(StorageError::ForeignSidecar)?;

        Ok(Some(bitfield))
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use torrust_downloader_primitives::bitfield::Bitfield;
    use torrust_downloader_primitives::info_hash::InfoHash;

    use super::ResumeData;
    use crate::core::storage::StorageError;

    fn info_hash() -> InfoHash {
        InfoHash::from_str("5452869be36f9f3350ccee6b4544e7e76caaadab").unwrap()
    }

    #[tokio::test]
    async fn a_sidecar_round_trips_the_completed_bitfield() {
        let dir = tempfile::tempdir().unwrap();
        let path = ResumeData::path_for(dir.path(), "file.bin");

        let mut completed = Bitfield::new(10);
        completed.set(0);
        completed.set(9);

        ResumeData::new(info_hash(), &completed).save(&path).await.unwrap();
        let loaded = ResumeData::load(&path, info_hash(), 10).await.unwrap().unwrap();

        assert_eq!(loaded, completed);
    }

    #[tokio::test]
    async fn a_missing_sidecar_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = ResumeData::path_for(dir.path(), "file.bin");

        assert!(ResumeData::load(&path, info_hash(), 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn a_sidecar_for_another_torrent_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = ResumeData::path_for(dir.path(), "file.bin");

        ResumeData::new(info_hash(), &Bitfield::new(10)).save(&path).await.unwrap();

        let other = InfoHash::from_str("ffffffffffffffffffffffffffffffffffffffff").unwrap();
        assert!(matches!(
            ResumeData::load(&path, other, 10).await.unwrap_err(),
            StorageError::ForeignSidecar
        ));

        // A matching hash with a different piece count is just as foreign.
        assert!(matches!(
            ResumeData::load(&path, info_hash(), 12).await.unwrap_err(),
            StorageError::ForeignSidecar
        ));
    }

    #[tokio::test]
    async fn a_garbled_sidecar_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = ResumeData::path_for(dir.path(), "file.bin");

        tokio::fs::write(&path, b"not json").await.unwrap();

        assert!(matches!(
            ResumeData::load(&path, info_hash(), 10).await.unwrap_err(),
            StorageError::MalformedSidecar(_)
        ));
    }
}
