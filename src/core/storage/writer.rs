//! Positions verified piece bytes into the target files.
//!
//! A piece is a range of the concatenated payload, so one piece can span
//! several files. The writer walks the flattened file layout of the
//! metainfo and splits every piece into per-file slices. Files are created
//! and sized up front; piece writes are followed by a data sync so a
//! completed piece survives a process crash.
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use torrust_downloader_primitives::bitfield::Bitfield;
use torrust_downloader_primitives::info_hash::InfoHash;
use tracing::{debug, info};

use super::{StorageError, STORAGE_LOG_TARGET};
use crate::shared::bit_torrent::metainfo::Metainfo;

struct OpenFile {
    file: File,
    length: u64,
    global_offset: u64,
}

/// The sole writer of the download's target files.
pub struct FileWriter {
    metainfo: Arc<Metainfo>,
    files: Vec<OpenFile>,
}

impl FileWriter {
    /// Creates (or opens) every target file under `download_dir`, sized to
    /// its final length.
    ///
    /// # Errors
    ///
    /// Will return an error if a directory or file cannot be created.
    pub async fn create(metainfo: Arc<Metainfo>, download_dir: &Path) -> Result<Self, StorageError> {
        let mut files = Vec::with_capacity(metainfo.files().len());

        for slice in metainfo.files() {
            let path = download_dir.join(&slice.relative_path);

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let file = OpenOptions::new().read(true).write(true).create(true).open(&path).await?;
            file.set_len(slice.length).await?;

            debug!(target: STORAGE_LOG_TARGET, "opened {} ({} bytes)", path.display(), slice.length);

            files.push(OpenFile {
                file,
                length: slice.length,
                global_offset: slice.global_offset,
            });
        }

        Ok(Self { metainfo, files })
    }

    /// Writes one verified piece at its global offset and syncs the touched
    /// files.
    ///
    /// # Errors
    ///
    /// Will return an error on any filesystem failure; the download cannot
    /// continue without its target files.
    ///
    /// # Panics
    ///
    /// Will panic if `bytes` is not exactly the piece length.
    pub async fn write_piece(&mut self, piece_index: usize, bytes: &[u8]) -> Result<(), StorageError> {
        assert_eq!(bytes.len() as u32, self.metainfo.length_of_piece(piece_index));

        let piece_start = piece_index as u64 * self.metainfo.piece_length();

        for range in file_ranges(&self.files, piece_start, bytes.len()) {
            let file = &mut self.files[range.file_index];
            file.file.seek(SeekFrom::Start(range.file_offset)).await?;
            file.file.write_all(&bytes[range.piece_offset..range.piece_offset + range.length]).await?;
            file.file.sync_data().await?;
        }

        debug!(target: STORAGE_LOG_TARGET, "piece {piece_index} persisted ({} bytes)", bytes.len());

        Ok(())
    }

    /// Reads one piece back from the target files.
    ///
    /// # Errors
    ///
    /// Will return an error on any filesystem failure.
    pub async fn read_piece(&mut self, piece_index: usize) -> Result<Vec<u8>, StorageError> {
        let piece_length = self.metainfo.length_of_piece(piece_index) as usize;
        let piece_start = piece_index as u64 * self.metainfo.piece_length();

        let mut bytes = vec![0u8; piece_length];

        for range in file_ranges(&self.files, piece_start, piece_length) {
            let file = &mut self.files[range.file_index];
            file.file.seek(SeekFrom::Start(range.file_offset)).await?;
            file.file.read_exact(&mut bytes[range.piece_offset..range.piece_offset + range.length]).await?;
        }

        Ok(bytes)
    }

    /// Re-verifies the pieces a resume sidecar claims complete against the
    /// bytes actually on disk. Only pieces whose SHA-1 still matches are
    /// returned.
    ///
    /// # Errors
    ///
    /// Will return an error on any filesystem failure.
    pub async fn verify_existing(&mut self, claimed: &Bitfield) -> Result<Bitfield, StorageError> {
        let mut verified = Bitfield::new(self.metainfo.piece_count());

        for piece_index in claimed.ones() {
            let bytes = self.read_piece(piece_index).await?;
            if InfoHash::sha1_of(&bytes).0 == self.metainfo.piece_hash(piece_index) {
                verified.set(piece_index);
            } else {
                debug!(target: STORAGE_LOG_TARGET, "resume piece {piece_index} no longer matches, re-downloading");
            }
        }

        info!(
            target: STORAGE_LOG_TARGET,
            "resume: {}/{} claimed pieces verified",
            verified.count_ones(),
            claimed.count_ones()
        );

        Ok(verified)
    }

    /// Flushes everything to disk at the end of the download.
    ///
    /// # Errors
    ///
    /// Will return an error on any filesystem failure.
    pub async fn sync_all(&mut self) -> Result<(), StorageError> {
        for file in &mut self.files {
            file.file.sync_all().await?;
        }
        Ok(())
    }
}

/// One contiguous part of a piece within one file.
struct FileRange {
    file_index: usize,
    file_offset: u64,
    piece_offset: usize,
    length: usize,
}

/// Splits the piece at `piece_start` of the concatenated payload into the
/// per-file ranges it overlaps.
fn file_ranges(files: &[OpenFile], piece_start: u64, piece_length: usize) -> Vec<FileRange> {
    let piece_end = piece_start + piece_length as u64;

    files
        .iter()
        .enumerate()
        .filter_map(|(file_index, file)| {
            let file_start = file.global_offset;
            let file_end = file.global_offset + file.length;

            let overlap_start = piece_start.max(file_start);
            let overlap_end = piece_end.min(file_end);
            if overlap_start >= overlap_end {
                return None;
            }

            Some(FileRange {
                file_index,
                file_offset: overlap_start - file_start,
                piece_offset: (overlap_start - piece_start) as usize,
                length: (overlap_end - overlap_start) as usize,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use torrust_downloader_contrib_bencode::{ben_bytes, ben_int, ben_list, ben_map, BencodeValue};
    use torrust_downloader_primitives::bitfield::Bitfield;
    use torrust_downloader_primitives::info_hash::InfoHash;

    use super::FileWriter;
    use crate::shared::bit_torrent::metainfo::Metainfo;

    const PIECE_LENGTH: usize = 32 * 1024;

    /// Two files of 20 KiB each with 32 KiB pieces: piece 0 spans the file
    /// boundary (the multi-file boundary scenario).
    fn boundary_metainfo(payload: &[u8]) -> Arc<Metainfo> {
        assert_eq!(payload.len(), 40 * 1024);

        let mut pieces = Vec::new();
        for chunk in payload.chunks(PIECE_LENGTH) {
            pieces.extend_from_slice(&InfoHash::sha1_of(chunk).0);
        }

        #[allow(clippy::cast_possible_wrap)]
        let bytes = (ben_map! {
            "info" => ben_map! {
                "files" => ben_list!(
                    ben_map! {
                        "length" => ben_int!(20 * 1024),
                        "path" => ben_list!(ben_bytes!("a.bin"))
                    },
                    ben_map! {
                        "length" => ben_int!(20 * 1024),
                        "path" => ben_list!(ben_bytes!("b.bin"))
                    }
                ),
                "name" => ben_bytes!("bundle"),
                "piece length" => ben_int!(PIECE_LENGTH as i64),
                "pieces" => BencodeValue::Bytes(pieces)
            }
        })
        .encode();

        Arc::new(Metainfo::from_bytes(&bytes).unwrap())
    }

    fn payload() -> Vec<u8> {
        (0..40 * 1024).map(|index| (index % 251) as u8).collect()
    }

    #[tokio::test]
    async fn a_piece_spanning_two_files_lands_in_both() {
        let payload = payload();
        let metainfo = boundary_metainfo(&payload);
        let dir = tempfile::tempdir().unwrap();

        let mut writer = FileWriter::create(metainfo, dir.path()).await.unwrap();
        writer.write_piece(0, &payload[..PIECE_LENGTH]).await.unwrap();

        // First 20 KiB of piece 0 belong to file A, the remaining 12 KiB
        // open file B.
        let a = tokio::fs::read(dir.path().join("bundle/a.bin")).await.unwrap();
        let b = tokio::fs::read(dir.path().join("bundle/b.bin")).await.unwrap();

        assert_eq!(&a[..20 * 1024], &payload[..20 * 1024]);
        assert_eq!(&b[..12 * 1024], &payload[20 * 1024..32 * 1024]);
    }

    #[tokio::test]
    async fn written_pieces_read_back_verbatim() {
        let payload = payload();
        let metainfo = boundary_metainfo(&payload);
        let dir = tempfile::tempdir().unwrap();

        let mut writer = FileWriter::create(metainfo, dir.path()).await.unwrap();
        writer.write_piece(0, &payload[..PIECE_LENGTH]).await.unwrap();
        writer.write_piece(1, &payload[PIECE_LENGTH..]).await.unwrap();

        assert_eq!(writer.read_piece(0).await.unwrap(), &payload[..PIECE_LENGTH]);
        assert_eq!(writer.read_piece(1).await.unwrap(), &payload[PIECE_LENGTH..]);
    }

    #[tokio::test]
    async fn files_are_created_at_their_final_size() {
        let payload = payload();
        let metainfo = boundary_metainfo(&payload);
        let dir = tempfile::tempdir().unwrap();

        let _writer = FileWriter::create(metainfo, dir.path()).await.unwrap();

        let a = tokio::fs::metadata(dir.path().join("bundle/a.bin")).await.unwrap();
        let b = tokio::fs::metadata(dir.path().join("bundle/b.bin")).await.unwrap();
        assert_eq!(a.len(), 20 * 1024);
        assert_eq!(b.len(), 20 * 1024);
    }

    #[tokio::test]
    async fn verification_keeps_matching_pieces_and_drops_corrupted_ones() {
        let payload = payload();
        let metainfo = boundary_metainfo(&payload);
        let dir = tempfile::tempdir().unwrap();

        let mut writer = FileWriter::create(metainfo.clone(), dir.path()).await.unwrap();
        writer.write_piece(0, &payload[..PIECE_LENGTH]).await.unwrap();
        // Piece 1 is never written: the files hold zeros there.

        let mut claimed = Bitfield::new(2);
        claimed.set(0);
        claimed.set(1);

        let verified = writer.verify_existing(&claimed).await.unwrap();

        assert!(verified.get(0));
        assert!(!verified.get(1));
    }
}
