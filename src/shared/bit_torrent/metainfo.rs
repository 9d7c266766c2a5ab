//! The parsed metainfo (`.torrent`) file.
//!
//! See [BEP 3. The `BitTorrent` Protocol Specification](https://www.bittorrent.org/beps/bep_0003.html)
//! for the official format. The model is immutable after construction and is
//! shared by reference for the whole download.
//!
//! The info-hash is the SHA-1 digest of the `info` dictionary *as it appears
//! on the wire*, so parsing keeps the verbatim byte range of that sub-value
//! instead of re-encoding it.
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use torrust_downloader_contrib_bencode::{BencodeParseError, BencodeRef};
use torrust_downloader_primitives::info_hash::InfoHash;
use torrust_downloader_primitives::BLOCK_SIZE;

/// A single target file within the download, in the flattened layout.
///
/// Single-file torrents are the degenerate case with one entry at the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSlice {
    /// Path relative to the download directory.
    pub relative_path: PathBuf,
    /// Length of the file in bytes.
    pub length: u64,
    /// Offset of the first byte of this file within the concatenated
    /// payload of the torrent.
    pub global_offset: u64,
}

/// The immutable description of a torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    info_hash: InfoHash,
    name: String,
    piece_length: u64,
    pieces: Vec<[u8; 20]>,
    files: Vec<FileSlice>,
    total_length: u64,
    announce_tiers: Vec<Vec<String>>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetainfoError {
    #[error("invalid bencode: {0}")]
    InvalidBencode(#[from] BencodeParseError),

    #[error("the torrent is missing the required key `{key}`")]
    MissingKey { key: &'static str },

    #[error("the torrent key `{key}` has the wrong type or an invalid value")]
    InvalidKey { key: &'static str },

    #[error("`piece length` must be a positive integer")]
    InvalidPieceLength,

    #[error("`pieces` must be a concatenation of 20-byte SHA-1 digests")]
    InvalidPiecesLength,

    #[error("the number of pieces does not cover the total length of the files")]
    InconsistentTotalLength,

    #[error("the torrent declares no files")]
    NoFiles,

    #[error("the file path {path:?} is not a safe relative path")]
    UnsafeFilePath { path: String },
}

impl Metainfo {
    /// Parses a whole `.torrent` file.
    ///
    /// # Errors
    ///
    /// Will return an error if the bytes are not strictly valid bencode or
    /// the metainfo shape is invalid.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetainfoError> {
        let root = BencodeRef::decode(bytes)?;

        let info = root.lookup(b"info").ok_or(MetainfoError::MissingKey { key: "info" })?;

        let announce_tiers = announce_tiers(&root);

        Self::from_info(info, announce_tiers)
    }

    /// Builds a metainfo from the raw `info` dictionary bytes recovered by
    /// the magnet metadata exchange, with the trackers the magnet carried.
    ///
    /// # Errors
    ///
    /// Will return an error if the bytes are not strictly valid bencode or
    /// the info dictionary shape is invalid.
    pub fn from_info_bytes(info_bytes: &[u8], trackers: &[String]) -> Result<Self, MetainfoError> {
        let info = BencodeRef::decode(info_bytes)?;

        let announce_tiers = trackers.iter().map(|url| vec![url.clone()]).collect();

        Self::from_info(&info, announce_tiers)
    }

    fn from_info(info: &BencodeRef<'_>, announce_tiers: Vec<Vec<String>>) -> Result<Self, MetainfoError> {
        let info_hash = InfoHash::sha1_of(info.buffer());

        let name = info
            .lookup(b"name")
            .and_then(BencodeRef::str)
            .ok_or(MetainfoError::MissingKey { key: "name" })?
            .to_string();

        let piece_length = info
            .lookup(b"piece length")
            .and_then(BencodeRef::int)
            .ok_or(MetainfoError::MissingKey { key: "piece length" })?;
        if piece_length <= 0 {
            return Err(MetainfoError::InvalidPieceLength);
        }
        #[allow(clippy::cast_sign_loss)]
        let piece_length = piece_length as u64;

        let pieces_bytes = info
            .lookup(b"pieces")
            .and_then(BencodeRef::bytes)
            .ok_or(MetainfoError::MissingKey { key: "pieces" })?;
        if pieces_bytes.is_empty() || pieces_bytes.len() % 20 != 0 {
            return Err(MetainfoError::InvalidPiecesLength);
        }
        let pieces: Vec<[u8; 20]> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| chunk.try_into().expect("chunks are 20 bytes"))
            .collect();

        let files = flatten_files(info, &name)?;
        let total_length: u64 = files.iter().map(|file| file.length).sum();

        let piece_count = pieces.len() as u64;
        if piece_count * piece_length < total_length || (piece_count - 1) * piece_length >= total_length {
            return Err(MetainfoError::InconsistentTotalLength);
        }

        Ok(Self {
            info_hash,
            name,
            piece_length,
            pieces,
            files,
            total_length,
            announce_tiers,
        })
    }

    #[must_use]
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    #[must_use]
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    #[must_use]
    pub fn piece_hash(&self, piece_index: usize) -> [u8; 20] {
        self.pieces[piece_index]
    }

    #[must_use]
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    #[must_use]
    pub fn files(&self) -> &[FileSlice] {
        &self.files
    }

    /// Tracker URL tiers, in announce order (BEP 12).
    #[must_use]
    pub fn announce_tiers(&self) -> &[Vec<String>] {
        &self.announce_tiers
    }

    /// The length in bytes of piece `piece_index`. All pieces have the
    /// nominal piece length except possibly the last one.
    ///
    /// # Panics
    ///
    /// Will panic if the piece index is out of range.
    #[must_use]
    pub fn length_of_piece(&self, piece_index: usize) -> u32 {
        assert!(piece_index < self.pieces.len(), "piece {piece_index} out of range");

        let length = if piece_index == self.pieces.len() - 1 {
            self.total_length - (self.pieces.len() as u64 - 1) * self.piece_length
        } else {
            self.piece_length
        };

        u32::try_from(length).expect("a piece is far smaller than 4 GiB")
    }

    /// The number of blocks piece `piece_index` is split into.
    #[must_use]
    pub fn blocks_in_piece(&self, piece_index: usize) -> u32 {
        self.length_of_piece(piece_index).div_ceil(BLOCK_SIZE)
    }

    /// The length in bytes of the block at `block_offset` within the piece.
    /// Only the final block of the final piece may be shorter than
    /// [`BLOCK_SIZE`].
    #[must_use]
    pub fn length_of_block(&self, piece_index: usize, block_offset: u32) -> u32 {
        let piece_length = self.length_of_piece(piece_index);
        BLOCK_SIZE.min(piece_length - block_offset)
    }
}

/// Extracts the BEP 12 `announce-list` tiers, falling back to the single
/// `announce` URL when absent.
fn announce_tiers(root: &BencodeRef<'_>) -> Vec<Vec<String>> {
    if let Some(tiers) = root.lookup(b"announce-list").and_then(BencodeRef::list) {
        let tiers: Vec<Vec<String>> = tiers
            .iter()
            .filter_map(|tier| {
                let urls: Vec<String> = tier
                    .list()?
                    .iter()
                    .filter_map(|url| url.str().map(ToString::to_string))
                    .collect();
                if urls.is_empty() {
                    None
                } else {
                    Some(urls)
                }
            })
            .collect();

        if !tiers.is_empty() {
            return tiers;
        }
    }

    root.lookup(b"announce")
        .and_then(BencodeRef::str)
        .map(|url| vec![vec![url.to_string()]])
        .unwrap_or_default()
}

/// Flattens the single- and multi-file layouts into one ordered file list
/// with global offsets.
fn flatten_files(info: &BencodeRef<'_>, name: &str) -> Result<Vec<FileSlice>, MetainfoError> {
    if let Some(length) = info.lookup(b"length").and_then(BencodeRef::int) {
        let length = u64::try_from(length).map_err(|_| MetainfoError::InvalidKey { key: "length" })?;

        return Ok(vec![FileSlice {
            relative_path: sanitized_path(&[name.to_string()])?,
            length,
            global_offset: 0,
        }]);
    }

    let file_list = info
        .lookup(b"files")
        .and_then(BencodeRef::list)
        .ok_or(MetainfoError::MissingKey { key: "files" })?;

    let mut files = Vec::with_capacity(file_list.len());
    let mut global_offset = 0u64;

    for file in file_list {
        let length = file
            .lookup(b"length")
            .and_then(BencodeRef::int)
            .and_then(|length| u64::try_from(length).ok())
            .ok_or(MetainfoError::InvalidKey { key: "length" })?;

        let mut components = vec![name.to_string()];
        let path_components = file
            .lookup(b"path")
            .and_then(BencodeRef::list)
            .ok_or(MetainfoError::InvalidKey { key: "path" })?;
        for component in path_components {
            components.push(
                component
                    .str()
                    .ok_or(MetainfoError::InvalidKey { key: "path" })?
                    .to_string(),
            );
        }

        files.push(FileSlice {
            relative_path: sanitized_path(&components)?,
            length,
            global_offset,
        });
        global_offset += length;
    }

    if files.is_empty() {
        return Err(MetainfoError::NoFiles);
    }

    Ok(files)
}

/// Joins path components, rejecting anything that could escape the download
/// directory: empty components, parent references and absolute paths.
fn sanitized_path(components: &[String]) -> Result<PathBuf, MetainfoError> {
    let mut path = PathBuf::new();

    for component in components {
        let unsafe_path = || MetainfoError::UnsafeFilePath {
            path: components.join("/"),
        };

        if component.is_empty() {
            return Err(unsafe_path());
        }

        let part = Path::new(component);
        let mut parts = part.components();
        match (parts.next(), parts.next()) {
            (Some(Component::Normal(normal)), None) => path.push(normal),
            _ => return Err(unsafe_path()),
        }
    }

    Ok(path)
}
