//! Persistence of verified pieces.
//!
//! The [`writer::FileWriter`] is the sole writer of the target files; it
//! positions verified piece bytes at the right offsets of the (possibly
//! multi-file) layout. The [`resume::ResumeData`] sidecar remembers which
//! pieces are already complete so an interrupted download can continue.
pub mod resume;
pub mod writer;

use thiserror::Error;

pub const STORAGE_LOG_TARGET: &str = "STORAGE";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("filesystem failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("the resume sidecar belongs to a different torrent")]
    ForeignSidecar,

    #[error("the resume sidecar is malformed: {0}")]
    MalformedSidecar(#[from] serde_json::Error),
}
