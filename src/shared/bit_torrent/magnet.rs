//! The magnet URI scheme (BEP 9).
//!
//! A magnet link carries the info-hash and tracker hints of a torrent but
//! not its `info` dictionary; the metadata has to be fetched from peers
//! before the download proper can start.
//!
//! ```text
//! magnet:?xt=urn:btih:<40 hex chars | 32 base32 chars>&tr=<url>&dn=<name>
//! ```
//!
//! Only `xt` and `tr` are interpreted; every other parameter is ignored.
use std::str::FromStr;

use thiserror::Error;
use torrust_downloader_primitives::info_hash::InfoHash;
use url::Url;

const BTIH_PREFIX: &str = "urn:btih:";

/// A parsed magnet URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Magnet {
    pub info_hash: InfoHash,
    pub trackers: Vec<String>,
    pub display_name: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MagnetError {
    #[error("not a magnet URI")]
    NotAMagnetUri,

    #[error("the magnet URI has no `xt=urn:btih:` parameter")]
    MissingInfoHash,

    #[error("the magnet URI carries a malformed info-hash: {value}")]
    InvalidInfoHash { value: String },
}

impl FromStr for Magnet {
    type Err = MagnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|_| MagnetError::NotAMagnetUri)?;

        if url.scheme() != "magnet" {
            return Err(MagnetError::NotAMagnetUri);
        }

        let mut info_hash = None;
        let mut trackers = Vec::new();
        let mut display_name = None;

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if let Some(encoded) = value.strip_prefix(BTIH_PREFIX) {
                        info_hash = Some(parse_btih(encoded)?);
                    }
                }
                "tr" => trackers.push(value.to_string()),
                "dn" => display_name = Some(value.to_string()),
                _ => (),
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or(MagnetError::MissingInfoHash)?,
            trackers,
            display_name,
        })
    }
}

/// The `btih` value is either 40 hex characters or 32 base32 characters.
fn parse_btih(encoded: &str) -> Result<InfoHash, MagnetError> {
    let invalid = || MagnetError::InvalidInfoHash {
        value: encoded.to_string(),
    };

    match encoded.len() {
        40 => InfoHash::from_str(encoded).map_err(|_| invalid()),
        32 => InfoHash::from_base32(encoded).map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}
