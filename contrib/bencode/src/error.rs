use thiserror::Error;

/// Errors raised while decoding bencoded bytes.
///
/// Every variant carries the byte offset at which decoding failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BencodeParseError {
    #[error("unexpected end of input at byte {pos}")]
    UnexpectedEnd { pos: usize },

    #[error("invalid value prefix byte at {pos}")]
    InvalidByte { pos: usize },

    #[error("integer starting at byte {pos} is missing its delimiter")]
    IntMissingDelimiter { pos: usize },

    #[error("integer starting at byte {pos} is not minimally encoded")]
    IntNonMinimal { pos: usize },

    #[error("integer starting at byte {pos} is not a valid decimal number")]
    IntInvalid { pos: usize },

    #[error("byte string at {pos} declares a negative length")]
    LengthNegative { pos: usize },

    #[error("byte string at {pos} overruns the end of the input")]
    LengthOverflow { pos: usize },

    #[error("dictionary key at {pos} is not in ascending order")]
    KeyOrdering { pos: usize },

    #[error("dictionary key at {pos} is a duplicate")]
    KeyDuplicate { pos: usize },

    #[error("recursion limit reached at byte {pos}")]
    RecursionExceeded { pos: usize },

    #[error("trailing bytes after the value ending at {pos}")]
    TrailingBytes { pos: usize },
}

pub type BencodeParseResult<T> = Result<T, BencodeParseError>;
