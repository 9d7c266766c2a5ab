//! Piece download coordination.
//!
//! The [`registry::PieceRegistry`] is the authoritative map of piece state
//! for one download. Peer sessions only learn what to request by asking it,
//! and everything they receive flows back into it.
pub mod registry;

/// Identifier of one live peer session, assigned by the supervisor. Session
/// ids are never reused within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session {}", self.0)
    }
}

/// One block of one piece: the unit of request and response on the peer
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub piece_index: usize,
    pub begin: u32,
    pub length: u32,
}
