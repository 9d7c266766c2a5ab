//! The piece registry: the single decision point for what gets downloaded
//! from whom.
//!
//! A piece moves through `Absent -> InFlight -> Complete`, where `Complete`
//! is terminal and means the verified bytes are persisted. While a piece is
//! in flight the registry accounts every block: which sessions it has been
//! requested from and whether its payload arrived. Outside the endgame a
//! block is outstanding at no more than one session.
//!
//! All operations are synchronous and serialized through one internal lock,
//! which is never held across a suspension point, so `reserve` and
//! `deliver` are linearizable (the repository pattern: shared handle,
//! single owner of the state).
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use thiserror::Error;
use torrust_downloader_primitives::bitfield::Bitfield;
use torrust_downloader_primitives::info_hash::InfoHash;
use torrust_downloader_primitives::BLOCK_SIZE;
use tracing::debug;

use super::{Block, SessionId};
use crate::shared::bit_torrent::metainfo::Metainfo;

pub const REGISTRY_LOG_TARGET: &str = "PIECE REGISTRY";

/// Errors returned by [`PieceRegistry::deliver`] for payloads that do not
/// fit the torrent. They mean the sending peer violated the protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliverError {
    #[error("piece {piece_index} is out of range")]
    UnknownPiece { piece_index: usize },

    #[error("piece {piece_index} offset {begin} is not block aligned")]
    UnalignedOffset { piece_index: usize, begin: u32 },

    #[error("piece {piece_index} offset {begin} is beyond the piece end")]
    UnknownBlock { piece_index: usize, begin: u32 },

    #[error("block {piece_index}/{begin} should be {expected} bytes, got {got}")]
    WrongLength {
        piece_index: usize,
        begin: u32,
        expected: u32,
        got: usize,
    },
}

/// The outcome of absorbing one block payload.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivered {
    /// The block was new; the piece is still incomplete. `cancel` lists the
    /// other sessions the block was outstanding at (endgame duplicates).
    Accepted { cancel: Vec<(SessionId, Block)> },

    /// The payload for this block had already arrived; only the first
    /// delivery counts.
    Duplicate,

    /// The block completed its piece and the SHA-1 matched. The caller must
    /// persist `bytes` and then call [`PieceRegistry::confirm_persisted`].
    Verified {
        bytes: Vec<u8>,
        cancel: Vec<(SessionId, Block)>,
    },

    /// The block completed its piece but the SHA-1 did not match. The piece
    /// was reset to an empty in-flight state; the delivering peer should be
    /// dropped.
    HashMismatch,
}

#[derive(Debug)]
enum PieceState {
    Absent,
    InFlight(InFlightPiece),
    /// Verified, waiting for the disk write to be confirmed. Reported as
    /// incomplete to external readers until then.
    Writing,
    Complete,
}

#[derive(Debug)]
struct InFlightPiece {
    blocks: Vec<BlockState>,
    satisfied: u32,
    buffer: Vec<u8>,
}

#[derive(Debug, Default, Clone)]
struct BlockState {
    requested_by: Vec<SessionId>,
    received: bool,
}

#[derive(Debug, Default)]
struct PeerState {
    has: Vec<bool>,
    outstanding: Vec<Block>,
}

#[derive(Debug)]
struct Inner {
    pieces: Vec<PieceState>,
    peers: HashMap<SessionId, PeerState>,
    /// How many currently connected peers hold each piece. Maintained on
    /// `available` and `release` so rarest-first selection is cheap.
    availability: Vec<u32>,
    complete_count: usize,
    endgame: bool,
}

/// The authoritative map of piece state for one download. Cheap to share:
/// clone the [`Arc`] handle.
#[derive(Debug)]
pub struct PieceRegistry {
    metainfo: Arc<Metainfo>,
    inner: Mutex<Inner>,
}

impl PieceRegistry {
    #[must_use]
    pub fn new(metainfo: Arc<Metainfo>) -> Self {
        let piece_count = metainfo.piece_count();

        Self {
            metainfo,
            inner: Mutex::new(Inner {
                pieces: (0..piece_count).map(|_| PieceState::Absent).collect(),
                peers: HashMap::new(),
                availability: vec![0; piece_count],
                complete_count: 0,
                endgame: false,
            }),
        }
    }

    /// Marks pieces already verified on disk (resume) as complete. Must be
    /// called before any peer is registered.
    pub fn seed_complete(&self, verified: &Bitfield) {
        let mut inner = self.lock();

        for piece_index in verified.ones() {
            if matches!(inner.pieces[piece_index], PieceState::Absent) {
                inner.pieces[piece_index] = PieceState::Complete;
                inner.complete_count += 1;
            }
        }
    }

    /// Registers a connected session with an empty availability set.
    pub fn register_peer(&self, session: SessionId) {
        let piece_count = self.metainfo.piece_count();
        self.lock().peers.insert(
            session,
            PeerState {
                has: vec![false; piece_count],
                outstanding: Vec::new(),
            },
        );
    }

    /// Records that the peer holds `piece_index` (a `have` message).
    pub fn available(&self, session: SessionId, piece_index: usize) {
        let mut inner = self.lock();

        if piece_index >= inner.availability.len() {
            return;
        }
        let Some(peer) = inner.peers.get_mut(&session) else {
            return;
        };

        if !peer.has[piece_index] {
            peer.has[piece_index] = true;
            inner.availability[piece_index] += 1;
        }
    }

    /// Records a whole `bitfield` message.
    pub fn available_bitfield(&self, session: SessionId, bitfield: &Bitfield) {
        for piece_index in bitfield.ones() {
            self.available(session, piece_index);
        }
    }

    /// Hands out the next block to request for this session, or `None` when
    /// the peer has nothing we still need.
    ///
    /// Normal phase: finish in-flight pieces first, rarest piece first,
    /// blocks in ascending offset, one session per block. When the peer has
    /// no in-flight work, the rarest absent piece it holds is promoted.
    /// Endgame phase: blocks may be handed to several sessions; every holder
    /// is remembered so the winners' duplicates can be cancelled.
    #[must_use]
    pub fn reserve(&self, session: SessionId) -> Option<Block> {
        let mut inner = self.lock();
        let inner = &mut *inner;

        if !inner.peers.contains_key(&session) {
            return None;
        }

        // Unrequested block of the rarest in-flight piece the peer holds.
        if let Some(block) = self.reserve_in_flight(inner, session) {
            return Some(block);
        }

        // Otherwise promote the rarest absent piece the peer holds.
        if let Some(block) = self.promote_absent(inner, session) {
            return Some(block);
        }

        self.update_endgame(inner);
        if inner.endgame {
            return self.reserve_endgame(inner, session);
        }

        None
    }

    fn reserve_in_flight(&self, inner: &mut Inner, session: SessionId) -> Option<Block> {
        let peer_has = |peer: &PeerState, piece_index: usize| peer.has[piece_index];
        let peer = inner.peers.get(&session)?;

        let mut candidate: Option<(u32, usize, u32)> = None; // (availability, piece, begin)

        for (piece_index, piece) in inner.pieces.iter().enumerate() {
            let PieceState::InFlight(in_flight) = piece else {
                continue;
            };
            if !peer_has(peer, piece_index) {
                continue;
            }

            let Some(block_number) = in_flight
                .blocks
                .iter()
                .position(|block| !block.received && block.requested_by.is_empty())
            else {
                continue;
            };

            let begin = block_number as u32 * BLOCK_SIZE;
            let availability = inner.availability[piece_index];
            if candidate.is_none_or(|(best, _, _)| availability < best) {
                candidate = Some((availability, piece_index, begin));
            }
        }

        let (_, piece_index, begin) = candidate?;
        let block = Block {
            piece_index,
            begin,
            length: self.metainfo.length_of_block(piece_index, begin),
        };
        Self::record_reservation(inner, session, block);
        Some(block)
    }

    fn promote_absent(&self, inner: &mut Inner, session: SessionId) -> Option<Block> {
        let peer = inner.peers.get(&session)?;

        let mut candidate: Option<(u32, usize)> = None;

        for (piece_index, piece) in inner.pieces.iter().enumerate() {
            if !matches!(piece, PieceState::Absent) || !peer.has[piece_index] {
                continue;
            }
            let availability = inner.availability[piece_index];
            if candidate.is_none_or(|(best, _)| availability < best) {
                candidate = Some((availability, piece_index));
            }
        }

        let (_, piece_index) = candidate?;

        let piece_length = self.metainfo.length_of_piece(piece_index);
        let block_count = self.metainfo.blocks_in_piece(piece_index);
        inner.pieces[piece_index] = PieceState::InFlight(InFlightPiece {
            blocks: vec![BlockState::default(); block_count as usize],
            satisfied: 0,
            buffer: vec![0u8; piece_length as usize],
        });

        debug!(target: REGISTRY_LOG_TARGET, "piece {piece_index} promoted to in-flight");

        let block = Block {
            piece_index,
            begin: 0,
            length: self.metainfo.length_of_block(piece_index, 0),
        };
        Self::record_reservation(inner, session, block);
        Some(block)
    }

    /// A duplicate reservation: the unsatisfied block with the fewest
    /// holders that this session is not already requesting.
    fn reserve_endgame(&self, inner: &mut Inner, session: SessionId) -> Option<Block> {
        let peer = inner.peers.get(&session)?;

        let mut candidate: Option<(usize, usize, u32)> = None; // (holders, piece, begin)

        for (piece_index, piece) in inner.pieces.iter().enumerate() {
            let PieceState::InFlight(in_flight) = piece else {
                continue;
            };
            if !peer.has[piece_index] {
                continue;
            }

            for (block_number, block) in in_flight.blocks.iter().enumerate() {
                if block.received || block.requested_by.contains(&session) {
                    continue;
                }
                let holders = block.requested_by.len();
                let begin = block_number as u32 * BLOCK_SIZE;
                if candidate.is_none_or(|(best, _, _)| holders < best) {
                    candidate = Some((holders, piece_index, begin));
                }
            }
        }

        let (_, piece_index, begin) = candidate?;
        let block = Block {
            piece_index,
            begin,
            length: self.metainfo.length_of_block(piece_index, begin),
        };
        Self::record_reservation(inner, session, block);
        Some(block)
    }

    fn record_reservation(inner: &mut Inner, session: SessionId, block: Block) {
        if let PieceState::InFlight(in_flight) = &mut inner.pieces[block.piece_index] {
            in_flight.blocks[(block.begin / BLOCK_SIZE) as usize].requested_by.push(session);
        }
        if let Some(peer) = inner.peers.get_mut(&session) {
            peer.outstanding.push(block);
        }
    }

    /// The endgame starts once nothing is absent any more and at most one
    /// piece's worth of blocks is still unsatisfied.
    fn update_endgame(&self, inner: &mut Inner) {
        if inner.endgame {
            return;
        }

        let any_absent = inner.pieces.iter().any(|piece| matches!(piece, PieceState::Absent));
        if any_absent {
            return;
        }

        let unsatisfied: u32 = inner
            .pieces
            .iter()
            .map(|piece| match piece {
                PieceState::InFlight(in_flight) => in_flight.blocks.len() as u32 - in_flight.satisfied,
                _ => 0,
            })
            .sum();

        let threshold = (self.metainfo.piece_length() / u64::from(BLOCK_SIZE)).max(1);
        if u64::from(unsatisfied) <= threshold {
            inner.endgame = true;
            debug!(target: REGISTRY_LOG_TARGET, "endgame: {unsatisfied} blocks left");
        }
    }

    /// Absorbs a block payload.
    ///
    /// # Errors
    ///
    /// Will return a [`DeliverError`] when the payload does not map onto a
    /// block of this torrent; the sending peer is violating the protocol.
    pub fn deliver(&self, session: SessionId, piece_index: usize, begin: u32, payload: &[u8]) -> Result<Delivered, DeliverError> {
        let mut inner = self.lock();
        let inner = &mut *inner;

        if piece_index >= inner.pieces.len() {
            return Err(DeliverError::UnknownPiece { piece_index });
        }
        if begin % BLOCK_SIZE != 0 {
            return Err(DeliverError::UnalignedOffset { piece_index, begin });
        }

        let piece_length = self.metainfo.length_of_piece(piece_index);
        if begin >= piece_length {
            return Err(DeliverError::UnknownBlock { piece_index, begin });
        }
        let expected = self.metainfo.length_of_block(piece_index, begin);
        if payload.len() != expected as usize {
            return Err(DeliverError::WrongLength {
                piece_index,
                begin,
                expected,
                got: payload.len(),
            });
        }

        let PieceState::InFlight(in_flight) = &mut inner.pieces[piece_index] else {
            // A late endgame duplicate for a piece that is already verified.
            return Ok(Delivered::Duplicate);
        };

        let block_number = (begin / BLOCK_SIZE) as usize;
        if in_flight.blocks[block_number].received {
            return Ok(Delivered::Duplicate);
        }

        in_flight.blocks[block_number].received = true;
        in_flight.satisfied += 1;
        in_flight.buffer[begin as usize..begin as usize + payload.len()].copy_from_slice(payload);

        let block = Block {
            piece_index,
            begin,
            length: expected,
        };

        // Everyone else still holding this block should cancel it.
        let cancel: Vec<(SessionId, Block)> = in_flight.blocks[block_number]
            .requested_by
            .iter()
            .filter(|holder| **holder != session)
            .map(|holder| (*holder, block))
            .collect();

        for peer in inner.peers.values_mut() {
            peer.outstanding.retain(|outstanding| *outstanding != block);
        }

        if in_flight.satisfied < in_flight.blocks.len() as u32 {
            return Ok(Delivered::Accepted { cancel });
        }

        // Last block: verify the piece.
        let bytes = std::mem::take(&mut in_flight.buffer);
        if InfoHash::sha1_of(&bytes) == InfoHash(self.metainfo.piece_hash(piece_index)) {
            inner.pieces[piece_index] = PieceState::Writing;
            Ok(Delivered::Verified { bytes, cancel })
        } else {
            debug!(target: REGISTRY_LOG_TARGET, "piece {piece_index} failed verification");
            Self::reset_piece(inner, piece_index, piece_length);
            Ok(Delivered::HashMismatch)
        }
    }

    /// Reverts a piece to an empty in-flight state after a hash mismatch and
    /// drops every reservation that referred to it.
    fn reset_piece(inner: &mut Inner, piece_index: usize, piece_length: u32) {
        let block_count = (piece_length.div_ceil(BLOCK_SIZE)) as usize;
        inner.pieces[piece_index] = PieceState::InFlight(InFlightPiece {
            blocks: vec![BlockState::default(); block_count],
            satisfied: 0,
            buffer: vec![0u8; piece_length as usize],
        });

        for peer in inner.peers.values_mut() {
            peer.outstanding.retain(|outstanding| outstanding.piece_index != piece_index);
        }
    }

    /// Confirms that a verified piece reached the disk. Only now does the
    /// piece count as complete.
    ///
    /// Returns `true` when the whole download is finished.
    pub fn confirm_persisted(&self, piece_index: usize) -> bool {
        let mut inner = self.lock();

        if matches!(inner.pieces[piece_index], PieceState::Writing) {
            inner.pieces[piece_index] = PieceState::Complete;
            inner.complete_count += 1;
        }

        inner.complete_count == inner.pieces.len()
    }

    /// Reverts the session's reservations but keeps it registered. Used
    /// when a session stays choked past its grace period: the blocks go
    /// back to the pool while the connection stays up.
    pub fn release_reservations(&self, session: SessionId) {
        let mut inner = self.lock();
        Self::revert_reservations(&mut inner, session);

        if let Some(peer) = inner.peers.get_mut(&session) {
            peer.outstanding.clear();
        }
    }

    /// Reverts all of the session's reservations and forgets its
    /// availability. Called on every session exit.
    pub fn release(&self, session: SessionId) {
        let mut inner = self.lock();
        Self::revert_reservations(&mut inner, session);
        let inner = &mut *inner;

        let Some(peer) = inner.peers.remove(&session) else {
            return;
        };

        for (piece_index, has) in peer.has.iter().enumerate() {
            if *has {
                inner.availability[piece_index] -= 1;
            }
        }
    }

    fn revert_reservations(inner: &mut Inner, session: SessionId) {
        let outstanding = match inner.peers.get(&session) {
            Some(peer) => peer.outstanding.clone(),
            None => return,
        };

        for block in outstanding {
            if let PieceState::InFlight(in_flight) = &mut inner.pieces[block.piece_index] {
                in_flight.blocks[(block.begin / BLOCK_SIZE) as usize]
                    .requested_by
                    .retain(|holder| *holder != session);
            }
        }
    }

    /// The bitfield of pieces whose bytes are verified and persisted.
    #[must_use]
    pub fn completed_pieces(&self) -> Bitfield {
        let inner = self.lock();

        let mut bitfield = Bitfield::new(inner.pieces.len());
        for (piece_index, piece) in inner.pieces.iter().enumerate() {
            if matches!(piece, PieceState::Complete) {
                bitfield.set(piece_index);
            }
        }
        bitfield
    }

    #[must_use]
    pub fn complete_count(&self) -> usize {
        self.lock().complete_count
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        let inner = self.lock();
        inner.complete_count == inner.pieces.len()
    }

    #[must_use]
    pub fn is_endgame(&self) -> bool {
        self.lock().endgame
    }

    /// Bytes not yet verified, as reported to trackers in `left`.
    #[must_use]
    pub fn left_bytes(&self) -> u64 {
        let inner = self.lock();

        inner
            .pieces
            .iter()
            .enumerate()
            .filter(|(_, piece)| !matches!(piece, PieceState::Complete))
            .map(|(piece_index, _)| u64::from(self.metainfo.length_of_piece(piece_index)))
            .sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("piece registry lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use torrust_downloader_contrib_bencode::{ben_bytes, ben_int, ben_map, BencodeValue};
    use torrust_downloader_primitives::bitfield::Bitfield;
    use torrust_downloader_primitives::info_hash::InfoHash;
    use torrust_downloader_primitives::BLOCK_SIZE;

    use super::{Delivered, PieceRegistry};
    use crate::core::pieces::{Block, SessionId};
    use crate::shared::bit_torrent::metainfo::Metainfo;

    const PIECE_LENGTH: u64 = 2 * BLOCK_SIZE as u64; // two blocks per piece

    /// A torrent whose piece contents are deterministic: piece `i` is filled
    /// with the byte `i`, three full pieces.
    fn test_metainfo() -> Arc<Metainfo> {
        let piece_count = 3usize;
        let mut pieces = Vec::new();
        for piece_index in 0..piece_count {
            let bytes = piece_bytes(piece_index);
            pieces.extend_from_slice(&InfoHash::sha1_of(&bytes).0);
        }

        #[allow(clippy::cast_possible_wrap)]
        let bytes = (ben_map! {
            "info" => ben_map! {
                "length" => ben_int!((piece_count as u64 * PIECE_LENGTH) as i64),
                "name" => ben_bytes!("registry-test.bin"),
                "piece length" => ben_int!(PIECE_LENGTH as i64),
                "pieces" => BencodeValue::Bytes(pieces)
            }
        })
        .encode();

        Arc::new(Metainfo::from_bytes(&bytes).unwrap())
    }

    fn piece_bytes(piece_index: usize) -> Vec<u8> {
        vec![piece_index as u8; PIECE_LENGTH as usize]
    }

    fn block_payload(piece_index: usize, begin: u32) -> Vec<u8> {
        piece_bytes(piece_index)[begin as usize..(begin + BLOCK_SIZE) as usize].to_vec()
    }

    /// A registry with `peers` sessions registered, all holding every piece.
    fn registry_with_seeders(peers: u64) -> (PieceRegistry, Vec<SessionId>) {
        let registry = PieceRegistry::new(test_metainfo());

        let sessions: Vec<SessionId> = (0..peers).map(SessionId).collect();
        for session in &sessions {
            registry.register_peer(*session);
            let mut bitfield = Bitfield::new(3);
            (0..3).for_each(|piece| bitfield.set(piece));
            registry.available_bitfield(*session, &bitfield);
        }

        (registry, sessions)
    }

    fn complete_piece(registry: &PieceRegistry, session: SessionId, piece_index: usize) {
        loop {
            let block = registry.reserve(session).expect("a block should be reservable");
            let outcome = registry
                .deliver(session, block.piece_index, block.begin, &block_payload(block.piece_index, block.begin))
                .unwrap();

            if let Delivered::Verified { .. } = outcome {
                registry.confirm_persisted(block.piece_index);
                if block.piece_index == piece_index {
                    return;
                }
            }
        }
    }

    #[test]
    fn blocks_of_a_piece_are_handed_out_in_ascending_offset() {
        let (registry, sessions) = registry_with_seeders(1);

        let first = registry.reserve(sessions[0]).unwrap();
        let second = registry.reserve(sessions[0]).unwrap();

        assert_eq!(first.begin, 0);
        assert_eq!(second.piece_index, first.piece_index);
        assert_eq!(second.begin, BLOCK_SIZE);
    }

    #[test]
    fn a_block_is_not_reserved_twice_outside_the_endgame() {
        let (registry, sessions) = registry_with_seeders(2);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..6 {
            for session in &sessions {
                if let Some(block) = registry.reserve(*session) {
                    assert!(seen.insert(block), "block {block:?} reserved twice");
                }
            }
        }
    }

    #[test]
    fn in_flight_pieces_are_finished_before_new_ones_start() {
        let (registry, sessions) = registry_with_seeders(2);

        let first = registry.reserve(sessions[0]).unwrap();
        // The second session must join the in-flight piece, not open one.
        let second = registry.reserve(sessions[1]).unwrap();

        assert_eq!(second.piece_index, first.piece_index);
    }

    #[test]
    fn the_rarest_absent_piece_is_promoted_first() {
        let registry = PieceRegistry::new(test_metainfo());

        // Session 0 holds every piece, session 1 only piece 2: piece 2 has
        // two holders, pieces 0 and 1 are the rare ones.
        registry.register_peer(SessionId(0));
        let mut all = Bitfield::new(3);
        (0..3).for_each(|piece| all.set(piece));
        registry.available_bitfield(SessionId(0), &all);

        registry.register_peer(SessionId(1));
        registry.available(SessionId(1), 2);

        let block = registry.reserve(SessionId(0)).unwrap();

        assert_ne!(block.piece_index, 2, "the widely-held piece should not be picked first");
    }

    #[test]
    fn delivering_every_block_verifies_the_piece() {
        let (registry, sessions) = registry_with_seeders(1);
        let session = sessions[0];

        let first = registry.reserve(session).unwrap();
        let second = registry.reserve(session).unwrap();

        assert_eq!(
            registry.deliver(session, first.piece_index, first.begin, &block_payload(first.piece_index, first.begin)).unwrap(),
            Delivered::Accepted { cancel: vec![] }
        );

        let outcome = registry
            .deliver(session, second.piece_index, second.begin, &block_payload(second.piece_index, second.begin))
            .unwrap();

        let Delivered::Verified { bytes, cancel } = outcome else {
            panic!("expected a verified piece, got {outcome:?}");
        };
        assert_eq!(bytes, piece_bytes(first.piece_index));
        assert!(cancel.is_empty());

        // Not complete until the write is confirmed.
        assert_eq!(registry.complete_count(), 0);
        registry.confirm_persisted(first.piece_index);
        assert_eq!(registry.complete_count(), 1);
        assert!(registry.completed_pieces().get(first.piece_index));
    }

    #[test]
    fn a_corrupt_piece_reverts_to_in_flight_with_no_received_blocks() {
        let (registry, sessions) = registry_with_seeders(2);
        let bad_peer = sessions[0];
        let good_peer = sessions[1];

        let first = registry.reserve(bad_peer).unwrap();
        let second = registry.reserve(bad_peer).unwrap();
        let piece_index = first.piece_index;

        registry.deliver(bad_peer, piece_index, first.begin, &vec![0xFF; first.length as usize]).unwrap();
        let outcome = registry
            .deliver(bad_peer, piece_index, second.begin, &vec![0xFF; second.length as usize])
            .unwrap();
        assert_eq!(outcome, Delivered::HashMismatch);

        // The piece is in flight again and a second peer can complete it.
        registry.release(bad_peer);
        complete_piece(&registry, good_peer, piece_index);

        assert!(registry.completed_pieces().get(piece_index));
    }

    #[test]
    fn duplicate_deliveries_only_count_once() {
        let (registry, sessions) = registry_with_seeders(1);
        let session = sessions[0];

        let block = registry.reserve(session).unwrap();
        let payload = block_payload(block.piece_index, block.begin);

        assert_eq!(
            registry.deliver(session, block.piece_index, block.begin, &payload).unwrap(),
            Delivered::Accepted { cancel: vec![] }
        );
        assert_eq!(
            registry.deliver(session, block.piece_index, block.begin, &payload).unwrap(),
            Delivered::Duplicate
        );
    }

    #[test]
    fn a_released_session_returns_its_blocks_to_the_pool() {
        let (registry, sessions) = registry_with_seeders(2);

        let block = registry.reserve(sessions[0]).unwrap();
        registry.release(sessions[0]);

        // The same block becomes reservable by the survivor.
        let reserved = registry.reserve(sessions[1]).unwrap();
        assert_eq!(reserved, block);
    }

    #[test]
    fn a_choked_session_keeps_its_availability_after_releasing_reservations() {
        let (registry, sessions) = registry_with_seeders(1);

        let block = registry.reserve(sessions[0]).unwrap();
        registry.release_reservations(sessions[0]);

        // The blocks went back to the pool but the peer is still usable.
        assert_eq!(registry.reserve(sessions[0]), Some(block));
    }

    #[test]
    fn a_peer_with_nothing_useful_gets_no_reservation() {
        let registry = PieceRegistry::new(test_metainfo());

        registry.register_peer(SessionId(0));

        assert_eq!(registry.reserve(SessionId(0)), None);
    }

    #[test]
    fn wrong_length_payloads_are_a_protocol_violation() {
        let (registry, sessions) = registry_with_seeders(1);
        let session = sessions[0];

        let block = registry.reserve(session).unwrap();

        assert!(registry.deliver(session, block.piece_index, block.begin, &[0u8; 5]).is_err());
        assert!(registry.deliver(session, block.piece_index, 3, &[0u8; 5]).is_err());
        assert!(registry.deliver(session, 99, 0, &[0u8; 5]).is_err());
    }

    #[test]
    fn resume_seeds_complete_pieces_without_peers() {
        let registry = PieceRegistry::new(test_metainfo());

        let mut verified = Bitfield::new(3);
        verified.set(0);
        verified.set(2);
        registry.seed_complete(&verified);

        assert_eq!(registry.complete_count(), 2);
        assert_eq!(registry.left_bytes(), PIECE_LENGTH);
        assert!(!registry.is_complete());
    }

    mod in_the_endgame {
        use super::{block_payload, registry_with_seeders, Block, Delivered, PieceRegistry, SessionId, BLOCK_SIZE};

        /// Completes every piece except the last unfinished one through
        /// `session`, returning the index of the remaining piece.
        fn complete_all_but_one(registry: &PieceRegistry, session: SessionId) -> usize {
            while registry.complete_count() < 2 {
                let block = registry.reserve(session).unwrap();
                let outcome = registry
                    .deliver(session, block.piece_index, block.begin, &block_payload(block.piece_index, block.begin))
                    .unwrap();
                if let Delivered::Verified { .. } = outcome {
                    registry.confirm_persisted(block.piece_index);
                }
            }

            let completed = registry.completed_pieces();
            (0..3).find(|piece| !completed.get(*piece)).unwrap()
        }

        #[test]
        fn every_remaining_block_can_be_requested_from_both_peers() {
            let (registry, sessions) = registry_with_seeders(2);
            let piece_index = complete_all_but_one(&registry, sessions[0]);

            // The final piece: both blocks go to session 0 first.
            let first = registry.reserve(sessions[0]).unwrap();
            let second = registry.reserve(sessions[0]).unwrap();
            assert_eq!(first.piece_index, piece_index);
            assert_eq!(second.piece_index, piece_index);

            // Outside the endgame session 1 would get nothing; with only
            // the tail outstanding it gets duplicates of both blocks.
            let duplicate_one = registry.reserve(sessions[1]).unwrap();
            let duplicate_two = registry.reserve(sessions[1]).unwrap();
            assert!(registry.is_endgame());

            assert_eq!(duplicate_one.piece_index, piece_index);
            assert_eq!(duplicate_two.piece_index, piece_index);
            let mut begins = vec![duplicate_one.begin, duplicate_two.begin];
            begins.sort_unstable();
            assert_eq!(begins, vec![0, BLOCK_SIZE]);

            // And nothing further: both blocks are now held by both peers.
            assert_eq!(registry.reserve(sessions[1]), None);
        }

        #[test]
        fn the_first_delivery_wins_and_the_loser_is_cancelled() {
            let (registry, sessions) = registry_with_seeders(2);
            let (winner, loser) = (sessions[0], sessions[1]);
            let piece_index = complete_all_but_one(&registry, winner);

            let first = registry.reserve(winner).unwrap();
            let second = registry.reserve(winner).unwrap();
            assert_eq!(first.begin, 0);

            // Loser picks up endgame duplicates of both blocks.
            let _ = registry.reserve(loser).unwrap();
            let _ = registry.reserve(loser).unwrap();

            // Winner delivers block 0 first: the loser must be told to
            // cancel it.
            let outcome = registry
                .deliver(winner, piece_index, 0, &block_payload(piece_index, 0))
                .unwrap();
            assert_eq!(
                outcome,
                Delivered::Accepted {
                    cancel: vec![(
                        loser,
                        Block {
                            piece_index,
                            begin: 0,
                            length: BLOCK_SIZE,
                        }
                    )]
                }
            );

            // Loser wins the second block: the winner gets the cancel hint.
            let outcome = registry
                .deliver(loser, piece_index, second.begin, &block_payload(piece_index, second.begin))
                .unwrap();
            let Delivered::Verified { cancel, .. } = outcome else {
                panic!("expected the piece to verify, got {outcome:?}");
            };
            assert_eq!(cancel, vec![(winner, second)]);

            assert!(registry.confirm_persisted(piece_index));
            assert!(registry.is_complete());
        }

        #[test]
        fn late_duplicates_after_verification_are_ignored() {
            let (registry, sessions) = registry_with_seeders(2);
            let (winner, loser) = (sessions[0], sessions[1]);
            let piece_index = complete_all_but_one(&registry, winner);

            let _ = registry.reserve(winner).unwrap();
            let second = registry.reserve(winner).unwrap();
            let _ = registry.reserve(loser).unwrap();
            let _ = registry.reserve(loser).unwrap();

            registry.deliver(winner, piece_index, 0, &block_payload(piece_index, 0)).unwrap();
            let outcome = registry
                .deliver(winner, piece_index, second.begin, &block_payload(piece_index, second.begin))
                .unwrap();
            assert!(matches!(outcome, Delivered::Verified { .. }));

            // The loser's requests are still in flight on the wire; when
            // they land they are ignored.
            assert_eq!(
                registry.deliver(loser, piece_index, 0, &block_payload(piece_index, 0)).unwrap(),
                Delivered::Duplicate
            );
        }
    }
}
