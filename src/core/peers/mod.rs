//! Peer connection management: the endpoint queue, the per-peer session
//! task and the supervisor that keeps sessions alive.
pub mod queue;
pub mod session;
pub mod supervisor;

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

use super::pieces::{Block, SessionId};

/// A command pushed into a live session from outside its own task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCommand {
    /// Tell the peer we no longer want this block (endgame duplicate that
    /// another session already delivered).
    Cancel(Block),
}

/// The hub of live sessions: maps session ids to their command inboxes so
/// the registry's cancel hints can reach the right connection.
#[derive(Debug, Default)]
pub struct Peers {
    senders: Mutex<HashMap<SessionId, mpsc::UnboundedSender<PeerCommand>>>,
}

impl Peers {
    /// Registers a session inbox, returning the receiving half.
    pub fn register(&self, session: SessionId) -> mpsc::UnboundedReceiver<PeerCommand> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock().insert(session, sender);
        receiver
    }

    pub fn unregister(&self, session: SessionId) {
        self.lock().remove(&session);
    }

    /// Routes cancel hints to the sessions still holding a block that was
    /// just satisfied elsewhere. Dead sessions are skipped.
    pub fn send_cancels(&self, cancels: Vec<(SessionId, Block)>) {
        let senders = self.lock();
        for (session, block) in cancels {
            if let Some(sender) = senders.get(&session) {
                let _ = sender.send(PeerCommand::Cancel(block));
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, mpsc::UnboundedSender<PeerCommand>>> {
        self.senders.lock().expect("peer hub lock poisoned")
    }
}
