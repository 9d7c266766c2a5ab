//! Application jobs launchers.
//!
//! The application setup has only two main stages:
//!
//! 1. Build the download domain (the [`crate::core::Download`]).
//! 2. Launch the concurrent jobs: the tracker announce cycle feeding the
//!    peer queue, and the peer supervisor draining it.
//!
//! This module contains the functions needed to start those jobs.
pub mod peer_supervisor;
pub mod tracker_cycle;
