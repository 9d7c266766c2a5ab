//! Setup before the application runs: logging initialization and the
//! launchers for the long-running jobs (tracker announce cycles, the peer
//! supervisor).
pub mod jobs;
pub mod logging;
