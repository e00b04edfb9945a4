//! Core engine: the login → drain balance → logout polling loop.

pub mod poller;

pub use poller::{CycleReport, PollSummary, Poller, PollerSettings};
