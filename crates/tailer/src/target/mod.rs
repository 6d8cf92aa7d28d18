//! Target module — per-container tailing: lifecycle, state and retry policy.

pub mod backoff;
pub mod controller;
pub mod state;

pub use backoff::Backoff;
pub use controller::{Target, TargetDeps, TargetSpec};
pub use state::{TargetExit, TargetState};
