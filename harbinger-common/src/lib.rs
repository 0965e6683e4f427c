#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod context;
pub mod escape;
pub mod interval;
pub mod logging;
pub mod services;
pub mod stats;

pub use tracing;

/// Broadcast signal used to stop long-running service loops.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
}
