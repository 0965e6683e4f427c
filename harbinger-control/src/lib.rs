#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod commands;
pub mod server;

pub use commands::ConsoleCommands;
pub use server::{CommandHandler, ConsoleServer, ControlError};
