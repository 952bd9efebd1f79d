//! CLI module for the skein workflow engine.

mod commands;

pub use commands::{Cli, Commands, ConfigCommands, PageCommands};
