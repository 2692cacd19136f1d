mod commands;
mod config;
mod logging;
mod server;
mod source;

pub use commands::{Cli, CliError};
