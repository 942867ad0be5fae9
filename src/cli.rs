//! CLI argument parsing for the owntracks-recorder binary.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "owntracks-recorder",
    about = "Stores OwnTracks location reports and enriches them with place names"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Consume location reports (default if no subcommand given)
    Serve,
    /// Run database migrations and exit
    Migrate,
}
