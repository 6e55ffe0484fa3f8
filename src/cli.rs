//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running the bridge daemon (`serve`)
//! - Listing paired applications (`pairings`)

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "keybridge")]
#[command(about = "Local companion service that bridges paired applications to a hardware signing device")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the bridge daemon (default if no subcommand given)
    Serve {
        /// Use the in-process simulated device instead of real hardware
        #[arg(long)]
        simulate: bool,
    },

    /// List paired applications
    Pairings,
}
