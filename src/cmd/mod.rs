//! CLI command handlers

use clap::Subcommand;

pub mod diagnostics;
pub mod root;

#[derive(Subcommand)]
pub enum Commands {
    /// Check connectivity to Docker and print the resolved configuration
    Diagnostics,
}
