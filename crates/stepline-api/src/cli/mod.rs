//! CLI command definitions and dispatch for the `stepline` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod definition;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Run and manage versioned workflow definitions.
#[derive(Parser)]
#[command(name = "stepline", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server.
    Serve {
        /// Address to bind, host:port.
        #[arg(long, default_value = "127.0.0.1:7430")]
        addr: String,

        /// Export spans via OpenTelemetry (stdout exporter).
        #[arg(long)]
        otel: bool,
    },

    /// Validate and publish a definition document as a new version.
    Publish {
        /// Path to the YAML definition document.
        file: PathBuf,
    },

    /// Check a definition document offline without publishing.
    Validate {
        /// Path to the YAML definition document.
        file: PathBuf,
    },
}
