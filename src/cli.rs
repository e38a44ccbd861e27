//! CLI interface for Warden
//!
//! This module provides the command-line interface using clap's derive
//! API. The CLI is a thin shell over the runtime: it wires the store,
//! policy, provider, and proxy together and reacts to runtime events.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Warden AI Agent Governance Runtime
///
/// Drives an external model through a bounded, policy-governed execution
/// loop and verifies declared evidence before declaring success.
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Emit logs as JSON, one object per event
    #[arg(long, global = true)]
    pub log_json: bool,

    /// State directory for the database and artifacts (default: ~/.warden)
    #[arg(long, global = true, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute a session for a task spec file
    Run {
        /// Path to the task spec (.yaml, .yml, or .json)
        #[arg(long, value_name = "PATH")]
        spec: PathBuf,
    },

    /// Validate a task spec without executing it
    Validate {
        /// Path to the task spec (.yaml, .yml, or .json)
        #[arg(long, value_name = "PATH")]
        spec: PathBuf,
    },
}
