use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// REAM process groups
/// Scoped, replicated process-group registry with quorum-style discovery
#[derive(Parser)]
#[command(name = "ream-pg")]
#[command(author = "REAM Team")]
#[command(version = "0.1.0")]
#[command(about = "Scoped process-group registry for REAM clusters")]
#[command(long_about = "
ream-pg runs scoped process-group registries:
- processes on any node join and leave named groups within a scope
- every node sees the cluster-wide membership of each group
- node failures purge the dead node's members; reconnects resync in full

Usage examples:
  ream-pg smoke                          # two workers join, control waits for 2
  ream-pg smoke --workers 5 --min-count 5
  ream-pg --config pg.toml config        # print the effective configuration
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

/// Available commands for the ream-pg CLI
#[derive(Subcommand)]
pub enum Commands {
    /// Run an in-process cluster and wait for a group to fill up
    Smoke {
        /// Scope name
        #[arg(long, default_value = "spg")]
        scope: String,

        /// Group name
        #[arg(long, default_value = "smoke")]
        group: String,

        /// Number of worker nodes, each joining one process
        #[arg(short, long, default_value = "2")]
        workers: usize,

        /// Members the control node waits for
        #[arg(short, long, default_value = "2")]
        min_count: usize,

        /// Wait timeout in milliseconds
        #[arg(short, long, default_value = "30000")]
        timeout_ms: u64,

        /// Print the member set as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}
