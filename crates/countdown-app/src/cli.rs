//! CLI command definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use countdown_core::LogFormat;

/// Host for the countdown offline worker: installs cache generations and
/// replays page traffic, sync, push and messages against them.
#[derive(Parser, Debug)]
#[command(name = "countdown-sw")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Worker configuration file (JSON)
    #[arg(long, global = true, env = "COUNTDOWN_CONFIG", hide_env = true)]
    pub config: Option<PathBuf>,

    /// Override the directory holding cache buckets
    #[arg(long, global = true, env = "COUNTDOWN_CACHE_DIR", hide_env = true)]
    pub cache_dir: Option<PathBuf>,

    /// Override the cache generation
    #[arg(long, global = true, env = "COUNTDOWN_GENERATION", hide_env = true)]
    pub generation: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format (pretty, compact, json)
    #[arg(long, global = true, default_value = "pretty")]
    pub log_format: LogFormat,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install the configured generation and activate it
    Install,

    /// Send a request through the active worker
    Fetch {
        /// Path in the app origin, or an absolute URL
        target: String,

        /// Issue the request as a page navigation
        #[arg(long)]
        navigate: bool,

        /// HTTP method
        #[arg(long, default_value = "GET")]
        method: String,
    },

    /// Fire a background sync tag
    Sync {
        /// Tag to fire (defaults to the configured sync tag)
        tag: Option<String>,
    },

    /// Deliver a push message
    Push {
        /// Text payload
        payload: Option<String>,
    },

    /// Post a page message (SKIP_WAITING, CACHE_QUOTE, GET_CACHE_SIZE, CLEAR_CACHE)
    Message {
        /// Message type
        kind: String,

        /// JSON data attached to the message
        #[arg(long)]
        data: Option<String>,
    },

    /// Show cache buckets and the active generation
    Status,
}
