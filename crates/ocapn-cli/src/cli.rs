//! Clap CLI definitions for the `ocapn` binary.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  ocapn serve                                   Serve the sturdyrefs from ~/.ocapn/config.toml
  ocapn serve --listen 127.0.0.1:7000           Serve on a fixed port
  ocapn fetch 127.0.0.1:7000 greeter alice      Fetch a sturdyref and call `greet` on it";

/// OCapN node over TCP.
#[derive(Parser)]
#[command(name = "ocapn", version, about = "OCapN node over TCP", after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a node serving the configured greeter sturdyrefs until Ctrl+C.
    Serve {
        /// Listen address (overrides `listen_addr` in the config).
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Fetch a sturdyref from a remote node and call `greet` on it.
    Fetch {
        /// TCP address of the remote node.
        address: String,
        /// Swissnum the object is registered under.
        swissnum: String,
        /// Name to greet.
        #[arg(default_value = "world")]
        name: String,
    },
}
