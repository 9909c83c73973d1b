use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "harvest",
    version,
    about = "Deduplicating fleet backups into a content-addressed store",
    after_help = "\
Configuration file lookup order:
  1. --config <path>             (explicit flag)
  2. $HARVEST_CONFIG             (environment variable)
  3. ./harvest.yaml              (project)
  4. Platform user config dir + /harvest/config.yaml

Environment variables:
  HARVEST_CONFIG    Path to configuration file (overrides default search)"
)]
pub(crate) struct Cli {
    /// Path to configuration file (overrides HARVEST_CONFIG and default search)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Scan the given hosts and pull missing content into the store
    Pull {
        /// Hosts to back up
        #[arg(required = true)]
        hostnames: Vec<String>,
    },

    /// Sweep the store: staging workspace, unreferenced blobs, corrupted blobs
    Gc,

    /// Copy a blob out of the store by content hash
    Extract {
        /// 32-hex content hash of the blob
        hash: String,

        /// Destination directory
        dest: String,
    },

    /// Show store locations and total size
    Info,
}
