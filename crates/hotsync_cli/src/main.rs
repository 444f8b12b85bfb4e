//! HotSync CLI
//!
//! Command-line tools for the HotSync desktop.
//!
//! # Commands
//!
//! - `conduit` - Manage the conduit registry
//! - `sync` - Run one sync session against a handheld directory
//! - `inspect` - Dump the records of a database
//!
//! The desktop directory given with `--path` holds `registry.json`, the
//! desktop mirrors under `mirrors/` and the sync metadata under `metadata/`.

mod commands;

use clap::{Parser, Subcommand};
use commands::conduit::InstallOptions;
use hotsync_conduit::SyncType;
use hotsync_storage::FourCc;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// HotSync desktop tools.
#[derive(Parser)]
#[command(name = "hotsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the desktop directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the conduit registry
    Conduit {
        #[command(subcommand)]
        action: ConduitAction,
    },

    /// Run one sync session against a handheld directory
    Sync {
        /// Directory holding the handheld's store
        #[arg(short, long)]
        device: PathBuf,

        /// Force a slow sync of every database
        #[arg(long)]
        slow: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump the records of a database
    Inspect {
        /// Database name
        database: String,

        /// Read the handheld store in this directory instead of the mirrors
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum ConduitAction {
    /// List registered conduits in sync order
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show one conduit's configuration
    Show {
        /// Creator ID
        creator: FourCc,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Register a conduit
    Install {
        /// Creator ID
        creator: FourCc,

        /// Conduit name
        #[arg(short, long)]
        name: String,

        /// Display title
        #[arg(short, long)]
        title: Option<String>,

        /// Mirror directory, relative to the mirrors root
        #[arg(short, long)]
        directory: Option<String>,

        /// Handheld database to sync instead of every database of the creator
        #[arg(short, long)]
        remote: Option<String>,

        /// Sync priority, lower runs first
        #[arg(long)]
        priority: Option<u32>,

        /// Permanent sync type (fast, slow, handheld-to-pc, pc-to-handheld, ...)
        #[arg(long)]
        sync_type: Option<SyncType>,

        /// Replace an existing registration
        #[arg(long)]
        force: bool,
    },

    /// Unregister a conduit
    Remove {
        /// Creator ID
        creator: FourCc,
    },

    /// Change a conduit's sync priority
    Priority {
        /// Creator ID
        creator: FourCc,

        /// New priority
        priority: u32,
    },

    /// Set or clear a conduit's requested sync type
    Prefer {
        /// Creator ID
        creator: FourCc,

        /// Sync type; omit to clear the preference
        sync_type: Option<SyncType>,

        /// Apply to the next sync only
        #[arg(long)]
        once: bool,
    },

    /// Include a conduit in syncs
    Enable {
        /// Creator ID
        creator: FourCc,
    },

    /// Leave a conduit out of syncs
    Disable {
        /// Creator ID
        creator: FourCc,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Conduit { action } => {
            let path = cli.path.ok_or("Desktop path required for conduit")?;
            match action {
                ConduitAction::List { format } => commands::conduit::list(&path, &format)?,
                ConduitAction::Show { creator, format } => {
                    commands::conduit::show(&path, creator, &format)?;
                }
                ConduitAction::Install {
                    creator,
                    name,
                    title,
                    directory,
                    remote,
                    priority,
                    sync_type,
                    force,
                } => {
                    let options = InstallOptions {
                        name,
                        title,
                        directory,
                        remote,
                        priority,
                        sync_type,
                        force,
                    };
                    commands::conduit::install(&path, creator, options)?;
                }
                ConduitAction::Remove { creator } => commands::conduit::remove(&path, creator)?,
                ConduitAction::Priority { creator, priority } => {
                    commands::conduit::set_priority(&path, creator, priority)?;
                }
                ConduitAction::Prefer {
                    creator,
                    sync_type,
                    once,
                } => commands::conduit::prefer(&path, creator, sync_type, once)?,
                ConduitAction::Enable { creator } => {
                    commands::conduit::set_enabled(&path, creator, true)?;
                }
                ConduitAction::Disable { creator } => {
                    commands::conduit::set_enabled(&path, creator, false)?;
                }
            }
        }
        Commands::Sync {
            device,
            slow,
            format,
        } => {
            let path = cli.path.ok_or("Desktop path required for sync")?;
            commands::sync::run(&path, &device, slow, &format)?;
        }
        Commands::Inspect {
            database,
            device,
            format,
        } => {
            commands::inspect::run(cli.path.as_deref(), device.as_deref(), &database, &format)?;
        }
        Commands::Version => {
            println!("HotSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
