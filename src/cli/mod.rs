//! CLI argument definitions for taskdeck.

use clap::{Parser, Subcommand, ValueEnum};

/// taskdeck - inspect and edit resolved settings.
///
/// Every value shown is resolved with the same precedence the application
/// uses: runtime override > environment > .env > config.kdl > default.
#[derive(Parser, Debug)]
#[command(name = "taskdeck")]
#[command(author, version, about = "Inspect and edit taskdeck settings", long_about = None)]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Directory holding config.kdl.
    /// Defaults to TASKDECK_CONFIG_DIR, then the platform config directory.
    #[arg(long = "config-dir", global = true)]
    pub config_dir: Option<std::path::PathBuf>,

    /// Emit debug logs on stderr
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show resolved settings and where each value came from
    Show {
        /// Only show one section
        #[arg(value_enum)]
        section: Option<Section>,
    },

    /// Get a value stored in config.kdl (e.g. user.theme, agents.summary.model)
    Get {
        /// Dotted setting key
        key: String,
    },

    /// Set a value in config.kdl, keeping comments and other settings intact
    Set {
        /// Dotted setting key
        key: String,
        /// New value; an empty string clears optional values
        value: String,
    },

    /// Show the paths of config.kdl and the .env override file
    Path,

    /// List recognised environment variables and their resolved values
    Env,
}

/// Settings sections accepted by `show`.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Section {
    Agents,
    User,
    Database,
    Window,
}
