//! CLI commands for the skein workflow engine.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use uuid::Uuid;

/// skein - durable workflow engine CLI
#[derive(Parser, Debug)]
#[command(name = "skein", version, about = "Durable label-based workflow engine")]
pub struct Cli {
    /// Configuration profile to use
    #[arg(long, global = true, env = "SKEIN_PROFILE")]
    pub profile: Option<String>,

    /// Path to config file (overrides default locations)
    #[arg(long, global = true, env = "SKEIN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database URL (overrides config and `DATABASE_URL`)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// The subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run due strands until interrupted
    Worker {
        /// Run every due strand once and exit
        #[arg(long)]
        once: bool,

        /// Worker identifier used in logs
        #[arg(long)]
        id: Option<String>,

        /// Per-strand time budget in milliseconds (overrides config)
        #[arg(long)]
        time_budget_ms: Option<u64>,
    },

    /// Show a strand
    Status {
        /// Strand ID (UUID)
        strand_id: Uuid,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List strands
    List {
        /// Only strands running this prog
        #[arg(long, short = 'p')]
        prog: Option<String>,

        /// Only children of this strand
        #[arg(long)]
        parent: Option<Uuid>,

        /// Max strands to return
        #[arg(long, default_value = "100")]
        limit: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Increment a strand's semaphore
    Incr {
        /// Strand ID (UUID)
        strand_id: Uuid,

        /// Semaphore name (e.g. `destroy`)
        name: String,
    },

    /// Start a subnet rekey over the given nics
    Rekey {
        /// Nic identifiers
        #[arg(required = true)]
        nics: Vec<String>,

        /// Page if the rekey is not finished within this many seconds
        #[arg(long)]
        deadline_secs: Option<u64>,
    },

    /// Manage pages
    Pages {
        /// Page subcommand
        #[command(subcommand)]
        command: PageCommands,
    },

    /// Create the database schema
    Migrate,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Manage configuration
    Config {
        /// Config subcommand
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Page subcommands
#[derive(Subcommand, Debug)]
pub enum PageCommands {
    /// List pages
    List {
        /// Include resolved pages
        #[arg(long)]
        all: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a page
    Resolve {
        /// Page ID (UUID)
        page_id: Uuid,
    },
    /// Raise a page owned by a `PageNexus` strand
    Create {
        /// One-line summary
        summary: String,
    },
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show resolved configuration
    Show,
    /// Validate configuration
    Validate,
    /// Show config file locations
    Paths,
}

impl Cli {
    /// Parse CLI arguments
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
