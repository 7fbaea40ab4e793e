//! CLI argument definitions for kticket.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{ENV_DIR, ENV_LOCK_TIMEOUT, Overrides};
use crate::ticket::{Status, TicketType};

/// kticket - tickets as markdown files, safe to edit from many processes at once.
///
/// Tickets live in `.ktickets/` at the git root, one `<id>.md` file each.
#[derive(Parser, Debug)]
#[command(name = "kt")]
#[command(author, version, about = "A file-backed ticket tracker", long_about = None)]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Ticket directory. Relative paths are taken from the current directory.
    /// Defaults to `.ktickets` at the git root.
    #[arg(long = "dir", global = true, env = ENV_DIR)]
    pub dir: Option<PathBuf>,

    /// How long to wait for a ticket lock, in milliseconds
    #[arg(long = "lock-timeout", global = true, env = ENV_LOCK_TIMEOUT, value_name = "MS")]
    pub lock_timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            dir: self.dir.clone(),
            lock_timeout_ms: self.lock_timeout_ms,
        }
    }
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a ticket
    Create {
        /// Ticket title
        title: String,

        /// Description text
        #[arg(short, long)]
        description: Option<String>,

        /// Ticket type (bug, feature, task, epic, chore)
        #[arg(short = 't', long = "type")]
        ticket_type: Option<TicketType>,

        /// Priority from 0 (highest) to 4 (lowest)
        #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=4))]
        priority: Option<u8>,

        /// Assignee (defaults to `git config user.name`)
        #[arg(short, long)]
        assignee: Option<String>,

        /// External reference, e.g. an issue URL
        #[arg(long)]
        external_ref: Option<String>,

        /// Parent ticket ID
        #[arg(long)]
        parent: Option<String>,

        /// Ticket this one depends on (repeatable)
        #[arg(long = "dep")]
        deps: Vec<String>,

        /// Design notes
        #[arg(long)]
        design: Option<String>,

        /// Acceptance criteria
        #[arg(long)]
        acceptance: Option<String>,

        /// Tests that must pass before the ticket can be closed
        #[arg(long)]
        tests: Option<String>,
    },

    /// Show tickets
    Show {
        /// Ticket IDs or unique parts of them
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// List tickets, newest first
    Ls {
        /// Only tickets with this status
        #[arg(long)]
        status: Option<Status>,

        /// Only tickets of this type
        #[arg(short = 't', long = "type")]
        ticket_type: Option<TicketType>,

        /// Only children of this ticket
        #[arg(long)]
        parent: Option<String>,
    },

    /// Append a timestamped note to a ticket
    AddNote {
        id: String,
        /// Note text; read from stdin when omitted
        text: Option<String>,
    },

    /// Open or in-progress tickets whose dependencies are all closed
    Ready,

    /// Open or in-progress tickets waiting on a dependency
    Blocked,

    /// Recently closed tickets
    Closed {
        /// Maximum number of tickets to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Mark tickets in progress
    Start {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Close tickets
    Close {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Reopen tickets
    Reopen {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Mark the tests of tickets as passed
    Pass {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Set the status of a ticket
    Status {
        id: String,
        /// open, in_progress or closed
        status: Status,
    },

    /// Dependency management commands
    Dep {
        #[command(subcommand)]
        command: DepCommands,
    },

    /// Link management commands (symmetric relationships)
    Link {
        #[command(subcommand)]
        command: LinkCommands,
    },

    /// Delete a closed ticket nothing active refers to
    Rm { id: String },

    /// Delete all closed tickets
    Purge {
        /// Actually delete; without this only the candidates are listed
        #[arg(long)]
        yes: bool,
    },

    /// Block until a ticket is closed
    Wait {
        id: String,

        /// Seconds between checks
        #[arg(long, default_value_t = 2.0)]
        interval: f64,

        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<f64>,
    },

    /// Ticket counts by status and type
    Stats,
}

/// Dependency subcommands
#[derive(Subcommand, Debug)]
pub enum DepCommands {
    /// Make a ticket depend on another
    Add {
        /// The dependent ticket
        id: String,
        /// The ticket it depends on
        dep: String,
    },

    /// Remove a dependency
    Rm { id: String, dep: String },

    /// Show the dependency tree of a ticket
    Tree {
        id: String,

        /// Expand tickets that were already shown
        #[arg(long)]
        full: bool,
    },
}

/// Link subcommands
#[derive(Subcommand, Debug)]
pub enum LinkCommands {
    /// Link tickets to each other
    Add {
        #[arg(required = true, num_args = 2..)]
        ids: Vec<String>,
    },

    /// Remove the link between two tickets
    Rm { a: String, b: String },
}
