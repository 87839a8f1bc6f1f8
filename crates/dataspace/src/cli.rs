//! Clap derive structures for the `dataspace` CLI.

use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

// ── Top-Level CLI ────────────────────────────────────────────────────

/// dataspace -- read, write and watch values in an MQTT data space
#[derive(Debug, Parser)]
#[command(
    name = "dataspace",
    version,
    about = "Read, write and watch values in an MQTT data space",
    long_about = "Addresses values as mqtt://host[:port]/topic[$jsonpath].\n\n\
        Topics without a scheme are resolved against --server or the active profile.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Configuration profile to use
    #[arg(long, short = 'p', env = "DATASPACE_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Server URL (overrides profile), e.g. mqtt://broker.local
    #[arg(long, short = 's', env = "DATASPACE_SERVER", global = true)]
    pub server: Option<String>,

    /// Username (password from $DATASPACE_PASSWORD)
    #[arg(long, short = 'u', env = "DATASPACE_USER", global = true)]
    pub user: Option<String>,

    /// Wait limit for reads, connects and control-plane replies (e.g. 5s, 500ms)
    #[arg(long, short = 't', value_parser = humantime::parse_duration, global = true)]
    pub timeout: Option<Duration>,

    /// Output format [default: defaults.output from the config file, else table]
    #[arg(long, short = 'o', env = "DATASPACE_OUTPUT", global = true)]
    pub output: Option<OutputFormat>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// Payload text only (scripting)
    Raw,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch the current value at a URL
    Get(UrlArgs),

    /// Publish a value (a $jsonpath suffix patches one field)
    #[command(alias = "pub")]
    Publish(PublishArgs),

    /// List a directory
    Ls(UrlArgs),

    /// Print deliveries as they arrive
    Watch(WatchArgs),

    /// Show the last cached value without subscribing
    Cached(UrlArgs),

    /// Fetch the time-indexed log bucket containing a timestamp
    LogAt(LogAtArgs),

    /// List the time-indexed directory containing a timestamp
    FilesAt(AtArgs),

    /// Ask the server to link a topic to another
    Link(LinkArgs),

    /// Broker access control (dynamic security)
    Admin(AdminArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
pub struct UrlArgs {
    /// mqtt[s]://host[:port]/topic[$jsonpath], or a topic on the default server
    pub url: String,
}

#[derive(Debug, Args)]
pub struct PublishArgs {
    pub url: String,

    /// Value to publish
    pub value: String,

    /// Parse the value as JSON instead of sending it as text
    #[arg(long)]
    pub json: bool,

    /// Delivery guarantee (0, 1 or 2); 0 is fire-and-forget
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u8).range(0..=2))]
    pub qos: u8,

    /// Ask the broker to keep the value for later subscribers
    #[arg(long)]
    pub retain: bool,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    pub url: String,

    /// Exit after this many deliveries
    #[arg(long, short = 'n')]
    pub count: Option<usize>,
}

#[derive(Debug, Args)]
pub struct AtArgs {
    /// Root of the time index
    pub url: String,

    /// Unix timestamp in seconds
    #[arg(allow_negative_numbers = true)]
    pub epoch: i64,
}

#[derive(Debug, Args)]
pub struct LogAtArgs {
    #[command(flatten)]
    pub at: AtArgs,

    /// Decode the JSON-lines log into records
    #[arg(long)]
    pub records: bool,
}

#[derive(Debug, Args)]
pub struct LinkArgs {
    pub url: String,

    /// Topic to link to
    pub target: String,
}

// ── Admin ────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct AdminArgs {
    #[command(subcommand)]
    pub command: AdminCommand,
}

#[derive(Debug, Subcommand)]
pub enum AdminCommand {
    /// Grant a group read/write access to its namespace
    EnsureGroup { server: String, group: String },

    /// Create a user with a personal role over its user directory
    AddUser {
        server: String,
        username: String,

        /// Display name, published to the user's directory
        #[arg(long)]
        full_name: Option<String>,

        /// Environment variable holding the new user's password
        #[arg(long, default_value = "DATASPACE_NEW_PASSWORD")]
        password_env: String,
    },

    /// Create a role
    CreateRole {
        server: String,
        role: String,

        #[arg(long)]
        text_name: Option<String>,
    },

    /// Create a group
    CreateGroup { server: String, group: String },

    /// Add a user to a group
    AddGroupClient {
        server: String,
        group: String,
        username: String,
    },
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    pub shell: Shell,
}
