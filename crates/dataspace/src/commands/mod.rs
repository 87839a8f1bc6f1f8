//! Command dispatch: bridges CLI args -> hub operations -> output formatting.

pub mod admin;
pub mod data;

use clap::ValueEnum;
use tracing::debug;

use dataspace_config::PASSWORD_ENV;
use dataspace_core::DataHub;

use crate::cli::{Command, GlobalOpts, OutputFormat};
use crate::error::CliError;
use crate::output;

/// Everything a command handler needs.
pub struct Ctx {
    pub hub: DataHub,
    /// Server for URLs given as bare topics.
    pub server: Option<String>,
    pub output: OutputFormat,
    pub quiet: bool,
}

impl Ctx {
    /// Build the hub from the config file, the active profile and
    /// global flag overrides.
    pub fn build(global: &GlobalOpts) -> Result<Self, CliError> {
        let config = dataspace_config::load_config()?;
        let profile = config.profile(global.profile.as_deref())?;

        let mut hub_config = config.hub_config(profile.map(|(_, p)| p))?;
        if let Some(timeout) = global.timeout {
            hub_config.get_timeout = timeout;
            hub_config.admin_timeout = timeout;
            hub_config.connect_timeout = timeout;
        }
        let hub = DataHub::new(hub_config);

        let server = global
            .server
            .clone()
            .or_else(|| profile.map(|(_, p)| p.server.clone()));

        if let Some(user) = &global.user {
            let server = server.as_deref().ok_or_else(|| CliError::Validation {
                field: "--user".into(),
                reason: "needs --server or a profile with a server".into(),
            })?;
            let password = std::env::var(PASSWORD_ENV).map_err(|_| CliError::NoCredentials {
                profile: "command line".into(),
                env: PASSWORD_ENV.into(),
            })?;
            hub.add_credentials(server, user.clone(), password)?;
        } else if let Some((name, profile)) = profile {
            let registered = dataspace_config::register_credentials(&hub, profile, name)?;
            debug!(profile = name, registered, "profile loaded");
        }

        let output = global
            .output
            .or_else(|| OutputFormat::from_str(&config.defaults.output, true).ok())
            .unwrap_or(OutputFormat::Table);

        Ok(Self {
            hub,
            server,
            output,
            quiet: global.quiet,
        })
    }

    /// Full URL for `input`: as given when it carries a scheme, otherwise
    /// a topic on the default server.
    pub fn url(&self, input: &str) -> Result<String, CliError> {
        if input.contains("://") {
            return Ok(input.to_owned());
        }
        let server = self.server.as_deref().ok_or_else(|| CliError::NoServer {
            url: input.to_owned(),
        })?;
        Ok(format!(
            "{}/{}",
            server.trim_end_matches('/'),
            input.trim_start_matches('/')
        ))
    }

    pub fn print(&self, rendered: &str) {
        output::print_output(rendered, self.quiet);
    }

    /// Status line on stderr, unless quiet.
    pub fn note(&self, message: &str) {
        if !self.quiet {
            eprintln!("{message}");
        }
    }
}

/// Dispatch a hub-bound command to its handler.
pub async fn dispatch(cmd: Command, ctx: &Ctx) -> Result<(), CliError> {
    match cmd {
        Command::Get(args) => data::get(ctx, &args).await,
        Command::Publish(args) => data::publish(ctx, args).await,
        Command::Ls(args) => data::ls(ctx, &args).await,
        Command::Watch(args) => data::watch(ctx, &args).await,
        Command::Cached(args) => data::cached(ctx, &args).await,
        Command::LogAt(args) => data::log_at(ctx, &args).await,
        Command::FilesAt(args) => data::files_at(ctx, &args).await,
        Command::Link(args) => data::link(ctx, &args).await,
        Command::Admin(args) => admin::handle(ctx, args).await,
        Command::Completions(_) => Err(CliError::Internal(
            "completions are generated without a hub".into(),
        )),
    }
}
