//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and process exit codes.

use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use dataspace_config::ConfigError;
use dataspace_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not connect to broker at {server}")]
    #[diagnostic(
        code(dataspace::connection_failed),
        help("{reason}\nCheck the server URL and that the broker is reachable.")
    )]
    ConnectionFailed { server: String, reason: String },

    // ── Authentication ───────────────────────────────────────────────
    #[error("Authentication failed")]
    #[diagnostic(
        code(dataspace::auth_failed),
        help("{message}\nCheck the username and the password variable of your profile.")
    )]
    AuthFailed { message: String },

    #[error("No password for profile '{profile}'")]
    #[diagnostic(
        code(dataspace::no_credentials),
        help("Export the password in ${env}.")
    )]
    NoCredentials { profile: String, env: String },

    // ── Data ─────────────────────────────────────────────────────────
    #[error("No value at {url} within {}", humantime::format_duration(*.timeout))]
    #[diagnostic(
        code(dataspace::no_value),
        help("Nothing is published there, or the broker is slow. Try a longer --timeout.")
    )]
    NoValue { url: String, timeout: Duration },

    #[error("Nothing cached for {url}")]
    #[diagnostic(code(dataspace::not_cached))]
    NotCached { url: String },

    #[error("{topic} is not a directory")]
    #[diagnostic(code(dataspace::not_a_directory), help("{reason}"))]
    NotADirectory { topic: String, reason: String },

    #[error("Cannot decode {topic}: {reason}")]
    #[diagnostic(code(dataspace::decode))]
    Decode { topic: String, reason: String },

    // ── Control plane ────────────────────────────────────────────────
    #[error("Broker rejected {command}: {message}")]
    #[diagnostic(code(dataspace::rejected))]
    Rejected { command: String, message: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(dataspace::validation))]
    Validation { field: String, reason: String },

    #[error("No server for '{url}'")]
    #[diagnostic(
        code(dataspace::no_server),
        help("Use a full mqtt://host/topic URL, pass --server, or set `server` in a profile.")
    )]
    NoServer { url: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(code(dataspace::profile_not_found), help("Profiles are read from {path}"))]
    ProfileNotFound { name: String, path: String },

    #[error(transparent)]
    #[diagnostic(code(dataspace::config))]
    Config(Box<ConfigError>),

    // ── Timeout ──────────────────────────────────────────────────────
    #[error("{operation} timed out after {}", humantime::format_duration(*.timeout))]
    #[diagnostic(
        code(dataspace::timeout),
        help("Increase the limit with --timeout or check broker responsiveness.")
    )]
    Timeout { operation: String, timeout: Duration },

    // ── Internal / IO ────────────────────────────────────────────────
    #[error("{0}")]
    #[diagnostic(code(dataspace::internal))]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    #[diagnostic(code(dataspace::json))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::AuthFailed { .. } | Self::NoCredentials { .. } => exit_code::AUTH,
            Self::NoValue { .. } | Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. }
            | Self::NoServer { .. }
            | Self::ProfileNotFound { .. }
            | Self::Json(_) => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConnectionFailed { server, reason } => Self::ConnectionFailed { server, reason },
            CoreError::AuthenticationFailed { message } => Self::AuthFailed { message },
            CoreError::Disconnected => Self::ConnectionFailed {
                server: "(disconnected)".into(),
                reason: "The broker connection was closed".into(),
            },
            CoreError::Timeout { operation, timeout } => Self::Timeout { operation, timeout },
            CoreError::InvalidUrl { url, reason } => Self::Validation {
                field: format!("url {url:?}"),
                reason,
            },
            CoreError::InvalidJsonPath { path, reason } => Self::Validation {
                field: format!("JSON path {path:?}"),
                reason,
            },
            CoreError::NotADirectory { topic, reason } => Self::NotADirectory { topic, reason },
            CoreError::Decode { topic, reason } => Self::Decode { topic, reason },
            CoreError::Rejected { command, message } => Self::Rejected { command, message },
            CoreError::Config { message } => Self::Validation {
                field: "configuration".into(),
                reason: message,
            },
            CoreError::Internal(message) => Self::Internal(message),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NoCredentials { profile, env } => Self::NoCredentials { profile, env },
            ConfigError::UnknownProfile { profile } => Self::ProfileNotFound {
                name: profile,
                path: dataspace_config::config_path().display().to_string(),
            },
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            other @ ConfigError::Figment(_) => Self::Config(Box::new(other)),
        }
    }
}
