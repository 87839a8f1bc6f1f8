//! Shared configuration for dataspace tools.
//!
//! TOML profiles merged with `DATASPACE_` environment overrides,
//! password resolution from the environment, and translation into
//! `dataspace_core::HubConfig`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use dataspace_core::{Connector, DataHub, HubConfig, ServerAddress};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "DATASPACE_CONFIG";

/// Fallback password variable when a profile names none.
pub const PASSWORD_ENV: &str = "DATASPACE_PASSWORD";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("unknown profile '{profile}'")]
    UnknownProfile { profile: String },

    #[error("no password for profile '{profile}' (set ${env})")]
    NoCredentials { profile: String, env: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named.
    pub default_profile: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    /// Named server profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

/// Global defaults. Durations are humantime strings (`"10s"`, `"1m 30s"`);
/// unset values fall back to the hub's built-in defaults.
#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_output")]
    pub output: String,

    pub get_timeout: Option<String>,
    pub patch_timeout: Option<String>,
    pub admin_timeout: Option<String>,
    pub connect_timeout: Option<String>,
    pub keep_alive: Option<String>,

    /// Cached topics per connection; `0` disables the cache.
    pub cache_capacity: Option<usize>,

    /// IANA zone for time-indexed paths.
    pub time_zone: Option<String>,

    pub base_path: Option<String>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            output: default_output(),
            get_timeout: None,
            patch_timeout: None,
            admin_timeout: None,
            connect_timeout: None,
            keep_alive: None,
            cache_capacity: None,
            time_zone: None,
            base_path: None,
        }
    }
}

fn default_output() -> String {
    "table".into()
}

/// A named server profile.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Profile {
    /// Server URL, e.g. `mqtts://broker.example.org`.
    pub server: String,

    /// Username; anonymous when absent.
    pub username: Option<String>,

    /// Environment variable holding the password.
    pub password_env: Option<String>,

    /// Overrides `defaults.time_zone`.
    pub time_zone: Option<String>,

    /// Overrides `defaults.base_path`.
    pub base_path: Option<String>,
}

impl Profile {
    pub fn server_address(&self) -> Result<ServerAddress, ConfigError> {
        ServerAddress::parse(&self.server).map_err(|e| invalid("server", e.to_string()))
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Config file location: `$DATASPACE_CONFIG`, else the platform config
/// directory.
pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    ProjectDirs::from("org", "dataspace", "dataspace").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("dataspace");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the configuration from the canonical path and the environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Defaults, then `path` (if it exists), then `DATASPACE_*` variables
/// (`__` separates nesting: `DATASPACE_DEFAULTS__GET_TIMEOUT=5s`).
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let config: Config = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("DATASPACE_").split("__"))
        .extract()?;
    Ok(config)
}

impl Config {
    /// The named profile, or the default one. `Ok(None)` when no name is
    /// given and the default profile is not configured.
    pub fn profile<'a>(&'a self, name: Option<&'a str>) -> Result<Option<(&'a str, &'a Profile)>, ConfigError> {
        match name {
            Some(name) => self
                .profiles
                .get(name)
                .map(|profile| Some((name, profile)))
                .ok_or_else(|| ConfigError::UnknownProfile {
                    profile: name.into(),
                }),
            None => Ok(self
                .default_profile
                .as_deref()
                .and_then(|name| self.profiles.get(name).map(|profile| (name, profile)))),
        }
    }

    /// Hub settings from the defaults, with `profile` overrides applied.
    pub fn hub_config(&self, profile: Option<&Profile>) -> Result<HubConfig, ConfigError> {
        let defaults = &self.defaults;
        let mut config = HubConfig::default();

        if let Some(value) = &defaults.get_timeout {
            config.get_timeout = duration("get_timeout", value)?;
        }
        if let Some(value) = &defaults.patch_timeout {
            config.patch_timeout = duration("patch_timeout", value)?;
        }
        if let Some(value) = &defaults.admin_timeout {
            config.admin_timeout = duration("admin_timeout", value)?;
        }
        if let Some(value) = &defaults.connect_timeout {
            config.connect_timeout = duration("connect_timeout", value)?;
        }
        if let Some(value) = &defaults.keep_alive {
            config.keep_alive = duration("keep_alive", value)?;
        }
        if let Some(capacity) = defaults.cache_capacity {
            config.cache_capacity = capacity;
        }

        let zone = profile
            .and_then(|p| p.time_zone.as_ref())
            .or(defaults.time_zone.as_ref());
        if let Some(zone) = zone {
            config.time_zone = zone
                .parse::<Tz>()
                .map_err(|_| invalid("time_zone", format!("unknown time zone '{zone}'")))?;
        }

        let base = profile
            .and_then(|p| p.base_path.as_ref())
            .or(defaults.base_path.as_ref());
        if let Some(base) = base {
            let base = base.trim_end_matches('/');
            if base.is_empty() {
                return Err(invalid("base_path", "must not be empty"));
            }
            base.clone_into(&mut config.base_path);
        }

        Ok(config)
    }
}

fn duration(field: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|e| invalid(field, format!("'{value}': {e}")))
}

// ── Credential resolution ───────────────────────────────────────────

/// Username and password for `profile`, or `None` for anonymous access.
///
/// The password is read from the profile's `password_env` variable,
/// falling back to `$DATASPACE_PASSWORD`.
pub fn resolve_credentials(
    profile: &Profile,
    profile_name: &str,
) -> Result<Option<(String, SecretString)>, ConfigError> {
    let Some(username) = profile.username.clone() else {
        return Ok(None);
    };
    let env = profile.password_env.as_deref().unwrap_or(PASSWORD_ENV);

    match std::env::var(env) {
        Ok(password) => Ok(Some((username, SecretString::from(password)))),
        Err(_) => Err(ConfigError::NoCredentials {
            profile: profile_name.into(),
            env: env.into(),
        }),
    }
}

/// Register the profile's credentials with `hub`. Returns whether any
/// were registered.
pub fn register_credentials<C: Connector>(
    hub: &DataHub<C>,
    profile: &Profile,
    profile_name: &str,
) -> Result<bool, ConfigError> {
    let Some((username, password)) = resolve_credentials(profile, profile_name)? else {
        return Ok(false);
    };
    hub.add_credentials(&profile.server, username, password.expose_secret())
        .map_err(|e| invalid("server", e.to_string()))?;
    Ok(true)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use figment::Jail;
    use pretty_assertions::assert_eq;

    use super::*;

    const SAMPLE: &str = r#"
        default_profile = "lab"

        [defaults]
        get_timeout = "3s"
        cache_capacity = 0

        [profiles.lab]
        server = "mqtt://broker.lab:1884"
        username = "alice"
        password_env = "LAB_PASSWORD"
        time_zone = "UTC"

        [profiles.public]
        server = "mqtts://data.example.org"
    "#;

    #[test]
    fn file_values_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", SAMPLE)?;
            let config = load_config_from(&jail.directory().join("config.toml")).unwrap();

            let (name, profile) = config.profile(None).unwrap().unwrap();
            assert_eq!(name, "lab");
            assert_eq!(profile.username.as_deref(), Some("alice"));

            let hub = config.hub_config(Some(profile)).unwrap();
            assert_eq!(hub.get_timeout, Duration::from_secs(3));
            assert_eq!(hub.cache_capacity, 0);
            assert_eq!(hub.time_zone, chrono_tz::UTC);
            assert_eq!(hub.patch_timeout, HubConfig::default().patch_timeout);
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", SAMPLE)?;
            jail.set_env("DATASPACE_DEFAULTS__GET_TIMEOUT", "250ms");
            jail.set_env("DATASPACE_DEFAULT_PROFILE", "public");
            let config = load_config_from(&jail.directory().join("config.toml")).unwrap();

            let (name, profile) = config.profile(None).unwrap().unwrap();
            assert_eq!(name, "public");
            let hub = config.hub_config(Some(profile)).unwrap();
            assert_eq!(hub.get_timeout, Duration::from_millis(250));
            assert_eq!(hub.time_zone, chrono_tz::Europe::Stockholm);
            Ok(())
        });
    }

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|jail| {
            let config = load_config_from(&jail.directory().join("absent.toml")).unwrap();
            assert!(config.profile(None).unwrap().is_none());
            assert_eq!(config.defaults.output, "table");
            Ok(())
        });
    }

    #[test]
    fn unknown_profile_is_an_error() {
        let config = Config::default();
        let err = config.profile(Some("nope")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProfile { .. }));
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = Config::default();
        config.defaults.get_timeout = Some("soon".into());
        assert!(matches!(
            config.hub_config(None).unwrap_err(),
            ConfigError::Validation { field, .. } if field == "get_timeout"
        ));

        let mut config = Config::default();
        config.defaults.time_zone = Some("Mars/Olympus".into());
        assert!(config.hub_config(None).is_err());
    }

    #[test]
    fn password_comes_from_named_variable() {
        Jail::expect_with(|jail| {
            let profile = Profile {
                server: "mqtt://broker.lab".into(),
                username: Some("alice".into()),
                password_env: Some("LAB_PASSWORD".into()),
                time_zone: None,
                base_path: None,
            };
            assert!(matches!(
                resolve_credentials(&profile, "lab").unwrap_err(),
                ConfigError::NoCredentials { env, .. } if env == "LAB_PASSWORD"
            ));

            jail.set_env("LAB_PASSWORD", "s3cret");
            let (user, password) = resolve_credentials(&profile, "lab").unwrap().unwrap();
            assert_eq!(user, "alice");
            assert_eq!(password.expose_secret(), "s3cret");
            Ok(())
        });
    }

    #[test]
    fn anonymous_profiles_register_nothing() {
        let profile = Profile {
            server: "mqtt://broker.lab".into(),
            username: None,
            password_env: None,
            time_zone: None,
            base_path: None,
        };
        let hub = DataHub::with_connector(dataspace_core::MemoryBroker::new(), HubConfig::default());
        assert!(!register_credentials(&hub, &profile, "lab").unwrap());
        assert!(!hub.has_credentials("mqtt://broker.lab").unwrap());
    }

    #[test]
    fn registered_credentials_reach_the_hub() {
        Jail::expect_with(|jail| {
            jail.set_env(PASSWORD_ENV, "pw");
            let profile = Profile {
                server: "mqtt://broker.lab".into(),
                username: Some("bob".into()),
                password_env: None,
                time_zone: None,
                base_path: None,
            };
            let hub = DataHub::with_connector(dataspace_core::MemoryBroker::new(), HubConfig::default());
            assert!(register_credentials(&hub, &profile, "lab").unwrap());
            assert!(hub.has_credentials("broker.lab").unwrap());
            Ok(())
        });
    }
}
