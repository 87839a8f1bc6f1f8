// ── Addressing ──
//
// `scheme://host[:port]/topic[$jsonpath]` → (server, topic, path).
// The topic part is taken verbatim: `?`, `#` and `+` are meaningful
// topic characters on the broker, so no query or fragment splitting
// happens here.

use std::fmt;

use dataspace_api::{Endpoint, Scheme};
use url::Url;

use crate::error::CoreError;

/// Reserved first level of per-client reply topics.
pub const PRIVATE_PREFIX: &str = "$private";

/// Separator between topic levels. A trailing one marks a directory.
pub const SEPARATOR: char = '/';

/// Introduces a JSON-path suffix on a topic.
pub const JSONPATH_DELIMITER: char = '$';

// ── ServerAddress ────────────────────────────────────────────────────

/// Normalized broker address; one connection exists per distinct value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    scheme: Scheme,
    host: String,
    /// `None` when absent or equal to the scheme's default.
    port: Option<u16>,
}

impl ServerAddress {
    /// Parse `scheme://host[:port]` or a bare `host[:port]` (assumed `mqtt`).
    ///
    /// Anything after the authority is ignored.
    pub fn parse(server: &str) -> Result<Self, CoreError> {
        let (scheme, rest) = match server.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("mqtt", server),
        };
        let authority = rest.split(SEPARATOR).next().unwrap_or_default();
        Self::from_parts(server, scheme, authority)
    }

    fn from_parts(original: &str, scheme: &str, authority: &str) -> Result<Self, CoreError> {
        let invalid = |reason: String| CoreError::InvalidUrl {
            url: original.to_owned(),
            reason,
        };

        let scheme: Scheme = scheme
            .parse()
            .map_err(|_| invalid(format!("unsupported scheme {scheme:?}")))?;
        if authority.is_empty() {
            return Err(invalid("missing host".into()));
        }

        let parsed = Url::parse(&format!("{scheme}://{authority}"))
            .map_err(|e| invalid(e.to_string()))?;
        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(invalid(
                "credentials in URLs are not supported; register them with the hub".into(),
            ));
        }
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".into()))?
            .to_ascii_lowercase();
        let port = parsed.port().filter(|p| *p != scheme.default_port());

        Ok(Self { scheme, host, port })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port that will actually be dialled.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.scheme.default_port())
    }

    /// Key under which credentials for this server are stored: `host[:port]`.
    pub fn credential_key(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{port}", self.host),
            None => self.host.clone(),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            scheme: self.scheme,
            host: self.host.clone(),
            port: self.port(),
        }
    }

    /// Full URL of `topic` on this server.
    pub fn url_for(&self, topic: &str) -> String {
        format!("{self}/{topic}")
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

// ── URL splitting ────────────────────────────────────────────────────

/// Split a data-space URL into its server and topic.
///
/// The topic keeps any JSON-path suffix. A single leading separator is
/// removed unless it is the whole path.
pub fn split(url: &str) -> Result<(ServerAddress, String), CoreError> {
    let Some((scheme, rest)) = url.split_once("://") else {
        return Err(CoreError::InvalidUrl {
            url: url.to_owned(),
            reason: "missing scheme (expected mqtt://host/topic)".into(),
        });
    };

    let (authority, path) = match rest.find(SEPARATOR) {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };
    let server = ServerAddress::from_parts(url, scheme, authority)?;

    let topic = match path.strip_prefix(SEPARATOR) {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => path,
    };
    Ok((server, topic.to_owned()))
}

/// Split `topic$jsonpath` at the last delimiter.
///
/// A delimiter at position 0 (or none at all) means there is no path;
/// the whole string is the topic. The returned path keeps its `$`.
pub fn split_jsonpath(topic: &str) -> (&str, Option<&str>) {
    match topic.rfind(JSONPATH_DELIMITER) {
        Some(idx) if idx > 0 => (&topic[..idx], Some(&topic[idx..])),
        _ => (topic, None),
    }
}

/// Directory topics end with the separator.
pub fn is_directory(topic: &str) -> bool {
    topic.ends_with(SEPARATOR)
}

/// Per-client reply variant of `topic`.
pub fn private_topic(client_id: &str, topic: &str) -> String {
    format!("{PRIVATE_PREFIX}/{client_id}/{topic}")
}

/// Reverse of [`private_topic`] for this client.
pub fn strip_private<'a>(client_id: &str, topic: &'a str) -> Option<&'a str> {
    topic
        .strip_prefix(PRIVATE_PREFIX)?
        .strip_prefix(SEPARATOR)?
        .strip_prefix(client_id)?
        .strip_prefix(SEPARATOR)
}
