// ── Directory listings ──
//
// A get on a topic ending in `/` is answered by the broker with the
// entries below it, as a JSON array of names (or an object keyed by
// name). Names ending in `/` are sub-directories.

use serde::Serialize;
use serde_json::Value;
use strum::Display;

use crate::address::{SEPARATOR, is_directory};
use crate::error::CoreError;
use crate::payload::Payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// One name in a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DirEntry {
    /// Name as listed, including the trailing separator for directories.
    pub name: String,
    pub kind: EntryKind,
}

impl DirEntry {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let kind = if is_directory(&name) {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        Self { name, kind }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Name without the directory marker.
    pub fn base_name(&self) -> &str {
        self.name.strip_suffix(SEPARATOR).unwrap_or(&self.name)
    }
}

/// Directory form of `topic`.
pub fn directory_topic(topic: &str) -> String {
    if is_directory(topic) {
        topic.to_owned()
    } else {
        format!("{topic}{SEPARATOR}")
    }
}

/// Interpret a listing reply for `topic`.
pub fn parse_listing(topic: &str, payload: &Payload) -> Result<Vec<DirEntry>, CoreError> {
    let not_a_directory = |reason: String| CoreError::NotADirectory {
        topic: topic.to_owned(),
        reason,
    };

    let value = payload
        .to_json()
        .map_err(|e| not_a_directory(format!("reply is not JSON: {e}")))?;

    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(name) => Ok(DirEntry::new(name)),
                other => Err(not_a_directory(format!(
                    "listing entry is not a name: {other}"
                ))),
            })
            .collect(),
        Value::Object(map) => Ok(map.into_iter().map(|(name, _)| DirEntry::new(name)).collect()),
        other => Err(not_a_directory(format!(
            "expected a list of names, got {}",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
