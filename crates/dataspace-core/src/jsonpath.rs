// ── JSON-path selection and assignment ──
//
// Selection follows RFC 9535 via serde_json_path. Assignment writes to
// every matched node; when nothing matches and the path is singular
// (plain names and indices only), the missing members are created.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use serde_json_path::JsonPath;
use thiserror::Error;

use crate::error::CoreError;
use crate::payload::Payload;

/// Why an assignment could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssignError {
    #[error("{path} matches nothing and is not a plain member path")]
    NotCreatable { path: String },

    #[error("cannot create {path}: {found} in the way")]
    Blocked { path: String, found: &'static str },
}

/// A compiled JSON-path expression that remembers its source text.
#[derive(Clone)]
pub struct JsonPathExpr {
    source: Arc<str>,
    compiled: Arc<JsonPath>,
}

impl JsonPathExpr {
    pub fn parse(source: &str) -> Result<Self, CoreError> {
        let compiled = JsonPath::parse(source).map_err(|e| CoreError::InvalidJsonPath {
            path: source.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            source: Arc::from(source),
            compiled: Arc::new(compiled),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Nodes matched in `document`: nothing → [`Payload::Empty`], one node →
    /// that value, several → an array of them.
    pub fn select(&self, document: &Value) -> Payload {
        let mut nodes = self.compiled.query(document).all();
        match nodes.len() {
            0 => Payload::Empty,
            1 => Payload::Json(nodes.remove(0).clone()),
            _ => Payload::Json(Value::Array(nodes.into_iter().cloned().collect())),
        }
    }

    /// Filter a raw payload. Non-JSON payloads pass through untouched.
    pub fn filter(&self, payload: &Payload) -> Payload {
        match payload.to_json() {
            Ok(document) => self.select(&document),
            Err(_) => payload.clone(),
        }
    }

    /// Set every node matched in `document` to `value`.
    pub fn assign(&self, document: &mut Value, value: &Value) -> Result<(), AssignError> {
        let pointers: Vec<String> = self
            .compiled
            .query_located(document)
            .locations()
            .map(|location| location.to_json_pointer())
            .collect();

        if pointers.is_empty() {
            return self.create(document, value);
        }

        for pointer in pointers {
            if let Some(slot) = document.pointer_mut(&pointer) {
                *slot = value.clone();
            }
        }
        Ok(())
    }

    fn create(&self, document: &mut Value, value: &Value) -> Result<(), AssignError> {
        let segments = singular_segments(&self.source).ok_or_else(|| AssignError::NotCreatable {
            path: self.source.to_string(),
        })?;

        let blocked = |found: &'static str| AssignError::Blocked {
            path: self.source.to_string(),
            found,
        };

        let mut slot = document;
        for segment in segments {
            slot = match segment {
                Segment::Key(key) => {
                    if slot.is_null() {
                        *slot = Value::Object(Map::new());
                    }
                    match slot {
                        Value::Object(map) => map.entry(key).or_insert(Value::Null),
                        other => return Err(blocked(kind_name(other))),
                    }
                }
                Segment::Index(index) => {
                    if slot.is_null() {
                        *slot = Value::Array(Vec::new());
                    }
                    match slot {
                        Value::Array(items) => {
                            if index == items.len() {
                                items.push(Value::Null);
                            }
                            items
                                .get_mut(index)
                                .ok_or_else(|| blocked("an array too short"))?
                        }
                        other => return Err(blocked(kind_name(other))),
                    }
                }
            };
        }
        *slot = value.clone();
        Ok(())
    }
}

impl fmt::Debug for JsonPathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("JsonPathExpr").field(&self.source).finish()
    }
}

impl fmt::Display for JsonPathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for JsonPathExpr {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for JsonPathExpr {}

// ── Singular paths ───────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Decompose `$.a['b'][0]` into member/index steps; `None` for anything
/// with wildcards, slices, filters or descendant segments.
fn singular_segments(source: &str) -> Option<Vec<Segment>> {
    let mut rest = source.strip_prefix('$')?;
    let mut segments = Vec::new();

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let end = after.find(['.', '[']).unwrap_or(after.len());
            let name = &after[..end];
            if name.is_empty() || name == "*" {
                return None;
            }
            segments.push(Segment::Key(name.to_owned()));
            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix('[') {
            let end = after.find(']')?;
            let inner = after[..end].trim();
            rest = &after[end + 1..];

            let quoted = inner
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
                .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
            match quoted {
                Some(name) => segments.push(Segment::Key(name.to_owned())),
                None => segments.push(Segment::Index(inner.parse().ok()?)),
            }
        } else {
            return None;
        }
    }
    Some(segments)
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
