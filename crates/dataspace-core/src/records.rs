// ── JSON-lines logs ──
//
// Logged series are stored as one JSON object per line with a `time`
// field in epoch seconds.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::payload::Payload;

/// Field holding the record timestamp (epoch seconds).
pub const TIME_FIELD: &str = "time";

/// One line of a log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    /// Parsed `time` field; `None` when absent or not a number.
    pub time: Option<DateTime<Utc>>,
    pub fields: Map<String, Value>,
}

impl Record {
    fn from_object(fields: Map<String, Value>) -> Self {
        let time = fields
            .get(TIME_FIELD)
            .and_then(Value::as_f64)
            .and_then(epoch_to_datetime);
        Self { time, fields }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn epoch_to_datetime(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let millis = (secs * 1000.0).round();
    if millis.abs() > 8.64e18 {
        return None;
    }
    DateTime::from_timestamp_millis(millis as i64)
}

/// Decode a JSON-lines payload. Blank lines are skipped; every other
/// line must be a JSON object.
pub fn parse_records(topic: &str, payload: &Payload) -> Result<Vec<Record>, CoreError> {
    let decode = |line: usize, reason: String| CoreError::Decode {
        topic: topic.to_owned(),
        reason: format!("line {line}: {reason}"),
    };

    if let Some(Value::Array(items)) = payload.as_json() {
        return items
            .iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(map) => Ok(Record::from_object(map.clone())),
                other => Err(decode(i + 1, format!("expected an object, got {other}"))),
            })
            .collect();
    }

    payload
        .as_text()
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => Ok(Record::from_object(map)),
            Ok(other) => Err(decode(i + 1, format!("expected an object, got {other}"))),
            Err(e) => Err(decode(i + 1, e.to_string())),
        })
        .collect()
}
