//! Output formatting: table, JSON, raw.
//!
//! Renders data in the format selected by `--output`. Table uses `tabled`,
//! structured formats use serde, raw emits bare values for scripting.

use std::io::{self, Write};

use serde::Serialize;
use serde_json::{Value, json};
use tabled::{Table, Tabled, settings::Style};

use dataspace_core::{CachedPayload, Delivery, DirEntry, Record};

use crate::cli::OutputFormat;
use crate::error::CliError;

// ── Render dispatchers ───────────────────────────────────────────────

/// Render a list in the chosen format. `raw_fn` yields one line per item.
pub fn render_list<T, R>(
    format: OutputFormat,
    data: &[T],
    to_row: impl Fn(&T) -> R,
    raw_fn: impl Fn(&T) -> String,
) -> Result<String, CliError>
where
    T: Serialize,
    R: Tabled,
{
    match format {
        OutputFormat::Table => {
            let rows: Vec<R> = data.iter().map(to_row).collect();
            Ok(render_table(&rows))
        }
        OutputFormat::Json => Ok(serde_json::to_string_pretty(data)?),
        OutputFormat::JsonCompact => Ok(serde_json::to_string(data)?),
        OutputFormat::Raw => Ok(data.iter().map(raw_fn).collect::<Vec<_>>().join("\n")),
    }
}

/// Print rendered output to stdout, respecting quiet mode.
pub fn print_output(output: &str, quiet: bool) {
    if quiet || output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}

fn render_table<R: Tabled>(rows: &[R]) -> String {
    Table::new(rows).with(Style::rounded()).to_string()
}

// ── Deliveries ───────────────────────────────────────────────────────

#[derive(Tabled)]
struct FieldRow {
    #[tabled(rename = "Field")]
    field: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

fn delivery_json(delivery: &Delivery) -> Value {
    json!({
        "url": delivery.url,
        "topic": delivery.topic,
        "kind": delivery.kind.to_string(),
        "payload": delivery.payload.clone().into_value(),
    })
}

pub fn render_delivery(format: OutputFormat, delivery: &Delivery) -> Result<String, CliError> {
    match format {
        OutputFormat::Table => Ok(render_table(&[
            FieldRow {
                field: "url",
                value: delivery.url.clone(),
            },
            FieldRow {
                field: "kind",
                value: delivery.kind.to_string(),
            },
            FieldRow {
                field: "payload",
                value: delivery.payload.as_text().into_owned(),
            },
        ])),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&delivery_json(delivery))?),
        OutputFormat::JsonCompact => Ok(serde_json::to_string(&delivery_json(delivery))?),
        OutputFormat::Raw => Ok(delivery.payload.as_text().into_owned()),
    }
}

pub fn render_cached(format: OutputFormat, url: &str, cached: &CachedPayload) -> Result<String, CliError> {
    let text = String::from_utf8_lossy(&cached.payload);
    let doc = || {
        json!({
            "url": url,
            "kind": cached.kind.to_string(),
            "cached_at": cached.cached_at.to_rfc3339(),
            "payload": serde_json::from_slice::<Value>(&cached.payload)
                .unwrap_or_else(|_| Value::String(text.clone().into_owned())),
        })
    };
    match format {
        OutputFormat::Table => Ok(render_table(&[
            FieldRow {
                field: "url",
                value: url.to_owned(),
            },
            FieldRow {
                field: "kind",
                value: cached.kind.to_string(),
            },
            FieldRow {
                field: "cached at",
                value: cached.cached_at.to_rfc3339(),
            },
            FieldRow {
                field: "payload",
                value: text.clone().into_owned(),
            },
        ])),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&doc())?),
        OutputFormat::JsonCompact => Ok(serde_json::to_string(&doc())?),
        OutputFormat::Raw => Ok(text.into_owned()),
    }
}

// ── Directories ──────────────────────────────────────────────────────

#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
}

pub fn render_entries(format: OutputFormat, entries: &[DirEntry]) -> Result<String, CliError> {
    render_list(
        format,
        entries,
        |e| EntryRow {
            name: e.name.clone(),
            kind: e.kind.to_string(),
        },
        |e| e.name.clone(),
    )
}

// ── Records ──────────────────────────────────────────────────────────

#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Fields")]
    fields: String,
}

pub fn render_records(format: OutputFormat, records: &[Record]) -> Result<String, CliError> {
    render_list(
        format,
        records,
        |r| RecordRow {
            time: r.time.map(|t| t.to_rfc3339()).unwrap_or_default(),
            fields: Value::Object(r.fields.clone()).to_string(),
        },
        |r| Value::Object(r.fields.clone()).to_string(),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use dataspace_core::{MessageKind, Payload};

    use super::*;

    fn delivery() -> Delivery {
        Delivery {
            url: "mqtt://broker/a".into(),
            topic: "a".into(),
            payload: Payload::Json(json!({"v": 1})),
            kind: MessageKind::Retained,
        }
    }

    #[test]
    fn raw_prints_payload_only() {
        assert_eq!(render_delivery(OutputFormat::Raw, &delivery()).unwrap(), r#"{"v":1}"#);
    }

    #[test]
    fn json_decodes_payload() {
        let out = render_delivery(OutputFormat::JsonCompact, &delivery()).unwrap();
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["payload"]["v"], json!(1));
        assert_eq!(value["kind"], json!("RETAINED"));
    }

    #[test]
    fn entries_render_one_name_per_line() {
        let entries = vec![DirEntry::new("a.glb"), DirEntry::new("sub/")];
        assert_eq!(render_entries(OutputFormat::Raw, &entries).unwrap(), "a.glb\nsub/");
        let table = render_entries(OutputFormat::Table, &entries).unwrap();
        assert!(table.contains("directory"));
    }
}
