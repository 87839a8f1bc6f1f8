// ── Pending patch operations ──
//
// A patch is "read the current document, set one JSON path, write it
// back", driven by deliveries on the topic. Each operation is armed
// until the next delivery, then ends as applied, expired or failed.
// All armed operations of a topic react to the same delivery in
// registration order and share one write-back.

use std::fmt;

use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::jsonpath::JsonPathExpr;
use crate::payload::Payload;

/// Terminal state of a patch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The value was written and the document republished.
    Applied,
    /// The deadline passed before a document arrived.
    Expired,
    /// The document could not be decoded or the path not applied.
    Failed { reason: String },
}

impl fmt::Display for PatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied => f.write_str("applied"),
            Self::Expired => f.write_str("expired"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PatchOperation {
    pub id: u64,
    pub path: JsonPathExpr,
    pub value: Value,
    pub deadline: Instant,
}

impl PatchOperation {
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.deadline
    }
}

/// Result of running a topic's armed operations against one delivery.
#[derive(Debug)]
pub(crate) struct PatchRun {
    pub outcomes: Vec<(u64, PatchOutcome)>,
    /// Updated document to publish, if at least one operation applied.
    pub document: Option<Value>,
}

/// Apply `operations` in order to the delivered `current` document.
///
/// An empty or `null` document counts as `{}`. A failing operation
/// leaves the document as the previous operations left it.
pub(crate) fn apply(current: &Payload, operations: &[PatchOperation], now: Instant) -> PatchRun {
    let mut outcomes = Vec::with_capacity(operations.len());
    let (live, expired): (Vec<_>, Vec<_>) = operations.iter().partition(|op| !op.is_expired(now));
    outcomes.extend(expired.iter().map(|op| (op.id, PatchOutcome::Expired)));

    if live.is_empty() {
        return PatchRun {
            outcomes,
            document: None,
        };
    }

    let mut document = match decode_document(current) {
        Ok(document) => document,
        Err(reason) => {
            outcomes.extend(live.iter().map(|op| {
                (
                    op.id,
                    PatchOutcome::Failed {
                        reason: reason.clone(),
                    },
                )
            }));
            return PatchRun {
                outcomes,
                document: None,
            };
        }
    };

    let mut applied = false;
    for op in live {
        let mut candidate = document.clone();
        match op.path.assign(&mut candidate, &op.value) {
            Ok(()) => {
                document = candidate;
                applied = true;
                outcomes.push((op.id, PatchOutcome::Applied));
            }
            Err(e) => outcomes.push((
                op.id,
                PatchOutcome::Failed {
                    reason: e.to_string(),
                },
            )),
        }
    }

    PatchRun {
        outcomes,
        document: applied.then_some(document),
    }
}

fn decode_document(current: &Payload) -> Result<Value, String> {
    if current.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    match current.to_json() {
        Ok(Value::Null) => Ok(Value::Object(Map::new())),
        Ok(document) => Ok(document),
        Err(e) => Err(format!("current document is not JSON: {e}")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn op(id: u64, path: &str, value: Value, deadline: Instant) -> PatchOperation {
        PatchOperation {
            id,
            path: JsonPathExpr::parse(path).unwrap(),
            value,
            deadline,
        }
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn empty_document_becomes_object() {
        let run = apply(&Payload::from("{}"), &[op(1, "$.a", json!(5), later())], Instant::now());
        assert_eq!(run.document, Some(json!({"a": 5})));
        assert_eq!(run.outcomes, vec![(1, PatchOutcome::Applied)]);

        let run = apply(&Payload::Empty, &[op(1, "$.a", json!(5), later())], Instant::now());
        assert_eq!(run.document, Some(json!({"a": 5})));

        let run = apply(&Payload::from("null"), &[op(1, "$.a", json!(5), later())], Instant::now());
        assert_eq!(run.document, Some(json!({"a": 5})));
    }

    #[test]
    fn operations_compose_in_order() {
        let ops = [
            op(1, "$.a", json!(1), later()),
            op(2, "$.b", json!(2), later()),
            op(3, "$.a", json!(3), later()),
        ];
        let run = apply(&Payload::from(r#"{"c":0}"#), &ops, Instant::now());
        assert_eq!(run.document, Some(json!({"a": 3, "b": 2, "c": 0})));
        assert_eq!(run.outcomes.len(), 3);
    }

    #[test]
    fn expired_operations_never_write() {
        let now = Instant::now();
        let past = now.checked_sub(Duration::from_secs(1)).unwrap();
        let run = apply(&Payload::from("{}"), &[op(1, "$.a", json!(1), past)], now);
        assert_eq!(run.document, None);
        assert_eq!(run.outcomes, vec![(1, PatchOutcome::Expired)]);
    }

    #[test]
    fn undecodable_document_fails_every_live_operation() {
        let run = apply(
            &Payload::from("not json"),
            &[op(1, "$.a", json!(1), later()), op(2, "$.b", json!(2), later())],
            Instant::now(),
        );
        assert_eq!(run.document, None);
        assert!(
            run.outcomes
                .iter()
                .all(|(_, outcome)| matches!(outcome, PatchOutcome::Failed { .. }))
        );
    }

    #[test]
    fn failing_operation_does_not_block_others() {
        let ops = [
            op(1, "$.n.x", json!(1), later()),
            op(2, "$.ok", json!(true), later()),
        ];
        let run = apply(&Payload::from(r#"{"n":3}"#), &ops, Instant::now());
        assert_eq!(run.document, Some(json!({"n": 3, "ok": true})));
        assert!(matches!(run.outcomes[0].1, PatchOutcome::Failed { .. }));
        assert_eq!(run.outcomes[1], (2, PatchOutcome::Applied));
    }
}
