// ── Payload model ──
//
// Deliveries are classified once, where the message is received, and
// carry a tagged payload from there on.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use strum::Display;

/// Where a delivered value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Live message on the shared topic.
    Public,
    /// Reply on this client's private topic.
    Private,
    /// Broker-held last value replayed on subscribe.
    Retained,
    /// Replayed from the local cache to a new subscriber.
    Cached,
    /// Local write not yet echoed by the broker.
    PendingUpdate,
}

/// A delivered or published value.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Raw bytes, exactly as on the wire.
    Bytes(Bytes),
    /// Caller-supplied text. Written as-is, never decoded as JSON.
    Text(String),
    /// A decoded JSON value (JSON-path selections, structured publishes).
    Json(Value),
    /// Nothing: a JSON-path filter matched no node.
    Empty,
}

impl Payload {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Bytes(bytes) => bytes.is_empty(),
            Self::Text(text) => text.is_empty(),
            Self::Json(_) => false,
            Self::Empty => true,
        }
    }

    /// Wire form: bytes and text as-is, JSON serialized, empty as zero bytes.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Bytes(bytes) => bytes.clone(),
            Self::Text(text) => Bytes::from(text.clone()),
            Self::Json(value) => Bytes::from(value.to_string()),
            Self::Empty => Bytes::new(),
        }
    }

    /// Interpret as a JSON document. Bytes and text must parse; empty is
    /// `null`.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Bytes(bytes) => serde_json::from_slice(bytes),
            Self::Text(text) => serde_json::from_str(text),
            Self::Json(value) => Ok(value.clone()),
            Self::Empty => Ok(Value::Null),
        }
    }

    /// Value to store at a JSON path. Bytes are decoded when they parse,
    /// otherwise taken as a (lossy) UTF-8 string; text is always a string.
    pub fn into_value(self) -> Value {
        match self {
            Self::Bytes(bytes) => serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())),
            Self::Text(text) => Value::String(text),
            Self::Json(value) => value,
            Self::Empty => Value::Null,
        }
    }

    /// Text rendering for display.
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Self::Bytes(bytes) => String::from_utf8_lossy(bytes),
            Self::Text(text) => Cow::Borrowed(text),
            Self::Json(Value::String(s)) => Cow::Borrowed(s),
            Self::Json(value) => Cow::Owned(value.to_string()),
            Self::Empty => Cow::Borrowed(""),
        }
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(Bytes::copy_from_slice(bytes))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

// ── Delivery ─────────────────────────────────────────────────────────

/// One value handed to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// `scheme://host[:port]/topic` of the delivering server.
    pub url: String,
    /// Topic without JSON-path suffix or private prefix.
    pub topic: String,
    pub payload: Payload,
    pub kind: MessageKind,
}

// ── Handler ──────────────────────────────────────────────────────────

/// Subscriber callback.
///
/// Two handlers are equal only if they are clones of the same
/// registration, which is what (un)subscribe identity is based on.
#[derive(Clone)]
pub struct Handler(Arc<dyn Fn(&Delivery) + Send + Sync>);

impl Handler {
    pub fn new(f: impl Fn(&Delivery) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, delivery: &Delivery) {
        (self.0)(delivery);
    }
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Handler {}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn kinds_display_like_wire_names() {
        assert_eq!(MessageKind::PendingUpdate.to_string(), "PENDING_UPDATE");
        assert_eq!(MessageKind::Retained.to_string(), "RETAINED");
    }

    #[test]
    fn strings_and_bytes_publish_verbatim() {
        assert_eq!(Payload::from("hello").to_bytes(), Bytes::from_static(b"hello"));
        assert_eq!(
            Payload::from(vec![0xff, 0x00]).to_bytes(),
            Bytes::from_static(&[0xff, 0x00])
        );
    }

    #[test]
    fn structured_values_publish_as_json() {
        let payload = Payload::from(json!({"a": 5}));
        assert_eq!(payload.to_bytes(), Bytes::from_static(br#"{"a":5}"#));
    }

    #[test]
    fn into_value_decodes_bytes_only() {
        assert_eq!(Payload::from(Bytes::from_static(b"5")).into_value(), json!(5));
        assert_eq!(
            Payload::from(Bytes::from_static(b"not json")).into_value(),
            json!("not json")
        );
        assert_eq!(Payload::from("5").into_value(), json!("5"));
        assert_eq!(Payload::from(r#"{"a":1}"#.to_owned()).into_value(), json!(r#"{"a":1}"#));
        assert_eq!(Payload::Empty.into_value(), Value::Null);
    }

    #[test]
    fn to_json_requires_valid_json() {
        assert!(Payload::from("{").to_json().is_err());
        assert_eq!(Payload::Empty.to_json().ok(), Some(Value::Null));
    }

    #[test]
    fn handler_identity_follows_registration() {
        let a = Handler::new(|_| {});
        let b = Handler::new(|_| {});
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
