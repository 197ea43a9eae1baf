use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Number;

use crate::error::ValidationError;
use crate::hash::hash_str;
use crate::mask::TypeMask;

/// Key under which serialized entities embed their reference stub:
/// `{"__entityRef": <key>}`.
pub const ENTITY_REF_KEY: &str = "__entityRef";

// ---------------------------------------------------------------------------
// EntityKey
// ---------------------------------------------------------------------------

/// Global identity of an interned entity: `hash32("Typename:id")`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey(pub u32);

impl EntityKey {
    /// Derives the key for a `(typename, id)` pair.
    pub fn of(type_name: &str, id: &str) -> Self {
        Self(hash_str(&format!("{type_name}:{id}")))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// EntityHandle
// ---------------------------------------------------------------------------

/// Object-safe view of an interned entity.
///
/// The store crate implements this for its proxies; embedding the trait here
/// lets [`Value`] carry entities without depending on the store.
pub trait EntityHandle: fmt::Debug {
    /// The entity's global key.
    fn entity_key(&self) -> EntityKey;

    /// The discriminator literal this entity was interned under.
    fn type_name(&self) -> String;

    /// The entity id as a string.
    fn id(&self) -> String;

    /// Reads a field through the proxy: registers reactive dependencies and
    /// lazily parses the raw slot.
    fn field(&self, name: &str) -> Value;

    /// The unparsed slot for `name`, if present.
    fn raw_field(&self, name: &str) -> Option<Value>;

    /// Names of all raw fields currently held by the entity.
    fn field_names(&self) -> Vec<String>;
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// Outcome envelope produced by `result()`-wrapped schemas.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure(ValidationError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Runtime value for any schema node: raw wire data, parsed formats, and
/// interned entity proxies share this one representation.
#[derive(Clone)]
pub enum Value {
    /// An absent value. Distinct from `Null`, which is an explicit wire null.
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// A `date`-formatted calendar date (UTC).
    Date(NaiveDate),
    /// A `date-time`-formatted instant.
    DateTime(DateTime<Utc>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    /// An interned entity, read through its proxy.
    Entity(Rc<dyn EntityHandle>),
    /// A discriminated success/error envelope.
    Outcome(Box<Outcome>),
}

impl Value {
    /// The single value-kind bit this value occupies.
    pub fn kind(&self) -> TypeMask {
        match self {
            Self::Undefined => TypeMask::UNDEFINED,
            Self::Null => TypeMask::NULL,
            Self::Bool(_) => TypeMask::BOOLEAN,
            Self::Number(_) => TypeMask::NUMBER,
            Self::String(_) | Self::Date(_) | Self::DateTime(_) => TypeMask::STRING,
            Self::Array(_) => TypeMask::ARRAY,
            Self::Object(_) | Self::Entity(_) => TypeMask::OBJECT,
            Self::Outcome(_) => TypeMask::OBJECT,
        }
    }

    /// Human name of this value's kind, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Date(_) => "date",
            Self::DateTime(_) => "date-time",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Entity(_) => "entity",
            Self::Outcome(_) => "result",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Rc<dyn EntityHandle>> {
        match self {
            Self::Entity(handle) => Some(handle),
            _ => None,
        }
    }

    /// Truncated single-line rendering for error messages.
    pub fn render_short(&self) -> String {
        let full = self.to_string();
        if full.chars().count() > 60 {
            let truncated: String = full.chars().take(59).collect();
            format!("{truncated}…")
        } else {
            full
        }
    }

    /// Serializes to JSON. Entities collapse to `{"__entityRef": key}` stubs;
    /// `Undefined` inside objects is omitted by callers, elsewhere it maps to
    /// JSON null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Undefined | Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
            Self::DateTime(dt) => serde_json::Value::String(
                dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            ),
            Self::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Self::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    if !v.is_undefined() {
                        out.insert(k.clone(), v.to_json());
                    }
                }
                serde_json::Value::Object(out)
            }
            Self::Entity(handle) => {
                let mut out = serde_json::Map::new();
                out.insert(
                    ENTITY_REF_KEY.to_string(),
                    serde_json::Value::Number(handle.entity_key().0.into()),
                );
                serde_json::Value::Object(out)
            }
            Self::Outcome(outcome) => match outcome.as_ref() {
                Outcome::Success(v) => {
                    let mut out = serde_json::Map::new();
                    out.insert("success".into(), serde_json::Value::Bool(true));
                    out.insert("value".into(), v.to_json());
                    serde_json::Value::Object(out)
                }
                Outcome::Failure(e) => {
                    let mut out = serde_json::Map::new();
                    out.insert("success".into(), serde_json::Value::Bool(false));
                    out.insert("error".into(), serde_json::Value::String(e.to_string()));
                    serde_json::Value::Object(out)
                }
            },
        }
    }

    /// If this value is a serialized entity stub, returns its key.
    pub fn entity_ref(&self) -> Option<EntityKey> {
        let map = self.as_object()?;
        if map.len() != 1 {
            return None;
        }
        match map.get(ENTITY_REF_KEY)? {
            Value::Number(n) => Some(EntityKey(*n as u32)),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Self::Object(
                map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            ),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            (Self::DateTime(a), Self::DateTime(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            // Proxies compare by identity, not content.
            (Self::Entity(a), Self::Entity(b)) => a.entity_key() == b.entity_key(),
            (Self::Outcome(a), Self::Outcome(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "\"{s}\""),
            Self::Date(d) => write!(f, "{d}"),
            Self::DateTime(dt) => write!(f, "{dt}"),
            Self::Array(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Self::Object(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Self::Entity(handle) => {
                write!(f, "{}#{}", handle.type_name(), handle.id())
            }
            Self::Outcome(outcome) => match outcome.as_ref() {
                Outcome::Success(v) => write!(f, "success({v})"),
                Outcome::Failure(e) => write!(f, "failure({e})"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_key_of_is_stable() {
        assert_eq!(EntityKey::of("User", "1"), EntityKey::of("User", "1"));
        assert_ne!(EntityKey::of("User", "1"), EntityKey::of("User", "2"));
        assert_ne!(EntityKey::of("User", "1"), EntityKey::of("Account", "1"));
    }

    #[test]
    fn json_conversion() {
        let v = Value::from(json!({"id": 1, "name": "Alice", "tags": ["a", "b"], "gone": null}));
        let map = v.as_object().unwrap();
        assert_eq!(map.get("id"), Some(&Value::Number(1.0)));
        assert_eq!(map.get("name"), Some(&Value::String("Alice".into())));
        assert_eq!(map.get("gone"), Some(&Value::Null));
        assert_eq!(
            map.get("tags"),
            Some(&Value::Array(vec![
                Value::String("a".into()),
                Value::String("b".into())
            ]))
        );
    }

    #[test]
    fn kind_bits() {
        assert_eq!(Value::Null.kind(), TypeMask::NULL);
        assert_eq!(Value::Undefined.kind(), TypeMask::UNDEFINED);
        assert_eq!(Value::Number(1.0).kind(), TypeMask::NUMBER);
        assert_eq!(Value::Array(vec![]).kind(), TypeMask::ARRAY);
        assert_eq!(Value::Object(Default::default()).kind(), TypeMask::OBJECT);
    }

    #[test]
    fn to_json_omits_undefined_object_slots() {
        let mut map = BTreeMap::new();
        map.insert("kept".to_string(), Value::Number(1.0));
        map.insert("dropped".to_string(), Value::Undefined);
        let json = Value::Object(map).to_json();
        assert_eq!(json, json!({"kept": 1.0}));
    }

    #[test]
    fn entity_ref_detection() {
        let stub = Value::from(json!({"__entityRef": 42}));
        assert_eq!(stub.entity_ref(), Some(EntityKey(42)));
        let not_stub = Value::from(json!({"__entityRef": 42, "extra": 1}));
        assert_eq!(not_stub.entity_ref(), None);
    }

    #[test]
    fn date_serializes_to_wire_form() {
        let d = Value::Date(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap());
        assert_eq!(d.to_json(), json!("2024-03-09"));
    }
}
