use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use once_cell::sync::Lazy;

use crate::error::SchemaError;
use crate::mask::TypeMask;
use crate::value::Value;

/// Which raw value kind a format consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatInput {
    Text,
    Number,
}

impl FormatInput {
    /// The mask bits a formatted schema node carries.
    pub fn mask(self) -> TypeMask {
        match self {
            Self::Text => TypeMask::STRING | TypeMask::HAS_STRING_FORMAT,
            Self::Number => TypeMask::NUMBER | TypeMask::HAS_NUMBER_FORMAT,
        }
    }
}

type FormatFn = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

/// A registered wire format: raw scalar in, parsed value out, and back.
#[derive(Clone)]
pub struct Format {
    pub id: u8,
    pub name: String,
    pub input: FormatInput,
    parse: FormatFn,
    serialize: FormatFn,
}

impl Format {
    /// Parses a raw scalar, e.g. `"2024-03-09"` into a calendar date.
    pub fn parse(&self, raw: &Value) -> Result<Value, String> {
        (self.parse)(raw)
    }

    /// Serializes a parsed value back to its raw scalar form.
    pub fn serialize(&self, value: &Value) -> Result<Value, String> {
        (self.serialize)(value)
    }
}

impl std::fmt::Debug for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Format")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("input", &self.input)
            .finish()
    }
}

struct Registry {
    by_name: HashMap<String, Format>,
    by_id: HashMap<u8, Format>,
    next_id: u8,
}

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| {
    let mut registry = Registry {
        by_name: HashMap::new(),
        by_id: HashMap::new(),
        next_id: 1,
    };
    registry.install("date", FormatInput::Text, Arc::new(parse_date), Arc::new(serialize_date));
    registry.install(
        "date-time",
        FormatInput::Text,
        Arc::new(parse_date_time),
        Arc::new(serialize_date_time),
    );
    RwLock::new(registry)
});

impl Registry {
    fn install(&mut self, name: &str, input: FormatInput, parse: FormatFn, serialize: FormatFn) {
        let id = self.next_id;
        self.next_id += 1;
        let format = Format {
            id,
            name: name.to_string(),
            input,
            parse,
            serialize,
        };
        self.by_name.insert(name.to_string(), format.clone());
        self.by_id.insert(id, format);
    }
}

/// Installs a process-wide format. Names are unique; re-registering an
/// existing name is an error.
pub fn register_format(
    name: &str,
    input: FormatInput,
    parse: impl Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    serialize: impl Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
) -> Result<u8, SchemaError> {
    let mut registry = REGISTRY.write().unwrap_or_else(|e| e.into_inner());
    if registry.by_name.contains_key(name) {
        return Err(SchemaError::DuplicateFormat(name.to_string()));
    }
    if registry.next_id == u8::MAX {
        return Err(SchemaError::FormatTableFull);
    }
    registry.install(name, input, Arc::new(parse), Arc::new(serialize));
    Ok(registry.next_id - 1)
}

/// Looks up a format by name.
pub fn format_by_name(name: &str) -> Option<Format> {
    let registry = REGISTRY.read().unwrap_or_else(|e| e.into_inner());
    registry.by_name.get(name).cloned()
}

/// Looks up a format by its packed id.
pub fn format_by_id(id: u8) -> Option<Format> {
    let registry = REGISTRY.read().unwrap_or_else(|e| e.into_inner());
    registry.by_id.get(&id).cloned()
}

// ---------------------------------------------------------------------------
// Built-ins
// ---------------------------------------------------------------------------

fn date_shape_ok(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| matches!(i, 4 | 7) || b.is_ascii_digit())
}

fn parse_date(raw: &Value) -> Result<Value, String> {
    let s = raw.as_str().ok_or_else(|| "expected a string".to_string())?;
    if !date_shape_ok(s) {
        return Err(format!("'{s}' is not a YYYY-MM-DD date"));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(Value::Date)
        .map_err(|e| format!("'{s}' is not a valid date: {e}"))
}

fn serialize_date(value: &Value) -> Result<Value, String> {
    match value {
        Value::Date(d) => Ok(Value::String(d.format("%Y-%m-%d").to_string())),
        other => Err(format!("expected a date, got {}", other.kind_name())),
    }
}

fn parse_date_time(raw: &Value) -> Result<Value, String> {
    let s = raw.as_str().ok_or_else(|| "expected a string".to_string())?;
    DateTime::parse_from_rfc3339(s)
        .map(|dt| Value::DateTime(dt.with_timezone(&Utc)))
        .map_err(|e| format!("'{s}' is not an ISO 8601 instant: {e}"))
}

fn serialize_date_time(value: &Value) -> Result<Value, String> {
    match value {
        Value::DateTime(dt) => Ok(Value::String(
            dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        )),
        other => Err(format!("expected a date-time, got {}", other.kind_name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let date = format_by_name("date").unwrap();
        assert_eq!(date.input, FormatInput::Text);
        let dt = format_by_name("date-time").unwrap();
        assert_ne!(date.id, dt.id);
        assert_eq!(format_by_id(date.id).unwrap().name, "date");
    }

    #[test]
    fn date_parses_and_roundtrips() {
        let date = format_by_name("date").unwrap();
        let parsed = date.parse(&Value::String("2024-03-09".into())).unwrap();
        assert!(matches!(parsed, Value::Date(_)));
        let back = date.serialize(&parsed).unwrap();
        assert_eq!(back, Value::String("2024-03-09".into()));
    }

    #[test]
    fn date_rejects_loose_input() {
        let date = format_by_name("date").unwrap();
        for bad in ["2024-3-9", "03/09/2024", "2024-03-09T00:00:00Z", "2024-13-01"] {
            assert!(date.parse(&Value::String(bad.into())).is_err(), "{bad}");
        }
        assert!(date.parse(&Value::Number(20240309.0)).is_err());
    }

    #[test]
    fn date_time_parses_and_roundtrips_utc_millis() {
        let dt = format_by_name("date-time").unwrap();
        let raw = Value::String("2024-03-09T12:30:00.250Z".into());
        let parsed = dt.parse(&raw).unwrap();
        assert!(matches!(parsed, Value::DateTime(_)));
        assert_eq!(dt.serialize(&parsed).unwrap(), raw);
    }

    #[test]
    fn date_time_normalizes_offsets_to_utc() {
        let dt = format_by_name("date-time").unwrap();
        let parsed = dt
            .parse(&Value::String("2024-03-09T13:30:00.000+01:00".into()))
            .unwrap();
        assert_eq!(
            dt.serialize(&parsed).unwrap(),
            Value::String("2024-03-09T12:30:00.000Z".into())
        );
    }

    proptest::proptest! {
        #[test]
        fn date_serialize_after_parse_is_identity(
            y in 1600u32..3000,
            m in 1u32..13,
            d in 1u32..29,
        ) {
            let raw = Value::String(format!("{y:04}-{m:02}-{d:02}"));
            let date = format_by_name("date").unwrap();
            let parsed = date.parse(&raw).unwrap();
            proptest::prop_assert_eq!(date.serialize(&parsed).unwrap(), raw);
        }
    }

    #[test]
    fn register_format_rejects_duplicates() {
        let first = register_format(
            "upper",
            FormatInput::Text,
            |raw| Ok(Value::String(raw.as_str().unwrap_or_default().to_uppercase())),
            |v| Ok(v.clone()),
        );
        assert!(first.is_ok());
        let second = register_format("upper", FormatInput::Text, |v| Ok(v.clone()), |v| Ok(v.clone()));
        assert!(matches!(second, Err(SchemaError::DuplicateFormat(_))));
    }
}
