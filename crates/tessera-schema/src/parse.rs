use std::collections::BTreeMap;

use tracing::warn;

use crate::error::{Path, ValidationError, ValidationErrorKind};
use crate::format::format_by_id;
use crate::mask::TypeMask;
use crate::node::Schema;
use crate::value::{Outcome, Value};

/// Validates `value` against `schema` from the root.
pub fn parse(value: &Value, schema: &Schema) -> Result<Value, ValidationError> {
    let mut path = Path::root();
    parse_at(value, schema, &mut path, false)
}

/// Validates `value` against `schema` at `path`.
///
/// With `skip_fallbacks` set (inside a `result()`-wrapped parse), the
/// optional-fallback rule is suppressed and every failure propagates.
pub fn parse_at(
    value: &Value,
    schema: &Schema,
    path: &mut Path,
    skip_fallbacks: bool,
) -> Result<Value, ValidationError> {
    if let Err(e) = schema.ensure_reified() {
        return Err(schema_err(path, e));
    }
    if schema.mask().contains(TypeMask::PARSE_RESULT) {
        // Capture into a discriminated envelope; inner failures never
        // propagate past this point.
        return Ok(Value::Outcome(Box::new(
            match parse_core(value, schema, path, true) {
                Ok(v) => Outcome::Success(v),
                Err(e) => Outcome::Failure(e),
            },
        )));
    }
    parse_core(value, schema, path, skip_fallbacks)
}

fn parse_core(
    value: &Value,
    schema: &Schema,
    path: &mut Path,
    skip: bool,
) -> Result<Value, ValidationError> {
    // Literal sets (enum / const / primitive-union literals).
    if let Some(set) = schema.values() {
        if let Some(canonical) = set.resolve(value) {
            return Ok(canonical);
        }
        // A primitive-union node may accept kinds beyond its literals.
        let beyond_literals = schema.mask().kinds() & !set.mask().kinds();
        if !beyond_literals.accepts(value.kind()) {
            return fallback_or(
                schema,
                value,
                path,
                skip,
                ValidationErrorKind::LiteralMismatch,
            );
        }
    }

    // Typename discriminator literals.
    if let Some(literal) = schema.literal() {
        return match value {
            // Hydration: cached payloads omit the discriminator.
            Value::Undefined | Value::Null => Ok(Value::String(literal.to_string())),
            Value::String(s) if s == literal => Ok(value.clone()),
            _ => fallback_or(
                schema,
                value,
                path,
                skip,
                ValidationErrorKind::TypenameMismatch {
                    expected: literal.to_string(),
                },
            ),
        };
    }

    if schema.is_union() {
        return parse_union(value, schema, path, skip);
    }
    if schema.has_shape() {
        return parse_object(value, schema, path, skip);
    }
    if let Some(child) = schema.child() {
        return if schema.mask().contains(TypeMask::RECORD) {
            parse_record(value, schema, child, path, skip)
        } else {
            parse_array(value, schema, child, path, skip)
        };
    }
    parse_mask(value, schema, path, skip)
}

fn parse_mask(
    value: &Value,
    schema: &Schema,
    path: &mut Path,
    skip: bool,
) -> Result<Value, ValidationError> {
    let mask = schema.mask();
    if !mask.accepts(value.kind()) {
        return fallback_or(schema, value, path, skip, ValidationErrorKind::KindMismatch);
    }

    let wants_format = (mask.contains(TypeMask::HAS_STRING_FORMAT)
        && value.kind() == TypeMask::STRING)
        || (mask.contains(TypeMask::HAS_NUMBER_FORMAT) && value.kind() == TypeMask::NUMBER);
    if wants_format {
        // Already-parsed format values pass through untouched.
        if matches!(value, Value::Date(_) | Value::DateTime(_)) {
            return Ok(value.clone());
        }
        if let Some(format) = mask.format_id().and_then(format_by_id) {
            return match format.parse(value) {
                Ok(parsed) => Ok(parsed),
                Err(message) => fallback_or(
                    schema,
                    value,
                    path,
                    skip,
                    ValidationErrorKind::FormatParse {
                        format: format.name.clone(),
                        message,
                    },
                ),
            };
        }
    }
    Ok(value.clone())
}

fn parse_union(
    value: &Value,
    schema: &Schema,
    path: &mut Path,
    skip: bool,
) -> Result<Value, ValidationError> {
    let info = schema.union_info().map_err(|e| schema_err(path, e))?;

    if value.kind() == TypeMask::ARRAY {
        if let Some(branch) = &info.array_branch {
            return parse_at(value, branch, path, skip);
        }
        return fallback_or(schema, value, path, skip, ValidationErrorKind::KindMismatch);
    }

    // Primitive members of a mixed union.
    if !value.kind().intersects(TypeMask::OBJECT) {
        if schema.mask().accepts(value.kind()) {
            return Ok(value.clone());
        }
        return fallback_or(schema, value, path, skip, ValidationErrorKind::KindMismatch);
    }

    // Proxies have already been through normalization.
    if value.as_entity().is_some() {
        return Ok(value.clone());
    }

    let map = match value.as_object() {
        Some(map) => map,
        None => {
            return fallback_or(schema, value, path, skip, ValidationErrorKind::KindMismatch)
        }
    };

    let field = match &info.typename_field {
        Some(field) => field.clone(),
        None => {
            if let Some(branch) = &info.record_branch {
                return parse_at(value, branch, path, skip);
            }
            return fallback_or(schema, value, path, skip, ValidationErrorKind::KindMismatch);
        }
    };

    match map.get(&field) {
        Some(Value::String(typename)) => match info.discriminants.get(typename) {
            Some(branch) => parse_at(value, branch, path, skip),
            None => match &info.record_branch {
                Some(branch) => parse_at(value, branch, path, skip),
                None => fallback_or(
                    schema,
                    value,
                    path,
                    skip,
                    ValidationErrorKind::UnknownTypename {
                        value: typename.clone(),
                    },
                ),
            },
        },
        _ => match &info.record_branch {
            Some(branch) => parse_at(value, branch, path, skip),
            None => fallback_or(
                schema,
                value,
                path,
                skip,
                ValidationErrorKind::MissingDiscriminator { field },
            ),
        },
    }
}

fn parse_array(
    value: &Value,
    schema: &Schema,
    child: &Schema,
    path: &mut Path,
    skip: bool,
) -> Result<Value, ValidationError> {
    let items = match value {
        Value::Array(items) => items,
        _ => return fallback_or(schema, value, path, skip, ValidationErrorKind::KindMismatch),
    };
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        path.push_index(i);
        let parsed = parse_at(item, child, path, skip);
        path.pop();
        match parsed {
            Ok(v) => out.push(v),
            // Inside result()-wrapped parses failed elements stay visible as
            // error envelopes; plain parses filter them.
            Err(e) if skip => out.push(Value::Outcome(Box::new(Outcome::Failure(e)))),
            Err(e) => {
                warn!(error = %e, "dropping invalid collection element");
            }
        }
    }
    Ok(Value::Array(out))
}

fn parse_record(
    value: &Value,
    schema: &Schema,
    child: &Schema,
    path: &mut Path,
    skip: bool,
) -> Result<Value, ValidationError> {
    let map = match value.as_object() {
        Some(map) => map,
        None => {
            return fallback_or(schema, value, path, skip, ValidationErrorKind::KindMismatch)
        }
    };
    let mut out = BTreeMap::new();
    for (key, item) in map {
        path.push_key(key.clone());
        let parsed = parse_at(item, child, path, skip);
        path.pop();
        out.insert(key.clone(), parsed?);
    }
    Ok(Value::Object(out))
}

fn parse_object(
    value: &Value,
    schema: &Schema,
    path: &mut Path,
    skip: bool,
) -> Result<Value, ValidationError> {
    // An input that is already a proxy is returned unchanged.
    if value.as_entity().is_some() {
        return Ok(value.clone());
    }
    let map = match value.as_object() {
        Some(map) => map,
        None => {
            return fallback_or(schema, value, path, skip, ValidationErrorKind::KindMismatch)
        }
    };
    let shape = schema.shape_info().map_err(|e| schema_err(path, e))?;

    let mut out = map.clone();
    for (name, field_schema) in &shape.fields {
        let slot = map.get(name).cloned().unwrap_or(Value::Undefined);
        path.push_field(name.clone());
        let parsed = parse_at(&slot, field_schema, path, skip);
        path.pop();
        out.insert(name.clone(), parsed?);
    }
    Ok(Value::Object(out))
}

fn fallback_or(
    schema: &Schema,
    value: &Value,
    path: &mut Path,
    skip: bool,
    kind: ValidationErrorKind,
) -> Result<Value, ValidationError> {
    let error = ValidationError {
        path: path.to_string(),
        expected: schema.to_string(),
        actual_kind: value.kind_name().to_string(),
        actual: value.render_short(),
        kind,
    };
    if schema.mask().contains(TypeMask::UNDEFINED) && !skip {
        warn!(error = %error, "validation failed on an optional slot, substituting undefined");
        return Ok(Value::Undefined);
    }
    Err(error)
}

fn schema_err(path: &Path, e: crate::error::SchemaError) -> ValidationError {
    ValidationError {
        path: path.to_string(),
        expected: String::new(),
        actual_kind: String::new(),
        actual: String::new(),
        kind: ValidationErrorKind::Schema(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::t;
    use serde_json::json;

    fn v(j: serde_json::Value) -> Value {
        Value::from(j)
    }

    #[test]
    fn primitives_pass_through() {
        assert_eq!(
            parse(&v(json!("hi")), &t::string()).unwrap(),
            Value::String("hi".into())
        );
        assert_eq!(
            parse(&v(json!(2.5)), &t::number()).unwrap(),
            Value::Number(2.5)
        );
        assert!(parse(&v(json!("hi")), &t::number()).is_err());
    }

    #[test]
    fn optional_fallback_substitutes_undefined() {
        let schema = t::number().optional();
        assert_eq!(parse(&v(json!("oops")), &schema).unwrap(), Value::Undefined);
        assert_eq!(parse(&Value::Undefined, &schema).unwrap(), Value::Undefined);
    }

    #[test]
    fn result_wrapping_suppresses_fallback() {
        let schema = t::number().optional().result();
        let parsed = parse(&v(json!("oops")), &schema).unwrap();
        match parsed {
            Value::Outcome(outcome) => assert!(!outcome.is_success()),
            other => panic!("expected an envelope, got {other}"),
        }
    }

    #[test]
    fn result_wrapping_captures_success() {
        let schema = t::number().result();
        let parsed = parse(&v(json!(7)), &schema).unwrap();
        match parsed {
            Value::Outcome(outcome) => {
                assert_eq!(*outcome, Outcome::Success(Value::Number(7.0)));
            }
            other => panic!("expected an envelope, got {other}"),
        }
    }

    #[test]
    fn case_insensitive_enum_returns_canonical() {
        let schema = t::string_enum_ci(["Active", "Inactive", "Pending"]).unwrap();
        assert_eq!(
            parse(&v(json!("pending")), &schema).unwrap(),
            Value::String("Pending".into())
        );
        assert!(parse(&v(json!("unknown")), &schema).is_err());
    }

    #[test]
    fn typename_literal_hydrates_from_absent() {
        let schema = t::typename("User");
        assert_eq!(
            parse(&Value::Undefined, &schema).unwrap(),
            Value::String("User".into())
        );
        assert_eq!(
            parse(&Value::Null, &schema).unwrap(),
            Value::String("User".into())
        );
        assert!(parse(&v(json!("Admin")), &schema).is_err());
    }

    #[test]
    fn format_parses_and_falls_back() {
        let date = t::format("date").unwrap();
        assert!(matches!(
            parse(&v(json!("2024-03-09")), &date).unwrap(),
            Value::Date(_)
        ));
        assert!(parse(&v(json!("not-a-date")), &date).is_err());
        assert_eq!(
            parse(&v(json!("not-a-date")), &date.optional()).unwrap(),
            Value::Undefined
        );
    }

    #[test]
    fn arrays_filter_invalid_elements() {
        let schema = t::array(t::number());
        assert_eq!(
            parse(&v(json!([1, "two", 3])), &schema).unwrap(),
            Value::Array(vec![Value::Number(1.0), Value::Number(3.0)])
        );
    }

    #[test]
    fn arrays_in_result_mode_keep_error_envelopes() {
        let schema = t::array(t::number()).result();
        let parsed = parse(&v(json!([1, "two"])), &schema).unwrap();
        let Value::Outcome(outcome) = parsed else {
            panic!("expected envelope");
        };
        let Outcome::Success(Value::Array(items)) = *outcome else {
            panic!("expected successful array");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Value::Number(1.0));
        assert!(matches!(&items[1], Value::Outcome(o) if !o.is_success()));
    }

    #[test]
    fn record_failures_propagate() {
        let schema = t::record(t::number());
        let err = parse(&v(json!({"a": 1, "b": "x"})), &schema).unwrap_err();
        assert_eq!(err.path, "[\"b\"]");
    }

    #[test]
    fn objects_keep_unknown_fields() {
        let schema = t::object(vec![("known".to_string(), t::number())]);
        let parsed = parse(&v(json!({"known": 1, "extra": "kept"})), &schema).unwrap();
        let map = parsed.as_object().unwrap();
        assert_eq!(map.get("extra"), Some(&Value::String("kept".into())));
    }

    #[test]
    fn object_field_errors_carry_paths() {
        let schema = t::object(vec![(
            "user".to_string(),
            t::object(vec![("age".to_string(), t::number())]),
        )]);
        let err = parse(&v(json!({"user": {"age": "old"}})), &schema).unwrap_err();
        assert_eq!(err.path, "user.age");
        assert_eq!(err.actual_kind, "string");
    }

    #[test]
    fn union_dispatches_on_typename() {
        let cat = t::object(vec![
            ("__typename".to_string(), t::typename("Cat")),
            ("lives".to_string(), t::number()),
        ]);
        let dog = t::object(vec![
            ("__typename".to_string(), t::typename("Dog")),
            ("good".to_string(), t::boolean()),
        ]);
        let schema = t::union(vec![cat, dog]).unwrap();

        let parsed = parse(&v(json!({"__typename": "Dog", "good": true})), &schema).unwrap();
        let map = parsed.as_object().unwrap();
        assert_eq!(map.get("good"), Some(&Value::Bool(true)));

        let err = parse(&v(json!({"__typename": "Fox"})), &schema).unwrap_err();
        assert!(matches!(
            err.kind,
            ValidationErrorKind::UnknownTypename { .. }
        ));

        let err = parse(&v(json!({"good": true})), &schema).unwrap_err();
        assert!(matches!(
            err.kind,
            ValidationErrorKind::MissingDiscriminator { .. }
        ));
    }

    #[test]
    fn union_array_branch() {
        let cat = t::object(vec![("__typename".to_string(), t::typename("Cat"))]);
        let schema = t::union(vec![t::array(t::number()), cat]).unwrap();
        assert_eq!(
            parse(&v(json!([1, 2])), &schema).unwrap(),
            Value::Array(vec![Value::Number(1.0), Value::Number(2.0)])
        );
    }

    #[test]
    fn union_primitive_members() {
        let cat = t::object(vec![("__typename".to_string(), t::typename("Cat"))]);
        let schema = t::union(vec![t::string(), cat]).unwrap();
        assert_eq!(
            parse(&v(json!("plain")), &schema).unwrap(),
            Value::String("plain".into())
        );
    }

    #[test]
    fn missing_object_fields_hydrate_or_fall_back() {
        let schema = t::object(vec![
            ("__typename".to_string(), t::typename("Thing")),
            ("note".to_string(), t::string().optional()),
        ]);
        let parsed = parse(&v(json!({})), &schema).unwrap();
        let map = parsed.as_object().unwrap();
        assert_eq!(map.get("__typename"), Some(&Value::String("Thing".into())));
        assert_eq!(map.get("note"), Some(&Value::Undefined));
    }
}
