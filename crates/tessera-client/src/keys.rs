use std::collections::BTreeMap;

use tessera_reactive::Signal;
use tessera_schema::hash::{combine, hash_str};
use tessera_schema::{SchemaError, Value};

use crate::definition::{ParamValues, QueryDef};

/// A query parameter: a plain value, or a signal whose identity
/// distinguishes cache instances even when current values coincide.
#[derive(Clone)]
pub enum ParamValue {
    Plain(Value),
    Signal(Signal<Value>),
}

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        Self::Plain(value)
    }
}

impl From<Signal<Value>> for ParamValue {
    fn from(signal: Signal<Value>) -> Self {
        Self::Signal(signal)
    }
}

/// Named parameters as passed by callers.
pub type Params = BTreeMap<String, ParamValue>;

/// Reads every parameter at the current reactive context (signal reads
/// subscribe) and returns the plain value map.
pub fn extract_params(params: &Params) -> ParamValues {
    params
        .iter()
        .map(|(name, param)| {
            let value = match param {
                ParamValue::Plain(value) => value.clone(),
                ParamValue::Signal(signal) => signal.get(),
            };
            (name.clone(), value)
        })
        .collect()
}

/// Disk-cache key: stable across process restarts. Derived from the
/// definition id, the shape key, and extracted parameter values only.
pub fn storage_key(def: &QueryDef, values: &ParamValues) -> Result<u32, SchemaError> {
    let shape_key = def.shape.shape_key()?;
    let mut key = combine(hash_str(&def.id), shape_key);
    for (name, value) in values {
        key ^= combine(hash_str(name), hash_str(&value.to_json().to_string()));
    }
    Ok(key)
}

/// In-memory dedup key: like [`storage_key`], but signal parameters
/// contribute their identity instead of their current value, so two call
/// sites passing distinct but equal-valued signals get distinct results.
pub fn query_key(def: &QueryDef, params: &Params) -> Result<u32, SchemaError> {
    let shape_key = def.shape.shape_key()?;
    let mut key = combine(hash_str(&def.id), shape_key);
    for (name, param) in params {
        let token = match param {
            ParamValue::Plain(value) => format!("val:{}", value.to_json()),
            ParamValue::Signal(signal) => format!("sig:{}", signal.id()),
        };
        key ^= combine(hash_str(name), hash_str(&token));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use tessera_reactive::Scope;
    use tessera_schema::t;

    use crate::definition::FetchFn;

    fn noop_fetch() -> FetchFn {
        Rc::new(|_ctx, _params| Box::pin(async { Ok(serde_json::Value::Null) }))
    }

    fn def(id: &str) -> QueryDef {
        QueryDef::query(id, t::object(vec![("n".to_string(), t::number())]), noop_fetch())
    }

    #[test]
    fn storage_key_depends_on_values_only() {
        let scope = Scope::new();
        let d = def("q");
        let a = Signal::new(&scope, Value::Number(1.0));
        let b = Signal::new(&scope, Value::Number(1.0));

        let mut p1 = Params::new();
        p1.insert("page".into(), ParamValue::Signal(a));
        let mut p2 = Params::new();
        p2.insert("page".into(), ParamValue::Signal(b));
        let mut p3 = Params::new();
        p3.insert("page".into(), ParamValue::Plain(Value::Number(1.0)));

        let v1 = extract_params(&p1);
        let v2 = extract_params(&p2);
        let v3 = extract_params(&p3);
        assert_eq!(storage_key(&d, &v1).unwrap(), storage_key(&d, &v2).unwrap());
        assert_eq!(storage_key(&d, &v1).unwrap(), storage_key(&d, &v3).unwrap());
    }

    #[test]
    fn query_key_distinguishes_signal_identities() {
        let scope = Scope::new();
        let d = def("q");
        let a = Signal::new(&scope, Value::Number(1.0));
        let b = Signal::new(&scope, Value::Number(1.0));

        let mut p1 = Params::new();
        p1.insert("page".into(), ParamValue::Signal(a.clone()));
        let mut p2 = Params::new();
        p2.insert("page".into(), ParamValue::Signal(b));
        let mut p1_again = Params::new();
        p1_again.insert("page".into(), ParamValue::Signal(a));

        assert_ne!(query_key(&d, &p1).unwrap(), query_key(&d, &p2).unwrap());
        assert_eq!(query_key(&d, &p1).unwrap(), query_key(&d, &p1_again).unwrap());
    }

    #[test]
    fn query_key_matches_for_equal_plain_values() {
        let d = def("q");
        let mut p1 = Params::new();
        p1.insert("page".into(), ParamValue::Plain(Value::Number(2.0)));
        let mut p2 = Params::new();
        p2.insert("page".into(), ParamValue::Plain(Value::Number(2.0)));
        assert_eq!(query_key(&d, &p1).unwrap(), query_key(&d, &p2).unwrap());
        let mut p3 = Params::new();
        p3.insert("page".into(), ParamValue::Plain(Value::Number(3.0)));
        assert_ne!(query_key(&d, &p1).unwrap(), query_key(&d, &p3).unwrap());
    }

    #[test]
    fn different_definitions_never_collide_on_params() {
        let d1 = def("a");
        let d2 = def("b");
        let values = ParamValues::new();
        assert_ne!(
            storage_key(&d1, &values).unwrap(),
            storage_key(&d2, &values).unwrap()
        );
    }
}
