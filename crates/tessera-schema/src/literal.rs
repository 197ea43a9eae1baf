use std::collections::HashMap;
use std::fmt;

use crate::error::SchemaError;
use crate::hash::hash_str;
use crate::mask::TypeMask;
use crate::value::Value;

/// A non-empty set of admissible literal values for enum and const schemas.
///
/// Case-insensitive sets accept any casing of a string member and resolve to
/// the canonical spelling they were registered with.
#[derive(Debug, Clone)]
pub struct LiteralSet {
    values: Vec<Value>,
    folded: Option<HashMap<String, String>>,
}

fn literal_token(v: &Value) -> Result<String, SchemaError> {
    match v {
        Value::String(s) => Ok(format!("s:{s}")),
        Value::Number(n) => Ok(format!("n:{n}")),
        Value::Bool(b) => Ok(format!("b:{b}")),
        Value::Null => Ok("null".to_string()),
        other => Err(SchemaError::UnsupportedLiteral(other.kind_name().to_string())),
    }
}

impl LiteralSet {
    /// Builds an exact-match set, validating:
    /// - the set is non-empty
    /// - members are scalars
    /// - no duplicates
    pub fn exact(values: Vec<Value>) -> Result<Self, SchemaError> {
        if values.is_empty() {
            return Err(SchemaError::EmptyLiteralSet);
        }
        let mut seen = std::collections::HashSet::with_capacity(values.len());
        for v in &values {
            if !seen.insert(literal_token(v)?) {
                return Err(SchemaError::DuplicateLiteral(v.to_string()));
            }
        }
        Ok(Self {
            values,
            folded: None,
        })
    }

    /// Builds a case-insensitive string set. Two variants whose lowercase
    /// forms collide reject the whole set at construction.
    pub fn case_insensitive(variants: Vec<String>) -> Result<Self, SchemaError> {
        if variants.is_empty() {
            return Err(SchemaError::EmptyLiteralSet);
        }
        let mut folded = HashMap::with_capacity(variants.len());
        for v in &variants {
            if let Some(existing) = folded.insert(v.to_lowercase(), v.clone()) {
                return Err(SchemaError::CaseInsensitiveCollision {
                    variant: v.clone(),
                    existing,
                });
            }
        }
        Ok(Self {
            values: variants.into_iter().map(Value::String).collect(),
            folded: Some(folded),
        })
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.folded.is_some()
    }

    /// Members with their canonical casing.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Looks up `v`, returning the canonical member value on a hit.
    pub fn resolve(&self, v: &Value) -> Option<Value> {
        if let Some(folded) = &self.folded {
            let s = v.as_str()?;
            return folded.get(&s.to_lowercase()).cloned().map(Value::String);
        }
        self.values.iter().find(|member| *member == v).cloned()
    }

    /// The union of member kinds, for mask construction.
    pub fn mask(&self) -> TypeMask {
        self.values
            .iter()
            .fold(TypeMask::empty(), |acc, v| acc | v.kind())
    }

    /// Order-independent hash of the set contents.
    pub fn hash_contribution(&self) -> u32 {
        let base = if self.is_case_insensitive() {
            hash_str("ci")
        } else {
            0
        };
        self.values.iter().fold(base, |acc, v| {
            // literal_token cannot fail here: members were validated on entry.
            let token = match v {
                Value::String(s) => format!("s:{s}"),
                Value::Number(n) => format!("n:{n}"),
                Value::Bool(b) => format!("b:{b}"),
                _ => "null".to_string(),
            };
            acc ^ hash_str(&token)
        })
    }
}

impl fmt::Display for LiteralSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_resolves_members_only() {
        let set = LiteralSet::exact(vec![
            Value::String("Active".into()),
            Value::Number(2.0),
        ])
        .unwrap();
        assert_eq!(
            set.resolve(&Value::String("Active".into())),
            Some(Value::String("Active".into()))
        );
        assert_eq!(set.resolve(&Value::Number(2.0)), Some(Value::Number(2.0)));
        assert_eq!(set.resolve(&Value::String("active".into())), None);
    }

    #[test]
    fn exact_rejects_duplicates() {
        let result = LiteralSet::exact(vec![
            Value::String("A".into()),
            Value::String("A".into()),
        ]);
        assert!(matches!(result, Err(SchemaError::DuplicateLiteral(_))));
    }

    #[test]
    fn exact_rejects_empty() {
        assert!(matches!(
            LiteralSet::exact(vec![]),
            Err(SchemaError::EmptyLiteralSet)
        ));
    }

    #[test]
    fn case_insensitive_returns_canonical_casing() {
        let set = LiteralSet::case_insensitive(vec![
            "Active".into(),
            "Inactive".into(),
            "Pending".into(),
        ])
        .unwrap();
        assert_eq!(
            set.resolve(&Value::String("pending".into())),
            Some(Value::String("Pending".into()))
        );
        assert_eq!(
            set.resolve(&Value::String("PENDING".into())),
            Some(Value::String("Pending".into()))
        );
        assert_eq!(set.resolve(&Value::String("unknown".into())), None);
    }

    #[test]
    fn case_insensitive_collision_rejected_at_construction() {
        let result = LiteralSet::case_insensitive(vec!["yes".into(), "YES".into()]);
        assert!(matches!(
            result,
            Err(SchemaError::CaseInsensitiveCollision { .. })
        ));
    }

    #[test]
    fn hash_is_order_independent() {
        let a = LiteralSet::exact(vec![Value::String("x".into()), Value::Number(1.0)]).unwrap();
        let b = LiteralSet::exact(vec![Value::Number(1.0), Value::String("x".into())]).unwrap();
        assert_eq!(a.hash_contribution(), b.hash_contribution());
    }

    #[test]
    fn ci_and_exact_hash_differently() {
        let exact = LiteralSet::exact(vec![Value::String("A".into())]).unwrap();
        let ci = LiteralSet::case_insensitive(vec!["A".into()]).unwrap();
        assert_ne!(exact.hash_contribution(), ci.hash_contribution());
    }

    #[test]
    fn mask_unions_member_kinds() {
        let set = LiteralSet::exact(vec![Value::String("a".into()), Value::Number(1.0)]).unwrap();
        assert_eq!(set.mask(), TypeMask::STRING | TypeMask::NUMBER);
    }
}
