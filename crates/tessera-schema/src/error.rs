use std::fmt;

/// Errors raised while constructing or reifying schema nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SchemaError {
    /// Two fields in one object carry the `ID` bit.
    DuplicateIdField { first: String, second: String },
    /// Two fields in one object carry typename literals.
    DuplicateTypenameField { first: String, second: String },
    /// An entity shape has no id field.
    MissingIdField(String),
    /// An object branch of a union has no typename discriminator.
    MissingTypename,
    /// Union branches disagree on which field holds the discriminator.
    ConflictingTypenameField { first: String, second: String },
    /// Two union branches share a discriminator value.
    DuplicateDiscriminant(String),
    /// Two branches of the same container kind in one union.
    DuplicateUnionBranch(&'static str),
    /// `extend` re-declares a field of the parent entity.
    ExtendFieldCollision(String),
    /// A field name appears twice in one object shape.
    DuplicateFieldName(String),
    /// Enum or const set was empty.
    EmptyLiteralSet,
    /// The same literal appears twice in one set.
    DuplicateLiteral(String),
    /// Case-insensitive variants whose lowercase forms collide.
    CaseInsensitiveCollision { variant: String, existing: String },
    /// A literal kind that sets cannot hold (objects, arrays).
    UnsupportedLiteral(String),
    /// `format(name)` looked up a name that was never registered.
    UnknownFormat(String),
    /// A format name was registered twice.
    DuplicateFormat(String),
    /// The process-wide format id space (u8) is exhausted.
    FormatTableFull,
    /// A shape accessor was called on a node with no object shape.
    NotShaped,
    /// A union accessor was called on a non-union node.
    NotUnion,
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateIdField { first, second } => {
                write!(f, "duplicate id field: '{first}' and '{second}'")
            }
            Self::DuplicateTypenameField { first, second } => {
                write!(f, "duplicate typename field: '{first}' and '{second}'")
            }
            Self::MissingIdField(t) => {
                write!(f, "entity '{t}' has no id field")
            }
            Self::MissingTypename => {
                write!(f, "object branch of a union has no typename discriminator")
            }
            Self::ConflictingTypenameField { first, second } => {
                write!(
                    f,
                    "union branches disagree on the typename field: '{first}' vs '{second}'"
                )
            }
            Self::DuplicateDiscriminant(v) => {
                write!(f, "duplicate union discriminator '{v}'")
            }
            Self::DuplicateUnionBranch(kind) => {
                write!(f, "union already has a {kind} branch")
            }
            Self::ExtendFieldCollision(name) => {
                write!(f, "extend re-declares field '{name}' of the parent entity")
            }
            Self::DuplicateFieldName(name) => write!(f, "duplicate field name '{name}'"),
            Self::EmptyLiteralSet => write!(f, "literal set must not be empty"),
            Self::DuplicateLiteral(v) => write!(f, "duplicate literal {v}"),
            Self::CaseInsensitiveCollision { variant, existing } => {
                write!(
                    f,
                    "case-insensitive variant '{variant}' collides with '{existing}'"
                )
            }
            Self::UnsupportedLiteral(kind) => {
                write!(f, "literal sets cannot hold values of kind {kind}")
            }
            Self::UnknownFormat(name) => write!(f, "unknown format '{name}'"),
            Self::DuplicateFormat(name) => write!(f, "format '{name}' is already registered"),
            Self::FormatTableFull => write!(f, "format id space exhausted"),
            Self::NotShaped => write!(f, "schema node has no object shape"),
            Self::NotUnion => write!(f, "schema node is not a union"),
        }
    }
}

impl std::error::Error for SchemaError {}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// One step of a value path: a field, an array index, or a record key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
    Key(String),
}

/// A path into a wire payload, rendered as `parent.child`, `parent[0]`,
/// or `parent["key"]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Path(Vec<PathSegment>);

impl Path {
    /// An empty root path.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn push_field(&mut self, name: impl Into<String>) {
        self.0.push(PathSegment::Field(name.into()));
    }

    pub fn push_index(&mut self, index: usize) {
        self.0.push(PathSegment::Index(index));
    }

    pub fn push_key(&mut self, key: impl Into<String>) {
        self.0.push(PathSegment::Key(key.into()));
    }

    pub fn pop(&mut self) {
        self.0.pop();
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "$");
        }
        let mut first = true;
        for segment in &self.0 {
            match segment {
                PathSegment::Field(name) => {
                    if first {
                        write!(f, "{name}")?;
                    } else {
                        write!(f, ".{name}")?;
                    }
                }
                PathSegment::Index(i) => write!(f, "[{i}]")?,
                PathSegment::Key(k) => write!(f, "[\"{k}\"]")?,
            }
            first = false;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// Why a value failed validation at `path`.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ValidationErrorKind {
    /// The value's kind is not in the schema mask.
    KindMismatch,
    /// The value is not a member of the literal set.
    LiteralMismatch,
    /// A typename literal did not match.
    TypenameMismatch { expected: String },
    /// A union value carried no discriminator field.
    MissingDiscriminator { field: String },
    /// A union discriminator value matched no branch.
    UnknownTypename { value: String },
    /// A registered format rejected the raw value.
    FormatParse { format: String, message: String },
    /// The schema itself failed to reify.
    Schema(SchemaError),
}

/// A validation failure: where it happened, what was expected, and what was
/// actually found.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub path: String,
    pub expected: String,
    pub actual_kind: String,
    pub actual: String,
    pub kind: ValidationErrorKind,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ValidationErrorKind::KindMismatch | ValidationErrorKind::LiteralMismatch => {
                write!(
                    f,
                    "at {}: expected {}, got {} ({})",
                    self.path, self.expected, self.actual_kind, self.actual
                )
            }
            ValidationErrorKind::TypenameMismatch { expected } => {
                write!(
                    f,
                    "at {}: expected typename \"{expected}\", got {}",
                    self.path, self.actual
                )
            }
            ValidationErrorKind::MissingDiscriminator { field } => {
                write!(
                    f,
                    "at {}: field '{field}' is required for union discrimination",
                    self.path
                )
            }
            ValidationErrorKind::UnknownTypename { value } => {
                write!(f, "at {}: unknown typename \"{value}\"", self.path)
            }
            ValidationErrorKind::FormatParse { format, message } => {
                write!(
                    f,
                    "at {}: format '{format}' rejected {}: {message}",
                    self.path, self.actual
                )
            }
            ValidationErrorKind::Schema(e) => {
                write!(f, "at {}: schema error: {e}", self.path)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<SchemaError> for ValidationError {
    fn from(e: SchemaError) -> Self {
        Self {
            path: "$".to_string(),
            expected: String::new(),
            actual_kind: String::new(),
            actual: String::new(),
            kind: ValidationErrorKind::Schema(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_rendering() {
        let mut p = Path::root();
        assert_eq!(p.to_string(), "$");
        p.push_field("user");
        p.push_field("posts");
        p.push_index(3);
        p.push_key("meta");
        assert_eq!(p.to_string(), "user.posts[3][\"meta\"]");
        p.pop();
        assert_eq!(p.to_string(), "user.posts[3]");
    }

    #[test]
    fn schema_error_display() {
        let cases = vec![
            (
                SchemaError::DuplicateDiscriminant("User".into()),
                "duplicate union discriminator 'User'",
            ),
            (
                SchemaError::CaseInsensitiveCollision {
                    variant: "YES".into(),
                    existing: "yes".into(),
                },
                "case-insensitive variant 'YES' collides with 'yes'",
            ),
            (
                SchemaError::UnknownFormat("uuid".into()),
                "unknown format 'uuid'",
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn schema_error_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(SchemaError::MissingTypename);
        assert!(err.to_string().contains("typename"));
    }

    #[test]
    fn validation_error_display() {
        let err = ValidationError {
            path: "user.age".into(),
            expected: "number".into(),
            actual_kind: "string".into(),
            actual: "\"forty\"".into(),
            kind: ValidationErrorKind::KindMismatch,
        };
        assert_eq!(
            err.to_string(),
            "at user.age: expected number, got string (\"forty\")"
        );
    }

    #[test]
    fn missing_discriminator_message() {
        let err = ValidationError {
            path: "shape".into(),
            expected: String::new(),
            actual_kind: "object".into(),
            actual: "{..}".into(),
            kind: ValidationErrorKind::MissingDiscriminator {
                field: "__typename".into(),
            },
        };
        assert!(err.to_string().contains("required for union discrimination"));
    }
}
