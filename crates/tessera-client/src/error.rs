use std::fmt;

use tessera_persist::StoreError;
use tessera_schema::{SchemaError, ValidationError};

/// Errors surfaced through query results.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ClientError {
    /// The query is paused by network state; retriable on reactivation.
    Paused,
    /// The fetch callable failed (after retries, when surfaced).
    Fetch(String),
    /// The response failed schema validation.
    Validation(ValidationError),
    /// The schema itself failed to build.
    Schema(SchemaError),
    /// Persistence failed.
    Store(StoreError),
    /// API misuse: refetching a stream, paginating without pagination, and
    /// friends. Programming bugs, raised synchronously.
    Misuse(&'static str),
    /// A newer fetch superseded this one; its result was dropped.
    Superseded,
    /// Pagination is exhausted or unavailable.
    NoNextPage,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paused => write!(f, "Query is paused due to network status"),
            Self::Fetch(message) => write!(f, "fetch failed: {message}"),
            Self::Validation(e) => write!(f, "{e}"),
            Self::Schema(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::Misuse(what) => write!(f, "{what}"),
            Self::Superseded => write!(f, "fetch superseded by a newer request"),
            Self::NoNextPage => write!(f, "no next page to fetch"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ValidationError> for ClientError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<SchemaError> for ClientError {
    fn from(e: SchemaError) -> Self {
        Self::Schema(e)
    }
}

impl From<StoreError> for ClientError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_error_message_is_stable() {
        assert_eq!(
            ClientError::Paused.to_string(),
            "Query is paused due to network status"
        );
    }
}
