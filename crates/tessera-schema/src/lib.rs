//! # tessera-schema
//!
//! Declarative schemas for wire payloads, and the validator that walks
//! values under them.
//!
//! This crate provides:
//! - A type-mask bitset and tagged schema nodes for objects, records,
//!   arrays, unions, enums, and interned entities
//! - Builder functions under [`build::t`] (`t::string()`, `t::entity(..)`)
//! - A process-wide format registry with `date` and `date-time` built-ins
//! - Order-independent, restart-stable 32-bit shape keys
//! - A parser that coerces formats, filters invalid collection elements,
//!   and captures `result()`-wrapped parses into success/error envelopes
//!
//! Entity values surface as [`EntityHandle`] trait objects; the store crate
//! supplies the interning proxy behind them.

pub mod build;
pub mod error;
pub mod format;
pub mod hash;
pub mod literal;
pub mod mask;
pub mod node;
pub mod parse;
pub mod value;

mod reify;

pub use build::t;
pub use error::{Path, PathSegment, SchemaError, ValidationError, ValidationErrorKind};
pub use format::{format_by_id, format_by_name, register_format, Format, FormatInput};
pub use literal::LiteralSet;
pub use mask::TypeMask;
pub use node::{EntityMethod, MethodTable, Schema, ShapeInfo, UnionInfo};
pub use parse::{parse, parse_at};
pub use value::{EntityHandle, EntityKey, Outcome, Value, ENTITY_REF_KEY};
