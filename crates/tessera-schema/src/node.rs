use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use crate::error::SchemaError;
use crate::hash::{combine, hash_str};
use crate::literal::LiteralSet;
use crate::mask::TypeMask;
use crate::value::{EntityHandle, Value};

/// A bound entity method: receives the proxy it was accessed through.
pub type EntityMethod = Rc<dyn Fn(&dyn EntityHandle, &[Value]) -> Value>;

/// Named methods attached to an entity schema. The factory runs once per
/// schema; bindings are cached per proxy by the store.
pub type MethodTable = BTreeMap<String, EntityMethod>;

pub(crate) type ShapeFactory = Rc<dyn Fn() -> Vec<(String, Schema)>>;
pub(crate) type MethodsFactory = Rc<dyn Fn() -> MethodTable>;

// ---------------------------------------------------------------------------
// Node structure
// ---------------------------------------------------------------------------

pub(crate) struct EntityNode {
    pub shape_factory: ShapeFactory,
    pub methods_factory: Option<MethodsFactory>,
}

#[derive(Clone)]
pub(crate) enum NodeKind {
    /// Primitives, primitive unions, formatted scalars.
    Mask,
    /// A typename discriminator literal.
    Literal(String),
    Object(Rc<Vec<(String, Schema)>>),
    Entity(Rc<EntityNode>),
    Array(Schema),
    Record(Schema),
    Union(Rc<Vec<Schema>>),
}

/// First-phase shape resolution: the field list and identity fields, with no
/// recursion into children. Cheap enough to compute mid-cycle.
pub(crate) struct HeaderInfo {
    pub fields: Vec<(String, Schema)>,
    pub index: HashMap<String, usize>,
    pub id_field: Option<String>,
    pub typename_field: Option<String>,
    pub typename_value: Option<String>,
}

/// Resolved shape of an object or entity node.
pub struct ShapeInfo {
    pub fields: Vec<(String, Schema)>,
    pub index: HashMap<String, usize>,
    pub id_field: Option<String>,
    pub typename_field: Option<String>,
    pub typename_value: Option<String>,
    /// Field names that transitively contain entities; normalization walks
    /// only these.
    pub sub_entity_paths: Vec<String>,
}

impl ShapeInfo {
    pub fn field_schema(&self, name: &str) -> Option<&Schema> {
        self.index.get(name).map(|i| &self.fields[*i].1)
    }
}

/// Resolved dispatch table of a union node.
pub struct UnionInfo {
    pub discriminants: HashMap<String, Schema>,
    pub typename_field: Option<String>,
    pub array_branch: Option<Schema>,
    pub record_branch: Option<Schema>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReifyState {
    Unreified,
    InProgress,
    Done,
}

#[derive(Default)]
pub(crate) struct ReifyData {
    pub header: Option<Rc<HeaderInfo>>,
    pub shape: Option<Rc<ShapeInfo>>,
    pub union: Option<Rc<UnionInfo>>,
    pub shape_key: Option<u32>,
    pub methods: Option<Rc<MethodTable>>,
    // Cached modifier variants, one per parent node.
    pub optional: Option<Schema>,
    pub nullable: Option<Schema>,
    pub nullish: Option<Schema>,
    pub result: Option<Schema>,
}

pub(crate) struct SchemaNode {
    pub mask: Cell<TypeMask>,
    pub values: Option<LiteralSet>,
    pub kind: NodeKind,
    pub state: Cell<ReifyState>,
    pub reify: RefCell<ReifyData>,
}

/// A schema handle. Cheap to clone; all nodes are shared.
#[derive(Clone)]
pub struct Schema {
    pub(crate) node: Rc<SchemaNode>,
}

impl Schema {
    pub(crate) fn new(mask: TypeMask, values: Option<LiteralSet>, kind: NodeKind) -> Self {
        Self {
            node: Rc::new(SchemaNode {
                mask: Cell::new(mask),
                values,
                kind,
                state: Cell::new(ReifyState::Unreified),
                reify: RefCell::new(ReifyData::default()),
            }),
        }
    }

    /// The node's accepted-kind mask. Reified nodes may carry promoted bits
    /// (`HAS_SUB_ENTITY`).
    pub fn mask(&self) -> TypeMask {
        self.node.mask.get()
    }

    /// The literal set for enum/const and primitive-union nodes.
    pub fn values(&self) -> Option<&LiteralSet> {
        self.node.values.as_ref()
    }

    /// The typename literal, for discriminator nodes.
    pub fn literal(&self) -> Option<&str> {
        match &self.node.kind {
            NodeKind::Literal(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_entity(&self) -> bool {
        self.mask().contains(TypeMask::ENTITY)
    }

    pub fn is_union(&self) -> bool {
        matches!(self.node.kind, NodeKind::Union(_))
    }

    /// The element schema of array and record nodes.
    pub fn child(&self) -> Option<&Schema> {
        match &self.node.kind {
            NodeKind::Array(child) | NodeKind::Record(child) => Some(child),
            _ => None,
        }
    }

    /// True for object-shaped nodes (plain objects and entities).
    pub fn has_shape(&self) -> bool {
        matches!(self.node.kind, NodeKind::Object(_) | NodeKind::Entity(_))
    }

    /// Resolved object/entity shape. Reifies on first access.
    pub fn shape_info(&self) -> Result<Rc<ShapeInfo>, SchemaError> {
        self.ensure_reified()?;
        self.node
            .reify
            .borrow()
            .shape
            .clone()
            .ok_or(SchemaError::NotShaped)
    }

    /// Resolved union dispatch table. Reifies on first access.
    pub fn union_info(&self) -> Result<Rc<UnionInfo>, SchemaError> {
        self.ensure_reified()?;
        self.node
            .reify
            .borrow()
            .union
            .clone()
            .ok_or(SchemaError::NotUnion)
    }

    /// Stable 32-bit structural hash. Equal for equivalent schemas across
    /// process restarts; independent of field declaration order.
    pub fn shape_key(&self) -> Result<u32, SchemaError> {
        self.ensure_reified()?;
        let key = self.node.reify.borrow().shape_key;
        match key {
            Some(key) => Ok(key),
            // Reachable only from a re-entrant call mid-reification.
            None => Ok(self.cycle_stub()),
        }
    }

    /// Entity methods, built once per schema node.
    pub fn methods(&self) -> Result<Option<Rc<MethodTable>>, SchemaError> {
        if let Some(cached) = self.node.reify.borrow().methods.clone() {
            return Ok(Some(cached));
        }
        let factory = match &self.node.kind {
            NodeKind::Entity(entity) => entity.methods_factory.clone(),
            _ => None,
        };
        match factory {
            Some(factory) => {
                let table = Rc::new(factory());
                self.node.reify.borrow_mut().methods = Some(table.clone());
                Ok(Some(table))
            }
            None => Ok(None),
        }
    }

    /// The typename literal this entity or object discriminates on, if any.
    pub fn typename_value(&self) -> Option<String> {
        self.header().ok()?.typename_value.clone()
    }

    // -- modifier variants --------------------------------------------------

    /// A variant of this schema that also accepts `undefined`.
    pub fn optional(&self) -> Schema {
        self.cached_variant(TypeMask::UNDEFINED, VariantSlot::Optional)
    }

    /// A variant of this schema that also accepts `null`.
    pub fn nullable(&self) -> Schema {
        self.cached_variant(TypeMask::NULL, VariantSlot::Nullable)
    }

    /// A variant of this schema that also accepts `null` and `undefined`.
    pub fn nullish(&self) -> Schema {
        self.cached_variant(
            TypeMask::NULL | TypeMask::UNDEFINED,
            VariantSlot::Nullish,
        )
    }

    /// A variant whose parse is wrapped in a success/error envelope.
    pub fn result(&self) -> Schema {
        self.cached_variant(TypeMask::PARSE_RESULT, VariantSlot::Result)
    }

    fn cached_variant(&self, add: TypeMask, slot: VariantSlot) -> Schema {
        {
            let data = self.node.reify.borrow();
            let cached = match slot {
                VariantSlot::Optional => &data.optional,
                VariantSlot::Nullable => &data.nullable,
                VariantSlot::Nullish => &data.nullish,
                VariantSlot::Result => &data.result,
            };
            if let Some(existing) = cached {
                return existing.clone();
            }
        }
        let variant = Schema::new(
            self.node.mask.get() | add,
            self.node.values.clone(),
            self.node.kind.clone(),
        );
        let mut data = self.node.reify.borrow_mut();
        let cached = match slot {
            VariantSlot::Optional => &mut data.optional,
            VariantSlot::Nullable => &mut data.nullable,
            VariantSlot::Nullish => &mut data.nullish,
            VariantSlot::Result => &mut data.result,
        };
        *cached = Some(variant.clone());
        variant
    }

    // -- internals ----------------------------------------------------------

    /// Deterministic stand-in mixed into parent hashes wherever an entity
    /// participates: entities contribute their identity (typename + the
    /// construction mask), never their full structure, so `A → B → A`
    /// graphs key identically regardless of which node reifies first.
    /// `HAS_SUB_ENTITY` is stripped: it is promoted during reification and
    /// would otherwise vary with reify order.
    pub(crate) fn cycle_stub(&self) -> u32 {
        let typename = self.typename_stub();
        let stable_mask = self.node.mask.get() & !TypeMask::HAS_SUB_ENTITY;
        combine(hash_str(&typename), stable_mask.bits())
    }

    fn typename_stub(&self) -> String {
        match &self.node.kind {
            NodeKind::Entity(_) => self
                .header()
                .ok()
                .and_then(|h| h.typename_value.clone())
                .unwrap_or_default(),
            NodeKind::Literal(s) => s.clone(),
            _ => String::new(),
        }
    }
}

enum VariantSlot {
    Optional,
    Nullable,
    Nullish,
    Result,
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node.kind {
            NodeKind::Mask => {
                if let Some(values) = &self.node.values {
                    write!(f, "{values}")
                } else {
                    write!(f, "{}", self.mask().describe())
                }
            }
            NodeKind::Literal(s) => write!(f, "\"{s}\""),
            NodeKind::Object(fields) => {
                write!(f, "{{ ")?;
                for (i, (name, child)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    // Entities render by name to keep cyclic shapes printable.
                    if child.is_entity() {
                        write!(
                            f,
                            "{name}: {}",
                            child.typename_value().unwrap_or_else(|| "entity".into())
                        )?;
                    } else {
                        write!(f, "{name}: {child}")?;
                    }
                }
                write!(f, " }}")
            }
            NodeKind::Entity(_) => {
                write!(
                    f,
                    "{}",
                    self.typename_value().unwrap_or_else(|| "entity".into())
                )
            }
            NodeKind::Array(child) => {
                if child.is_entity() {
                    write!(
                        f,
                        "Array<{}>",
                        child.typename_value().unwrap_or_else(|| "entity".into())
                    )
                } else {
                    write!(f, "Array<{child}>")
                }
            }
            NodeKind::Record(child) => write!(f, "Record<{child}>"),
            NodeKind::Union(branches) => {
                for (i, branch) in branches.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    if branch.is_entity() {
                        write!(
                            f,
                            "{}",
                            branch.typename_value().unwrap_or_else(|| "entity".into())
                        )?;
                    } else {
                        write!(f, "{branch}")?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Schema({self})")
    }
}

impl fmt::Debug for EntityNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityNode")
    }
}
