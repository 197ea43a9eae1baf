//! Schema builder functions, conventionally used through the `t` module:
//! `t::string()`, `t::entity(..)`, `t::union(..)`.

/// Builder namespace.
pub mod t {
    use std::rc::Rc;

    use crate::error::SchemaError;
    use crate::format::format_by_name;
    use crate::literal::LiteralSet;
    use crate::mask::TypeMask;
    use crate::node::{EntityNode, MethodTable, NodeKind, Schema};
    use crate::value::Value;

    /// `string`
    pub fn string() -> Schema {
        Schema::new(TypeMask::STRING, None, NodeKind::Mask)
    }

    /// `number`
    pub fn number() -> Schema {
        Schema::new(TypeMask::NUMBER, None, NodeKind::Mask)
    }

    /// `boolean`
    pub fn boolean() -> Schema {
        Schema::new(TypeMask::BOOLEAN, None, NodeKind::Mask)
    }

    /// `null`
    pub fn null() -> Schema {
        Schema::new(TypeMask::NULL, None, NodeKind::Mask)
    }

    /// `undefined`
    pub fn undefined() -> Schema {
        Schema::new(TypeMask::UNDEFINED, None, NodeKind::Mask)
    }

    /// An entity id slot: a string or number carrying the `ID` marker.
    pub fn id() -> Schema {
        Schema::new(
            TypeMask::STRING | TypeMask::NUMBER | TypeMask::ID,
            None,
            NodeKind::Mask,
        )
    }

    /// A typename discriminator literal.
    pub fn typename(literal: impl Into<String>) -> Schema {
        Schema::new(TypeMask::STRING, None, NodeKind::Literal(literal.into()))
    }

    /// A single-literal constant.
    pub fn constant(value: Value) -> Result<Schema, SchemaError> {
        let set = LiteralSet::exact(vec![value])?;
        Ok(Schema::new(set.mask(), Some(set), NodeKind::Mask))
    }

    /// An exact-match enum over scalar literals.
    pub fn enumeration(values: Vec<Value>) -> Result<Schema, SchemaError> {
        let set = LiteralSet::exact(values)?;
        Ok(Schema::new(set.mask(), Some(set), NodeKind::Mask))
    }

    /// An exact-match enum over string variants.
    pub fn string_enum<I, S>(variants: I) -> Result<Schema, SchemaError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        enumeration(
            variants
                .into_iter()
                .map(|s| Value::String(s.into()))
                .collect(),
        )
    }

    /// A case-insensitive enum: any casing is accepted and resolves to the
    /// canonical spelling. Colliding variants reject at construction.
    pub fn string_enum_ci<I, S>(variants: I) -> Result<Schema, SchemaError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set = LiteralSet::case_insensitive(variants.into_iter().map(Into::into).collect())?;
        Ok(Schema::new(set.mask(), Some(set), NodeKind::Mask))
    }

    /// A structural object with a fixed shape.
    pub fn object(fields: Vec<(String, Schema)>) -> Schema {
        Schema::new(TypeMask::OBJECT, None, NodeKind::Object(Rc::new(fields)))
    }

    /// A homogeneous array.
    pub fn array(child: Schema) -> Schema {
        Schema::new(TypeMask::ARRAY, None, NodeKind::Array(child))
    }

    /// An open string-keyed map with homogeneous values.
    pub fn record(child: Schema) -> Schema {
        Schema::new(
            TypeMask::OBJECT | TypeMask::RECORD,
            None,
            NodeKind::Record(child),
        )
    }

    /// An interned entity. The shape factory is zero-argument so entity
    /// graphs may be cyclic; it runs on first access to the shape.
    pub fn entity(shape: impl Fn() -> Vec<(String, Schema)> + 'static) -> Schema {
        Schema::new(
            TypeMask::OBJECT | TypeMask::ENTITY,
            None,
            NodeKind::Entity(Rc::new(EntityNode {
                shape_factory: Rc::new(shape),
                methods_factory: None,
            })),
        )
    }

    /// An entity with attached methods. The methods factory runs once per
    /// schema; bindings are cached per proxy.
    pub fn entity_with_methods(
        shape: impl Fn() -> Vec<(String, Schema)> + 'static,
        methods: impl Fn() -> MethodTable + 'static,
    ) -> Schema {
        Schema::new(
            TypeMask::OBJECT | TypeMask::ENTITY,
            None,
            NodeKind::Entity(Rc::new(EntityNode {
                shape_factory: Rc::new(shape),
                methods_factory: Some(Rc::new(methods)),
            })),
        )
    }

    /// Extends a parent entity with additional fields. Overlap with parent
    /// fields is rejected here; the extended shape itself stays lazy.
    pub fn extend(
        parent: &Schema,
        new_fields: Vec<(String, Schema)>,
    ) -> Result<Schema, SchemaError> {
        extend_inner(parent, new_fields, None)
    }

    /// [`extend`] with extra methods merged over the parent's.
    pub fn extend_with_methods(
        parent: &Schema,
        new_fields: Vec<(String, Schema)>,
        methods: impl Fn() -> MethodTable + 'static,
    ) -> Result<Schema, SchemaError> {
        extend_inner(parent, new_fields, Some(Rc::new(methods)))
    }

    fn extend_inner(
        parent: &Schema,
        new_fields: Vec<(String, Schema)>,
        extra_methods: Option<Rc<dyn Fn() -> MethodTable>>,
    ) -> Result<Schema, SchemaError> {
        let parent_node = match &parent.node.kind {
            NodeKind::Entity(node) => node.clone(),
            _ => return Err(SchemaError::NotShaped),
        };
        let header = parent.header()?;
        for (name, _) in &new_fields {
            if header.index.contains_key(name) {
                return Err(SchemaError::ExtendFieldCollision(name.clone()));
            }
        }

        let parent_factory = parent_node.shape_factory.clone();
        let new_fields = Rc::new(new_fields);
        let shape_factory: Rc<dyn Fn() -> Vec<(String, Schema)>> = Rc::new(move || {
            let mut fields = parent_factory();
            fields.extend(new_fields.iter().cloned());
            fields
        });

        let methods_factory = match (parent_node.methods_factory.clone(), extra_methods) {
            (None, None) => None,
            (Some(parent), None) => Some(parent),
            (None, Some(extra)) => Some(extra),
            (Some(parent), Some(extra)) => {
                let merged: Rc<dyn Fn() -> MethodTable> = Rc::new(move || {
                    let mut table = parent();
                    table.extend(extra());
                    table
                });
                Some(merged)
            }
        };

        Ok(Schema::new(
            TypeMask::OBJECT | TypeMask::ENTITY,
            None,
            NodeKind::Entity(Rc::new(EntityNode {
                shape_factory,
                methods_factory,
            })),
        ))
    }

    /// A union of schemas. Primitive-only unions collapse to a plain mask,
    /// literal-bearing unions keep their merged literal set, and container
    /// branches produce a discriminated union node. Nested unions flatten.
    pub fn union(branches: Vec<Schema>) -> Result<Schema, SchemaError> {
        let mut mask = TypeMask::empty();
        let mut sets: Vec<LiteralSet> = Vec::new();
        let mut complex: Vec<Schema> = Vec::new();

        let mut queue: Vec<Schema> = branches;
        let mut i = 0;
        while i < queue.len() {
            let branch = queue[i].clone();
            i += 1;
            match &branch.node.kind {
                NodeKind::Union(nested) => {
                    // Flatten, keeping the nested union's own literals.
                    if let Some(set) = branch.values() {
                        sets.push(set.clone());
                    }
                    mask |= branch.mask().kinds();
                    queue.extend(nested.iter().cloned());
                }
                NodeKind::Mask => {
                    mask |= branch.mask();
                    if let Some(set) = branch.values() {
                        sets.push(set.clone());
                    }
                }
                NodeKind::Literal(s) => {
                    mask |= branch.mask();
                    sets.push(LiteralSet::exact(vec![Value::String(s.clone())])?);
                }
                _ => {
                    mask |= branch.mask();
                    complex.push(branch);
                }
            }
        }

        let values = merge_sets(sets)?;

        if complex.is_empty() {
            return Ok(Schema::new(mask, values, NodeKind::Mask));
        }
        Ok(Schema::new(
            mask | TypeMask::UNION,
            values,
            NodeKind::Union(Rc::new(complex)),
        ))
    }

    fn merge_sets(mut sets: Vec<LiteralSet>) -> Result<Option<LiteralSet>, SchemaError> {
        match sets.len() {
            0 => Ok(None),
            1 => Ok(Some(sets.remove(0))),
            _ => {
                let mut values = Vec::new();
                for set in sets {
                    values.extend(set.values().to_vec());
                }
                Ok(Some(LiteralSet::exact(values)?))
            }
        }
    }

    /// A registered format by name. Fails if the format was never installed.
    pub fn format(name: &str) -> Result<Schema, SchemaError> {
        let format =
            format_by_name(name).ok_or_else(|| SchemaError::UnknownFormat(name.to_string()))?;
        Ok(Schema::new(
            format.input.mask().with_format(format.id),
            None,
            NodeKind::Mask,
        ))
    }

    /// `optional(T)`: also accepts `undefined`.
    pub fn optional(schema: &Schema) -> Schema {
        schema.optional()
    }

    /// `nullable(T)`: also accepts `null`.
    pub fn nullable(schema: &Schema) -> Schema {
        schema.nullable()
    }

    /// `nullish(T)`: also accepts `null` and `undefined`.
    pub fn nullish(schema: &Schema) -> Schema {
        schema.nullish()
    }

    /// `result(T)`: parse is captured into a success/error envelope.
    pub fn result(schema: &Schema) -> Schema {
        schema.result()
    }
}
