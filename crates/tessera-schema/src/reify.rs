use std::collections::HashMap;
use std::rc::Rc;

use crate::error::SchemaError;
use crate::hash::{combine, hash32, hash_str};
use crate::mask::TypeMask;
use crate::node::{HeaderInfo, NodeKind, ReifyState, Schema, ShapeInfo, UnionInfo};

impl Schema {
    /// Reifies this node if it has not been reified yet. Safe to call
    /// re-entrantly: a node that is already mid-reification reports success
    /// and exposes its identity stub instead of a full shape key.
    pub fn ensure_reified(&self) -> Result<(), SchemaError> {
        match self.node.state.get() {
            ReifyState::Done | ReifyState::InProgress => Ok(()),
            ReifyState::Unreified => self.full_reify(),
        }
    }

    /// First-phase resolution: field list plus id/typename detection, with no
    /// recursion into children. Cached; runs entity shape factories at most
    /// once.
    pub(crate) fn header(&self) -> Result<Rc<HeaderInfo>, SchemaError> {
        if let Some(cached) = self.node.reify.borrow().header.clone() {
            return Ok(cached);
        }
        let (fields, is_entity) = match &self.node.kind {
            NodeKind::Object(fields) => (fields.as_ref().clone(), false),
            NodeKind::Entity(entity) => ((entity.shape_factory)(), true),
            _ => return Err(SchemaError::NotShaped),
        };

        let mut index = HashMap::with_capacity(fields.len());
        let mut id_field: Option<String> = None;
        let mut typename_field: Option<String> = None;
        let mut typename_value: Option<String> = None;
        for (i, (name, child)) in fields.iter().enumerate() {
            if index.insert(name.clone(), i).is_some() {
                return Err(SchemaError::DuplicateFieldName(name.clone()));
            }
            if child.mask().contains(TypeMask::ID) {
                if let Some(first) = &id_field {
                    return Err(SchemaError::DuplicateIdField {
                        first: first.clone(),
                        second: name.clone(),
                    });
                }
                id_field = Some(name.clone());
            }
            if let Some(literal) = child.literal() {
                if let Some(first) = &typename_field {
                    return Err(SchemaError::DuplicateTypenameField {
                        first: first.clone(),
                        second: name.clone(),
                    });
                }
                typename_field = Some(name.clone());
                typename_value = Some(literal.to_string());
            }
        }

        if is_entity {
            let typename = typename_value.clone().ok_or(SchemaError::MissingTypename)?;
            if id_field.is_none() {
                return Err(SchemaError::MissingIdField(typename));
            }
        }

        let header = Rc::new(HeaderInfo {
            fields,
            index,
            id_field,
            typename_field,
            typename_value,
        });
        self.node.reify.borrow_mut().header = Some(header.clone());
        Ok(header)
    }

    fn full_reify(&self) -> Result<(), SchemaError> {
        self.node.state.set(ReifyState::InProgress);
        match self.reify_inner() {
            Ok(()) => {
                self.node.state.set(ReifyState::Done);
                Ok(())
            }
            Err(e) => {
                self.node.state.set(ReifyState::Unreified);
                Err(e)
            }
        }
    }

    fn reify_inner(&self) -> Result<(), SchemaError> {
        match self.node.kind.clone() {
            NodeKind::Mask | NodeKind::Literal(_) => {
                let key = self.scalar_seed();
                self.node.reify.borrow_mut().shape_key = Some(key);
                Ok(())
            }
            NodeKind::Object(_) | NodeKind::Entity(_) => self.reify_shape(),
            NodeKind::Array(child) | NodeKind::Record(child) => {
                let child_key = child_key_for_hash(&child)?;
                if child
                    .mask()
                    .intersects(TypeMask::ENTITY | TypeMask::HAS_SUB_ENTITY)
                {
                    self.node
                        .mask
                        .set(self.node.mask.get() | TypeMask::HAS_SUB_ENTITY);
                }
                let key = combine(self.scalar_seed(), child_key);
                self.node.reify.borrow_mut().shape_key = Some(key);
                Ok(())
            }
            NodeKind::Union(branches) => self.reify_union(&branches),
        }
    }

    fn reify_shape(&self) -> Result<(), SchemaError> {
        let header = self.header()?;

        let mut acc: u32 = 0;
        let mut sub_entity_paths = Vec::new();
        for (name, child) in header.fields.clone() {
            let contribution = hash_str(&name) ^ child_key_for_hash(&child)?;
            acc ^= contribution;
            if child
                .mask()
                .intersects(TypeMask::ENTITY | TypeMask::HAS_SUB_ENTITY)
            {
                sub_entity_paths.push(name);
            }
        }
        if !sub_entity_paths.is_empty() {
            self.node
                .mask
                .set(self.node.mask.get() | TypeMask::HAS_SUB_ENTITY);
        }

        // Field contributions are XOR-mixed, so declaration order is
        // irrelevant; the node's own mask seals the key afterwards.
        let key = combine(self.scalar_seed(), acc);
        let shape = Rc::new(ShapeInfo {
            fields: header.fields.clone(),
            index: header.index.clone(),
            id_field: header.id_field.clone(),
            typename_field: header.typename_field.clone(),
            typename_value: header.typename_value.clone(),
            sub_entity_paths,
        });
        let mut data = self.node.reify.borrow_mut();
        data.shape = Some(shape);
        data.shape_key = Some(key);
        Ok(())
    }

    fn reify_union(&self, branches: &[Schema]) -> Result<(), SchemaError> {
        let mut discriminants: HashMap<String, Schema> = HashMap::new();
        let mut typename_field: Option<String> = None;
        let mut array_branch: Option<Schema> = None;
        let mut record_branch: Option<Schema> = None;
        let mut acc: u32 = 0;
        let mut has_sub = false;

        for branch in branches {
            if branch.has_shape() {
                let header = branch.header()?;
                let field = header
                    .typename_field
                    .clone()
                    .ok_or(SchemaError::MissingTypename)?;
                let value = header
                    .typename_value
                    .clone()
                    .ok_or(SchemaError::MissingTypename)?;
                match &typename_field {
                    None => typename_field = Some(field),
                    Some(existing) if *existing != field => {
                        return Err(SchemaError::ConflictingTypenameField {
                            first: existing.clone(),
                            second: field,
                        });
                    }
                    _ => {}
                }
                if discriminants.insert(value.clone(), branch.clone()).is_some() {
                    return Err(SchemaError::DuplicateDiscriminant(value));
                }
            } else if matches!(branch.node.kind, NodeKind::Array(_)) {
                if array_branch.is_some() {
                    return Err(SchemaError::DuplicateUnionBranch("array"));
                }
                array_branch = Some(branch.clone());
            } else if matches!(branch.node.kind, NodeKind::Record(_)) {
                if record_branch.is_some() {
                    return Err(SchemaError::DuplicateUnionBranch("record"));
                }
                record_branch = Some(branch.clone());
            }

            acc = acc.wrapping_add(child_key_for_hash(branch)?);
            if branch
                .mask()
                .intersects(TypeMask::ENTITY | TypeMask::HAS_SUB_ENTITY)
            {
                has_sub = true;
            }
        }

        if has_sub {
            self.node
                .mask
                .set(self.node.mask.get() | TypeMask::HAS_SUB_ENTITY);
        }
        let key = combine(self.scalar_seed(), acc);
        let mut data = self.node.reify.borrow_mut();
        data.union = Some(Rc::new(UnionInfo {
            discriminants,
            typename_field,
            array_branch,
            record_branch,
        }));
        data.shape_key = Some(key);
        Ok(())
    }

    /// Hash of this node's own mask, literal, and literal set.
    fn scalar_seed(&self) -> u32 {
        let mut seed = hash32(&self.node.mask.get().bits().to_le_bytes());
        if let Some(values) = &self.node.values {
            seed = combine(seed, values.hash_contribution());
        }
        if let NodeKind::Literal(s) = &self.node.kind {
            seed = combine(seed, hash_str(s));
        }
        seed
    }

    pub(crate) fn hashed_key(&self) -> u32 {
        match self.node.reify.borrow().shape_key {
            Some(key) => key,
            None => self.cycle_stub(),
        }
    }
}

/// The hash a parent mixes in for a child schema.
///
/// Entities always contribute their identity stub (typename + construction
/// mask) rather than their full structure: this keys `A → B → A` graphs
/// identically no matter which node reifies first, and keeps a parent's key
/// independent of an entity's internals (the entity's own key covers those).
pub(crate) fn child_key_for_hash(child: &Schema) -> Result<u32, SchemaError> {
    if child.is_entity() {
        // Forces identity resolution, surfacing construction errors early.
        child.header()?;
        Ok(child.cycle_stub())
    } else {
        child.ensure_reified()?;
        Ok(child.hashed_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::t;
    use crate::value::Value;

    fn user_entity() -> Schema {
        t::entity(|| {
            vec![
                ("__typename".into(), t::typename("User")),
                ("id".into(), t::id()),
                ("name".into(), t::string()),
            ]
        })
    }

    #[test]
    fn identical_factories_share_shape_keys() {
        let a = user_entity();
        let b = user_entity();
        assert_eq!(a.shape_key().unwrap(), b.shape_key().unwrap());
    }

    #[test]
    fn field_order_is_irrelevant() {
        let a = t::object(vec![
            ("id".to_string(), t::id()),
            ("name".to_string(), t::string()),
        ]);
        let b = t::object(vec![
            ("name".to_string(), t::string()),
            ("id".to_string(), t::id()),
        ]);
        assert_eq!(a.shape_key().unwrap(), b.shape_key().unwrap());
    }

    #[test]
    fn adding_a_field_changes_the_key() {
        let base = user_entity();
        let wider = t::entity(|| {
            vec![
                ("__typename".into(), t::typename("User")),
                ("id".into(), t::id()),
                ("name".into(), t::string()),
                ("email".into(), t::string()),
            ]
        });
        assert_ne!(base.shape_key().unwrap(), wider.shape_key().unwrap());
    }

    #[test]
    fn modifiers_change_the_key() {
        let plain = t::string();
        assert_ne!(
            plain.shape_key().unwrap(),
            plain.optional().shape_key().unwrap()
        );
        assert_ne!(
            plain.optional().shape_key().unwrap(),
            plain.nullish().shape_key().unwrap()
        );
    }

    #[test]
    fn cyclic_entities_key_identically_from_either_side() {
        fn build() -> (Schema, Schema) {
            // a ↔ b through shape factories.
            fn author() -> Schema {
                t::entity(|| {
                    vec![
                        ("__typename".into(), t::typename("Author")),
                        ("id".into(), t::id()),
                        ("posts".into(), t::array(post())),
                    ]
                })
            }
            fn post() -> Schema {
                t::entity(|| {
                    vec![
                        ("__typename".into(), t::typename("Post")),
                        ("id".into(), t::id()),
                        ("author".into(), author()),
                    ]
                })
            }
            (author(), post())
        }

        let (author1, post1) = build();
        let (author2, post2) = build();
        // Reify in opposite orders.
        let a1 = author1.shape_key().unwrap();
        let p1 = post1.shape_key().unwrap();
        let p2 = post2.shape_key().unwrap();
        let a2 = author2.shape_key().unwrap();
        assert_eq!(a1, a2);
        assert_eq!(p1, p2);
    }

    #[test]
    fn sub_entity_paths_are_collected() {
        let schema = t::object(vec![
            ("user".to_string(), user_entity()),
            ("count".to_string(), t::number()),
            (
                "nested".to_string(),
                t::object(vec![("inner".to_string(), user_entity())]),
            ),
        ]);
        schema.ensure_reified().unwrap();
        let shape = schema.shape_info().unwrap();
        let mut paths = shape.sub_entity_paths.clone();
        paths.sort();
        assert_eq!(paths, vec!["nested".to_string(), "user".to_string()]);
        assert!(schema.mask().contains(TypeMask::HAS_SUB_ENTITY));
    }

    #[test]
    fn entity_without_id_is_rejected() {
        let broken = t::entity(|| {
            vec![
                ("__typename".into(), t::typename("User")),
                ("name".into(), t::string()),
            ]
        });
        assert!(matches!(
            broken.ensure_reified(),
            Err(SchemaError::MissingIdField(_))
        ));
    }

    #[test]
    fn duplicate_id_fields_are_rejected() {
        let broken = t::object(vec![
            ("a".to_string(), t::id()),
            ("b".to_string(), t::id()),
        ]);
        assert!(matches!(
            broken.ensure_reified(),
            Err(SchemaError::DuplicateIdField { .. })
        ));
    }

    #[test]
    fn union_discriminants_resolve() {
        let cat = t::entity(|| {
            vec![
                ("__typename".into(), t::typename("Cat")),
                ("id".into(), t::id()),
            ]
        });
        let dog = t::entity(|| {
            vec![
                ("__typename".into(), t::typename("Dog")),
                ("id".into(), t::id()),
            ]
        });
        let pets = t::union(vec![cat, dog]).unwrap();
        let info = pets.union_info().unwrap();
        assert_eq!(info.typename_field.as_deref(), Some("__typename"));
        assert!(info.discriminants.contains_key("Cat"));
        assert!(info.discriminants.contains_key("Dog"));
    }

    #[test]
    fn duplicate_discriminants_are_rejected() {
        let a = t::entity(|| {
            vec![
                ("__typename".into(), t::typename("Cat")),
                ("id".into(), t::id()),
            ]
        });
        let b = t::entity(|| {
            vec![
                ("__typename".into(), t::typename("Cat")),
                ("id".into(), t::id()),
                ("extra".into(), t::string()),
            ]
        });
        let broken = t::union(vec![a, b]).unwrap();
        assert!(matches!(
            broken.ensure_reified(),
            Err(SchemaError::DuplicateDiscriminant(_))
        ));
    }

    #[test]
    fn primitive_union_collapses_to_mask() {
        let s = t::union(vec![t::string(), t::number()]).unwrap();
        assert!(!s.is_union());
        assert_eq!(s.mask().kinds(), TypeMask::STRING | TypeMask::NUMBER);
    }

    proptest::proptest! {
        #[test]
        fn object_keys_hash_order_independently(
            names in proptest::collection::hash_set("[a-z]{1,8}", 1..8)
        ) {
            let names: Vec<String> = names.into_iter().collect();
            let forward: Vec<(String, Schema)> =
                names.iter().map(|n| (n.clone(), t::string())).collect();
            let mut reversed = forward.clone();
            reversed.reverse();
            let a = t::object(forward);
            let b = t::object(reversed);
            proptest::prop_assert_eq!(a.shape_key().unwrap(), b.shape_key().unwrap());
        }
    }

    #[test]
    fn literal_and_primitive_union_keeps_values() {
        let s = t::union(vec![
            t::constant(Value::String("none".into())).unwrap(),
            t::number(),
        ])
        .unwrap();
        assert!(!s.is_union());
        assert!(s.values().is_some());
        assert!(s.mask().kinds().contains(TypeMask::NUMBER));
    }
}
